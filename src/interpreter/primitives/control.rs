//! Blocks, closures, perform and the context-walking primitives behind exceptions.

use super::*;
use crate::interpreter::decode::decode_insn;
use crate::interpreter::Lookup;
use crate::objectmemory::format::FMT_FIXED_INDEXABLE;
use crate::objectmemory::NIL_PTR;

impl Interpreter {
    pub(super) fn dispatch_prim_control(&mut self, index: usize) -> Option<()> {
        match index {
            80 => self.prim_block_copy(),
            81 => self.prim_block_value(),
            82 => self.prim_block_value_with_args(),
            83 => self.prim_perform(),
            84 => self.prim_perform_with_args(false),
            100 => self.prim_perform_with_args(true),
            118 => self.prim_do_primitive(),
            188 => self.prim_execute_method_args_array(),
            189 => self.prim_execute_method(),
            195 => self.prim_find_next_unwind_context(),
            196 => self.prim_terminate_to(),
            197 => self.prim_find_handler_context(),
            // markers for unwind protection and exception handlers
            198 | 199 => None,
            200 => self.prim_closure_copy(),
            201..=205 | 207 | 209 | 221 | 222 => self.prim_closure_value(),
            206 | 208 => self.prim_closure_value_with_args(),
            248 => self.prim_run_with_in(),
            _ => self.fail(PRIM_ERR_UNSUPPORTED),
        }
    }

    // Legacy BlockContexts

    /// blockCopy: for images without closures. The block body starts after the jump that
    /// follows this send.
    pub(super) fn prim_block_copy(&mut self) -> Option<()> {
        let receiver = self.stack_value(1);
        let argc = self.stack_value(0).try_as_integer()?;
        let home = if self.is_block_context(receiver) {
            self.memory.get_ptr(receiver, BLOCK_HOME_INDEX)
        } else {
            receiver
        };
        let size = self.memory.slot_count(home);
        let initial_ip = OOP::Int((self.ip + self.pc_bias + 2) as i32);
        let mut slots = vec![NIL_PTR; size];
        slots[CONTEXT_PC_INDEX] = initial_ip;
        slots[CONTEXT_STACKP_INDEX] = OOP::Int(0);
        slots[BLOCK_ARGUMENT_COUNT_INDEX] = OOP::Int(argc as i32);
        slots[BLOCK_INITIAL_IP_INDEX] = initial_ip;
        slots[BLOCK_HOME_INDEX] = home;
        self.reclaimable_contexts = 0;
        let class = self.memory.special(CLASS_BLOCK_CONTEXT);
        let block = self.memory.new_pointers(class, FMT_FIXED_INDEXABLE, slots);
        self.pop_then_push(2, block);
        Some(())
    }

    pub(super) fn prim_block_value(&mut self) -> Option<()> {
        let argc = self.argument_count;
        let block = self.stack_value(argc);
        let args: Vec<OOP> = (0..argc).map(|i| self.stack_value(argc - 1 - i)).collect();
        self.start_block_context(block, &args, argc + 1)
    }

    fn prim_block_value_with_args(&mut self) -> Option<()> {
        let block = self.stack_value(1);
        let array = self.stack_value(0);
        self.check_class(array, CLASS_ARRAY)?;
        let args = self.memory.pointers(array).to_vec();
        self.start_block_context(block, &args, 2)
    }

    fn start_block_context(&mut self, block: OOP, args: &[OOP], pop: usize) -> Option<()> {
        self.check_class(block, CLASS_BLOCK_CONTEXT)?;
        let expected = self
            .memory
            .get_ptr(block, BLOCK_ARGUMENT_COUNT_INDEX)
            .try_as_integer()?;
        if expected as usize != args.len() {
            return self.fail(PRIM_ERR_BAD_NUM_ARGS);
        }
        if !self.memory.get_ptr(block, BLOCK_CALLER_INDEX).is_nil() {
            return self.fail(PRIM_ERR_INAPPROPRIATE);
        }
        if CONTEXT_TEMP_FRAME_START + args.len() > self.memory.slot_count(block) {
            return self.fail(PRIM_ERR_BAD_ARGUMENT);
        }
        for (i, &arg) in args.iter().enumerate() {
            self.memory
                .put_ptr(block, CONTEXT_TEMP_FRAME_START + i, arg);
        }
        let initial_ip = self.memory.get_ptr(block, BLOCK_INITIAL_IP_INDEX);
        self.memory.put_ptr(block, CONTEXT_PC_INDEX, initial_ip);
        self.memory
            .put_ptr(block, CONTEXT_STACKP_INDEX, OOP::Int(args.len() as i32));
        self.memory
            .put_ptr(block, BLOCK_CALLER_INDEX, self.active_context);
        self.popn(pop);
        self.new_active_context(block);
        Some(())
    }

    // Closures

    /// closureCopy: numArgs copiedValues: anArray. The block body follows the jump after this
    /// send.
    fn prim_closure_copy(&mut self) -> Option<()> {
        let context = self.stack_value(2);
        let num_args = self.stack_value(1).try_as_integer()?;
        let copied = self.stack_value(0);
        let (_, jump_size) = decode_insn(self.memory.bytes(self.method), self.ip, self.sista);
        let start_pc = self.ip + jump_size + self.pc_bias;
        let mut slots = vec![context, OOP::Int(start_pc as i32), OOP::Int(num_args as i32)];
        slots.extend_from_slice(self.memory.pointers(copied));
        self.reclaimable_contexts = 0;
        let class = self.memory.special(CLASS_BLOCK_CLOSURE);
        let closure = self.memory.new_pointers(class, FMT_FIXED_INDEXABLE, slots);
        self.pop_then_push(3, closure);
        Some(())
    }

    fn prim_closure_value(&mut self) -> Option<()> {
        let argc = self.argument_count;
        let closure = self.stack_value(argc);
        let args: Vec<OOP> = (0..argc).map(|i| self.stack_value(argc - 1 - i)).collect();
        self.activate_closure(closure, &args, argc + 1)
    }

    fn prim_closure_value_with_args(&mut self) -> Option<()> {
        let closure = self.stack_value(1);
        let array = self.stack_value(0);
        if self.check_class(array, CLASS_ARRAY).is_none() {
            return self.fail(PRIM_ERR_BAD_ARGUMENT);
        }
        let args = self.memory.pointers(array).to_vec();
        self.activate_closure(closure, &args, 2)
    }

    pub(crate) fn is_full_closure(&self, closure: OOP) -> bool {
        self.memory
            .is_method(self.memory.get_ptr(closure, CLOSURE_COMPILED_BLOCK_INDEX))
    }

    /// Run a BlockClosure or FullBlockClosure in a fresh context, popping `pop` stack slots.
    pub(crate) fn activate_closure(&mut self, closure: OOP, args: &[OOP], pop: usize) -> Option<()> {
        if !self.memory.is_pointers(closure) || self.memory.slot_count(closure) < CLOSURE_FIRST_COPIED_INDEX {
            return self.fail(PRIM_ERR_BAD_RECEIVER);
        }
        let num_args = self
            .memory
            .get_ptr(closure, CLOSURE_NUM_ARGS_INDEX)
            .try_as_integer()?;
        if num_args as usize != args.len() {
            return self.fail(PRIM_ERR_BAD_NUM_ARGS);
        }
        let full = self.is_full_closure(closure);
        let first_copied = if full {
            FULL_CLOSURE_FIRST_COPIED_INDEX
        } else {
            CLOSURE_FIRST_COPIED_INDEX
        };
        let copied = self.memory.pointers(closure)[first_copied.min(self.memory.slot_count(closure))..].to_vec();
        let outer = self.memory.get_ptr(closure, CLOSURE_OUTER_CONTEXT_INDEX);

        let (method, receiver, pc, stackp) = if full {
            let block = self.memory.get_ptr(closure, CLOSURE_COMPILED_BLOCK_INDEX);
            let header = self.memory.method_header(block)?;
            let receiver = self.memory.get_ptr(closure, FULL_CLOSURE_RECEIVER_INDEX);
            (block, receiver, header.initial_pc_offset() + 1, header.num_temps)
        } else {
            let method = self.memory.get_ptr(outer, CONTEXT_METHOD_INDEX);
            let receiver = self.memory.get_ptr(outer, CONTEXT_RECEIVER_INDEX);
            let start = self
                .memory
                .get_ptr(closure, CLOSURE_START_PC_INDEX)
                .try_as_integer()?;
            (method, receiver, start as usize, args.len() + copied.len())
        };
        let header = self.memory.method_header(method)?;
        let context = self.allocate_context(header.large_frame);
        let frame = self.memory.slot_count(context) - CONTEXT_TEMP_FRAME_START;
        if stackp.max(args.len() + copied.len()) > frame {
            return self.fail(PRIM_ERR_GENERIC);
        }
        self.memory
            .put_ptr(context, CONTEXT_SENDER_INDEX, self.active_context);
        self.memory
            .put_ptr(context, CONTEXT_PC_INDEX, OOP::Int(pc as i32));
        self.memory
            .put_ptr(context, CONTEXT_STACKP_INDEX, OOP::Int(stackp as i32));
        self.memory.put_ptr(context, CONTEXT_METHOD_INDEX, method);
        self.memory.put_ptr(context, CONTEXT_CLOSURE_INDEX, closure);
        self.memory
            .put_ptr(context, CONTEXT_RECEIVER_INDEX, receiver);
        let temps = args.iter().chain(copied.iter()).copied();
        let mut slot = CONTEXT_TEMP_FRAME_START;
        for value in temps {
            self.memory.put_ptr(context, slot, value);
            slot += 1;
        }
        while slot < CONTEXT_TEMP_FRAME_START + stackp {
            self.memory.put_ptr(context, slot, NIL_PTR);
            slot += 1;
        }
        self.popn(pop);
        self.reclaimable_contexts += 1;
        self.compiler.note_activation(&self.memory, method);
        self.new_active_context(context);
        Some(())
    }

    // Perform

    /// Argument count a found method expects, if the lookup finds a method.
    fn expected_args(&mut self, class: OOP, selector: OOP) -> Option<usize> {
        match self.lookup_selector(class, selector) {
            Lookup::Found(method) => self.memory.method_header(method).map(|h| h.num_args),
            _ => None,
        }
    }

    /// perform: aSymbol with: ... The selector is slid out of the stack before the send.
    fn prim_perform(&mut self) -> Option<()> {
        let argc = self.argument_count;
        if argc == 0 {
            return self.fail(PRIM_ERR_BAD_NUM_ARGS);
        }
        let selector = self.stack_value(argc - 1);
        let receiver = self.stack_value(argc);
        let class = self.memory.get_class_of(receiver);
        if let Some(expected) = self.expected_args(class, selector) {
            if expected != argc - 1 {
                return self.fail(PRIM_ERR_BAD_NUM_ARGS);
            }
        }
        let args: Vec<OOP> = (0..argc - 1).map(|i| self.stack_value(argc - 2 - i)).collect();
        self.popn(argc);
        for arg in args {
            self.push(arg);
        }
        self.send_to_class(selector, argc - 1, class);
        Some(())
    }

    /// perform:withArguments: and, with `in_superclass`, perform:withArguments:inSuperclass:.
    fn prim_perform_with_args(&mut self, in_superclass: bool) -> Option<()> {
        let extra = in_superclass as usize;
        let receiver = self.stack_value(2 + extra);
        let selector = self.stack_value(1 + extra);
        let array = self.stack_value(extra);
        if self.check_class(array, CLASS_ARRAY).is_none() {
            return self.fail(PRIM_ERR_BAD_ARGUMENT);
        }
        let class = if in_superclass {
            let class = self.stack_top();
            if !self.inherits_from(self.memory.get_class_of(receiver), class) {
                return self.fail(PRIM_ERR_BAD_ARGUMENT);
            }
            class
        } else {
            self.memory.get_class_of(receiver)
        };
        let args = self.memory.pointers(array).to_vec();
        if let Some(expected) = self.expected_args(class, selector) {
            if expected != args.len() {
                return self.fail(PRIM_ERR_BAD_NUM_ARGS);
            }
        }
        self.popn(2 + extra);
        let argc = args.len();
        for arg in args {
            self.push(arg);
        }
        self.send_to_class(selector, argc, class);
        Some(())
    }

    fn inherits_from(&self, class: OOP, ancestor: OOP) -> bool {
        let mut current = class;
        while !current.is_nil() {
            if current == ancestor {
                return true;
            }
            current = self.superclass_of(current);
        }
        false
    }

    /// doPrimitive: index withArguments: anArray, run against the receiver.
    fn prim_do_primitive(&mut self) -> Option<()> {
        let index = self.stack_value(1).try_as_integer()?;
        let array = self.stack_value(0);
        self.check_class(array, CLASS_ARRAY)?;
        if index <= 0 || index == 117 || index == 118 {
            return self.fail(PRIM_ERR_BAD_ARGUMENT);
        }
        let args = self.memory.pointers(array).to_vec();
        let argc = args.len();
        let index_oop = self.stack_value(1);
        self.popn(2);
        for arg in args {
            self.push(arg);
        }
        let saved_argc = self.argument_count;
        self.argument_count = argc;
        let context = self.active_context;
        if self.dispatch_prim(index as usize).is_some() {
            return Some(());
        }
        self.argument_count = saved_argc;
        if self.active_context == context {
            self.popn(argc);
            self.push(index_oop);
            self.push(array);
        }
        None
    }

    /// receiver withArgs: anArray executeMethod: aMethod (and the three-argument class-side
    /// variant naming the receiver explicitly).
    fn prim_execute_method_args_array(&mut self) -> Option<()> {
        let argc = self.argument_count;
        let method = self.stack_value(0);
        let array = self.stack_value(1);
        let receiver = self.stack_value(2);
        self.check_class(array, CLASS_ARRAY)?;
        let header = self.memory.method_header(method)?;
        let args = self.memory.pointers(array).to_vec();
        if header.num_args != args.len() {
            return self.fail(PRIM_ERR_BAD_NUM_ARGS);
        }
        self.popn(argc + 1);
        self.push(receiver);
        for arg in args {
            self.push(arg);
        }
        self.run_method(method, header.num_args, header.primitive);
        Some(())
    }

    /// receiver executeMethod: aMethod, with the arguments already on the stack.
    fn prim_execute_method(&mut self) -> Option<()> {
        let argc = self.argument_count;
        let method = self.stack_top();
        let header = self.memory.method_header(method)?;
        if header.num_args + 1 != argc {
            return self.fail(PRIM_ERR_BAD_NUM_ARGS);
        }
        self.popn(1);
        self.run_method(method, header.num_args, header.primitive);
        Some(())
    }

    fn run_method(&mut self, method: OOP, argc: usize, primitive: usize) {
        self.new_method = method;
        self.argument_count = argc;
        self.primitive_index = primitive;
        self.execute_new_method();
    }

    /// Invoke a non-method object found in a method dictionary as
    /// `object run: selector with: arguments in: receiver`.
    fn prim_run_with_in(&mut self) -> Option<()> {
        let object = self.new_method;
        if self.memory.is_method(object) {
            return self.fail(PRIM_ERR_BAD_RECEIVER);
        }
        let argc = self.argument_count;
        let selector = self.message_selector;
        let args: Vec<OOP> = (0..argc).map(|i| self.stack_value(argc - 1 - i)).collect();
        let receiver = self.stack_value(argc);
        let array = self.memory.new_array(args);
        self.popn(argc + 1);
        self.push(object);
        self.push(selector);
        self.push(array);
        self.push(receiver);
        let run_with_in = self.memory.special(SELECTOR_RUN_WITH_IN);
        self.send(run_with_in, 3);
        Some(())
    }

    // Context walking

    /// First unwind-marked context in the sender chain of the receiver, stopping before
    /// `limit`; nil when there is none.
    fn prim_find_next_unwind_context(&mut self) -> Option<()> {
        self.save_ctx();
        let limit = self.stack_value(0);
        let receiver = self.stack_value(1);
        let mut context = self.memory.get_ptr(receiver, CONTEXT_SENDER_INDEX);
        let mut found = NIL_PTR;
        while !context.is_nil() && context != limit {
            if self.is_unwind_marked(context) {
                found = context;
                break;
            }
            context = self.memory.get_ptr(context, CONTEXT_SENDER_INDEX);
        }
        self.pop_then_push(2, found);
        Some(())
    }

    /// Drop every context between the receiver and `previous`, making `previous` the sender.
    fn prim_terminate_to(&mut self) -> Option<()> {
        self.save_ctx();
        let previous = self.stack_value(0);
        let receiver = self.stack_value(1);
        let mut context = self.memory.get_ptr(receiver, CONTEXT_SENDER_INDEX);
        let mut in_chain = false;
        while !context.is_nil() {
            if context == previous {
                in_chain = true;
                break;
            }
            context = self.memory.get_ptr(context, CONTEXT_SENDER_INDEX);
        }
        if in_chain {
            let mut context = self.memory.get_ptr(receiver, CONTEXT_SENDER_INDEX);
            while context != previous {
                let next = self.memory.get_ptr(context, CONTEXT_SENDER_INDEX);
                self.memory.put_ptr(context, CONTEXT_SENDER_INDEX, NIL_PTR);
                self.memory.put_ptr(context, CONTEXT_PC_INDEX, NIL_PTR);
                context = next;
            }
        }
        self.memory
            .put_ptr(receiver, CONTEXT_SENDER_INDEX, previous);
        self.reclaimable_contexts = 0;
        self.popn(1);
        Some(())
    }

    /// First context from the receiver upwards whose method is marked as an exception
    /// handler; nil when there is none.
    fn prim_find_handler_context(&mut self) -> Option<()> {
        self.save_ctx();
        let mut context = self.stack_top();
        let mut found = NIL_PTR;
        while !context.is_nil() {
            if !self.is_block_context(context) {
                let method = self.memory.get_ptr(context, CONTEXT_METHOD_INDEX);
                let marked = self
                    .memory
                    .method_header(method)
                    .map_or(false, |header| header.primitive == 199);
                if marked {
                    found = context;
                    break;
                }
            }
            context = self.memory.get_ptr(context, CONTEXT_SENDER_INDEX);
        }
        self.pop_then_push(1, found);
        Some(())
    }
}
