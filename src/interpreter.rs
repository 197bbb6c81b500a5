//! The bytecode interpreter.
//!
//! One `Interpreter` owns the object memory and a register set cached from the active
//! context. Contexts are ordinary heap objects, so a send or a return never recurses on the
//! host stack: it swaps the registers and comes back to the step loop. Whenever anything may
//! look at a context from the heap side (a collection, a process switch, a primitive that
//! takes a context) the registers are flushed back with `save_ctx` first.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::{Duration, Instant};

use log::{error, trace, warn};

use crate::compiler::{CompiledCode, Compiler};
use crate::config::VmConfig;
use crate::error::VmError;
use crate::objectmemory::format::{FMT_FIXED_INDEXABLE, V3_CALL_PRIMITIVE, SISTA_CALL_PRIMITIVE};
use crate::objectmemory::specials::*;
use crate::objectmemory::{
    GcRequest, MethodHeader, ObjectId, ObjectMemory, FALSE_PTR, NIL_PTR, OOP, TRUE_PTR,
};

use self::decode::{decode_insn, Insn};
use self::gc_support::HeldOops;
use self::plugins::{ModuleRegistry, NamedPrimitive};

mod debug;
pub mod decode;
mod gc_support;
pub mod plugins;
mod primitives;
mod scheduler;
mod startup;

const METHOD_CACHE_SIZE: usize = 1024;

/// Why `interpret` came back.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RunState {
    /// The time slice ran out; call again.
    Running,
    /// The image relinquished the processor, until the given instant if it named one.
    Idle(Option<Instant>),
    Quit,
}

#[derive(Copy, Clone, Debug, Default, PartialEq)]
struct MethodCacheEntry {
    selector: OOP,
    class: OOP,
    method: OOP,
    primitive_index: usize,
}

/// Result of walking a class chain for a selector.
#[derive(Copy, Clone, Debug, PartialEq)]
pub(crate) enum Lookup {
    Found(OOP),
    NotFound,
    /// The class in the chain whose method dictionary is nil.
    NoDictionary(OOP),
}

pub struct Interpreter {
    pub(crate) memory: ObjectMemory,
    config: VmConfig,

    active_context: OOP,
    home_context: OOP,
    method: OOP,
    receiver: OOP,

    /// Zero-based offset of the next bytecode in `method`.
    ip: usize,
    /// Slot index of the top of stack in `active_context`.
    sp: usize,
    /// Heap pc of bytecode zero: one-based and counting the literal frame.
    pc_bias: usize,
    sista: bool,
    jit_code: Option<Rc<CompiledCode>>,
    cycle: u64,

    // Message lookup
    message_selector: OOP,
    argument_count: usize,
    lookup_class: OOP,
    new_method: OOP,
    primitive_index: usize,
    prim_fail_code: u32,
    method_cache: Vec<MethodCacheEntry>,

    // Context recycling, bucketed small and large
    free_contexts: [Vec<OOP>; 2],
    reclaimable_contexts: usize,

    // Interrupts and timers
    startup_time: Instant,
    interrupt_check_counter: i32,
    interrupt_check_reset: i32,
    last_tick: u32,
    /// Millisecond clock value at which the timer semaphore fires; zero when disarmed.
    next_wakeup_tick: u32,
    break_out_at: Instant,
    break_out: bool,
    idle: Option<Option<Instant>>,
    interrupt_pending: bool,
    signal_low_space: bool,
    low_space_threshold: usize,
    pending_finalizations: usize,
    semaphores_to_signal: Vec<usize>,

    // GC support
    held_objects: Rc<RefCell<Vec<Vec<OOP>>>>,
    remappable: Vec<OOP>,

    // Named primitives
    modules: ModuleRegistry,
    named_primitives: HashMap<ObjectId, Option<NamedPrimitive>>,

    compiler: Compiler,
    quit: bool,
    fatal_error: Option<VmError>,
}

// Registers and contexts
impl Interpreter {
    pub fn memory(&self) -> &ObjectMemory {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut ObjectMemory {
        &mut self.memory
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn active_context(&self) -> OOP {
        self.active_context
    }

    pub fn cycles(&self) -> u64 {
        self.cycle
    }

    pub fn has_quit(&self) -> bool {
        self.quit
    }

    pub(crate) fn ip(&self) -> usize {
        self.ip
    }

    pub(crate) fn set_ip(&mut self, ip: usize) {
        self.ip = ip;
    }

    pub(crate) fn count_cycle(&mut self) {
        self.cycle += 1;
    }

    pub(crate) fn receiver(&self) -> OOP {
        self.receiver
    }

    pub(crate) fn compiler(&self) -> &Compiler {
        &self.compiler
    }

    /// Route everything through the bytecode loop, for debuggers stepping a method.
    pub fn set_single_step(&mut self, on: bool) {
        self.compiler.set_single_step(on);
        self.jit_code = None;
    }

    /// Record a host-level fault; the step loop surfaces it and stops.
    pub(crate) fn fatal(&mut self, err: VmError) {
        error!("fatal: {}", err);
        self.backtrace();
        if self.fatal_error.is_none() {
            self.fatal_error = Some(err);
        }
    }

    fn take_fatal(&mut self) -> Result<(), VmError> {
        match self.fatal_error.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub(crate) fn is_block_context(&self, context: OOP) -> bool {
        !self.memory.get_ptr(context, CONTEXT_METHOD_INDEX).is_object()
    }

    pub(crate) fn is_context(&self, oop: OOP) -> bool {
        let class = self.memory.get_class_of(oop);
        class == self.memory.special(CLASS_METHOD_CONTEXT)
            || class == self.memory.special(CLASS_BLOCK_CONTEXT)
    }

    /// Cache the registers of `active_context`.
    pub(crate) fn load_ctx(&mut self) {
        let context = self.active_context;
        self.home_context = if self.is_block_context(context) {
            self.memory.get_ptr(context, BLOCK_HOME_INDEX)
        } else {
            context
        };
        self.method = self.memory.get_ptr(self.home_context, CONTEXT_METHOD_INDEX);
        self.receiver = self.memory.get_ptr(self.home_context, CONTEXT_RECEIVER_INDEX);
        let header = self.memory.method_header(self.method).unwrap_or_default();
        self.pc_bias = header.initial_pc_offset() + 1;
        self.sista = header.sista;
        let pc = self.context_integer(context, CONTEXT_PC_INDEX);
        self.ip = pc.saturating_sub(self.pc_bias);
        let stackp = self.context_integer(context, CONTEXT_STACKP_INDEX);
        self.sp = stackp + CONTEXT_TEMP_FRAME_START - 1;
        self.jit_code = self.compiler.lookup(self.method);
    }

    /// Flush pc and stack pointer back into the active context.
    pub(crate) fn save_ctx(&mut self) {
        if self.active_context.is_nil() {
            return;
        }
        let pc = OOP::Int((self.ip + self.pc_bias) as i32);
        let stackp = OOP::Int((self.sp + 1).saturating_sub(CONTEXT_TEMP_FRAME_START) as i32);
        self.memory.put_ptr(self.active_context, CONTEXT_PC_INDEX, pc);
        self.memory.put_ptr(self.active_context, CONTEXT_STACKP_INDEX, stackp);
    }

    fn context_integer(&self, context: OOP, field: usize) -> usize {
        self.memory
            .get_ptr(context, field)
            .try_as_integer()
            .unwrap_or(0)
            .max(0) as usize
    }

    pub(crate) fn new_active_context(&mut self, context: OOP) {
        self.save_ctx();
        self.active_context = context;
        self.load_ctx();
    }

    pub(crate) fn push(&mut self, oop: OOP) {
        self.sp += 1;
        self.memory.put_ptr(self.active_context, self.sp, oop);
    }

    pub(crate) fn pop(&mut self) -> OOP {
        let top = self.stack_top();
        self.popn(1);
        top
    }

    pub(crate) fn stack_value(&self, offset: usize) -> OOP {
        match self.sp.checked_sub(offset) {
            Some(index) => self.memory.get_ptr(self.active_context, index),
            None => NIL_PTR,
        }
    }

    pub(crate) fn stack_top(&self) -> OOP {
        self.stack_value(0)
    }

    pub(crate) fn popn(&mut self, count: usize) {
        self.sp = self.sp.saturating_sub(count);
    }

    pub(crate) fn pop_then_push(&mut self, count: usize, oop: OOP) {
        self.popn(count);
        self.push(oop);
    }

    /// Temporaries live in the home context; for closure activations that is the activation.
    pub(crate) fn temp(&self, index: usize) -> OOP {
        self.memory
            .get_ptr(self.home_context, CONTEXT_TEMP_FRAME_START + index)
    }

    pub(crate) fn set_temp(&mut self, index: usize, value: OOP) {
        self.memory
            .put_ptr(self.home_context, CONTEXT_TEMP_FRAME_START + index, value)
    }

    pub(crate) fn literal(&self, index: usize) -> OOP {
        self.memory.get_ptr(self.method, index + 1)
    }

    pub(crate) fn store_receiver_var(&mut self, index: usize, value: OOP) {
        if self.memory.store_pointer(self.receiver, index, value).is_none() {
            let receiver = self.obj_name(self.receiver);
            self.fatal(VmError::IllegalStore(format!(
                "instance variable {} of {}",
                index, receiver
            )));
        }
    }

    pub(crate) fn sender(&self) -> OOP {
        self.memory.get_ptr(self.active_context, CONTEXT_SENDER_INDEX)
    }

    /// The method context a `^` leaves, found through the closures' outer contexts. Nil when
    /// some outer context is gone.
    fn home_method_context(&self) -> OOP {
        let mut context = self.home_context;
        loop {
            let closure = self.memory.get_ptr(context, CONTEXT_CLOSURE_INDEX);
            if closure.is_nil() {
                return context;
            }
            context = self
                .memory
                .get_ptr(closure, CLOSURE_OUTER_CONTEXT_INDEX);
            if context.is_nil() {
                return NIL_PTR;
            }
        }
    }

    pub(crate) fn active_process(&self) -> OOP {
        let scheduler = self.scheduler();
        self.memory
            .get_ptr(scheduler, SCHEDULER_ACTIVE_PROCESS_INDEX)
    }

    pub(crate) fn scheduler(&self) -> OOP {
        let association = self.memory.special(SCHEDULER_ASSOCIATION);
        self.memory.get_ptr(association, ASSOCIATION_VALUE_INDEX)
    }

    pub(crate) fn bool_oop(value: bool) -> OOP {
        if value {
            TRUE_PTR
        } else {
            FALSE_PTR
        }
    }
}

// Method lookup
impl Interpreter {
    pub(crate) fn superclass_of(&self, class: OOP) -> OOP {
        self.memory.get_ptr(class, CLASS_SUPERCLASS_INDEX)
    }

    /// Class the method was compiled in, from the binding in its last literal. Blocks
    /// refer to their outer code there instead.
    pub(crate) fn method_class_of(&self, method: OOP) -> OOP {
        let mut method = method;
        for _ in 0..64 {
            let count = self
                .memory
                .method_header(method)
                .map_or(0, |header| header.num_literals);
            if count == 0 {
                return NIL_PTR;
            }
            let last = self.memory.get_ptr(method, count);
            if self.memory.is_method(last) {
                method = last;
                continue;
            }
            return self.memory.get_ptr(last, ASSOCIATION_VALUE_INDEX);
        }
        NIL_PTR
    }

    fn lookup_in_dictionary(&mut self, dict: OOP, selector: OOP) -> Option<OOP> {
        let length = self.memory.slot_count(dict);
        if length <= MESSAGE_DICT_SELECTOR_START {
            return None;
        }
        let mask = length - MESSAGE_DICT_SELECTOR_START - 1;
        let start = (self.memory.identity_hash(selector) as usize & mask) + MESSAGE_DICT_SELECTOR_START;
        let mut index = start;
        let mut wrapped = false;
        loop {
            let key = self.memory.get_ptr(dict, index);
            if key.is_nil() {
                return None;
            }
            if key == selector {
                let methods = self
                    .memory
                    .get_ptr(dict, MESSAGE_DICT_METHOD_ARRAY_INDEX);
                return Some(
                    self.memory
                        .get_ptr(methods, index - MESSAGE_DICT_SELECTOR_START),
                );
            }
            index += 1;
            if index == length {
                if wrapped {
                    return None;
                }
                wrapped = true;
                index = MESSAGE_DICT_SELECTOR_START;
            }
        }
    }

    /// Walk the superclass chain from `class`, probing each method dictionary.
    pub(crate) fn lookup_selector(&mut self, class: OOP, selector: OOP) -> Lookup {
        let mut current = class;
        while !current.is_nil() {
            let dict = self.memory.get_ptr(current, CLASS_MESSAGE_DICT_INDEX);
            if dict.is_nil() {
                return Lookup::NoDictionary(current);
            }
            if let Some(method) = self.lookup_in_dictionary(dict, selector) {
                return Lookup::Found(method);
            }
            current = self.superclass_of(current);
        }
        Lookup::NotFound
    }

    fn primitive_of(&self, method: OOP) -> usize {
        match self.memory.method_header(method) {
            Some(header) => header.primitive,
            // any other object found in a method dictionary gets run:with:in:
            None => 248,
        }
    }

    fn cache_key(oop: OOP) -> usize {
        match oop {
            OOP::Object(id) => id.index(),
            OOP::Int(value) => value as usize,
            OOP::Char(value) => value as usize,
        }
    }

    pub(crate) fn flush_method_cache(&mut self) {
        for entry in self.method_cache.iter_mut() {
            *entry = MethodCacheEntry::default();
        }
    }

    pub(crate) fn flush_method_cache_for(&mut self, pred: impl Fn(&OOP, &OOP) -> bool) {
        for entry in self.method_cache.iter_mut() {
            if pred(&entry.selector, &entry.method) {
                *entry = MethodCacheEntry::default();
            }
        }
    }

    /// Resolve `message_selector` in `class` into `new_method` and `primitive_index`.
    fn find_new_method_in_class(&mut self, class: OOP) {
        let index = (Self::cache_key(self.message_selector) ^ Self::cache_key(class))
            & (METHOD_CACHE_SIZE - 1);
        let entry = self.method_cache[index];
        if !entry.class.is_nil() && entry.selector == self.message_selector && entry.class == class {
            self.new_method = entry.method;
            self.primitive_index = entry.primitive_index;
            return;
        }

        match self.lookup_selector(class, self.message_selector) {
            Lookup::Found(method) => {
                self.new_method = method;
                self.primitive_index = self.primitive_of(method);
                self.method_cache[index] = MethodCacheEntry {
                    selector: self.message_selector,
                    class,
                    method,
                    primitive_index: self.primitive_index,
                };
            }
            Lookup::NoDictionary(holder) => {
                trace!("cannotInterpret: {}", self.print_methodcall());
                self.create_actual_message(class);
                self.message_selector = self.memory.special(SELECTOR_CANNOT_INTERPRET);
                let start = self.superclass_of(holder);
                self.find_new_method_in_class(start);
            }
            Lookup::NotFound => {
                let dnu = self.memory.special(SELECTOR_DOES_NOT_UNDERSTAND);
                if self.message_selector == dnu {
                    let name = self.class_name(class);
                    self.fatal(VmError::RecursiveDoesNotUnderstand(name.into_owned()));
                    return;
                }
                trace!("doesNotUnderstand: {}", self.print_methodcall());
                self.create_actual_message(class);
                self.message_selector = dnu;
                self.find_new_method_in_class(class);
            }
        }
    }

    /// Replace the arguments on the stack with a Message describing the send.
    fn create_actual_message(&mut self, lookup_class: OOP) {
        let argc = self.argument_count;
        let args: Vec<OOP> = (0..argc).map(|i| self.stack_value(argc - 1 - i)).collect();
        let array = self.memory.new_array(args);
        let message_class = self.memory.special(CLASS_MESSAGE);
        let message = self
            .memory
            .instantiate_class(message_class, 0)
            .unwrap_or_else(|| self.memory.new_pointers(message_class, 1, vec![NIL_PTR; MESSAGE_SIZE]));
        self.memory
            .put_ptr(message, MESSAGE_SELECTOR_INDEX, self.message_selector);
        self.memory.put_ptr(message, MESSAGE_ARGUMENTS_INDEX, array);
        // older images have no lookupClass slot
        if self.memory.slot_count(message) > MESSAGE_LOOKUP_CLASS_INDEX {
            self.memory
                .put_ptr(message, MESSAGE_LOOKUP_CLASS_INDEX, lookup_class);
        }
        self.popn(argc);
        self.push(message);
        self.argument_count = 1;
    }
}

// Sends and activation
impl Interpreter {
    pub(crate) fn send(&mut self, selector: OOP, argc: usize) {
        let receiver = self.stack_value(argc);
        let class = self.memory.get_class_of(receiver);
        self.send_to_class(selector, argc, class);
    }

    pub(crate) fn send_to_class(&mut self, selector: OOP, argc: usize, class: OOP) {
        self.message_selector = selector;
        self.argument_count = argc;
        self.lookup_class = class;
        trace!("[cycle={}] SEND {}", self.cycle, self.print_methodcall());
        self.find_new_method_in_class(class);
        if self.fatal_error.is_some() {
            return;
        }
        self.execute_new_method();
    }

    pub(crate) fn send_super(&mut self, selector: OOP, argc: usize) {
        let class = self.method_class_of(self.method);
        let start = self.superclass_of(class);
        self.send_to_class(selector, argc, start);
    }

    /// Super send from an explicit class popped off the stack.
    pub(crate) fn send_directed_super(&mut self, selector: OOP, argc: usize) {
        let class = self.pop();
        let start = self.superclass_of(class);
        self.send_to_class(selector, argc, start);
    }

    pub(crate) fn send_special(&mut self, index: usize) {
        if self.special_selector_quick(index).is_some() {
            return;
        }
        let selectors = self.memory.special(SPECIAL_SELECTORS);
        let selector = self.memory.get_ptr(selectors, index * 2);
        let argc = self
            .memory
            .get_ptr(selectors, index * 2 + 1)
            .try_as_integer()
            .unwrap_or(0) as usize;
        self.send(selector, argc);
    }

    pub(crate) fn execute_new_method(&mut self) {
        if self.primitive_index > 0 && self.try_primitive() {
            return;
        }
        self.activate_new_method();
    }

    fn try_primitive(&mut self) -> bool {
        let index = self.primitive_index;
        if (256..=519).contains(&index) {
            return self.quick_primitive(index);
        }
        self.prim_fail_code = 0;
        let context = self.active_context;
        let sp = self.sp;
        let result = self.dispatch_prim(index);
        trace!(
            "PRIM {} {}",
            index,
            if result.is_some() { "ok" } else { "failed" }
        );
        if result.is_none() && self.active_context == context && self.sp != sp {
            warn!("primitive {} failed with an unbalanced stack", index);
            self.sp = sp;
        }
        result.is_some()
    }

    /// Primitives 256-519: answer a constant or an instance variable without activating.
    fn quick_primitive(&mut self, index: usize) -> bool {
        let argc = self.argument_count;
        let receiver = self.stack_value(argc);
        let value = match index {
            256 => receiver,
            257 => TRUE_PTR,
            258 => FALSE_PTR,
            259 => NIL_PTR,
            260..=263 => OOP::Int(index as i32 - 261),
            _ => match self.memory.fetch_pointer(receiver, index - 264) {
                Some(value) => value,
                None => return false,
            },
        };
        self.pop_then_push(argc + 1, value);
        true
    }

    /// A context ready for reuse, or a fresh one.
    pub(crate) fn allocate_context(&mut self, large: bool) -> OOP {
        if let Some(context) = self.free_contexts[large as usize].pop() {
            return context;
        }
        let size = CONTEXT_TEMP_FRAME_START
            + if large {
                CONTEXT_LARGE_FRAME
            } else {
                CONTEXT_SMALL_FRAME
            };
        let class = self.memory.special(CLASS_METHOD_CONTEXT);
        self.memory
            .new_pointers(class, FMT_FIXED_INDEXABLE, vec![NIL_PTR; size])
    }

    fn recycle_context(&mut self, context: OOP) {
        if self.memory.get_class_of(context) != self.memory.special(CLASS_METHOD_CONTEXT) {
            return;
        }
        let bucket = match self
            .memory
            .slot_count(context)
            .saturating_sub(CONTEXT_TEMP_FRAME_START)
        {
            CONTEXT_SMALL_FRAME => 0,
            CONTEXT_LARGE_FRAME => 1,
            _ => return,
        };
        if self.free_contexts[bucket].len() < 64 {
            self.free_contexts[bucket].push(context);
        }
    }

    fn activate_new_method(&mut self) {
        let method = self.new_method;
        let header = match self.memory.method_header(method) {
            Some(header) => header,
            None => {
                let name = self.obj_name(method);
                self.fatal(VmError::BadContext(format!("cannot activate {}", name)));
                return;
            }
        };
        let argc = self.argument_count;
        let context = self.allocate_context(header.large_frame);
        self.memory
            .put_ptr(context, CONTEXT_SENDER_INDEX, self.active_context);
        self.memory.put_ptr(
            context,
            CONTEXT_PC_INDEX,
            OOP::Int((header.initial_pc_offset() + 1) as i32),
        );
        self.memory
            .put_ptr(context, CONTEXT_STACKP_INDEX, OOP::Int(header.num_temps as i32));
        self.memory.put_ptr(context, CONTEXT_METHOD_INDEX, method);
        self.memory
            .put_ptr(context, CONTEXT_CLOSURE_INDEX, NIL_PTR);
        for i in 0..=argc {
            let value = self.stack_value(argc - i);
            self.memory
                .put_ptr(context, CONTEXT_RECEIVER_INDEX + i, value);
        }
        for i in argc..header.num_temps {
            self.memory
                .put_ptr(context, CONTEXT_TEMP_FRAME_START + i, NIL_PTR);
        }
        self.popn(argc + 1);
        self.reclaimable_contexts += 1;
        self.interrupt_check_counter -= 1;
        self.compiler.note_activation(&self.memory, method);
        self.new_active_context(context);
        if header.primitive > 0 && self.prim_fail_code > 0 {
            self.store_primitive_error(&header);
        }
    }

    /// A method declaring an error temp starts with callPrimitive followed by a store into
    /// that temp; the failure reason goes there.
    fn store_primitive_error(&mut self, header: &MethodHeader) {
        let bytes = self.memory.bytes(self.method);
        let stores_error = match bytes {
            [V3_CALL_PRIMITIVE, _, _, 0x81, ..] => true,
            [SISTA_CALL_PRIMITIVE, _, _, 0xF5, ..] => true,
            _ => false,
        };
        if !stores_error || header.num_temps == 0 {
            return;
        }
        let code = self.prim_fail_code;
        let table = self.memory.special(PRIM_ERR_TABLE_INDEX);
        let error = match self.memory.fetch_pointer(table, code as usize - 1) {
            Some(entry) if !entry.is_nil() => entry,
            _ => OOP::Int(code as i32),
        };
        self.memory.put_ptr(self.active_context, self.sp, error);
    }
}

// Returns
impl Interpreter {
    pub(crate) fn method_return(&mut self, value: OOP) {
        let home = self.home_method_context();
        let target = if home.is_nil() {
            NIL_PTR
        } else {
            self.memory.get_ptr(home, CONTEXT_SENDER_INDEX)
        };
        self.return_to(target, value);
    }

    pub(crate) fn block_return(&mut self, value: OOP) {
        let target = self.sender();
        self.return_to(target, value);
    }

    fn return_to(&mut self, target: OOP, value: OOP) {
        if target.is_nil() || self.memory.get_ptr(target, CONTEXT_PC_INDEX).is_nil() {
            self.cannot_return(value);
            return;
        }
        // unwind-protected contexts between here and the target get a say first
        let mut context = self.sender();
        while context != target {
            if context.is_nil() {
                self.cannot_return(value);
                return;
            }
            if self.is_unwind_marked(context) {
                self.about_to_return(value, context);
                return;
            }
            context = self.memory.get_ptr(context, CONTEXT_SENDER_INDEX);
        }

        let mut context = self.active_context;
        while context != target {
            let next = self.memory.get_ptr(context, CONTEXT_SENDER_INDEX);
            self.memory.put_ptr(context, CONTEXT_SENDER_INDEX, NIL_PTR);
            self.memory.put_ptr(context, CONTEXT_PC_INDEX, NIL_PTR);
            if self.reclaimable_contexts > 0 {
                self.reclaimable_contexts -= 1;
                self.recycle_context(context);
            }
            context = next;
        }
        trace!("[cycle={}] RETURN {}", self.cycle, self.obj_name(value));
        self.active_context = target;
        self.load_ctx();
        self.push(value);
    }

    pub(crate) fn is_unwind_marked(&self, context: OOP) -> bool {
        if self.is_block_context(context) {
            return false;
        }
        let method = self.memory.get_ptr(context, CONTEXT_METHOD_INDEX);
        self.memory
            .method_header(method)
            .map_or(false, |header| header.primitive == 198)
    }

    fn cannot_return(&mut self, value: OOP) {
        self.reclaimable_contexts = 0;
        self.push(self.active_context);
        self.push(value);
        let selector = self.memory.special(SELECTOR_CANNOT_RETURN);
        self.send(selector, 1);
    }

    fn about_to_return(&mut self, value: OOP, marked: OOP) {
        self.reclaimable_contexts = 0;
        self.push(self.active_context);
        self.push(value);
        self.push(marked);
        let selector = self.memory.special(SELECTOR_ABOUT_TO_RETURN);
        self.send(selector, 2);
    }
}

// Closures and jumps
impl Interpreter {
    pub(crate) fn push_closure(&mut self, num_args: usize, num_copied: usize, block_size: usize) {
        let start_pc = self.ip + self.pc_bias;
        let mut slots = Vec::with_capacity(CLOSURE_FIRST_COPIED_INDEX + num_copied);
        slots.push(self.active_context);
        slots.push(OOP::Int(start_pc as i32));
        slots.push(OOP::Int(num_args as i32));
        for i in 0..num_copied {
            slots.push(self.stack_value(num_copied - 1 - i));
        }
        self.popn(num_copied);
        self.reclaimable_contexts = 0;
        let class = self.memory.special(CLASS_BLOCK_CLOSURE);
        let closure = self.memory.new_pointers(class, FMT_FIXED_INDEXABLE, slots);
        self.push(closure);
        self.ip += block_size;
    }

    pub(crate) fn push_full_closure(
        &mut self,
        literal: usize,
        num_copied: usize,
        ignore_outer: bool,
        receiver_on_stack: bool,
    ) {
        let block = self.literal(literal);
        let num_args = self
            .memory
            .method_header(block)
            .map_or(0, |header| header.num_args);
        let receiver = if receiver_on_stack {
            self.stack_value(num_copied)
        } else {
            self.receiver
        };
        let outer = if ignore_outer {
            NIL_PTR
        } else {
            self.reclaimable_contexts = 0;
            self.active_context
        };
        let mut slots = Vec::with_capacity(FULL_CLOSURE_FIRST_COPIED_INDEX + num_copied);
        slots.push(outer);
        slots.push(block);
        slots.push(OOP::Int(num_args as i32));
        slots.push(receiver);
        for i in 0..num_copied {
            slots.push(self.stack_value(num_copied - 1 - i));
        }
        self.popn(num_copied + receiver_on_stack as usize);
        let class = self.memory.special(CLASS_FULL_BLOCK_CLOSURE);
        let closure = self.memory.new_pointers(class, FMT_FIXED_INDEXABLE, slots);
        self.push(closure);
    }

    pub(crate) fn jump(&mut self, offset: isize) {
        self.ip = (self.ip as isize + offset).max(0) as usize;
        if offset < 0 {
            self.interrupt_check_counter -= 1;
        }
    }

    /// Pop a boolean and jump when it equals `condition`. Anything else gets mustBeBoolean.
    pub(crate) fn conditional_jump(&mut self, condition: bool, offset: isize) {
        let value = self.pop();
        if value == Self::bool_oop(condition) {
            self.jump(offset);
        } else if value != Self::bool_oop(!condition) {
            self.push(value);
            let selector = self.memory.special(SELECTOR_MUST_BE_BOOLEAN);
            self.send(selector, 0);
        }
    }
}

// Dispatch
impl Interpreter {
    /// Execute one decoded instruction. `ip` already points past it; `start` is its offset.
    pub(crate) fn dispatch(&mut self, insn: Insn, start: usize) {
        match insn {
            Insn::PushReceiverVar(i) => {
                let value = self.memory.get_ptr(self.receiver, i);
                self.push(value)
            }
            Insn::PushTemporary(i) => self.push(self.temp(i)),
            Insn::PushConst(oop) => self.push(oop),
            Insn::PushLiteralConst(i) => self.push(self.literal(i)),
            Insn::PushLiteralVar(i) => {
                let value = self
                    .memory
                    .get_ptr(self.literal(i), ASSOCIATION_VALUE_INDEX);
                self.push(value)
            }
            Insn::PushReceiver => self.push(self.receiver),
            Insn::PushCtx => {
                self.reclaimable_contexts = 0;
                self.push(self.active_context)
            }
            Insn::PushNewArray(size) => {
                let array = self.memory.new_array(vec![NIL_PTR; size]);
                self.push(array)
            }
            Insn::PopIntoNewArray(size) => {
                let elements: Vec<OOP> = (0..size).map(|i| self.stack_value(size - 1 - i)).collect();
                let array = self.memory.new_array(elements);
                self.pop_then_push(size, array)
            }
            Insn::PushRemoteTemp(index, vector) => {
                let value = self.memory.get_ptr(self.temp(vector), index);
                self.push(value)
            }
            Insn::StoreRemoteTemp(index, vector) => {
                let (value, array) = (self.stack_top(), self.temp(vector));
                self.memory.put_ptr(array, index, value)
            }
            Insn::PopRemoteTemp(index, vector) => {
                let (value, array) = (self.pop(), self.temp(vector));
                self.memory.put_ptr(array, index, value)
            }
            Insn::PushClosure {
                num_args,
                num_copied,
                block_size,
            } => self.push_closure(num_args, num_copied, block_size),
            Insn::PushFullClosure {
                literal,
                num_copied,
                ignore_outer,
                receiver_on_stack,
            } => self.push_full_closure(literal, num_copied, ignore_outer, receiver_on_stack),
            Insn::PopReceiverVar(i) => {
                let value = self.pop();
                self.store_receiver_var(i, value)
            }
            Insn::StoreReceiverVar(i) => self.store_receiver_var(i, self.stack_top()),
            Insn::PopTemporary(i) => {
                let value = self.pop();
                self.set_temp(i, value)
            }
            Insn::StoreTemporary(i) => self.set_temp(i, self.stack_top()),
            Insn::PopLiteralVar(i) => {
                let (value, binding) = (self.pop(), self.literal(i));
                self.memory.put_ptr(binding, ASSOCIATION_VALUE_INDEX, value)
            }
            Insn::StoreLiteralVar(i) => {
                let (value, binding) = (self.stack_top(), self.literal(i));
                self.memory.put_ptr(binding, ASSOCIATION_VALUE_INDEX, value)
            }
            Insn::MessageReturnRcvr => self.method_return(self.receiver),
            Insn::MessageReturnOOP(oop) => self.method_return(oop),
            Insn::MessageReturn => {
                let value = self.pop();
                self.method_return(value)
            }
            Insn::BlockReturn => {
                let value = self.pop();
                self.block_return(value)
            }
            Insn::BlockReturnOOP(oop) => self.block_return(oop),
            Insn::SendLiteral(selector, argc) => {
                let selector = self.literal(selector);
                self.send(selector, argc)
            }
            Insn::SendLiteralSuper(selector, argc) => {
                let selector = self.literal(selector);
                self.send_super(selector, argc)
            }
            Insn::SendDirectedSuper(selector, argc) => {
                let selector = self.literal(selector);
                self.send_directed_super(selector, argc)
            }
            Insn::SendSpecial(index) => self.send_special(index),
            Insn::Pop => {
                self.pop();
            }
            Insn::Dup => self.push(self.stack_top()),
            Insn::Nop => {}
            Insn::Jump(offset) => self.jump(offset),
            Insn::JumpFalse(offset) => self.conditional_jump(false, offset),
            Insn::JumpTrue(offset) => self.conditional_jump(true, offset),
            // the primitive already ran and failed
            Insn::CallPrimitive(_) => {}
            Insn::Trap => {
                self.reclaimable_contexts = 0;
                self.push(self.active_context);
                let selector = self.memory.special(SELECTOR_SISTA_TRAP);
                self.send(selector, 0)
            }
            Insn::Illegal(byte) => self.fatal(VmError::IllegalBytecode {
                byte,
                pc: start + self.pc_bias,
            }),
        }
    }

    /// Execute one bytecode, or one run of compiled code when the JIT has this spot.
    pub fn step(&mut self) -> Result<(), VmError> {
        if self.memory.gc_requested() != GcRequest::None {
            self.gc_safe_point();
        }
        if self.interrupt_check_counter <= 0 {
            self.check_for_interrupts();
        }
        if let Some(code) = self.jit_code.clone() {
            if let Some(entry) = code.entry(self.ip) {
                code.run(self, entry);
                return self.take_fatal();
            }
        }
        self.cycle += 1;
        let start = self.ip;
        let (insn, size) = decode_insn(self.memory.bytes(self.method), start, self.sista);
        self.ip += size;
        trace!("[cycle={}] {:?} @ {}", self.cycle, insn, start);
        self.dispatch(insn, start);
        self.take_fatal()
    }

    /// Whether compiled code entered in `context` has to hand control back.
    pub(crate) fn jit_must_exit(&self, context: OOP, code: &Rc<CompiledCode>) -> bool {
        self.active_context != context
            || self.interrupt_check_counter <= 0
            || self.fatal_error.is_some()
            || self.quit
            || self.break_out
            || self.memory.gc_requested() != GcRequest::None
            || !self
                .jit_code
                .as_ref()
                .map_or(false, |current| Rc::ptr_eq(current, code))
    }

    /// Run for about `slice`, until the image quits, or until it gives up the processor.
    pub fn interpret(&mut self, slice: Duration) -> Result<RunState, VmError> {
        self.break_out = false;
        self.break_out_at = Instant::now() + slice;
        while !self.break_out && !self.quit {
            self.step()?;
        }
        if self.quit {
            return Ok(RunState::Quit);
        }
        match self.idle.take() {
            Some(deadline) => Ok(RunState::Idle(deadline)),
            None => Ok(RunState::Running),
        }
    }

    /// Run `receiver selector args` to completion from a throwaway bottom context and answer
    /// the result. The interrupted computation carries on afterwards.
    pub fn evaluate(&mut self, receiver: OOP, selector: OOP, args: &[OOP]) -> Result<OOP, VmError> {
        let argc = args.len();
        let held = HeldOops::new(self);
        self.save_ctx();
        let previous = held.push(self.active_context);
        held.push(receiver);
        held.push(selector);
        for &arg in args {
            held.push(arg);
        }

        let send = match self.special_selector_index(selector, argc) {
            Some(index) => vec![0xB0 + index as u8],
            None if argc <= 7 => vec![0x83, (argc as u8) << 5],
            None => vec![0x84, argc as u8, 0],
        };
        let done_ip = send.len();
        let mut bytecodes = send;
        bytecodes.push(0x7C);
        let header = MethodHeader {
            num_literals: 2,
            large_frame: true,
            ..MethodHeader::default()
        };
        let raw = self.memory.kind().encode_method_header(&header);
        let method_class = self.memory.special(CLASS_COMPILED_METHOD);
        let method = held.push(self.memory.new_method(
            method_class,
            vec![OOP::Int(raw as i32), selector, NIL_PTR],
            bytecodes,
        ));

        let mut slots = vec![NIL_PTR; CONTEXT_TEMP_FRAME_START + CONTEXT_LARGE_FRAME];
        slots[CONTEXT_PC_INDEX] = OOP::Int((header.initial_pc_offset() + 1) as i32);
        slots[CONTEXT_STACKP_INDEX] = OOP::Int(argc as i32 + 1);
        slots[CONTEXT_METHOD_INDEX] = method;
        slots[CONTEXT_TEMP_FRAME_START] = receiver;
        for (i, &arg) in args.iter().enumerate() {
            slots[CONTEXT_TEMP_FRAME_START + 1 + i] = arg;
        }
        let context_class = self.memory.special(CLASS_METHOD_CONTEXT);
        let bottom = held.push(self.memory.new_pointers(context_class, FMT_FIXED_INDEXABLE, slots));

        self.active_context = bottom;
        self.load_ctx();
        self.reclaimable_contexts = 0;
        let outcome = loop {
            if self.active_context == bottom && self.ip == done_ip {
                break Ok(self.pop());
            }
            if self.quit {
                break Err(VmError::BadContext("image quit during evaluation".to_string()));
            }
            if let Err(err) = self.step() {
                break Err(err);
            }
        };
        self.idle = None;
        self.active_context = previous;
        self.load_ctx();
        outcome
    }

    /// Index of `selector` among the special selectors taking `argc` arguments.
    fn special_selector_index(&self, selector: OOP, argc: usize) -> Option<usize> {
        let selectors = self.memory.special(SPECIAL_SELECTORS);
        (0..32).find(|&i| {
            self.memory.get_ptr(selectors, i * 2) == selector
                && self.memory.get_ptr(selectors, i * 2 + 1) == OOP::Int(argc as i32)
        })
    }
}
