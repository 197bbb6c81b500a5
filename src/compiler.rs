//! Closure-tree compiler for hot methods.
//!
//! A method's bytecodes are decoded once into a vector of boxed closures, one per
//! instruction. Entry points ("labels") are the method start, every jump target, the
//! instruction after anything that may leave the method (sends, returns, closure creation)
//! and every block start, so execution can resume in compiled code whenever a context comes
//! back. [`CompiledCode::run`] is the trampoline: it runs closures in sequence until control
//! leaves the straight line or the context switches under it.

use std::collections::HashMap;
use std::rc::Rc;

use log::debug;

use crate::config::VmConfig;
use crate::interpreter::decode::{decode_insn, Insn};
use crate::interpreter::Interpreter;
use crate::objectmemory::{ObjectId, ObjectMemory, OOP};

/// Where to go after an op.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Flow {
    Next,
    /// Continue at this bytecode offset.
    Goto(usize),
    /// Hand control back to the interpreter.
    Exit,
}

type Body = Box<dyn Fn(&mut Interpreter) -> Flow>;

struct Op {
    ip: usize,
    next_ip: usize,
    /// Whether the op may switch contexts, trip the interrupt counter or allocate.
    checks: bool,
    body: Body,
}

pub struct CompiledCode {
    ops: Vec<Op>,
    labels: HashMap<usize, usize>,
}

impl CompiledCode {
    /// Op index for a resumable bytecode offset.
    pub fn entry(&self, ip: usize) -> Option<usize> {
        self.labels.get(&ip).copied()
    }

    pub fn label_offsets(&self) -> Vec<usize> {
        let mut offsets: Vec<usize> = self.labels.keys().copied().collect();
        offsets.sort();
        offsets
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn run(self: &Rc<Self>, vm: &mut Interpreter, entry: usize) {
        let context = vm.active_context();
        let mut index = entry;
        while let Some(op) = self.ops.get(index) {
            debug_assert_eq!(vm.ip(), op.ip);
            vm.set_ip(op.next_ip);
            vm.count_cycle();
            let flow = (op.body)(vm);
            if op.checks && vm.jit_must_exit(context, self) {
                return;
            }
            index = match flow {
                Flow::Next => index + 1,
                Flow::Goto(ip) => match self.entry(ip) {
                    Some(target) => target,
                    None => return,
                },
                Flow::Exit => return,
            };
        }
    }
}

/// Compiled-code cache plus the activation counts that decide what to compile.
pub struct Compiler {
    enabled: bool,
    single_step: bool,
    threshold: u32,
    counts: HashMap<ObjectId, u32>,
    cache: HashMap<ObjectId, Rc<CompiledCode>>,
}

impl Compiler {
    pub fn new(config: &VmConfig) -> Self {
        Compiler {
            enabled: config.jit,
            single_step: false,
            threshold: config.jit_threshold.max(1),
            counts: HashMap::new(),
            cache: HashMap::new(),
        }
    }

    pub fn lookup(&self, method: OOP) -> Option<Rc<CompiledCode>> {
        self.cache.get(&method.as_oid()?).cloned()
    }

    /// Count an activation, compiling the method when it becomes hot.
    pub fn note_activation(&mut self, memory: &ObjectMemory, method: OOP) {
        if !self.enabled || self.single_step {
            return;
        }
        let id = match method.as_oid() {
            Some(id) => id,
            None => return,
        };
        let count = self.counts.entry(id).or_insert(0);
        *count = count.saturating_add(1);
        // exactly once: a method that fails to compile is not retried
        if *count == self.threshold {
            if let Some(code) = compile(memory, method) {
                debug!("compiled {:?}: {} ops, {} entries", method, code.len(), code.labels.len());
                self.cache.insert(id, Rc::new(code));
            }
        }
    }

    /// Single-stepping runs everything through the interpreter.
    pub fn set_single_step(&mut self, on: bool) {
        self.single_step = on;
        if on {
            self.flush();
        }
    }

    pub fn flush(&mut self) {
        self.cache.clear();
        self.counts.clear();
    }

    pub fn flush_method(&mut self, method: OOP) {
        if let Some(id) = method.as_oid() {
            self.cache.remove(&id);
            self.counts.remove(&id);
        }
    }

    /// Drop entries for methods that did not survive a collection.
    pub fn purge(&mut self, memory: &ObjectMemory) {
        self.cache.retain(|&id, _| memory.is_live(id));
        self.counts.retain(|&id, _| memory.is_live(id));
    }
}

/// Translate a method. `None` for anything that is not a method or holds an illegal bytecode.
pub fn compile(memory: &ObjectMemory, method: OOP) -> Option<CompiledCode> {
    let header = memory.method_header(method)?;
    let bytes = memory.bytes(method);

    let mut decoded = Vec::new();
    let mut labels = vec![0];
    let mut ip = 0;
    while ip < bytes.len() {
        let (insn, size) = decode_insn(bytes, ip, header.sista);
        if let Insn::Illegal(_) = insn {
            return None;
        }
        let next_ip = ip + size;
        if let Some(offset) = insn.jump_offset() {
            labels.push((next_ip as isize + offset) as usize);
            labels.push(next_ip);
        }
        if let Insn::PushClosure { block_size, .. } = insn {
            labels.push(next_ip);
            labels.push(next_ip + block_size);
        }
        if !is_simple(insn) {
            labels.push(next_ip);
        }
        decoded.push((ip, next_ip, insn));
        ip = next_ip;
    }

    let mut ops = Vec::with_capacity(decoded.len());
    let mut label_map = HashMap::new();
    for (index, &(ip, next_ip, insn)) in decoded.iter().enumerate() {
        if labels.contains(&ip) {
            label_map.insert(ip, index);
        }
        ops.push(Op {
            ip,
            next_ip,
            checks: !is_simple(insn),
            body: translate(insn, ip, next_ip),
        });
    }
    Some(CompiledCode {
        ops,
        labels: label_map,
    })
}

/// Instructions that only move values between the stack and the frame.
fn is_simple(insn: Insn) -> bool {
    match insn {
        Insn::PushReceiverVar(_)
        | Insn::PushTemporary(_)
        | Insn::PushConst(_)
        | Insn::PushLiteralConst(_)
        | Insn::PushReceiver
        | Insn::PopTemporary(_)
        | Insn::StoreTemporary(_)
        | Insn::Pop
        | Insn::Dup
        | Insn::Nop
        | Insn::CallPrimitive(_) => true,
        _ => false,
    }
}

fn translate(insn: Insn, ip: usize, next_ip: usize) -> Body {
    match insn {
        Insn::PushReceiverVar(i) => Box::new(move |vm: &mut Interpreter| {
            let value = vm.memory.get_ptr(vm.receiver(), i);
            vm.push(value);
            Flow::Next
        }),
        Insn::PushTemporary(i) => Box::new(move |vm: &mut Interpreter| {
            let value = vm.temp(i);
            vm.push(value);
            Flow::Next
        }),
        Insn::PushConst(oop) => Box::new(move |vm: &mut Interpreter| {
            vm.push(oop);
            Flow::Next
        }),
        Insn::PushLiteralConst(i) => Box::new(move |vm: &mut Interpreter| {
            let value = vm.literal(i);
            vm.push(value);
            Flow::Next
        }),
        Insn::PushReceiver => Box::new(|vm: &mut Interpreter| {
            let receiver = vm.receiver();
            vm.push(receiver);
            Flow::Next
        }),
        Insn::PopTemporary(i) => Box::new(move |vm: &mut Interpreter| {
            let value = vm.pop();
            vm.set_temp(i, value);
            Flow::Next
        }),
        Insn::StoreTemporary(i) => Box::new(move |vm: &mut Interpreter| {
            let value = vm.stack_top();
            vm.set_temp(i, value);
            Flow::Next
        }),
        Insn::Pop => Box::new(|vm: &mut Interpreter| {
            vm.pop();
            Flow::Next
        }),
        Insn::Dup => Box::new(|vm: &mut Interpreter| {
            let value = vm.stack_top();
            vm.push(value);
            Flow::Next
        }),
        Insn::Nop | Insn::CallPrimitive(_) => Box::new(|_: &mut Interpreter| Flow::Next),
        Insn::Jump(offset) => {
            let target = (next_ip as isize + offset) as usize;
            Box::new(move |vm: &mut Interpreter| {
                vm.jump(offset);
                Flow::Goto(target)
            })
        }
        Insn::SendSpecial(index) if index < 8 => Box::new(move |vm: &mut Interpreter| {
            let (receiver, arg) = (vm.stack_value(1), vm.stack_value(0));
            match small_integer_op(index, receiver, arg) {
                Some(result) => {
                    vm.popn(2);
                    vm.push(result);
                    Flow::Next
                }
                None => {
                    vm.send_special(index);
                    follow(vm, next_ip)
                }
            }
        }),
        Insn::Trap => Box::new(move |vm: &mut Interpreter| {
            vm.dispatch(insn, ip);
            Flow::Exit
        }),
        _ => Box::new(move |vm: &mut Interpreter| {
            vm.dispatch(insn, ip);
            follow(vm, next_ip)
        }),
    }
}

/// Straight on when the instruction left the ip where it was, otherwise to wherever it went.
fn follow(vm: &Interpreter, next_ip: usize) -> Flow {
    if vm.ip() == next_ip {
        Flow::Next
    } else {
        Flow::Goto(vm.ip())
    }
}

/// The arithmetic and comparison special selectors when both operands are SmallIntegers and
/// the result is one too.
fn small_integer_op(index: usize, receiver: OOP, arg: OOP) -> Option<OOP> {
    let (a, b) = match (receiver, arg) {
        (OOP::Int(a), OOP::Int(b)) => (a as i64, b as i64),
        _ => return None,
    };
    let result = match index {
        0 => return OOP::try_from_integer(a + b),
        1 => return OOP::try_from_integer(a - b),
        2 => a < b,
        3 => a > b,
        4 => a <= b,
        5 => a >= b,
        6 => a == b,
        7 => a != b,
        _ => return None,
    };
    Some(Interpreter::bool_oop(result))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objectmemory::builder::{MemoryBuilder, MethodSpec};
    use crate::objectmemory::{MemoryKind, FALSE_PTR, TRUE_PTR};

    /// sumTo: n  | sum i | sum := 0. i := 1. [i <= n] whileTrue: [sum := sum + i. i := i + 1]. ^sum
    const SUM_TO: [u8; 21] = [
        0x75, 0x69, 0x76, 0x6A, // sum := 0. i := 1
        0x12, 0x10, 0xB4, 0xAC, 10, // loop: i <= n, jump false to the end
        0x11, 0x12, 0xB0, 0x69, // sum := sum + i
        0x12, 0x76, 0xB0, 0x6A, // i := i + 1
        0xA3, 0xF1, // back to loop
        0x11, 0x7C, // ^sum
    ];

    fn sum_method(builder: &mut MemoryBuilder) -> OOP {
        let class = builder.class_named("UndefinedObject");
        builder.define_method(class, "sumTo:", MethodSpec::new(&SUM_TO).args(1).temps(3))
    }

    #[test]
    fn labels_cover_jumps_and_sends() {
        let mut builder = MemoryBuilder::new(MemoryKind::V3);
        let method = sum_method(&mut builder);
        let memory = builder.build();
        let code = compile(&memory, method).unwrap();
        let labels = code.label_offsets();
        for offset in &[0, 4, 7, 9, 12, 16, 19] {
            assert!(labels.contains(offset), "missing label at {}", offset);
        }
        assert_eq!(code.len(), 19);
    }

    #[test]
    fn illegal_bytecodes_are_not_compiled() {
        let mut builder = MemoryBuilder::new(MemoryKind::Spur);
        let class = builder.class_named("UndefinedObject");
        // 0x7E is unassigned in the V3 set
        let method = builder.define_method(class, "broken", MethodSpec::new(&[0x7E, 0x7C]));
        let memory = builder.build();
        assert!(compile(&memory, method).is_none());
    }

    #[test]
    fn small_integer_fast_path() {
        assert_eq!(small_integer_op(0, OOP::Int(2), OOP::Int(3)), Some(OOP::Int(5)));
        assert_eq!(small_integer_op(4, OOP::Int(2), OOP::Int(3)), Some(TRUE_PTR));
        assert_eq!(small_integer_op(6, OOP::Int(2), OOP::Int(3)), Some(FALSE_PTR));
        assert_eq!(small_integer_op(0, OOP::Int(0x3FFF_FFFF), OOP::Int(1)), None);
    }

    #[test]
    fn compiled_and_interpreted_runs_agree() {
        let mut results = Vec::new();
        for &jit in &[false, true] {
            let mut builder = MemoryBuilder::new(MemoryKind::V3);
            let method = sum_method(&mut builder);
            let selector = builder.symbol("sumTo:");
            let config = VmConfig {
                jit,
                jit_threshold: 1,
                ..VmConfig::default()
            };
            let mut interp = Interpreter::boot(builder.build(), config).unwrap();
            let first = interp
                .evaluate(crate::objectmemory::NIL_PTR, selector, &[OOP::Int(100)])
                .unwrap();
            let second = interp
                .evaluate(crate::objectmemory::NIL_PTR, selector, &[OOP::Int(40_000)])
                .unwrap();
            assert_eq!(interp.compiler().lookup(method).is_some(), jit);
            results.push((first, second));
        }
        assert_eq!(results[0], results[1]);
        assert_eq!(results[0].0, OOP::Int(5050));
    }
}
