//! Roots, safe points and become: glue between the interpreter and the collector.

use std::cell::RefCell;
use std::rc::Rc;

use log::{debug, warn};

use super::Interpreter;
use crate::objectmemory::specials::PROCESS_SIGNALING_LOW_SPACE;
use crate::objectmemory::{BecomeError, GcReport, GcRequest, OOP};

/// Keeps objects alive across allocations in host code. Each `HeldOops` is a frame on the
/// interpreter's hold stack and is popped when dropped.
pub struct HeldOops {
    oop_list: Rc<RefCell<Vec<Vec<OOP>>>>,
}

impl HeldOops {
    pub fn new(interp: &Interpreter) -> Self {
        let oop_list = Rc::clone(&interp.held_objects);
        oop_list.borrow_mut().push(Vec::new());
        HeldOops { oop_list }
    }

    pub fn push(&self, oop: OOP) -> OOP {
        if let Some(frame) = self.oop_list.borrow_mut().last_mut() {
            frame.push(oop);
        }
        oop
    }
}

impl Drop for HeldOops {
    fn drop(&mut self) {
        self.oop_list.borrow_mut().pop();
    }
}

impl Interpreter {
    /// Everything the interpreter holds outside the heap.
    fn register_roots(&self) -> Vec<OOP> {
        let mut roots = vec![
            self.active_context,
            self.home_context,
            self.method,
            self.receiver,
            self.message_selector,
            self.lookup_class,
            self.new_method,
        ];
        for frame in self.held_objects.borrow().iter() {
            roots.extend_from_slice(frame);
        }
        roots.extend_from_slice(&self.remappable);
        roots
    }

    pub(crate) fn collect_garbage(&mut self, full: bool) -> GcReport {
        self.save_ctx();
        let roots = self.register_roots();
        let report = if full {
            self.memory.full_gc(&roots)
        } else {
            self.memory.partial_gc(&roots)
        };
        debug!(
            "{} GC: freed {}, tenured {}, {} bytes left",
            if full { "full" } else { "partial" },
            report.freed,
            report.tenured,
            self.memory.bytes_left()
        );
        self.after_gc(&report);
        report
    }

    /// Run whatever collection the memory asked for. Only called between bytecodes.
    pub(crate) fn gc_safe_point(&mut self) {
        match self.memory.gc_requested() {
            GcRequest::None => {}
            GcRequest::Partial => {
                self.collect_garbage(false);
            }
            GcRequest::Full => {
                self.collect_garbage(true);
            }
        }
    }

    /// Instantiate for a primitive: on a full heap collect once and retry, then fail with
    /// the no-memory code.
    pub(crate) fn instantiate_or_gc(&mut self, class: OOP, indexable: usize) -> Option<OOP> {
        if let Some(oop) = self.memory.try_instantiate_class(class, indexable) {
            return Some(oop);
        }
        if self.memory.class_format(class).is_some() {
            self.collect_garbage(true);
            if let Some(oop) = self.memory.try_instantiate_class(class, indexable) {
                return Some(oop);
            }
            self.prim_fail_code = super::primitives::PRIM_ERR_NO_MEMORY;
        }
        None
    }

    fn after_gc(&mut self, report: &GcReport) {
        self.flush_method_cache();
        self.free_contexts[0].clear();
        self.free_contexts[1].clear();
        let memory = &self.memory;
        self.named_primitives.retain(|&id, _| memory.is_live(id));
        self.compiler.purge(memory);

        if report.weak_cleared {
            self.pending_finalizations += 1;
            self.force_interrupt_check();
        }
        if self.low_space_threshold > 0 && self.memory.bytes_left() < self.low_space_threshold {
            // one-shot: the image re-arms it with primitive 125
            self.low_space_threshold = 0;
            self.signal_low_space = true;
            let process = self.active_process();
            self.memory.set_special(PROCESS_SIGNALING_LOW_SPACE, process);
            self.force_interrupt_check();
        }
    }

    /// Elementwise become: over two arrays, rewriting the interpreter's registers too.
    pub(crate) fn become_objects(
        &mut self,
        from: &[OOP],
        to: &[OOP],
        two_way: bool,
        copy_hash: bool,
    ) -> Result<(), BecomeError> {
        self.save_ctx();
        let mut registers = [
            self.active_context,
            self.home_context,
            self.method,
            self.receiver,
            self.message_selector,
            self.lookup_class,
            self.new_method,
        ];
        let held_count: usize = self.held_objects.borrow().iter().map(Vec::len).sum();
        let mut extra: Vec<OOP> = registers.to_vec();
        for frame in self.held_objects.borrow().iter() {
            extra.extend_from_slice(frame);
        }
        extra.extend_from_slice(&self.remappable);

        self.memory
            .bulk_become(from, to, two_way, copy_hash, &mut extra)?;

        let count = registers.len();
        registers.copy_from_slice(&extra[..count]);
        let mut rest = extra[count..].iter().copied();
        for frame in self.held_objects.borrow_mut().iter_mut() {
            for slot in frame.iter_mut() {
                if let Some(oop) = rest.next() {
                    *slot = oop;
                }
            }
        }
        for slot in self.remappable.iter_mut() {
            if let Some(oop) = rest.next() {
                *slot = oop;
            }
        }
        debug_assert_eq!(extra.len(), count + held_count + self.remappable.len());

        let [active, home, method, receiver, selector, lookup_class, new_method] = registers;
        self.active_context = active;
        self.home_context = home;
        self.method = method;
        self.receiver = receiver;
        self.message_selector = selector;
        self.lookup_class = lookup_class;
        self.new_method = new_method;

        if two_way && from.iter().any(|&oop| self.is_behavior(oop)) {
            warn!("two-way become: of classes; existing instances keep their class index");
        }
        self.flush_method_cache();
        self.compiler.flush();
        self.named_primitives.clear();
        self.free_contexts[0].clear();
        self.free_contexts[1].clear();
        self.jit_code = None;
        self.load_ctx();
        Ok(())
    }

    pub(crate) fn is_behavior(&self, oop: OOP) -> bool {
        self.memory.class_format(oop).is_some() && self.memory.slot_count(oop) > 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VmConfig;
    use crate::objectmemory::builder::MemoryBuilder;
    use crate::objectmemory::{MemoryKind, NIL_PTR};

    fn interpreter() -> Interpreter {
        let memory = MemoryBuilder::new(MemoryKind::V3).build();
        Interpreter::boot(memory, VmConfig::default()).unwrap()
    }

    #[test]
    fn held_objects_survive_collection() {
        let mut interp = interpreter();
        let held = HeldOops::new(&interp);
        let kept = held.push(interp.memory.new_array(vec![NIL_PTR; 3]));
        let dropped = interp.memory.new_array(vec![NIL_PTR; 3]);
        interp.collect_garbage(true);
        assert!(interp.memory.is_live(kept.as_oid().unwrap()));
        assert!(!interp.memory.get_obj(dropped).is_some());
        drop(held);
        assert!(interp.held_objects.borrow().is_empty());
    }

    #[test]
    fn become_rewrites_held_registers() {
        let mut interp = interpreter();
        let held = HeldOops::new(&interp);
        let a = held.push(interp.memory.new_array(vec![OOP::Int(1)]));
        let b = interp.memory.new_array(vec![OOP::Int(2)]);
        interp.become_objects(&[a], &[b], false, true).unwrap();
        let frame = interp.held_objects.borrow()[0].clone();
        assert_eq!(frame, vec![b]);
    }

    #[test]
    fn low_space_fires_once() {
        let mut interp = interpreter();
        interp.low_space_threshold = usize::max_value();
        interp.collect_garbage(true);
        assert!(interp.signal_low_space);
        assert_eq!(interp.low_space_threshold, 0);
        assert_eq!(interp.interrupt_check_counter, 0);
    }
}
