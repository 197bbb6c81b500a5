//! Processes, semaphores and the periodic interrupt check.

use std::time::Instant;

use log::debug;

use super::Interpreter;
use crate::error::VmError;
use crate::objectmemory::specials::*;
use crate::objectmemory::{NIL_PTR, OOP};

const MILLISECOND_CLOCK_MASK: u32 = 0x1FFF_FFFF;

impl Interpreter {
    pub(crate) fn millisecond_clock(&self) -> u32 {
        (self.startup_time.elapsed().as_millis() as u64 & MILLISECOND_CLOCK_MASK as u64) as u32
    }

    /// Make the next bytecode run the interrupt check.
    pub(crate) fn force_interrupt_check(&mut self) {
        self.interrupt_check_counter = 0;
    }

    pub(crate) fn check_for_interrupts(&mut self) {
        let now = self.millisecond_clock();
        if now < self.last_tick {
            // the clock wrapped; keep the timer deadline the same distance away
            if self.next_wakeup_tick != 0 {
                let remaining = self.next_wakeup_tick.saturating_sub(self.last_tick);
                self.next_wakeup_tick = (now + remaining).max(1);
            }
        }
        self.adjust_interrupt_counter(now);
        self.last_tick = now;

        if self.signal_low_space {
            self.signal_low_space = false;
            let semaphore = self.memory.special(THE_LOW_SPACE_SEMAPHORE);
            self.synchronous_signal(semaphore);
        }
        if self.interrupt_pending {
            self.interrupt_pending = false;
            let semaphore = self.memory.special(THE_INTERRUPT_SEMAPHORE);
            self.synchronous_signal(semaphore);
        }
        if self.next_wakeup_tick != 0 && now >= self.next_wakeup_tick {
            self.next_wakeup_tick = 0;
            let semaphore = self.memory.special(THE_TIMER_SEMAPHORE);
            self.synchronous_signal(semaphore);
        }
        if self.pending_finalizations > 0 {
            self.pending_finalizations = 0;
            let semaphore = self.memory.special(THE_FINALIZATION_SEMAPHORE);
            self.synchronous_signal(semaphore);
        }
        if !self.semaphores_to_signal.is_empty() {
            let external = self.memory.special(EXTERNAL_OBJECTS_ARRAY);
            for index in std::mem::replace(&mut self.semaphores_to_signal, Vec::new()) {
                if let Some(semaphore) = self.memory.fetch_pointer(external, index - 1) {
                    self.synchronous_signal(semaphore);
                }
            }
        }
        if Instant::now() >= self.break_out_at {
            self.break_out = true;
        }
    }

    /// Steer the reset value so checks land about `interrupt_check_ms` apart.
    fn adjust_interrupt_counter(&mut self, now: u32) {
        if let Some(fixed) = self.config.fixed_interrupt_interval {
            self.interrupt_check_counter = fixed as i32;
            return;
        }
        let elapsed = now.wrapping_sub(self.last_tick) & MILLISECOND_CLOCK_MASK;
        if elapsed < self.config.interrupt_check_ms {
            self.interrupt_check_reset += 10;
        } else if self.interrupt_check_reset <= 1000 {
            self.interrupt_check_reset = 1000;
        } else {
            self.interrupt_check_reset -= 12;
        }
        self.interrupt_check_counter = self.interrupt_check_reset;
    }

    /// Queue an external semaphore (1-based index into the external objects array).
    pub fn signal_semaphore_with_index(&mut self, index: usize) {
        if index > 0 {
            self.semaphores_to_signal.push(index);
            self.force_interrupt_check();
        }
    }

    /// Flag a user interrupt, as the host does on a keyboard interrupt.
    pub fn signal_interrupt(&mut self) {
        self.interrupt_pending = true;
        self.force_interrupt_check();
    }

    pub(crate) fn is_empty_list(&self, list: OOP) -> bool {
        self.memory.get_ptr(list, LIST_FIRST_LINK_INDEX).is_nil()
    }

    pub(crate) fn link_process_to_list(&mut self, process: OOP, list: OOP) {
        if self.is_empty_list(list) {
            self.memory.put_ptr(list, LIST_FIRST_LINK_INDEX, process);
        } else {
            let last = self.memory.get_ptr(list, LIST_LAST_LINK_INDEX);
            self.memory.put_ptr(last, PROCESS_NEXT_LINK_INDEX, process);
        }
        self.memory.put_ptr(list, LIST_LAST_LINK_INDEX, process);
        self.memory.put_ptr(process, PROCESS_MY_LIST_INDEX, list);
    }

    pub(crate) fn remove_first_link_of_list(&mut self, list: OOP) -> OOP {
        let first = self.memory.get_ptr(list, LIST_FIRST_LINK_INDEX);
        let last = self.memory.get_ptr(list, LIST_LAST_LINK_INDEX);
        if first == last {
            self.memory.put_ptr(list, LIST_FIRST_LINK_INDEX, NIL_PTR);
            self.memory.put_ptr(list, LIST_LAST_LINK_INDEX, NIL_PTR);
        } else {
            let next = self.memory.get_ptr(first, PROCESS_NEXT_LINK_INDEX);
            self.memory.put_ptr(list, LIST_FIRST_LINK_INDEX, next);
        }
        self.memory.put_ptr(first, PROCESS_NEXT_LINK_INDEX, NIL_PTR);
        self.memory.put_ptr(first, PROCESS_MY_LIST_INDEX, NIL_PTR);
        first
    }

    /// Unlink `process` from wherever it sits in `list`. False when it is not there.
    pub(crate) fn remove_process_from_list(&mut self, process: OOP, list: OOP) -> bool {
        let first = self.memory.get_ptr(list, LIST_FIRST_LINK_INDEX);
        let last = self.memory.get_ptr(list, LIST_LAST_LINK_INDEX);
        if first == process {
            let next = self.memory.get_ptr(process, PROCESS_NEXT_LINK_INDEX);
            self.memory.put_ptr(list, LIST_FIRST_LINK_INDEX, next);
            if last == process {
                self.memory.put_ptr(list, LIST_LAST_LINK_INDEX, NIL_PTR);
            }
        } else {
            let mut previous = first;
            loop {
                if previous.is_nil() {
                    return false;
                }
                let next = self.memory.get_ptr(previous, PROCESS_NEXT_LINK_INDEX);
                if next == process {
                    break;
                }
                previous = next;
            }
            let after = self.memory.get_ptr(process, PROCESS_NEXT_LINK_INDEX);
            self.memory.put_ptr(previous, PROCESS_NEXT_LINK_INDEX, after);
            if last == process {
                self.memory.put_ptr(list, LIST_LAST_LINK_INDEX, previous);
            }
        }
        self.memory.put_ptr(process, PROCESS_NEXT_LINK_INDEX, NIL_PTR);
        self.memory.put_ptr(process, PROCESS_MY_LIST_INDEX, NIL_PTR);
        true
    }

    fn priority_of(&self, process: OOP) -> usize {
        self.memory
            .get_ptr(process, PROCESS_PRIORITY_INDEX)
            .try_as_integer()
            .unwrap_or(1)
            .max(1) as usize
    }

    pub(crate) fn put_to_sleep(&mut self, process: OOP) {
        let lists = self
            .memory
            .get_ptr(self.scheduler(), SCHEDULER_PROCESS_LISTS_INDEX);
        let priority = self.priority_of(process);
        let list = self.memory.get_ptr(lists, priority - 1);
        self.link_process_to_list(process, list);
    }

    /// Switch to `process`, parking the active context in the old one.
    pub(crate) fn transfer_to(&mut self, process: OOP) {
        let scheduler = self.scheduler();
        let old = self.active_process();
        self.save_ctx();
        self.memory
            .put_ptr(old, PROCESS_SUSPENDED_CONTEXT_INDEX, self.active_context);
        self.memory
            .put_ptr(scheduler, SCHEDULER_ACTIVE_PROCESS_INDEX, process);
        let context = self
            .memory
            .get_ptr(process, PROCESS_SUSPENDED_CONTEXT_INDEX);
        self.memory
            .put_ptr(process, PROCESS_SUSPENDED_CONTEXT_INDEX, NIL_PTR);
        self.reclaimable_contexts = 0;
        debug!("process switch {:?} -> {:?}", old, process);
        self.active_context = context;
        self.load_ctx();
    }

    pub(crate) fn wake_highest_priority(&mut self) -> OOP {
        let lists = self
            .memory
            .get_ptr(self.scheduler(), SCHEDULER_PROCESS_LISTS_INDEX);
        let mut priority = self.memory.slot_count(lists);
        while priority > 0 {
            let list = self.memory.get_ptr(lists, priority - 1);
            if !self.is_empty_list(list) {
                return self.remove_first_link_of_list(list);
            }
            priority -= 1;
        }
        self.fatal(VmError::NoRunnableProcess);
        NIL_PTR
    }

    /// Make `process` runnable, preempting the active process if it has lower priority.
    pub(crate) fn resume(&mut self, process: OOP) {
        let active = self.active_process();
        if self.priority_of(process) > self.priority_of(active) {
            self.put_to_sleep(active);
            self.transfer_to(process);
        } else {
            self.put_to_sleep(process);
        }
    }

    pub(crate) fn synchronous_signal(&mut self, semaphore: OOP) {
        if !semaphore.is_object() || semaphore.is_nil() {
            return;
        }
        if self.is_empty_list(semaphore) {
            let excess = self
                .memory
                .get_ptr(semaphore, SEMAPHORE_EXCESS_SIGNALS_INDEX)
                .try_as_integer()
                .unwrap_or(0);
            self.memory.put_ptr(
                semaphore,
                SEMAPHORE_EXCESS_SIGNALS_INDEX,
                OOP::Int(excess as i32 + 1),
            );
        } else {
            let process = self.remove_first_link_of_list(semaphore);
            self.resume(process);
        }
    }

    /// Suspend the active process and run the best runnable one.
    fn transfer_to_highest(&mut self) {
        let next = self.wake_highest_priority();
        if !next.is_nil() {
            self.transfer_to(next);
        }
    }
}

// Process primitives
impl Interpreter {
    /// signal
    pub(crate) fn prim_signal(&mut self) -> Option<()> {
        let semaphore = self.stack_top();
        self.check_class(semaphore, CLASS_SEMAPHORE)?;
        self.synchronous_signal(semaphore);
        Some(())
    }

    /// wait
    pub(crate) fn prim_wait(&mut self) -> Option<()> {
        let semaphore = self.stack_top();
        self.check_class(semaphore, CLASS_SEMAPHORE)?;
        let excess = self
            .memory
            .get_ptr(semaphore, SEMAPHORE_EXCESS_SIGNALS_INDEX)
            .try_as_integer()?;
        if excess > 0 {
            self.memory.put_ptr(
                semaphore,
                SEMAPHORE_EXCESS_SIGNALS_INDEX,
                OOP::Int(excess as i32 - 1),
            );
        } else {
            let active = self.active_process();
            self.link_process_to_list(active, semaphore);
            self.transfer_to_highest();
        }
        Some(())
    }

    /// resume
    pub(crate) fn prim_resume(&mut self) -> Option<()> {
        let process = self.stack_top();
        if self
            .memory
            .get_ptr(process, PROCESS_SUSPENDED_CONTEXT_INDEX)
            .is_nil()
        {
            return None;
        }
        self.resume(process);
        Some(())
    }

    /// suspend
    pub(crate) fn prim_suspend(&mut self) -> Option<()> {
        let process = self.stack_top();
        if process == self.active_process() {
            self.pop_then_push(1, NIL_PTR);
            self.transfer_to_highest();
        } else {
            let list = self.memory.get_ptr(process, PROCESS_MY_LIST_INDEX);
            if list.is_nil() || !self.remove_process_from_list(process, list) {
                return None;
            }
            self.pop_then_push(1, list);
        }
        Some(())
    }

    /// yield
    pub(crate) fn prim_yield(&mut self) -> Option<()> {
        let active = self.active_process();
        let priority = self.priority_of(active);
        let lists = self
            .memory
            .get_ptr(self.scheduler(), SCHEDULER_PROCESS_LISTS_INDEX);
        let list = self.memory.get_ptr(lists, priority - 1);
        if self.is_empty_list(list) {
            return Some(());
        }
        self.put_to_sleep(active);
        self.transfer_to_highest();
        Some(())
    }

    /// exitCriticalSection
    pub(crate) fn prim_exit_critical_section(&mut self) -> Option<()> {
        let mutex = self.stack_top();
        if self.is_empty_list(mutex) {
            self.memory.put_ptr(mutex, MUTEX_OWNER_INDEX, NIL_PTR);
        } else {
            let owner = self.remove_first_link_of_list(mutex);
            self.memory.put_ptr(mutex, MUTEX_OWNER_INDEX, owner);
            self.resume(owner);
        }
        Some(())
    }

    /// enterCriticalSection: answers false when the section was free, true when the active
    /// process already owned it; otherwise waits for it.
    pub(crate) fn prim_enter_critical_section(&mut self) -> Option<()> {
        let mutex = self.stack_value(self.argument_count);
        let active = if self.argument_count > 0 {
            self.stack_top()
        } else {
            self.active_process()
        };
        let owner = self.memory.get_ptr(mutex, MUTEX_OWNER_INDEX);
        if owner.is_nil() {
            self.memory.put_ptr(mutex, MUTEX_OWNER_INDEX, active);
            self.pop_then_push(self.argument_count + 1, Self::bool_oop(false));
        } else if owner == active {
            self.pop_then_push(self.argument_count + 1, Self::bool_oop(true));
        } else {
            self.pop_then_push(self.argument_count + 1, Self::bool_oop(false));
            self.link_process_to_list(active, mutex);
            self.transfer_to_highest();
        }
        Some(())
    }

    /// testAndSetOwnershipOfCriticalSection: like enter, but answers nil instead of waiting.
    pub(crate) fn prim_test_and_set_ownership(&mut self) -> Option<()> {
        let mutex = self.stack_value(self.argument_count);
        let active = if self.argument_count > 0 {
            self.stack_top()
        } else {
            self.active_process()
        };
        let owner = self.memory.get_ptr(mutex, MUTEX_OWNER_INDEX);
        let answer = if owner.is_nil() {
            self.memory.put_ptr(mutex, MUTEX_OWNER_INDEX, active);
            Self::bool_oop(false)
        } else if owner == active {
            Self::bool_oop(true)
        } else {
            NIL_PTR
        };
        self.pop_then_push(self.argument_count + 1, answer);
        Some(())
    }

    pub(crate) fn check_class(&self, oop: OOP, special_class: usize) -> Option<()> {
        if self.memory.get_class_of(oop) == self.memory.special(special_class) {
            Some(())
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VmConfig;
    use crate::objectmemory::builder::MemoryBuilder;
    use crate::objectmemory::format::FMT_FIXED;
    use crate::objectmemory::MemoryKind;

    fn interpreter() -> Interpreter {
        let memory = MemoryBuilder::new(MemoryKind::V3).build();
        Interpreter::boot(memory, VmConfig::default()).unwrap()
    }

    fn new_semaphore(interp: &mut Interpreter) -> OOP {
        let class = interp.memory.special(CLASS_SEMAPHORE);
        interp
            .memory
            .new_pointers(class, FMT_FIXED, vec![NIL_PTR, NIL_PTR, OOP::Int(0)])
    }

    fn new_process(interp: &mut Interpreter, priority: i32) -> OOP {
        let class = interp.memory.special(CLASS_PROCESS);
        let context = interp.active_context;
        interp.memory.new_pointers(
            class,
            FMT_FIXED,
            vec![NIL_PTR, context, OOP::Int(priority), NIL_PTR],
        )
    }

    #[test]
    fn signal_without_waiters_counts_excess() {
        let mut interp = interpreter();
        let semaphore = new_semaphore(&mut interp);
        interp.synchronous_signal(semaphore);
        interp.synchronous_signal(semaphore);
        assert_eq!(
            interp.memory.get_ptr(semaphore, SEMAPHORE_EXCESS_SIGNALS_INDEX),
            OOP::Int(2)
        );
    }

    #[test]
    fn signal_resumes_higher_priority_waiter() {
        let mut interp = interpreter();
        let semaphore = new_semaphore(&mut interp);
        let waiter = new_process(&mut interp, 60);
        interp.link_process_to_list(waiter, semaphore);
        let before = interp.active_process();
        interp.synchronous_signal(semaphore);
        assert_eq!(interp.active_process(), waiter);
        assert!(interp.is_empty_list(semaphore));
        // the preempted process went back to its run queue
        assert!(!interp.memory.get_ptr(before, PROCESS_MY_LIST_INDEX).is_nil());
    }

    #[test]
    fn list_removal_keeps_links_consistent() {
        let mut interp = interpreter();
        let list = new_semaphore(&mut interp);
        let a = new_process(&mut interp, 4);
        let b = new_process(&mut interp, 4);
        let c = new_process(&mut interp, 4);
        for &p in &[a, b, c] {
            interp.link_process_to_list(p, list);
        }
        assert!(interp.remove_process_from_list(c, list));
        assert_eq!(interp.memory.get_ptr(list, LIST_LAST_LINK_INDEX), b);
        assert_eq!(interp.remove_first_link_of_list(list), a);
        assert_eq!(interp.remove_first_link_of_list(list), b);
        assert!(interp.is_empty_list(list));
        assert!(!interp.remove_process_from_list(c, list));
    }

    #[test]
    fn fixed_interval_overrides_feedback() {
        let mut config = VmConfig::default();
        config.fixed_interrupt_interval = Some(500);
        let memory = MemoryBuilder::new(MemoryKind::V3).build();
        let mut interp = Interpreter::boot(memory, config).unwrap();
        interp.check_for_interrupts();
        assert_eq!(interp.interrupt_check_counter, 500);
    }

    #[test]
    fn timer_semaphore_fires_when_due() {
        let mut interp = interpreter();
        let semaphore = new_semaphore(&mut interp);
        interp.memory.set_special(THE_TIMER_SEMAPHORE, semaphore);
        interp.next_wakeup_tick = 1;
        interp.last_tick = 0;
        std::thread::sleep(std::time::Duration::from_millis(2));
        interp.check_for_interrupts();
        assert_eq!(interp.next_wakeup_tick, 0);
        assert_eq!(
            interp.memory.get_ptr(semaphore, SEMAPHORE_EXCESS_SIGNALS_INDEX),
            OOP::Int(1)
        );
    }

    #[test]
    fn clock_wraparound_keeps_the_timer_deadline_distance() {
        let mut interp = interpreter();
        let semaphore = new_semaphore(&mut interp);
        interp.memory.set_special(THE_TIMER_SEMAPHORE, semaphore);
        interp.last_tick = MILLISECOND_CLOCK_MASK - 2000;
        interp.next_wakeup_tick = MILLISECOND_CLOCK_MASK - 1000;
        interp.check_for_interrupts();
        assert_eq!(interp.next_wakeup_tick, interp.last_tick + 1000);
        assert_eq!(
            interp.memory.get_ptr(semaphore, SEMAPHORE_EXCESS_SIGNALS_INDEX),
            OOP::Int(0)
        );
    }
}
