//! Clocks, caches, snapshots and VM queries.

use std::path::PathBuf;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use log::{info, warn};

use super::*;
use crate::objectmemory::image::save_image;
use crate::objectmemory::{FALSE_PTR, NIL_PTR, TRUE_PTR};
use crate::utils::SMALLTALK_EPOCH_OFFSET;

impl Interpreter {
    pub(super) fn dispatch_prim_system(&mut self, index: usize) -> Option<()> {
        match index {
            89 => self.prim_flush_cache(),
            97 => self.prim_snapshot(),
            110 => {
                let arg = self.stack_value(0);
                let receiver = self.stack_value(1);
                self.pop_then_push(2, Self::bool_oop(receiver == arg));
                Some(())
            }
            111 => {
                let class = self.memory.get_class_of(self.stack_top());
                self.pop_then_push(1, class);
                Some(())
            }
            112 => {
                let left = self.memory.bytes_left() as u64;
                let left = self.positive_oop(left);
                self.pop_then_push(1, left);
                Some(())
            }
            113 => self.prim_quit(),
            114 => {
                self.backtrace();
                Some(())
            }
            116 => self.prim_flush_cache_by_method(),
            119 => self.prim_flush_cache_selective(),
            121 => self.prim_image_name(),
            124 => self.prim_set_special(THE_LOW_SPACE_SEMAPHORE),
            125 => {
                let bytes = self.positive_value_of(self.stack_top())?;
                self.low_space_threshold = bytes as usize;
                self.popn(1);
                Some(())
            }
            129 => {
                let specials = self.memory.special_objects();
                self.pop_then_push(1, specials);
                Some(())
            }
            130 | 131 => {
                self.collect_garbage(index == 130);
                let left = self.memory.bytes_left() as u64;
                let left = self.positive_oop(left);
                self.pop_then_push(1, left);
                Some(())
            }
            // setInterruptKey: has no keyboard to watch
            133 => {
                self.popn(1);
                Some(())
            }
            134 => self.prim_set_special(THE_INTERRUPT_SEMAPHORE),
            135 => {
                let now = OOP::Int(self.millisecond_clock() as i32);
                self.pop_then_push(1, now);
                Some(())
            }
            136 => self.prim_signal_at_milliseconds(),
            137 => {
                let seconds = unix_micros() / 1_000_000 + SMALLTALK_EPOCH_OFFSET;
                let seconds = self.positive_oop(seconds);
                self.pop_then_push(1, seconds);
                Some(())
            }
            230 => self.prim_relinquish_processor(),
            // local time is reported as UTC
            240 | 241 => {
                let micros = unix_micros() + SMALLTALK_EPOCH_OFFSET * 1_000_000;
                let micros = self.positive_oop(micros);
                self.pop_then_push(1, micros);
                Some(())
            }
            242 => self.prim_signal_at_utc_microseconds(),
            254 => self.prim_vm_parameter(),
            _ => self.fail(PRIM_ERR_UNSUPPORTED),
        }
    }

    fn prim_flush_cache(&mut self) -> Option<()> {
        self.flush_method_cache();
        self.compiler.flush();
        self.jit_code = None;
        Some(())
    }

    fn prim_flush_cache_by_method(&mut self) -> Option<()> {
        let method = self.stack_top();
        if !self.memory.is_method(method) {
            return self.fail(PRIM_ERR_BAD_RECEIVER);
        }
        self.flush_method_cache_for(|_, &cached| cached == method);
        self.compiler.flush_method(method);
        self.jit_code = self.compiler.lookup(self.method);
        Some(())
    }

    fn prim_flush_cache_selective(&mut self) -> Option<()> {
        let selector = self.stack_top();
        self.flush_method_cache_for(|&cached, _| cached == selector);
        Some(())
    }

    /// Install the argument (a Semaphore or nil) as one of the well-known semaphores.
    fn prim_set_special(&mut self, index: usize) -> Option<()> {
        let semaphore = self.stack_top();
        if !semaphore.is_nil() {
            self.check_class(semaphore, CLASS_SEMAPHORE)?;
        }
        self.memory.set_special(index, semaphore);
        self.popn(1);
        Some(())
    }

    /// imageName, or imageName: aString.
    fn prim_image_name(&mut self) -> Option<()> {
        if self.argument_count == 1 {
            let name = self.stack_top();
            if !self.memory.is_bytes(name) {
                return self.fail(PRIM_ERR_BAD_ARGUMENT);
            }
            self.config.image_name = PathBuf::from(self.memory.string_of(name).into_owned());
            self.popn(1);
            return Some(());
        }
        let name = self.config.image_name.to_string_lossy().into_owned();
        let string = self.memory.new_string(&name);
        self.pop_then_push(1, string);
        Some(())
    }

    fn prim_quit(&mut self) -> Option<()> {
        if self.config.ignore_quit {
            warn!("ignoring quit request");
            return Some(());
        }
        info!("image quit after {} cycles", self.cycle);
        self.quit = true;
        self.break_out = true;
        Some(())
    }

    /// Write the heap to the image file. The saved image resumes with true on the stack; the
    /// running one continues with false.
    fn prim_snapshot(&mut self) -> Option<()> {
        let receiver = self.stack_top();
        self.pop_then_push(1, TRUE_PTR);
        self.save_ctx();
        let process = self.active_process();
        self.memory
            .put_ptr(process, PROCESS_SUSPENDED_CONTEXT_INDEX, self.active_context);
        self.collect_garbage(true);

        let path = self.config.image_name.clone();
        let result = save_image(&path, &self.memory);
        let process = self.active_process();
        self.memory
            .put_ptr(process, PROCESS_SUSPENDED_CONTEXT_INDEX, NIL_PTR);
        match result {
            Ok(()) => {
                info!("snapshot written to {}", path.display());
                self.pop_then_push(1, FALSE_PTR);
                Some(())
            }
            Err(err) => {
                warn!("snapshot to {} failed: {}", path.display(), err);
                self.pop_then_push(1, receiver);
                self.fail(PRIM_ERR_GENERIC)
            }
        }
    }

    /// signal: aSemaphore atMilliseconds: tick. A nil semaphore disarms the timer.
    fn prim_signal_at_milliseconds(&mut self) -> Option<()> {
        let tick = self.stack_value(0).try_as_integer()?;
        let semaphore = self.stack_value(1);
        self.arm_timer(semaphore, tick.max(1) as u32 & 0x1FFF_FFFF)
    }

    /// signal: aSemaphore atUTCMicroseconds: usecs, converted onto the millisecond clock.
    fn prim_signal_at_utc_microseconds(&mut self) -> Option<()> {
        let usecs = self.positive_value_of(self.stack_value(0))?;
        let semaphore = self.stack_value(1);
        let now = unix_micros() + SMALLTALK_EPOCH_OFFSET * 1_000_000;
        let delay_ms = usecs.saturating_sub(now) / 1000;
        let tick = (self.millisecond_clock() as u64 + delay_ms).max(1);
        self.arm_timer(semaphore, (tick & 0x1FFF_FFFF) as u32)
    }

    fn arm_timer(&mut self, semaphore: OOP, tick: u32) -> Option<()> {
        if semaphore.is_nil() {
            self.memory.set_special(THE_TIMER_SEMAPHORE, NIL_PTR);
            self.next_wakeup_tick = 0;
        } else {
            self.check_class(semaphore, CLASS_SEMAPHORE)?;
            self.memory.set_special(THE_TIMER_SEMAPHORE, semaphore);
            self.next_wakeup_tick = tick.max(1);
        }
        self.popn(2);
        Some(())
    }

    /// relinquishProcessorForMicroseconds: hands control back to the host until the timer
    /// is due or the requested time has passed.
    fn prim_relinquish_processor(&mut self) -> Option<()> {
        let micros = self.stack_top().try_as_integer()?.max(0) as u64;
        let mut deadline = Instant::now() + Duration::from_micros(micros);
        if self.next_wakeup_tick != 0 {
            let due = self.next_wakeup_tick.saturating_sub(self.millisecond_clock());
            deadline = deadline.min(Instant::now() + Duration::from_millis(due as u64));
        }
        self.idle = Some(Some(deadline));
        self.break_out = true;
        self.popn(1);
        Some(())
    }

    /// vmParameterAt: and vmParameterAt:put:. Unknown parameters answer nil; setting answers
    /// the previous value.
    fn prim_vm_parameter(&mut self) -> Option<()> {
        let argc = self.argument_count;
        if argc == 0 {
            return self.fail(PRIM_ERR_BAD_NUM_ARGS);
        }
        let index = self.stack_value(argc - 1).try_as_integer()?;
        let current = self.vm_parameter(index);
        if argc == 2 {
            let value = self.stack_top();
            match index {
                3 => self.config.memory_limit = self.positive_value_of(value)? as usize,
                5 => self.config.young_space_limit = self.positive_value_of(value)? as usize,
                6 => self.config.tenure_threshold = self.positive_value_of(value)? as usize,
                _ => {}
            }
            self.memory.configure(&self.config);
        }
        self.pop_then_push(argc + 1, current);
        Some(())
    }

    fn vm_parameter(&mut self, index: i64) -> OOP {
        let stats = self.memory.stats().clone();
        let value = match index {
            1 | 2 => self.memory.bytes_in_use() as u64,
            3 => self.config.memory_limit as u64,
            5 => self.config.young_space_limit as u64,
            6 => self.config.tenure_threshold as u64,
            7 => stats.full_gcs,
            8 => stats.full_gc_time.as_millis() as u64,
            9 => stats.partial_gcs,
            10 => stats.partial_gc_time.as_millis() as u64,
            11 => stats.tenured,
            40 => 4,
            41 => self.memory.info().version as u64,
            _ => return NIL_PTR,
        };
        self.positive_oop(value)
    }
}

fn unix_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_micros() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use crate::config::VmConfig;
    use crate::interpreter::Interpreter;
    use crate::objectmemory::builder::MemoryBuilder;
    use crate::objectmemory::specials::*;
    use crate::objectmemory::{load_image, MemoryKind, NIL_PTR, OOP};

    fn interpreter(config: VmConfig) -> Interpreter {
        let memory = MemoryBuilder::new(MemoryKind::V3).build();
        Interpreter::boot(memory, config).unwrap()
    }

    fn run(interp: &mut Interpreter, index: usize, stack: &[OOP]) -> Option<OOP> {
        for &oop in stack {
            interp.push(oop);
        }
        interp.argument_count = stack.len() - 1;
        let result = interp.dispatch_prim(index);
        result.map(|_| interp.pop())
    }

    #[test]
    fn quit_is_ignored_when_configured() {
        let mut interp = interpreter(VmConfig {
            ignore_quit: true,
            ..VmConfig::default()
        });
        assert!(run(&mut interp, 113, &[NIL_PTR]).is_some());
        assert!(!interp.has_quit());

        let mut interp = interpreter(VmConfig::default());
        run(&mut interp, 113, &[NIL_PTR]);
        assert!(interp.has_quit());
    }

    #[test]
    fn vm_parameters() {
        let mut interp = interpreter(VmConfig::default());
        assert_eq!(run(&mut interp, 254, &[NIL_PTR, OOP::Int(40)]), Some(OOP::Int(4)));
        assert_eq!(run(&mut interp, 254, &[NIL_PTR, OOP::Int(99)]), Some(NIL_PTR));
        let old = run(&mut interp, 254, &[NIL_PTR, OOP::Int(6), OOP::Int(1234)]);
        assert_eq!(old, Some(OOP::Int(200_000)));
        assert_eq!(interp.config().tenure_threshold, 1234);
    }

    #[test]
    fn timer_is_armed_and_disarmed() {
        let mut interp = interpreter(VmConfig::default());
        let class = interp.memory.special(CLASS_SEMAPHORE);
        let semaphore = interp.memory.instantiate_class(class, 0).unwrap();
        run(&mut interp, 136, &[NIL_PTR, semaphore, OOP::Int(5000)]);
        assert_eq!(interp.next_wakeup_tick, 5000);
        assert_eq!(interp.memory.special(THE_TIMER_SEMAPHORE), semaphore);
        run(&mut interp, 136, &[NIL_PTR, NIL_PTR, OOP::Int(0)]);
        assert_eq!(interp.next_wakeup_tick, 0);
    }

    #[test]
    fn image_name_can_be_changed() {
        let mut interp = interpreter(VmConfig::default());
        let name = interp.memory.new_string("other.image");
        run(&mut interp, 121, &[NIL_PTR, name]);
        let answer = run(&mut interp, 121, &[NIL_PTR]).unwrap();
        assert_eq!(interp.memory.string_of(answer), "other.image");
    }

    #[test]
    fn snapshot_writes_a_loadable_image() {
        let path = std::env::temp_dir().join(format!("stvm-snapshot-{}.image", std::process::id()));
        let mut interp = interpreter(VmConfig {
            image_name: path.clone(),
            ..VmConfig::default()
        });
        assert_eq!(run(&mut interp, 97, &[NIL_PTR]), Some(crate::objectmemory::FALSE_PTR));
        let process = interp.active_process();
        assert!(interp
            .memory
            .get_ptr(process, PROCESS_SUSPENDED_CONTEXT_INDEX)
            .is_nil());

        let reloaded = load_image(&path).unwrap();
        assert_eq!(reloaded.kind(), MemoryKind::V3);
        std::fs::remove_file(&path).unwrap();
    }
}
