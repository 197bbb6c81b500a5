use std::cell::RefCell;
use std::collections::HashMap;
use std::path::Path;
use std::rc::Rc;
use std::time::Instant;

use log::info;

use super::plugins::ModuleRegistry;
use super::{Interpreter, MethodCacheEntry, METHOD_CACHE_SIZE};
use crate::compiler::Compiler;
use crate::config::VmConfig;
use crate::error::VmError;
use crate::objectmemory::specials::PROCESS_SUSPENDED_CONTEXT_INDEX;
use crate::objectmemory::{load_image, ObjectMemory, NIL_PTR};

impl Interpreter {
    /// Take over a loaded heap and resume its active process.
    pub fn boot(mut memory: ObjectMemory, config: VmConfig) -> Result<Self, VmError> {
        memory.configure(&config);
        let now = Instant::now();
        let reset = config.fixed_interrupt_interval.map_or(1000, |fixed| fixed as i32);
        let mut interp = Interpreter {
            memory,
            active_context: NIL_PTR,
            home_context: NIL_PTR,
            method: NIL_PTR,
            receiver: NIL_PTR,
            ip: 0,
            sp: 0,
            pc_bias: 0,
            sista: false,
            jit_code: None,
            cycle: 0,
            message_selector: NIL_PTR,
            argument_count: 0,
            lookup_class: NIL_PTR,
            new_method: NIL_PTR,
            primitive_index: 0,
            prim_fail_code: 0,
            method_cache: vec![MethodCacheEntry::default(); METHOD_CACHE_SIZE],
            free_contexts: [Vec::new(), Vec::new()],
            reclaimable_contexts: 0,
            startup_time: now,
            interrupt_check_counter: reset,
            interrupt_check_reset: reset,
            last_tick: 0,
            next_wakeup_tick: 0,
            break_out_at: now,
            break_out: false,
            idle: None,
            interrupt_pending: false,
            signal_low_space: false,
            low_space_threshold: config.low_space_threshold,
            pending_finalizations: 0,
            semaphores_to_signal: Vec::new(),
            held_objects: Rc::new(RefCell::new(Vec::new())),
            remappable: Vec::new(),
            modules: ModuleRegistry::default(),
            named_primitives: HashMap::new(),
            compiler: Compiler::new(&config),
            quit: false,
            fatal_error: None,
            config,
        };

        let process = interp.active_process();
        let context = interp
            .memory
            .get_ptr(process, PROCESS_SUSPENDED_CONTEXT_INDEX);
        if context.is_nil() || !interp.is_context(context) {
            return Err(VmError::BadContext(format!(
                "active process {} has no suspended context",
                interp.obj_name(process)
            )));
        }
        interp
            .memory
            .put_ptr(process, PROCESS_SUSPENDED_CONTEXT_INDEX, NIL_PTR);
        interp.active_context = context;
        interp.load_ctx();
        info!(
            "booted {:?} image: {} objects, resuming {}",
            interp.memory.kind(),
            interp.memory.object_count(),
            interp.obj_name(context)
        );
        Ok(interp)
    }

    /// Read an image file and boot it.
    pub fn load<P: AsRef<Path>>(path: P, mut config: VmConfig) -> Result<Self, VmError> {
        let path = path.as_ref();
        info!("loading {}", path.display());
        let memory = load_image(path)?;
        config.image_name = path.to_path_buf();
        Interpreter::boot(memory, config)
    }
}
