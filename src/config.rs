use std::path::PathBuf;

/// Knobs for one running VM. `Default` gives settings suitable for a desktop image.
#[derive(Clone, Debug)]
pub struct VmConfig {
    /// Hard ceiling on (approximate) heap bytes; primitive allocations beyond it fail.
    pub memory_limit: usize,
    /// Once a collection leaves less than this much headroom the low-space semaphore fires.
    pub low_space_threshold: usize,
    /// Bytes allocated in new space before a scavenge is requested.
    pub young_space_limit: usize,
    /// Young survivors that force the next collection to be a full one.
    pub tenure_threshold: usize,
    /// Target wall-clock time between interrupt checks.
    pub interrupt_check_ms: u32,
    /// Replace the adaptive check counter with a fixed reset value.
    pub fixed_interrupt_interval: Option<u32>,
    pub jit: bool,
    /// Activations of a method before it is compiled.
    pub jit_threshold: u32,
    pub ignore_quit: bool,
    pub image_name: PathBuf,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            memory_limit: 512 * 1024 * 1024,
            low_space_threshold: 8 * 1024 * 1024,
            young_space_limit: 4 * 1024 * 1024,
            tenure_threshold: 200_000,
            interrupt_check_ms: 3,
            fixed_interrupt_interval: None,
            jit: true,
            jit_threshold: 100,
            ignore_quit: false,
            image_name: PathBuf::from("squeak.image"),
        }
    }
}
