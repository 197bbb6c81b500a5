
pub mod compiler;
pub mod config;
pub mod error;
pub mod interpreter;
pub mod objectmemory;
pub mod utils;

pub use crate::config::VmConfig;
pub use crate::error::{ImageError, VmError};
pub use crate::interpreter::{Interpreter, RunState};
pub use crate::objectmemory::{ObjectMemory, OOP};
