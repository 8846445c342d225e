//! Architecture-specific context switching.

#[cfg(target_arch = "x86_64")]
pub mod x86_64;
#[cfg(target_arch = "x86_64")]
pub use x86_64::{SavedRegs, context_switch, fiber_start_trampoline, init_context};

#[cfg(target_arch = "aarch64")]
pub mod aarch64;
#[cfg(target_arch = "aarch64")]
pub use aarch64::{SavedRegs, context_switch, init_context};

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("spindle-fiber supports x86_64 and aarch64 only");
