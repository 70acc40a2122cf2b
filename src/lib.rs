//! Unified Shared Memory allocation, pooling and sanitizer shadow memory.
//!
//! The crate is layered the same way the runtime is driven:
//!
//! * [`native`] is the driver boundary ([`native::NativeDriver`]) plus an
//!   in-process [`native::mock::MockDriver`].
//! * [`usm`] holds the providers, the disjoint slab allocator and pool handles.
//! * [`runtime`] owns platforms, contexts, devices and the public USM calls.
//! * [`sanitizer`] maintains shadow memory on top of the USM path.

#[cfg(not(target_pointer_width = "64"))]
compile_error!("usm-rs only supports 64-bit targets");

pub mod config;
pub mod error;
pub mod native;
pub mod runtime;
pub mod sanitizer;
pub mod usm;
pub mod utils;

pub use config::RuntimeConfig;
pub use error::{UsmError, UsmResult};
