#![feature(allocator_api)]

extern crate allockit_macros;
pub extern crate spin;

#[macro_use]
pub mod log;
#[macro_use]
pub mod util;
pub mod base;
#[doc(hidden)]
pub mod hooks;
pub mod malloc;
pub mod mutator;
pub mod options;
pub mod plan;
mod rust_alloc;
pub mod stat;
pub mod testing;

pub use allockit_macros::*;
pub use ctor::ctor;
pub use errno;
pub use libc;
pub use mutator::Mutator;
pub use options::Options;
pub use plan::Plan;

#[cfg(not(target_pointer_width = "64"))]
const ERROR: ! = "32-bit is not supported";

#[cfg(not(any(
    all(target_os = "linux", target_arch = "x86_64"),
    all(target_os = "linux", target_arch = "aarch64"),
)))]
const ERROR: ! = r#"
    ❌ Unsupported Platform.
    Only Linux (x86_64) and Linux (aarch64) are supported.
"#;

/// All Rust-level allocations inside the allocator itself (index nodes,
/// boxed arenas, ...) are served by the bootstrap allocator, never by the
/// allocator under construction.
#[global_allocator]
static BASE: base::Base = base::Base;
