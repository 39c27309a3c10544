mod address;
pub mod constants;
mod lazy;
pub mod memory;
pub mod segment;

pub use address::Address;
pub use lazy::{Lazy, Local, Shared};
pub use memory::RawMemory;
