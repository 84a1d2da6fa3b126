//! Protocol module - bootloader protocol definitions.

pub mod constants;
pub mod function;

pub use constants::*;
pub use function::SystemFunction;
