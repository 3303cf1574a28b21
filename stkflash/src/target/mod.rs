//! Target-side operations: forcing the bootloader and programming through it.

pub mod programmer;
pub mod reset;

pub use programmer::{
    DEFAULT_PAGE_SIZE, Programmer, ProgrammerConfig, SessionState, WriteReport,
};
pub use reset::{PortResetLine, ResetLine, ResetSignal, pulse_reset};
