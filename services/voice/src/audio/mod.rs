//! Device adapters for the session's audio capability traits.

pub mod input;
pub mod output;
pub mod resample;

pub use input::CpalInput;
pub use output::CpalOutputDevice;
