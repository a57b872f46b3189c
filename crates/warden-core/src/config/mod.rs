//! Process-wide sandbox policy: image, resource limits, timeouts and caps.

pub mod loader;
pub mod types;

pub use loader::*;
pub use types::*;
