pub mod mock_runtime;

pub use mock_runtime::{MockRuntime, ScriptedExec};
