//! Child process ownership: spawning, output capture, signals, inspection.

pub mod env;
pub mod handle;
pub mod inspect;
pub mod signal;

pub use env::build_instance_env;
pub use handle::ProcessHandle;
pub use inspect::{is_process_alive, is_supervisor_process};
