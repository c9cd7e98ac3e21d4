//! Named instances and their supervised processes.

pub mod manager;
pub mod state;

pub use manager::InstanceManager;
pub use state::ManagedInstance;
