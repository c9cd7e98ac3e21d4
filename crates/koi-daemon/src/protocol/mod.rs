pub mod messages;

pub use messages::{DaemonRequest, DaemonResponse, InstanceInfo, InstanceStatus};
