pub mod log_sink;
pub mod pid_registry;
pub mod supervisor;

pub use log_sink::*;
pub use pid_registry::*;
pub use supervisor::*;
