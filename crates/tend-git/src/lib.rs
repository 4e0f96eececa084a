pub mod command;
pub mod error;
pub mod repo;
pub mod sync;

pub use command::*;
pub use error::*;
pub use repo::*;
pub use sync::*;
