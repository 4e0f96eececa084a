pub mod command;
pub mod error;
pub mod process;
pub mod runner;
pub mod sink;
pub mod terminate;

pub use command::*;
pub use error::*;
pub use process::*;
pub use runner::*;
pub use sink::*;
pub use terminate::*;
