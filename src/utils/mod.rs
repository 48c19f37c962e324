//! Helper utilities, functions, and macros.

#[macro_use]
mod print;

#[macro_use]
mod config;

mod error;
mod timestamp;

pub use error::{ErrorKind, PitrError, ResultExt};
pub use print::{logger_init, me_prefix, set_me, LogEvent, ME};
pub use timestamp::Timestamp;
