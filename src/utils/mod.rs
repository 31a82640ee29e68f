//! Helper utilities, functions, and macros.

#[macro_use]
mod print;

#[macro_use]
mod config;

mod error;
mod bitmap;
mod timer;

pub(crate) mod safetcp;

pub use error::LendsetError;
pub use bitmap::Bitmap;
pub use timer::Timer;
pub use print::{logger_init, me_tag, ME};
