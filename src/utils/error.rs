//! Customized unified error type.

use std::error;
use std::fmt;
use std::io;
use std::net;
use std::num;
use std::string;

/// Error type shared by every fallible operation in Lendset. Domain
/// rejections (e.g. reserving a taken item) are not errors.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct LendsetError(pub(crate) String);

impl LendsetError {
    /// Wraps any displayable message.
    pub fn msg(msg: impl ToString) -> Self {
        LendsetError(msg.to_string())
    }
}

impl fmt::Display for LendsetError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0) // do not display literal quotes
    }
}

impl error::Error for LendsetError {}

// Helper macro for saving boiler-plate `impl From<X>`s for transparent
// conversion from various common error types to `LendsetError`.
macro_rules! impl_from_error {
    ($error:ty) => {
        impl From<$error> for LendsetError {
            fn from(e: $error) -> Self {
                // just store the source error's string representation
                LendsetError(e.to_string())
            }
        }
    };
}

// Helper macro for saving boiler-plate `impl From<X<T>>`s for transparent
// conversion from various common generic error types to `LendsetError`.
macro_rules! impl_from_error_generic {
    ($error:ty) => {
        impl<T> From<$error> for LendsetError {
            fn from(e: $error) -> LendsetError {
                LendsetError::msg(e.to_string())
            }
        }
    };
}

impl_from_error!(io::Error);
impl_from_error!(string::FromUtf8Error);
impl_from_error!(num::ParseIntError);
impl_from_error!(net::AddrParseError);
impl_from_error!(toml::ser::Error);
impl_from_error!(toml::de::Error);
impl_from_error!(ctrlc::Error);

impl_from_error_generic!(tokio::sync::watch::error::SendError<T>);
