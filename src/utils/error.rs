//! Customized unified error type.

use std::fmt;
use std::io;
use std::net;
use std::num;
use std::string;

/// Customized error type for pskit.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct PsError(pub String);

impl PsError {
    /// Constructs an error from anything printable.
    pub fn msg(m: impl ToString) -> Self {
        PsError(m.to_string())
    }
}

impl fmt::Display for PsError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0) // do not display literal quotes
    }
}

impl std::error::Error for PsError {}

// Helper macro for saving boiler-plate `impl From<T>`s for transparent
// conversion from various common error types to `PsError`.
macro_rules! impl_from_error {
    ($error:ty) => {
        impl From<$error> for PsError {
            fn from(e: $error) -> Self {
                // just store the source error's string representation
                PsError(e.to_string())
            }
        }
    };
}

impl_from_error!(io::Error);
impl_from_error!(net::AddrParseError);
impl_from_error!(num::ParseIntError);
impl_from_error!(num::TryFromIntError);
impl_from_error!(string::FromUtf8Error);
impl_from_error!(std::array::TryFromSliceError);
impl_from_error!(bincode::error::EncodeError);
impl_from_error!(bincode::error::DecodeError);
impl_from_error!(tokio::task::JoinError);
