//! Helper utilities, functions, and macros.

#[macro_use]
mod print;

mod error;
mod sarray;
mod safetcp;

pub use error::PsError;
pub use sarray::SArray;

pub(crate) use safetcp::{
    local_ip_toward, put_frame, read_frame, tcp_bind_with_retry,
    tcp_connect_with_retry, write_all_buf,
};
