//! Common utilities and types shared across policybanner crates.

pub mod error;
pub mod hash;
pub mod os;
pub mod timestamp;

pub use error::{Error, ErrorKind, Result};
pub use os::OsVersion;
pub use timestamp::Timestamp;
