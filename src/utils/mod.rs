pub mod error;

pub use error::RelayError;
