pub mod bits;
pub mod config;
pub mod error;

pub use error::{QhmmError, Result};
