pub mod config;
pub mod error;
pub mod types;

pub use config::{Credentials, Settings};
pub use error::{Result, ScoutError};
pub use types::*;
