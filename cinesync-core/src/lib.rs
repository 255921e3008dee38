pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod logging;
pub mod media_store;
pub mod models;
pub mod probe;
pub mod sync;
pub mod test_support;
pub mod upload;

pub use config::Config;
pub use error::{Error, Result};
