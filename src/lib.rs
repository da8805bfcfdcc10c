pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod market_data;
pub mod stream;
pub mod telemetry;

pub use error::{StreamError, StreamResult};
pub use stream::{ClientOptions, StreamClient};
