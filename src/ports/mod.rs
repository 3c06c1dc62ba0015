pub mod accelerator;
pub mod config;
pub mod http;
pub mod hub;

pub use accelerator::AcceleratorRuntime;
pub use config::ConfigStore;
pub use http::{ByteStream, HttpClient, RangeResponse};
pub use hub::ModelHub;
