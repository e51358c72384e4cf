pub mod config;
pub mod domain;
pub mod error;
pub mod quality;
pub mod redact;
pub mod types;

pub use config::{Config, QualityConfig};
pub use domain::*;
pub use error::OriginMapError;
pub use quality::*;
pub use types::*;
