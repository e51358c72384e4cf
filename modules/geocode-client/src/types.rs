use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeocodedLocation {
    /// The input address as submitted.
    pub address: String,
    /// The service's formatted address for the match.
    pub formatted: String,
    pub lat: f64,
    pub lng: f64,
}

#[derive(Debug, Clone)]
pub struct GeocodeOptions {
    pub timeout: Duration,
    pub concurrency: usize,
}

impl Default for GeocodeOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            concurrency: 4,
        }
    }
}
