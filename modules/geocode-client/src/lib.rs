//! Geocoding REST client.
//!
//! Batch lookups run with bounded concurrency and a per-call timeout.
//! Individual failures resolve to `None` — a bad address never fails the
//! batch, it just produces no coordinates for that entry.

pub mod error;
pub mod types;

pub use error::{GeocodeError, Result};
pub use types::{GeocodeOptions, GeocodedLocation};

use futures::stream::{self, StreamExt};
use serde_json::Value;
use tracing::{debug, warn};

pub struct GeocodeClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl GeocodeClient {
    pub fn new(base_url: String, api_key: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
            api_key,
        }
    }

    /// Geocode a single address string. Returns `None` when the service has
    /// no result for the address.
    pub async fn geocode(
        &self,
        address: &str,
        timeout: std::time::Duration,
    ) -> Result<Option<GeocodedLocation>> {
        let trimmed = address.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }

        let resp = self
            .client
            .get(&self.base_url)
            .query(&[("address", trimmed), ("key", self.api_key.as_str())])
            .timeout(timeout)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(GeocodeError::Api {
                status: status.as_u16(),
                message: body,
            });
        }

        let body: Value = resp.json().await?;
        Ok(parse_first_result(trimmed, &body))
    }

    /// Geocode a list of address strings with bounded concurrency.
    /// Output order matches input order; failed or empty lookups are `None`.
    pub async fn geocode_location_array(
        &self,
        locations: &[String],
        opts: &GeocodeOptions,
    ) -> Vec<Option<GeocodedLocation>> {
        let concurrency = opts.concurrency.max(1);

        stream::iter(locations.iter().cloned().enumerate().map(|(idx, address)| {
            async move {
                let result = self.geocode(&address, opts.timeout).await;
                match result {
                    Ok(geo) => (idx, geo),
                    Err(e) => {
                        warn!(address = address.as_str(), error = %e, "Geocode lookup failed");
                        (idx, None)
                    }
                }
            }
        }))
        .buffer_unordered(concurrency)
        .collect::<Vec<_>>()
        .await
        .into_iter()
        .fold(vec![None; locations.len()], |mut acc, (idx, geo)| {
            acc[idx] = geo;
            acc
        })
    }
}

fn parse_first_result(address: &str, body: &Value) -> Option<GeocodedLocation> {
    let result = body.get("results")?.as_array()?.first()?;
    let location = result.get("geometry")?.get("location")?;
    let lat = location.get("lat")?.as_f64()?;
    let lng = location.get("lng")?.as_f64()?;

    let formatted = result
        .get("formatted_address")
        .and_then(Value::as_str)
        .unwrap_or(address)
        .to_string();

    debug!(address, lat, lng, "Geocoded");

    Some(GeocodedLocation {
        address: address.to_string(),
        formatted,
        lat,
        lng,
    })
}

/// First successful geocode wins as the primary coordinate pair.
pub fn pick_primary_lat_lng(results: &[Option<GeocodedLocation>]) -> Option<(f64, f64)> {
    results
        .iter()
        .flatten()
        .next()
        .map(|g| (g.lat, g.lng))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_first_result() {
        let body = json!({
            "results": [{
                "formatted_address": "Portland, OR, USA",
                "geometry": { "location": { "lat": 45.5, "lng": -122.6 } }
            }]
        });
        let geo = parse_first_result("Portland, OR", &body).unwrap();
        assert_eq!(geo.formatted, "Portland, OR, USA");
        assert_eq!(geo.lat, 45.5);
    }

    #[test]
    fn empty_results_yield_none() {
        let body = json!({ "results": [] });
        assert!(parse_first_result("nowhere", &body).is_none());
    }

    #[test]
    fn primary_is_first_success() {
        let results = vec![
            None,
            Some(GeocodedLocation {
                address: "a".into(),
                formatted: "A".into(),
                lat: 1.0,
                lng: 2.0,
            }),
            Some(GeocodedLocation {
                address: "b".into(),
                formatted: "B".into(),
                lat: 3.0,
                lng: 4.0,
            }),
        ];
        assert_eq!(pick_primary_lat_lng(&results), Some((1.0, 2.0)));
    }
}
