//! Reverse geocoding: convert coordinates to human-readable place names.
//! Uses Nominatim (OpenStreetMap) - free, no API key required.

use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

const NOMINATIM_URL: &str = "https://nominatim.openstreetmap.org";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Name used when no place name can be resolved.
pub const UNKNOWN_LOCATION: &str = "Unknown Location";

#[derive(Debug, Deserialize)]
struct NominatimResponse {
    address: Option<NominatimAddress>,
}

#[derive(Debug, Deserialize)]
struct NominatimAddress {
    city: Option<String>,
    town: Option<String>,
    village: Option<String>,
    municipality: Option<String>,
    county: Option<String>,
    state: Option<String>,
    country: Option<String>,
}

impl NominatimAddress {
    /// "Place, State" with the most specific place available.
    fn display_name(self) -> Option<String> {
        let state = self.state.clone();
        let place = self
            .city
            .or(self.town)
            .or(self.village)
            .or(self.municipality)
            .or(self.county)
            .or(self.state)
            .or(self.country)?;

        match state {
            Some(s) if !s.is_empty() && s != place => Some(format!("{place}, {s}")),
            _ => Some(place),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Geocoder {
    http: Client,
    base_url: String,
}

impl Default for Geocoder {
    fn default() -> Self {
        Self::new(Client::new())
    }
}

impl Geocoder {
    pub fn new(http: Client) -> Self {
        Self {
            http,
            base_url: NOMINATIM_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Resolve a place name, falling back to [`UNKNOWN_LOCATION`].
    pub async fn place_name(&self, lat: f64, lon: f64) -> String {
        self.reverse(lat, lon)
            .await
            .unwrap_or_else(|| UNKNOWN_LOCATION.to_string())
    }

    /// Returns `None` on failure or timeout.
    pub async fn reverse(&self, lat: f64, lon: f64) -> Option<String> {
        let url = format!("{}/reverse", self.base_url.trim_end_matches('/'));
        let response = self
            .http
            .get(&url)
            .query(&[
                ("lat", lat.to_string()),
                ("lon", lon.to_string()),
                ("format", "json".to_string()),
                ("zoom", "10".to_string()),
                ("addressdetails", "1".to_string()),
            ])
            .header(reqwest::header::USER_AGENT, concat!("wxfetch/", env!("CARGO_PKG_VERSION")))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await;

        let response = match response {
            Ok(r) => r,
            Err(e) => {
                tracing::debug!("Reverse geocode request failed: {}", e);
                return None;
            }
        };

        if !response.status().is_success() {
            tracing::debug!("Reverse geocode returned status {}", response.status());
            return None;
        }

        let body: NominatimResponse = match response.json().await {
            Ok(b) => b,
            Err(e) => {
                tracing::debug!("Reverse geocode parse error: {}", e);
                return None;
            }
        };

        let name = body.address?.display_name()?;
        tracing::debug!("Reverse geocoded to: {}", name);
        Some(name)
    }
}
