use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

use crate::{
    error::WeatherError,
    geocode::Geocoder,
    model::NormalizedWeather,
    provider::{ProviderId, ensure_finite, get_json, sea_level_to_station, unix_to_utc},
};

use super::WeatherProvider;

const BASE_URL: &str = "https://api.weatherapi.com";

#[derive(Debug, Clone)]
pub struct WeatherApiProvider {
    api_key: String,
    http: Client,
    base_url: String,
    geocoder: Geocoder,
}

impl WeatherApiProvider {
    pub fn new(api_key: String) -> Self {
        let http = Client::new();
        Self {
            api_key,
            geocoder: Geocoder::new(http.clone()),
            http,
            base_url: BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_geocoder(mut self, geocoder: Geocoder) -> Self {
        self.geocoder = geocoder;
        self
    }
}

#[derive(Debug, Deserialize)]
struct WaLocation {
    #[serde(default)]
    name: String,
    #[serde(default)]
    region: String,
}

impl WaLocation {
    fn display_name(&self) -> Option<String> {
        let name = self.name.trim();
        let region = self.region.trim();
        match (name.is_empty(), region.is_empty()) {
            (true, _) => None,
            (false, true) => Some(name.to_string()),
            (false, false) if name == region => Some(name.to_string()),
            (false, false) => Some(format!("{name}, {region}")),
        }
    }
}

#[derive(Debug, Deserialize)]
struct WaCurrent {
    last_updated_epoch: Option<i64>,
    temp_f: f64,
    humidity: f64,
    /// Sea-level pressure, inHg
    pressure_in: f64,
    wind_mph: f64,
    wind_degree: f64,
    gust_mph: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct WaResponse {
    location: WaLocation,
    current: WaCurrent,
}

#[async_trait]
impl WeatherProvider for WeatherApiProvider {
    fn id(&self) -> ProviderId {
        ProviderId::WeatherApi
    }

    async fn fetch(
        &self,
        lat: f64,
        lon: f64,
        elevation_ft: Option<f64>,
        timeout: Duration,
    ) -> Result<NormalizedWeather, WeatherError> {
        let id = self.id();
        let url = format!("{}/v1/current.json", self.base_url.trim_end_matches('/'));
        let request = self.http.get(url).query(&[
            ("key", self.api_key.clone()),
            ("q", format!("{lat},{lon}")),
        ]);

        let parsed: WaResponse = get_json(id, request, timeout).await?;
        let current = parsed.current;

        let location_name = match parsed.location.display_name() {
            Some(name) => name,
            None => self.geocoder.place_name(lat, lon).await,
        };

        let observed_at = current
            .last_updated_epoch
            .and_then(unix_to_utc)
            .unwrap_or_else(Utc::now);

        Ok(NormalizedWeather {
            temperature_f: ensure_finite(id, "current.temp_f", current.temp_f)?,
            humidity_pct: ensure_finite(id, "current.humidity", current.humidity)?,
            station_pressure_inhg: sea_level_to_station(
                id,
                ensure_finite(id, "current.pressure_in", current.pressure_in)?,
                elevation_ft,
            ),
            wind_speed_mph: ensure_finite(id, "current.wind_mph", current.wind_mph)?,
            wind_direction_deg: ensure_finite(id, "current.wind_degree", current.wind_degree)?,
            wind_gust_mph: current.gust_mph.filter(|g| g.is_finite()),
            altitude_ft: elevation_ft,
            location_name,
            latitude: lat,
            longitude: lon,
            observed_at,
            source: id,
            is_manual_override: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn location(name: &str, region: &str) -> WaLocation {
        WaLocation {
            name: name.to_string(),
            region: region.to_string(),
        }
    }

    #[test]
    fn location_display_name() {
        assert_eq!(
            location("Boulder", "Colorado").display_name().as_deref(),
            Some("Boulder, Colorado")
        );
        assert_eq!(location("Monaco", "Monaco").display_name().as_deref(), Some("Monaco"));
        assert_eq!(location("Nowhere", "").display_name().as_deref(), Some("Nowhere"));
        assert_eq!(location(" ", "Colorado").display_name(), None);
    }
}
