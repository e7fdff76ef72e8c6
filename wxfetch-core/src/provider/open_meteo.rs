use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

use crate::{
    elevation::{ElevationLookup, METRES_TO_FEET},
    error::WeatherError,
    geocode::Geocoder,
    model::NormalizedWeather,
    provider::{ProviderId, ensure_finite, get_json, hpa_to_inhg, unix_to_utc},
};

use super::WeatherProvider;

const BASE_URL: &str = "https://api.open-meteo.com";
const CURRENT_FIELDS: &str = "temperature_2m,relative_humidity_2m,surface_pressure,\
                              wind_speed_10m,wind_direction_10m,wind_gusts_10m";
const ELEVATION_TIMEOUT: Duration = Duration::from_secs(5);

/// Keyless provider; also the source of ground elevation.
#[derive(Debug, Clone)]
pub struct OpenMeteoProvider {
    http: Client,
    base_url: String,
    geocoder: Geocoder,
}

impl Default for OpenMeteoProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl OpenMeteoProvider {
    pub fn new() -> Self {
        let http = Client::new();
        Self {
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

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }
}

#[derive(Debug, Deserialize)]
struct OmCurrent {
    time: i64,
    temperature_2m: f64,
    relative_humidity_2m: f64,
    surface_pressure: f64,
    wind_speed_10m: f64,
    wind_direction_10m: f64,
    wind_gusts_10m: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct OmForecastResponse {
    current: Option<OmCurrent>,
    /// Metres; the model grid cell's elevation.
    elevation: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct OmElevationResponse {
    elevation: Vec<f64>,
}

#[async_trait]
impl WeatherProvider for OpenMeteoProvider {
    fn id(&self) -> ProviderId {
        ProviderId::OpenMeteo
    }

    async fn fetch(
        &self,
        lat: f64,
        lon: f64,
        elevation_ft: Option<f64>,
        timeout: Duration,
    ) -> Result<NormalizedWeather, WeatherError> {
        let id = self.id();
        let request = self.http.get(self.url("/v1/forecast")).query(&[
            ("latitude", lat.to_string()),
            ("longitude", lon.to_string()),
            ("current", CURRENT_FIELDS.to_string()),
            ("temperature_unit", "fahrenheit".to_string()),
            ("wind_speed_unit", "mph".to_string()),
            ("timeformat", "unixtime".to_string()),
        ]);

        let parsed: OmForecastResponse = get_json(id, request, timeout).await?;
        let current = parsed
            .current
            .ok_or_else(|| WeatherError::invalid_response(id, "missing 'current' block"))?;

        let altitude_ft = elevation_ft.or_else(|| parsed.elevation.map(|m| m * METRES_TO_FEET));
        let location_name = self.geocoder.place_name(lat, lon).await;

        Ok(NormalizedWeather {
            temperature_f: ensure_finite(id, "temperature_2m", current.temperature_2m)?,
            humidity_pct: ensure_finite(id, "relative_humidity_2m", current.relative_humidity_2m)?,
            station_pressure_inhg: hpa_to_inhg(ensure_finite(
                id,
                "surface_pressure",
                current.surface_pressure,
            )?),
            wind_speed_mph: ensure_finite(id, "wind_speed_10m", current.wind_speed_10m)?,
            wind_direction_deg: ensure_finite(
                id,
                "wind_direction_10m",
                current.wind_direction_10m,
            )?,
            wind_gust_mph: current.wind_gusts_10m.filter(|g| g.is_finite()),
            altitude_ft,
            location_name,
            latitude: lat,
            longitude: lon,
            observed_at: unix_to_utc(current.time).unwrap_or_else(Utc::now),
            source: id,
            is_manual_override: false,
        })
    }
}

#[async_trait]
impl ElevationLookup for OpenMeteoProvider {
    async fn get_elevation(&self, lat: f64, lon: f64) -> Option<f64> {
        let request = self.http.get(self.url("/v1/elevation")).query(&[
            ("latitude", lat.to_string()),
            ("longitude", lon.to_string()),
        ]);

        match get_json::<OmElevationResponse>(self.id(), request, ELEVATION_TIMEOUT).await {
            Ok(parsed) => {
                let metres = parsed.elevation.first().copied().filter(|m| m.is_finite())?;
                Some(metres * METRES_TO_FEET)
            }
            Err(err) => {
                tracing::debug!(error = %err, "elevation lookup failed");
                None
            }
        }
    }
}
