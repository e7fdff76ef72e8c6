use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

use crate::{
    error::WeatherError,
    geocode::Geocoder,
    model::NormalizedWeather,
    provider::{
        ProviderId, ensure_finite, get_json, hpa_to_inhg, sea_level_to_station, unix_to_utc,
    },
};

use super::WeatherProvider;

const BASE_URL: &str = "https://api.openweathermap.org";

#[derive(Debug, Clone)]
pub struct OpenWeatherProvider {
    api_key: String,
    http: Client,
    base_url: String,
    geocoder: Geocoder,
}

impl OpenWeatherProvider {
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
struct OwMain {
    temp: f64,
    humidity: f64,
    /// Sea-level pressure, hPa
    pressure: f64,
    /// Ground-level pressure, hPa (not always present)
    grnd_level: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct OwWind {
    speed: f64,
    #[serde(default)]
    deg: f64,
    gust: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct OwCurrentResponse {
    #[serde(default)]
    name: String,
    dt: i64,
    main: OwMain,
    wind: OwWind,
}

#[async_trait]
impl WeatherProvider for OpenWeatherProvider {
    fn id(&self) -> ProviderId {
        ProviderId::OpenWeather
    }

    async fn fetch(
        &self,
        lat: f64,
        lon: f64,
        elevation_ft: Option<f64>,
        timeout: Duration,
    ) -> Result<NormalizedWeather, WeatherError> {
        let id = self.id();
        let url = format!("{}/data/2.5/weather", self.base_url.trim_end_matches('/'));
        let request = self.http.get(url).query(&[
            ("lat", lat.to_string()),
            ("lon", lon.to_string()),
            ("appid", self.api_key.clone()),
            ("units", "imperial".to_string()),
        ]);

        let parsed: OwCurrentResponse = get_json(id, request, timeout).await?;

        let station_hpa = match parsed.main.grnd_level {
            Some(ground) => ensure_finite(id, "main.grnd_level", ground)?,
            None => sea_level_to_station(
                id,
                ensure_finite(id, "main.pressure", parsed.main.pressure)?,
                elevation_ft,
            ),
        };

        let location_name = if parsed.name.trim().is_empty() {
            self.geocoder.place_name(lat, lon).await
        } else {
            parsed.name
        };

        Ok(NormalizedWeather {
            temperature_f: ensure_finite(id, "main.temp", parsed.main.temp)?,
            humidity_pct: ensure_finite(id, "main.humidity", parsed.main.humidity)?,
            station_pressure_inhg: hpa_to_inhg(station_hpa),
            wind_speed_mph: ensure_finite(id, "wind.speed", parsed.wind.speed)?,
            wind_direction_deg: ensure_finite(id, "wind.deg", parsed.wind.deg)?,
            wind_gust_mph: parsed.wind.gust.filter(|g| g.is_finite()),
            altitude_ft: elevation_ft,
            location_name,
            latitude: lat,
            longitude: lon,
            observed_at: unix_to_utc(parsed.dt).unwrap_or_else(Utc::now),
            source: id,
            is_manual_override: false,
        })
    }
}
