use crate::{
    Config, NormalizedWeather, WeatherError,
    provider::{
        open_meteo::OpenMeteoProvider, openweather::OpenWeatherProvider,
        weatherapi::WeatherApiProvider,
    },
};
use crate::retry::fetch_with_timeout;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::{convert::TryFrom, fmt::Debug, str::FromStr, sync::Arc, time::Duration};

pub mod open_meteo;
pub mod openweather;
pub mod weatherapi;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderId {
    OpenMeteo,
    OpenWeather,
    WeatherApi,
}

impl ProviderId {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderId::OpenMeteo => "openmeteo",
            ProviderId::OpenWeather => "openweather",
            ProviderId::WeatherApi => "weatherapi",
        }
    }

    pub const fn all() -> &'static [ProviderId] {
        &[ProviderId::OpenMeteo, ProviderId::OpenWeather, ProviderId::WeatherApi]
    }

    /// Whether the provider needs an API key before it can be used.
    pub fn requires_api_key(&self) -> bool {
        !matches!(self, ProviderId::OpenMeteo)
    }
}

impl std::fmt::Display for ProviderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for ProviderId {
    type Error = anyhow::Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let lower = value.to_lowercase();

        match lower.as_str() {
            "openmeteo" | "open-meteo" => Ok(ProviderId::OpenMeteo),
            "openweather" => Ok(ProviderId::OpenWeather),
            "weatherapi" => Ok(ProviderId::WeatherApi),
            _ => Err(anyhow::anyhow!(
                "Unknown provider '{value}'. \
                 Supported providers: openmeteo, openweather, weatherapi."
            )),
        }
    }
}

impl FromStr for ProviderId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ProviderId::try_from(s)
    }
}

/// Adapter contract for a current-conditions data source.
///
/// Implementations classify every failure into a [`WeatherError`] tagged with
/// their provider id. Place-name lookup is best-effort and must never fail
/// the call.
#[async_trait]
pub trait WeatherProvider: Send + Sync + Debug {
    fn id(&self) -> ProviderId;

    async fn fetch(
        &self,
        lat: f64,
        lon: f64,
        elevation_ft: Option<f64>,
        timeout: Duration,
    ) -> Result<NormalizedWeather, WeatherError>;
}

/// Construct a provider from config and explicit ProviderId.
pub fn provider_from_config(
    id: ProviderId,
    config: &Config,
) -> anyhow::Result<Arc<dyn WeatherProvider>> {
    let provider: Arc<dyn WeatherProvider> = match id {
        ProviderId::OpenMeteo => Arc::new(OpenMeteoProvider::new()),
        ProviderId::OpenWeather => {
            Arc::new(OpenWeatherProvider::new(required_api_key(id, config)?))
        }
        ProviderId::WeatherApi => {
            Arc::new(WeatherApiProvider::new(required_api_key(id, config)?))
        }
    };

    Ok(provider)
}

fn required_api_key(id: ProviderId, config: &Config) -> anyhow::Result<String> {
    config.provider_api_key(id).map(str::to_owned).ok_or_else(|| {
        anyhow::anyhow!(
            "No API key configured for provider '{id}'.\n\
                 Hint: run `wxfetch configure {id}` and enter your API key."
        )
    })
}

/// Build every provider the config can support, skipping unconfigured ones.
pub fn providers_from_config(config: &Config) -> Vec<Arc<dyn WeatherProvider>> {
    ProviderId::all()
        .iter()
        .filter_map(|id| match provider_from_config(*id, config) {
            Ok(provider) => Some(provider),
            Err(err) => {
                tracing::debug!(provider = %id, error = %err, "provider not configured");
                None
            }
        })
        .collect()
}

/// Send a GET, classify non-success statuses and decode the JSON body.
pub(crate) async fn get_json<T: DeserializeOwned>(
    provider: ProviderId,
    request: reqwest::RequestBuilder,
    timeout: Duration,
) -> Result<T, WeatherError> {
    let res = fetch_with_timeout(provider, request, timeout).await?;

    let status = res.status();
    let body = res
        .text()
        .await
        .map_err(|e| WeatherError::network(provider, e))?;

    if !status.is_success() {
        return Err(WeatherError::from_status(provider, status.as_u16(), &body));
    }

    serde_json::from_str(&body).map_err(|e| WeatherError::parse(provider, e))
}

const HPA_TO_INHG: f64 = 0.029_529_983;
const FEET_TO_METRES: f64 = 0.3048;

pub(crate) fn hpa_to_inhg(hpa: f64) -> f64 {
    hpa * HPA_TO_INHG
}

/// Reduce a sea-level pressure to station level with the standard-atmosphere
/// barometric formula. Unknown elevation leaves the value untouched.
pub(crate) fn sea_level_to_station(
    provider: ProviderId,
    pressure: f64,
    elevation_ft: Option<f64>,
) -> f64 {
    match elevation_ft {
        Some(ft) => {
            let metres = ft * FEET_TO_METRES;
            pressure * (1.0 - 2.255_77e-5 * metres).powf(5.255_88)
        }
        None => {
            tracing::debug!(
                %provider,
                "elevation unknown, station pressure left at sea-level value"
            );
            pressure
        }
    }
}

pub(crate) fn unix_to_utc(ts: i64) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp(ts, 0)
}

/// Reject NaN/infinite readings before they reach the cache.
pub(crate) fn ensure_finite(
    provider: ProviderId,
    field: &str,
    value: f64,
) -> Result<f64, WeatherError> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(WeatherError::invalid_response(
            provider,
            format!("field '{field}' is not a finite number"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn provider_id_as_str_roundtrip() {
        for id in ProviderId::all() {
            let s = id.as_str();
            let parsed = ProviderId::try_from(s).expect("roundtrip should succeed");
            assert_eq!(*id, parsed);
        }
    }

    #[test]
    fn unknown_provider_error() {
        let err = ProviderId::try_from("doesnotexist").unwrap_err();
        assert!(err.to_string().contains("Unknown provider"));
    }

    #[test]
    fn keyless_provider_is_always_available() {
        let cfg = Config::default();
        let provider = provider_from_config(ProviderId::OpenMeteo, &cfg).unwrap();
        assert_eq!(provider.id(), ProviderId::OpenMeteo);
    }

    #[test]
    fn provider_from_config_errors_when_missing_api_key() {
        let cfg = Config::default();
        let err = provider_from_config(ProviderId::OpenWeather, &cfg).unwrap_err();
        assert!(err.to_string().contains("No API key configured for provider"));
        assert!(err.to_string().contains("wxfetch configure openweather"));
    }

    #[test]
    fn providers_from_config_skips_unconfigured() {
        let mut cfg = Config::default();
        let ids: Vec<_> = providers_from_config(&cfg).iter().map(|p| p.id()).collect();
        assert_eq!(ids, vec![ProviderId::OpenMeteo]);

        cfg.upsert_provider_api_key(ProviderId::WeatherApi, "KEY".to_string());
        let ids: Vec<_> = providers_from_config(&cfg).iter().map(|p| p.id()).collect();
        assert_eq!(ids, vec![ProviderId::OpenMeteo, ProviderId::WeatherApi]);
    }

    #[test]
    fn station_pressure_drops_with_elevation() {
        let sea = 29.92;
        let id = ProviderId::WeatherApi;
        assert_eq!(sea_level_to_station(id, sea, None), sea);
        assert!((sea_level_to_station(id, sea, Some(0.0)) - sea).abs() < 1e-9);

        let denver = sea_level_to_station(id, sea, Some(5280.0));
        assert!(denver > 24.5 && denver < 25.2, "got {denver}");
    }

    #[test]
    fn hpa_conversion() {
        assert!((hpa_to_inhg(1013.25) - 29.92).abs() < 0.01);
    }

    #[test]
    fn non_finite_values_are_invalid() {
        let err = ensure_finite(ProviderId::OpenMeteo, "temp", f64::NAN).unwrap_err();
        assert_eq!(err.code, crate::ErrorCode::InvalidResponse);
        assert_eq!(ensure_finite(ProviderId::OpenMeteo, "temp", 1.5).unwrap(), 1.5);
    }
}
