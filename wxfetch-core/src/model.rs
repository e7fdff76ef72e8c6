use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::provider::ProviderId;

/// Current conditions at a point, normalized across providers.
///
/// Units are imperial: °F, percent, inHg, mph, degrees true, feet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedWeather {
    pub temperature_f: f64,
    pub humidity_pct: f64,
    pub station_pressure_inhg: f64,
    pub wind_speed_mph: f64,
    pub wind_direction_deg: f64,
    pub wind_gust_mph: Option<f64>,
    /// `None` means the elevation is unknown; `Some(0.0)` is sea level.
    pub altitude_ft: Option<f64>,
    pub location_name: String,
    pub latitude: f64,
    pub longitude: f64,
    pub observed_at: DateTime<Utc>,
    pub source: ProviderId,
    #[serde(default)]
    pub is_manual_override: bool,
}
