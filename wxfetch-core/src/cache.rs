//! Last-known-good weather cache.
//!
//! Records are persisted with the time they were cached. Freshness is never
//! stored; it is derived from `cached_at` on every read.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::model::NormalizedWeather;
use crate::provider::ProviderId;
use crate::store::KeyValueStore;

pub const PRIMARY_KEY: &str = "weather_cache_v2";
pub const LEGACY_KEY: &str = "weather_cache";
const PROVIDER_KEY_PREFIX: &str = "weather_cache_v2_";

/// Provider assumed for legacy records, which predate provider tagging.
pub const LEGACY_SOURCE: ProviderId = ProviderId::OpenMeteo;

pub const DEFAULT_MAX_DISTANCE_KM: f64 = 5.0;

const FRESH_LIMIT_SECS: i64 = 5 * 60;
const STALE_LIMIT_SECS: i64 = 30 * 60;
const EMERGENCY_LIMIT_SECS: i64 = 2 * 60 * 60;

const EARTH_RADIUS_KM: f64 = 6371.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Freshness {
    /// Younger than 5 minutes
    Fresh,
    /// 5 to 30 minutes
    Stale,
    /// 30 minutes to 2 hours
    Emergency,
    /// Older than 2 hours
    Expired,
}

impl Freshness {
    pub fn as_str(&self) -> &'static str {
        match self {
            Freshness::Fresh => "fresh",
            Freshness::Stale => "stale",
            Freshness::Emergency => "emergency",
            Freshness::Expired => "expired",
        }
    }
}

impl std::fmt::Display for Freshness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn calculate_freshness(cached_at: DateTime<Utc>) -> Freshness {
    freshness_at(cached_at, Utc::now())
}

/// Classify the age of `cached_at` as seen at `now`. Timestamps from the
/// future count as fresh.
pub fn freshness_at(cached_at: DateTime<Utc>, now: DateTime<Utc>) -> Freshness {
    let age = (now - cached_at).num_seconds();
    if age < FRESH_LIMIT_SECS {
        Freshness::Fresh
    } else if age < STALE_LIMIT_SECS {
        Freshness::Stale
    } else if age < EMERGENCY_LIMIT_SECS {
        Freshness::Emergency
    } else {
        Freshness::Expired
    }
}

/// Anything short of expired may still be served.
pub fn should_use_cache(freshness: Freshness) -> bool {
    !matches!(freshness, Freshness::Expired)
}

/// Expired data must be fetched synchronously, so only stale and emergency
/// tiers are refreshed in the background.
pub fn should_refresh_in_background(freshness: Freshness) -> bool {
    matches!(freshness, Freshness::Stale | Freshness::Emergency)
}

pub fn cache_age_minutes(cached_at: DateTime<Utc>) -> i64 {
    cache_age_minutes_at(cached_at, Utc::now())
}

pub fn cache_age_minutes_at(cached_at: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    (now - cached_at).num_minutes().max(0)
}

/// Great-circle distance in kilometres.
pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * a.sqrt().atan2((1.0 - a).sqrt())
}

pub fn provider_key(provider: ProviderId) -> String {
    format!("{PROVIDER_KEY_PREFIX}{provider}")
}

/// A cache hit with its freshness evaluated at read time.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedWeather {
    pub weather: NormalizedWeather,
    pub cached_at: DateTime<Utc>,
    pub freshness: Freshness,
}

impl CachedWeather {
    pub fn age_minutes(&self) -> i64 {
        cache_age_minutes(self.cached_at)
    }

    pub fn is_usable(&self) -> bool {
        should_use_cache(self.freshness)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheRecord {
    #[serde(flatten)]
    weather: NormalizedWeather,
    cached_at: DateTime<Utc>,
}

/// Pre-multi-provider record: no source tag, no override flag.
#[derive(Debug, Deserialize)]
struct LegacyRecord {
    temperature_f: f64,
    humidity_pct: f64,
    station_pressure_inhg: f64,
    wind_speed_mph: f64,
    wind_direction_deg: f64,
    #[serde(default)]
    wind_gust_mph: Option<f64>,
    #[serde(default)]
    altitude_ft: Option<f64>,
    location_name: String,
    latitude: f64,
    longitude: f64,
    observed_at: DateTime<Utc>,
    cached_at: DateTime<Utc>,
}

impl From<LegacyRecord> for CacheRecord {
    fn from(legacy: LegacyRecord) -> Self {
        Self {
            weather: NormalizedWeather {
                temperature_f: legacy.temperature_f,
                humidity_pct: legacy.humidity_pct,
                station_pressure_inhg: legacy.station_pressure_inhg,
                wind_speed_mph: legacy.wind_speed_mph,
                wind_direction_deg: legacy.wind_direction_deg,
                wind_gust_mph: legacy.wind_gust_mph,
                altitude_ft: legacy.altitude_ft,
                location_name: legacy.location_name,
                latitude: legacy.latitude,
                longitude: legacy.longitude,
                observed_at: legacy.observed_at,
                source: LEGACY_SOURCE,
                is_manual_override: false,
            },
            cached_at: legacy.cached_at,
        }
    }
}

impl CacheRecord {
    fn into_cached(self) -> CachedWeather {
        CachedWeather {
            freshness: calculate_freshness(self.cached_at),
            weather: self.weather,
            cached_at: self.cached_at,
        }
    }
}

/// Best-effort cache over a [`KeyValueStore`].
///
/// Writes and the read-migrate-write path run under one lock so that
/// concurrent fetch flows cannot interleave partial updates.
#[derive(Debug)]
pub struct CacheManager<S> {
    store: S,
    lock: Mutex<()>,
}

impl<S: KeyValueStore> CacheManager<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            lock: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Persist `weather` to the primary slot and to its provider's slot.
    /// Store failures are logged and swallowed.
    pub fn cache_weather(&self, weather: &NormalizedWeather) {
        self.cache_weather_at(weather, Utc::now());
    }

    /// As [`cache_weather`](Self::cache_weather) with an explicit timestamp.
    pub fn cache_weather_at(&self, weather: &NormalizedWeather, cached_at: DateTime<Utc>) {
        let record = CacheRecord {
            weather: weather.clone(),
            cached_at,
        };

        let json = match serde_json::to_string(&record) {
            Ok(json) => json,
            Err(err) => {
                tracing::warn!(error = %err, "failed to serialize weather for cache");
                return;
            }
        };

        let _guard = self.lock.lock();
        self.write(PRIMARY_KEY, &json);
        self.write(&provider_key(weather.source), &json);
        tracing::debug!(provider = %weather.source, "weather cached");
    }

    /// Read the primary slot.
    ///
    /// When `location` is given and the cached reading lies further than
    /// `max_distance_km` from it, the cache is treated as a miss whatever its
    /// freshness. A distance that cannot be computed (NaN coordinates or
    /// limit) is also a miss.
    pub fn get_cached_weather(
        &self,
        location: Option<(f64, f64)>,
        max_distance_km: f64,
    ) -> Option<CachedWeather> {
        let record = {
            let _guard = self.lock.lock();
            match self.read_record(PRIMARY_KEY) {
                Some(record) => record,
                None => self.migrate_legacy()?,
            }
        };

        if let Some((lat, lon)) = location {
            let distance =
                haversine_km(lat, lon, record.weather.latitude, record.weather.longitude);
            let nearby = distance.is_finite() && distance <= max_distance_km;
            if !nearby {
                tracing::debug!(
                    distance_km = distance,
                    max_distance_km,
                    "cached weather is for a different location"
                );
                return None;
            }
        }

        let cached = record.into_cached();
        tracing::debug!(
            freshness = %cached.freshness,
            age_minutes = cached.age_minutes(),
            "cache hit"
        );
        Some(cached)
    }

    /// Read one provider's slot, so that one provider's fresh data does not
    /// mask another's staleness.
    pub fn get_provider_cache(&self, provider: ProviderId) -> Option<CachedWeather> {
        self.read_record(&provider_key(provider))
            .map(CacheRecord::into_cached)
    }

    /// Remove the primary slot, the legacy slot and every provider slot.
    pub fn clear_weather_cache(&self) {
        let _guard = self.lock.lock();
        self.delete(PRIMARY_KEY);
        self.delete(LEGACY_KEY);
        for provider in ProviderId::all() {
            self.delete(&provider_key(*provider));
        }
        tracing::debug!("weather cache cleared");
    }

    fn read_record(&self, key: &str) -> Option<CacheRecord> {
        let raw = match self.store.get(key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(err) => {
                tracing::warn!(key, error = %err, "failed to read weather cache");
                return None;
            }
        };

        match serde_json::from_str(&raw) {
            Ok(record) => Some(record),
            Err(err) => {
                tracing::warn!(key, error = %err, "discarding corrupt weather cache entry");
                None
            }
        }
    }

    /// One-time upgrade of the untagged legacy slot. The legacy key is only
    /// removed once the upgraded record has been written.
    fn migrate_legacy(&self) -> Option<CacheRecord> {
        let raw = self.store.get(LEGACY_KEY).ok().flatten()?;
        let legacy: LegacyRecord = match serde_json::from_str(&raw) {
            Ok(legacy) => legacy,
            Err(err) => {
                tracing::warn!(error = %err, "legacy weather cache is unreadable");
                return None;
            }
        };

        let record = CacheRecord::from(legacy);
        let migrated = serde_json::to_string(&record)
            .ok()
            .is_some_and(|json| self.store.set(PRIMARY_KEY, &json).is_ok());

        if migrated {
            if let Err(err) = self.store.remove(LEGACY_KEY) {
                tracing::warn!(error = %err, "failed to remove legacy weather cache");
            }
            tracing::info!(source = %LEGACY_SOURCE, "migrated legacy weather cache");
        }

        Some(record)
    }

    fn write(&self, key: &str, value: &str) {
        if let Err(err) = self.store.set(key, value) {
            tracing::warn!(key, error = %err, "failed to persist weather cache");
        }
    }

    fn delete(&self, key: &str) {
        if let Err(err) = self.store.remove(key) {
            tracing::warn!(key, error = %err, "failed to remove weather cache entry");
        }
    }
}
