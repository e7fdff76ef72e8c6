use async_trait::async_trait;
use std::fmt::Debug;

/// Ground elevation lookup.
///
/// Lookups are enrichment only: implementations return `None` on any failure
/// and never raise. `Some(0.0)` is a genuine sea-level answer.
#[async_trait]
pub trait ElevationLookup: Send + Sync + Debug {
    async fn get_elevation(&self, lat: f64, lon: f64) -> Option<f64>;
}

/// Lookup for deployments without an elevation source.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoElevation;

#[async_trait]
impl ElevationLookup for NoElevation {
    async fn get_elevation(&self, _lat: f64, _lon: f64) -> Option<f64> {
        None
    }
}

pub(crate) const METRES_TO_FEET: f64 = 3.280_84;
