//! Per-provider circuit breaker.
//!
//! When a provider fails repeatedly inside the failure window its circuit
//! opens and the orchestrator skips it until the recovery time has passed.
//! The first request after that is a half-open probe whose outcome closes or
//! reopens the circuit.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

use crate::config::duration_ms;
use crate::provider::ProviderId;

/// Circuit breaker configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Failures inside the window that open the circuit
    pub failure_threshold: u32,

    /// Only failures younger than this count toward the threshold
    #[serde(rename = "failure_window_ms", with = "duration_ms")]
    pub failure_window: Duration,

    /// Time an open circuit waits before allowing a probe
    #[serde(rename = "recovery_time_ms", with = "duration_ms")]
    pub recovery_time: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            failure_window: Duration::from_secs(60),
            recovery_time: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    /// Defaults used by the orchestrator: a wider window and longer cooldown,
    /// since a whole fetch (with retries) counts as one failure.
    pub fn orchestrator_default() -> Self {
        Self {
            failure_threshold: 3,
            failure_window: Duration::from_secs(5 * 60),
            recovery_time: Duration::from_secs(60),
        }
    }
}

/// State of a circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation
    Closed,

    /// Provider is skipped until the recovery time passes
    Open,

    /// One probe request is allowed through
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
struct Circuit {
    state: CircuitState,
    failures: VecDeque<Instant>,
    last_state_change: Instant,
}

impl Circuit {
    fn new(now: Instant) -> Self {
        Self {
            state: CircuitState::Closed,
            failures: VecDeque::new(),
            last_state_change: now,
        }
    }

    fn transition(&mut self, state: CircuitState, now: Instant) {
        self.state = state;
        self.last_state_change = now;
    }

    /// Drop failures that fell out of the window. Timestamps are pushed in
    /// order, so expired entries are always at the front.
    fn prune(&mut self, window: Duration, now: Instant) {
        while let Some(oldest) = self.failures.front() {
            if now.saturating_duration_since(*oldest) > window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Registry of circuits keyed by provider.
///
/// Circuits are created lazily on first access and live until reset. All
/// mutation happens under one lock, so concurrent fetch flows never observe
/// a half-applied transition.
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    circuits: Mutex<HashMap<ProviderId, Circuit>>,
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a request to `provider` may proceed.
    ///
    /// An open circuit whose recovery time has elapsed moves to half-open
    /// here and admits the probe.
    pub fn can_request(&self, provider: ProviderId, config: &CircuitBreakerConfig) -> bool {
        let now = Instant::now();
        let mut circuits = self.circuits.lock();
        let circuit = circuits.entry(provider).or_insert_with(|| Circuit::new(now));

        match circuit.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = now.saturating_duration_since(circuit.last_state_change);
                if elapsed >= config.recovery_time {
                    circuit.transition(CircuitState::HalfOpen, now);
                    tracing::info!(%provider, "circuit half-open, allowing probe request");
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self, provider: ProviderId, config: &CircuitBreakerConfig) {
        let now = Instant::now();
        let mut circuits = self.circuits.lock();
        let circuit = circuits.entry(provider).or_insert_with(|| Circuit::new(now));

        match circuit.state {
            CircuitState::HalfOpen => {
                circuit.transition(CircuitState::Closed, now);
                circuit.failures.clear();
                tracing::info!(provider = %provider, "circuit closed after successful probe");
            }
            CircuitState::Closed => {
                // In-window failures still count; only expired ones go.
                circuit.prune(config.failure_window, now);
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self, provider: ProviderId, config: &CircuitBreakerConfig) {
        let now = Instant::now();
        let mut circuits = self.circuits.lock();
        let circuit = circuits.entry(provider).or_insert_with(|| Circuit::new(now));

        match circuit.state {
            CircuitState::HalfOpen => {
                circuit.transition(CircuitState::Open, now);
                tracing::warn!(provider = %provider, "circuit reopened after failed probe");
            }
            CircuitState::Closed => {
                circuit.failures.push_back(now);
                circuit.prune(config.failure_window, now);

                let failures = circuit.failures.len();
                if failures >= config.failure_threshold as usize {
                    circuit.transition(CircuitState::Open, now);
                    circuit.failures.clear();
                    tracing::warn!(
                        provider = %provider,
                        failures,
                        "circuit opened after repeated failures"
                    );
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Current state; providers never seen are closed.
    pub fn state(&self, provider: ProviderId) -> CircuitState {
        self.circuits
            .lock()
            .get(&provider)
            .map(|c| c.state)
            .unwrap_or(CircuitState::Closed)
    }

    /// Remaining cooldown of an open circuit, zero in any other state.
    pub fn time_until_retry(
        &self,
        provider: ProviderId,
        config: &CircuitBreakerConfig,
    ) -> Duration {
        let circuits = self.circuits.lock();
        match circuits.get(&provider) {
            Some(circuit) if circuit.state == CircuitState::Open => {
                let elapsed = Instant::now().saturating_duration_since(circuit.last_state_change);
                config.recovery_time.saturating_sub(elapsed)
            }
            _ => Duration::ZERO,
        }
    }

    /// Number of in-window failures currently remembered for `provider`.
    pub fn failure_count(&self, provider: ProviderId) -> usize {
        self.circuits
            .lock()
            .get(&provider)
            .map(|c| c.failures.len())
            .unwrap_or(0)
    }

    pub fn reset(&self, provider: ProviderId) {
        self.circuits.lock().remove(&provider);
    }

    /// Reset all circuits to closed.
    pub fn reset_all(&self) {
        self.circuits.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::advance;

    const P: ProviderId = ProviderId::OpenWeather;

    fn config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 3,
            failure_window: Duration::from_secs(60),
            recovery_time: Duration::from_secs(30),
        }
    }

    fn open_circuit(cb: &CircuitBreakerRegistry, cfg: &CircuitBreakerConfig) {
        for _ in 0..cfg.failure_threshold {
            cb.record_failure(P, cfg);
        }
        assert_eq!(cb.state(P), CircuitState::Open);
    }

    #[test]
    fn circuit_starts_closed() {
        let cb = CircuitBreakerRegistry::new();
        assert_eq!(cb.state(P), CircuitState::Closed);
        assert!(cb.can_request(P, &config()));
        assert_eq!(cb.time_until_retry(P, &config()), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn opens_exactly_at_threshold() {
        let cb = CircuitBreakerRegistry::new();
        let cfg = config();

        cb.record_failure(P, &cfg);
        cb.record_failure(P, &cfg);
        assert_eq!(cb.state(P), CircuitState::Closed);
        assert!(cb.can_request(P, &cfg));

        cb.record_failure(P, &cfg);
        assert_eq!(cb.state(P), CircuitState::Open);
        assert!(!cb.can_request(P, &cfg));
        assert_eq!(cb.failure_count(P), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_failures_do_not_count() {
        let cb = CircuitBreakerRegistry::new();
        let cfg = config();

        cb.record_failure(P, &cfg);
        cb.record_failure(P, &cfg);
        advance(Duration::from_secs(61)).await;

        cb.record_failure(P, &cfg);
        assert_eq!(cb.state(P), CircuitState::Closed);
        assert_eq!(cb.failure_count(P), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn success_keeps_in_window_failures() {
        let cb = CircuitBreakerRegistry::new();
        let cfg = config();

        cb.record_failure(P, &cfg);
        cb.record_failure(P, &cfg);
        cb.record_success(P, &cfg);
        assert_eq!(cb.failure_count(P), 2);

        cb.record_failure(P, &cfg);
        assert_eq!(cb.state(P), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn success_prunes_expired_failures() {
        let cb = CircuitBreakerRegistry::new();
        let cfg = config();

        cb.record_failure(P, &cfg);
        advance(Duration::from_secs(90)).await;
        cb.record_success(P, &cfg);
        assert_eq!(cb.failure_count(P), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn blocks_until_recovery_then_half_opens_once() {
        let cb = CircuitBreakerRegistry::new();
        let cfg = config();
        open_circuit(&cb, &cfg);

        advance(Duration::from_secs(10)).await;
        assert!(!cb.can_request(P, &cfg));
        assert_eq!(cb.time_until_retry(P, &cfg), Duration::from_secs(20));

        advance(Duration::from_secs(20)).await;
        assert_eq!(cb.state(P), CircuitState::Open);
        assert!(cb.can_request(P, &cfg));
        assert_eq!(cb.state(P), CircuitState::HalfOpen);
        assert_eq!(cb.time_until_retry(P, &cfg), Duration::ZERO);

        // Still half-open; no second transition happens.
        assert!(cb.can_request(P, &cfg));
        assert_eq!(cb.state(P), CircuitState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_probe_reopens_with_fresh_cooldown() {
        let cb = CircuitBreakerRegistry::new();
        let cfg = config();
        open_circuit(&cb, &cfg);

        advance(Duration::from_secs(30)).await;
        assert!(cb.can_request(P, &cfg));
        cb.record_failure(P, &cfg);

        assert_eq!(cb.state(P), CircuitState::Open);
        assert!(!cb.can_request(P, &cfg));
        assert_eq!(cb.time_until_retry(P, &cfg), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn successful_probe_closes_and_clears_history() {
        let cb = CircuitBreakerRegistry::new();
        let cfg = config();
        open_circuit(&cb, &cfg);

        advance(Duration::from_secs(30)).await;
        assert!(cb.can_request(P, &cfg));
        cb.record_success(P, &cfg);

        assert_eq!(cb.state(P), CircuitState::Closed);
        assert_eq!(cb.failure_count(P), 0);

        // A full threshold's worth of new failures is needed to reopen.
        cb.record_failure(P, &cfg);
        cb.record_failure(P, &cfg);
        assert_eq!(cb.state(P), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn providers_are_independent() {
        let cb = CircuitBreakerRegistry::new();
        let cfg = config();
        open_circuit(&cb, &cfg);

        assert!(!cb.can_request(P, &cfg));
        assert!(cb.can_request(ProviderId::WeatherApi, &cfg));
        assert_eq!(cb.state(ProviderId::WeatherApi), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_restores_closed_state() {
        let cb = CircuitBreakerRegistry::new();
        let cfg = config();
        open_circuit(&cb, &cfg);
        cb.record_failure(ProviderId::WeatherApi, &cfg);

        cb.reset(P);
        assert_eq!(cb.state(P), CircuitState::Closed);
        assert_eq!(cb.failure_count(ProviderId::WeatherApi), 1);

        open_circuit(&cb, &cfg);
        cb.reset_all();
        assert_eq!(cb.state(P), CircuitState::Closed);
        assert_eq!(cb.failure_count(ProviderId::WeatherApi), 0);
    }

    #[test]
    fn config_reads_millisecond_fields() {
        let cfg: CircuitBreakerConfig = toml::from_str(
            "failure_threshold = 5\nfailure_window_ms = 1000\nrecovery_time_ms = 250\n",
        )
        .unwrap();
        assert_eq!(cfg.failure_threshold, 5);
        assert_eq!(cfg.failure_window, Duration::from_secs(1));
        assert_eq!(cfg.recovery_time, Duration::from_millis(250));
    }
}
