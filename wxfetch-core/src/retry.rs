//! Retry utilities for provider calls: exponential backoff with jitter,
//! retryability classification and a timeout-bounded HTTP send.
//!
//! Retries here are local to a single provider attempt. Moving on to a
//! different provider is the orchestrator's job.

use std::error::Error as StdError;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::duration_ms;
use crate::error::{RETRYABLE_STATUS_CODES, WeatherError};
use crate::provider::ProviderId;

pub const DEFAULT_MAX_RETRIES: u32 = 2;
pub const DEFAULT_BASE_DELAY_MS: u64 = 500;
pub const DEFAULT_MAX_DELAY_MS: u64 = 4000;
pub const DEFAULT_JITTER_MS: u64 = 250;

/// Backoff policy for one provider attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt; total attempts = `max_retries + 1`.
    pub max_retries: u32,
    #[serde(rename = "base_delay_ms", with = "duration_ms")]
    pub base_delay: Duration,
    #[serde(rename = "max_delay_ms", with = "duration_ms")]
    pub max_delay: Duration,
    /// Upper bound of the uniform random delay added to every backoff.
    #[serde(rename = "jitter_ms", with = "duration_ms")]
    pub jitter: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: Duration::from_millis(DEFAULT_BASE_DELAY_MS),
            max_delay: Duration::from_millis(DEFAULT_MAX_DELAY_MS),
            jitter: Duration::from_millis(DEFAULT_JITTER_MS),
        }
    }
}

impl RetryConfig {
    pub fn new(max_retries: u32, base_delay_ms: u64, max_delay_ms: u64, jitter_ms: u64) -> Self {
        Self {
            max_retries,
            base_delay: Duration::from_millis(base_delay_ms),
            max_delay: Duration::from_millis(max_delay_ms),
            jitter: Duration::from_millis(jitter_ms),
        }
    }
}

/// `min(base * 2^attempt, max) + uniform(0..=jitter)`.
pub fn calculate_backoff_delay(attempt: u32, config: &RetryConfig) -> Duration {
    let base_ms = config.base_delay.as_millis() as u64;
    let max_ms = config.max_delay.as_millis() as u64;
    let factor = 2u64.saturating_pow(attempt);
    let capped = base_ms.saturating_mul(factor).min(max_ms);

    let jitter_ms = config.jitter.as_millis() as u64;
    let jitter = if jitter_ms == 0 {
        0
    } else {
        fastrand::u64(0..=jitter_ms)
    };

    Duration::from_millis(capped.saturating_add(jitter))
}

/// Decide whether an error is worth another attempt against the same provider.
///
/// Classified [`WeatherError`]s carry their own flag. Raw transport failures
/// from `reqwest` count as generic network failures. Anything else is only
/// retryable if it carries one of [`RETRYABLE_STATUS_CODES`].
pub fn is_retryable_error(err: &(dyn StdError + 'static)) -> bool {
    if let Some(weather) = err.downcast_ref::<WeatherError>() {
        return weather.retryable || weather.status.is_some_and(is_retryable_status);
    }

    if let Some(http) = err.downcast_ref::<reqwest::Error>() {
        if http.is_timeout() || http.is_connect() || http.is_request() {
            return true;
        }
        return http
            .status()
            .is_some_and(|status| is_retryable_status(status.as_u16()));
    }

    false
}

fn is_retryable_status(status: u16) -> bool {
    RETRYABLE_STATUS_CODES.contains(&status)
}

/// Run `operation`, retrying retryable failures with exponential backoff.
///
/// A non-retryable error is returned immediately without consuming a retry.
/// Once `max_retries` is exhausted the last error is returned.
pub async fn with_retry<T, E, F, Fut>(config: &RetryConfig, mut operation: F) -> Result<T, E>
where
    E: StdError + 'static,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    tracing::debug!(retries = attempt, "operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) => {
                if !is_retryable_error(&err) {
                    tracing::debug!(error = %err, "non-retryable error");
                    return Err(err);
                }

                if attempt >= config.max_retries {
                    tracing::debug!(
                        attempts = attempt + 1,
                        error = %err,
                        "retry attempts exhausted"
                    );
                    return Err(err);
                }

                let delay = calculate_backoff_delay(attempt, config);
                tracing::debug!(
                    attempt = attempt + 1,
                    max_retries = config.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retryable error, backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// Send `request`, failing with a retryable `TIMEOUT` if no response arrives
/// within `timeout`. Transport errors become `NETWORK_ERROR` with the
/// underlying `reqwest::Error` kept as the source.
///
/// The timer belongs to the returned future and is dropped with it, whether
/// the send completes, fails or times out.
pub async fn fetch_with_timeout(
    provider: ProviderId,
    request: reqwest::RequestBuilder,
    timeout: Duration,
) -> Result<reqwest::Response, WeatherError> {
    match tokio::time::timeout(timeout, request.send()).await {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(err)) if err.is_timeout() => Err(WeatherError::timeout(
            provider,
            timeout.as_millis() as u64,
        )
        .with_source(err)),
        Ok(Err(err)) => Err(WeatherError::network(provider, err)),
        Err(_elapsed) => Err(WeatherError::timeout(provider, timeout.as_millis() as u64)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, thiserror::Error)]
    #[error("opaque failure")]
    struct Opaque;

    fn retryable(provider: ProviderId) -> WeatherError {
        WeatherError::from_status(provider, 503, "unavailable")
    }

    fn fatal(provider: ProviderId) -> WeatherError {
        WeatherError::from_status(provider, 401, "bad key")
    }

    #[test]
    fn retry_config_default() {
        let config = RetryConfig::default();
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.base_delay, Duration::from_millis(500));
        assert_eq!(config.max_delay, Duration::from_millis(4000));
        assert_eq!(config.jitter, Duration::from_millis(250));
    }

    #[test]
    fn delay_without_jitter_doubles_until_cap() {
        let config = RetryConfig::new(10, 100, 1000, 0);

        assert_eq!(calculate_backoff_delay(0, &config), Duration::from_millis(100));
        assert_eq!(calculate_backoff_delay(1, &config), Duration::from_millis(200));
        assert_eq!(calculate_backoff_delay(2, &config), Duration::from_millis(400));
        assert_eq!(calculate_backoff_delay(3, &config), Duration::from_millis(800));
        assert_eq!(calculate_backoff_delay(4, &config), Duration::from_millis(1000));
        assert_eq!(calculate_backoff_delay(63, &config), Duration::from_millis(1000));
        assert_eq!(calculate_backoff_delay(200, &config), Duration::from_millis(1000));
    }

    #[test]
    fn delay_stays_within_jitter_bounds() {
        let config = RetryConfig::new(5, 100, 1000, 50);

        for attempt in 0..8 {
            let floor = (100u64 << attempt).min(1000);
            for _ in 0..50 {
                let delay = calculate_backoff_delay(attempt, &config).as_millis() as u64;
                assert!(delay >= floor, "attempt {attempt}: {delay} < {floor}");
                assert!(delay <= floor + 50, "attempt {attempt}: {delay} > {}", floor + 50);
            }
        }
    }

    #[test]
    fn classified_errors_use_their_flag() {
        assert!(is_retryable_error(&retryable(ProviderId::OpenWeather)));
        assert!(is_retryable_error(&WeatherError::timeout(ProviderId::OpenWeather, 10)));
        assert!(!is_retryable_error(&fatal(ProviderId::OpenWeather)));

        let parse_err = serde_json::from_str::<u32>("nope").unwrap_err();
        assert!(!is_retryable_error(&WeatherError::parse(ProviderId::OpenMeteo, parse_err)));
    }

    #[test]
    fn status_code_on_unflagged_error_is_retryable() {
        let err = WeatherError::new(ErrorCode::ApiError, "gateway").with_status(502);
        assert!(is_retryable_error(&err));
    }

    #[test]
    fn unrecognized_errors_are_not_retryable() {
        assert!(!is_retryable_error(&Opaque));
    }

    #[tokio::test]
    async fn connection_failure_is_retryable() {
        let err = reqwest::Client::new()
            .get("http://127.0.0.1:9/unreachable")
            .send()
            .await
            .unwrap_err();
        assert!(is_retryable_error(&err));
    }

    #[tokio::test(start_paused = true)]
    async fn with_retry_recovers_from_transient_failures() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let config = RetryConfig::new(3, 100, 1000, 0);

        let result: Result<&str, WeatherError> = with_retry(&config, || async move {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(retryable(ProviderId::OpenMeteo))
            } else {
                Ok("done")
            }
        })
        .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn with_retry_fails_fast_on_fatal_error() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let config = RetryConfig::new(3, 100, 1000, 0);

        let result: Result<(), WeatherError> = with_retry(&config, || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(fatal(ProviderId::WeatherApi))
        })
        .await;

        assert_eq!(result.unwrap_err().status, Some(401));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn with_retry_returns_last_error_after_exhaustion() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let config = RetryConfig::new(2, 100, 1000, 0);
        let started = tokio::time::Instant::now();

        let result: Result<(), WeatherError> = with_retry(&config, || async move {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            Err(WeatherError::timeout(ProviderId::OpenMeteo, u64::from(n)))
        })
        .await;

        let err = result.unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(err.message.contains("after 2ms"));
        // 100ms + 200ms of backoff
        assert!(started.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test]
    async fn fetch_with_timeout_maps_elapsed_to_timeout() {
        use wiremock::matchers::method;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;

        let request = reqwest::Client::new().get(server.uri());
        let err = fetch_with_timeout(ProviderId::OpenMeteo, request, Duration::from_millis(50))
            .await
            .unwrap_err();

        assert_eq!(err.code, ErrorCode::Timeout);
        assert!(err.retryable);
        assert!(err.message.contains("50ms"));
    }

    #[tokio::test]
    async fn fetch_with_timeout_passes_responses_through() {
        use wiremock::matchers::method;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let request = reqwest::Client::new().get(server.uri());
        let response = fetch_with_timeout(ProviderId::OpenMeteo, request, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 503);
    }
}
