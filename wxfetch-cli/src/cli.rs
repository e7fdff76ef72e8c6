use anyhow::{Context, bail};
use chrono::Local;
use clap::{Parser, Subcommand};
use inquire::{Confirm, Password, PasswordDisplayMode};

use wxfetch_core::{
    CachedWeather, Config, FetchResult, NormalizedWeather, ProviderId, ProviderStatus,
    WeatherOrchestrator, WeatherSettings,
};

/// Top-level CLI struct.
#[derive(Debug, Parser)]
#[command(name = "wxfetch", version, about = "Resilient current-conditions weather CLI")]
pub struct Cli {
    /// Enable debug logging (overridden by RUST_LOG).
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Configure credentials for a specific provider.
    Configure {
        /// Provider short name: "openmeteo", "openweather" or "weatherapi".
        provider: String,
    },

    /// Show current conditions at a coordinate.
    Show {
        /// Latitude in decimal degrees.
        #[arg(long, allow_negative_numbers = true)]
        lat: f64,

        /// Longitude in decimal degrees.
        #[arg(long, allow_negative_numbers = true)]
        lon: f64,

        /// Query Open-Meteo only, skipping fallback and circuit breakers.
        #[arg(long)]
        single: bool,

        /// Print the result as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Show which providers are configured and the cached reading.
    Status,

    /// Remove every cached reading.
    ClearCache,
}

impl Cli {
    pub async fn run(self) -> anyhow::Result<()> {
        match self.command {
            Command::Configure { provider } => configure(&provider),
            Command::Show {
                lat,
                lon,
                single,
                json,
            } => show(lat, lon, single, json).await,
            Command::Status => status(),
            Command::ClearCache => clear_cache(),
        }
    }
}

fn configure(provider: &str) -> anyhow::Result<()> {
    let id = ProviderId::try_from(provider)?;
    let mut config = Config::load()?;

    if id.requires_api_key() {
        let api_key = Password::new(&format!("API key for {id}:"))
            .with_display_mode(PasswordDisplayMode::Masked)
            .without_confirmation()
            .prompt()
            .context("Failed to read API key")?;

        let api_key = api_key.trim();
        if api_key.is_empty() {
            bail!("API key must not be empty");
        }
        config.upsert_provider_api_key(id, api_key.to_string());
    } else {
        println!("{id} does not need an API key.");
    }

    if config.settings.primary_provider != id {
        let make_primary = Confirm::new(&format!("Use {id} as the primary provider?"))
            .with_default(false)
            .prompt()
            .context("Failed to read answer")?;
        if make_primary {
            config.set_primary_provider(id);
        }
    }

    config.save()?;
    println!("Saved configuration to {}", Config::config_file_path()?.display());
    Ok(())
}

async fn show(lat: f64, lon: f64, single: bool, json: bool) -> anyhow::Result<()> {
    if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
        bail!("Coordinates out of range: lat must be within ±90, lon within ±180");
    }

    let config = Config::load()?;
    let orchestrator = WeatherOrchestrator::from_config(&config)?;
    tracing::debug!(
        lat,
        lon,
        single,
        primary = %config.settings.primary_provider,
        "fetching weather"
    );

    if single {
        let weather = orchestrator
            .fetch_weather(lat, lon, false, Some(&config.settings))
            .await?;
        if json {
            println!("{}", serde_json::to_string_pretty(&weather)?);
        } else {
            print_weather(&weather);
        }
        return Ok(());
    }

    let result = orchestrator
        .fetch_weather_with_fallback(lat, lon, &config.settings)
        .await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_result(&result);
    }
    Ok(())
}

fn status() -> anyhow::Result<()> {
    let config = Config::load()?;
    let orchestrator = WeatherOrchestrator::from_config(&config)?;

    println!("Providers:");
    for (id, status) in orchestrator.provider_status() {
        println!("{}", provider_row(id, &config.settings, &status));
    }

    println!();
    match orchestrator
        .cache()
        .get_cached_weather(None, config.cache.max_distance_km)
    {
        Some(hit) => print_cache_summary(&hit),
        None => println!("Cache: empty"),
    }
    Ok(())
}

/// Circuit state lives in memory only, so a fresh process has nothing
/// useful to report about it and the row leaves it out.
fn provider_row(id: ProviderId, settings: &WeatherSettings, status: &ProviderStatus) -> String {
    let role = if id == settings.primary_provider {
        "primary".to_string()
    } else if let Some(pos) = settings.fallback_order.iter().position(|p| *p == id) {
        format!("fallback #{}", pos + 1)
    } else {
        "unused".to_string()
    };
    let configured = if status.configured { "configured" } else { "not configured" };
    format!("  {id:<12} {role:<12} {configured}")
}

fn clear_cache() -> anyhow::Result<()> {
    let config = Config::load()?;
    let orchestrator = WeatherOrchestrator::from_config(&config)?;
    orchestrator.cache().clear_weather_cache();
    println!("Weather cache cleared.");
    Ok(())
}

fn print_result(result: &FetchResult) {
    print_weather(&result.weather);

    if result.from_cache {
        let freshness = result
            .freshness
            .map(|f| f.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        let age = result.cache_age_minutes.unwrap_or_default();
        println!("  Cached:       {age} min ago ({freshness})");
    }
    if !result.providers_attempted.is_empty() {
        let attempted: Vec<&str> = result.providers_attempted.iter().map(|p| p.as_str()).collect();
        println!("  Tried:        {}", attempted.join(" -> "));
    }
    for warning in &result.warnings {
        println!("  Warning:      {warning}");
    }
}

fn print_weather(w: &NormalizedWeather) {
    println!("{} ({:.4}, {:.4})", w.location_name, w.latitude, w.longitude);
    println!("  Temperature:  {:.1} °F", w.temperature_f);
    println!("  Humidity:     {:.0} %", w.humidity_pct);
    println!("  Pressure:     {:.2} inHg (station)", w.station_pressure_inhg);

    let mut wind = format!("{:.1} mph from {:.0}°", w.wind_speed_mph, w.wind_direction_deg);
    if let Some(gust) = w.wind_gust_mph {
        wind.push_str(&format!(", gusts {gust:.1} mph"));
    }
    println!("  Wind:         {wind}");

    if let Some(alt) = w.altitude_ft {
        println!("  Altitude:     {alt:.0} ft");
    }
    println!(
        "  Observed:     {}",
        w.observed_at.with_timezone(&Local).format("%Y-%m-%d %H:%M %Z")
    );
    println!("  Source:       {}", w.source);
}

fn print_cache_summary(hit: &CachedWeather) {
    println!(
        "Cache: {} from {} at {}, {} min old ({})",
        hit.weather.location_name,
        hit.weather.source,
        hit.cached_at.with_timezone(&Local).format("%Y-%m-%d %H:%M"),
        hit.age_minutes(),
        hit.freshness
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use wxfetch_core::CircuitState;

    fn status(configured: bool) -> ProviderStatus {
        ProviderStatus {
            state: CircuitState::Closed,
            configured,
        }
    }

    #[test]
    fn provider_rows_show_role_and_configuration() {
        let settings = WeatherSettings {
            fallback_order: vec![ProviderId::WeatherApi],
            ..WeatherSettings::default()
        };

        let primary = provider_row(ProviderId::OpenMeteo, &settings, &status(true));
        assert!(primary.contains("primary"));
        assert!(primary.trim_end().ends_with("configured"));

        let fallback = provider_row(ProviderId::WeatherApi, &settings, &status(false));
        assert!(fallback.contains("fallback #1"));
        assert!(fallback.contains("not configured"));

        let unused = provider_row(ProviderId::OpenWeather, &settings, &status(false));
        assert!(unused.contains("unused"));
    }

    #[test]
    fn provider_rows_omit_circuit_state() {
        let settings = WeatherSettings::default();
        let row = provider_row(ProviderId::OpenMeteo, &settings, &status(true));
        assert!(!row.contains("circuit"));
        assert!(!row.contains("closed"));
    }
}
