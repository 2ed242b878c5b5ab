use std::path::Path;

use anyhow::Context;
use chrono::FixedOffset;

use crate::cycles::{EngineConfig, DEFAULT_HORIZON_YEARS, MAX_HORIZON_YEARS};
use crate::schedule::WeekdayLabels;
use crate::sink::DEFAULT_SINK_URL;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub sink_url: String,
    pub engine: EngineConfig,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = std::env::var("DATABASE_URL")
            .context("DATABASE_URL must be set to a production Postgres instance")?;
        let sink_url =
            std::env::var("NOTIFY_SINK_URL").unwrap_or_else(|_| DEFAULT_SINK_URL.to_string());
        let horizon_years = match std::env::var("CYCLE_HORIZON_YEARS") {
            Ok(value) => parse_horizon(&value)?,
            Err(_) => DEFAULT_HORIZON_YEARS,
        };
        let labels = match std::env::var("WEEKDAY_LABELS_FILE") {
            Ok(path) => load_labels(Path::new(&path))?,
            Err(_) => WeekdayLabels::default(),
        };
        let defaults = EngineConfig::default();
        let utc_offset = match std::env::var("CENTER_UTC_OFFSET") {
            Ok(value) => parse_offset(&value)?,
            Err(_) => defaults.utc_offset,
        };

        Ok(Self {
            database_url,
            sink_url,
            engine: EngineConfig {
                labels,
                horizon_years,
                utc_offset,
            },
        })
    }
}

fn parse_horizon(value: &str) -> anyhow::Result<u32> {
    let years: u32 = value
        .trim()
        .parse()
        .with_context(|| format!("CYCLE_HORIZON_YEARS must be a whole number, got '{value}'"))?;
    anyhow::ensure!(
        (1..=MAX_HORIZON_YEARS).contains(&years),
        "CYCLE_HORIZON_YEARS must be between 1 and {MAX_HORIZON_YEARS}, got {years}"
    );
    Ok(years)
}

/// Parses an offset such as `+05:00` or `-03:30`.
fn parse_offset(value: &str) -> anyhow::Result<FixedOffset> {
    value
        .trim()
        .parse::<FixedOffset>()
        .with_context(|| format!("CENTER_UTC_OFFSET must look like +05:00, got '{value}'"))
}

/// Reads a JSON object mapping day labels to weekday indices (0 = Sunday).
pub fn load_labels(path: &Path) -> anyhow::Result<WeekdayLabels> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read weekday labels from {}", path.display()))?;
    let labels: WeekdayLabels = serde_json::from_str(&raw)
        .with_context(|| format!("invalid weekday labels in {}", path.display()))?;
    anyhow::ensure!(!labels.is_empty(), "weekday labels file {} is empty", path.display());
    tracing::info!(path = %path.display(), count = labels.len(), "loaded weekday labels");
    Ok(labels)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn horizon_must_be_a_bounded_positive_integer() {
        assert_eq!(parse_horizon("3").unwrap(), 3);
        assert_eq!(parse_horizon(" 2 ").unwrap(), 2);
        assert!(parse_horizon("0").is_err());
        assert!(parse_horizon("two").is_err());
        assert_eq!(parse_horizon("50").unwrap(), MAX_HORIZON_YEARS);
        assert!(parse_horizon("51").is_err());
        assert!(parse_horizon("400000000").is_err());
    }

    #[test]
    fn offsets_parse_with_sign_and_minutes() {
        assert_eq!(parse_offset("+05:00").unwrap().local_minus_utc(), 5 * 3600);
        assert_eq!(parse_offset(" -03:30 ").unwrap().local_minus_utc(), -(3 * 3600 + 1800));
        assert!(parse_offset("Tashkent").is_err());
    }

    #[test]
    fn labels_file_round_trips_through_disk() {
        let path = std::env::temp_dir().join(format!("labels-{}.json", uuid::Uuid::new_v4()));
        std::fs::write(&path, r#"{"Lunes": 1, "Miercoles": 3, "Viernes": 5}"#).unwrap();

        let labels = load_labels(&path).unwrap();
        assert_eq!(labels.index_of("viernes"), Some(5));
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn empty_labels_file_is_rejected() {
        let path = std::env::temp_dir().join(format!("labels-{}.json", uuid::Uuid::new_v4()));
        std::fs::write(&path, "{}").unwrap();

        assert!(load_labels(&path).is_err());
        std::fs::remove_file(&path).unwrap();
    }
}
