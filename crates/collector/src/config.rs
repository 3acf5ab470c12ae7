use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::aggregate::{CostRates, GroupLabels};
use crate::store::{DatabaseConfig, DatabaseType};
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct Config {
    pub rates: CostRates,
    pub labels: GroupLabels,
    pub window_hours: u32,
    pub namespace_allowlist: Vec<String>,
    pub dashboard_url: Option<String>,
    pub webhook_timeout: Duration,
    pub database: DatabaseConfig,
}

impl Config {
    pub fn load() -> Result<Self> {
        // Load environment variables from .env file if it exists
        let _ = dotenvy::dotenv();

        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from any key lookup, so callers other than
    /// [`Config::load`] never touch the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let rates = CostRates {
            cpu_per_mcpu_hour: required_rate(var("RATE_CPU_MCPU_HOUR"), "RATE_CPU_MCPU_HOUR")?,
            mem_per_mib_hour: required_rate(var("RATE_MEM_MIB_HOUR"), "RATE_MEM_MIB_HOUR")?,
        };

        let defaults = GroupLabels::default();
        let labels = GroupLabels {
            team: var("LABEL_TEAM").unwrap_or(defaults.team),
            app: var("LABEL_APP").unwrap_or(defaults.app),
        };

        let window_hours: u32 = parse_or(var("WINDOW_HOURS"), "WINDOW_HOURS", 1)?;
        if window_hours == 0 {
            return Err(Error::Config("WINDOW_HOURS must be at least 1".to_string()));
        }

        let database = DatabaseConfig {
            db_type: match var("DATABASE_TYPE")
                .unwrap_or_else(|| "sqlite".to_string())
                .to_lowercase()
                .as_str()
            {
                "sqlite" => DatabaseType::Sqlite,
                "postgres" | "postgresql" => DatabaseType::Postgres,
                other => return Err(Error::Config(format!("Unknown DATABASE_TYPE: {}", other))),
            },
            sqlite_path: Some(
                var("SQLITE_PATH")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("data/chargeback.db")),
            ),
            connection_string: var("DATABASE_URL"),
            max_connections: parse_or(var("DATABASE_MAX_CONNECTIONS"), "DATABASE_MAX_CONNECTIONS", 5)?,
        };
        database.validate().map_err(Error::Config)?;

        Ok(Config {
            rates,
            labels,
            window_hours,
            namespace_allowlist: var("NAMESPACE_ALLOWLIST")
                .map(|raw| parse_allowlist(&raw))
                .unwrap_or_default(),
            dashboard_url: var("DASHBOARD_URL"),
            webhook_timeout: Duration::from_secs(parse_or(var("WEBHOOK_TIMEOUT_SECS"), "WEBHOOK_TIMEOUT_SECS", 10)?),
            database,
        })
    }
}

pub fn parse_allowlist(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|ns| !ns.is_empty())
        .map(str::to_string)
        .collect()
}

fn required_rate(value: Option<String>, key: &str) -> Result<f64> {
    let value = value.ok_or_else(|| Error::Config(format!("{} must be set", key)))?;
    let rate: f64 = value
        .parse()
        .map_err(|_| Error::Config(format!("{} is not a number: {}", key, value)))?;
    if !rate.is_finite() || rate < 0.0 {
        return Err(Error::Config(format!("{} must be a non-negative number: {}", key, value)));
    }
    Ok(rate)
}

fn parse_or<T: FromStr>(value: Option<String>, key: &str, default: T) -> Result<T> {
    match value {
        Some(v) => v
            .parse()
            .map_err(|_| Error::Config(format!("{} has an invalid value: {}", key, v))),
        None => Ok(default),
    }
}
