use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(rename = "type")]
    pub db_type: DatabaseType,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub sqlite_path: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_string: Option<String>,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    Sqlite,
    Postgres,
}

fn default_max_connections() -> u32 {
    5
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            db_type: DatabaseType::Sqlite,
            sqlite_path: Some(PathBuf::from("data/chargeback.db")),
            connection_string: None,
            max_connections: default_max_connections(),
        }
    }
}

impl DatabaseConfig {
    /// In-memory SQLite, used by tests.
    pub fn in_memory() -> Self {
        Self {
            sqlite_path: Some(PathBuf::from(":memory:")),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        match self.db_type {
            DatabaseType::Sqlite => {
                if self.sqlite_path.is_none() {
                    return Err("SQLite path is required for SQLite database type".to_string());
                }
            }
            DatabaseType::Postgres => {
                if self.connection_string.is_none() {
                    return Err("Connection string is required for PostgreSQL database type".to_string());
                }
            }
        }
        if self.max_connections == 0 {
            return Err("max_connections must be at least 1".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate() {
        assert!(DatabaseConfig::default().validate().is_ok());
        assert!(DatabaseConfig::in_memory().validate().is_ok());

        let postgres = DatabaseConfig {
            db_type: DatabaseType::Postgres,
            connection_string: None,
            ..DatabaseConfig::default()
        };
        assert!(postgres.validate().is_err());

        let no_pool = DatabaseConfig {
            max_connections: 0,
            ..DatabaseConfig::default()
        };
        assert!(no_pool.validate().is_err());
    }
}
