//! Run configuration, read once from the environment and passed down explicitly.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use sqlx::postgres::PgSslMode;
use thiserror::Error;
use tori_core::{parse_period, validate_table_name, Credentials};
use tori_http::HttpClientConfig;

pub const DEFAULT_TABLE_NAME: &str = "ToriReports";
const DEFAULT_PG_PORT: u16 = 5432;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var} env var missing")]
    Missing { var: &'static str },
    #[error("{var}={value:?} is invalid: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Clone)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
    pub ssl_mode: PgSslMode,
    pub timeout: Duration,
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("ssl_mode", &self.ssl_mode)
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub credentials: Credentials,
    pub reports_endpoint: String,
    pub database: DatabaseConfig,
    pub period: chrono::Duration,
    pub table_name: String,
    pub http: HttpClientConfig,
}

impl IngestConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from any variable source; `from_env` passes the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars(lookup);

        let (host, port) = split_host_port(&vars.required("SQL_SERVER")?)?;
        let ssl_mode = match vars.optional("SQL_SSLMODE") {
            Some(raw) => PgSslMode::from_str(&raw).map_err(|err| ConfigError::Invalid {
                var: "SQL_SSLMODE",
                value: raw.clone(),
                reason: err.to_string(),
            })?,
            None => PgSslMode::Require,
        };

        let period = match vars.optional("PERIOD") {
            Some(raw) => parse_period(&raw).map_err(|err| ConfigError::Invalid {
                var: "PERIOD",
                value: raw.clone(),
                reason: err.to_string(),
            })?,
            None => chrono::Duration::hours(24),
        };

        let table_name = vars
            .optional("TABLE_NAME")
            .unwrap_or_else(|| DEFAULT_TABLE_NAME.to_string());
        validate_table_name(&table_name).map_err(|err| ConfigError::Invalid {
            var: "TABLE_NAME",
            value: table_name.clone(),
            reason: err.to_string(),
        })?;

        let defaults = HttpClientConfig::default();
        Ok(Self {
            credentials: Credentials {
                client_id: vars.required("CLIENT_ID")?,
                client_secret: vars.required("CLIENT_SECRET")?,
                token_endpoint: vars.required("TOKEN_ENDPOINT")?,
                scope: vars.optional("TOKEN_SCOPE"),
            },
            reports_endpoint: vars.required("REPORTS_ENDPOINT")?,
            database: DatabaseConfig {
                host,
                port,
                database: vars.required("SQL_DATABASE")?,
                username: vars.required("SQL_USERNAME")?,
                password: vars.required("SQL_PASSWORD")?,
                ssl_mode,
                timeout: vars.secs("TORI_DB_TIMEOUT_SECS", 30)?,
            },
            period,
            table_name,
            http: HttpClientConfig {
                user_agent: vars
                    .optional("TORI_USER_AGENT")
                    .unwrap_or(defaults.user_agent),
                token_timeout: vars.secs("TORI_TOKEN_TIMEOUT_SECS", 30)?,
                report_timeout: vars.secs("TORI_REPORT_TIMEOUT_SECS", 60)?,
            },
        })
    }
}

struct Vars<F>(F);

impl<F> Vars<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn optional(&self, var: &str) -> Option<String> {
        (self.0)(var).filter(|v| !v.trim().is_empty())
    }

    fn required(&self, var: &'static str) -> Result<String, ConfigError> {
        self.optional(var).ok_or(ConfigError::Missing { var })
    }

    fn secs(&self, var: &'static str, default: u64) -> Result<Duration, ConfigError> {
        match self.optional(var) {
            None => Ok(Duration::from_secs(default)),
            Some(raw) => match raw.trim().parse::<u64>() {
                Ok(secs) if secs > 0 => Ok(Duration::from_secs(secs)),
                _ => Err(ConfigError::Invalid {
                    var,
                    value: raw,
                    reason: "expected a positive number of seconds".to_string(),
                }),
            },
        }
    }
}

/// Accepts `host`, `host:port` and the `host,port` form used by SQL Server connection strings.
fn split_host_port(server: &str) -> Result<(String, u16), ConfigError> {
    let server = server.trim().trim_start_matches("tcp:");
    match server.rsplit_once([':', ',']) {
        Some((host, port)) => {
            let port = port.trim().parse().map_err(|_| ConfigError::Invalid {
                var: "SQL_SERVER",
                value: server.to_string(),
                reason: "port is not a number".to_string(),
            })?;
            Ok((host.trim().to_string(), port))
        }
        None => Ok((server.to_string(), DEFAULT_PG_PORT)),
    }
}
