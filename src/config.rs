use clap::Parser;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::Path;

/// Accepts a raw integer (seconds) or a humantime-style string (`"30s"`,
/// `"5m"`, `"1h"`) for any duration-shaped config field.
fn deserialize_duration_seconds<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    struct DurationSecondsVisitor;

    impl<'de> Visitor<'de> for DurationSecondsVisitor {
        type Value = u64;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("an integer number of seconds or a humantime string like \"30s\", \"5m\", \"1h\"")
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
            Ok(v)
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
            u64::try_from(v).map_err(|_| E::custom("duration must not be negative"))
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
            parse_humantime_seconds(v).ok_or_else(|| E::custom(format!("invalid duration string '{v}'")))
        }
    }

    deserializer.deserialize_any(DurationSecondsVisitor)
}

/// Same as [`deserialize_duration_seconds`] but for an `Option<u64>` field
/// (the per-environment safety overrides, which are all optional).
fn deserialize_optional_duration_seconds<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Int(u64),
        Str(String),
    }

    match Option::<Raw>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Raw::Int(n)) => Ok(Some(n)),
        Some(Raw::Str(s)) => {
            parse_humantime_seconds(&s).map(Some).ok_or_else(|| de::Error::custom(format!("invalid duration string '{s}'")))
        },
    }
}

/// Parses `"30s"`/`"5m"`/`"1h"` (a leading integer plus a single-letter
/// unit) into whole seconds. A bare digit string with no unit is seconds.
fn parse_humantime_seconds(s: &str) -> Option<u64> {
    let s = s.trim();
    if let Ok(n) = s.parse::<u64>() {
        return Some(n);
    }
    let (digits, unit) = s.split_at(s.len().checked_sub(1)?);
    let n: u64 = digits.parse().ok()?;
    match unit {
        "s" => Some(n),
        "m" => Some(n * 60),
        "h" => Some(n * 3600),
        _ => None,
    }
}

/// Wraps a secret value so `Debug`/`Display` never print it. Call [`Secret::reveal`]
/// only at the point a connection is actually opened.
#[derive(Clone, Deserialize, Default)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn reveal(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret(***)")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "***")
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub database: DatabaseConfig,
    pub safety: SafetyConfig,
    pub risk_weights: RiskWeights,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { host: "0.0.0.0".to_string(), port: 8080 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info,sql_gateway=debug".to_string(), file: None }
    }
}

/// Per-environment connection components. `server`/`database`/`user` are plain text;
/// `password` is a [`Secret`] to keep it out of `Debug` output and logs.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ConnectionComponents {
    pub server: String,
    pub database: String,
    pub user: String,
    pub password: Secret,
}

impl ConnectionComponents {
    /// Heuristic used to decide whether it is safe to trust the server's TLS
    /// certificate without verifying it against a CA (local/docker hosts only).
    pub fn is_local(&self) -> bool {
        matches!(self.server.as_str(), "localhost" | "127.0.0.1")
            || !self.server.contains('.')
            || self.server.starts_with("sql-server")
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Per-environment credential sets, keyed by environment name (e.g. "Int", "Stg", "Prd").
    pub connection_components: HashMap<String, ConnectionComponents>,
    pub connection_pool_size: usize,
    #[serde(deserialize_with = "deserialize_duration_seconds")]
    pub connection_timeout_seconds: u64,
    #[serde(deserialize_with = "deserialize_duration_seconds")]
    pub command_timeout_seconds: u64,
    #[serde(deserialize_with = "deserialize_duration_seconds")]
    pub max_command_timeout_seconds: u64,
    pub app_name: String,
    /// Non-empty means restrict `query_readonly`/`explain` targets to this set
    /// (case-insensitive membership).
    pub allowed_databases: Vec<String>,
}

impl DatabaseConfig {
    pub fn environments(&self) -> impl Iterator<Item = &str> {
        self.connection_components.keys().map(String::as_str)
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            connection_components: HashMap::new(),
            connection_pool_size: 10,
            connection_timeout_seconds: 30,
            command_timeout_seconds: 30,
            max_command_timeout_seconds: 120,
            app_name: "sql-gateway".to_string(),
            allowed_databases: Vec::new(),
        }
    }
}

/// Per-environment safety overrides. Every field optional; an unset field falls
/// back to [`SafetyConfig`]'s matching global default via [`SafetyConfig::get_env_setting`].
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct EnvironmentSafetyOverride {
    pub max_rows: Option<usize>,
    #[serde(deserialize_with = "deserialize_optional_duration_seconds", default)]
    pub max_execution_time_seconds: Option<u64>,
    pub max_payload_size_mb: Option<u64>,
    pub query_cost_threshold: Option<f64>,
    pub enable_nolock_hint: Option<bool>,
    pub enable_resource_hints: Option<bool>,
    pub maxdop: Option<i32>,
    pub max_grant_percent: Option<i32>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    pub max_rows: usize,
    #[serde(deserialize_with = "deserialize_duration_seconds")]
    pub max_execution_time_seconds: u64,
    pub max_payload_size_mb: u64,
    pub query_cost_threshold: f64,
    pub enable_nolock_hint: bool,
    pub enable_resource_hints: bool,
    pub maxdop: i32,
    pub max_grant_percent: i32,
    pub enable_cost_check: bool,
    pub allow_linked_servers: bool,
    pub max_concurrent_queries: usize,
    pub max_concurrent_queries_per_user: usize,
    pub environments: HashMap<String, EnvironmentSafetyOverride>,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            max_rows: 10_000,
            max_execution_time_seconds: 30,
            max_payload_size_mb: 10,
            query_cost_threshold: 50.0,
            enable_nolock_hint: false,
            enable_resource_hints: true,
            maxdop: 1,
            max_grant_percent: 10,
            enable_cost_check: true,
            allow_linked_servers: false,
            max_concurrent_queries: 5,
            max_concurrent_queries_per_user: 2,
            environments: HashMap::new(),
        }
    }
}

impl SafetyConfig {
    pub fn max_rows(&self, env: &str) -> usize {
        self.environments.get(env).and_then(|o| o.max_rows).unwrap_or(self.max_rows)
    }

    pub fn max_execution_time_seconds(&self, env: &str) -> u64 {
        self.environments
            .get(env)
            .and_then(|o| o.max_execution_time_seconds)
            .unwrap_or(self.max_execution_time_seconds)
    }

    pub fn max_payload_size_mb(&self, env: &str) -> u64 {
        self.environments
            .get(env)
            .and_then(|o| o.max_payload_size_mb)
            .unwrap_or(self.max_payload_size_mb)
    }

    pub fn query_cost_threshold(&self, env: &str) -> f64 {
        self.environments
            .get(env)
            .and_then(|o| o.query_cost_threshold)
            .unwrap_or(self.query_cost_threshold)
    }

    pub fn enable_nolock_hint(&self, env: &str) -> bool {
        self.environments
            .get(env)
            .and_then(|o| o.enable_nolock_hint)
            .unwrap_or(self.enable_nolock_hint)
    }

    pub fn enable_resource_hints(&self, env: &str) -> bool {
        self.environments
            .get(env)
            .and_then(|o| o.enable_resource_hints)
            .unwrap_or(self.enable_resource_hints)
    }

    pub fn maxdop(&self, env: &str) -> i32 {
        self.environments.get(env).and_then(|o| o.maxdop).unwrap_or(self.maxdop)
    }

    pub fn max_grant_percent(&self, env: &str) -> i32 {
        self.environments
            .get(env)
            .and_then(|o| o.max_grant_percent)
            .unwrap_or(self.max_grant_percent)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RiskWeights {
    pub no_where_clause: u32,
    pub cross_join: u32,
    pub wildcard_select: u32,
    pub dynamic_sql: u32,
    pub ddl_statement: u32,
    pub table_scan: u32,
    pub missing_index: u32,
    pub best_practice: u32,
}

impl Default for RiskWeights {
    fn default() -> Self {
        Self {
            no_where_clause: 100,
            cross_join: 80,
            wildcard_select: 20,
            dynamic_sql: 90,
            ddl_statement: 100,
            table_scan: 60,
            missing_index: 40,
            best_practice: 5,
        }
    }
}

/// Command line arguments for configuration overrides.
#[derive(Parser, Debug, Clone)]
#[command(name = "sql-gateway")]
#[command(version, about = "Policy-enforcing SQL review and execution gateway")]
pub struct CommandLineArgs {
    /// Path to configuration file
    #[arg(long, value_name = "PATH")]
    pub config: Option<String>,

    /// Server host (overrides config file)
    #[arg(long, value_name = "HOST")]
    pub server_host: Option<String>,

    /// Server port (overrides config file)
    #[arg(long, value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Logging level (overrides config file, e.g. "info,sql_gateway=debug")
    #[arg(long, value_name = "LEVEL")]
    pub log_level: Option<String>,
}

impl Config {
    /// Load configuration with command line, environment variable, and file support.
    ///
    /// Precedence, highest to lowest: CLI args > env vars > config file > defaults.
    pub fn load() -> Result<Self, anyhow::Error> {
        // Best-effort: a missing .env is normal in production, where real env vars are set directly.
        dotenvy::dotenv().ok();

        let cli_args = CommandLineArgs::parse();

        let config_path = cli_args.config.clone().or_else(Self::find_config_file);
        let mut config = if let Some(config_path) = config_path {
            Self::from_toml(&config_path)?
        } else {
            tracing::warn!("configuration file not found, using defaults");
            Config::default()
        };

        config.apply_env_overrides();
        config.apply_cli_overrides(&cli_args);
        config.validate()?;

        Ok(config)
    }

    /// Supported environment variables:
    /// - `APP_SERVER_HOST`, `APP_SERVER_PORT`, `APP_LOG_LEVEL`
    /// - `DB_SERVER_{ENV}`, `DB_DATABASE_{ENV}`, `DB_USERNAME_{ENV}`, `DB_PASSWORD_{ENV}`:
    ///   all four required together to define/override the credential set for `{ENV}`.
    fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("APP_SERVER_HOST") {
            self.server.host = host;
        }
        if let Ok(port) = std::env::var("APP_SERVER_PORT")
            && let Ok(port) = port.parse()
        {
            self.server.port = port;
        }
        if let Ok(level) = std::env::var("APP_LOG_LEVEL") {
            self.logging.level = level;
        }

        for env_name in self.known_environments() {
            let server = std::env::var(format!("DB_SERVER_{env_name}"));
            let database = std::env::var(format!("DB_DATABASE_{env_name}"));
            let user = std::env::var(format!("DB_USERNAME_{env_name}"));
            let password = std::env::var(format!("DB_PASSWORD_{env_name}"));

            if let (Ok(server), Ok(database), Ok(user), Ok(password)) =
                (server, database, user, password)
            {
                self.database.connection_components.insert(
                    env_name.clone(),
                    ConnectionComponents { server, database, user, password: Secret(password) },
                );
                tracing::info!(environment = %env_name, "loaded credentials from environment");
            }
        }
    }

    /// Environments known either from the file or from a bare `DB_SERVER_{ENV}` set
    /// already present before this override pass. We only scan keys already
    /// configured in the file to avoid guessing arbitrary environment names.
    fn known_environments(&self) -> Vec<String> {
        self.database.connection_components.keys().cloned().collect()
    }

    fn apply_cli_overrides(&mut self, args: &CommandLineArgs) {
        if let Some(host) = &args.server_host {
            self.server.host = host.clone();
        }
        if let Some(port) = args.server_port {
            self.server.port = port;
        }
        if let Some(level) = &args.log_level {
            self.logging.level = level.clone();
        }
    }

    /// Fail closed at startup rather than at first query.
    fn validate(&self) -> Result<(), anyhow::Error> {
        if self.server.port == 0 {
            anyhow::bail!("server port cannot be 0");
        }
        if self.database.connection_pool_size == 0 {
            anyhow::bail!("database.connection_pool_size must be > 0");
        }
        for (env, creds) in &self.database.connection_components {
            if creds.server.is_empty() || creds.database.is_empty() || creds.user.is_empty() {
                anyhow::bail!("environment '{env}' is missing server/database/user");
            }
        }
        if self.database.connection_components.is_empty() {
            tracing::warn!("no environments configured; every review/execute call will fail");
        }
        Ok(())
    }

    fn find_config_file() -> Option<String> {
        let possible_paths = ["conf/config.toml", "config.toml", "./conf/config.toml", "./config.toml"];
        possible_paths.iter().find(|p| Path::new(p).exists()).map(|p| p.to_string())
    }

    fn from_toml(path: &str) -> Result<Self, anyhow::Error> {
        let content = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_override_getters_fall_back_to_global() {
        let mut safety = SafetyConfig::default();
        safety.environments.insert(
            "Prd".to_string(),
            EnvironmentSafetyOverride { max_rows: Some(500), ..Default::default() },
        );
        assert_eq!(safety.max_rows("Prd"), 500);
        assert_eq!(safety.max_rows("Int"), safety.max_rows);
        assert_eq!(safety.max_execution_time_seconds("Prd"), safety.max_execution_time_seconds);
    }

    #[test]
    fn humantime_duration_strings_parse_to_seconds() {
        assert_eq!(parse_humantime_seconds("30s"), Some(30));
        assert_eq!(parse_humantime_seconds("5m"), Some(300));
        assert_eq!(parse_humantime_seconds("1h"), Some(3600));
        assert_eq!(parse_humantime_seconds("45"), Some(45));
        assert_eq!(parse_humantime_seconds("bogus"), None);
    }

    #[test]
    fn database_config_accepts_humantime_strings() {
        let toml = r#"
            connection_pool_size = 10
            connection_timeout_seconds = "30s"
            command_timeout_seconds = "1m"
            max_command_timeout_seconds = 120
            app_name = "sql-gateway"
        "#;
        let config: DatabaseConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.connection_timeout_seconds, 30);
        assert_eq!(config.command_timeout_seconds, 60);
    }

    #[test]
    fn secret_does_not_leak_in_debug() {
        let secret = Secret("hunter2".to_string());
        assert_eq!(format!("{secret:?}"), "Secret(***)");
    }

    #[test]
    fn validate_rejects_zero_port() {
        let mut config = Config::default();
        config.server.port = 0;
        assert!(config.validate().is_err());
    }
}
