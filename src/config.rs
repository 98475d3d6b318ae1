//! Configuration loading.
//!
//! `Config::from_env()`: one `std::env::var` per option, defaulted
//! parsing, never panics on a missing/garbled value except for the
//! handful that make the process unrunnable.

use clap::Parser;

#[derive(Debug, Clone)]
pub struct AccountConfig {
    pub account_id: String,
    pub credentials: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bus_url: String,
    pub broker_api_url: String,
    pub store_dsn: String,
    pub accounts: Vec<AccountConfig>,
    pub api_key_enabled: bool,
    pub api_key: Option<String>,
    pub market_timezone: String,
    pub market_open: String,
    pub market_close: String,
    pub max_tokens_per_connection: usize,
    pub max_connections_per_account: usize,
    pub batch_window_ms: u64,
    pub batch_max_size: usize,
    pub publish_timeout_ms: u64,
    pub circuit_failure_threshold: u32,
    pub circuit_recovery_s: u64,
    pub circuit_success_threshold: u32,
    pub executor_max_attempts: u32,
    pub executor_max_tasks: usize,
    pub lease_timeout_s: u64,
    pub registry_refresh_interval_hours: u64,
    pub reconcile_interval_s: u64,
    pub enable_mock_data: bool,
    pub port: u16,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON"))
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let accounts = std::env::var("ACCOUNTS")
            .unwrap_or_default()
            .split(',')
            .filter(|s| !s.trim().is_empty())
            .map(|id| AccountConfig {
                account_id: id.trim().to_string(),
                credentials: std::env::var(format!("ACCOUNT_{}_CREDENTIALS", id.trim()))
                    .unwrap_or_default(),
            })
            .collect::<Vec<_>>();

        let is_prod = std::env::var("ENVIRONMENT").as_deref() == Ok("production");

        Ok(Self {
            bus_url: std::env::var("BUS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into()),
            broker_api_url: std::env::var("BROKER_API_URL")
                .unwrap_or_else(|_| "https://api.broker.example".into()),
            store_dsn: std::env::var("STORE_DSN").unwrap_or_else(|_| "./streamgate.db".into()),
            accounts,
            api_key_enabled: env_bool("API_KEY_ENABLED", is_prod),
            api_key: std::env::var("API_KEY").ok(),
            market_timezone: std::env::var("MARKET_TIMEZONE")
                .unwrap_or_else(|_| "Asia/Kolkata".into()),
            market_open: std::env::var("MARKET_OPEN").unwrap_or_else(|_| "09:15".into()),
            market_close: std::env::var("MARKET_CLOSE").unwrap_or_else(|_| "15:30".into()),
            max_tokens_per_connection: env_or("MAX_TOKENS_PER_CONNECTION", 3000),
            max_connections_per_account: env_or("MAX_CONNECTIONS_PER_ACCOUNT", 3),
            batch_window_ms: env_or("BATCH_WINDOW_MS", 100),
            batch_max_size: env_or("BATCH_MAX_SIZE", 1000),
            publish_timeout_ms: env_or("PUBLISH_TIMEOUT_MS", 1000),
            circuit_failure_threshold: env_or("CIRCUIT_FAILURE_THRESHOLD", 5),
            circuit_recovery_s: env_or("CIRCUIT_RECOVERY_S", 30),
            circuit_success_threshold: env_or("CIRCUIT_SUCCESS_THRESHOLD", 2),
            executor_max_attempts: env_or("EXECUTOR_MAX_ATTEMPTS", 5),
            executor_max_tasks: env_or("EXECUTOR_MAX_TASKS", 10_000),
            lease_timeout_s: env_or("LEASE_TIMEOUT_S", 30),
            registry_refresh_interval_hours: env_or("REGISTRY_REFRESH_INTERVAL_HOURS", 24),
            reconcile_interval_s: env_or("RECONCILE_INTERVAL_S", 5),
            enable_mock_data: env_bool("ENABLE_MOCK_DATA", !is_prod),
            port: env_or("PORT", 8080),
        })
    }
}

/// CLI overrides layered over `Config::from_env()`. Any flag left unset
/// falls through to the environment-derived default.
#[derive(Debug, Parser)]
#[command(name = "streamgate", about = "Option streaming & order-execution gateway")]
pub struct Cli {
    #[arg(long, env = "PORT")]
    pub port: Option<u16>,

    #[arg(long, env = "MARKET_TIMEZONE")]
    pub market_timezone: Option<String>,

    #[arg(long)]
    pub mock: bool,
}

impl Cli {
    pub fn apply(self, mut config: Config) -> Config {
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(tz) = self.market_timezone {
            config.market_timezone = tz;
        }
        if self.mock {
            config.enable_mock_data = true;
        }
        config
    }
}
