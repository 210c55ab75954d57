//! Application configuration, assembled from the environment.

use std::env;

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_num<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_str(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

#[derive(Debug, Clone)]
pub struct RiskLimitsConfig {
    pub max_position_size_usd: f64,
    pub max_total_exposure_usd: f64,
    pub max_single_order_usd: f64,
    pub max_daily_loss_usd: f64,
    pub max_daily_orders: u32,
}

#[derive(Debug, Clone)]
pub struct CopyTradingConfig {
    pub enabled: bool,
    pub paper_trading: bool,
    pub min_copytrade_score: f64,
    pub copy_fraction: f64,
    pub min_copy_size_usd: f64,
    pub max_copy_size_usd: f64,
    pub min_trade_size_usd: f64,
    pub copy_from_watchlist_only: bool,
    pub max_delay_seconds: i64,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub log_level: String,
    pub health_port: u16,

    pub live_feed_ws_url: String,
    pub catalog_api_base_url: String,
    pub catalog_api_key: Option<String>,

    pub clob_api_key: Option<String>,
    pub clob_secret: Option<String>,
    pub clob_passphrase: Option<String>,
    pub clob_wallet_address: Option<String>,

    pub polygon_rpc_url: String,

    pub copy_trading: CopyTradingConfig,
    pub risk_limits: RiskLimitsConfig,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        Ok(Self {
            database_path: env_str("DATABASE_PATH", "./polyintel.db"),
            log_level: env_str("LOG_LEVEL", "info"),
            health_port: env_num("HEALTH_PORT", 8090),

            live_feed_ws_url: env_str(
                "LIVE_FEED_WS_URL",
                "wss://ws-live-data.polymarket.com/",
            ),
            catalog_api_base_url: env_str(
                "CATALOG_API_BASE_URL",
                "https://data-api.polymarket.com",
            ),
            catalog_api_key: env::var("CATALOG_API_KEY").ok(),

            clob_api_key: env::var("CLOB_API_KEY").ok(),
            clob_secret: env::var("CLOB_SECRET").ok(),
            clob_passphrase: env::var("CLOB_PASSPHRASE").ok(),
            clob_wallet_address: env::var("CLOB_WALLET_ADDRESS").ok(),

            polygon_rpc_url: env_str("POLYGON_RPC_URL", "https://polygon-rpc.com"),

            copy_trading: CopyTradingConfig {
                enabled: env_bool("COPY_TRADING_ENABLED", false),
                paper_trading: env_bool("PAPER_TRADING", true),
                min_copytrade_score: env_num("MIN_COPYTRADE_SCORE", 60.0),
                copy_fraction: env_num("COPY_FRACTION", 0.10),
                min_copy_size_usd: env_num("MIN_COPY_SIZE_USD", 5.0),
                max_copy_size_usd: env_num("MAX_COPY_SIZE_USD", 100.0),
                min_trade_size_usd: env_num("MIN_TRADE_SIZE_USD", 50.0),
                copy_from_watchlist_only: env_bool("COPY_WATCHLIST_ONLY", false),
                max_delay_seconds: env_num("MAX_DELAY_SECONDS", 30),
            },

            risk_limits: RiskLimitsConfig {
                max_position_size_usd: env_num("MAX_POSITION_SIZE_USD", 500.0),
                max_total_exposure_usd: env_num("MAX_TOTAL_EXPOSURE_USD", 5000.0),
                max_single_order_usd: env_num("MAX_SINGLE_ORDER_USD", 100.0),
                max_daily_loss_usd: env_num("MAX_DAILY_LOSS_USD", 500.0),
                max_daily_orders: env_num("MAX_DAILY_ORDERS", 100),
            },
        })
    }
}
