use counselconnect_common::{DatabaseConfig, RedisConfig, ServerConfig};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AvailabilityConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub engine: EngineConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Tolerance for matching a booking timestamp to a slot start.
    pub booking_match_tolerance_secs: i64,
    /// How many days ahead the live schedule board covers.
    pub board_horizon_days: i64,
    /// Cadence of the periodic board refetch that rolls the window forward.
    pub board_refresh_interval_secs: u64,
    /// Outbound endpoint reminder payloads are posted to.
    pub reminder_endpoint: String,
    /// Terminal reminder jobs older than this are cleaned up.
    pub reminder_retention_days: i64,
    /// Cadence of the auto online-status batch.
    pub auto_status_interval_secs: u64,
    /// Cadence of the reminder dispatch batch.
    pub reminder_interval_secs: u64,
}

impl AvailabilityConfig {
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        Ok(Self {
            server: ServerConfig {
                host: std::env::var("AVAILABILITY_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: std::env::var("AVAILABILITY_PORT")
                    .unwrap_or_else(|_| "8006".to_string())
                    .parse()
                    .unwrap_or(8006),
                cors_origins: std::env::var("CORS_ORIGINS")
                    .unwrap_or_else(|_| "http://localhost:3000".to_string())
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .collect(),
            },
            database: DatabaseConfig {
                host: std::env::var("DATABASE_HOST").unwrap_or_else(|_| "localhost".to_string()),
                port: std::env::var("DATABASE_PORT")
                    .unwrap_or_else(|_| "5432".to_string())
                    .parse()
                    .unwrap_or(5432),
                username: std::env::var("DATABASE_USERNAME")
                    .unwrap_or_else(|_| "counselconnect_user".to_string()),
                password: std::env::var("DATABASE_PASSWORD")
                    .unwrap_or_else(|_| "counselconnect_password".to_string()),
                database: std::env::var("DATABASE_NAME")
                    .unwrap_or_else(|_| "counselconnect".to_string()),
                max_connections: std::env::var("DATABASE_MAX_CONNECTIONS")
                    .unwrap_or_else(|_| "10".to_string())
                    .parse()
                    .unwrap_or(10),
            },
            redis: RedisConfig {
                host: std::env::var("REDIS_HOST").unwrap_or_else(|_| "localhost".to_string()),
                port: std::env::var("REDIS_PORT")
                    .unwrap_or_else(|_| "6379".to_string())
                    .parse()
                    .unwrap_or(6379),
                password: std::env::var("REDIS_PASSWORD").ok().filter(|p| !p.is_empty()),
                database: std::env::var("REDIS_DATABASE")
                    .unwrap_or_else(|_| "3".to_string())
                    .parse()
                    .unwrap_or(3),
            },
            engine: EngineConfig {
                booking_match_tolerance_secs: std::env::var("ENGINE_BOOKING_TOLERANCE_SECS")
                    .unwrap_or_else(|_| "60".to_string())
                    .parse()
                    .unwrap_or(60),
                board_horizon_days: std::env::var("ENGINE_BOARD_HORIZON_DAYS")
                    .unwrap_or_else(|_| "14".to_string())
                    .parse()
                    .unwrap_or(14),
                board_refresh_interval_secs: std::env::var("ENGINE_BOARD_REFRESH_INTERVAL_SECS")
                    .unwrap_or_else(|_| "300".to_string())
                    .parse()
                    .unwrap_or(300),
                reminder_endpoint: std::env::var("ENGINE_REMINDER_ENDPOINT")
                    .unwrap_or_else(|_| "http://localhost:8010/notifications/reminders".to_string()),
                reminder_retention_days: std::env::var("ENGINE_REMINDER_RETENTION_DAYS")
                    .unwrap_or_else(|_| "3".to_string())
                    .parse()
                    .unwrap_or(3),
                auto_status_interval_secs: std::env::var("ENGINE_AUTO_STATUS_INTERVAL_SECS")
                    .unwrap_or_else(|_| "60".to_string())
                    .parse()
                    .unwrap_or(60),
                reminder_interval_secs: std::env::var("ENGINE_REMINDER_INTERVAL_SECS")
                    .unwrap_or_else(|_| "60".to_string())
                    .parse()
                    .unwrap_or(60),
            },
        })
    }
}
