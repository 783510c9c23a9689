//! Server configuration: TOML file with serde defaults, plus environment
//! overrides for deployment secrets.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub metrics_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            metrics_port: 9091,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub jwt_secret: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: "dev-secret-change-me".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocationConfig {
    pub retention_days: u32,
    pub worker_count: usize,
    pub queue_size: usize,
    pub batch_size: usize,
    pub batch_timeout_secs: u64,
    pub retry_attempts: u32,
    pub retry_delay_secs: u64,
    pub batching_enabled: bool,
}

impl Default for LocationConfig {
    fn default() -> Self {
        Self {
            retention_days: 30,
            worker_count: 5,
            queue_size: 1000,
            batch_size: 10,
            batch_timeout_secs: 5,
            retry_attempts: 3,
            retry_delay_secs: 1,
            batching_enabled: false,
        }
    }
}

impl LocationConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn batch_timeout(&self) -> Duration {
        Duration::from_secs(self.batch_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeofenceConfig {
    pub worker_count: usize,
    pub queue_size: usize,
    pub default_radius_meters: f64,
    pub cache_refresh_secs: u64,
    /// Persist each user's last location to the kv store so restarts skip
    /// the initial entry-storm.
    pub persist_last_location: bool,
}

impl Default for GeofenceConfig {
    fn default() -> Self {
        Self {
            worker_count: 3,
            queue_size: 500,
            default_radius_meters: 100.0,
            cache_refresh_secs: 300,
            persist_last_location: true,
        }
    }
}

impl GeofenceConfig {
    pub fn cache_refresh(&self) -> Duration {
        Duration::from_secs(self.cache_refresh_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    pub worker_count: usize,
    pub queue_size: usize,
    pub retry_attempts: u32,
    pub retry_delay_secs: u64,
    pub poll_interval_secs: u64,
    pub poll_batch_size: usize,
    pub smtp_server: Option<String>,
    pub smtp_port: u16,
    pub smtp_username: Option<String>,
    pub smtp_password: Option<String>,
    pub from_email: String,
    pub from_name: String,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            worker_count: 3,
            queue_size: 500,
            retry_attempts: 3,
            retry_delay_secs: 1,
            poll_interval_secs: 10,
            poll_batch_size: 50,
            smtp_server: None,
            smtp_port: 587,
            smtp_username: None,
            smtp_password: None,
            from_email: "alerts@tether.local".to_string(),
            from_name: "Tether".to_string(),
        }
    }
}

impl NotifyConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WsConfig {
    pub max_frame_bytes: usize,
    pub pong_wait_secs: u64,
    pub write_wait_secs: u64,
    pub send_buffer: usize,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: 4096,
            pong_wait_secs: 60,
            write_wait_secs: 10,
            send_buffer: 256,
        }
    }
}

impl WsConfig {
    pub fn pong_wait(&self) -> Duration {
        Duration::from_secs(self.pong_wait_secs)
    }

    pub fn write_wait(&self) -> Duration {
        Duration::from_secs(self.write_wait_secs)
    }

    /// Control pings go out at 90% of the pong deadline.
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.pong_wait_secs * 9 / 10)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateConfig {
    pub requests_per_minute: u32,
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    pub locations_interval_hours: u64,
    pub notifications_interval_hours: u64,
    pub kv_interval_hours: u64,
    pub temp_files_interval_hours: u64,
    /// Keys under swept prefixes without a TTL are deleted past this age.
    pub kv_max_age_hours: u64,
    pub temp_dir: Option<String>,
    pub temp_max_age_hours: u64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            locations_interval_hours: 24,
            notifications_interval_hours: 24,
            kv_interval_hours: 1,
            temp_files_interval_hours: 6,
            kv_max_age_hours: 24,
            temp_dir: None,
            temp_max_age_hours: 24,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub location: LocationConfig,
    pub geofence: GeofenceConfig,
    pub notify: NotifyConfig,
    pub ws: WsConfig,
    pub rate: RateConfig,
    pub cleanup: CleanupConfig,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file {:?}", path.as_ref()))?;
        let mut config: Config = toml::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {:?}", path.as_ref()))?;
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env_overrides();
        config
    }

    /// Deployment secrets come from the environment, never the file.
    fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("TETHER_BIND_ADDR") {
            self.server.bind_addr = addr;
        }
        if let Ok(secret) = std::env::var("TETHER_JWT_SECRET") {
            self.auth.jwt_secret = secret;
        }
        if let Ok(server) = std::env::var("SMTP_SERVER") {
            self.notify.smtp_server = Some(server);
        }
        if let Ok(username) = std::env::var("SMTP_USERNAME") {
            self.notify.smtp_username = Some(username);
        }
        if let Ok(password) = std::env::var("SMTP_PASSWORD") {
            self.notify.smtp_password = Some(password);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.location.retention_days, 30);
        assert_eq!(config.location.worker_count, 5);
        assert_eq!(config.location.queue_size, 1000);
        assert_eq!(config.geofence.worker_count, 3);
        assert_eq!(config.geofence.queue_size, 500);
        assert_eq!(config.notify.poll_interval_secs, 10);
        assert_eq!(config.ws.max_frame_bytes, 4096);
        assert_eq!(config.ws.send_buffer, 256);
        assert_eq!(config.rate.requests_per_minute, 100);
    }

    #[test]
    fn ping_interval_is_ninety_percent_of_pong_wait() {
        let ws = WsConfig::default();
        assert_eq!(ws.ping_interval(), Duration::from_secs(54));
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let parsed: Config = toml::from_str(
            r#"
            [location]
            worker_count = 2

            [ws]
            send_buffer = 16
            "#,
        )
        .unwrap();
        assert_eq!(parsed.location.worker_count, 2);
        assert_eq!(parsed.location.queue_size, 1000);
        assert_eq!(parsed.ws.send_buffer, 16);
        assert_eq!(parsed.ws.pong_wait_secs, 60);
    }

    #[test]
    #[serial]
    fn env_overrides_apply() {
        unsafe {
            std::env::set_var("TETHER_JWT_SECRET", "from-env");
        }
        let config = Config::from_env();
        assert_eq!(config.auth.jwt_secret, "from-env");
        unsafe {
            std::env::remove_var("TETHER_JWT_SECRET");
        }
    }
}
