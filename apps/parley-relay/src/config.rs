use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub stats_interval_seconds: u64,
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let port = env::var("PARLEY_RELAY_PORT")
            .or_else(|_| env::var("PORT"))
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(defaults.port);
        let stats_interval_seconds = env::var("PARLEY_STATS_INTERVAL")
            .ok()
            .and_then(|val| val.parse().ok())
            .filter(|secs| *secs > 0)
            .unwrap_or(defaults.stats_interval_seconds);

        Self {
            host: env::var("PARLEY_RELAY_HOST").unwrap_or(defaults.host),
            port,
            stats_interval_seconds,
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_seconds)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            stats_interval_seconds: 30,
        }
    }
}
