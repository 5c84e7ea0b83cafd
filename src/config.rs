//! Command-line configuration.

use std::time::Duration;

use clap::Parser;

use crate::muse_client::MuseClientConfig;

/// Muse EEG band-power streaming service
#[derive(Parser, Debug, Clone)]
#[command(name = "muse-bandpower")]
#[command(author, version, about, long_about = None)]
pub struct ServiceConfig {
    /// Interface the WebSocket server binds to
    #[arg(long, default_value = "0.0.0.0")]
    pub host: String,

    /// WebSocket port
    #[arg(short, long, default_value_t = 8766)]
    pub port: u16,

    /// Case-insensitive substring a device name must contain
    #[arg(long, default_value = "muse")]
    pub name_filter: String,

    /// BLE discovery window in seconds
    #[arg(long, default_value_t = 10)]
    pub scan_timeout_secs: u64,

    /// BLE connect timeout in seconds
    #[arg(long, default_value_t = 20)]
    pub connect_timeout_secs: u64,

    /// Pause after each handshake command, in milliseconds
    #[arg(long, default_value_t = 500)]
    pub settle_ms: u64,

    /// Interval between link liveness checks, in seconds
    #[arg(long, default_value_t = 2)]
    pub health_poll_secs: u64,

    /// Analysis window length in seconds
    #[arg(long, default_value_t = 2.0)]
    pub window_secs: f64,

    /// Band-power updates per second
    #[arg(long, default_value_t = 10.0)]
    pub rate_hz: f64,

    /// Raise log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self::parse_from(["muse-bandpower"])
    }
}

impl ServiceConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn client_config(&self) -> MuseClientConfig {
        MuseClientConfig {
            name_filter: self.name_filter.clone(),
            scan_timeout_secs: self.scan_timeout_secs,
            connect_timeout_secs: self.connect_timeout_secs,
            settle_delay: Duration::from_millis(self.settle_ms),
        }
    }

    /// Time between analysis ticks.  Non-positive rates fall back to 10 Hz.
    pub fn analysis_period(&self) -> Duration {
        let rate = if self.rate_hz.is_finite() && self.rate_hz > 0.0 { self.rate_hz } else { 10.0 };
        Duration::from_secs_f64(1.0 / rate)
    }

    pub fn health_poll(&self) -> Duration {
        Duration::from_secs(self.health_poll_secs.max(1))
    }

    /// `env_logger` filter for the chosen verbosity.
    pub fn log_filter(&self) -> &'static str {
        match self.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }
}
