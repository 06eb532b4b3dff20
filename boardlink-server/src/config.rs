//! Runtime configuration.
//!
//! Every option is a command-line flag that can also be supplied through a
//! `BOARDLINK_*` environment variable.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::tracing::prelude::*;

pub const DEFAULT_ADDRESS: &str = "localhost:8080";
pub const DEFAULT_MAX_MSG_SIZE: usize = 1024;
pub const DEFAULT_MAX_FILE_SIZE: usize = 2 * 1024 * 1024;
pub const DEFAULT_MAX_PENDING: usize = 3;
pub const DEFAULT_LIST_COOLDOWN_SECS: u64 = 2;
pub const DEFAULT_REFRESH_INTERVAL_SECS: u64 = 15;
pub const DEFAULT_SIMULATED_FLASH_MS: u64 = 3000;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Address to listen on for websocket clients
    #[arg(long, env = "BOARDLINK_ADDRESS", default_value = DEFAULT_ADDRESS)]
    pub address: String,

    /// Largest accepted websocket message, and the firmware block size (bytes)
    #[arg(long, env = "BOARDLINK_MAX_MSG_SIZE", default_value_t = DEFAULT_MAX_MSG_SIZE)]
    pub max_msg_size: usize,

    /// Largest firmware image a client may upload (bytes)
    #[arg(long, env = "BOARDLINK_MAX_FILE_SIZE", default_value_t = DEFAULT_MAX_FILE_SIZE)]
    pub max_file_size: usize,

    /// Requests a single client may have queued before new ones are rejected
    #[arg(long, env = "BOARDLINK_MAX_PENDING", default_value_t = DEFAULT_MAX_PENDING)]
    pub max_pending: usize,

    /// Minimum seconds between device list refreshes requested by one client;
    /// ignored while fewer than two clients are connected
    #[arg(long, env = "BOARDLINK_LIST_COOLDOWN", default_value_t = DEFAULT_LIST_COOLDOWN_SECS)]
    pub list_cooldown_secs: u64,

    /// Seconds between automatic device list refreshes
    #[arg(long, env = "BOARDLINK_REFRESH_INTERVAL", default_value_t = DEFAULT_REFRESH_INTERVAL_SECS)]
    pub refresh_interval_secs: u64,

    /// Refresh the device list even when no client is connected
    #[arg(long, env = "BOARDLINK_ALWAYS_REFRESH")]
    pub always_refresh: bool,

    /// Number of simulated serial boards to expose
    #[arg(long, env = "BOARDLINK_SIMULATED_BOARDS", default_value_t = 0)]
    pub simulated_boards: usize,

    /// Number of simulated multi-port boards to expose
    #[arg(long, env = "BOARDLINK_SIMULATED_MS1", default_value_t = 0)]
    pub simulated_ms1: usize,

    /// How long a simulated flash takes (milliseconds)
    #[arg(long, env = "BOARDLINK_SIMULATED_FLASH_MS", default_value_t = DEFAULT_SIMULATED_FLASH_MS)]
    pub simulated_flash_ms: u64,

    /// JSON board catalog replacing the built-in one
    #[arg(long, env = "BOARDLINK_DEVICE_LIST")]
    pub device_list: Option<PathBuf>,

    /// Serial programmer executable
    #[arg(long, env = "BOARDLINK_AVRDUDE", default_value = "avrdude")]
    pub avrdude_path: PathBuf,

    /// Configuration file passed to the serial programmer
    #[arg(long, env = "BOARDLINK_AVRDUDE_CONFIG")]
    pub avrdude_config: Option<PathBuf>,

    /// Helper executable for multi-port boards
    #[arg(long, env = "BOARDLINK_MS1_HELPER", default_value = "ms1-cli")]
    pub ms1_helper: PathBuf,

    /// Do not look for real USB boards (simulated boards only)
    #[arg(long, env = "BOARDLINK_USB_DISABLE")]
    pub usb_disable: bool,
}

impl Config {
    pub fn list_cooldown(&self) -> Duration {
        Duration::from_secs(self.list_cooldown_secs)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn simulated_flash_duration(&self) -> Duration {
        Duration::from_millis(self.simulated_flash_ms)
    }

    /// Log the effective configuration at startup.
    pub fn log_summary(&self) {
        info!(
            address = %self.address,
            max_msg_size = self.max_msg_size,
            max_file_size = self.max_file_size,
            max_pending = self.max_pending,
            list_cooldown_secs = self.list_cooldown_secs,
            refresh_interval_secs = self.refresh_interval_secs,
            always_refresh = self.always_refresh,
            simulated_boards = self.simulated_boards,
            simulated_ms1 = self.simulated_ms1,
            "Configuration loaded"
        );
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS.to_string(),
            max_msg_size: DEFAULT_MAX_MSG_SIZE,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            max_pending: DEFAULT_MAX_PENDING,
            list_cooldown_secs: DEFAULT_LIST_COOLDOWN_SECS,
            refresh_interval_secs: DEFAULT_REFRESH_INTERVAL_SECS,
            always_refresh: false,
            simulated_boards: 0,
            simulated_ms1: 0,
            simulated_flash_ms: DEFAULT_SIMULATED_FLASH_MS,
            device_list: None,
            avrdude_path: PathBuf::from("avrdude"),
            avrdude_config: None,
            ms1_helper: PathBuf::from("ms1-cli"),
            usb_disable: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_flags_match_defaults() {
        std::env::remove_var("BOARDLINK_MAX_FILE_SIZE");
        std::env::remove_var("BOARDLINK_LIST_COOLDOWN");

        let parsed = Config::parse_from(["boardlink-server"]);
        let default = Config::default();
        assert_eq!(parsed.max_file_size, default.max_file_size);
        assert_eq!(parsed.list_cooldown(), default.list_cooldown());
        assert_eq!(parsed.address, DEFAULT_ADDRESS);
    }

    #[test]
    #[serial]
    fn test_environment_overrides_default() {
        std::env::set_var("BOARDLINK_LIST_COOLDOWN", "9");
        let parsed = Config::parse_from(["boardlink-server"]);
        std::env::remove_var("BOARDLINK_LIST_COOLDOWN");

        assert_eq!(parsed.list_cooldown(), Duration::from_secs(9));
    }

    #[test]
    #[serial]
    fn test_flag_beats_environment() {
        std::env::set_var("BOARDLINK_SIMULATED_BOARDS", "4");
        let parsed = Config::parse_from(["boardlink-server", "--simulated-boards", "1"]);
        std::env::remove_var("BOARDLINK_SIMULATED_BOARDS");

        assert_eq!(parsed.simulated_boards, 1);
    }
}
