use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Fichier de configuration optionnel (`ptpmon.toml`). Contrairement à
/// `pendulum::config::Config`, rien ici peut changer le contrat de fil
/// (34-byte header + 8-byte timestamp) ni les ports/groupes multicast par
/// défaut à moins que l'opérateur les édite explicitement.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    pub network: NetworkConfig,
    pub timing: TimingConfig,
    pub filter: FilterConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct NetworkConfig {
    /// Port recevant Sync/Delay_Req ("event" socket).
    #[serde(default = "default_event_port")]
    pub event_port: u16,

    /// Port recevant Follow_Up/Delay_Resp ("general" socket).
    #[serde(default = "default_general_port")]
    pub general_port: u16,

    /// Multicast group the event socket joins/sends to.
    #[serde(default = "default_event_group")]
    pub event_multicast_group: String,

    /// Multicast group the general socket joins/sends to.
    #[serde(default = "default_general_group")]
    pub general_multicast_group: String,

    /// Local adapter address the master broadcasts from. When this is a
    /// loopback address, Sync/Follow_Up are sent unicast to
    /// `loopback_peer_address` instead of to the multicast groups, since
    /// loopback interfaces generally don't carry multicast traffic
    /// (spec §4.E).
    #[serde(default = "default_local_address")]
    pub local_address: String,

    /// Unicast target used in place of the multicast groups when
    /// `local_address` is loopback (single-machine testing).
    #[serde(default = "default_loopback_peer_address")]
    pub loopback_peer_address: String,

    /// Master's address, used by the client to send Delay_Req.
    pub master_address: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct TimingConfig {
    /// Interval between Sync/Follow_Up broadcasts, in milliseconds.
    #[serde(default = "default_broadcast_interval_ms")]
    pub broadcast_interval_ms: u64,

    /// Interval between Delay_Req transmissions, in milliseconds.
    #[serde(default = "default_delay_request_interval_ms")]
    pub delay_request_interval_ms: u64,

    /// Period of the stale-entry garbage collector, in seconds.
    #[serde(default = "default_gc_period_s")]
    pub gc_period_s: u64,

    /// Age at which an incomplete timestamp set is considered stale.
    #[serde(default = "default_stale_timeout_s")]
    pub stale_timeout_s: u64,

    /// Maximum number of in-flight timestamp sets kept by the client.
    #[serde(default = "default_max_sets")]
    pub max_sets: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct FilterConfig {
    /// "scalar" (KalmanFilter1D) ou "bias" (KalmanFilterBias).
    #[serde(default = "default_filter_variant")]
    pub variant: String,

    #[serde(default = "default_window_size")]
    pub window_size: usize,

    #[serde(default = "default_q_scale")]
    pub q_scale: f64,

    #[serde(default = "default_q_min")]
    pub q_min: f64,

    #[serde(default = "default_q_max")]
    pub q_max: f64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    /// "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_event_port() -> u16 {
    1319
}
fn default_general_port() -> u16 {
    1320
}
fn default_event_group() -> String {
    "224.0.1.129".to_string()
}
fn default_general_group() -> String {
    "224.0.1.130".to_string()
}
fn default_local_address() -> String {
    "0.0.0.0".to_string()
}
fn default_loopback_peer_address() -> String {
    "127.0.0.1".to_string()
}
fn default_broadcast_interval_ms() -> u64 {
    250
}
fn default_delay_request_interval_ms() -> u64 {
    2000
}
fn default_gc_period_s() -> u64 {
    5
}
fn default_stale_timeout_s() -> u64 {
    4
}
fn default_max_sets() -> usize {
    20
}
fn default_filter_variant() -> String {
    "scalar".to_string()
}
fn default_window_size() -> usize {
    20
}
fn default_q_scale() -> f64 {
    0.01
}
fn default_q_min() -> f64 {
    1e-6
}
fn default_q_max() -> f64 {
    10.0
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Config {
            network: NetworkConfig {
                event_port: default_event_port(),
                general_port: default_general_port(),
                event_multicast_group: default_event_group(),
                general_multicast_group: default_general_group(),
                local_address: default_local_address(),
                loopback_peer_address: default_loopback_peer_address(),
                master_address: None,
            },
            timing: TimingConfig {
                broadcast_interval_ms: default_broadcast_interval_ms(),
                delay_request_interval_ms: default_delay_request_interval_ms(),
                gc_period_s: default_gc_period_s(),
                stale_timeout_s: default_stale_timeout_s(),
                max_sets: default_max_sets(),
            },
            filter: FilterConfig {
                variant: default_filter_variant(),
                window_size: default_window_size(),
                q_scale: default_q_scale(),
                q_min: default_q_min(),
                q_max: default_q_max(),
            },
            logging: LoggingConfig {
                level: default_log_level(),
            },
        }
    }
}

impl Config {
    /// Charge la configuration depuis un fichier TOML.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).context("Failed to read config file")?;
        let config: Config = toml::from_str(&content).context("Failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    /// Sauvegarde la configuration dans un fichier TOML.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path.as_ref(), content).context("Failed to write config file")?;
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.network.event_port == self.network.general_port {
            anyhow::bail!("event_port and general_port must differ");
        }
        if self.filter.variant != "scalar" && self.filter.variant != "bias" {
            anyhow::bail!("Invalid filter variant: must be 'scalar' or 'bias'");
        }
        if self.timing.max_sets == 0 {
            anyhow::bail!("timing.max_sets must be at least 1");
        }
        if self.filter.q_min > self.filter.q_max {
            anyhow::bail!("filter.q_min must not exceed filter.q_max");
        }
        Ok(())
    }

    /// Crée un fichier de configuration exemple, avec une adresse maître
    /// de loopback pour un test local immédiat.
    pub fn create_example_config<P: AsRef<Path>>(path: P) -> Result<()> {
        let mut example = Config::default();
        example.network.master_address = Some("127.0.0.1".to_string());
        example.network.local_address = "127.0.0.1".to_string();
        example.to_file(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_wire_contract_ports() {
        let config = Config::default();
        assert_eq!(config.network.event_port, 1319);
        assert_eq!(config.network.general_port, 1320);
        assert_eq!(config.timing.max_sets, 20);
        assert_eq!(config.timing.stale_timeout_s, 4);
    }

    #[test]
    fn rejects_matching_ports() {
        let mut config = Config::default();
        config.network.general_port = config.network.event_port;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_unknown_filter_variant() {
        let mut config = Config::default();
        config.filter.variant = "kitchen-sink".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn round_trips_through_toml() {
        let config = Config::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.network.event_port, config.network.event_port);
        assert_eq!(parsed.filter.variant, config.filter.variant);
    }

    #[test]
    fn default_local_address_is_not_loopback() {
        // The out-of-the-box default targets the multicast groups, not the
        // loopback unicast fallback, since that's the common deployment.
        let config = Config::default();
        let local: std::net::IpAddr = config.network.local_address.parse().unwrap();
        assert!(!local.is_loopback());
    }
}
