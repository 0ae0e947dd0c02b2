use concread::cowcell::asynch::{CowCell, CowCellReadTxn};
use config::{Config, File};
use flexi_logger::filter::{LogLineFilter, LogLineWriter};
use flexi_logger::{DeferredNow, LoggerHandle};
use gethostname::gethostname;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use crate::enums::TimeoutSchedule;
use crate::error::SableError;
use crate::forwarder::ForwardPolicy;

#[derive(Debug, Deserialize, Eq, PartialEq, Clone, Serialize)]
/// The main config blob, write this as a JSON file and load it and it'll make things go.
pub struct ConfigFile {
    /// The server's hostname for the version beacon, defaults to the results of gethostname()
    pub hostname: String,
    /// DNS listener address, default is 127.0.0.1
    pub address: String,
    /// Listen for DNS queries on this port, default is 15353
    pub port: u16,
    /// If we should capture packets on request/response
    pub capture_packets: bool,
    /// Default is "INFO"
    pub log_level: String,
    /// How long until we drop TCP client connections, defaults to 5 seconds.
    pub tcp_client_timeout: u64,
    /// The location for the zone sqlite file
    pub sqlite_path: String,
    /// Upstream resolvers as "address:port"; empty disables recursion
    pub upstream_servers: Vec<String>,
    /// Base per-attempt timeout when forwarding, milliseconds
    pub forward_timeout_ms: u64,
    /// Attempts before the client gets SERVFAIL
    pub forward_retries: u32,
    /// linear, exponential or progressive
    pub forward_schedule: TimeoutSchedule,
    /// Seconds a failed upstream sits out before it's retried
    pub upstream_retry_interval: u64,
    /// The most we'll honour from an EDNS0 payload advertisement
    pub udp_payload_cap: u16,
    /// Whether encoded replies are cached
    pub reply_cache_enabled: bool,
    /// Reply-cache entries expire after min(record ttl, this), seconds
    pub reply_cache_ttl_cap: u64,
    /// Rate-limit window width, seconds
    pub rate_limit_window: u64,
    /// Queries allowed per client per window
    pub rate_limit_max: u32,
    /// The global DNSSEC switch; zones still opt in individually
    pub dnssec_enabled: bool,
    /// Answer version.bind / version.server in class CHAOS
    pub serve_version: bool,
    /// How often the transfer GC sweeps tombstones, seconds
    pub ixfr_gc_interval: u64,
}

impl ConfigFile {
    /// JSONify the configfile in a pretty way using serde
    pub fn as_json_pretty(&self) -> Result<String, SableError> {
        serde_json::to_string_pretty(self)
            .map_err(|e| SableError::Config(format!("Failed to serialize config: {e:?}")))
    }

    /// Get a bindable SocketAddr for use in the DNS listeners
    pub fn dns_listener_address(&self) -> Result<SocketAddr, SableError> {
        let listen_addr = format!("{}:{}", &self.address, &self.port);
        listen_addr
            .parse::<SocketAddr>()
            .map_err(|e| SableError::InvalidAddress(format!("{listen_addr}: {e:?}")))
    }

    /// The configured upstreams, parsed. A bare address gets port 53.
    pub fn upstream_addrs(&self) -> Result<Vec<SocketAddr>, SableError> {
        let mut out = vec![];
        for entry in &self.upstream_servers {
            let parsed = entry
                .parse::<SocketAddr>()
                .or_else(|_| format!("{entry}:53").parse::<SocketAddr>())
                .map_err(|e| SableError::InvalidAddress(format!("{entry}: {e:?}")))?;
            out.push(parsed);
        }
        Ok(out)
    }

    pub fn recursion_enabled(&self) -> bool {
        !self.upstream_servers.is_empty()
    }

    pub fn forward_policy(&self) -> ForwardPolicy {
        ForwardPolicy {
            base_timeout: Duration::from_millis(self.forward_timeout_ms),
            max_retries: self.forward_retries,
            schedule: self.forward_schedule,
        }
    }

    /// Uses [Self::try_from] and wraps it in a CowCell (moo)
    ///
    /// The default locations are `./sabledns.json` and `~/.config/sabledns.json`.
    pub fn try_as_cowcell(
        config_path: Option<&String>,
    ) -> Result<CowCell<ConfigFile>, std::io::Error> {
        Ok(CowCell::new(ConfigFile::try_from(config_path)?))
    }

    /// Loads the configuration from a given file or from some default locations.
    pub fn try_from(config_path: Option<&String>) -> Result<ConfigFile, std::io::Error> {
        let file_locations = match config_path {
            Some(value) => vec![value.to_owned()],
            None => CONFIG_LOCATIONS.iter().map(|x| x.to_string()).collect(),
        };

        let found_files: Vec<String> = file_locations
            .iter()
            .filter_map(|f| {
                let path = shellexpand::tilde(&f).into_owned();
                let filepath = std::path::Path::new(&path);
                match filepath.exists() {
                    false => {
                        eprintln!("Config file {path} doesn't exist, skipping.");
                        None
                    }
                    true => Some(path),
                }
            })
            .collect();

        if found_files.is_empty() && config_path.is_some() {
            return Err(std::io::Error::new(
                ErrorKind::NotFound,
                "No configuration files found",
            ));
        }

        for config_filename in found_files {
            let builder = Config::builder()
                .add_source(File::new(&config_filename, config::FileFormat::Json))
                .add_source(config::Environment::with_prefix("sabledns"));

            match builder.build() {
                Ok(config) => {
                    eprintln!("Successfully loaded config from: {config_filename}");
                    return Ok(ConfigFile::from(config));
                }
                Err(err) => eprintln!("Couldn't load config from {config_filename}: {err:?}"),
            }
        }

        Ok(ConfigFile::default())
    }
}

impl Default for ConfigFile {
    fn default() -> Self {
        let hostname = gethostname().into_string().unwrap_or("sabledns".to_string());
        Self {
            hostname,
            address: "127.0.0.1".to_string(),
            port: 15353,
            capture_packets: false,
            log_level: "INFO".to_string(),
            tcp_client_timeout: 5,
            sqlite_path: String::from("~/.cache/sabledns.sqlite"),
            upstream_servers: vec![],
            forward_timeout_ms: 1500,
            forward_retries: 3,
            forward_schedule: TimeoutSchedule::Exponential,
            upstream_retry_interval: 30,
            udp_payload_cap: 4096,
            reply_cache_enabled: true,
            reply_cache_ttl_cap: 300,
            rate_limit_window: 60,
            rate_limit_max: 100,
            dnssec_enabled: false,
            serve_version: false,
            ixfr_gc_interval: 300,
        }
    }
}

impl Display for ConfigFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!(
            "hostname=\"{}\" listening_address=\"{}:{}\" sqlite=\"{}\" upstreams={:?} recursion={} dnssec={} capturing_pcaps={} log_level={}",
            self.hostname,
            self.address,
            self.port,
            self.sqlite_path,
            self.upstream_servers,
            self.recursion_enabled(),
            self.dnssec_enabled,
            self.capture_packets,
            self.log_level,
        ))
    }
}

impl From<Config> for ConfigFile {
    fn from(config: Config) -> Self {
        let defaults = ConfigFile::default();
        let forward_schedule: String = config
            .get("forward_schedule")
            .unwrap_or("exponential".to_string());
        ConfigFile {
            hostname: config.get("hostname").unwrap_or(defaults.hostname),
            address: config.get("address").unwrap_or(defaults.address),
            port: config.get("port").unwrap_or(defaults.port),
            capture_packets: config
                .get("capture_packets")
                .unwrap_or(defaults.capture_packets),
            log_level: config.get("log_level").unwrap_or(defaults.log_level),
            tcp_client_timeout: config
                .get("tcp_client_timeout")
                .unwrap_or(defaults.tcp_client_timeout),
            sqlite_path: config.get("sqlite_path").unwrap_or(defaults.sqlite_path),
            upstream_servers: config
                .get("upstream_servers")
                .unwrap_or(defaults.upstream_servers),
            forward_timeout_ms: config
                .get("forward_timeout_ms")
                .unwrap_or(defaults.forward_timeout_ms),
            forward_retries: config
                .get("forward_retries")
                .unwrap_or(defaults.forward_retries),
            forward_schedule: TimeoutSchedule::from(forward_schedule.as_str()),
            upstream_retry_interval: config
                .get("upstream_retry_interval")
                .unwrap_or(defaults.upstream_retry_interval),
            udp_payload_cap: config
                .get("udp_payload_cap")
                .unwrap_or(defaults.udp_payload_cap),
            reply_cache_enabled: config
                .get("reply_cache_enabled")
                .unwrap_or(defaults.reply_cache_enabled),
            reply_cache_ttl_cap: config
                .get("reply_cache_ttl_cap")
                .unwrap_or(defaults.reply_cache_ttl_cap),
            rate_limit_window: config
                .get("rate_limit_window")
                .unwrap_or(defaults.rate_limit_window),
            rate_limit_max: config
                .get("rate_limit_max")
                .unwrap_or(defaults.rate_limit_max),
            dnssec_enabled: config
                .get("dnssec_enabled")
                .unwrap_or(defaults.dnssec_enabled),
            serve_version: config
                .get("serve_version")
                .unwrap_or(defaults.serve_version),
            ixfr_gc_interval: config
                .get("ixfr_gc_interval")
                .unwrap_or(defaults.ixfr_gc_interval),
        }
    }
}

impl FromStr for ConfigFile {
    type Err = SableError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let configfile = File::from_str(input, config::FileFormat::Json);
        let res = Config::builder()
            .add_source(configfile)
            .build()
            .map_err(|e| SableError::Config(format!("{e:?}")))?;
        Ok(res.into())
    }
}

lazy_static! {
    static ref CONFIG_LOCATIONS: Vec<&'static str> =
        ["./sabledns.json", "~/.config/sabledns.json",].to_vec();
}

pub async fn setup_logging(
    config: CowCellReadTxn<ConfigFile>,
    config_check_mode: bool,
) -> Result<LoggerHandle, std::io::Error> {
    // force the log level to info if we're testing config
    let log_level = match config_check_mode {
        true => "info".to_string(),
        false => config.log_level.to_ascii_lowercase(),
    };

    let logger = flexi_logger::Logger::try_with_str(log_level).map_err(|e| {
        std::io::Error::other(format!("Failed to start logger! {e:?}"))
    })?;

    logger
        .write_mode(flexi_logger::WriteMode::Async)
        .filter(Box::new(LogFilter {
            filters: vec!["sqlx::query"],
        }))
        .set_palette("b1;3;2;6;5".to_string())
        .start()
        .map_err(|e| std::io::Error::other(format!("Failed to start logger! {e:?}")))
}

pub struct LogFilter {
    filters: Vec<&'static str>,
}

impl LogLineFilter for LogFilter {
    fn write(
        &self,
        now: &mut DeferredNow,
        record: &log::Record,
        log_line_writer: &dyn LogLineWriter,
    ) -> std::io::Result<()> {
        if self
            .filters
            .iter()
            .any(|r| record.metadata().target().starts_with(r))
        {
            return Ok(());
        }
        log_line_writer.write(now, record)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_from_json_string() {
        let config = ConfigFile::from_str(
            r#"{
                "address": "0.0.0.0",
                "port": 10053,
                "upstream_servers": ["192.0.2.53:53", "198.51.100.53"],
                "forward_schedule": "progressive",
                "rate_limit_max": 3
            }"#,
        )
        .expect("config parse failed");
        assert_eq!(config.port, 10053);
        assert_eq!(config.forward_schedule, TimeoutSchedule::Progressive);
        assert_eq!(config.rate_limit_max, 3);
        assert!(config.recursion_enabled());
        let addrs = config.upstream_addrs().expect("upstreams");
        assert_eq!(addrs[1].port(), 53);
    }

    #[test]
    fn test_defaults_have_no_upstreams() {
        let config = ConfigFile::default();
        assert!(!config.recursion_enabled());
        assert_eq!(config.rate_limit_window, 60);
        assert_eq!(config.rate_limit_max, 100);
        assert_eq!(config.udp_payload_cap, 4096);
    }
}
