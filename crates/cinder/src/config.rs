//! Configuration file, environment and CLI flags.
//!
//! Values are layered, in order of priority:
//!
//! CLI Flags --overrides--> `CINDER_*` env --overrides--> File --overrides--> defaults
//!
//! The file lives at the user's config folder, `config.toml` for the client
//! and `tracker.toml` for the tracker. A missing file is fine, a file that
//! does not deserialize is a configuration error.
use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::{crypto::CryptoPolicy, error::Error};

/// How payload files are allocated before data arrives.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum AllocType {
    /// Only touched ranges are ever written.
    Sparse,
    /// Files are zero-filled before the download starts.
    PreAllocate,
    /// Files are zero-filled while downloading, at `alloc_rate`.
    Background,
    /// Files are truncated to length, the filesystem decides the rest.
    #[default]
    Normal,
}

/// Client side tunables.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct Config {
    pub download_dir: PathBuf,
    /// Where resume records are kept. Defaults to the data dir.
    pub resume_dir: Option<PathBuf>,
    pub listen: SocketAddr,
    /// Optional log file, in addition to stderr.
    pub log_file: Option<PathBuf>,

    pub max_uploads: usize,
    pub keepalive_interval: u64,
    pub timeout: u64,
    pub handshake_timeout: u64,
    pub max_slice_length: u32,
    pub max_message_length: usize,
    pub max_backlog: usize,
    pub request_backlog_period: f64,
    pub snub_time: u64,
    pub rarest_first_cutoff: usize,

    pub max_initiate: usize,
    pub max_half_open: usize,
    pub max_connections: usize,
    pub min_peers: usize,

    pub max_files_open: usize,
    pub lock_files: bool,
    pub alloc_type: AllocType,
    /// MiB/s for background allocation.
    pub alloc_rate: f64,
    pub write_buffer_size: usize,
    pub check_hashes: bool,

    pub round_robin_period: u64,
    pub optimistic_rounds: u32,
    pub super_seeder: bool,

    pub max_rate_period: f64,
    /// Bytes/s, 0 is unlimited.
    pub max_upload_rate: u64,
    /// Bytes/s, 0 is unlimited.
    pub max_download_rate: u64,
    pub tcp_ack_fudge: f64,
    pub auto_upload_rate: bool,
    /// Milliseconds.
    pub ping_target: u64,

    pub auto_kick: bool,
    pub kick_threshold: u64,

    pub crypto_allowed: bool,
    pub crypto_only: bool,
    pub crypto_stealth: bool,

    pub http_timeout: u64,
    pub numwant: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("."),
            resume_dir: None,
            listen: SocketAddr::from(([0, 0, 0, 0], 6881)),
            log_file: None,
            max_uploads: 7,
            keepalive_interval: 120,
            timeout: 300,
            handshake_timeout: 30,
            max_slice_length: 128 * 1024,
            max_message_length: 8 * 1024 * 1024,
            max_backlog: 10,
            request_backlog_period: 3.0,
            snub_time: 30,
            rarest_first_cutoff: 2,
            max_initiate: 40,
            max_half_open: 8,
            max_connections: 0,
            min_peers: 20,
            max_files_open: 50,
            lock_files: true,
            alloc_type: AllocType::Normal,
            alloc_rate: 2.0,
            write_buffer_size: 4 * 1024 * 1024,
            check_hashes: true,
            round_robin_period: 10,
            optimistic_rounds: 3,
            super_seeder: false,
            max_rate_period: 20.0,
            max_upload_rate: 0,
            max_download_rate: 0,
            tcp_ack_fudge: 0.03,
            auto_upload_rate: false,
            ping_target: 300,
            auto_kick: true,
            kick_threshold: 100 * 1024,
            crypto_allowed: true,
            crypto_only: false,
            crypto_stealth: false,
            http_timeout: 60,
            numwant: 50,
        }
    }
}

impl Config {
    /// Load `config.toml` from the user's config folder, layered with the
    /// environment.
    pub fn load() -> Result<Self, Error> {
        let path = Self::config_dir()?.join("config.toml");
        let mut config: Self = load_layered(&path, "CINDER")?;
        if config.resume_dir.is_none() {
            config.resume_dir = Some(Self::data_dir()?.join("resume"));
        }
        config.validate()?;
        Ok(config)
    }

    /// Same as [`Config::load`] but from an explicit file.
    pub fn load_from(path: &Path) -> Result<Self, Error> {
        let config: Self = load_layered(path, "CINDER")?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults tuned for tests: loopback, no timers worth waiting for.
    pub fn load_test(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
            listen: SocketAddr::from(([127, 0, 0, 1], 0)),
            rarest_first_cutoff: 0,
            lock_files: false,
            ..Default::default()
        }
    }

    /// `~/.config/cinder`
    pub fn config_dir() -> Result<PathBuf, Error> {
        let dirs = ProjectDirs::from("", "", "cinder").ok_or(Error::HomeInvalid)?;
        Ok(dirs.config_dir().to_path_buf())
    }

    pub fn data_dir() -> Result<PathBuf, Error> {
        let dirs = ProjectDirs::from("", "", "cinder").ok_or(Error::HomeInvalid)?;
        Ok(dirs.data_dir().to_path_buf())
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.max_uploads == 0 {
            return Err(Error::ConfigError("max_uploads must be at least 1".into()));
        }
        if self.max_slice_length == 0 {
            return Err(Error::ConfigError("max_slice_length must be positive".into()));
        }
        if self.max_backlog == 0 {
            return Err(Error::ConfigError("max_backlog must be at least 1".into()));
        }
        if self.crypto_stealth && !self.crypto_only {
            return Err(Error::ConfigError("crypto_stealth requires crypto_only".into()));
        }
        if self.crypto_only && !self.crypto_allowed {
            return Err(Error::ConfigError("crypto_only requires crypto_allowed".into()));
        }
        Ok(())
    }

    pub fn crypto(&self) -> CryptoPolicy {
        CryptoPolicy {
            allowed: self.crypto_allowed,
            only: self.crypto_only,
            stealth: self.crypto_stealth,
        }
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    pub fn snub(&self) -> Duration {
        Duration::from_secs(self.snub_time)
    }

    pub fn choke_round(&self) -> Duration {
        Duration::from_secs(self.round_robin_period)
    }
}

/// What the tracker hands out on scrape requests.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ScrapeMode {
    /// Any swarm, including a scrape of everything.
    #[default]
    Full,
    /// Only swarms named in the request.
    Specific,
    None,
}

/// Tracker server tunables.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct TrackerConfig {
    pub listen: SocketAddr,
    /// Persisted swarm state.
    pub dfile: Option<PathBuf>,
    pub response_size: usize,
    pub max_give: usize,
    /// Seconds.
    pub reannounce_interval: u64,
    pub min_interval: Option<u64>,
    pub timeout_downloaders_interval: u64,
    pub save_dfile_interval: u64,
    pub parse_dir_interval: u64,
    /// Dial-back attempts before a peer counts as NATted, 0 disables.
    pub nat_check: u32,
    pub nat_check_timeout: u64,
    pub allowed_dir: Option<PathBuf>,
    pub allowed_list: Option<PathBuf>,
    pub allowed_ips: Option<PathBuf>,
    pub banned_ips: Option<PathBuf>,
    pub only_local_override_ip: bool,
    pub scrape_allowed: ScrapeMode,
    pub compact_reqd: bool,
    pub log_file: Option<PathBuf>,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8080)),
            dfile: None,
            response_size: 50,
            max_give: 200,
            reannounce_interval: 30 * 60,
            min_interval: None,
            timeout_downloaders_interval: 45 * 60,
            save_dfile_interval: 5 * 60,
            parse_dir_interval: 60,
            nat_check: 3,
            nat_check_timeout: 15,
            allowed_dir: None,
            allowed_list: None,
            allowed_ips: None,
            banned_ips: None,
            only_local_override_ip: true,
            scrape_allowed: ScrapeMode::Full,
            compact_reqd: false,
            log_file: None,
        }
    }
}

impl TrackerConfig {
    pub fn load() -> Result<Self, Error> {
        let path = Config::config_dir()?.join("tracker.toml");
        let config: Self = load_layered(&path, "CINDER_TRACKER")?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_from(path: &Path) -> Result<Self, Error> {
        let config: Self = load_layered(path, "CINDER_TRACKER")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.allowed_dir.is_some() && self.allowed_list.is_some() {
            return Err(Error::ConfigError(
                "allowed_dir and allowed_list are mutually exclusive".into(),
            ));
        }
        if self.response_size == 0 {
            return Err(Error::ConfigError("response_size must be positive".into()));
        }
        Ok(())
    }
}

fn load_layered<T>(path: &Path, env_prefix: &str) -> Result<T, Error>
where
    T: Default + Serialize + for<'de> Deserialize<'de>,
{
    // defaults go in first, serialized as a source, so partial files work
    let defaults = toml::to_string(&T::default())?;

    let settings = config::Config::builder()
        .add_source(config::File::from_str(&defaults, config::FileFormat::Toml))
        .add_source(config::File::from(path).format(config::FileFormat::Toml).required(false))
        .add_source(config::Environment::with_prefix(env_prefix).try_parsing(true))
        .build()?;

    Ok(settings.try_deserialize()?)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn defaults_are_valid() {
        Config::default().validate().unwrap();
        TrackerConfig::default().validate().unwrap();
    }

    #[test]
    fn partial_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "max_uploads = 4\nalloc_type = \"sparse\"\ncrypto_only = true").unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.max_uploads, 4);
        assert_eq!(config.alloc_type, AllocType::Sparse);
        assert!(config.crypto().only);
        // untouched keys keep their defaults
        assert_eq!(config.snub_time, 30);
    }

    #[test]
    fn missing_file_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = TrackerConfig::load_from(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(config.response_size, 50);
    }

    #[test]
    fn reject_inconsistent_crypto() {
        let config = Config { crypto_stealth: true, ..Default::default() };
        assert!(matches!(config.validate(), Err(Error::ConfigError(_))));
    }
}
