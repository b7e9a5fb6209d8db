use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use confique::Config;
use devopin_proto::FrameworkKind;
use serde::Deserialize;

use crate::parser::ParseLimits;

const LOCAL_CONFIG: &str = "config.toml";
const SYSTEM_CONFIG: &str = "/etc/devopin-agent/config.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("no configuration file found (looked at {})", display_paths(.0))]
    NotFound(Vec<PathBuf>),
    #[error(transparent)]
    Load(#[from] confique::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Config, Debug)]
pub struct Conf {
    #[config(nested)]
    pub agent: AgentConf,

    #[config(nested)]
    pub logs: LogsConf,

    #[config(nested)]
    pub control: ControlConf,
}

#[derive(Config, Debug)]
pub struct AgentConf {
    /// Base URL of the backend API; without it every payload is spooled
    #[config(env = "DEVOPIN_BACKEND_URL")]
    pub backend_url: Option<String>,

    /// Seconds between two monitoring cycles
    #[config(default = 60)]
    pub interval_secs: u64,

    /// Timeout of a single backend request in seconds
    #[config(default = 10)]
    pub request_timeout_secs: u64,

    /// Prefer IPv6 when resolving the backend address
    #[config(default = false)]
    pub prefer_ipv6: bool,

    /// Directory holding the ledger and the fallback spool
    #[config(default = "/var/lib/devopin-agent")]
    pub state_dir: PathBuf,

    /// Maximum number of payloads kept in the fallback spool
    #[config(default = 1000)]
    pub spool_max_records: usize,

    /// Services monitored even when the backend lists none
    #[config(default = ["nginx", "apache2", "mysql", "postgresql", "redis-server", "docker", "ssh"])]
    pub default_services: Vec<String>,

    /// Extra services the control channel accepts
    #[config(default = [])]
    pub allowed_services: Vec<String>,

    /// Pause between stop and start of a restart, in milliseconds
    #[config(default = 1000)]
    pub restart_delay_ms: u64,

    /// Timeout of a single service manager call in seconds
    #[config(default = 30)]
    pub service_command_timeout_secs: u64,
}

#[derive(Config, Debug)]
pub struct LogsConf {
    /// Directory relative log paths are resolved against, $HOME when unset
    pub base_dir: Option<PathBuf>,

    /// Files larger than this many bytes are skipped
    #[config(default = 52428800)]
    pub max_file_size: u64,

    /// Lines longer than this many bytes are skipped
    #[config(default = 65536)]
    pub max_line_length: usize,

    /// Projects parsed when the backend is unreachable or not configured
    #[config(default = [])]
    pub sources: Vec<SourceConf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConf {
    pub name: String,
    pub log_path: PathBuf,
    pub framework_type: FrameworkKind,
}

#[derive(Config, Debug)]
pub struct ControlConf {
    /// Unix socket the control channel listens on
    #[config(default = "/run/devopin-agent.sock", env = "DEVOPIN_SOCKET_PATH")]
    pub socket_path: PathBuf,

    /// Permission bits of the socket file (0o660)
    #[config(default = 432)]
    pub socket_mode: u32,

    /// Seconds a command may take before it is answered with `timeout`
    #[config(default = 30)]
    pub command_timeout_secs: u64,

    /// Milliseconds a log follower gets between SIGTERM and SIGKILL
    #[config(default = 2000)]
    pub stream_grace_ms: u64,

    /// Journal lines replayed when a stream starts
    #[config(default = 20)]
    pub stream_backlog_lines: usize,
}

impl Conf {
    /// Loads `explicit`, else the first existing default location.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match explicit {
            Some(path) => path.to_owned(),
            None => {
                let candidates = [PathBuf::from(LOCAL_CONFIG), PathBuf::from(SYSTEM_CONFIG)];
                match candidates.iter().find(|p| p.is_file()) {
                    Some(found) => found.clone(),
                    None => return Err(ConfigError::NotFound(candidates.to_vec())),
                }
            }
        };
        if !path.is_file() {
            return Err(ConfigError::NotFound(vec![path]));
        }

        let conf = Conf::builder().env().file(&path).load()?;
        conf.validate()?;
        Ok(conf)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.agent.interval_secs == 0 {
            return Err(ConfigError::Invalid("agent.interval_secs must be positive".to_owned()));
        }
        if let Some(url) = &self.agent.backend_url {
            let uri: http::Uri = url
                .parse()
                .map_err(|e| ConfigError::Invalid(format!("agent.backend_url {url:?}: {e}")))?;
            if !matches!(uri.scheme_str(), Some("http" | "https")) || uri.host().is_none() {
                return Err(ConfigError::Invalid(format!(
                    "agent.backend_url {url:?} must be an http(s) URL"
                )));
            }
        }
        if self.control.socket_mode > 0o777 {
            return Err(ConfigError::Invalid(format!(
                "control.socket_mode {:o} is not a permission mode",
                self.control.socket_mode
            )));
        }
        Ok(())
    }
}

impl AgentConf {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn service_command_timeout(&self) -> Duration {
        Duration::from_secs(self.service_command_timeout_secs)
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.state_dir.join("ledger.json")
    }

    pub fn spool_path(&self) -> PathBuf {
        self.state_dir.join("spool.bin")
    }
}

impl LogsConf {
    pub fn base_dir(&self) -> PathBuf {
        self.base_dir
            .clone()
            .or_else(|| std::env::var_os("HOME").map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("/"))
    }

    pub fn limits(&self) -> ParseLimits {
        ParseLimits {
            max_file_size: self.max_file_size,
            max_line_length: self.max_line_length,
        }
    }
}

impl ControlConf {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn stream_grace(&self) -> Duration {
        Duration::from_millis(self.stream_grace_ms)
    }
}

#[cfg(test)]
mod test {
    use std::fs;

    use super::*;

    #[test]
    fn test_defaults_from_minimal_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[agent]\nbackend_url = \"http://127.0.0.1:8000\"\n").unwrap();

        let conf = Conf::load(Some(&path)).unwrap();
        assert_eq!(conf.agent.interval(), Duration::from_secs(60));
        assert_eq!(conf.agent.default_services.len(), 7);
        assert_eq!(conf.agent.ledger_path(), Path::new("/var/lib/devopin-agent/ledger.json"));
        assert_eq!(conf.control.socket_mode, 0o660);
        assert_eq!(conf.logs.limits().max_line_length, 64 * 1024);
        assert!(conf.logs.sources.is_empty());
    }

    #[test]
    fn test_static_sources() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            r#"
[logs]
base_dir = "/srv"

[[logs.sources]]
name = "shop"
log_path = "shop/storage/logs/laravel.log"
framework_type = "laravel"

[[logs.sources]]
name = "api"
log_path = "/var/log/api"
framework_type = "flask"
"#,
        )
        .unwrap();

        let conf = Conf::load(Some(&path)).unwrap();
        assert_eq!(conf.logs.base_dir(), Path::new("/srv"));
        let kinds: Vec<_> = conf.logs.sources.iter().map(|s| s.framework_type).collect();
        assert_eq!(kinds, [FrameworkKind::Laravel, FrameworkKind::DjangoFlask]);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = Conf::load(Some(&dir.path().join("absent.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }

    #[test]
    fn test_rejects_bad_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[agent]\ninterval_secs = 0\n").unwrap();
        assert!(matches!(Conf::load(Some(&path)), Err(ConfigError::Invalid(_))));

        fs::write(&path, "[agent]\nbackend_url = \"ftp://example.com\"\n").unwrap();
        assert!(matches!(Conf::load(Some(&path)), Err(ConfigError::Invalid(_))));
    }
}
