//! Server configuration: TOML file + CLI overrides.

use crate::session::{ReadinessPolicy, SessionSettings};
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use termhub_core::{TermError, TermResult};
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub sessions: SessionsSection,
    #[serde(default)]
    pub ports: PortsSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
        }
    }
}

/// `[sessions]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionsSection {
    #[serde(default = "default_buffer_lines")]
    pub buffer_lines: usize,
    #[serde(default = "default_cols")]
    pub cols: u16,
    #[serde(default = "default_rows")]
    pub rows: u16,
    #[serde(default = "default_grace_ms")]
    pub grace_ms: u64,
    #[serde(default = "default_ready_attempts")]
    pub ready_attempts: u32,
    #[serde(default = "default_ready_backoff_ms")]
    pub ready_backoff_ms: u64,
    #[serde(default)]
    pub recording_dir: Option<String>,
}

impl Default for SessionsSection {
    fn default() -> Self {
        Self {
            buffer_lines: default_buffer_lines(),
            cols: default_cols(),
            rows: default_rows(),
            grace_ms: default_grace_ms(),
            ready_attempts: default_ready_attempts(),
            ready_backoff_ms: default_ready_backoff_ms(),
            recording_dir: None,
        }
    }
}

/// `[ports]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct PortsSection {
    #[serde(default = "default_port_start")]
    pub start: u16,
    #[serde(default = "default_port_end")]
    pub end: u16,
    #[serde(default = "default_registry")]
    pub registry: String,
}

impl Default for PortsSection {
    fn default() -> Self {
        Self {
            start: default_port_start(),
            end: default_port_end(),
            registry: default_registry(),
        }
    }
}

fn default_bind() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}
fn default_port() -> u16 {
    4480
}
fn default_buffer_lines() -> usize {
    50
}
fn default_cols() -> u16 {
    120
}
fn default_rows() -> u16 {
    32
}
fn default_grace_ms() -> u64 {
    500
}
fn default_ready_attempts() -> u32 {
    10
}
fn default_ready_backoff_ms() -> u64 {
    25
}
fn default_port_start() -> u16 {
    4100
}
fn default_port_end() -> u16 {
    4199
}
fn default_registry() -> String {
    "~/.termhub/ports.json".to_string()
}

/// Default config file location.
pub fn default_config_path() -> PathBuf {
    expand_tilde_str("~/.termhub/config.toml")
}

/// Flags that override the file.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub bind: Option<IpAddr>,
    pub port: Option<u16>,
    pub buffer_lines: Option<usize>,
    pub recording_dir: Option<String>,
    pub port_registry: Option<String>,
}

/// Resolved server configuration (all paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    pub sessions: SessionSettings,
    pub port_start: u16,
    pub port_end: u16,
    pub port_registry: PathBuf,
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(config_path: Option<&Path>, cli: &CliOverrides) -> TermResult<Self> {
        let path = config_path
            .map(expand_tilde)
            .unwrap_or_else(default_config_path);

        let file_config = if path.exists() {
            info!(path = %path.display(), "loading config file");
            let content = std::fs::read_to_string(&path)?;
            parse(&content)?
        } else {
            info!(path = %path.display(), "config file not found, using defaults");
            ConfigFile::default()
        };

        Self::resolve(file_config, cli)
    }

    /// Merge CLI overrides into a parsed file.
    pub fn resolve(file: ConfigFile, cli: &CliOverrides) -> TermResult<Self> {
        let ConfigFile {
            server,
            sessions,
            ports,
        } = file;

        if ports.start > ports.end {
            return Err(TermError::Config(format!(
                "port range is empty: {}..={}",
                ports.start, ports.end
            )));
        }
        if sessions.cols == 0 || sessions.rows == 0 {
            return Err(TermError::Config("terminal size must be positive".into()));
        }

        let readiness_backoff = Duration::from_millis(sessions.ready_backoff_ms);
        let settings = SessionSettings {
            buffer_lines: cli.buffer_lines.unwrap_or(sessions.buffer_lines),
            cols: sessions.cols,
            rows: sessions.rows,
            grace: Duration::from_millis(sessions.grace_ms),
            readiness: ReadinessPolicy {
                attempts: sessions.ready_attempts,
                initial_backoff: readiness_backoff,
                max_backoff: readiness_backoff * 16,
            },
            recording_dir: cli
                .recording_dir
                .as_deref()
                .or(sessions.recording_dir.as_deref())
                .map(expand_tilde_str),
        };

        let registry = cli.port_registry.as_deref().unwrap_or(&ports.registry);

        Ok(Self {
            listen: SocketAddr::new(
                cli.bind.unwrap_or(server.bind),
                cli.port.unwrap_or(server.port),
            ),
            sessions: settings,
            port_start: ports.start,
            port_end: ports.end,
            port_registry: expand_tilde_str(registry),
        })
    }
}

fn parse(content: &str) -> TermResult<ConfigFile> {
    toml::from_str::<ConfigFile>(content)
        .map_err(|e| TermError::Config(format!("config parse error: {e}")))
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config = ServerConfig::resolve(parse("").unwrap(), &CliOverrides::default()).unwrap();
        assert_eq!(config.listen.port(), 4480);
        assert!(config.listen.ip().is_loopback());
        assert_eq!(config.sessions.buffer_lines, 50);
        assert_eq!(config.sessions.grace, Duration::from_millis(500));
        assert_eq!((config.port_start, config.port_end), (4100, 4199));
        assert!(config.port_registry.ends_with(".termhub/ports.json"));
        assert!(config.sessions.recording_dir.is_none());
    }

    #[test]
    fn cli_overrides_file() {
        let file = parse(
            r#"
            [server]
            port = 9000

            [sessions]
            buffer_lines = 200
            recording_dir = "/var/tmp/rec"

            [ports]
            start = 5000
            end = 5010
            "#,
        )
        .unwrap();
        let cli = CliOverrides {
            port: Some(9100),
            buffer_lines: Some(10),
            ..CliOverrides::default()
        };
        let config = ServerConfig::resolve(file, &cli).unwrap();
        assert_eq!(config.listen.port(), 9100);
        assert_eq!(config.sessions.buffer_lines, 10);
        assert_eq!(
            config.sessions.recording_dir.as_deref(),
            Some(Path::new("/var/tmp/rec"))
        );
        assert_eq!((config.port_start, config.port_end), (5000, 5010));
    }

    #[test]
    fn inverted_port_range_is_rejected() {
        let file = parse("[ports]\nstart = 10\nend = 5\n").unwrap();
        let err = ServerConfig::resolve(file, &CliOverrides::default()).unwrap_err();
        assert!(matches!(err, TermError::Config(_)));
    }

    #[test]
    fn bad_toml_is_a_config_error() {
        assert!(matches!(parse("[server\nport ="), Err(TermError::Config(_))));
    }

    #[test]
    fn tilde_expands_to_home() {
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_tilde_str("~/x/y"), home.join("x/y"));
        }
        assert_eq!(expand_tilde_str("/abs/path"), PathBuf::from("/abs/path"));
    }
}
