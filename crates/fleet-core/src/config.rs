//! Hierarchical configuration loader.
//!
//! Five layers are merged key-by-key, later layers winning: built-in
//! defaults, a packaged `default.conf`, `/etc/<name>.conf`, every file in
//! `/etc/<name>.conf.d/*.conf` in alphabetical order, and finally the
//! process environment (`FLEETD_`-prefixed or bare key names). Each file
//! layer is a flat `KEY=VALUE` source, one assignment per line, `#`
//! comments and blank lines ignored, values optionally single- or
//! double-quoted — the same shape used for the environment-file loader
//! elsewhere in this codebase, generalized to multiple layered sources.

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub const DEFAULT_PORT: u16 = 842;
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 2000;
pub const DEFAULT_UDS_PATH: &str = "/run/fleetd/fleetd.sock";
pub const DEFAULT_BASE_PATH: &str = "/org/eclipse/bluechi";
pub const DEFAULT_BASE_NAME: &str = "org.eclipse.bluechi";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "DEBUG" => Some(LogLevel::Debug),
            "INFO" => Some(LogLevel::Info),
            "WARN" => Some(LogLevel::Warn),
            "ERROR" => Some(LogLevel::Error),
            _ => None,
        }
    }

    pub fn as_tracing_filter(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogTarget {
    Journald,
    Stderr,
    StderrFull,
}

impl LogTarget {
    fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "journald" => Some(LogTarget::Journald),
            "stderr" => Some(LogTarget::Stderr),
            "stderr-full" => Some(LogTarget::StderrFull),
            _ => None,
        }
    }
}

/// Fully resolved configuration for either the controller or the agent
/// binary; both read the same option set and ignore what they don't use.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub controller_host: Option<String>,
    pub controller_address: Option<String>,
    pub node_name: String,
    /// Empty means "accept any name" (see design notes), not "no nodes
    /// allowed".
    pub allowed_node_names: Vec<String>,
    pub heartbeat_interval_ms: u64,
    pub use_tcp: bool,
    pub use_uds: bool,
    pub uds_path: PathBuf,
    pub tcp_keepalive_time_secs: u32,
    pub tcp_keepalive_interval_secs: u32,
    pub tcp_keepalive_count: u32,
    pub ip_receive_errors: bool,
    pub log_level: LogLevel,
    pub log_target: LogTarget,
    pub log_is_quiet: bool,
    pub base_path: String,
    pub base_name: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            port: DEFAULT_PORT,
            controller_host: None,
            controller_address: None,
            node_name: gethostname::gethostname().to_string_lossy().into_owned(),
            allowed_node_names: Vec::new(),
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            use_tcp: true,
            use_uds: false,
            uds_path: PathBuf::from(DEFAULT_UDS_PATH),
            tcp_keepalive_time_secs: 60,
            tcp_keepalive_interval_secs: 10,
            tcp_keepalive_count: 3,
            ip_receive_errors: false,
            log_level: LogLevel::Info,
            log_target: LogTarget::Stderr,
            log_is_quiet: false,
            base_path: DEFAULT_BASE_PATH.to_string(),
            base_name: DEFAULT_BASE_NAME.to_string(),
        }
    }
}

impl Config {
    /// Is `name` permitted to register? An empty allow-list accepts any
    /// name.
    pub fn allows_node_name(&self, name: &str) -> bool {
        self.allowed_node_names.is_empty()
            || self.allowed_node_names.iter().any(|n| n == name)
    }

    /// Loads the layered configuration for a component named `name`
    /// (typically `"fleetd"`), searching the standard system locations.
    /// Errors only on a malformed file; missing files are silently
    /// skipped.
    pub fn load(name: &str) -> Result<Self> {
        let mut layer = KvLayer::new();

        layer.merge_file(&PathBuf::from(format!("/usr/share/{name}/default.conf")))?;
        layer.merge_file(&PathBuf::from(format!("/etc/{name}.conf")))?;

        let conf_d = PathBuf::from(format!("/etc/{name}.conf.d"));
        if conf_d.is_dir() {
            let pattern = conf_d.join("*.conf");
            let mut paths: Vec<PathBuf> = glob::glob(&pattern.to_string_lossy())
                .map_err(|e| Error::config(e.to_string()))?
                .filter_map(std::result::Result::ok)
                .collect();
            paths.sort();
            for path in paths {
                layer.merge_file(&path)?;
            }
        }

        layer.merge_env(name);
        layer.into_config()
    }
}

struct KvLayer {
    values: HashMap<String, String>,
}

impl KvLayer {
    fn new() -> Self {
        KvLayer {
            values: HashMap::new(),
        }
    }

    fn merge_file(&mut self, path: &Path) -> Result<()> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(Error::Transport(e)),
        };
        for line in contents.lines() {
            if let Some((key, value)) = parse_kv_line(line) {
                self.values.insert(key.to_ascii_uppercase(), value);
            }
        }
        Ok(())
    }

    fn merge_env(&mut self, name: &str) {
        let prefix = format!("{}_", name.to_ascii_uppercase());
        for (key, value) in std::env::vars() {
            let bare = key.strip_prefix(&prefix).unwrap_or(&key);
            self.values.insert(bare.to_ascii_uppercase(), value);
        }
    }

    fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    fn into_config(self) -> Result<Config> {
        let mut cfg = Config::default();

        if let Some(v) = self.get("PORT") {
            cfg.port = v
                .parse()
                .map_err(|_| Error::config(format!("invalid Port: {v}")))?;
        }
        if let Some(v) = self.get("CONTROLLERHOST") {
            cfg.controller_host = Some(v.to_string());
        }
        if let Some(v) = self.get("CONTROLLERADDRESS") {
            cfg.controller_address = Some(v.to_string());
        }
        if let Some(v) = self.get("NODENAME") {
            cfg.node_name = v.to_string();
        }
        if let Some(v) = self.get("ALLOWEDNODENAMES") {
            cfg.allowed_node_names = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(v) = self.get("HEARTBEATINTERVAL") {
            cfg.heartbeat_interval_ms = v
                .parse()
                .map_err(|_| Error::config(format!("invalid HeartbeatInterval: {v}")))?;
        }
        if let Some(v) = self.get("USETCP") {
            cfg.use_tcp = parse_bool(v)?;
        }
        if let Some(v) = self.get("USEUDS") {
            cfg.use_uds = parse_bool(v)?;
        }
        if let Some(v) = self.get("UDSPATH") {
            cfg.uds_path = PathBuf::from(v);
        }
        if let Some(v) = self.get("TCPKEEPALIVETIME") {
            cfg.tcp_keepalive_time_secs = v
                .parse()
                .map_err(|_| Error::config(format!("invalid TcpKeepaliveTime: {v}")))?;
        }
        if let Some(v) = self.get("TCPKEEPALIVEINTERVAL") {
            cfg.tcp_keepalive_interval_secs = v
                .parse()
                .map_err(|_| Error::config(format!("invalid TcpKeepaliveInterval: {v}")))?;
        }
        if let Some(v) = self.get("TCPKEEPALIVECOUNT") {
            cfg.tcp_keepalive_count = v
                .parse()
                .map_err(|_| Error::config(format!("invalid TcpKeepaliveCount: {v}")))?;
        }
        if let Some(v) = self.get("IPRECEIVEERRORS") {
            cfg.ip_receive_errors = parse_bool(v)?;
        }
        if let Some(v) = self.get("LOGLEVEL") {
            cfg.log_level = LogLevel::parse(v)
                .ok_or_else(|| Error::config(format!("invalid LogLevel: {v}")))?;
        }
        if let Some(v) = self.get("LOGTARGET") {
            cfg.log_target = LogTarget::parse(v)
                .ok_or_else(|| Error::config(format!("invalid LogTarget: {v}")))?;
        }
        if let Some(v) = self.get("LOGISQUIET") {
            cfg.log_is_quiet = parse_bool(v)?;
        }

        for key in self.values.keys() {
            if !KNOWN_KEYS.contains(&key.as_str()) {
                tracing::warn!(key = %key, "ignoring unknown configuration option");
            }
        }

        Ok(cfg)
    }
}

const KNOWN_KEYS: &[&str] = &[
    "PORT",
    "CONTROLLERHOST",
    "CONTROLLERADDRESS",
    "NODENAME",
    "ALLOWEDNODENAMES",
    "HEARTBEATINTERVAL",
    "USETCP",
    "USEUDS",
    "UDSPATH",
    "TCPKEEPALIVETIME",
    "TCPKEEPALIVEINTERVAL",
    "TCPKEEPALIVECOUNT",
    "IPRECEIVEERRORS",
    "LOGLEVEL",
    "LOGTARGET",
    "LOGISQUIET",
];

fn parse_bool(v: &str) -> Result<bool> {
    match v.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(Error::config(format!("invalid boolean: {other}"))),
    }
}

fn parse_kv_line(line: &str) -> Option<(String, String)> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let (key, raw_value) = line.split_once('=')?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }
    let value = raw_value.trim();
    let value = if (value.starts_with('"') && value.ends_with('"') && value.len() >= 2)
        || (value.starts_with('\'') && value.ends_with('\'') && value.len() >= 2)
    {
        &value[1..value.len() - 1]
    } else {
        value
    };
    Some((key.to_string(), value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_line() {
        assert_eq!(
            parse_kv_line("Port=842"),
            Some(("Port".to_string(), "842".to_string()))
        );
    }

    #[test]
    fn strips_quotes() {
        assert_eq!(
            parse_kv_line(r#"NodeName="laptop""#),
            Some(("NodeName".to_string(), "laptop".to_string()))
        );
        assert_eq!(
            parse_kv_line("NodeName='laptop'"),
            Some(("NodeName".to_string(), "laptop".to_string()))
        );
    }

    #[test]
    fn ignores_comments_and_blank_lines() {
        assert_eq!(parse_kv_line("# a comment"), None);
        assert_eq!(parse_kv_line("   "), None);
    }

    #[test]
    fn empty_allow_list_accepts_any_name() {
        let cfg = Config::default();
        assert!(cfg.allowed_node_names.is_empty());
        assert!(cfg.allows_node_name("anything-at-all"));
    }

    #[test]
    fn nonempty_allow_list_rejects_unknown_names() {
        let mut cfg = Config::default();
        cfg.allowed_node_names = vec!["laptop".to_string()];
        assert!(cfg.allows_node_name("laptop"));
        assert!(!cfg.allows_node_name("desktop"));
    }

    #[test]
    fn later_layer_overrides_default() {
        let dir = tempfile::tempdir().unwrap();
        let conf = dir.path().join("fleetd.conf");
        std::fs::write(&conf, "Port=9999\n").unwrap();

        let mut layer = KvLayer::new();
        layer.merge_file(&conf).unwrap();
        let cfg = layer.into_config().unwrap();
        assert_eq!(cfg.port, 9999);
    }
}
