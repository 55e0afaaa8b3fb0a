//! Configuration – reads/writes `~/.meshgate/config.toml`.
//!
//! Precedence, lowest first: built-in defaults, the TOML file,
//! `MESHGATE_*` environment variables, command-line flags.

use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use meshgate_hal::LinkSpec;

/// Persisted gateway configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Radio link: `sim`, `serial:<path>` or `tcp:<host:port>`.
    #[serde(default = "default_link")]
    pub link: String,

    /// Address both servers bind to.
    #[serde(default = "default_bind")]
    pub bind: String,

    #[serde(default = "default_request_port")]
    pub request_port: u16,

    #[serde(default = "default_notify_port")]
    pub notify_port: u16,

    /// How long a client waits for the device worker.
    #[serde(default = "default_response_timeout_secs")]
    pub response_timeout_secs: u64,

    /// Discovery window.
    #[serde(default = "default_device_timeout_secs")]
    pub device_timeout_secs: u64,

    /// Bound on one write to one notify subscriber.
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,

    /// How long the XBee driver waits for the module to answer a frame.
    #[serde(default = "default_frame_timeout_ms")]
    pub frame_timeout_ms: u64,
}

fn default_link() -> String {
    "sim".to_string()
}
fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_request_port() -> u16 {
    meshgate_server::DEFAULT_REQUEST_PORT
}
fn default_notify_port() -> u16 {
    meshgate_server::DEFAULT_NOTIFY_PORT
}
fn default_response_timeout_secs() -> u64 {
    meshgate_server::DEFAULT_RESPONSE_TIMEOUT.as_secs()
}
fn default_device_timeout_secs() -> u64 {
    meshgate_runtime::DEFAULT_DEVICE_TIMEOUT.as_secs()
}
fn default_write_timeout_ms() -> u64 {
    2000
}
fn default_frame_timeout_ms() -> u64 {
    5000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            link: default_link(),
            bind: default_bind(),
            request_port: default_request_port(),
            notify_port: default_notify_port(),
            response_timeout_secs: default_response_timeout_secs(),
            device_timeout_secs: default_device_timeout_secs(),
            write_timeout_ms: default_write_timeout_ms(),
            frame_timeout_ms: default_frame_timeout_ms(),
        }
    }
}

impl Config {
    pub fn link_spec(&self) -> Result<LinkSpec, String> {
        self.link.parse()
    }

    fn bind_ip(&self) -> Result<IpAddr, String> {
        self.bind
            .trim()
            .parse()
            .map_err(|e| format!("Invalid bind address '{}': {}", self.bind, e))
    }

    pub fn request_address(&self) -> Result<SocketAddr, String> {
        Ok(SocketAddr::new(self.bind_ip()?, self.request_port))
    }

    pub fn notify_address(&self) -> Result<SocketAddr, String> {
        Ok(SocketAddr::new(self.bind_ip()?, self.notify_port))
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_secs(self.response_timeout_secs)
    }

    pub fn device_timeout(&self) -> Duration {
        Duration::from_secs(self.device_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn frame_timeout(&self) -> Duration {
        Duration::from_millis(self.frame_timeout_ms)
    }

    /// Reject values the gateway cannot run with.
    pub fn validate(&self) -> Result<(), String> {
        self.link_spec()?;
        self.bind_ip()?;
        if self.request_port != 0 && self.request_port == self.notify_port {
            return Err(format!(
                "request_port and notify_port must differ (both {})",
                self.request_port
            ));
        }
        if self.response_timeout_secs == 0 {
            return Err("response_timeout_secs must be greater than zero".to_string());
        }
        if self.write_timeout_ms == 0 {
            return Err("write_timeout_ms must be greater than zero".to_string());
        }
        if self.frame_timeout_ms == 0 {
            return Err("frame_timeout_ms must be greater than zero".to_string());
        }
        Ok(())
    }
}

/// Return the path to `~/.meshgate/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".meshgate").join("config.toml")
}

/// Load the config at `path`, falling back to defaults when the file does not
/// exist, then apply environment overrides.
pub fn resolve(path: &Path) -> Result<Config, String> {
    let mut cfg = load_from(path)?.unwrap_or_default();
    apply_env_overrides(&mut cfg);
    Ok(cfg)
}

/// Load the config from a specific path. Returns `None` if the file does not
/// exist.
pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let cfg: Config =
        toml::from_str(&raw).map_err(|e| format!("Failed to parse config: {}", e))?;
    Ok(Some(cfg))
}

/// Apply `MESHGATE_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `MESHGATE_LINK` | `link` |
/// | `MESHGATE_BIND` | `bind` |
/// | `MESHGATE_REQUEST_PORT` | `request_port` |
/// | `MESHGATE_NOTIFY_PORT` | `notify_port` |
/// | `MESHGATE_RESPONSE_TIMEOUT_SECS` | `response_timeout_secs` |
/// | `MESHGATE_DEVICE_TIMEOUT_SECS` | `device_timeout_secs` |
///
/// Unparsable numbers are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("MESHGATE_LINK") {
        cfg.link = v;
    }
    if let Ok(v) = std::env::var("MESHGATE_BIND") {
        cfg.bind = v;
    }
    if let Ok(v) = std::env::var("MESHGATE_REQUEST_PORT")
        && let Ok(port) = v.parse::<u16>()
    {
        cfg.request_port = port;
    }
    if let Ok(v) = std::env::var("MESHGATE_NOTIFY_PORT")
        && let Ok(port) = v.parse::<u16>()
    {
        cfg.notify_port = port;
    }
    if let Ok(v) = std::env::var("MESHGATE_RESPONSE_TIMEOUT_SECS")
        && let Ok(secs) = v.parse::<u64>()
    {
        cfg.response_timeout_secs = secs;
    }
    if let Ok(v) = std::env::var("MESHGATE_DEVICE_TIMEOUT_SECS")
        && let Ok(secs) = v.parse::<u64>()
    {
        cfg.device_timeout_secs = secs;
    }
}

/// Directory `save_to` has to create first, if any. A bare file name lives
/// in the current directory.
fn missing_parent(path: &Path) -> Option<&Path> {
    path.parent()
        .filter(|parent| !parent.as_os_str().is_empty() && !parent.exists())
}

/// Save the config to a specific path.
///
/// A missing directory is created owner-only; an existing one is left as is.
pub fn save_to(cfg: &Config, path: &Path) -> Result<(), String> {
    if let Some(parent) = missing_parent(path) {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
        // Owner only (rwx------) on Unix.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| format!("Failed to set config directory permissions: {}", e))?;
        }
    }
    let raw =
        toml::to_string_pretty(cfg).map_err(|e| format!("Failed to serialize config: {}", e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| {
                use std::io::Write;
                f.write_all(raw.as_bytes())
            })
            .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw)
        .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_servers() {
        let cfg = Config::default();
        assert_eq!(cfg.link, "sim");
        assert_eq!(cfg.request_port, 9020);
        assert_eq!(cfg.notify_port, 9021);
        assert_eq!(cfg.response_timeout(), Duration::from_secs(25));
        assert_eq!(cfg.device_timeout(), Duration::from_secs(10));
        assert_eq!(cfg.write_timeout(), Duration::from_secs(2));
        assert_eq!(
            cfg.request_address().unwrap(),
            "0.0.0.0:9020".parse::<SocketAddr>().unwrap()
        );
        assert!(cfg.validate().is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn config_file_has_restrictive_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        save_to(&Config::default(), &path).expect("save");

        let file_mode = std::fs::metadata(&path).expect("file metadata").permissions().mode() & 0o777;
        assert_eq!(file_mode, 0o600, "config file must have 0o600 permissions");

        let dir_meta = std::fs::metadata(path.parent().unwrap()).expect("dir metadata");
        assert_eq!(dir_meta.permissions().mode() & 0o777, 0o700);
    }

    #[cfg(unix)]
    #[test]
    fn existing_directory_keeps_its_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().expect("tmp dir");
        std::fs::set_permissions(dir.path(), std::fs::Permissions::from_mode(0o755)).unwrap();
        let path = dir.path().join("gateway.toml");

        save_to(&Config::default(), &path).expect("save");

        let dir_mode = std::fs::metadata(dir.path()).unwrap().permissions().mode() & 0o777;
        assert_eq!(dir_mode, 0o755);
        let file_mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(file_mode, 0o600);
    }

    #[test]
    fn bare_file_name_needs_no_directory() {
        assert_eq!(missing_parent(Path::new("meshgate.toml")), None);

        let dir = tempfile::tempdir().expect("tmp dir");
        assert_eq!(missing_parent(&dir.path().join("gateway.toml")), None);
        let nested = dir.path().join("etc").join("gateway.toml");
        assert_eq!(missing_parent(&nested), Some(dir.path().join("etc").as_path()));
    }

    #[test]
    fn save_to_creates_missing_directories() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("a").join("b").join("config.toml");
        save_to(&Config::default(), &path).expect("save");
        assert!(load_from(&path).unwrap().is_some());
    }

    #[test]
    fn roundtrip_custom_config() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        let cfg = Config {
            link: "tcp:10.0.0.7:2000".to_string(),
            device_timeout_secs: 4,
            ..Config::default()
        };
        save_to(&cfg, &path).expect("save");

        let loaded = load_from(&path).expect("load ok").expect("some");
        assert_eq!(loaded, cfg);
        assert_eq!(
            loaded.link_spec().unwrap(),
            LinkSpec::Tcp("10.0.0.7:2000".to_string())
        );
    }

    #[test]
    fn missing_fields_take_defaults() {
        let cfg: Config = toml::from_str("link = \"serial:/dev/ttyUSB0\"\n").unwrap();
        assert_eq!(cfg.request_port, 9020);
        assert_eq!(cfg.frame_timeout_ms, 5000);
        assert!(matches!(cfg.link_spec(), Ok(LinkSpec::Serial(_))));
    }

    #[test]
    fn config_path_points_to_meshgate_dir() {
        let p = config_path_for_home("/home/testuser");
        assert!(p.to_string_lossy().contains(".meshgate"));
        assert!(p.to_string_lossy().ends_with("config.toml"));
    }

    #[test]
    fn load_from_returns_none_when_missing() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        assert!(load_from(&path).expect("no error").is_none());
    }

    #[test]
    fn load_from_reports_parse_errors() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "request_port = \"lots\"\n").unwrap();
        let err = load_from(&path).unwrap_err();
        assert!(err.contains("Failed to parse config"));
    }

    #[test]
    fn validate_rejects_bad_values() {
        let cases = [
            Config { link: "usb".to_string(), ..Config::default() },
            Config { bind: "somewhere".to_string(), ..Config::default() },
            Config { notify_port: 9020, ..Config::default() },
            Config { response_timeout_secs: 0, ..Config::default() },
            Config { write_timeout_ms: 0, ..Config::default() },
        ];
        for cfg in cases {
            assert!(cfg.validate().is_err(), "accepted {cfg:?}");
        }
    }

    #[test]
    fn apply_env_overrides_changes_link() {
        // SAFETY: no other test reads or writes this variable.
        unsafe { std::env::set_var("MESHGATE_LINK", "serial:/dev/ttyACM3") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.link, "serial:/dev/ttyACM3");
        unsafe { std::env::remove_var("MESHGATE_LINK") };
    }

    #[test]
    fn apply_env_overrides_changes_request_port() {
        // SAFETY: no other test reads or writes this variable.
        unsafe { std::env::set_var("MESHGATE_REQUEST_PORT", "7020") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.request_port, 7020);
        unsafe { std::env::remove_var("MESHGATE_REQUEST_PORT") };
    }

    #[test]
    fn apply_env_overrides_ignores_invalid_port() {
        // SAFETY: no other test reads or writes this variable.
        unsafe { std::env::set_var("MESHGATE_NOTIFY_PORT", "not-a-port") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.notify_port, 9021);
        unsafe { std::env::remove_var("MESHGATE_NOTIFY_PORT") };
    }

    #[test]
    fn apply_env_overrides_changes_device_timeout() {
        // SAFETY: no other test reads or writes this variable.
        unsafe { std::env::set_var("MESHGATE_DEVICE_TIMEOUT_SECS", "3") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.device_timeout(), Duration::from_secs(3));
        unsafe { std::env::remove_var("MESHGATE_DEVICE_TIMEOUT_SECS") };
    }
}
