//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! API keys are loaded from the API_KEYS env var or keys.keys_file, never
//! stored in the TOML directly.

use common::Secret;
use key_pool::DispatchConfig;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Env var holding API keys, comma or newline separated.
pub const API_KEYS_ENV: &str = "API_KEYS";

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub keys: KeysConfig,
}

/// Listener settings
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    /// Key administration listener, kept off the public port.
    #[serde(default = "default_admin_addr")]
    pub admin_listen_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Hosted model API settings
#[derive(Debug, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model: default_model(),
            timeout_secs: default_timeout(),
        }
    }
}

/// API key sources
#[derive(Debug, Default, Deserialize)]
pub struct KeysConfig {
    /// File with one key per line (alternative to the API_KEYS env var)
    #[serde(default)]
    pub keys_file: Option<PathBuf>,
    #[serde(skip)]
    pub api_keys: Vec<Secret<String>>,
}

fn default_admin_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9090))
}

fn default_max_connections() -> usize {
    64
}

fn default_base_url() -> String {
    "https://generativelanguage.googleapis.com".into()
}

fn default_model() -> String {
    "gemini-2.0-flash".into()
}

fn default_timeout() -> u64 {
    60
}

/// Split a raw key list on commas and newlines, dropping blank entries.
pub fn parse_keys(raw: &str) -> Vec<String> {
    raw.split([',', '\n'])
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(str::to_owned)
        .collect()
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// API key resolution order:
    /// 1. API_KEYS env var
    /// 2. keys_file path from config
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.validate()?;

        let keys = match std::env::var(API_KEYS_ENV) {
            Ok(raw) => parse_keys(&raw),
            Err(_) => match &config.keys.keys_file {
                Some(keys_file) => {
                    let raw = std::fs::read_to_string(keys_file).map_err(|e| {
                        common::Error::Config(format!(
                            "failed to read keys_file {}: {e}",
                            keys_file.display()
                        ))
                    })?;
                    parse_keys(&raw)
                }
                None => Vec::new(),
            },
        };
        if keys.is_empty() {
            return Err(common::Error::Config(format!(
                "no API keys configured: set {API_KEYS_ENV} or keys.keys_file"
            )));
        }
        config.keys.api_keys = keys.into_iter().map(Secret::new).collect();

        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        if !self.upstream.base_url.starts_with("http://")
            && !self.upstream.base_url.starts_with("https://")
        {
            return Err(common::Error::Config(format!(
                "base_url must start with http:// or https://, got: {}",
                self.upstream.base_url
            )));
        }
        if self.upstream.timeout_secs == 0 {
            return Err(common::Error::Config(
                "timeout_secs must be greater than 0".into(),
            ));
        }
        if self.server.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }
        if self.dispatch.max_attempts == 0 {
            return Err(common::Error::Config(
                "max_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("draft-gateway.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Serializes tests that read or mutate environment variables.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// SAFETY: Callers must hold ENV_MUTEX to prevent concurrent env mutation.
    unsafe fn set_env(key: &str, val: &str) {
        unsafe { std::env::set_var(key, val) };
    }

    unsafe fn remove_env(key: &str) {
        unsafe { std::env::remove_var(key) };
    }

    const MINIMAL_TOML: &str = r#"
[server]
listen_addr = "127.0.0.1:8080"
"#;

    fn write_config(dir: &tempfile::TempDir, contents: &str) -> PathBuf {
        let path = dir.path().join("config.toml");
        std::fs::write(&path, contents).unwrap();
        path
    }

    fn exposed(config: &Config) -> Vec<String> {
        config
            .keys
            .api_keys
            .iter()
            .map(|k| k.expose().clone())
            .collect()
    }

    #[test]
    fn test_load_minimal_config_applies_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, MINIMAL_TOML);
        unsafe { set_env(API_KEYS_ENV, "AIzaKeyOne") };

        let config = Config::load(&path).unwrap();
        assert_eq!(config.server.max_connections, 64);
        assert_eq!(config.server.admin_listen_addr, default_admin_addr());
        assert_eq!(
            config.upstream.base_url,
            "https://generativelanguage.googleapis.com"
        );
        assert_eq!(config.upstream.model, "gemini-2.0-flash");
        assert_eq!(config.upstream.timeout_secs, 60);
        assert_eq!(config.dispatch.max_attempts, 3);
        assert_eq!(config.dispatch.rotation_backoff_ms, 2000);
        assert_eq!(config.dispatch.batch_pacing_ms, 2000);
        assert_eq!(exposed(&config), vec!["AIzaKeyOne"]);

        unsafe { remove_env(API_KEYS_ENV) };
    }

    #[test]
    fn test_load_full_config() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
[server]
listen_addr = "0.0.0.0:8000"
admin_listen_addr = "127.0.0.1:9100"
max_connections = 8

[upstream]
base_url = "http://localhost:4000"
model = "gemini-1.5-pro"
timeout_secs = 15

[dispatch]
max_attempts = 5
rotation_backoff_ms = 250
batch_pacing_ms = 0
"#,
        );
        unsafe { set_env(API_KEYS_ENV, "k1,k2") };

        let config = Config::load(&path).unwrap();
        assert_eq!(config.server.max_connections, 8);
        assert_eq!(config.server.admin_listen_addr.port(), 9100);
        assert_eq!(config.upstream.model, "gemini-1.5-pro");
        assert_eq!(config.upstream.timeout_secs, 15);
        assert_eq!(config.dispatch.max_attempts, 5);
        assert_eq!(config.dispatch.rotation_backoff_ms, 250);
        assert_eq!(config.dispatch.batch_pacing_ms, 0);

        unsafe { remove_env(API_KEYS_ENV) };
    }

    #[test]
    fn test_load_missing_file() {
        let result = Config::load(Path::new("/nonexistent/path/config.toml"));
        assert!(matches!(result, Err(common::Error::Io(_))));
    }

    #[test]
    fn test_load_invalid_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "not valid {{{{ toml");
        assert!(matches!(Config::load(&path), Err(common::Error::Toml(_))));
    }

    #[test]
    fn test_keys_from_file() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let keys_path = dir.path().join("api-keys");
        std::fs::write(&keys_path, "key-a\n\n  key-b  \n").unwrap();
        let path = write_config(
            &dir,
            &format!(
                "{MINIMAL_TOML}\n[keys]\nkeys_file = \"{}\"\n",
                keys_path.display()
            ),
        );
        unsafe { remove_env(API_KEYS_ENV) };

        let config = Config::load(&path).unwrap();
        assert_eq!(exposed(&config), vec!["key-a", "key-b"]);
    }

    #[test]
    fn test_keys_env_overrides_file() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            &format!("{MINIMAL_TOML}\n[keys]\nkeys_file = \"/nonexistent/api-keys\"\n"),
        );
        unsafe { set_env(API_KEYS_ENV, "env-key") };

        let config = Config::load(&path).unwrap();
        assert_eq!(
            exposed(&config),
            vec!["env-key"],
            "API_KEYS must take precedence over keys_file"
        );

        unsafe { remove_env(API_KEYS_ENV) };
    }

    #[test]
    fn test_keys_file_nonexistent_returns_error() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            &format!("{MINIMAL_TOML}\n[keys]\nkeys_file = \"/nonexistent/api-keys\"\n"),
        );
        unsafe { remove_env(API_KEYS_ENV) };

        let err = Config::load(&path).unwrap_err().to_string();
        assert!(err.contains("failed to read keys_file"), "got: {err}");
    }

    #[test]
    fn test_no_keys_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, MINIMAL_TOML);
        unsafe { set_env(API_KEYS_ENV, " , \n ,") };

        let err = Config::load(&path).unwrap_err().to_string();
        assert!(err.contains("no API keys configured"), "got: {err}");

        unsafe { remove_env(API_KEYS_ENV) };
    }

    #[test]
    fn test_parse_keys_splits_on_commas_and_newlines() {
        assert_eq!(
            parse_keys("k1, k2\nk3\r\n,,\n  "),
            vec!["k1", "k2", "k3"]
        );
        assert!(parse_keys("").is_empty());
    }

    #[test]
    fn test_invalid_base_url_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            &format!("{MINIMAL_TOML}\n[upstream]\nbase_url = \"generativelanguage.googleapis.com\"\n"),
        );
        unsafe { set_env(API_KEYS_ENV, "k1") };

        let err = Config::load(&path).unwrap_err().to_string();
        assert!(
            err.contains("base_url must start with http"),
            "error message should explain the issue, got: {err}"
        );

        unsafe { remove_env(API_KEYS_ENV) };
    }

    #[test]
    fn test_zero_values_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        unsafe { set_env(API_KEYS_ENV, "k1") };

        for (extra, expected) in [
            ("[upstream]\ntimeout_secs = 0\n", "timeout_secs"),
            ("[dispatch]\nmax_attempts = 0\n", "max_attempts"),
        ] {
            let path = write_config(&dir, &format!("{MINIMAL_TOML}\n{extra}"));
            let err = Config::load(&path).unwrap_err().to_string();
            assert!(err.contains(expected), "got: {err}");
        }

        let path = write_config(
            &dir,
            "[server]\nlisten_addr = \"127.0.0.1:8080\"\nmax_connections = 0\n",
        );
        let err = Config::load(&path).unwrap_err().to_string();
        assert!(err.contains("max_connections"), "got: {err}");

        unsafe { remove_env(API_KEYS_ENV) };
    }

    #[test]
    fn test_debug_output_redacts_keys() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, MINIMAL_TOML);
        unsafe { set_env(API_KEYS_ENV, "AIzaSySuperSecretKey") };

        let config = Config::load(&path).unwrap();
        let debug = format!("{config:?}");
        assert!(!debug.contains("AIzaSySuperSecretKey"));

        unsafe { remove_env(API_KEYS_ENV) };
    }

    #[test]
    fn test_resolve_path_cli_arg() {
        let path = Config::resolve_path(Some("/custom/path.toml"));
        assert_eq!(path, PathBuf::from("/custom/path.toml"));
    }

    #[test]
    fn test_resolve_path_env_var() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { set_env("CONFIG_PATH", "/env/path.toml") };
        let path = Config::resolve_path(None);
        assert_eq!(path, PathBuf::from("/env/path.toml"));
        unsafe { remove_env("CONFIG_PATH") };
    }

    #[test]
    fn test_resolve_path_default() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env("CONFIG_PATH") };
        let path = Config::resolve_path(None);
        assert_eq!(path, PathBuf::from("draft-gateway.toml"));
    }

    #[test]
    fn test_resolve_path_cli_overrides_env() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { set_env("CONFIG_PATH", "/env/should-lose.toml") };
        let path = Config::resolve_path(Some("/cli/wins.toml"));
        assert_eq!(path, PathBuf::from("/cli/wins.toml"));
        unsafe { remove_env("CONFIG_PATH") };
    }
}
