//! Environment-variable configuration, loaded once at startup.
//!
//! Every field has a documented default; a malformed value fails fast with
//! `RelayError::ConfigInvalid` before the listener binds, rather than
//! surfacing later as a confusing runtime error.

use std::{path::PathBuf, time::Duration};

use tracing::debug;
use wsrelay_protocol::RelayError;

const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_BIND: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 9000;
const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 30_000;
const DEFAULT_PONG_TIMEOUT_MS: u64 = 60_000;
const DEFAULT_DISCONNECT_TIMEOUT_MS: u64 = 90_000;
const DEFAULT_MESSAGE_CACHE_CAP: usize = 256;

/// TLS termination material. Present only when both `TLS_CERT_FILE` and
/// `TLS_KEY_FILE` are set; `TLS_CA_FILES` is optional even then.
#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
    pub ca_files: Vec<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub bind: String,
    pub port: u16,
    pub heartbeat_interval: Duration,
    pub pong_timeout: Duration,
    pub disconnect_timeout: Duration,
    pub message_cache_cap: usize,
    /// Unset disables the distribution bridge; it degrades to a no-op.
    pub redis_url: Option<String>,
    pub tls: Option<TlsConfig>,
}

impl Config {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, RelayError> {
        let log_level = env_or("LOG_LEVEL", DEFAULT_LOG_LEVEL);
        let bind = env_or("BIND", DEFAULT_BIND);
        let port = parse_env("PORT", DEFAULT_PORT)?;
        let heartbeat_interval =
            Duration::from_millis(parse_env("HEARTBEAT_INTERVAL", DEFAULT_HEARTBEAT_INTERVAL_MS)?);
        let pong_timeout = Duration::from_millis(parse_env("PONG_TIMEOUT", DEFAULT_PONG_TIMEOUT_MS)?);
        let disconnect_timeout =
            Duration::from_millis(parse_env("DISCONNECT_TIMEOUT", DEFAULT_DISCONNECT_TIMEOUT_MS)?);
        let message_cache_cap = parse_env("MESSAGE_CACHE_CAP", DEFAULT_MESSAGE_CACHE_CAP)?;
        let redis_url = std::env::var("REDIS_URL").ok().filter(|s| !s.is_empty());
        let tls = load_tls_config()?;

        if message_cache_cap == 0 {
            return Err(RelayError::ConfigInvalid(
                "MESSAGE_CACHE_CAP must be greater than zero".into(),
            ));
        }

        debug!(port, bind = %bind, redis_enabled = redis_url.is_some(), tls_enabled = tls.is_some(), "configuration loaded");

        Ok(Self {
            log_level,
            bind,
            port,
            heartbeat_interval,
            pong_timeout,
            disconnect_timeout,
            message_cache_cap,
            redis_url,
            tls,
        })
    }
}

fn load_tls_config() -> Result<Option<TlsConfig>, RelayError> {
    let cert_file = std::env::var("TLS_CERT_FILE").ok().filter(|s| !s.is_empty());
    let key_file = std::env::var("TLS_KEY_FILE").ok().filter(|s| !s.is_empty());

    match (cert_file, key_file) {
        (None, None) => Ok(None),
        (Some(cert_file), Some(key_file)) => {
            let ca_files = std::env::var("TLS_CA_FILES")
                .ok()
                .filter(|s| !s.is_empty())
                .map(|raw| raw.split(',').map(|p| PathBuf::from(p.trim())).collect())
                .unwrap_or_default();
            Ok(Some(TlsConfig {
                cert_file: PathBuf::from(cert_file),
                key_file: PathBuf::from(key_file),
                ca_files,
            }))
        },
        _ => Err(RelayError::ConfigInvalid(
            "TLS_CERT_FILE and TLS_KEY_FILE must be set together".into(),
        )),
    }
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn parse_env<T>(name: &str, default: T) -> Result<T, RelayError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| RelayError::ConfigInvalid(format!("{name}={raw:?} is invalid: {e}"))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Environment variables are process-global; serialize the tests that
    // touch them to avoid cross-test interference.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn clear_all() {
        for key in [
            "LOG_LEVEL",
            "BIND",
            "PORT",
            "HEARTBEAT_INTERVAL",
            "PONG_TIMEOUT",
            "DISCONNECT_TIMEOUT",
            "MESSAGE_CACHE_CAP",
            "REDIS_URL",
            "TLS_CERT_FILE",
            "TLS_KEY_FILE",
            "TLS_CA_FILES",
        ] {
            unsafe { std::env::remove_var(key) };
        }
    }

    #[test]
    fn defaults_apply_when_unset() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_all();
        let config = Config::from_env().expect("defaults should be valid");
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.heartbeat_interval, Duration::from_millis(DEFAULT_HEARTBEAT_INTERVAL_MS));
        assert!(config.redis_url.is_none());
        assert!(config.tls.is_none());
    }

    #[test]
    fn rejects_non_numeric_port() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_all();
        unsafe { std::env::set_var("PORT", "not-a-number") };
        assert!(matches!(Config::from_env(), Err(RelayError::ConfigInvalid(_))));
        unsafe { std::env::remove_var("PORT") };
    }

    #[test]
    fn rejects_partial_tls_config() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_all();
        unsafe { std::env::set_var("TLS_CERT_FILE", "/tmp/cert.pem") };
        assert!(matches!(Config::from_env(), Err(RelayError::ConfigInvalid(_))));
        unsafe { std::env::remove_var("TLS_CERT_FILE") };
    }
}
