//! The Loop's own tunables (§6 "Configuration options"), mirroring the
//! shape of the teacher's `Config`: a plain struct with a `Default` impl,
//! `serde::Deserialize` so a host application can source it from a TOML
//! fragment, and a couple of environment-variable overrides read once at
//! construction (§6 "Environment toggles").

use serde::Deserialize;
use std::time::Duration;

/// Default CHUNK_SIZE for reads and the write refill soft cap (§4.7).
pub const DEFAULT_CHUNK_SIZE: usize = 4096;

fn default_accept_timeout() -> u64 {
    5
}
fn default_connect_timeout() -> u64 {
    5
}
fn default_max_clients() -> usize {
    1000
}
fn default_poll_wait_ms() -> u64 {
    250
}

/// Loop-wide configuration (§5, §6).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoopOptions {
    #[serde(default = "default_accept_timeout")]
    pub accept_timeout_s: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_s: u64,
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,
    /// Backend `wait` cadence, in milliseconds (default 250ms / 0.25s).
    #[serde(default = "default_poll_wait_ms")]
    pub poll_wait_ms: u64,
}

impl Default for LoopOptions {
    fn default() -> Self {
        Self {
            accept_timeout_s: default_accept_timeout(),
            connect_timeout_s: default_connect_timeout(),
            max_clients: default_max_clients(),
            poll_wait_ms: default_poll_wait_ms(),
        }
    }
}

impl LoopOptions {
    pub fn accept_timeout(&self) -> Duration {
        Duration::from_secs(self.accept_timeout_s)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_s)
    }

    pub fn poll_wait(&self) -> Duration {
        Duration::from_millis(self.poll_wait_ms)
    }

    /// CHUNK_SIZE, honoring `LOOP_CHUNK_SIZE` if set (§6).
    pub fn chunk_size() -> usize {
        std::env::var("LOOP_CHUNK_SIZE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_CHUNK_SIZE)
    }

    /// Whether `LOOP_DISABLE_IPV6` is set, consulted by `connect`'s
    /// address resolution.
    pub fn ipv6_disabled() -> bool {
        std::env::var_os("LOOP_DISABLE_IPV6").is_some()
    }

    /// Whether `LOOP_DISABLE_TLS` is set; `listen`/`connect` reject a
    /// `tls: true` request when this is present.
    pub fn tls_disabled() -> bool {
        std::env::var_os("LOOP_DISABLE_TLS").is_some()
    }
}

/// Admission predicates (§3 `lock`/`unlock`, §4.3). Default is
/// always-admit.
pub struct AdmissionHooks {
    pub lock: Box<dyn FnMut(bool) -> bool>,
    pub unlock: Box<dyn FnMut()>,
}

impl Default for AdmissionHooks {
    fn default() -> Self {
        Self {
            lock: Box::new(|_is_empty| true),
            unlock: Box::new(|| {}),
        }
    }
}

/// Per-`listen` options (§6).
pub struct ListenOptions {
    pub port: u16,
    pub address: Option<String>,
    pub queue_size: Option<i32>,
    /// UNIX-domain socket path; when set, overrides `port`/`address`.
    pub file: Option<String>,
    pub tls: bool,
}

impl ListenOptions {
    pub fn tcp(port: u16) -> Self {
        Self {
            port,
            address: None,
            queue_size: None,
            file: None,
            tls: false,
        }
    }

    pub fn unix(path: impl Into<String>) -> Self {
        Self {
            port: 0,
            address: None,
            queue_size: None,
            file: Some(path.into()),
            tls: false,
        }
    }
}

/// Per-`connect` options (§6). Default port 80, or 443 if `tls`.
pub struct ConnectOptions {
    pub host: String,
    pub port: Option<u16>,
    pub tls: bool,
    /// UNIX-domain socket path; when set, `host`/`port` are ignored and the
    /// connect pipeline dials the socket file instead (§10 supplemented
    /// behavior: a connect-side counterpart to `ListenOptions::file`).
    pub file: Option<String>,
}

impl ConnectOptions {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: None,
            tls: false,
            file: None,
        }
    }

    pub fn unix(path: impl Into<String>) -> Self {
        Self {
            host: String::new(),
            port: None,
            tls: false,
            file: Some(path.into()),
        }
    }

    pub fn resolved_port(&self) -> u16 {
        self.port.unwrap_or(if self.tls { 443 } else { 80 })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let opts = LoopOptions::default();
        assert_eq!(opts.accept_timeout_s, 5);
        assert_eq!(opts.connect_timeout_s, 5);
        assert_eq!(opts.max_clients, 1000);
        assert_eq!(opts.poll_wait(), Duration::from_millis(250));
    }

    #[test]
    fn toml_round_trip() {
        let toml_str = r#"
            accept_timeout_s = 1
            max_clients = 2
        "#;
        let opts: LoopOptions = toml::from_str(toml_str).unwrap();
        assert_eq!(opts.accept_timeout_s, 1);
        assert_eq!(opts.max_clients, 2);
        // Fields absent from the fragment keep their defaults.
        assert_eq!(opts.connect_timeout_s, 5);
    }

    #[test]
    fn connect_options_default_ports() {
        let plain = ConnectOptions::new("example.test");
        assert_eq!(plain.resolved_port(), 80);

        let mut tls = ConnectOptions::new("example.test");
        tls.tls = true;
        assert_eq!(tls.resolved_port(), 443);
    }
}
