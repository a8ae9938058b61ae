// no CLI or config-file parsing here; launchers, config files, and
// wifi/radio management are external collaborators. ssid/password just
// pass through to such a collaborator, this crate never touches a radio.

use crate::error::Result;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

// first-attempt-only recovery hook (bad_wifi/bad_server). default is to
// fail the first connection attempt; an app may override to retry forever.
pub type FirstAttemptHook = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

// invoked with true on entry to Active, false on entry to Failing.
pub type ConnectedCallback = Arc<dyn Fn(bool) + Send + Sync>;

#[derive(Clone)]
pub struct ClientConfig {
    pub server_address: String,
    pub server_port: u16,
    pub client_id: Vec<u8>,
    pub timeout: Duration,
    pub ssid: Option<String>,
    pub password: Option<String>,
    pub watchdog_secs: Option<u64>,
    pub connected_callback: Option<ConnectedCallback>,
    pub bad_wifi: Option<FirstAttemptHook>,
    pub bad_server: Option<FirstAttemptHook>,
}

impl ClientConfig {
    pub fn new(client_id: impl Into<Vec<u8>>, server_address: impl Into<String>) -> Self {
        Self {
            server_address: server_address.into(),
            server_port: 8123,
            client_id: client_id.into(),
            timeout: Duration::from_millis(2000),
            ssid: None,
            password: None,
            watchdog_secs: None,
            connected_callback: None,
            bad_wifi: None,
            bad_server: None,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.server_port = port;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_wifi(mut self, ssid: impl Into<String>, password: impl Into<String>) -> Self {
        self.ssid = Some(ssid.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_watchdog(mut self, secs: u64) -> Self {
        self.watchdog_secs = Some(secs);
        self
    }

    pub fn with_connected_callback(mut self, cb: ConnectedCallback) -> Self {
        self.connected_callback = Some(cb);
        self
    }

    pub fn with_bad_wifi(mut self, hook: FirstAttemptHook) -> Self {
        self.bad_wifi = Some(hook);
        self
    }

    pub fn with_bad_server(mut self, hook: FirstAttemptHook) -> Self {
        self.bad_server = Some(hook);
        self
    }

    pub fn keepalive_interval(&self) -> Duration {
        self.timeout / 4
    }
}

#[derive(Clone)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub expected_ids: Vec<Vec<u8>>,
    pub timeout: Duration,
    pub connected_callback: Option<ConnectedCallback>,
}

impl ServerConfig {
    pub fn new(expected_ids: impl IntoIterator<Item = Vec<u8>>) -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 8123,
            expected_ids: expected_ids.into_iter().collect(),
            timeout: Duration::from_millis(2000),
            connected_callback: None,
        }
    }

    pub fn with_bind_address(mut self, addr: impl Into<String>) -> Self {
        self.bind_address = addr.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_connected_callback(mut self, cb: ConnectedCallback) -> Self {
        self.connected_callback = Some(cb);
        self
    }

    pub fn keepalive_interval(&self) -> Duration {
        self.timeout / 4
    }
}
