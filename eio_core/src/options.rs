//! Engine configuration.

use std::time::Duration;

use crate::transport::TransportKind;

/// Default HTTP path prefix the router binds.
pub const DEFAULT_PATH: &str = "/engine.io/";

/// Default advertised ping cadence.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_millis(25_000);

/// Default liveness deadline.
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_millis(60_000);

/// The engine's configuration knobs. These are the only ones.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Advertised client ping cadence.
    pub ping_interval: Duration,

    /// Liveness deadline; a session whose last ping is older than this is
    /// lost. Also bounds parked polling GETs and blocked outbox writes.
    pub ping_timeout: Duration,

    /// Whether polling sessions may upgrade to the framed transport.
    pub allow_upgrades: bool,

    /// Name of a session cookie to set on handshake, if any.
    pub cookie: Option<String>,

    /// Enabled transports.
    pub transports: Vec<TransportKind>,

    /// HTTP path prefix the router binds.
    pub path: String,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            ping_interval: DEFAULT_PING_INTERVAL,
            ping_timeout: DEFAULT_PING_TIMEOUT,
            allow_upgrades: true,
            cookie: None,
            transports: vec![TransportKind::Polling, TransportKind::Websocket],
            path: DEFAULT_PATH.to_owned(),
        }
    }
}

impl EngineOptions {
    /// Whether requests may use the given transport.
    #[must_use]
    pub fn transport_enabled(&self, kind: TransportKind) -> bool {
        self.transports.contains(&kind)
    }

    /// Upgrade targets advertised in a handshake performed on `kind`.
    #[must_use]
    pub fn upgrades_for(&self, kind: TransportKind) -> Vec<String> {
        if self.allow_upgrades
            && kind == TransportKind::Polling
            && self.transport_enabled(TransportKind::Websocket)
        {
            vec![TransportKind::Websocket.as_str().to_owned()]
        } else {
            Vec::new()
        }
    }
}
