//! OPEN-packet handshake body.

use serde::{Deserialize, Serialize};

/// JSON body of the OPEN packet written when a session is established.
///
/// Field order matches the wire format other implementations emit:
/// `{"sid","upgrades","pingInterval","pingTimeout"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    /// Server-generated session id.
    pub sid: String,

    /// Transport names the client may upgrade to.
    pub upgrades: Vec<String>,

    /// Advertised client ping cadence, milliseconds.
    pub ping_interval: u64,

    /// Liveness deadline, milliseconds.
    pub ping_timeout: u64,
}
