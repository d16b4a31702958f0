//! Client configuration.

use clouddrop_core::protocol::DeviceClass;

/// Configuration for one CloudDrop client session.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Hub base URL, e.g. `ws://127.0.0.1:8787`. The `http(s)` form of the
    /// same host serves the `/api/*` endpoints.
    pub hub_url: String,
    /// Display name announced to the room.
    pub display_name: String,
    /// Device classification announced to the room.
    pub device_class: DeviceClass,
    /// Browser/OS descriptor string announced to the room.
    pub browser_info: String,
    /// Explicit room code; `None` lets the hub derive one from the network.
    pub room: Option<String>,
    /// Room password, when joining a protected room.
    pub password: Option<String>,
    /// Fail a relay transfer that completes with missing chunks instead of
    /// delivering the partial assembly with a warning.
    pub strict_integrity: bool,
    /// Start a silent direct-connection attempt when a peer is discovered.
    pub prewarm: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            hub_url: "ws://127.0.0.1:8787".into(),
            display_name: "CloudDrop device".into(),
            device_class: DeviceClass::Desktop,
            browser_info: String::new(),
            room: None,
            password: None,
            strict_integrity: false,
            prewarm: true,
        }
    }
}

impl ClientConfig {
    /// The `http(s)://` base for the hub's REST endpoints.
    pub fn api_base(&self) -> String {
        let base = self.hub_url.trim_end_matches('/');
        if let Some(rest) = base.strip_prefix("wss://") {
            format!("https://{rest}")
        } else if let Some(rest) = base.strip_prefix("ws://") {
            format!("http://{rest}")
        } else {
            base.to_string()
        }
    }
}
