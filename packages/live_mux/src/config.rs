use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

// =============================================================================
// File config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
// Three equivalent ways to configure:
//
//   config.toml:     [server]
//                    base_url = "http://localhost:3000"
//
//   env var:         LIVEMUX_SERVER__BASE_URL=...   (double underscore = nesting)
//
//   (single underscore stays within field names: LIVEMUX_REALTIME__RECONNECT_DELAY_MS)

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub realtime: RealtimeFileConfig,
}

/// Backend endpoint tunables (lives under `[server]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// Realtime channel tunables (lives under `[realtime]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RealtimeFileConfig {
    #[serde(default = "default_ws_path")]
    pub ws_path: String,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
}

impl Default for RealtimeFileConfig {
    fn default() -> Self {
        Self {
            ws_path: default_ws_path(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
        }
    }
}

fn default_base_url() -> String {
    "http://127.0.0.1:3000".to_string()
}
fn default_request_timeout_secs() -> u64 {
    10
}
fn default_ws_path() -> String {
    "/ws".to_string()
}
fn default_reconnect_delay_ms() -> u64 {
    2000
}

/// Build a figment that layers: defaults → config.toml → LIVEMUX_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `LIVEMUX_SERVER__BASE_URL=http://host:3000`  →  `server.base_url`
///   `LIVEMUX_REALTIME__RECONNECT_DELAY_MS=500`   →  `realtime.reconnect_delay_ms`
pub fn load_config(data_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(data_dir.join("config.toml")))
        .merge(Env::prefixed("LIVEMUX_").split("__"))
}

// =============================================================================
// Runtime config (derived from FileConfig, used throughout the client)
// =============================================================================

/// Resolved client configuration.
#[derive(Clone, Debug)]
pub struct MuxConfig {
    /// REST base, no trailing slash (e.g. `http://127.0.0.1:3000`).
    pub base_url: String,
    /// Per-request timeout for history/send calls.
    pub request_timeout: Duration,
    /// Full realtime endpoint (e.g. `ws://127.0.0.1:3000/ws`).
    pub ws_url: String,
    /// Fixed delay between reconnect attempts.
    pub reconnect_delay: Duration,
}

impl MuxConfig {
    pub fn from_file(fc: &FileConfig) -> Self {
        let base_url = fc.server.base_url.trim_end_matches('/').to_string();
        let ws_path = if fc.realtime.ws_path.starts_with('/') {
            fc.realtime.ws_path.clone()
        } else {
            format!("/{}", fc.realtime.ws_path)
        };
        let ws_url = format!("{}{}", ws_base(&base_url), ws_path);
        Self {
            base_url,
            request_timeout: Duration::from_secs(fc.server.request_timeout_secs),
            ws_url,
            reconnect_delay: Duration::from_millis(fc.realtime.reconnect_delay_ms),
        }
    }
}

/// Map an HTTP base URL onto its WebSocket scheme. Already-websocket URLs
/// pass through untouched.
fn ws_base(base_url: &str) -> String {
    if let Some(rest) = base_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base_url.to_string()
    }
}
