use huddle_common::id::{prefix, prefixed_ulid};

/// Gateway configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Port the HTTP server binds to.
    pub port: u16,
    /// Redis URL for the cross-process fanout bus. When unset, the gateway
    /// runs single-process on the in-memory bus.
    pub redis_url: Option<String>,
    /// Unique identifier for this server process, used to key presence
    /// reports. Generated at startup unless pinned via `PROCESS_ID`.
    pub process_id: String,
    /// Seconds a new connection has to present a valid credential.
    pub auth_timeout_secs: u64,
    /// Heartbeat interval advertised to clients in the `ready` event (ms).
    /// Connections missing 1.5x this window are considered dead.
    pub heartbeat_interval_ms: u64,
    /// How often this process publishes its presence counts to peers (secs).
    pub presence_report_interval_secs: u64,
    /// Peer report TTL: a process silent for longer than this has its
    /// reported counts treated as zero (secs).
    pub presence_peer_ttl_secs: u64,
    /// Initial fanout reconnect backoff (ms). Doubles per attempt.
    pub fanout_backoff_base_ms: u64,
    /// Cap for the fanout reconnect backoff (ms).
    pub fanout_backoff_cap_ms: u64,
}

impl Config {
    /// Load configuration from environment variables, falling back to
    /// defaults suitable for a single local process.
    pub fn from_env() -> Self {
        Self {
            port: parsed_var("PORT", 4010),
            redis_url: std::env::var("REDIS_URL").ok().filter(|s| !s.is_empty()),
            process_id: std::env::var("PROCESS_ID")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| prefixed_ulid(prefix::PROCESS)),
            auth_timeout_secs: parsed_var("AUTH_TIMEOUT_SECS", 10),
            heartbeat_interval_ms: parsed_var("HEARTBEAT_INTERVAL_MS", 30_000),
            presence_report_interval_secs: parsed_var("PRESENCE_REPORT_INTERVAL_SECS", 30),
            presence_peer_ttl_secs: parsed_var("PRESENCE_PEER_TTL_SECS", 90),
            fanout_backoff_base_ms: parsed_var("FANOUT_BACKOFF_BASE_MS", 250),
            fanout_backoff_cap_ms: parsed_var("FANOUT_BACKOFF_CAP_MS", 30_000),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 4010,
            redis_url: None,
            process_id: prefixed_ulid(prefix::PROCESS),
            auth_timeout_secs: 10,
            heartbeat_interval_ms: 30_000,
            presence_report_interval_secs: 30,
            presence_peer_ttl_secs: 90,
            fanout_backoff_base_ms: 250,
            fanout_backoff_cap_ms: 30_000,
        }
    }
}

fn parsed_var<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
