use koh_core::{BusKind, Config};

/// Daemon configuration, loaded from environment variables.
pub struct DaemonConfig {
    /// Corpus, model and threshold settings shared with the CLI.
    pub recognizer: Config,
    /// Upper bound on one engine request, in seconds.
    pub request_timeout_secs: u64,
    pub bus: BusKind,
}

impl DaemonConfig {
    /// Load `KOH_*` variables on top of the recognizer settings.
    pub fn from_env() -> Self {
        Self {
            recognizer: Config::from_env(),
            request_timeout_secs: env_u64("KOH_REQUEST_TIMEOUT_SECS", 30),
            bus: BusKind::from_env(),
        }
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
