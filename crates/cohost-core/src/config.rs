use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables for the co-host orchestration core.
///
/// Every field has a serde default so partial JSON files stay valid.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct CohostConfig {
    /// Hold in Starting before the round goes Running.
    #[serde(default = "default_announcement_delay_ms")]
    pub announcement_delay_ms: u64,
    /// Hold in Ending before returning to Idle.
    #[serde(default = "default_ending_hold_ms")]
    pub ending_hold_ms: u64,
    /// Minimum spacing between two outgoing invitations.
    #[serde(default = "default_invite_debounce_ms")]
    pub invite_debounce_ms: u64,
    /// Remote co-hosts allowed at once, pending invite included.
    #[serde(default = "default_max_seats")]
    pub max_seats: usize,
    /// Delay before a session with no observers is torn down.
    #[serde(default = "default_observer_grace_ms")]
    pub observer_grace_ms: u64,
    /// Applied to invitations sent with a zero timeout.
    #[serde(default = "default_invite_timeout_secs")]
    pub default_invite_timeout_secs: u32,
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
}

fn default_announcement_delay_ms() -> u64 {
    3_000
}

fn default_ending_hold_ms() -> u64 {
    5_000
}

fn default_invite_debounce_ms() -> u64 {
    500
}

fn default_max_seats() -> usize {
    8
}

fn default_observer_grace_ms() -> u64 {
    5_000
}

fn default_invite_timeout_secs() -> u32 {
    10
}

fn default_tick_interval_ms() -> u64 {
    1_000
}

impl Default for CohostConfig {
    fn default() -> Self {
        Self {
            announcement_delay_ms: default_announcement_delay_ms(),
            ending_hold_ms: default_ending_hold_ms(),
            invite_debounce_ms: default_invite_debounce_ms(),
            max_seats: default_max_seats(),
            observer_grace_ms: default_observer_grace_ms(),
            default_invite_timeout_secs: default_invite_timeout_secs(),
            tick_interval_ms: default_tick_interval_ms(),
        }
    }
}

impl CohostConfig {
    /// Load from a JSON file, falling back to defaults when the file is
    /// missing or unreadable.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(contents) => Self::from_json(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config at {}: {e}, using defaults", path.display());
                Self::default()
            }),
            Err(e) => {
                tracing::debug!("no config at {}: {e}", path.display());
                Self::default()
            }
        }
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn announcement_delay(&self) -> Duration {
        Duration::from_millis(self.announcement_delay_ms)
    }

    pub fn ending_hold(&self) -> Duration {
        Duration::from_millis(self.ending_hold_ms)
    }

    pub fn invite_debounce(&self) -> Duration {
        Duration::from_millis(self.invite_debounce_ms)
    }

    pub fn observer_grace(&self) -> Duration {
        Duration::from_millis(self.observer_grace_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        // A zero period would make tokio::time::interval panic.
        Duration::from_millis(self.tick_interval_ms.max(1))
    }
}
