//! Application-level configuration loading: turn timing, room codes and the capacity model.

use std::{env, fs, io::ErrorKind, path::PathBuf, time::Duration};

use serde::Deserialize;
use serde_with::{DurationMilliSeconds, serde_as};
use tracing::{info, warn};

use crate::dao::models::AdmissionPolicy;

/// Default location on disk where the server looks for the JSON configuration.
const DEFAULT_CONFIG_PATH: &str = "config/app.json";
/// Environment variable that overrides [`DEFAULT_CONFIG_PATH`].
const CONFIG_PATH_ENV: &str = "LIVE_TRAINING_CONFIG_PATH";

/// Fixed length of a live-session turn.
pub const DEFAULT_TURN_DURATION: Duration = Duration::from_secs(30);
const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(250);
const DEFAULT_ROOM_CODE_LENGTH: usize = 6;
const DEFAULT_ROOM_CODE_ATTEMPTS: u32 = 5;
const DEFAULT_START_THRESHOLD: usize = 2;
const DEFAULT_FEED_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
/// Immutable runtime configuration shared across the application.
pub struct AppConfig {
    /// Time a player holds the turn before it times out.
    pub turn_duration: Duration,
    /// Period of the local presentation clock of every live session agent.
    pub tick_interval: Duration,
    /// Number of characters in generated room codes.
    pub room_code_length: usize,
    /// How many fresh codes to try when a generated one collides.
    pub room_code_attempts: u32,
    /// Member count at which a waiting session is marked started.
    pub start_threshold: usize,
    /// Upper bound on members per session; `None` means unbounded.
    pub max_members: Option<usize>,
    /// Whether new participants may join a session that already started.
    pub allow_late_join: bool,
    /// Buffer size of the change feed broadcast channel.
    pub feed_capacity: usize,
}

impl AppConfig {
    /// Load the application configuration from disk, falling back to built-in defaults.
    pub fn load() -> Self {
        let path = resolve_config_path();
        match fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<RawConfig>(&contents) {
                Ok(raw) => {
                    let app_config: Self = raw.into();
                    info!(
                        path = %path.display(),
                        turn_ms = app_config.turn_duration.as_millis() as u64,
                        start_threshold = app_config.start_threshold,
                        "loaded live session settings from config"
                    );
                    app_config
                }
                Err(err) => {
                    warn!(
                        path = %path.display(),
                        error = %err,
                        "failed to parse config; falling back to defaults"
                    );
                    Self::default()
                }
            },
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!(
                    path = %path.display(),
                    "config file not found; using built-in defaults"
                );
                Self::default()
            }
            Err(err) => {
                warn!(
                    path = %path.display(),
                    error = %err,
                    "failed to read config; falling back to defaults"
                );
                Self::default()
            }
        }
    }

    /// Admission rules handed to the store on every join.
    pub fn admission_policy(&self) -> AdmissionPolicy {
        AdmissionPolicy {
            allow_late_join: self.allow_late_join,
            max_members: self.max_members,
            start_threshold: self.start_threshold,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            turn_duration: DEFAULT_TURN_DURATION,
            tick_interval: DEFAULT_TICK_INTERVAL,
            room_code_length: DEFAULT_ROOM_CODE_LENGTH,
            room_code_attempts: DEFAULT_ROOM_CODE_ATTEMPTS,
            start_threshold: DEFAULT_START_THRESHOLD,
            max_members: None,
            allow_late_join: false,
            feed_capacity: DEFAULT_FEED_CAPACITY,
        }
    }
}

#[serde_as]
#[derive(Debug, Deserialize)]
/// JSON representation of the configuration file located at [`DEFAULT_CONFIG_PATH`].
///
/// Every field is optional; missing entries keep their default.
struct RawConfig {
    #[serde_as(as = "Option<DurationMilliSeconds<u64>>")]
    #[serde(default)]
    turn_duration_ms: Option<Duration>,
    #[serde_as(as = "Option<DurationMilliSeconds<u64>>")]
    #[serde(default)]
    tick_interval_ms: Option<Duration>,
    #[serde(default)]
    room_code_length: Option<usize>,
    #[serde(default)]
    room_code_attempts: Option<u32>,
    #[serde(default)]
    start_threshold: Option<usize>,
    #[serde(default)]
    max_members: Option<usize>,
    #[serde(default)]
    allow_late_join: Option<bool>,
    #[serde(default)]
    feed_capacity: Option<usize>,
}

impl From<RawConfig> for AppConfig {
    fn from(value: RawConfig) -> Self {
        let defaults = Self::default();
        Self {
            turn_duration: value
                .turn_duration_ms
                .filter(|duration| !duration.is_zero())
                .unwrap_or(defaults.turn_duration),
            tick_interval: value
                .tick_interval_ms
                .filter(|duration| !duration.is_zero())
                .unwrap_or(defaults.tick_interval),
            room_code_length: value
                .room_code_length
                .filter(|length| *length >= 4)
                .unwrap_or(defaults.room_code_length),
            room_code_attempts: value
                .room_code_attempts
                .filter(|attempts| *attempts > 0)
                .unwrap_or(defaults.room_code_attempts),
            start_threshold: value
                .start_threshold
                .map(|threshold| threshold.max(1))
                .unwrap_or(defaults.start_threshold),
            max_members: value.max_members.or(defaults.max_members),
            allow_late_join: value.allow_late_join.unwrap_or(defaults.allow_late_join),
            feed_capacity: value
                .feed_capacity
                .filter(|capacity| *capacity > 0)
                .unwrap_or(defaults.feed_capacity),
        }
    }
}

/// Resolve the configuration path taking the environment override into account.
fn resolve_config_path() -> PathBuf {
    env::var_os(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .filter(|path| !path.as_os_str().is_empty())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dao::models::{AdmissionRefusal, SessionStatus};

    #[test]
    fn partial_file_keeps_defaults_for_missing_fields() {
        let raw: RawConfig =
            serde_json::from_str(r#"{"turn_duration_ms": 45000, "max_members": 4}"#).unwrap();
        let config: AppConfig = raw.into();

        assert_eq!(config.turn_duration, Duration::from_secs(45));
        assert_eq!(config.max_members, Some(4));
        assert_eq!(config.start_threshold, DEFAULT_START_THRESHOLD);
        assert_eq!(config.tick_interval, DEFAULT_TICK_INTERVAL);
        assert!(!config.allow_late_join);
    }

    #[test]
    fn degenerate_values_fall_back_to_defaults() {
        let raw: RawConfig = serde_json::from_str(
            r#"{"turn_duration_ms": 0, "room_code_length": 2, "feed_capacity": 0, "start_threshold": 0}"#,
        )
        .unwrap();
        let config: AppConfig = raw.into();

        assert_eq!(config.turn_duration, DEFAULT_TURN_DURATION);
        assert_eq!(config.room_code_length, DEFAULT_ROOM_CODE_LENGTH);
        assert_eq!(config.feed_capacity, DEFAULT_FEED_CAPACITY);
        assert_eq!(config.start_threshold, 1);
    }

    #[test]
    fn capacity_is_unbounded_by_default() {
        let policy = AppConfig::default().admission_policy();
        assert!(policy.check(SessionStatus::Waiting, 10_000).is_ok());
        assert_eq!(
            policy.check(SessionStatus::Started, 1),
            Err(AdmissionRefusal::AlreadyStarted)
        );

        let capped = AppConfig {
            max_members: Some(2),
            allow_late_join: true,
            ..AppConfig::default()
        }
        .admission_policy();
        assert!(capped.check(SessionStatus::Started, 1).is_ok());
        assert_eq!(capped.check(SessionStatus::Waiting, 2), Err(AdmissionRefusal::Full));
        assert_eq!(capped.check(SessionStatus::Ended, 0), Err(AdmissionRefusal::Ended));
        assert!(capped.starts(SessionStatus::Waiting, 2));
        assert!(!capped.starts(SessionStatus::Started, 2));
    }
}
