/*
 *  Copyright 2025-2026 Colliery Software
 *
 *  Licensed under the Apache License, Version 2.0 (the "License");
 *  you may not use this file except in compliance with the License.
 *  You may obtain a copy of the License at
 *
 *      http://www.apache.org/licenses/LICENSE-2.0
 *
 *  Unless required by applicable law or agreed to in writing, software
 *  distributed under the License is distributed on an "AS IS" BASIS,
 *  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *  See the License for the specific language governing permissions and
 *  limitations under the License.
 */

//! Engine configuration.
//!
//! Configuration is a plain serde structure loaded from TOML. Every field has
//! a default, so an empty file is a valid configuration:
//!
//! ```toml
//! [queue]
//! task_timeout = "10m"
//! phases = ["prepare", "execute", "finalize"]
//!
//! [rate_limit]
//! daily_token_limit = 1000000
//! minute_request_limit = 60
//!
//! [recovery]
//! stale_threshold = "30m"
//! sweep_interval = "15m"
//!
//! [owners]
//! default_max_queue_size = 10
//!
//! [owners.overrides.project-7]
//! max_queue_size = 2
//! default_priority = "high"
//! ```
//!
//! Durations are written as human strings such as `"90s"`, `"30m"` or
//! `"1d12h"`; see [`parse_duration`].

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;
use crate::models::{BatchOptions, Priority};
use crate::retry::RetryPolicy;

/// Parse a duration string like "90d", "24h", "1h30m" or "250ms".
///
/// Supported units:
/// - `d` - days
/// - `h` - hours
/// - `m` - minutes
/// - `s` - seconds
/// - `ms` - milliseconds
///
/// Zero is accepted ("0s") so delays can be disabled.
pub fn parse_duration(s: &str) -> Result<Duration, ConfigError> {
    let value = s.trim().to_lowercase();
    let invalid = |message: String| ConfigError::InvalidDuration {
        value: s.to_string(),
        message,
    };

    if value.is_empty() {
        return Err(invalid("duration string cannot be empty".to_string()));
    }

    let mut total = Duration::ZERO;
    let mut current_num = String::new();
    let mut chars = value.chars().peekable();

    while let Some(c) = chars.next() {
        if c.is_ascii_digit() {
            current_num.push(c);
            continue;
        }

        if current_num.is_empty() {
            return Err(invalid(format!("expected number before '{}'", c)));
        }
        let num: u64 = current_num
            .parse()
            .map_err(|_| invalid(format!("invalid number: {}", current_num)))?;
        current_num.clear();

        let part = match c {
            'd' => num.checked_mul(86_400).map(Duration::from_secs),
            'h' => num.checked_mul(3_600).map(Duration::from_secs),
            'm' if chars.peek() == Some(&'s') => {
                chars.next();
                Some(Duration::from_millis(num))
            }
            'm' => num.checked_mul(60).map(Duration::from_secs),
            's' => Some(Duration::from_secs(num)),
            _ => {
                return Err(invalid(format!(
                    "unknown unit '{}', use d, h, m, s or ms",
                    c
                )))
            }
        };
        total = part
            .and_then(|part| total.checked_add(part))
            .ok_or_else(|| invalid("duration is too large".to_string()))?;
    }

    if !current_num.is_empty() {
        return Err(invalid(
            "missing a unit, use d (days), h (hours), m (minutes), s (seconds) or ms".to_string(),
        ));
    }

    Ok(total)
}

/// Render a duration in the largest exact unit [`parse_duration`] accepts.
pub fn format_duration(duration: Duration) -> String {
    let millis = duration.as_millis();
    if millis == 0 {
        return "0s".to_string();
    }
    if millis % 1000 != 0 {
        return format!("{}ms", millis);
    }
    let secs = duration.as_secs();
    for (unit, size) in [("d", 86_400), ("h", 3_600), ("m", 60)] {
        if secs % size == 0 {
            return format!("{}{}", secs / size, unit);
        }
    }
    format!("{}s", secs)
}

/// Serde adapter storing a [`Duration`] as a human duration string.
///
/// Bare integers are accepted on input and read as seconds.
pub mod duration_str {
    use serde::de::{self, Deserializer, Visitor};
    use serde::Serializer;
    use std::fmt;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_duration(*duration))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        deserializer.deserialize_any(DurationVisitor)
    }

    struct DurationVisitor;

    impl<'de> Visitor<'de> for DurationVisitor {
        type Value = Duration;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a duration string such as \"30m\" or a number of seconds")
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<Duration, E> {
            super::parse_duration(v).map_err(E::custom)
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<Duration, E> {
            Ok(Duration::from_secs(v))
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<Duration, E> {
            u64::try_from(v)
                .map(Duration::from_secs)
                .map_err(|_| E::custom("duration cannot be negative"))
        }
    }

    /// The same adapter for `Option<Duration>` fields.
    pub mod option {
        use serde::{Deserialize, Deserializer, Serializer};
        use std::time::Duration;

        pub fn serialize<S: Serializer>(
            duration: &Option<Duration>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match duration {
                Some(d) => super::serialize(d, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Duration>, D::Error> {
            #[derive(Deserialize)]
            struct Wrapper(#[serde(with = "super")] Duration);

            let value: Option<Wrapper> = Option::deserialize(deserializer)?;
            Ok(value.map(|Wrapper(d)| d))
        }
    }
}

/// Task queue settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Hard timeout handed to the agent executor for every attempt.
    #[serde(with = "duration_str")]
    pub task_timeout: Duration,
    /// Delay before the loop runs again while pending tasks remain.
    #[serde(with = "duration_str")]
    pub reschedule_delay: Duration,
    /// Ordered phases recorded on every execution.
    pub phases: Vec<String>,
    /// Retry policy for failed agent commands.
    pub retry: RetryPolicy,
    /// Resume a rate-limited queue once the exhausted window rolls over.
    pub auto_resume: bool,
    /// Working directory used when a payload does not name one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<PathBuf>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            task_timeout: Duration::from_secs(600),
            reschedule_delay: Duration::from_secs(1),
            phases: vec![
                "prepare".to_string(),
                "execute".to_string(),
                "finalize".to_string(),
            ],
            retry: RetryPolicy::none(),
            auto_resume: true,
            working_directory: None,
        }
    }
}

/// Token and request budgets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub daily_token_limit: u64,
    pub minute_request_limit: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            daily_token_limit: 1_000_000,
            minute_request_limit: 60,
        }
    }
}

/// Recovery sweep settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Run the startup sweep and the periodic orphan cleanup.
    pub enabled: bool,
    /// Executions older than this are failed as interrupted.
    #[serde(with = "duration_str")]
    pub stale_threshold: Duration,
    /// Interval of the periodic orphan cleanup.
    #[serde(with = "duration_str")]
    pub sweep_interval: Duration,
    /// Minimum age of an initializing entity before the periodic sweep
    /// treats it as orphaned.
    pub orphan_max_age_hours: u32,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            stale_threshold: Duration::from_secs(30 * 60),
            sweep_interval: Duration::from_secs(15 * 60),
            orphan_max_age_hours: 1,
        }
    }
}

/// Per-owner overrides of the owner defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OwnerOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_queue_size: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_priority: Option<Priority>,
}

/// Owner admission settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OwnersConfig {
    pub default_max_queue_size: usize,
    pub default_priority: Priority,
    pub overrides: HashMap<String, OwnerOverride>,
}

impl Default for OwnersConfig {
    fn default() -> Self {
        Self {
            default_max_queue_size: 10,
            default_priority: Priority::Normal,
            overrides: HashMap::new(),
        }
    }
}

/// Complete engine configuration.
///
/// # Construction
///
/// Load it from TOML with [`EngineConfig::from_file`], or build it in code:
///
/// ```rust
/// use std::time::Duration;
/// use taskmill::EngineConfig;
///
/// let config = EngineConfig::builder()
///     .task_timeout(Duration::from_secs(120))
///     .daily_token_limit(50_000)
///     .default_max_queue_size(2)
///     .build();
/// assert_eq!(config.owners.default_max_queue_size, 2);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub queue: QueueConfig,
    pub rate_limit: RateLimitConfig,
    pub recovery: RecoveryConfig,
    pub batch: BatchOptions,
    pub owners: OwnersConfig,
}

impl EngineConfig {
    /// Creates a new configuration builder with default values.
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }

    /// Parses and validates a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Serializes the configuration back to TOML.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Validation(e.to_string()))
    }

    /// Rejects configurations the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rate_limit.daily_token_limit == 0 {
            return Err(ConfigError::Validation(
                "rate_limit.daily_token_limit must be greater than zero".to_string(),
            ));
        }
        if self.rate_limit.minute_request_limit == 0 {
            return Err(ConfigError::Validation(
                "rate_limit.minute_request_limit must be greater than zero".to_string(),
            ));
        }
        if self.batch.max_concurrency == 0 {
            return Err(ConfigError::Validation(
                "batch.max_concurrency must be greater than zero".to_string(),
            ));
        }
        if self.queue.task_timeout.is_zero() {
            return Err(ConfigError::Validation(
                "queue.task_timeout must be greater than zero".to_string(),
            ));
        }
        if self.queue.retry.max_attempts == 0 {
            return Err(ConfigError::Validation(
                "queue.retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.recovery.enabled && self.recovery.sweep_interval.is_zero() {
            return Err(ConfigError::Validation(
                "recovery.sweep_interval must be greater than zero".to_string(),
            ));
        }
        for (owner, settings) in &self.owners.overrides {
            if settings.max_queue_size == Some(0) {
                return Err(ConfigError::Validation(format!(
                    "owners.overrides.{}.max_queue_size must be greater than zero",
                    owner
                )));
            }
        }
        if self.owners.default_max_queue_size == 0 {
            return Err(ConfigError::Validation(
                "owners.default_max_queue_size must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for [`EngineConfig`].
#[derive(Debug, Clone, Default)]
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    /// Sets the executor timeout for a single attempt.
    pub fn task_timeout(mut self, value: Duration) -> Self {
        self.config.queue.task_timeout = value;
        self
    }

    /// Sets the delay before the loop runs again while work remains.
    pub fn reschedule_delay(mut self, value: Duration) -> Self {
        self.config.queue.reschedule_delay = value;
        self
    }

    /// Sets the phases recorded on every execution.
    pub fn phases<I, S>(mut self, phases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.queue.phases = phases.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the retry policy for failed agent commands.
    pub fn task_retry(mut self, value: RetryPolicy) -> Self {
        self.config.queue.retry = value;
        self
    }

    /// Enables or disables auto-resume after a rate-limit pause.
    pub fn auto_resume(mut self, value: bool) -> Self {
        self.config.queue.auto_resume = value;
        self
    }

    pub fn working_directory(mut self, value: impl Into<PathBuf>) -> Self {
        self.config.queue.working_directory = Some(value.into());
        self
    }

    pub fn daily_token_limit(mut self, value: u64) -> Self {
        self.config.rate_limit.daily_token_limit = value;
        self
    }

    pub fn minute_request_limit(mut self, value: u32) -> Self {
        self.config.rate_limit.minute_request_limit = value;
        self
    }

    /// Enables or disables recovery sweeps.
    pub fn enable_recovery(mut self, value: bool) -> Self {
        self.config.recovery.enabled = value;
        self
    }

    pub fn stale_threshold(mut self, value: Duration) -> Self {
        self.config.recovery.stale_threshold = value;
        self
    }

    pub fn sweep_interval(mut self, value: Duration) -> Self {
        self.config.recovery.sweep_interval = value;
        self
    }

    pub fn orphan_max_age_hours(mut self, value: u32) -> Self {
        self.config.recovery.orphan_max_age_hours = value;
        self
    }

    /// Sets the default options for batch operations.
    pub fn batch_options(mut self, value: BatchOptions) -> Self {
        self.config.batch = value;
        self
    }

    pub fn default_max_queue_size(mut self, value: usize) -> Self {
        self.config.owners.default_max_queue_size = value;
        self
    }

    pub fn default_priority(mut self, value: Priority) -> Self {
        self.config.owners.default_priority = value;
        self
    }

    /// Overrides the admission settings of one owner.
    pub fn owner_override(mut self, owner_id: impl Into<String>, value: OwnerOverride) -> Self {
        self.config.owners.overrides.insert(owner_id.into(), value);
        self
    }

    /// Builds the configuration.
    pub fn build(self) -> EngineConfig {
        self.config
    }
}
