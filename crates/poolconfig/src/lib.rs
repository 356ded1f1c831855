use std::fmt;
use std::time::Duration;

use serde::de::{self, Deserializer};
use serde::Serializer;
use serde::{Deserialize, Serialize};

/// Upper bound on pool slots; hosts cap live contexts well below this.
pub const MAX_POOL_SIZE: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// How the static snapshot queue is drained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StaticRenderMode {
    /// One job at a time, in visual order.
    Sequential,
    /// Bounded batches no larger than `batch_size` or the pool size.
    Batched,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CardPoolConfig {
    pub version: u32,
    #[serde(default)]
    pub pool: PoolSection,
    #[serde(default)]
    pub lifecycle: LifecycleSection,
    #[serde(default)]
    pub static_render: StaticRenderSection,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PoolSection {
    #[serde(default = "default_pool_size")]
    pub size: usize,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(
        default,
        deserialize_with = "deserialize_duration_opt",
        serialize_with = "serialize_duration_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub borrow_timeout: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct LifecycleSection {
    #[serde(
        default = "default_deactivate_debounce",
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub deactivate_debounce: Duration,
    #[serde(default = "default_intersection_threshold")]
    pub intersection_threshold: f32,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct StaticRenderSection {
    #[serde(default = "default_static_mode")]
    pub mode: StaticRenderMode,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for CardPoolConfig {
    fn default() -> Self {
        Self {
            version: 1,
            pool: PoolSection::default(),
            lifecycle: LifecycleSection::default(),
            static_render: StaticRenderSection::default(),
        }
    }
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            size: default_pool_size(),
            width: default_width(),
            height: default_height(),
            borrow_timeout: None,
        }
    }
}

impl Default for LifecycleSection {
    fn default() -> Self {
        Self {
            deactivate_debounce: default_deactivate_debounce(),
            intersection_threshold: default_intersection_threshold(),
        }
    }
}

impl Default for StaticRenderSection {
    fn default() -> Self {
        Self {
            mode: default_static_mode(),
            batch_size: default_batch_size(),
        }
    }
}

fn default_pool_size() -> usize {
    8
}

fn default_width() -> u32 {
    320
}

fn default_height() -> u32 {
    448
}

fn default_deactivate_debounce() -> Duration {
    Duration::from_millis(150)
}

fn default_intersection_threshold() -> f32 {
    0.1
}

fn default_static_mode() -> StaticRenderMode {
    StaticRenderMode::Sequential
}

fn default_batch_size() -> usize {
    4
}

/// Writes durations back in the humantime form the deserializers accept.
fn serialize_duration<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&humantime::format_duration(*value).to_string())
}

fn serialize_duration_opt<S>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match value {
        Some(duration) => serialize_duration(duration, serializer),
        None => serializer.serialize_none(),
    }
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    deserialize_duration_opt(deserializer)?
        .ok_or_else(|| de::Error::custom("duration must not be empty"))
}

fn deserialize_duration_opt<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    struct Visitor;
    impl<'de> de::Visitor<'de> for Visitor {
        type Value = Option<Duration>;

        fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
            formatter.write_str("a duration as number of seconds or human-readable string")
        }

        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            humantime::parse_duration(v.trim())
                .map(Some)
                .map_err(|err| E::custom(format!("invalid duration '{v}': {err}")))
        }

        fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(Some(Duration::from_secs(v)))
        }

        fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            if v < 0 {
                return Err(E::custom("duration must be non-negative"));
            }
            Ok(Some(Duration::from_secs(v as u64)))
        }

        fn visit_f64<E>(self, v: f64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            if v.is_nan() || v.is_sign_negative() {
                return Err(E::custom("duration must be non-negative"));
            }
            Ok(Some(Duration::from_secs_f64(v)))
        }

        fn visit_none<E>(self) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(None)
        }

        fn visit_unit<E>(self) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(None)
        }
    }

    deserializer.deserialize_any(Visitor)
}

/// Parses a duration the same way the config file does (`"250ms"`, `"2s"`).
pub fn parse_duration(raw: &str) -> Result<Duration, ConfigError> {
    humantime::parse_duration(raw.trim())
        .map_err(|err| ConfigError::Invalid(format!("invalid duration '{raw}': {err}")))
}

impl CardPoolConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let raw: CardPoolConfig = toml::from_str(input)?;
        raw.validate()?;
        Ok(raw)
    }

    /// Number of slots a static-render batch may use at once.
    ///
    /// Sequential mode always reports one; batched mode never exceeds the
    /// configured pool size.
    pub fn static_batch_limit(&self) -> usize {
        match self.static_render.mode {
            StaticRenderMode::Sequential => 1,
            StaticRenderMode::Batched => self.static_render.batch_size.clamp(1, self.pool.size),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.version != 1 {
            return Err(ConfigError::Invalid(format!(
                "unsupported config version {}; expected 1",
                self.version
            )));
        }

        if self.pool.size == 0 {
            return Err(ConfigError::Invalid(
                "pool.size must be greater than zero".into(),
            ));
        }

        if self.pool.size > MAX_POOL_SIZE {
            return Err(ConfigError::Invalid(format!(
                "pool.size {} exceeds the maximum of {MAX_POOL_SIZE}",
                self.pool.size
            )));
        }

        if self.pool.width == 0 || self.pool.height == 0 {
            return Err(ConfigError::Invalid(format!(
                "pool surface must be non-empty, got {}x{}",
                self.pool.width, self.pool.height
            )));
        }

        if let Some(timeout) = self.pool.borrow_timeout {
            if timeout.is_zero() {
                return Err(ConfigError::Invalid(
                    "pool.borrow_timeout must be greater than zero when set".into(),
                ));
            }
        }

        let threshold = self.lifecycle.intersection_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(ConfigError::Invalid(format!(
                "lifecycle.intersection_threshold must be within 0..=1, got {threshold}"
            )));
        }

        if self.static_render.batch_size == 0 {
            return Err(ConfigError::Invalid(
                "static_render.batch_size must be at least 1".into(),
            ));
        }

        Ok(())
    }
}
