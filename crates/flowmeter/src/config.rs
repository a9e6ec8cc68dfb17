//! Streamer Configuration
//!
//! `RawConfig` is what users write (TOML, JSON, or the fluent builder);
//! `StreamerConfig` is the validated form the engine runs on. Every value is
//! checked eagerly, before any packet is read.

use crate::error::ConfigError;
use crate::filter::PacketFilter;
use crate::packet::AccountingMode;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Default idle timeout (seconds)
pub const DEFAULT_IDLE_TIMEOUT: u64 = 120;
/// Default active timeout (seconds)
pub const DEFAULT_ACTIVE_TIMEOUT: u64 = 1800;
/// Default capture length (bytes)
pub const DEFAULT_SNAPSHOT_LENGTH: usize = 1536;
/// Largest timeout in seconds whose millisecond count fits a `u64`
pub const MAX_TIMEOUT_SECS: i64 = (u64::MAX / 1000) as i64;

/// Default number of classified packets per flow
pub const DEFAULT_N_DISSECTIONS: u8 = 20;

/// Flow timeout. `After(0)` expires on every evaluation; it does not disable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    Disabled,
    After(Duration),
}

impl Timeout {
    /// Timeout in milliseconds, `None` when disabled
    #[inline]
    pub fn as_millis(self) -> Option<u64> {
        match self {
            Self::Disabled => None,
            Self::After(d) => Some(u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
        }
    }

    /// Whether `elapsed_ms` has reached the timeout
    #[inline]
    pub fn reached(self, elapsed_ms: u64) -> bool {
        self.as_millis().is_some_and(|limit| elapsed_ms >= limit)
    }
}

/// Timeout as written in a configuration document: seconds or `"disabled"`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum RawTimeout {
    Seconds(i64),
    Keyword(String),
}

impl From<i64> for RawTimeout {
    fn from(seconds: i64) -> Self {
        Self::Seconds(seconds)
    }
}

impl From<i32> for RawTimeout {
    fn from(seconds: i32) -> Self {
        Self::Seconds(i64::from(seconds))
    }
}

impl From<&str> for RawTimeout {
    fn from(keyword: &str) -> Self {
        Self::Keyword(keyword.to_string())
    }
}

/// Unvalidated configuration. Doubles as the programmatic builder.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawConfig {
    pub source: Option<PathBuf>,
    pub decode_tunnels: Option<bool>,
    pub bpf_filter: Option<String>,
    pub promiscuous_mode: Option<bool>,
    pub snapshot_length: Option<i64>,
    pub idle_timeout: Option<RawTimeout>,
    pub active_timeout: Option<RawTimeout>,
    pub accounting_mode: Option<i64>,
    pub n_dissections: Option<i64>,
    pub statistical_analysis: Option<bool>,
    pub splt_analysis: Option<i64>,
    pub n_meters: Option<i64>,
    pub performance_report: Option<i64>,
}

macro_rules! setter {
    ($name:ident: $ty:ty) => {
        pub fn $name(mut self, value: impl Into<$ty>) -> Self {
            self.$name = Some(value.into());
            self
        }
    };
}

impl RawConfig {
    setter!(source: PathBuf);
    setter!(decode_tunnels: bool);
    setter!(bpf_filter: String);
    setter!(promiscuous_mode: bool);
    setter!(snapshot_length: i64);
    setter!(idle_timeout: RawTimeout);
    setter!(active_timeout: RawTimeout);
    setter!(accounting_mode: i64);
    setter!(n_dissections: i64);
    setter!(statistical_analysis: bool);
    setter!(splt_analysis: i64);
    setter!(n_meters: i64);
    setter!(performance_report: i64);

    /// Parse a TOML document
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|e| ConfigError::Malformed(e.to_string()))
    }

    /// Convert a JSON document
    pub fn from_json_value(value: serde_json::Value) -> Result<Self, ConfigError> {
        serde_json::from_value(value).map_err(|e| ConfigError::Malformed(e.to_string()))
    }

    /// Overlay every option set in `other`
    pub fn merge(mut self, other: RawConfig) -> Self {
        macro_rules! overlay {
            ($($field:ident),*) => {
                $(if other.$field.is_some() {
                    self.$field = other.$field;
                })*
            };
        }
        overlay!(
            source,
            decode_tunnels,
            bpf_filter,
            promiscuous_mode,
            snapshot_length,
            idle_timeout,
            active_timeout,
            accounting_mode,
            n_dissections,
            statistical_analysis,
            splt_analysis,
            n_meters,
            performance_report
        );
        self
    }

    /// Validate every option
    pub fn build(self) -> Result<StreamerConfig, ConfigError> {
        StreamerConfig::try_from(self)
    }
}

/// Packet acquisition settings
#[derive(Debug, Clone, PartialEq)]
pub struct ObserverConfig {
    /// Capture file; `None` for a programmatic source
    pub source: Option<PathBuf>,
    pub decode_tunnels: bool,
    pub bpf_filter: Option<PacketFilter>,
    pub promiscuous_mode: bool,
    pub snapshot_length: usize,
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            source: None,
            decode_tunnels: true,
            bpf_filter: None,
            promiscuous_mode: true,
            snapshot_length: DEFAULT_SNAPSHOT_LENGTH,
        }
    }
}

/// Per-meter flow policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeterConfig {
    pub idle_timeout: Timeout,
    pub active_timeout: Timeout,
    pub accounting_mode: AccountingMode,
    pub n_dissections: u8,
    pub statistical_analysis: bool,
    pub splt_analysis: u8,
}

impl Default for MeterConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Timeout::After(Duration::from_secs(DEFAULT_IDLE_TIMEOUT)),
            active_timeout: Timeout::After(Duration::from_secs(DEFAULT_ACTIVE_TIMEOUT)),
            accounting_mode: AccountingMode::Raw,
            n_dissections: DEFAULT_N_DISSECTIONS,
            statistical_analysis: false,
            splt_analysis: 0,
        }
    }
}

/// Validated run configuration
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamerConfig {
    pub observer: ObserverConfig,
    pub meter: MeterConfig,
    /// Meter threads; 0 meters inline on the consumer's thread
    pub n_meters: usize,
    /// Report interval; `None` disables reporting
    pub performance_report: Option<Duration>,
}

impl StreamerConfig {
    /// Start a programmatic configuration
    pub fn builder() -> RawConfig {
        RawConfig::default()
    }
}

fn ranged(option: &'static str, value: i64, min: i64, max: i64) -> Result<i64, ConfigError> {
    if (min..=max).contains(&value) {
        Ok(value)
    } else {
        Err(ConfigError::out_of_range(
            option,
            format!("{value} is outside {min}..={max}"),
        ))
    }
}

fn timeout(option: &'static str, raw: Option<RawTimeout>, default: u64) -> Result<Timeout, ConfigError> {
    match raw {
        None => Ok(Timeout::After(Duration::from_secs(default))),
        Some(RawTimeout::Seconds(s)) => {
            let s = ranged(option, s, 0, MAX_TIMEOUT_SECS)?;
            Ok(Timeout::After(Duration::from_secs(s as u64)))
        }
        Some(RawTimeout::Keyword(k)) if k == "disabled" => Ok(Timeout::Disabled),
        Some(RawTimeout::Keyword(k)) => Err(ConfigError::out_of_range(
            option,
            format!("expected seconds or \"disabled\", got {k:?}"),
        )),
    }
}

impl TryFrom<RawConfig> for StreamerConfig {
    type Error = ConfigError;

    fn try_from(raw: RawConfig) -> Result<Self, Self::Error> {
        if let Some(path) = &raw.source {
            if !path.exists() {
                return Err(ConfigError::Source(format!("{} does not exist", path.display())));
            }
        }

        let bpf_filter = raw
            .bpf_filter
            .as_deref()
            .map(PacketFilter::compile)
            .transpose()?;

        let snapshot_length = match raw.snapshot_length {
            Some(v) => ranged("snapshot_length", v, 1, i64::from(u32::MAX))? as usize,
            None => DEFAULT_SNAPSHOT_LENGTH,
        };

        let accounting_mode = AccountingMode::try_from(raw.accounting_mode.unwrap_or(0))
            .map_err(|v| ConfigError::out_of_range("accounting_mode", format!("{v} is outside 0..=3")))?;

        let n_dissections = match raw.n_dissections {
            Some(v) => ranged("n_dissections", v, 0, 255)? as u8,
            None => DEFAULT_N_DISSECTIONS,
        };

        let splt_analysis = match raw.splt_analysis {
            Some(v) => ranged("splt_analysis", v, 0, 255)? as u8,
            None => 0,
        };

        let n_meters = match raw.n_meters {
            Some(v) => ranged("n_meters", v, 0, i64::from(u16::MAX))? as usize,
            None => 0,
        };

        let performance_report = match raw.performance_report {
            Some(v) => match ranged("performance_report", v, 0, i64::MAX)? {
                0 => None,
                secs => Some(Duration::from_secs(secs as u64)),
            },
            None => None,
        };

        Ok(Self {
            observer: ObserverConfig {
                source: raw.source,
                decode_tunnels: raw.decode_tunnels.unwrap_or(true),
                bpf_filter,
                promiscuous_mode: raw.promiscuous_mode.unwrap_or(true),
                snapshot_length,
            },
            meter: MeterConfig {
                idle_timeout: timeout("idle_timeout", raw.idle_timeout, DEFAULT_IDLE_TIMEOUT)?,
                active_timeout: timeout("active_timeout", raw.active_timeout, DEFAULT_ACTIVE_TIMEOUT)?,
                accounting_mode,
                n_dissections,
                statistical_analysis: raw.statistical_analysis.unwrap_or(false),
                splt_analysis,
            },
            n_meters,
            performance_report,
        })
    }
}
