#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::fmt;

use nd_core::{Context, DType};
use nd_serialize::DecodeMode;
use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvidenceKind {
    Allocation,
    Dispatch,
    Lineage,
    Release,
    Sync,
    Durability,
    Policy,
}

impl EvidenceKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Allocation => "allocation",
            Self::Dispatch => "dispatch",
            Self::Lineage => "lineage",
            Self::Release => "release",
            Self::Sync => "sync",
            Self::Durability => "durability",
            Self::Policy => "policy",
        }
    }
}

impl fmt::Display for EvidenceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvidenceEntry {
    pub ts_unix_ms: u128,
    pub kind: EvidenceKind,
    pub summary: String,
}

/// Bounded, append-only event log. When full, the oldest entry is evicted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvidenceLedger {
    entries: VecDeque<EvidenceEntry>,
    capacity: usize,
    evicted: u64,
}

impl Default for EvidenceLedger {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_LEDGER_CAPACITY)
    }
}

impl EvidenceLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A capacity of zero keeps nothing but still counts evictions.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity,
            evicted: 0,
        }
    }

    pub fn record(&mut self, kind: EvidenceKind, summary: impl Into<String>) {
        let summary = summary.into();
        tracing::debug!("[{kind}] {summary}");

        if self.entries.len() >= self.capacity {
            if self.entries.pop_front().is_some() || self.capacity == 0 {
                self.evicted += 1;
            }
            if self.capacity == 0 {
                return;
            }
        }
        self.entries.push_back(EvidenceEntry {
            ts_unix_ms: now_unix_ms(),
            kind,
            summary,
        });
    }

    pub fn entries(&self) -> impl DoubleEndedIterator<Item = &EvidenceEntry> + ExactSizeIterator {
        self.entries.iter()
    }

    pub fn of_kind(&self, kind: EvidenceKind) -> impl Iterator<Item = &EvidenceEntry> {
        self.entries.iter().filter(move |entry| entry.kind == kind)
    }

    #[must_use]
    pub fn last(&self) -> Option<&EvidenceEntry> {
        self.entries.back()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn evicted(&self) -> u64 {
        self.evicted
    }
}

pub const DEFAULT_LEDGER_CAPACITY: usize = 4096;

pub const ENV_DEFAULT_CONTEXT: &str = "ND_DEFAULT_CONTEXT";
pub const ENV_DEFAULT_DTYPE: &str = "ND_DEFAULT_DTYPE";
pub const ENV_WARN_UNDISPOSED: &str = "ND_WARN_UNDISPOSED";
pub const ENV_LEDGER_CAPACITY: &str = "ND_LEDGER_CAPACITY";
pub const ENV_ARCHIVE_DECODE_MODE: &str = "ND_ARCHIVE_DECODE_MODE";
pub const ENV_ENGINE_CAPACITY_BYTES: &str = "ND_ENGINE_CAPACITY_BYTES";

/// Process-wide defaults. Passed explicitly; every creation call may
/// override the placement fields.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    pub default_context: Context,
    pub default_dtype: DType,
    pub warn_on_undisposed_drop: bool,
    pub ledger_capacity: usize,
    pub archive_decode_mode: DecodeMode,
    pub engine_capacity_bytes: Option<u64>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            default_context: Context::cpu(0),
            default_dtype: DType::F32,
            warn_on_undisposed_drop: false,
            ledger_capacity: DEFAULT_LEDGER_CAPACITY,
            archive_decode_mode: DecodeMode::Strict,
            engine_capacity_bytes: None,
        }
    }
}

impl RuntimeConfig {
    pub fn from_json(input: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(input).map_err(|error| {
            let diagnostic = error.to_string();
            match extract_unknown_field(&diagnostic) {
                Some(field) => ConfigError::UnknownField { field },
                None => ConfigError::InvalidJson { diagnostic },
            }
        })
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_env_overrides()
    }

    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    /// Applies `ND_*` overrides resolved through `lookup`.
    pub fn with_overrides_from<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(ENV_DEFAULT_CONTEXT) {
            self.default_context = parse_value(ENV_DEFAULT_CONTEXT, &raw)?;
        }
        if let Some(raw) = lookup(ENV_DEFAULT_DTYPE) {
            self.default_dtype = parse_value(ENV_DEFAULT_DTYPE, &raw)?;
        }
        if let Some(raw) = lookup(ENV_WARN_UNDISPOSED) {
            self.warn_on_undisposed_drop = parse_flag(ENV_WARN_UNDISPOSED, &raw)?;
        }
        if let Some(raw) = lookup(ENV_LEDGER_CAPACITY) {
            self.ledger_capacity = parse_value(ENV_LEDGER_CAPACITY, &raw)?;
        }
        if let Some(raw) = lookup(ENV_ARCHIVE_DECODE_MODE) {
            self.archive_decode_mode = parse_value(ENV_ARCHIVE_DECODE_MODE, &raw)?;
        }
        if let Some(raw) = lookup(ENV_ENGINE_CAPACITY_BYTES) {
            self.engine_capacity_bytes = Some(parse_value(ENV_ENGINE_CAPACITY_BYTES, &raw)?);
        }
        Ok(self)
    }
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: fmt::Display,
{
    raw.trim()
        .parse::<T>()
        .map_err(|error| ConfigError::InvalidValue {
            key: key.to_string(),
            value: raw.to_string(),
            reason: error.to_string(),
        })
}

fn parse_flag(key: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: raw.to_string(),
            reason: "expected a boolean flag".to_string(),
        }),
    }
}

fn extract_unknown_field(message: &str) -> Option<String> {
    let marker = "unknown field `";
    let start = message.find(marker)? + marker.len();
    let tail = &message[start..];
    let end = tail.find('`')?;
    Some(tail[..end].to_string())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    InvalidJson {
        diagnostic: String,
    },
    UnknownField {
        field: String,
    },
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidJson { diagnostic } => write!(f, "invalid config json: {diagnostic}"),
            Self::UnknownField { field } => write!(f, "unknown config field '{field}'"),
            Self::InvalidValue { key, value, reason } => {
                write!(f, "invalid value '{value}' for {key}: {reason}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeContext {
    config: RuntimeConfig,
    ledger: EvidenceLedger,
}

impl RuntimeContext {
    #[must_use]
    pub fn new(config: RuntimeConfig) -> Self {
        let mut ledger = EvidenceLedger::with_capacity(config.ledger_capacity);
        ledger.record(
            EvidenceKind::Policy,
            format!(
                "runtime initialized default_context={} default_dtype={} decode_mode={:?}",
                config.default_context, config.default_dtype, config.archive_decode_mode
            ),
        );
        Self { config, ledger }
    }

    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn set_default_context(&mut self, context: Context) {
        self.config.default_context = context;
        self.ledger.record(
            EvidenceKind::Policy,
            format!("default context switched to {context}"),
        );
    }

    #[must_use]
    pub fn ledger(&self) -> &EvidenceLedger {
        &self.ledger
    }

    pub fn ledger_mut(&mut self) -> &mut EvidenceLedger {
        &mut self.ledger
    }

    pub fn record(&mut self, kind: EvidenceKind, summary: impl Into<String>) {
        self.ledger.record(kind, summary);
    }

    pub fn record_archive_decode_failure<E>(&mut self, location: &str, error: &E)
    where
        E: fmt::Display + ?Sized,
    {
        tracing::warn!("archive decode failure at {location}: {error}");
        self.ledger.record(
            EvidenceKind::Durability,
            format!(
                "archive decode failure location={location} mode={:?}: {error}",
                self.config.archive_decode_mode
            ),
        );
    }
}

impl Default for RuntimeContext {
    fn default() -> Self {
        Self::new(RuntimeConfig::default())
    }
}

fn now_unix_ms() -> u128 {
    let now = std::time::SystemTime::now();
    now.duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |duration| duration.as_millis())
}
