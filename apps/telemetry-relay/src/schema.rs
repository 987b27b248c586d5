//! Fixed startup schema: the seed document that defines which groups and
//! sub-keys exist, and the channel bindings that say which of those groups
//! accept bus input and under which value policy.

use std::path::Path;

use crate::snapshot::Snapshot;

pub const DEFAULT_SEED: &str = include_str!("../seed/dashboard.json");

pub const DEFAULT_FIELD: &str = "current";

#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("failed to read seed file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("seed document is not a group/subKey/field tree of integers or strings: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("seed key {0:?} is not a valid identifier")]
    InvalidKey(String),
}

pub fn load_seed(path: Option<&Path>) -> Result<Snapshot, SchemaError> {
    match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path).map_err(|source| SchemaError::Io {
                path: path.display().to_string(),
                source,
            })?;
            Snapshot::from_seed(&raw)
        }
        None => Snapshot::from_seed(DEFAULT_SEED),
    }
}

/// Validation policy for values arriving on a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelClass {
    /// Percent gauges; clamped into `[1, 99]`.
    BoundedPercentage,
    UnboundedCounter,
}

impl ChannelClass {
    pub const PERCENT_FLOOR: i64 = 1;
    pub const PERCENT_CEILING: i64 = 99;

    pub fn apply(self, value: i64) -> i64 {
        match self {
            ChannelClass::BoundedPercentage => {
                value.clamp(Self::PERCENT_FLOOR, Self::PERCENT_CEILING)
            }
            ChannelClass::UnboundedCounter => value,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ChannelClass::BoundedPercentage => "bounded_percentage",
            ChannelClass::UnboundedCounter => "unbounded_counter",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelBinding {
    pub group: String,
    pub class: ChannelClass,
    /// Set for scalar groups, whose topics may omit the field
    /// (`quarterD.col3` addresses `quarterD.col3.current`).
    pub default_field: Option<String>,
}

impl ChannelBinding {
    pub fn counter(group: &str) -> Self {
        Self {
            group: group.to_string(),
            class: ChannelClass::UnboundedCounter,
            default_field: None,
        }
    }

    pub fn percentage(group: &str) -> Self {
        Self {
            group: group.to_string(),
            class: ChannelClass::BoundedPercentage,
            default_field: Some(DEFAULT_FIELD.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMap {
    bindings: Vec<ChannelBinding>,
}

impl ChannelMap {
    pub fn new(bindings: Vec<ChannelBinding>) -> Self {
        Self { bindings }
    }

    /// Bindings for the operations dashboard. `quarterB` is display-only.
    pub fn dashboard() -> Self {
        Self::new(vec![
            ChannelBinding::counter("quarterA"),
            ChannelBinding::counter("quarterC"),
            ChannelBinding::percentage("quarterD"),
        ])
    }

    pub fn binding(&self, group: &str) -> Option<&ChannelBinding> {
        self.bindings.iter().find(|binding| binding.group == group)
    }
}

/// Topics the relay subscribes to. `quarterC` is documented but only wired
/// when explicitly requested.
pub fn subscription_topics(wire_quarter_c: bool) -> Vec<String> {
    let mut topics = Vec::new();
    for col in 1..=3 {
        for num in 1..=8 {
            topics.push(format!("quarterA.col{col}.num{num}"));
        }
    }
    for col in 1..=6 {
        topics.push(format!("quarterD.col{col}"));
    }
    if wire_quarter_c {
        for cbw in 1..=3 {
            topics.push(format!("quarterC.cbw{cbw}.waitTime"));
        }
        for key in ["hour4", "hour3", "hour2", "hour1", "current"] {
            topics.push(format!("quarterC.wastedMinutes.{key}"));
        }
    }
    topics
}
