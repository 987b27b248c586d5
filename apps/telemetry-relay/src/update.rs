use std::{fmt, str::FromStr};

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

/// Keys at every level of the snapshot tree: non-empty ASCII alphanumerics,
/// `_` or `-`. Dots are reserved as the path separator.
pub fn is_identifier(candidate: &str) -> bool {
    !candidate.is_empty()
        && candidate
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

/// Dotted address of one leaf, always fully qualified (`group.subKey.field`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelPath {
    group: String,
    sub_key: String,
    field: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathError {
    #[error("path {0:?} must have exactly three dot-separated components")]
    Arity(String),
    #[error("path component {0:?} is not a valid identifier")]
    InvalidComponent(String),
}

impl ChannelPath {
    pub fn new(
        group: impl Into<String>,
        sub_key: impl Into<String>,
        field: impl Into<String>,
    ) -> Result<Self, PathError> {
        let path = Self {
            group: group.into(),
            sub_key: sub_key.into(),
            field: field.into(),
        };
        for component in [&path.group, &path.sub_key, &path.field] {
            if !is_identifier(component) {
                return Err(PathError::InvalidComponent(component.clone()));
            }
        }
        Ok(path)
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn sub_key(&self) -> &str {
        &self.sub_key
    }

    pub fn field(&self) -> &str {
        &self.field
    }
}

impl fmt::Display for ChannelPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.group, self.sub_key, self.field)
    }
}

impl FromStr for ChannelPath {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('.');
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(group), Some(sub_key), Some(field), None) => {
                ChannelPath::new(group, sub_key, field)
            }
            _ => Err(PathError::Arity(s.to_string())),
        }
    }
}

impl Serialize for ChannelPath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ChannelPath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(de::Error::custom)
    }
}

/// One leaf change. Serializes to the `update` event body:
/// `{"path":"quarterA.col2.num5","value":77}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Update {
    pub path: ChannelPath,
    pub value: i64,
}

impl Update {
    pub fn new(path: ChannelPath, value: i64) -> Self {
        Self { path, value }
    }
}
