use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RejectLogKind {
    MalformedPayload,
    UnknownTopic,
    FieldType,
}

impl RejectLogKind {
    fn interval(self) -> Duration {
        match self {
            RejectLogKind::MalformedPayload => Duration::from_secs(10),
            RejectLogKind::UnknownTopic => Duration::from_secs(60),
            RejectLogKind::FieldType => Duration::from_secs(60),
        }
    }

    pub fn from_label(label: &str) -> Self {
        match label {
            "malformed_payload" => RejectLogKind::MalformedPayload,
            "field_type" => RejectLogKind::FieldType,
            _ => RejectLogKind::UnknownTopic,
        }
    }
}

#[derive(Eq, PartialEq, Hash)]
struct LogKey {
    kind: RejectLogKind,
    topic: String,
}

static REJECT_LOG_MEMORY: Lazy<Mutex<HashMap<LogKey, Instant>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// A publisher stuck sending garbage would otherwise flood the log.
pub fn should_log_reject(kind: RejectLogKind, topic: &str) -> bool {
    should_log_at(&REJECT_LOG_MEMORY, kind, topic, Instant::now())
}

fn should_log_at(
    memory: &Mutex<HashMap<LogKey, Instant>>,
    kind: RejectLogKind,
    topic: &str,
    now: Instant,
) -> bool {
    let mut guard = memory.lock();
    let key = LogKey {
        kind,
        topic: topic.to_string(),
    };
    if let Some(last) = guard.get(&key) {
        if now.duration_since(*last) < kind.interval() {
            return false;
        }
    }
    guard.insert(key, now);
    true
}
