use std::collections::BTreeSet;

use crate::{
    schema::{ChannelClass, ChannelMap},
    snapshot::Snapshot,
    update::{ChannelPath, Update},
};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    #[error("payload on {topic} is not a JSON integer: {reason}")]
    MalformedPayload { topic: String, reason: String },
    #[error("topic {0} is not part of the schema")]
    UnknownTopic(String),
}

impl RouteError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            RouteError::MalformedPayload { .. } => "malformed_payload",
            RouteError::UnknownTopic(_) => "unknown_topic",
        }
    }

    pub fn topic(&self) -> &str {
        match self {
            RouteError::MalformedPayload { topic, .. } => topic,
            RouteError::UnknownTopic(topic) => topic,
        }
    }
}

/// Turns `(topic, payload)` into a validated [`Update`]. Holds only the
/// startup schema, never the live snapshot.
#[derive(Debug, Clone)]
pub struct TopicRouter {
    channels: ChannelMap,
    sections: BTreeSet<(String, String)>,
}

impl TopicRouter {
    pub fn new(channels: ChannelMap, schema: &Snapshot) -> Self {
        let sections = schema
            .sections()
            .map(|(group, sub_key)| (group.to_string(), sub_key.to_string()))
            .collect();
        Self { channels, sections }
    }

    pub fn route(&self, topic: &str, payload: &[u8]) -> Result<Update, RouteError> {
        let (path, class) = self.resolve(topic)?;
        let raw: i64 =
            serde_json::from_slice(payload).map_err(|err| RouteError::MalformedPayload {
                topic: topic.to_string(),
                reason: err.to_string(),
            })?;
        Ok(Update::new(path, class.apply(raw)))
    }

    /// Normalized path and class for a topic, without looking at a payload.
    pub fn resolve(&self, topic: &str) -> Result<(ChannelPath, ChannelClass), RouteError> {
        let unknown = || RouteError::UnknownTopic(topic.to_string());
        let parts: Vec<&str> = topic.split('.').collect();
        let (group, sub_key, explicit_field) = match parts.as_slice() {
            [group, sub_key] => (*group, *sub_key, None),
            [group, sub_key, field] => (*group, *sub_key, Some(*field)),
            _ => return Err(unknown()),
        };

        let binding = self.channels.binding(group).ok_or_else(unknown)?;
        if !self
            .sections
            .contains(&(group.to_string(), sub_key.to_string()))
        {
            return Err(unknown());
        }
        let field = match explicit_field {
            Some(field) => field,
            None => binding.default_field.as_deref().ok_or_else(unknown)?,
        };
        let path = ChannelPath::new(group, sub_key, field).map_err(|_| unknown())?;
        Ok((path, binding.class))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{load_seed, ChannelBinding};

    fn router() -> TopicRouter {
        TopicRouter::new(ChannelMap::dashboard(), &load_seed(None).unwrap())
    }

    #[test]
    fn three_level_topic_routes_verbatim() {
        let update = router().route("quarterA.col2.num5", b"77").unwrap();
        assert_eq!(update.path.to_string(), "quarterA.col2.num5");
        assert_eq!(update.value, 77);
    }

    #[test]
    fn scalar_topic_gets_default_field_and_clamp() {
        let router = router();
        let routed: Vec<i64> = ["0", "1", "99", "150"]
            .iter()
            .map(|raw| router.route("quarterD.col3", raw.as_bytes()).unwrap().value)
            .collect();
        assert_eq!(routed, vec![1, 1, 99, 99]);

        let update = router.route("quarterD.col3", b"250").unwrap();
        assert_eq!(update.path.to_string(), "quarterD.col3.current");
        assert_eq!(update.value, 99);
    }

    #[test]
    fn explicit_field_on_percentage_group_is_still_clamped() {
        let update = router().route("quarterD.col1.target", b"-5").unwrap();
        assert_eq!(update.path.to_string(), "quarterD.col1.target");
        assert_eq!(update.value, 1);
    }

    #[test]
    fn counters_are_not_clamped() {
        let update = router().route("quarterC.wastedMinutes.hour2", b"480").unwrap();
        assert_eq!(update.value, 480);
    }

    #[test]
    fn unknown_topics() {
        let router = router();
        for topic in [
            "quarterZ.foo",
            "quarterB.col1.num1",
            "quarterA.col9.num1",
            "quarterA.col1",
            "quarterA",
            "quarterA.col1.num1.extra",
            "quarterA.col1.",
            "",
        ] {
            assert_eq!(
                router.route(topic, b"1"),
                Err(RouteError::UnknownTopic(topic.to_string())),
                "{topic}"
            );
        }
    }

    #[test]
    fn malformed_payloads() {
        let router = router();
        let payloads: [&[u8]; 6] = [b"abc", b"", b"7.5", b"\"7\"", b"[7]", b"99999999999999999999"];
        for payload in payloads {
            let err = router.route("quarterA.col1.num1", payload).unwrap_err();
            assert_eq!(err.metric_label(), "malformed_payload");
            assert_eq!(err.topic(), "quarterA.col1.num1");
        }
        assert_eq!(router.route("quarterA.col1.num1", b" 12 \n").unwrap().value, 12);
    }

    #[test]
    fn custom_bindings() {
        let seed = crate::snapshot::Snapshot::from_seed(r#"{"plant":{"line1":{"rate":5}}}"#).unwrap();
        let router = TopicRouter::new(
            ChannelMap::new(vec![ChannelBinding::counter("plant")]),
            &seed,
        );
        assert_eq!(router.route("plant.line1.rate", b"9").unwrap().value, 9);
        assert!(router.route("plant.line1", b"9").is_err());
    }
}
