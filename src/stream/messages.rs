//! Frames written to streaming clients. Outbound only; clients send nothing
//! but control frames.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::types::{ChangeEvent, Fixture};

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamMessage<'a> {
    Connected {
        session_id: &'a str,
    },
    /// Stored fixtures matching the session filter, sent before any change.
    Snapshot {
        session_seq: u64,
        fixtures: &'a [Fixture],
    },
    Change {
        session_seq: u64,
        #[serde(flatten)]
        event: &'a ChangeEvent,
    },
    Heartbeat {
        session_seq: u64,
        at: DateTime<Utc>,
    },
}

impl StreamMessage<'_> {
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::tests::fixture;
    use crate::types::{FixtureChange, FixtureField};
    use serde_json::{json, Value};

    #[test]
    fn change_frame_carries_both_sequences() {
        let event = ChangeEvent {
            seq: 42,
            change: FixtureChange::Updated {
                changed_fields: [FixtureField::Status].into_iter().collect(),
                fixture: fixture("f1", "nba"),
            },
        };
        let text = StreamMessage::Change { session_seq: 3, event: &event }.encode().unwrap();
        let v: Value = serde_json::from_str(&text).unwrap();

        assert_eq!(v["type"], "change");
        assert_eq!(v["session_seq"], 3);
        assert_eq!(v["seq"], 42);
        assert_eq!(v["kind"], "updated");
        assert_eq!(v["changed_fields"], json!(["status"]));
        assert_eq!(v["fixture"]["id"], "f1");
    }

    #[test]
    fn connected_and_heartbeat_frames() {
        let text = StreamMessage::Connected { session_id: "abc" }.encode().unwrap();
        assert_eq!(serde_json::from_str::<Value>(&text).unwrap(), json!({"type": "connected", "session_id": "abc"}));

        let at = "2025-01-10T00:00:00Z".parse().unwrap();
        let text = StreamMessage::Heartbeat { session_seq: 1, at }.encode().unwrap();
        let v: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(v["type"], "heartbeat");
        assert_eq!(v["session_seq"], 1);
    }

    #[test]
    fn snapshot_frame_lists_fixtures() {
        let fixtures = [fixture("a", "nba"), fixture("b", "nba")];
        let text = StreamMessage::Snapshot { session_seq: 1, fixtures: &fixtures }.encode().unwrap();
        let v: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(v["type"], "snapshot");
        assert_eq!(v["session_seq"], 1);
        assert_eq!(v["fixtures"][1]["id"], "b");
    }
}
