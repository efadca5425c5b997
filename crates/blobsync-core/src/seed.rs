use chrono::{Duration, NaiveDateTime, Utc};
use serde_json::json;
use uuid::Uuid;

use crate::snapshot::{row, Row, Scalar, TableSnapshot};

/// Produces the rows the database is reset to at the start of every run.
pub trait SeedSource: Send + Sync {
    fn generate(&self) -> TableSnapshot;
}

/// A fixed snapshot seeds itself.
impl SeedSource for TableSnapshot {
    fn generate(&self) -> TableSnapshot {
        self.clone()
    }
}

/// Toy conversation data: per session a user prompt, an assistant reply and
/// the reply-to-prompt link.
#[derive(Debug, Clone)]
pub struct MockSessions {
    pub sessions: usize,
    pub base_time: NaiveDateTime,
}

impl MockSessions {
    pub fn new(sessions: usize) -> Self {
        Self {
            sessions,
            base_time: Utc::now().naive_utc(),
        }
    }

    pub fn with_base_time(mut self, base_time: NaiveDateTime) -> Self {
        self.base_time = base_time;
        self
    }

    fn stamp(&self, minutes: i64) -> String {
        (self.base_time + Duration::minutes(minutes))
            .format("%Y-%m-%dT%H:%M:%S%.6f")
            .to_string()
    }
}

impl SeedSource for MockSessions {
    fn generate(&self) -> TableSnapshot {
        let mut sessions = Vec::with_capacity(self.sessions);
        let mut events = Vec::with_capacity(self.sessions * 2);
        let mut parents = Vec::with_capacity(self.sessions);

        for index in 1..=self.sessions {
            let session_id = Uuid::new_v4().to_string();
            let offset = index as i64 * 10;

            sessions.push(row([
                ("session_id", Scalar::from(session_id.as_str())),
                ("created_at", Scalar::from(self.stamp(offset))),
                ("metadata", Scalar::from(json!({ "user": format!("user{index}") }).to_string())),
            ]));

            let prompt_text = format!("Hello, this is session {index}!");
            let prompt_id = Uuid::new_v4().to_string();
            events.push(event(
                &prompt_id,
                self.stamp(offset + 1),
                &session_id,
                ("user_prompt", "User"),
                &prompt_text,
                json!({ "tokens": 5, "temp": 0.0 }),
            ));

            let reply_text = format!("Hi User{index}, nice to meet you.");
            let reply_id = Uuid::new_v4().to_string();
            events.push(event(
                &reply_id,
                self.stamp(offset + 2),
                &session_id,
                ("assistant_out", "Assistant"),
                &reply_text,
                json!({ "tokens": 7, "temp": 0.2 }),
            ));

            parents.push(row([
                ("event_id", reply_id.as_str()),
                ("parent_event_id", prompt_id.as_str()),
            ]));
        }

        TableSnapshot::new()
            .with_table("sessions", sessions)
            .with_table("events", events)
            .with_table("event_parents", parents)
    }
}

fn event(
    event_id: &str,
    created_at: String,
    session_id: &str,
    (event_type, actor): (&str, &str),
    text: &str,
    params: serde_json::Value,
) -> Row {
    row([
        ("event_id", Scalar::from(event_id)),
        ("created_at", Scalar::from(created_at)),
        ("session_id", Scalar::from(session_id)),
        ("turn", Scalar::from(1_i64)),
        ("event_type", Scalar::from(event_type)),
        ("actor", Scalar::from(actor)),
        ("payload", Scalar::from(json!({ "text": text }).to_string())),
        ("content", Scalar::from(text)),
        ("params", Scalar::from(params.to_string())),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::TRACKED_TABLES;

    #[test]
    fn mock_sessions_match_the_declared_schema() {
        let snapshot = MockSessions::new(3).generate();

        assert_eq!(snapshot.row_count("sessions"), 3);
        assert_eq!(snapshot.row_count("events"), 6);
        assert_eq!(snapshot.row_count("event_parents"), 3);

        for table in TRACKED_TABLES {
            for (index, row) in snapshot.table(table.name).unwrap().iter().enumerate() {
                table.check_row(index, row).unwrap();
            }
        }
    }

    #[test]
    fn replies_link_to_their_prompts() {
        let snapshot = MockSessions::new(1).generate();
        let events = snapshot.table("events").unwrap();
        let link = &snapshot.table("event_parents").unwrap()[0];

        assert_eq!(link["event_id"], events[1]["event_id"]);
        assert_eq!(link["parent_event_id"], events[0]["event_id"]);
        assert_eq!(events[0]["event_type"], Scalar::from("user_prompt"));
    }
}
