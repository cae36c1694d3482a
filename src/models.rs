//! Records handled by the sync layer.
//!
//! Stored records are free-form; these types name the fields the sync layer
//! itself reads and carry everything else through `extra` untouched.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

pub use crate::store::Record;

/// An application user.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Usually an RFC 3339 string, but older records may hold anything
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_active_time: Option<Value>,
    #[serde(flatten)]
    pub extra: Record,
}

impl User {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    /// Sets an arbitrary extra field.
    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }
}

/// One attempt at a test, stored under the user's `test_results`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestAttempt {
    pub test_id: String,
    #[serde(flatten)]
    pub extra: Record,
}

impl TestAttempt {
    pub fn new(test_id: impl Into<String>) -> Self {
        Self {
            test_id: test_id.into(),
            extra: Record::new(),
        }
    }
}

/// Serializes a value that must come out as a JSON object.
pub fn to_record<T: Serialize>(value: &T) -> Result<Record, serde_json::Error> {
    match serde_json::to_value(value)? {
        Value::Object(record) => Ok(record),
        other => Err(serde::de::Error::custom(format!(
            "expected an object, got {}",
            other
        ))),
    }
}

pub fn from_record<T: DeserializeOwned>(record: Record) -> Result<T, serde_json::Error> {
    serde_json::from_value(Value::Object(record))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_user_keeps_unknown_fields() {
        let raw = json!({
            "id": "u1",
            "email": "a@example.com",
            "lastActiveTime": "2024-01-01T00:00:00.000Z",
            "role": "ADMIN",
            "credits": 12
        });
        let user: User = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(user.id, "u1");
        assert_eq!(user.email.as_deref(), Some("a@example.com"));
        assert_eq!(user.extra.get("role"), Some(&json!("ADMIN")));

        assert_eq!(Value::Object(to_record(&user).unwrap()), raw);
    }

    #[test]
    fn test_user_without_optional_fields() {
        let user: User = from_record(json!({"name": "Ann"}).as_object().cloned().unwrap()).unwrap();
        assert!(user.id.is_empty());
        assert!(user.email.is_none());
        // Empty id isn't written back
        assert_eq!(to_record(&user).unwrap(), *json!({"name": "Ann"}).as_object().unwrap());
    }

    #[test]
    fn test_last_active_time_accepts_numbers() {
        let user: User = serde_json::from_value(json!({"id": "u1", "lastActiveTime": 1700000000})).unwrap();
        assert_eq!(user.last_active_time, Some(json!(1700000000)));
    }

    #[test]
    fn test_attempt_round_trip() {
        let mut attempt = TestAttempt::new("quiz-3");
        attempt.extra.insert("score".to_string(), json!(8));
        let record = to_record(&attempt).unwrap();
        assert_eq!(Value::Object(record.clone()), json!({"testId": "quiz-3", "score": 8}));
        assert_eq!(from_record::<TestAttempt>(record).unwrap(), attempt);
    }

    #[test]
    fn test_to_record_rejects_non_objects() {
        assert!(to_record(&5).is_err());
    }
}
