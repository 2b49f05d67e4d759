use serde::{Deserialize, Serialize};
use uuid::Uuid;
use chrono::{DateTime, Utc};

/// A command delivered to the inventory service over the command bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub id: Uuid,
    pub correlation_id: Uuid,
    pub command_type: CommandType,
    pub payload: serde_json::Value,
    pub idempotency_key: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CommandType {
    /// Payment succeeded; turn the order's holds into sales.
    ConfirmReservation,
    /// Payment failed or the checkout was abandoned.
    ReleaseReservation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandReply {
    pub id: Uuid,
    pub command_id: Uuid,
    pub correlation_id: Uuid,
    pub status: CommandStatus,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CommandStatus {
    Success,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmReservationData {
    pub reservation_ids: Vec<Uuid>,
    pub order_ref: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseReservationData {
    pub reservation_ids: Vec<Uuid>,
    #[serde(default = "default_release_reason")]
    pub reason: String,
}

fn default_release_reason() -> String {
    "payment_failed".to_string()
}

impl Command {
    pub fn new(correlation_id: Uuid, command_type: CommandType, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            correlation_id,
            command_type,
            payload,
            idempotency_key: format!("{}_{}", correlation_id, Uuid::new_v4()),
            created_at: Utc::now(),
        }
    }
}

impl CommandReply {
    pub fn success(command_id: Uuid, correlation_id: Uuid, result: Option<serde_json::Value>) -> Self {
        Self {
            id: Uuid::new_v4(),
            command_id,
            correlation_id,
            status: CommandStatus::Success,
            result,
            error: None,
            created_at: Utc::now(),
        }
    }

    pub fn failed(command_id: Uuid, correlation_id: Uuid, error: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            command_id,
            correlation_id,
            status: CommandStatus::Failed,
            result: None,
            error: Some(error),
            created_at: Utc::now(),
        }
    }

    /// A failed reply that still carries the per-reservation breakdown.
    pub fn failed_with(
        command_id: Uuid,
        correlation_id: Uuid,
        error: String,
        result: serde_json::Value,
    ) -> Self {
        Self {
            result: Some(result),
            ..Self::failed(command_id, correlation_id, error)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn release_reason_defaults_to_payment_failed() {
        let id = Uuid::new_v4();
        let data: ReleaseReservationData =
            serde_json::from_value(serde_json::json!({ "reservation_ids": [id] })).unwrap();
        assert_eq!(data.reason, "payment_failed");
        assert_eq!(data.reservation_ids, vec![id]);
    }

    #[test]
    fn commands_get_distinct_idempotency_keys() {
        let correlation_id = Uuid::new_v4();
        let a = Command::new(correlation_id, CommandType::ConfirmReservation, serde_json::Value::Null);
        let b = Command::new(correlation_id, CommandType::ConfirmReservation, serde_json::Value::Null);
        assert_ne!(a.idempotency_key, b.idempotency_key);
        assert!(a.idempotency_key.starts_with(&correlation_id.to_string()));
    }
}
