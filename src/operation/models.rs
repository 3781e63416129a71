//! Data models for scheduled operations.
//!
//! Defines the operation row, its status machine, priorities and the
//! structured error payload stamped on finished operations.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Kind of work an operation represents. Each type is an independent queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationType {
    OrdAggregation,
    SystemFetching,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::OrdAggregation => "ORD_AGGREGATION",
            OperationType::SystemFetching => "SYSTEM_FETCHING",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "ORD_AGGREGATION" => Some(OperationType::OrdAggregation),
            "SYSTEM_FETCHING" => Some(OperationType::SystemFetching),
            _ => None,
        }
    }
}

/// Lifecycle status of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationStatus {
    Scheduled,
    InProgress,
    Completed, // terminal until re-armed
    Failed,    // terminal until re-armed
}

impl OperationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OperationStatus::Completed | OperationStatus::Failed)
    }

    pub fn as_db_str(&self) -> &'static str {
        match self {
            OperationStatus::Scheduled => "SCHEDULED",
            OperationStatus::InProgress => "IN_PROGRESS",
            OperationStatus::Completed => "COMPLETED",
            OperationStatus::Failed => "FAILED",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        match s {
            "SCHEDULED" => Some(OperationStatus::Scheduled),
            "IN_PROGRESS" => Some(OperationStatus::InProgress),
            "COMPLETED" => Some(OperationStatus::Completed),
            "FAILED" => Some(OperationStatus::Failed),
            _ => None,
        }
    }
}

/// Named priority tiers. Higher values are served first; the store accepts
/// any integer so callers may place work between the tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum OperationPriority {
    Low = 1,
    High = 100,
}

impl OperationPriority {
    pub fn as_i32(&self) -> i32 {
        *self as i32
    }
}

/// Severity recorded with an operation error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorSeverity {
    None,
    Info,
    Warning,
    Error,
}

impl ErrorSeverity {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            ErrorSeverity::None => "NONE",
            ErrorSeverity::Info => "INFO",
            ErrorSeverity::Warning => "WARNING",
            ErrorSeverity::Error => "ERROR",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        match s {
            "NONE" => Some(ErrorSeverity::None),
            "INFO" => Some(ErrorSeverity::Info),
            "WARNING" => Some(ErrorSeverity::Warning),
            "ERROR" => Some(ErrorSeverity::Error),
            _ => None,
        }
    }
}

/// Error payload persisted as `{"error":{"message":"..."}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationErrorPayload {
    pub error: OperationErrorMessage,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationErrorMessage {
    pub message: String,
}

impl OperationErrorPayload {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            error: OperationErrorMessage {
                message: message.into(),
            },
        }
    }

    pub fn message(&self) -> &str {
        &self.error.message
    }
}

/// Opaque payload tying an operation to a domain target.
///
/// Equality of the serialized form is the deduplication key, so the JSON
/// is produced once at construction and compared verbatim afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperationData(String);

impl OperationData {
    pub fn from_json(value: &serde_json::Value) -> Self {
        Self(value.to_string())
    }

    /// Wraps a string already read back from storage.
    pub fn from_raw(raw: String) -> Self {
        Self(raw)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn parse<T: for<'de> Deserialize<'de>>(&self) -> serde_json::Result<T> {
        serde_json::from_str(&self.0)
    }
}

/// Target of an ORD aggregation: an application, optionally scoped to the
/// template it was created from, or a template on its own when the template
/// serves static ORD documents.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AggregationTarget {
    #[serde(rename = "applicationID", default, skip_serializing_if = "String::is_empty")]
    pub application_id: String,
    #[serde(
        rename = "applicationTemplateID",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub application_template_id: Option<String>,
}

impl AggregationTarget {
    pub fn new(application_id: impl Into<String>, application_template_id: Option<String>) -> Self {
        Self {
            application_id: application_id.into(),
            application_template_id: application_template_id.filter(|t| !t.is_empty()),
        }
    }

    /// Template-only target, aggregated once for the whole template.
    pub fn for_template(application_template_id: impl Into<String>) -> Self {
        Self {
            application_id: String::new(),
            application_template_id: Some(application_template_id.into()),
        }
    }

    pub fn is_template_only(&self) -> bool {
        self.application_id.is_empty() && self.application_template_id.is_some()
    }

    /// Data key of the target. Empty fields are omitted, and keys come out
    /// sorted, so equal targets always produce the same string.
    pub fn to_data(&self) -> OperationData {
        let mut fields = serde_json::Map::new();
        if !self.application_id.is_empty() {
            fields.insert(
                "applicationID".to_string(),
                serde_json::Value::String(self.application_id.clone()),
            );
        }
        if let Some(template_id) = &self.application_template_id {
            fields.insert(
                "applicationTemplateID".to_string(),
                serde_json::Value::String(template_id.clone()),
            );
        }
        OperationData::from_json(&serde_json::Value::Object(fields))
    }
}

/// A persisted unit of asynchronous work.
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    pub id: String,
    pub op_type: OperationType,
    pub status: OperationStatus,
    pub priority: i32,
    pub data: OperationData,
    pub error: Option<OperationErrorPayload>,
    pub error_severity: ErrorSeverity,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Operation {
    /// Builds a new SCHEDULED operation with a fresh ID.
    pub fn new(op_type: OperationType, priority: i32, data: OperationData, now: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            op_type,
            status: OperationStatus::Scheduled,
            priority,
            data,
            error: None,
            error_severity: ErrorSeverity::None,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    pub fn with_status(mut self, status: OperationStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_updated_at(mut self, updated_at: DateTime<Utc>) -> Self {
        self.updated_at = updated_at;
        self
    }

    /// Puts the operation back in the queue, clearing the finish marker.
    pub fn rearm(&mut self, now: DateTime<Utc>) {
        self.status = OperationStatus::Scheduled;
        self.finished_at = None;
        self.updated_at = now;
    }

    pub fn finish(
        &mut self,
        status: OperationStatus,
        error: Option<OperationErrorPayload>,
        severity: ErrorSeverity,
        now: DateTime<Utc>,
    ) {
        self.status = status;
        self.error = error;
        self.error_severity = severity;
        self.updated_at = now;
        self.finished_at = Some(now);
    }
}

/// Input for `OperationsManager::create_operation`.
#[derive(Debug, Clone)]
pub struct OperationInput {
    pub op_type: OperationType,
    pub priority: i32,
    pub data: OperationData,
}

pub(crate) fn millis_to_datetime(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_db_strings() {
        for status in [
            OperationStatus::Scheduled,
            OperationStatus::InProgress,
            OperationStatus::Completed,
            OperationStatus::Failed,
        ] {
            assert_eq!(OperationStatus::from_db_str(status.as_db_str()), Some(status));
        }
        assert_eq!(OperationStatus::from_db_str("PENDING"), None);
    }

    #[test]
    fn test_status_is_terminal() {
        assert!(!OperationStatus::Scheduled.is_terminal());
        assert!(!OperationStatus::InProgress.is_terminal());
        assert!(OperationStatus::Completed.is_terminal());
        assert!(OperationStatus::Failed.is_terminal());
    }

    #[test]
    fn test_priority_tiers_order() {
        assert!(OperationPriority::High > OperationPriority::Low);
        assert_eq!(OperationPriority::Low.as_i32(), 1);
        assert_eq!(OperationPriority::High.as_i32(), 100);
    }

    #[test]
    fn test_error_payload_shape() {
        let payload = OperationErrorPayload::new("boom");
        let json = serde_json::to_string(&payload).unwrap();
        assert_eq!(json, r#"{"error":{"message":"boom"}}"#);
        assert_eq!(payload.message(), "boom");
    }

    #[test]
    fn test_aggregation_target_data_key() {
        let with_template = AggregationTarget::new("app-1", Some("tmpl-1".to_string()));
        assert_eq!(
            with_template.to_data().as_str(),
            r#"{"applicationID":"app-1","applicationTemplateID":"tmpl-1"}"#
        );

        let empty_template = AggregationTarget::new("app-1", Some(String::new()));
        assert_eq!(empty_template.to_data().as_str(), r#"{"applicationID":"app-1"}"#);
        assert_eq!(
            empty_template.to_data(),
            AggregationTarget::new("app-1", None).to_data()
        );

        let parsed: AggregationTarget = with_template.to_data().parse().unwrap();
        assert_eq!(parsed, with_template);
    }

    #[test]
    fn test_template_only_target_data_key() {
        let target = AggregationTarget::for_template("tmpl-static");
        assert!(target.is_template_only());
        assert_eq!(
            target.to_data().as_str(),
            r#"{"applicationTemplateID":"tmpl-static"}"#
        );

        let parsed: AggregationTarget = target.to_data().parse().unwrap();
        assert_eq!(parsed, target);
        assert!(!AggregationTarget::new("app-1", Some("tmpl-static".to_string())).is_template_only());
    }

    #[test]
    fn test_new_operation_is_scheduled() {
        let now = Utc::now();
        let op = Operation::new(
            OperationType::OrdAggregation,
            OperationPriority::Low.as_i32(),
            OperationData::from_json(&serde_json::json!({"target": "A"})),
            now,
        );
        assert_eq!(op.status, OperationStatus::Scheduled);
        assert_eq!(op.error_severity, ErrorSeverity::None);
        assert_eq!(op.created_at, now);
        assert_eq!(op.updated_at, now);
        assert!(op.finished_at.is_none());
        assert!(uuid::Uuid::parse_str(&op.id).is_ok());
    }

    #[test]
    fn test_finish_then_rearm() {
        let start = Utc::now();
        let later = start + chrono::Duration::minutes(5);
        let mut op = Operation::new(
            OperationType::SystemFetching,
            1,
            OperationData::from_raw("{}".to_string()),
            start,
        );

        op.finish(
            OperationStatus::Failed,
            Some(OperationErrorPayload::new("down")),
            ErrorSeverity::Error,
            start,
        );
        assert_eq!(op.finished_at, Some(start));

        op.rearm(later);
        assert_eq!(op.status, OperationStatus::Scheduled);
        assert!(op.finished_at.is_none());
        assert_eq!(op.updated_at, later);
        // The last error stays visible until the next run overwrites it.
        assert_eq!(op.error_severity, ErrorSeverity::Error);
    }

    #[test]
    fn test_millis_roundtrip() {
        let now = millis_to_datetime(1_700_000_000_123);
        assert_eq!(now.timestamp_millis(), 1_700_000_000_123);
    }
}
