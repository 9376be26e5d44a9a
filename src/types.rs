use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

/// One record from the Confluent Cloud audit log stream, following the
/// CloudEvents envelope. Unknown fields are ignored so new audit payload
/// versions do not break parsing.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AuditLogEvent {
    pub id: Option<String>,
    pub specversion: Option<String>,
    #[serde(rename = "type")]
    pub event_type: Option<String>,
    pub source: Option<String>,
    pub subject: Option<String>,
    pub time: Option<String>,
    pub data: Option<AuditLogData>,
}

impl AuditLogEvent {
    pub fn method_name(&self) -> Option<&str> {
        self.data.as_ref()?.method_name.as_deref()
    }

    pub fn resource_name(&self) -> Option<&str> {
        self.data.as_ref()?.resource_name.as_deref()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuditLogData {
    pub service_name: Option<String>,
    pub method_name: Option<String>,
    pub resource_name: Option<String>,
    pub request: Option<RequestData>,
    pub result: Option<ResultData>,
}

/// Request details. Schema payloads live in the nested `data` object;
/// subject, version, compatibility and mode may also appear as direct
/// fields depending on the operation.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RequestData {
    pub access_type: Option<String>,
    pub data: Option<RequestInnerData>,
    subject: Option<String>,
    pub version: Option<i32>,
    pub compatibility: Option<String>,
    pub mode: Option<String>,
}

impl RequestData {
    /// The subject, preferring the nested request data over the direct field.
    pub fn subject(&self) -> Option<&str> {
        self.data
            .as_ref()
            .and_then(|d| d.subject.as_deref())
            .or(self.subject.as_deref())
    }

    pub fn schema_type(&self) -> Option<&str> {
        self.data.as_ref()?.schema_type.as_deref()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RequestInnerData {
    pub subject: Option<String>,
    pub schema: Option<String>,
    pub schema_type: Option<String>,
    pub references: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResultData {
    pub status: Option<String>,
    pub message: Option<String>,
    pub data: Option<ResultInnerData>,
}

impl ResultData {
    /// The registered schema id, narrowed from the raw floating-point value.
    pub fn schema_id(&self) -> Option<i32> {
        self.data.as_ref()?.id.and_then(narrow_schema_id)
    }
}

/// Inner result payload. The schema id arrives as a JSON float
/// (e.g. `100264.0`).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ResultInnerData {
    pub id: Option<f64>,
    pub version: Option<i32>,
}

/// Narrows a raw schema id to an i32, truncating toward zero. NaN and
/// infinite values are dropped.
pub fn narrow_schema_id(raw: f64) -> Option<i32> {
    if !raw.is_finite() {
        warn!("Ignoring non-finite schema id: {raw}");
        return None;
    }
    Some(raw.trunc() as i32)
}

/// The kind of schema mutation a notification describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    SchemaRegistered,
    SchemaDeleted,
    SubjectDeleted,
    CompatibilityUpdated,
    ModeUpdated,
}

/// The notification published to the target topic. A common envelope plus
/// exactly one populated variant body matching `event_type`. Absent fields
/// are omitted from the serialized form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaChangeNotification {
    pub event_type: EventType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema_id: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_contract_registered: Option<DataContractRegistered>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_contract_deleted: Option<DataContractDeleted>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject_deleted: Option<SubjectDeleted>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compatibility_updated: Option<CompatibilityUpdated>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode_updated: Option<ModeUpdated>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audit_log_event_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment_id: Option<String>,
}

impl SchemaChangeNotification {
    /// An empty notification of the given type. Callers fill in the
    /// envelope and the matching variant body.
    pub fn new(event_type: EventType) -> Self {
        Self {
            event_type,
            schema_id: None,
            subject: None,
            version: None,
            schema_type: None,
            timestamp: None,
            data_contract_registered: None,
            data_contract_deleted: None,
            subject_deleted: None,
            compatibility_updated: None,
            mode_updated: None,
            audit_log_event_id: None,
            environment_id: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataContractRegistered {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub references: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataContractDeleted {
    pub permanent: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubjectDeleted {
    pub permanent: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub versions_deleted: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompatibilityUpdated {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_compatibility: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModeUpdated {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_mode: Option<String>,
}
