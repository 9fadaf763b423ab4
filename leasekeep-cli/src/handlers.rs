use std::collections::BTreeMap;

use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use leasekeep_core::config::KeySource;
use leasekeep_core::types::{LeaseGrant, ReclaimJob, Resource, ResourceState};
use leasekeep_core::LeaseError;

// ─── Validation Constants ───────────────────────────────────────────────────

const VALID_ACTIONS: &[&str] = &["acquire", "release"];

/// Field name -> validation messages
pub type FieldErrors = BTreeMap<String, Vec<String>>;

fn field_error(field: &str, message: impl Into<String>) -> FieldErrors {
    let mut errors = FieldErrors::new();
    errors.insert(field.to_string(), vec![message.into()]);
    errors
}

fn add_error(errors: &mut FieldErrors, field: &str, message: impl Into<String>) {
    errors
        .entry(field.to_string())
        .or_default()
        .push(message.into());
}

// ─── Request Types ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Acquire,
    Release,
}

/// Body of `PATCH /api/resources/{name}`.
///
/// Fields are kept as raw JSON so type errors can be reported per field.
#[derive(Debug, Default, Deserialize)]
pub struct ResourceActionRequest {
    #[serde(default)]
    pub action: Option<Value>,
    #[serde(default)]
    pub key: Option<Value>,
    #[serde(default)]
    pub period: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquireParams {
    pub key: Option<String>,
    pub period_ms: Option<u64>,
}

impl ResourceActionRequest {
    pub fn action(&self) -> Result<Action, FieldErrors> {
        match &self.action {
            None => Err(field_error("action", "The action field is required.")),
            Some(Value::String(s)) if s == VALID_ACTIONS[0] => Ok(Action::Acquire),
            Some(Value::String(s)) if s == VALID_ACTIONS[1] => Ok(Action::Release),
            Some(_) => Err(field_error("action", "The selected action is invalid.")),
        }
    }

    pub fn validate_acquire(
        &self,
        key_source: KeySource,
        key_length: usize,
    ) -> Result<AcquireParams, FieldErrors> {
        let mut errors = FieldErrors::new();

        let key = match (key_source, &self.key) {
            (KeySource::ClientSupplied, None) => {
                add_error(&mut errors, "key", "The key field is required.");
                None
            }
            (KeySource::ClientSupplied, Some(Value::String(key))) => {
                if key.chars().count() != key_length {
                    add_error(
                        &mut errors,
                        "key",
                        format!("The key must be {} characters.", key_length),
                    );
                }
                Some(key.clone())
            }
            (KeySource::ClientSupplied, Some(_)) => {
                add_error(&mut errors, "key", "The key must be a string.");
                None
            }
            (KeySource::ServerGenerated, None) => None,
            (KeySource::ServerGenerated, Some(_)) => {
                add_error(
                    &mut errors,
                    "key",
                    "The key is generated by the server and must not be supplied.",
                );
                None
            }
        };

        let period_ms = match &self.period {
            None => None,
            Some(Value::Number(n)) => match (n.as_u64(), n.as_i64()) {
                (Some(0), _) | (None, Some(_)) => {
                    add_error(&mut errors, "period", "The period must be greater than 0.");
                    None
                }
                (Some(secs), _) => match secs.checked_mul(1000) {
                    Some(ms) => Some(ms),
                    None => {
                        add_error(&mut errors, "period", "The period is too large.");
                        None
                    }
                },
                (None, None) => {
                    add_error(&mut errors, "period", "The period must be an integer.");
                    None
                }
            },
            Some(_) => {
                add_error(&mut errors, "period", "The period must be an integer.");
                None
            }
        };

        if errors.is_empty() {
            Ok(AcquireParams { key, period_ms })
        } else {
            Err(errors)
        }
    }

    pub fn validate_release(&self) -> Result<String, FieldErrors> {
        match &self.key {
            None => Err(field_error("key", "The key field is required.")),
            Some(Value::String(key)) => Ok(key.clone()),
            Some(_) => Err(field_error("key", "The key must be a string.")),
        }
    }
}

// ─── Response Types ─────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<FieldErrors>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            errors: None,
        }
    }

    pub fn err(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
            errors: None,
        }
    }

    pub fn invalid(errors: FieldErrors) -> Self {
        Self {
            success: false,
            data: None,
            error: Some("The given data was invalid.".to_string()),
            errors: Some(errors),
        }
    }
}

#[derive(Serialize)]
pub struct LeaseResponse {
    pub resource: String,
    pub key: String,
    pub acquired_at: u64,
    pub expires_at: Option<u64>,
}

impl From<LeaseGrant> for LeaseResponse {
    fn from(grant: LeaseGrant) -> Self {
        Self {
            resource: grant.resource,
            key: grant.key,
            acquired_at: grant.acquired_at,
            expires_at: grant.expires_at,
        }
    }
}

/// Public view of a resource. The key is never exposed.
#[derive(Serialize)]
pub struct ResourceInfo {
    pub name: String,
    pub state: ResourceState,
    pub acquired_at: Option<u64>,
    pub period_ms: Option<u64>,
    pub expires_at: Option<u64>,
}

impl From<&Resource> for ResourceInfo {
    fn from(r: &Resource) -> Self {
        Self {
            name: r.name.clone(),
            state: r.state(),
            acquired_at: r.acquired_at,
            period_ms: r.period_ms,
            expires_at: r.expires_at(),
        }
    }
}

#[derive(Serialize)]
pub struct DeadReclaimInfo {
    pub id: u64,
    pub resource: String,
    pub acquired_at: u64,
    pub due_at: u64,
    pub attempts: u32,
    pub last_error: Option<String>,
}

impl From<&ReclaimJob> for DeadReclaimInfo {
    fn from(job: &ReclaimJob) -> Self {
        Self {
            id: job.id,
            resource: job.acquisition.resource.clone(),
            acquired_at: job.acquisition.acquired_at,
            due_at: job.due_at,
            attempts: job.attempts,
            last_error: job.last_error.clone(),
        }
    }
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub resources: usize,
    pub pending_reclaims: usize,
    pub dead_reclaims: usize,
}

#[derive(Serialize)]
pub struct StatusReport {
    pub resources: Vec<ResourceInfo>,
    pub pending_reclaims: usize,
    pub dead_reclaims: Vec<DeadReclaimInfo>,
}

// ─── Outcome Mapping ────────────────────────────────────────────────────────

pub fn status_for(err: &LeaseError) -> StatusCode {
    match err {
        LeaseError::NotFound(_) => StatusCode::NOT_FOUND,
        LeaseError::Contended(_) => StatusCode::REQUEST_TIMEOUT,
        LeaseError::DuplicateKey { .. } | LeaseError::InvalidRequest(_) => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        LeaseError::AlreadyFree(_) => StatusCode::CONFLICT,
        LeaseError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        LeaseError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Client-facing body for a failed lease operation. Internal errors carry a
/// fixed message; the detail only goes to the log.
pub fn error_body(err: &LeaseError) -> ApiResponse<()> {
    match err {
        LeaseError::NotFound(_) => ApiResponse::err("Resource not found."),
        LeaseError::Contended(_) => ApiResponse::err("Request Timeout: Resource is not free."),
        LeaseError::DuplicateKey { .. } => {
            ApiResponse::invalid(field_error("key", "The key has already been taken."))
        }
        LeaseError::AlreadyFree(_) => ApiResponse::err("Resource is already free."),
        LeaseError::Unauthorized(_) => ApiResponse::err("Not authorized"),
        LeaseError::InvalidRequest(msg) => ApiResponse::err(msg.clone()),
        LeaseError::Internal(_) => ApiResponse::err("Error while processing the request."),
    }
}

pub fn unknown_key() -> FieldErrors {
    field_error("key", "The selected key is invalid.")
}
