use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use data_model::{SnapshotInfo, SnapshotReason, TenantScope};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};
use utoipa::{IntoParams, ToSchema};

use crate::{
    dispatch::WorkResponse,
    error::SandboxError,
    lifecycle::TeardownReport,
    restore::RestoreReport,
    snapshots::{CreateOutcome, SnapshotDescription},
    supervisor::{ProcessState, TenantSettings},
};

#[derive(Debug, ToSchema, Serialize, Deserialize)]
pub struct ApiError {
    #[serde(skip)]
    status_code: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status_code: StatusCode, message: &str) -> Self {
        Self {
            status_code,
            message: message.to_string(),
        }
    }

    pub fn bad_request(message: &str) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: &str) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn status_code(&self) -> StatusCode {
        self.status_code
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status_code.is_server_error() {
            error!("API Error: {} - {}", self.status_code, self.message);
        } else {
            warn!("API Error: {} - {}", self.status_code, self.message);
        }
        (self.status_code, self.message).into_response()
    }
}

impl From<SandboxError> for ApiError {
    fn from(e: SandboxError) -> Self {
        let status_code = match e.innermost() {
            SandboxError::Unavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            SandboxError::AccessDenied { .. } => StatusCode::FORBIDDEN,
            SandboxError::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status_code, &e.to_string())
    }
}

/// Identifies the tenant a request acts for.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, IntoParams)]
pub struct TenantRequest {
    pub chat_id: String,
    /// Required for private chats unless it equals the chat id.
    pub sender_id: Option<String>,
    #[serde(default)]
    pub is_group: bool,
}

impl TenantRequest {
    pub fn scope(&self) -> Result<TenantScope, ApiError> {
        if self.chat_id.trim().is_empty() {
            return Err(ApiError::bad_request("chat_id is required"));
        }
        TenantScope::new(&self.chat_id, self.sender_id.as_deref(), self.is_group)
            .map_err(|e| ApiError::bad_request(&e.to_string()))
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CreateSnapshotRequest {
    #[serde(flatten)]
    pub tenant: TenantRequest,
    /// Free-form, defaults to `manual`.
    pub reason: Option<String>,
}

impl CreateSnapshotRequest {
    pub fn reason(&self) -> SnapshotReason {
        self.reason
            .as_deref()
            .filter(|r| !r.trim().is_empty())
            .map(SnapshotReason::from)
            .unwrap_or(SnapshotReason::Manual)
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotStatus {
    Created,
    NothingToSnapshot,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct SnapshotCreated {
    pub status: SnapshotStatus,
    pub key: Option<String>,
    pub size: Option<u64>,
    pub transfer_mode: Option<String>,
    pub sha256: Option<String>,
}

impl From<CreateOutcome> for SnapshotCreated {
    fn from(outcome: CreateOutcome) -> Self {
        match outcome {
            CreateOutcome::Created(created) => Self {
                status: SnapshotStatus::Created,
                key: Some(created.key),
                size: Some(created.size),
                transfer_mode: Some(created.mode.to_string()),
                sha256: Some(created.sha256),
            },
            CreateOutcome::NothingToSnapshot => Self {
                status: SnapshotStatus::NothingToSnapshot,
                key: None,
                size: None,
                transfer_mode: None,
                sha256: None,
            },
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct Snapshot {
    pub key: String,
    pub size: u64,
    pub uploaded_at: u64,
}

impl From<SnapshotInfo> for Snapshot {
    fn from(info: SnapshotInfo) -> Self {
        Self {
            key: info.key,
            size: info.size,
            uploaded_at: info.uploaded_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct SnapshotDetails {
    pub key: String,
    pub size: u64,
    pub uploaded_at: u64,
    /// Absent for objects stored without metadata.
    pub reason: Option<String>,
    pub created_at: Option<u64>,
    #[serde(default)]
    pub directories: Vec<String>,
    pub sha256: Option<String>,
    pub restored_from: Option<String>,
}

impl From<SnapshotDescription> for SnapshotDetails {
    fn from(description: SnapshotDescription) -> Self {
        let SnapshotDescription { info, metadata } = description;
        let metadata = metadata.as_ref();
        Self {
            key: info.key,
            size: info.size,
            uploaded_at: info.uploaded_at,
            reason: metadata.map(|m| m.reason.to_string()),
            created_at: metadata.map(|m| m.created_at),
            directories: metadata.map(|m| m.directories.clone()).unwrap_or_default(),
            sha256: metadata.and_then(|m| m.sha256.clone()),
            restored_from: metadata.and_then(|m| m.restored_from.clone()),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct SnapshotList {
    pub snapshots: Vec<Snapshot>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct DeleteSnapshotsRequest {
    #[serde(flatten)]
    pub tenant: TenantRequest,
    /// A snapshot key, or `all`.
    pub selector: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct DeletedSnapshots {
    pub deleted: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct RestoreSnapshotRequest {
    #[serde(flatten)]
    pub tenant: TenantRequest,
    pub key: String,
    #[serde(default)]
    pub mark_as_latest: bool,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct RestoreSnapshotResponse {
    pub restored_from: String,
    pub new_snapshot_key: Option<String>,
    pub transfer_mode: String,
}

impl From<RestoreReport> for RestoreSnapshotResponse {
    fn from(report: RestoreReport) -> Self {
        Self {
            restored_from: report.restored_from,
            new_snapshot_key: report.new_snapshot_key,
            transfer_mode: report.mode.to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct SandboxRequest {
    #[serde(flatten)]
    pub tenant: TenantRequest,
    pub timezone: Option<String>,
    pub credential: Option<String>,
}

impl SandboxRequest {
    pub fn settings(&self) -> TenantSettings {
        TenantSettings {
            timezone: self.timezone.clone(),
            credential: self.credential.clone(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    AlreadyRunning,
    Started,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ProcessResponse {
    pub status: ProcessStatus,
    pub pid: u32,
    pub restored_from: Option<String>,
}

impl From<ProcessState> for ProcessResponse {
    fn from(state: ProcessState) -> Self {
        match state {
            ProcessState::AlreadyRunning { pid } => Self {
                status: ProcessStatus::AlreadyRunning,
                pid,
                restored_from: None,
            },
            ProcessState::Started { pid, restored_from } => Self {
                status: ProcessStatus::Started,
                pid,
                restored_from,
            },
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct DispatchRequest {
    #[serde(flatten)]
    pub sandbox: SandboxRequest,
    /// Forwarded to the persistent process as JSON.
    #[schema(value_type = Object)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct DispatchResponse {
    /// `persistent` or `one_shot`.
    pub mode: String,
    pub success: bool,
    pub output: String,
}

impl From<WorkResponse> for DispatchResponse {
    fn from(response: WorkResponse) -> Self {
        Self {
            mode: response.mode.to_string(),
            success: response.success,
            output: response.output,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct TeardownResponse {
    pub snapshot_key: Option<String>,
    pub stopped: Vec<u32>,
}

impl From<TeardownReport> for TeardownResponse {
    fn from(report: TeardownReport) -> Self {
        Self {
            snapshot_key: report.snapshot_key,
            stopped: report.stopped,
        }
    }
}
