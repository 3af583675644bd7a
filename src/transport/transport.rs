//! Request/response channel to the health-record service.
//!
//! The wire encoding is not interpreted here: a request is a method name plus
//! JSON parameters, a response is a status plus a JSON body.

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::error::Result;

// =============================================================================
// Status codes
// =============================================================================

/// Status codes reported by the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerStatusCode {
    Ok,
    Failed,
    BadHttp,
    InvalidXml,
    InvalidRequestIntegrity,
    BadMethod,
    InvalidApp,
    CredentialTokenExpired,
    InvalidToken,
    InvalidPerson,
    InvalidRecord,
    AccessDenied,
    InvalidItem,
    InvalidFilter,
    InvalidApplicationAuthorization,
    TypeIdNotFound,
    DuplicateCredentialFound,
    InvalidRecordState,
    RequestTimedOut,
    VersionStampMismatch,
    AuthSessionTokenExpired,
    RecordQuotaExceeded,
    ApplicationLimitExceeded,
    VocabAccessDenied,
    InvalidAge,
    InvalidIpAddress,
    MaxRecordsExceeded,
    /// A code this client does not know.
    Other(i32),
}

impl ServerStatusCode {
    pub fn from_code(code: i32) -> Self {
        use ServerStatusCode::*;
        match code {
            0 => Ok,
            1 => Failed,
            2 => BadHttp,
            3 => InvalidXml,
            4 => InvalidRequestIntegrity,
            5 => BadMethod,
            6 => InvalidApp,
            7 => CredentialTokenExpired,
            8 => InvalidToken,
            9 => InvalidPerson,
            10 => InvalidRecord,
            11 => AccessDenied,
            13 => InvalidItem,
            15 => InvalidFilter,
            18 => InvalidApplicationAuthorization,
            19 => TypeIdNotFound,
            22 => DuplicateCredentialFound,
            37 => InvalidRecordState,
            0x31 => RequestTimedOut,
            0x3d => VersionStampMismatch,
            0x41 => AuthSessionTokenExpired,
            0x44 => RecordQuotaExceeded,
            0x5d => ApplicationLimitExceeded,
            130 => VocabAccessDenied,
            157 => InvalidAge,
            158 => InvalidIpAddress,
            160 => MaxRecordsExceeded,
            other => Other(other),
        }
    }

    pub fn code(&self) -> i32 {
        use ServerStatusCode::*;
        match self {
            Ok => 0,
            Failed => 1,
            BadHttp => 2,
            InvalidXml => 3,
            InvalidRequestIntegrity => 4,
            BadMethod => 5,
            InvalidApp => 6,
            CredentialTokenExpired => 7,
            InvalidToken => 8,
            InvalidPerson => 9,
            InvalidRecord => 10,
            AccessDenied => 11,
            InvalidItem => 13,
            InvalidFilter => 15,
            InvalidApplicationAuthorization => 18,
            TypeIdNotFound => 19,
            DuplicateCredentialFound => 22,
            InvalidRecordState => 37,
            RequestTimedOut => 0x31,
            VersionStampMismatch => 0x3d,
            AuthSessionTokenExpired => 0x41,
            RecordQuotaExceeded => 0x44,
            ApplicationLimitExceeded => 0x5d,
            VocabAccessDenied => 130,
            InvalidAge => 157,
            InvalidIpAddress => 158,
            MaxRecordsExceeded => 160,
            Other(code) => *code,
        }
    }

    /// Codes for failures that may clear up if the request is sent again.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ServerStatusCode::Failed
                | ServerStatusCode::BadHttp
                | ServerStatusCode::RequestTimedOut
                | ServerStatusCode::CredentialTokenExpired
                | ServerStatusCode::AuthSessionTokenExpired
        )
    }
}

/// The status portion of a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerStatus {
    pub code: ServerStatusCode,
    pub error_text: Option<String>,
}

impl ServerStatus {
    pub fn ok() -> Self {
        Self {
            code: ServerStatusCode::Ok,
            error_text: None,
        }
    }

    pub fn error(code: ServerStatusCode, text: impl Into<String>) -> Self {
        Self {
            code,
            error_text: Some(text.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == ServerStatusCode::Ok
    }
}

// =============================================================================
// Requests and responses
// =============================================================================

/// Methods the cache invokes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MethodName {
    GetThings,
    PutThings,
    RemoveThings,
    GetThingChanges,
}

impl MethodName {
    pub fn as_str(&self) -> &'static str {
        match self {
            MethodName::GetThings => "GetThings",
            MethodName::PutThings => "PutThings",
            MethodName::RemoveThings => "RemoveThings",
            MethodName::GetThingChanges => "GetThingChanges",
        }
    }
}

#[derive(Debug, Clone)]
pub struct MethodRequest {
    pub method: MethodName,
    pub record_id: String,
    pub parameters: Value,
    pub correlation_id: Uuid,
    /// Requests carrying the same key are applied at most once by the server.
    pub idempotency_key: Option<Uuid>,
}

impl MethodRequest {
    pub fn new(method: MethodName, record_id: impl Into<String>, parameters: Value) -> Self {
        Self {
            method,
            record_id: record_id.into(),
            parameters,
            correlation_id: Uuid::new_v4(),
            idempotency_key: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MethodResponse {
    pub status: ServerStatus,
    pub body: Value,
}

impl MethodResponse {
    pub fn ok(body: Value) -> Self {
        Self {
            status: ServerStatus::ok(),
            body,
        }
    }

    pub fn error(code: ServerStatusCode, text: impl Into<String>) -> Self {
        Self {
            status: ServerStatus::error(code, text),
            body: Value::Null,
        }
    }
}

/// A channel to the service.
///
/// Returns `Err(Error::Network)` when the round trip itself fails. A response
/// with a non-OK status is still `Ok`; callers classify the status.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn call(&self, request: MethodRequest) -> Result<MethodResponse>;
}
