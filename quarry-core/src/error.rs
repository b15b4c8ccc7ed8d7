// quarry-core/src/error.rs
//! Error taxonomy with stable numeric codes.
//!
//! Every failure that crosses the command boundary carries an [`ErrorCode`]
//! whose numbering follows the document-database convention, so clients can
//! branch on the code rather than on message text.

use serde_json::{json, Value as JsonValue};
use thiserror::Error;

/// Stable error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    InternalError,
    BadValue,
    NoSuchKey,
    FailedToParse,
    DataCorruptionDetected,
    TypeMismatch,
    IllegalOperation,
    LockTimeout,
    ImmutableField,
    NamespaceNotFound,
    IndexNotFound,
    CursorNotFound,
    NamespaceExists,
    MaxTimeMSExpired,
    CommandNotFound,
    InvalidOptions,
    InvalidNamespace,
    IndexOptionsConflict,
    WriteConflict,
    ConflictingOperationInProgress,
    ExceededMemoryLimit,
    InvalidPipelineOperator,
    CannotIndexParallelArrays,
    QueryPlanKilled,
    SnapshotTooOld,
    NoSuchTransaction,
    TransactionCommitted,
    OperationNotSupportedInTransaction,
    PreparedTransactionInProgress,
    IndexBuildAborted,
    QueryExceededMemoryLimitNoDiskUseAllowed,
    BsonObjectTooLarge,
    DuplicateKey,
    Interrupted,
    InterruptedDueToReplStateChange,
    MergeStageNoMatchingDocument,
    UnrecognizedPipelineStage,
    UnknownField,
    StageMustBeLast,
    LookupSubPipelineWrite,
    MergeOnFieldsNotUnique,
}

impl ErrorCode {
    pub fn as_i32(self) -> i32 {
        match self {
            ErrorCode::InternalError => 1,
            ErrorCode::BadValue => 2,
            ErrorCode::NoSuchKey => 4,
            ErrorCode::FailedToParse => 9,
            ErrorCode::DataCorruptionDetected => 12,
            ErrorCode::TypeMismatch => 14,
            ErrorCode::IllegalOperation => 20,
            ErrorCode::LockTimeout => 24,
            ErrorCode::ImmutableField => 66,
            ErrorCode::NamespaceNotFound => 26,
            ErrorCode::IndexNotFound => 27,
            ErrorCode::CursorNotFound => 43,
            ErrorCode::NamespaceExists => 48,
            ErrorCode::MaxTimeMSExpired => 50,
            ErrorCode::CommandNotFound => 59,
            ErrorCode::InvalidOptions => 72,
            ErrorCode::InvalidNamespace => 73,
            ErrorCode::IndexOptionsConflict => 85,
            ErrorCode::WriteConflict => 112,
            ErrorCode::ConflictingOperationInProgress => 117,
            ErrorCode::ExceededMemoryLimit => 146,
            ErrorCode::InvalidPipelineOperator => 168,
            ErrorCode::CannotIndexParallelArrays => 171,
            ErrorCode::QueryPlanKilled => 175,
            ErrorCode::SnapshotTooOld => 239,
            ErrorCode::NoSuchTransaction => 251,
            ErrorCode::TransactionCommitted => 256,
            ErrorCode::OperationNotSupportedInTransaction => 263,
            ErrorCode::PreparedTransactionInProgress => 267,
            ErrorCode::IndexBuildAborted => 276,
            ErrorCode::QueryExceededMemoryLimitNoDiskUseAllowed => 292,
            ErrorCode::BsonObjectTooLarge => 10334,
            ErrorCode::DuplicateKey => 11000,
            ErrorCode::Interrupted => 11601,
            ErrorCode::InterruptedDueToReplStateChange => 11602,
            ErrorCode::MergeStageNoMatchingDocument => 13113,
            ErrorCode::UnrecognizedPipelineStage => 40324,
            ErrorCode::UnknownField => 40415,
            ErrorCode::StageMustBeLast => 40601,
            ErrorCode::LookupSubPipelineWrite => 51047,
            ErrorCode::MergeOnFieldsNotUnique => 51183,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ErrorCode::InternalError => "InternalError",
            ErrorCode::BadValue => "BadValue",
            ErrorCode::NoSuchKey => "NoSuchKey",
            ErrorCode::FailedToParse => "FailedToParse",
            ErrorCode::DataCorruptionDetected => "DataCorruptionDetected",
            ErrorCode::TypeMismatch => "TypeMismatch",
            ErrorCode::IllegalOperation => "IllegalOperation",
            ErrorCode::LockTimeout => "LockTimeout",
            ErrorCode::ImmutableField => "ImmutableField",
            ErrorCode::NamespaceNotFound => "NamespaceNotFound",
            ErrorCode::IndexNotFound => "IndexNotFound",
            ErrorCode::CursorNotFound => "CursorNotFound",
            ErrorCode::NamespaceExists => "NamespaceExists",
            ErrorCode::MaxTimeMSExpired => "MaxTimeMSExpired",
            ErrorCode::CommandNotFound => "CommandNotFound",
            ErrorCode::InvalidOptions => "InvalidOptions",
            ErrorCode::InvalidNamespace => "InvalidNamespace",
            ErrorCode::IndexOptionsConflict => "IndexOptionsConflict",
            ErrorCode::WriteConflict => "WriteConflict",
            ErrorCode::ConflictingOperationInProgress => "ConflictingOperationInProgress",
            ErrorCode::ExceededMemoryLimit => "ExceededMemoryLimit",
            ErrorCode::InvalidPipelineOperator => "InvalidPipelineOperator",
            ErrorCode::CannotIndexParallelArrays => "CannotIndexParallelArrays",
            ErrorCode::QueryPlanKilled => "QueryPlanKilled",
            ErrorCode::SnapshotTooOld => "SnapshotTooOld",
            ErrorCode::NoSuchTransaction => "NoSuchTransaction",
            ErrorCode::TransactionCommitted => "TransactionCommitted",
            ErrorCode::OperationNotSupportedInTransaction => "OperationNotSupportedInTransaction",
            ErrorCode::PreparedTransactionInProgress => "PreparedTransactionInProgress",
            ErrorCode::IndexBuildAborted => "IndexBuildAborted",
            ErrorCode::QueryExceededMemoryLimitNoDiskUseAllowed => {
                "QueryExceededMemoryLimitNoDiskUseAllowed"
            }
            ErrorCode::BsonObjectTooLarge => "BSONObjectTooLarge",
            ErrorCode::DuplicateKey => "DuplicateKey",
            ErrorCode::Interrupted => "Interrupted",
            ErrorCode::InterruptedDueToReplStateChange => "InterruptedDueToReplStateChange",
            ErrorCode::MergeStageNoMatchingDocument => "MergeStageNoMatchingDocument",
            ErrorCode::UnrecognizedPipelineStage => "UnrecognizedPipelineStage",
            ErrorCode::UnknownField => "UnknownField",
            ErrorCode::StageMustBeLast => "StageMustBeLast",
            ErrorCode::LookupSubPipelineWrite => "LookupSubPipelineWrite",
            ErrorCode::MergeOnFieldsNotUnique => "MergeOnFieldsNotUnique",
        }
    }

    pub fn category(self) -> ErrorCategory {
        match self {
            ErrorCode::WriteConflict | ErrorCode::DuplicateKey | ErrorCode::LockTimeout => {
                ErrorCategory::Conflict
            }
            ErrorCode::BadValue
            | ErrorCode::FailedToParse
            | ErrorCode::TypeMismatch
            | ErrorCode::InvalidOptions
            | ErrorCode::InvalidNamespace
            | ErrorCode::IllegalOperation
            | ErrorCode::ImmutableField
            | ErrorCode::CommandNotFound
            | ErrorCode::IndexOptionsConflict
            | ErrorCode::InvalidPipelineOperator
            | ErrorCode::CannotIndexParallelArrays
            | ErrorCode::UnrecognizedPipelineStage
            | ErrorCode::UnknownField
            | ErrorCode::StageMustBeLast
            | ErrorCode::LookupSubPipelineWrite
            | ErrorCode::MergeOnFieldsNotUnique
            | ErrorCode::MergeStageNoMatchingDocument
            | ErrorCode::OperationNotSupportedInTransaction
            | ErrorCode::NamespaceExists => ErrorCategory::Validation,
            ErrorCode::IndexBuildAborted
            | ErrorCode::Interrupted
            | ErrorCode::InterruptedDueToReplStateChange
            | ErrorCode::MaxTimeMSExpired
            | ErrorCode::QueryPlanKilled
            | ErrorCode::NoSuchTransaction
            | ErrorCode::TransactionCommitted
            | ErrorCode::PreparedTransactionInProgress
            | ErrorCode::ConflictingOperationInProgress
            | ErrorCode::SnapshotTooOld => ErrorCategory::State,
            ErrorCode::ExceededMemoryLimit
            | ErrorCode::QueryExceededMemoryLimitNoDiskUseAllowed
            | ErrorCode::BsonObjectTooLarge => ErrorCategory::Resource,
            ErrorCode::NamespaceNotFound
            | ErrorCode::IndexNotFound
            | ErrorCode::CursorNotFound
            | ErrorCode::NoSuchKey => ErrorCategory::NotFound,
            ErrorCode::InternalError | ErrorCode::DataCorruptionDetected => {
                ErrorCategory::Internal
            }
        }
    }
}

/// Taxonomy class of an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Conflict,
    Validation,
    State,
    Resource,
    NotFound,
    Internal,
}

#[derive(Error, Debug)]
pub enum QuarryError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("E11000 duplicate key error collection: {ns} index: {index} dup key: {key}")]
    DuplicateKey {
        ns: String,
        index: String,
        key: String,
    },

    #[error("WriteConflict error: this operation conflicted with another operation. Please retry your operation or multi-document transaction.")]
    WriteConflict,

    #[error("ns not found: {0}")]
    NamespaceNotFound(String),

    #[error("index not found with name [{0}]")]
    IndexNotFound(String),

    #[error("{0}")]
    BadValue(String),

    #[error("{0}")]
    InvalidOptions(String),

    #[error("{0}")]
    TypeMismatch(String),

    #[error("operation was interrupted: {0}")]
    Interrupted(String),

    #[error("index build aborted: {0}")]
    IndexBuildAborted(String),

    #[error("{0}")]
    ExceededMemoryLimit(String),

    #[error("BSONObj size: {size} is invalid. Size must be between 0 and {limit}")]
    BsonObjectTooLarge { size: usize, limit: usize },

    #[error("{message}")]
    Command { code: ErrorCode, message: String },
}

pub type Result<T> = std::result::Result<T, QuarryError>;

impl QuarryError {
    /// Build an error carrying an arbitrary code.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            ErrorCode::BadValue => QuarryError::BadValue(message),
            ErrorCode::InvalidOptions => QuarryError::InvalidOptions(message),
            ErrorCode::TypeMismatch => QuarryError::TypeMismatch(message),
            ErrorCode::NamespaceNotFound => QuarryError::NamespaceNotFound(message),
            ErrorCode::IndexNotFound => QuarryError::IndexNotFound(message),
            ErrorCode::Interrupted => QuarryError::Interrupted(message),
            ErrorCode::IndexBuildAborted => QuarryError::IndexBuildAborted(message),
            ErrorCode::WriteConflict => QuarryError::WriteConflict,
            code => QuarryError::Command { code, message },
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            QuarryError::Io(_) => ErrorCode::InternalError,
            QuarryError::Serialization(_) => ErrorCode::DataCorruptionDetected,
            QuarryError::DuplicateKey { .. } => ErrorCode::DuplicateKey,
            QuarryError::WriteConflict => ErrorCode::WriteConflict,
            QuarryError::NamespaceNotFound(_) => ErrorCode::NamespaceNotFound,
            QuarryError::IndexNotFound(_) => ErrorCode::IndexNotFound,
            QuarryError::BadValue(_) => ErrorCode::BadValue,
            QuarryError::InvalidOptions(_) => ErrorCode::InvalidOptions,
            QuarryError::TypeMismatch(_) => ErrorCode::TypeMismatch,
            QuarryError::Interrupted(_) => ErrorCode::Interrupted,
            QuarryError::IndexBuildAborted(_) => ErrorCode::IndexBuildAborted,
            QuarryError::ExceededMemoryLimit(_) => ErrorCode::ExceededMemoryLimit,
            QuarryError::BsonObjectTooLarge { .. } => ErrorCode::BsonObjectTooLarge,
            QuarryError::Command { code, .. } => *code,
        }
    }

    pub fn code_name(&self) -> &'static str {
        self.code().name()
    }

    pub fn category(&self) -> ErrorCategory {
        self.code().category()
    }

    /// Conflict-class errors that are resolved by retrying the operation.
    pub fn is_transient(&self) -> bool {
        matches!(self.code(), ErrorCode::WriteConflict | ErrorCode::LockTimeout)
    }

    pub fn is_interruption(&self) -> bool {
        matches!(
            self.code(),
            ErrorCode::Interrupted
                | ErrorCode::InterruptedDueToReplStateChange
                | ErrorCode::MaxTimeMSExpired
        )
    }

    /// Render as a command reply.
    pub fn to_reply(&self) -> JsonValue {
        let mut reply = json!({
            "ok": 0.0,
            "errmsg": self.to_string(),
            "code": self.code().as_i32(),
            "codeName": self.code_name(),
        });
        if let QuarryError::DuplicateKey { key, .. } = self {
            reply["keyValue"] = serde_json::from_str(key).unwrap_or(JsonValue::Null);
        }
        reply
    }
}

impl From<serde_json::Error> for QuarryError {
    fn from(err: serde_json::Error) -> Self {
        QuarryError::Serialization(err.to_string())
    }
}

impl From<bincode::Error> for QuarryError {
    fn from(err: bincode::Error) -> Self {
        QuarryError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(ErrorCode::DuplicateKey.as_i32(), 11000);
        assert_eq!(ErrorCode::WriteConflict.as_i32(), 112);
        assert_eq!(ErrorCode::IndexBuildAborted.as_i32(), 276);
        assert_eq!(ErrorCode::InterruptedDueToReplStateChange.as_i32(), 11602);
    }

    #[test]
    fn test_constructor_maps_to_named_variant() {
        let err = QuarryError::new(ErrorCode::BadValue, "bad");
        assert!(matches!(err, QuarryError::BadValue(_)));
        let err = QuarryError::new(ErrorCode::IllegalOperation, "nope");
        assert_eq!(err.code(), ErrorCode::IllegalOperation);
        assert_eq!(err.category(), ErrorCategory::Validation);
    }

    #[test]
    fn test_reply_shape() {
        let err = QuarryError::DuplicateKey {
            ns: "test.c".into(),
            index: "a_1".into(),
            key: r#"{"a":1}"#.into(),
        };
        let reply = err.to_reply();
        assert_eq!(reply["code"], 11000);
        assert_eq!(reply["codeName"], "DuplicateKey");
        assert_eq!(reply["keyValue"]["a"], 1);
        assert!(err.to_string().contains("E11000"));
    }

    #[test]
    fn test_transient_classification() {
        assert!(QuarryError::WriteConflict.is_transient());
        assert!(!QuarryError::BadValue("x".into()).is_transient());
        assert_eq!(QuarryError::WriteConflict.category(), ErrorCategory::Conflict);
    }
}
