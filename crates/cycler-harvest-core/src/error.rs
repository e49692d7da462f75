//! Typed errors returned by the report handler.
//!
//! Every variant maps onto one HTTP status so the server can answer a
//! harvester with a structured `{ "error": { "code", "message" } }` body.

use thiserror::Error;

/// Failure while handling a harvester report or an operator action.
#[derive(Debug, Error)]
pub enum ReportError {
    /// The report is structurally valid JSON but semantically wrong.
    #[error("{0}")]
    BadRequest(String),

    /// A referenced harvester, path, file, unit or column type does not exist.
    #[error("{0}")]
    NotFound(String),

    /// The requested lifecycle transition is not allowed from the current state.
    #[error("{0}")]
    Conflict(String),

    /// A chunk tried to append values of a different scalar type to an existing column.
    #[error("column '{column}' stores {stored} values, chunk sent {sent}")]
    TypeMismatch {
        column: String,
        stored: String,
        sent: String,
    },

    /// The storage backend failed.
    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),

    /// Ingestion failed and the file has already been moved to IMPORT_FAILED
    /// with the error recorded. Keeps the status of the underlying error.
    #[error("{0}")]
    ImportFailed(Box<ReportError>),
}

impl ReportError {
    /// HTTP status code for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            ReportError::BadRequest(_) => 400,
            ReportError::NotFound(_) => 404,
            ReportError::Conflict(_) => 409,
            ReportError::TypeMismatch { .. } => 422,
            ReportError::Storage(_) => 500,
            ReportError::ImportFailed(inner) => inner.status_code(),
        }
    }

    /// Machine-readable error code used in JSON error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            ReportError::BadRequest(_) => "bad_request",
            ReportError::NotFound(_) => "not_found",
            ReportError::Conflict(_) => "invalid_transition",
            ReportError::TypeMismatch { .. } => "type_mismatch",
            ReportError::Storage(_) => "internal",
            ReportError::ImportFailed(_) => "import_failed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(ReportError::BadRequest("x".into()).status_code(), 400);
        assert_eq!(ReportError::NotFound("x".into()).status_code(), 404);
        assert_eq!(ReportError::Conflict("x".into()).status_code(), 409);
        let mismatch = ReportError::TypeMismatch {
            column: "Volts".into(),
            stored: "float".into(),
            sent: "str".into(),
        };
        assert_eq!(mismatch.status_code(), 422);
        assert_eq!(mismatch.code(), "type_mismatch");
        assert!(mismatch.to_string().contains("Volts"));

        let failed = ReportError::ImportFailed(Box::new(mismatch));
        assert_eq!(failed.status_code(), 422);
        assert_eq!(failed.code(), "import_failed");
        assert!(failed.to_string().contains("Volts"));
    }
}
