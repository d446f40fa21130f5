//! Error types for warehouse operations

use thiserror::Error;

/// Errors reported by a [`Warehouse`](super::Warehouse) implementation.
///
/// Vendor errors are mapped onto these variants at the adapter boundary so
/// callers never see raw client exceptions.
#[derive(Debug, Clone, Error)]
pub enum WarehouseError {
    /// Job, table or dataset does not exist (HTTP 404)
    #[error("not found: {0}")]
    NotFound(String),

    /// Caller lacks permission (HTTP 403)
    #[error("access denied: {0}")]
    Forbidden(String),

    /// Malformed request or invalid SQL (HTTP 400)
    #[error("invalid request: {0}")]
    BadRequest(String),

    /// Any other API error with its status code
    #[error("warehouse API error ({code}): {message}")]
    Api { code: i64, message: String },

    /// Failed to establish a client or authenticate
    #[error("connection failed: {0}")]
    Connection(String),

    /// Failed to convert rows returned by the warehouse
    #[error("result conversion failed: {0}")]
    Conversion(String),
}

impl WarehouseError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, WarehouseError::NotFound(_))
    }

    /// Map an HTTP-like status code and message onto an error variant.
    pub fn from_status(code: i64, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            400 => WarehouseError::BadRequest(message),
            403 => WarehouseError::Forbidden(message),
            404 => WarehouseError::NotFound(message),
            _ => WarehouseError::Api { code, message },
        }
    }
}

impl From<datafusion::error::DataFusionError> for WarehouseError {
    fn from(e: datafusion::error::DataFusionError) -> Self {
        use datafusion::error::DataFusionError;
        match &e {
            DataFusionError::SQL(..) | DataFusionError::Plan(_) => {
                WarehouseError::BadRequest(e.to_string())
            }
            DataFusionError::SchemaError(..) => WarehouseError::BadRequest(e.to_string()),
            DataFusionError::ArrowError(..) => WarehouseError::Conversion(e.to_string()),
            _ => WarehouseError::Api {
                code: 500,
                message: e.to_string(),
            },
        }
    }
}
