use ulid::Ulid;

use crate::store::StoreError;
use crate::vendor::VendorError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnipeError {
    /// The request was rejected before anything was stored.
    Validation(String),
    NotFound(Ulid),
    Store(StoreError),
    Vendor(VendorError),
}

impl std::fmt::Display for SnipeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SnipeError::Validation(msg) => write!(f, "invalid snipe: {msg}"),
            SnipeError::NotFound(id) => write!(f, "not found: {id}"),
            SnipeError::Store(e) => write!(f, "store: {e}"),
            SnipeError::Vendor(e) => write!(f, "vendor: {e}"),
        }
    }
}

impl std::error::Error for SnipeError {}

impl From<StoreError> for SnipeError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => SnipeError::NotFound(id),
            other => SnipeError::Store(other),
        }
    }
}

impl From<VendorError> for SnipeError {
    fn from(e: VendorError) -> Self {
        SnipeError::Vendor(e)
    }
}
