use crate::ObjectId;

/// Errors returned by the store collaborator.
///
/// `NotFound`, `AlreadyExists` and `Conflict` are distinguishable so callers can
/// retry optimistic-concurrency failures or treat missing objects as absent.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(ObjectId),
    #[error("{0} already exists")]
    AlreadyExists(ObjectId),
    #[error("conflict writing {id}: {message}")]
    Conflict { id: ObjectId, message: String },
    #[error("invalid object: {0}")]
    Invalid(String),
    #[error("store unavailable: {0}")]
    Transient(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool { matches!(self, StoreError::NotFound(_)) }
    pub fn is_already_exists(&self) -> bool { matches!(self, StoreError::AlreadyExists(_)) }
    pub fn is_conflict(&self) -> bool { matches!(self, StoreError::Conflict { .. }) }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid gvk key: {0} (expect v1/Kind or group/v1/Kind)")]
pub struct InvalidGvk(pub String);
