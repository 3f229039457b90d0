use tether_core::{ObjectId, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    /// A store call failed; `target` names the object or kind it was about.
    #[error("{op} {target}: {source}")]
    Store {
        op: &'static str,
        target: String,
        #[source]
        source: StoreError,
    },
    #[error("{id} is owned by {owner} (set {set_id:?}); refusing to take it over")]
    OwnedByOther { id: ObjectId, owner: String, set_id: String },
    #[error("owner {owner} of {id} no longer exists")]
    OwnerNotFound { id: ObjectId, owner: ObjectId },
    #[error("{0} carries no ownership metadata")]
    NotOwned(ObjectId),
    #[error("invalid object: {0}")]
    Invalid(String),
    #[error("{id}: still conflicting after {attempts} attempts")]
    ConflictRetriesExhausted { id: ObjectId, attempts: u32 },
    #[error("encoding applied configuration for {id}: {message}")]
    Encode { id: ObjectId, message: String },
}

impl ApplyError {
    pub(crate) fn store(op: &'static str, target: impl ToString, source: StoreError) -> Self {
        ApplyError::Store { op, target: target.to_string(), source }
    }
}
