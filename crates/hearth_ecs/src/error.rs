use thiserror::Error;

#[derive(Debug, Error)]
pub enum EcsError {
    /// The entity id is stale (its slot was reused) or never existed.
    #[error("entity is gone")]
    EntityGone,

    /// A component type registered at startup has one and only one type id
    /// for the lifetime of the process.
    #[error("component type '{0}' is already registered")]
    DuplicateComponent(&'static str),

    #[error("unknown component type id {0}")]
    UnknownComponent(u16),

    #[error("meta key '{0}' is already registered")]
    DuplicateMetaKey(&'static str),

    #[error("meta key id {id} holds a {actual:?}, not a {requested:?}")]
    MetaKindMismatch {
        id: u16,
        requested: crate::meta::MetaKind,
        actual: crate::meta::MetaKind,
    },

    #[error("entity format version {0} is newer than this build supports")]
    UnsupportedFormatVersion(u32),
}
