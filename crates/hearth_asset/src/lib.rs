#![doc = include_str!("../README.md")]

mod error;
pub mod ident;
pub mod registry;
pub mod schema;
pub mod source;
pub mod sync;

pub use crate::error::AssetError;
pub use crate::ident::Ident;
pub use crate::registry::{
    Asset, AssetDiff, AssetRegistry, AssetRegistryBuilder, IndexedTable, ResolveCx,
};
pub use crate::schema::{FieldKind, FieldSpec, FieldValue, Fields, Schema, Validator};
pub use crate::source::{AssetSource, DirectorySource};
