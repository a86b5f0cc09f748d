//! truly-faces-store: persistence for detected faces and the per-contact
//! match targets derived from confirmed ones.

pub mod codec;
pub mod store;

pub use store::{FaceStore, KnownEmbeddings, StoreError};
