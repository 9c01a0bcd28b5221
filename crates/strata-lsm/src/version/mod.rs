//! Versions, version edits, and the version sets that apply them.
//!
//! A [`Version`] is an immutable snapshot of the live table files per level. Edits are
//! accumulated in a [`VersionEdit`], applied by a [`VersionStore`] under a single-writer
//! discipline, and made durable as one record in the MANIFEST log.

mod builder;
mod edit;
mod file_metadata;
mod lazy_set;
mod set;
mod version_struct;

pub(crate) use self::{
    edit::{NewFileEntry, VersionEdit},
    file_metadata::{FileMetadata, SeeksRemaining, SharedFileMetadata},
    lazy_set::LazyVersionSet,
    set::{BasicVersionSet, LazyUpdate, VersionStore, VersionStoreDeps},
    version_struct::Version,
};
