//! The container exchanged between stages: a ZIP archive of named files,
//! each optionally paired with a metadata side-entry.
//!
//! ```text
//!  scan-001.png              content entry
//!  scan-002.png              content entry
//!  invoice-acme.pdf          content entry
//!  .metadata.invoice-acme.pdf   {"tags":"invoice,acme"}
//! ```
//!
//! Writers ([`FsArchiveWriter`], [`MemoryArchiveWriter`]) record the first
//! failure and ignore every later call, so a stage can chain many additions
//! and check once at the end. Readers ([`ArchiveReader`]) hide the metadata
//! side-entries and hand out [`ArchiveEntry`] values.

pub mod metadata;
pub mod reader;
pub mod writer;

pub use metadata::{is_metadata_entry, metadata_entry_name, Metadata, METADATA_PREFIX};
pub use reader::{ArchiveEntry, ArchiveReader, FileInfo};
pub use writer::{ArchiveWriter, EntryWriter, FsArchiveWriter, MemoryArchiveWriter, SealedArchive};
