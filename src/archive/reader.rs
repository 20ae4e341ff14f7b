//! Random-access archive reader.

use super::metadata::{self, Metadata, METADATA_PREFIX};
use crate::error::ArchiveError;
use std::collections::HashMap;
use std::fs::File;
use std::io::{Cursor, Read, Seek};
use std::path::Path;
use tracing::warn;
use zip::ZipArchive;

/// Name, size and kind of one archive entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub name: String,
    /// Uncompressed size in bytes.
    pub size: u64,
    pub is_dir: bool,
}

/// One content entry with its bytes and metadata. This is what a stage
/// receives as an input file.
#[derive(Debug, Clone)]
pub struct ArchiveEntry {
    info: FileInfo,
    metadata: Metadata,
    data: Vec<u8>,
}

impl ArchiveEntry {
    /// Builds an entry directly, without an archive around it.
    pub fn new(name: impl Into<String>, data: Vec<u8>, metadata: Metadata) -> Self {
        Self {
            info: FileInfo {
                name: name.into(),
                size: data.len() as u64,
                is_dir: false,
            },
            metadata,
            data,
        }
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn info(&self) -> &FileInfo {
        &self.info
    }

    /// Metadata attached by the producing stage; empty when none was attached.
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// A fresh reader over the entry's bytes.
    pub fn open(&self) -> impl Read + '_ {
        Cursor::new(self.data.as_slice())
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

/// Reads a sealed archive from any seekable source.
///
/// Directory entries are skipped; metadata side-entries are indexed up front
/// and never listed as files.
pub struct ArchiveReader<R: Read + Seek> {
    zip: ZipArchive<R>,
    names: Vec<String>,
    metadata: HashMap<String, Metadata>,
}

impl<R: Read + Seek> ArchiveReader<R> {
    pub fn new(source: R) -> Result<Self, ArchiveError> {
        let mut zip = ZipArchive::new(source)?;
        let mut names = Vec::new();
        let mut metadata = HashMap::new();

        for index in 0..zip.len() {
            let mut file = zip.by_index(index)?;
            if file.is_dir() {
                continue;
            }
            let name = file.name().to_string();
            match name.strip_prefix(METADATA_PREFIX) {
                Some(target) => {
                    let mut raw = Vec::new();
                    file.read_to_end(&mut raw)
                        .map_err(|e| ArchiveError::Io(e.to_string()))?;
                    metadata.insert(target.to_string(), metadata::decode(&name, &raw));
                }
                None => names.push(name),
            }
        }

        for target in metadata.keys() {
            if !names.contains(target) {
                warn!(entry = %target, "Metadata side-entry has no content entry");
            }
        }

        Ok(Self {
            zip,
            names,
            metadata,
        })
    }

    /// Content entry names in archive order.
    pub fn file_names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Loads one content entry.
    pub fn get_file(&mut self, name: &str) -> Result<ArchiveEntry, ArchiveError> {
        if !self.names.iter().any(|n| n == name) {
            return Err(ArchiveError::NotFound(name.to_string()));
        }
        let mut file = self.zip.by_name(name)?;
        let info = FileInfo {
            name: name.to_string(),
            size: file.size(),
            is_dir: file.is_dir(),
        };
        let mut data = Vec::with_capacity(usize::try_from(info.size).unwrap_or(0));
        file.read_to_end(&mut data)
            .map_err(|e| ArchiveError::Io(format!("reading '{name}': {e}")))?;

        Ok(ArchiveEntry {
            info,
            metadata: self.metadata.get(name).cloned().unwrap_or_default(),
            data,
        })
    }
}

impl ArchiveReader<Cursor<Vec<u8>>> {
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, ArchiveError> {
        Self::new(Cursor::new(bytes))
    }
}

impl ArchiveReader<File> {
    pub fn open_path(path: &Path) -> Result<Self, ArchiveError> {
        let file = File::open(path)
            .map_err(|e| ArchiveError::Io(format!("opening '{}': {e}", path.display())))?;
        Self::new(file)
    }
}
