//! Archive writers with a sticky error state.
//!
//! Every write operation on a failed writer is a no-op; the first error is
//! surfaced by [`ArchiveWriter::error`] and returned from
//! [`ArchiveWriter::finalize`].

use super::metadata::{self, is_metadata_entry, metadata_entry_name, Metadata};
use crate::error::ArchiveError;
use std::collections::HashSet;
use std::io::{self, Cursor, Read, Seek, Write};
use std::path::Path;
use tempfile::{NamedTempFile, TempPath};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// Output side of a stage: the builder of the container handed to the next
/// stage.
///
/// Add operations return the writer itself so calls chain:
///
/// ```rust
/// use scanflow::archive::{ArchiveWriter, Metadata, MemoryArchiveWriter};
///
/// let mut out = MemoryArchiveWriter::new();
/// let tags = Metadata::from([("tags".to_string(), "invoice".to_string())]);
/// out.add_file("a.pdf", b"%PDF-1.7")
///     .attach_metadata("a.pdf", &tags)
///     .add_file("b.pdf", b"%PDF-1.7");
/// assert_eq!(out.file_count(), 2);
/// assert!(out.finalize().is_ok());
/// ```
pub trait ArchiveWriter: Send {
    /// Reserves `name` and returns a stream for its bytes.
    ///
    /// A duplicate or reserved name fails the writer; the returned stream
    /// then swallows everything written to it.
    fn open_file(&mut self, name: &str) -> EntryWriter<'_>;

    /// Adds a complete file.
    fn add_file(&mut self, name: &str, data: &[u8]) -> &mut dyn ArchiveWriter;

    /// Adds a file by draining `reader`.
    fn add_file_from_reader(&mut self, name: &str, reader: &mut dyn Read) -> &mut dyn ArchiveWriter;

    /// Attaches metadata to an existing content entry. Empty maps are ignored.
    fn attach_metadata(&mut self, name: &str, metadata: &Metadata) -> &mut dyn ArchiveWriter;

    /// Seals the archive. Single use: a second call fails.
    fn finalize(&mut self) -> Result<SealedArchive, ArchiveError>;

    /// Number of content entries, or 0 once the writer has failed.
    fn file_count(&self) -> usize;

    /// The first recorded error, if any.
    fn error(&self) -> Option<&ArchiveError>;

    /// True if an entry (content or metadata) named `name` was added.
    fn contains(&self, name: &str) -> bool;
}

/// A sealed archive ready to be enqueued.
#[derive(Debug)]
pub enum SealedArchive {
    /// A temporary file, deleted on drop unless persisted by a queue.
    File(TempPath),
    /// An in-memory ZIP image.
    Memory(Vec<u8>),
}

impl SealedArchive {
    /// Reads the sealed archive into memory.
    pub fn into_bytes(self) -> io::Result<Vec<u8>> {
        match self {
            SealedArchive::File(path) => std::fs::read(&path),
            SealedArchive::Memory(bytes) => Ok(bytes),
        }
    }

    /// Location on disk for file-backed archives.
    pub fn path(&self) -> Option<&Path> {
        match self {
            SealedArchive::File(path) => Some(path),
            SealedArchive::Memory(_) => None,
        }
    }
}

/// Stream returned by [`ArchiveWriter::open_file`].
///
/// Write errors are recorded in the owning writer. Once the writer has
/// failed, writes succeed without storing anything.
pub struct EntryWriter<'a> {
    inner: Option<&'a mut (dyn Write + 'a)>,
    error: &'a mut Option<ArchiveError>,
}

impl Write for EntryWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.error.is_some() {
            return Ok(buf.len());
        }
        let Some(inner) = self.inner.as_mut() else {
            return Ok(buf.len());
        };
        inner.write(buf).inspect_err(|e| {
            *self.error = Some(ArchiveError::Io(e.to_string()));
        })
    }

    fn flush(&mut self) -> io::Result<()> {
        match (self.error.is_some(), self.inner.as_mut()) {
            (false, Some(inner)) => inner.flush(),
            _ => Ok(()),
        }
    }
}

// ── Shared ZIP core ───────────────────────────────────────────────────────

struct StickyZip<W: Write + Seek> {
    zip: Option<ZipWriter<W>>,
    names: HashSet<String>,
    content_count: usize,
    error: Option<ArchiveError>,
}

fn entry_options() -> SimpleFileOptions {
    SimpleFileOptions::default().compression_method(CompressionMethod::Deflated)
}

impl<W: Write + Seek> StickyZip<W> {
    fn new(sink: W) -> Self {
        Self {
            zip: Some(ZipWriter::new(sink)),
            names: HashSet::new(),
            content_count: 0,
            error: None,
        }
    }

    /// A writer that failed before the first entry (e.g. no temp file).
    fn broken(error: ArchiveError) -> Self {
        Self {
            zip: None,
            names: HashSet::new(),
            content_count: 0,
            error: Some(error),
        }
    }

    fn record(&mut self, error: ArchiveError) {
        if self.error.is_none() {
            self.error = Some(error);
        }
    }

    /// Starts a new entry. Returns false (and records why) when it cannot.
    fn start_entry(&mut self, name: &str, content: bool) -> bool {
        if self.error.is_some() {
            return false;
        }
        if self.names.contains(name) {
            self.record(ArchiveError::DuplicateName(name.to_string()));
            return false;
        }
        if content && is_metadata_entry(name) {
            self.record(ArchiveError::ReservedName(name.to_string()));
            return false;
        }
        let Some(zip) = self.zip.as_mut() else {
            self.record(ArchiveError::AlreadyFinalized);
            return false;
        };
        if let Err(e) = zip.start_file(name, entry_options()) {
            self.record(e.into());
            return false;
        }
        self.names.insert(name.to_string());
        if content {
            self.content_count += 1;
        }
        true
    }

    fn open(&mut self, name: &str) -> EntryWriter<'_> {
        let started = self.start_entry(name, true);
        let StickyZip { zip, error, .. } = self;
        let inner = match zip.as_mut() {
            Some(zip) if started => Some(zip as &mut dyn Write),
            _ => None,
        };
        EntryWriter { inner, error }
    }

    fn write_entry(&mut self, name: &str, content: bool, data: &[u8]) {
        if !self.start_entry(name, content) {
            return;
        }
        let result = match self.zip.as_mut() {
            Some(zip) => zip.write_all(data),
            None => return,
        };
        if let Err(e) = result {
            self.record(ArchiveError::Io(e.to_string()));
        }
    }

    fn copy_entry(&mut self, name: &str, reader: &mut dyn Read) {
        if !self.start_entry(name, true) {
            return;
        }
        let result = match self.zip.as_mut() {
            Some(zip) => io::copy(reader, zip),
            None => return,
        };
        if let Err(e) = result {
            self.record(ArchiveError::Io(format!("reading source for '{name}': {e}")));
        }
    }

    fn attach(&mut self, name: &str, metadata: &Metadata) {
        if self.error.is_some() || metadata.is_empty() {
            return;
        }
        if is_metadata_entry(name) || !self.names.contains(name) {
            self.record(ArchiveError::OrphanMetadata(name.to_string()));
            return;
        }
        match metadata::encode(name, metadata) {
            Ok(bytes) => self.write_entry(&metadata_entry_name(name), false, &bytes),
            Err(e) => self.record(e),
        }
    }

    fn finish(&mut self) -> Result<W, ArchiveError> {
        if let Some(e) = &self.error {
            return Err(e.clone());
        }
        let zip = self.zip.take().ok_or(ArchiveError::AlreadyFinalized)?;
        zip.finish().map_err(|e| {
            let err = ArchiveError::from(e);
            self.record(err.clone());
            err
        })
    }

    fn file_count(&self) -> usize {
        if self.error.is_some() {
            0
        } else {
            self.content_count
        }
    }
}

// ── Backends ──────────────────────────────────────────────────────────────

/// Writer that streams into a temporary file.
///
/// Used by the orchestrator; the file lives in the queue root's staging
/// directory so sealing and enqueueing is a same-volume rename.
pub struct FsArchiveWriter {
    inner: StickyZip<NamedTempFile>,
}

impl FsArchiveWriter {
    /// Creates a writer backed by a new temp file in `dir`.
    ///
    /// A failure to create the file is recorded like any other write error.
    pub fn create_in(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        let inner = match tempfile::Builder::new()
            .prefix("archive-")
            .suffix(".zip")
            .tempfile_in(dir)
        {
            Ok(file) => StickyZip::new(file),
            Err(e) => StickyZip::broken(ArchiveError::Io(format!(
                "cannot create temp archive in '{}': {e}",
                dir.display()
            ))),
        };
        Self { inner }
    }
}

impl ArchiveWriter for FsArchiveWriter {
    fn open_file(&mut self, name: &str) -> EntryWriter<'_> {
        self.inner.open(name)
    }

    fn add_file(&mut self, name: &str, data: &[u8]) -> &mut dyn ArchiveWriter {
        self.inner.write_entry(name, true, data);
        self
    }

    fn add_file_from_reader(
        &mut self,
        name: &str,
        reader: &mut dyn Read,
    ) -> &mut dyn ArchiveWriter {
        self.inner.copy_entry(name, reader);
        self
    }

    fn attach_metadata(&mut self, name: &str, metadata: &Metadata) -> &mut dyn ArchiveWriter {
        self.inner.attach(name, metadata);
        self
    }

    fn finalize(&mut self) -> Result<SealedArchive, ArchiveError> {
        self.inner
            .finish()
            .map(|file| SealedArchive::File(file.into_temp_path()))
    }

    fn file_count(&self) -> usize {
        self.inner.file_count()
    }

    fn error(&self) -> Option<&ArchiveError> {
        self.inner.error.as_ref()
    }

    fn contains(&self, name: &str) -> bool {
        self.inner.names.contains(name)
    }
}

/// Writer that keeps the whole archive in memory. Handy in tests.
pub struct MemoryArchiveWriter {
    inner: StickyZip<Cursor<Vec<u8>>>,
}

impl MemoryArchiveWriter {
    pub fn new() -> Self {
        Self {
            inner: StickyZip::new(Cursor::new(Vec::new())),
        }
    }
}

impl Default for MemoryArchiveWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl ArchiveWriter for MemoryArchiveWriter {
    fn open_file(&mut self, name: &str) -> EntryWriter<'_> {
        self.inner.open(name)
    }

    fn add_file(&mut self, name: &str, data: &[u8]) -> &mut dyn ArchiveWriter {
        self.inner.write_entry(name, true, data);
        self
    }

    fn add_file_from_reader(
        &mut self,
        name: &str,
        reader: &mut dyn Read,
    ) -> &mut dyn ArchiveWriter {
        self.inner.copy_entry(name, reader);
        self
    }

    fn attach_metadata(&mut self, name: &str, metadata: &Metadata) -> &mut dyn ArchiveWriter {
        self.inner.attach(name, metadata);
        self
    }

    fn finalize(&mut self) -> Result<SealedArchive, ArchiveError> {
        self.inner
            .finish()
            .map(|cursor| SealedArchive::Memory(cursor.into_inner()))
    }

    fn file_count(&self) -> usize {
        self.inner.file_count()
    }

    fn error(&self) -> Option<&ArchiveError> {
        self.inner.error.as_ref()
    }

    fn contains(&self, name: &str) -> bool {
        self.inner.names.contains(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::ArchiveReader;

    fn tags(value: &str) -> Metadata {
        Metadata::from([("tags".to_string(), value.to_string())])
    }

    fn read_back(sealed: SealedArchive) -> ArchiveReader<Cursor<Vec<u8>>> {
        ArchiveReader::from_bytes(sealed.into_bytes().unwrap()).unwrap()
    }

    #[test]
    fn test_memory_roundtrip_with_metadata() {
        let mut w = MemoryArchiveWriter::new();
        w.add_file("a.png", b"aaa")
            .add_file("b.pdf", b"bbbb")
            .attach_metadata("b.pdf", &tags("x,y"));
        assert_eq!(w.file_count(), 2);

        let mut r = read_back(w.finalize().unwrap());
        assert_eq!(r.file_names(), ["a.png", "b.pdf"]);

        let a = r.get_file("a.png").unwrap();
        assert_eq!(a.bytes(), b"aaa");
        assert!(a.metadata().is_empty());
        assert_eq!(a.info().size, 3);

        let b = r.get_file("b.pdf").unwrap();
        assert_eq!(b.bytes(), b"bbbb");
        assert_eq!(b.metadata(), &tags("x,y"));
    }

    #[test]
    fn test_fs_backend_writes_into_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = FsArchiveWriter::create_in(dir.path());
        w.add_file("page.png", &[1, 2, 3]);
        let sealed = w.finalize().unwrap();
        let path = sealed.path().unwrap().to_path_buf();
        assert_eq!(path.parent(), Some(dir.path()));
        let mut r = read_back(sealed);
        assert_eq!(r.get_file("page.png").unwrap().bytes(), &[1, 2, 3]);
    }

    #[test]
    fn test_duplicate_name_is_sticky() {
        let mut w = MemoryArchiveWriter::new();
        w.add_file("a", b"1").add_file("a", b"2").add_file("b", b"3");
        assert_eq!(w.error(), Some(&ArchiveError::DuplicateName("a".into())));
        assert_eq!(w.file_count(), 0);
        assert!(!w.contains("b"));

        // Everything after the failure is ignored, and finalize keeps
        // returning the original error.
        w.attach_metadata("a", &tags("t"));
        let mut sink = w.open_file("c");
        sink.write_all(b"ignored").unwrap();
        drop(sink);
        assert_eq!(
            w.finalize().unwrap_err(),
            ArchiveError::DuplicateName("a".into())
        );
        assert_eq!(
            w.finalize().unwrap_err(),
            ArchiveError::DuplicateName("a".into())
        );
    }

    #[test]
    fn test_open_file_streams_bytes() {
        let mut w = MemoryArchiveWriter::new();
        {
            let mut entry = w.open_file("stream.txt");
            entry.write_all(b"hello ").unwrap();
            entry.write_all(b"world").unwrap();
        }
        let mut r = read_back(w.finalize().unwrap());
        assert_eq!(r.get_file("stream.txt").unwrap().bytes(), b"hello world");
    }

    #[test]
    fn test_add_from_reader_drains_source() {
        let mut src = Cursor::new(vec![7u8; 10_000]);
        let mut w = MemoryArchiveWriter::new();
        w.add_file_from_reader("big.bin", &mut src);
        assert_eq!(src.position(), 10_000);
        let mut r = read_back(w.finalize().unwrap());
        assert_eq!(r.get_file("big.bin").unwrap().bytes().len(), 10_000);
    }

    #[test]
    fn test_empty_metadata_is_noop() {
        let mut w = MemoryArchiveWriter::new();
        w.add_file("a", b"1").attach_metadata("a", &Metadata::new());
        assert!(w.error().is_none());
        assert!(!w.contains(&metadata_entry_name("a")));
    }

    #[test]
    fn test_metadata_requires_existing_entry() {
        let mut w = MemoryArchiveWriter::new();
        w.attach_metadata("missing", &tags("t"));
        assert_eq!(w.error(), Some(&ArchiveError::OrphanMetadata("missing".into())));
    }

    #[test]
    fn test_content_cannot_use_metadata_prefix() {
        let mut w = MemoryArchiveWriter::new();
        w.add_file(".metadata.x", b"{}");
        assert!(matches!(w.error(), Some(ArchiveError::ReservedName(_))));
    }

    #[test]
    fn test_file_count_ignores_metadata() {
        let mut w = MemoryArchiveWriter::new();
        w.add_file("a", b"1").attach_metadata("a", &tags("t"));
        assert_eq!(w.file_count(), 1);
    }

    #[test]
    fn test_double_finalize_fails() {
        let mut w = MemoryArchiveWriter::new();
        w.add_file("a", b"1");
        assert!(w.finalize().is_ok());
        assert_eq!(w.finalize().unwrap_err(), ArchiveError::AlreadyFinalized);
    }

    #[test]
    fn test_empty_archive_finalizes() {
        let mut w = MemoryArchiveWriter::new();
        assert_eq!(w.file_count(), 0);
        let r = read_back(w.finalize().unwrap());
        assert!(r.is_empty());
    }

    #[test]
    fn test_unwritable_dir_surfaces_at_finalize() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("does-not-exist");
        let mut w = FsArchiveWriter::create_in(&missing);
        w.add_file("a", b"1");
        assert_eq!(w.file_count(), 0);
        assert!(matches!(w.finalize(), Err(ArchiveError::Io(_))));
    }
}
