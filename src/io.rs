//! Low-level I/O: body line appends and the sidecar companion file.
//!
//! The body writer appends newline-terminated lines and tracks the current
//! byte offset so the shard writer can build its offset index without ever
//! seeking. The sidecar holds raw byte payloads that are too large to embed
//! as text; it is opened lazily on first overflow, written append-only, and
//! lives exactly as long as its shard.

use crate::error::{Result, ShardsetError};
use crate::format::SidecarRef;
use std::fs::File;
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// A buffered writer that appends lines to a file and tracks the current
/// offset.
#[derive(Debug)]
pub(crate) struct BodyWriter {
    writer: BufWriter<File>,
    current_offset: u64,
}

impl BodyWriter {
    /// Creates the body file, truncating any existing content.
    pub(crate) fn create(path: &Path) -> Result<Self> {
        let file = File::create(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            current_offset: 0,
        })
    }

    /// Appends `line` plus a terminating newline. Returns the offset at
    /// which the line started.
    pub(crate) fn write_line(&mut self, line: &[u8]) -> Result<u64> {
        let start_offset = self.current_offset;
        self.writer.write_all(line)?;
        self.writer.write_all(b"\n")?;
        self.current_offset += line.len() as u64 + 1;
        Ok(start_offset)
    }

    /// The current file cursor position (total bytes written).
    pub(crate) fn current_offset(&self) -> u64 {
        self.current_offset
    }

    /// Flushes buffered bytes to disk.
    pub(crate) fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Append-only writer for the sidecar file, opened lazily on first use.
#[derive(Debug)]
pub(crate) struct SidecarWriter {
    path: PathBuf,
    file: Option<BufWriter<File>>,
    offset: u64,
}

impl SidecarWriter {
    pub(crate) fn new(path: PathBuf) -> Self {
        Self {
            path,
            file: None,
            offset: 0,
        }
    }

    /// Appends a payload, creating the sidecar file if this is the first
    /// overflow, and returns its offset/length reference.
    pub(crate) fn append(&mut self, data: &[u8]) -> Result<SidecarRef> {
        if self.file.is_none() {
            log::debug!("creating sidecar file {}", self.path.display());
            self.file = Some(BufWriter::new(File::create(&self.path)?));
        }
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| ShardsetError::Format("sidecar writer not open".into()))?;
        file.write_all(data)?;
        let reference = SidecarRef {
            offset: self.offset,
            length: data.len() as u64,
        };
        self.offset += data.len() as u64;
        Ok(reference)
    }

    /// True once at least one payload has been written.
    pub(crate) fn is_open(&self) -> bool {
        self.file.is_some()
    }

    /// Flushes and closes the sidecar file, if it was ever opened.
    pub(crate) fn finish(&mut self) -> Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush()?;
        }
        Ok(())
    }
}

/// Lazily-opened read handle for a sidecar file.
///
/// Shared between a reader and the lazy records it hands out; each access
/// seeks explicitly, so interleaved reads never corrupt one another's
/// position.
#[derive(Debug)]
pub(crate) struct SidecarReader {
    path: PathBuf,
    file: Option<File>,
}

impl SidecarReader {
    pub(crate) fn new(path: PathBuf) -> Self {
        Self { path, file: None }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the payload behind `reference`, opening the file on first use.
    pub(crate) fn read(&mut self, key: &str, reference: SidecarRef) -> Result<Vec<u8>> {
        if self.file.is_none() {
            let file = File::open(&self.path).map_err(|e| {
                ShardsetError::Format(format!(
                    "cannot open sidecar '{}' for key '{key}': {e}",
                    self.path.display()
                ))
            })?;
            self.file = Some(file);
        }
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| ShardsetError::Format("sidecar reader not open".into()))?;
        file.seek(SeekFrom::Start(reference.offset))?;
        let mut buf = vec![0u8; reference.length as usize];
        file.read_exact(&mut buf).map_err(|e| {
            ShardsetError::Format(format!(
                "sidecar read of {} bytes at offset {} failed for key '{key}': {e}",
                reference.length, reference.offset
            ))
        })?;
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_writer_tracks_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("body");
        let mut writer = BodyWriter::create(&path).unwrap();
        assert_eq!(writer.write_line(b"abc").unwrap(), 0);
        assert_eq!(writer.write_line(b"defgh").unwrap(), 4);
        assert_eq!(writer.current_offset(), 10);
        writer.flush().unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"abc\ndefgh\n");
    }

    #[test]
    fn sidecar_round_trip_is_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shard.binx");
        let mut writer = SidecarWriter::new(path.clone());
        assert!(!writer.is_open());
        let a = writer.append(&[1u8; 100]).unwrap();
        let b = writer.append(b"tail").unwrap();
        writer.finish().unwrap();
        assert_eq!(a, SidecarRef { offset: 0, length: 100 });
        assert_eq!(b, SidecarRef { offset: 100, length: 4 });

        let mut reader = SidecarReader::new(path);
        assert_eq!(reader.read("k", b).unwrap(), b"tail");
        assert_eq!(reader.read("k", a).unwrap(), vec![1u8; 100]);
    }

    #[test]
    fn sidecar_never_created_without_payloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shard.binx");
        let mut writer = SidecarWriter::new(path.clone());
        writer.finish().unwrap();
        assert!(!path.exists());

        let mut reader = SidecarReader::new(path);
        let err = reader
            .read("k", SidecarRef { offset: 0, length: 1 })
            .unwrap_err();
        assert!(matches!(err, ShardsetError::Format(_)));
    }
}
