//! The shard read engine.
//!
//! Opening a shard seeks near the end of the file, scans backward for the
//! last newline-delimited line, parses it as the footer offset, and parses
//! the footer object found there. The offset index is then materialized from
//! its self-describing `index.<exts>` key: a sidecar-backed index is
//! memory-mapped in place with no decode step, while an inline index is
//! text-decoded, decompressed, and held in memory or in a temporary
//! memory-mapped file.
//!
//! Records are fetched by random access (`get`) or sequential iteration;
//! every access seeks explicitly, so interleaving random and sequential
//! reads over one reader never corrupts the handle's position.

use crate::codec::CodecRegistry;
use crate::encoding::Encoding;
use crate::error::{Result, ShardsetError};
use crate::format::{self, Footer, SidecarRef, Transform, TypeTag, SIDECAR_EXT};
use crate::io::SidecarReader;
use crate::lazy::LazyRecord;
use crate::transcode::{self, DecodeCtx};
use crate::value::Record;
use memmap2::Mmap;
use serde_json::{Map as JsonMap, Value as JsonValue};
use std::fs::File;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Initial tail window for locating the footer-offset line. The three
/// trailing lines are small in the common case; the window grows if no
/// newline is found.
const TAIL_WINDOW: u64 = 64;

/// Options controlling how a shard (or dataset) is opened for reading.
#[derive(Debug, Clone, Default)]
pub struct ReaderOptions {
    /// Only expose records if the shard was written with this split name; a
    /// mismatch makes the shard report zero records.
    pub split: Option<String>,
    /// Memory-map the shard body instead of reading through a file handle.
    /// Preferred for datasets larger than RAM.
    pub mmap: bool,
    /// Encoding override for shards whose footers predate the policy fields.
    pub encoding: Option<Encoding>,
}

#[derive(Debug)]
enum Source {
    File(Mutex<File>),
    Mmap(Arc<Mmap>),
}

#[derive(Debug)]
enum OffsetIndex {
    InMemory(Vec<u64>),
    Mapped {
        map: Mmap,
        start: usize,
        count: usize,
        _backing: Option<File>,
    },
}

impl OffsetIndex {
    fn len(&self) -> usize {
        match self {
            Self::InMemory(v) => v.len(),
            Self::Mapped { count, .. } => *count,
        }
    }

    fn get(&self, i: usize) -> Option<u64> {
        match self {
            Self::InMemory(v) => v.get(i).copied(),
            Self::Mapped { map, start, count, .. } => {
                if i >= *count {
                    return None;
                }
                let at = start + i * 8;
                map.get(at..at + 8)
                    .map(|b| u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
            }
        }
    }
}

/// Reads one shard file, exposing random access and sequential iteration
/// with lazy per-field decoding.
#[derive(Debug)]
pub struct ShardReader {
    path: PathBuf,
    source: Source,
    footer: Footer,
    offsets: OffsetIndex,
    num_samples: usize,
    ctx: DecodeCtx,
}

impl ShardReader {
    /// Opens a shard with default options (file-handle mode, no split
    /// filter).
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with(path, &ReaderOptions::default())
    }

    /// Opens a shard.
    ///
    /// # Errors
    /// Returns [`ShardsetError::Format`] if the footer or offset index
    /// cannot be located or parsed.
    pub fn open_with<P: AsRef<Path>>(path: P, options: &ReaderOptions) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = File::open(&path)?;
        let file_len = file.metadata()?.len();
        if file_len == 0 {
            return Err(ShardsetError::Format(format!(
                "empty shard file '{}'",
                path.display()
            )));
        }

        let footer_offset = read_footer_offset(&mut file, file_len)?;
        if footer_offset >= file_len {
            return Err(ShardsetError::Format(format!(
                "footer offset {footer_offset} past end of '{}'",
                path.display()
            )));
        }
        let footer_line = read_line_at(&mut file, footer_offset)?;
        let footer_json: JsonValue = serde_json::from_slice(&footer_line).map_err(|e| {
            ShardsetError::Format(format!("unparsable footer in '{}': {e}", path.display()))
        })?;
        let footer_obj = footer_json.as_object().ok_or_else(|| {
            ShardsetError::Format(format!("footer in '{}' is not an object", path.display()))
        })?;
        let footer = Footer::from_json(footer_obj, options.encoding)?;

        let registry = Arc::new(CodecRegistry::new());
        let sidecar_path = path.with_extension(SIDECAR_EXT);
        let offsets = resolve_index(&footer, &registry, &sidecar_path, options.mmap, file_len)?;

        let num_samples = if options.split.is_some() && footer.split != options.split {
            0
        } else {
            footer.num_samples as usize
        };
        if offsets.len() < num_samples {
            return Err(ShardsetError::Format(format!(
                "index holds {} offsets for {} records in '{}'",
                offsets.len(),
                num_samples,
                path.display()
            )));
        }

        let source = if options.mmap {
            // Safety: the shard is read-only for its remaining lifetime by
            // the single-writer contract; we accept the usual mmap caveat
            // about external modification.
            #[allow(unsafe_code)]
            let map = unsafe { Mmap::map(&file)? };
            Source::Mmap(Arc::new(map))
        } else {
            Source::File(Mutex::new(file))
        };

        let ctx = DecodeCtx {
            encoding: footer.encoding,
            ext_sep: footer.ext_sep.clone(),
            registry,
            sidecar: Arc::new(Mutex::new(SidecarReader::new(sidecar_path))),
        };

        log::debug!(
            "opened shard {} ({} records)",
            path.display(),
            num_samples
        );
        Ok(Self {
            path,
            source,
            footer,
            offsets,
            num_samples,
            ctx,
        })
    }

    /// Number of readable records (zero on a split mismatch).
    pub fn len(&self) -> usize {
        self.num_samples
    }

    /// True if the shard exposes no records.
    pub fn is_empty(&self) -> bool {
        self.num_samples == 0
    }

    /// The parsed footer.
    pub fn footer(&self) -> &Footer {
        &self.footer
    }

    /// File name of the previous shard in the chain, if any.
    pub fn shard_prev(&self) -> Option<&str> {
        self.footer.shard_prev.as_deref()
    }

    /// File name of the next shard in the chain, if any.
    pub fn shard_next(&self) -> Option<&str> {
        self.footer.shard_next.as_deref()
    }

    /// The shard file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Random access: returns record `index` as a lazily-decoded record.
    pub fn get(&self, index: usize) -> Result<LazyRecord> {
        let wire = self.wire_record(index)?;
        Ok(LazyRecord::from_wire(wire, self.ctx.clone()))
    }

    /// Random access with every field decoded up front.
    pub fn get_eager(&self, index: usize) -> Result<Record> {
        let wire = self.wire_record(index)?;
        transcode::decode_record(&wire, &self.ctx)
    }

    /// Sequential iteration in record order.
    pub fn iter(&self) -> RecordIter<'_> {
        RecordIter {
            reader: self,
            index: 0,
            file_pos: None,
        }
    }

    /// Releases the shard's file handles.
    pub fn close(self) {}

    fn wire_record(&self, index: usize) -> Result<JsonMap<String, JsonValue>> {
        let bytes = self.record_bytes(index)?;
        parse_wire(&bytes, index)
    }

    fn record_bytes(&self, index: usize) -> Result<Vec<u8>> {
        if index >= self.num_samples {
            return Err(ShardsetError::Bounds {
                index,
                len: self.num_samples,
            });
        }
        let begin = self.offset_at(index)?;
        match &self.source {
            Source::Mmap(map) => {
                let end = if index + 1 < self.offsets.len() {
                    self.offset_at(index + 1)?
                } else {
                    // Index written without the final fence: scan to the
                    // next newline.
                    let from = begin as usize;
                    let rel = map
                        .get(from..)
                        .and_then(|tail| tail.iter().position(|&b| b == b'\n'))
                        .ok_or_else(|| {
                            ShardsetError::Format(format!(
                                "record {index} has no line terminator"
                            ))
                        })?;
                    begin + rel as u64 + 1
                };
                if begin > end || end as usize > map.len() {
                    return Err(ShardsetError::Format(format!(
                        "record {index} offsets {begin}..{end} past end of shard"
                    )));
                }
                map.get(begin as usize..end as usize)
                    .map(<[u8]>::to_vec)
                    .ok_or_else(|| {
                        ShardsetError::Format(format!("record {index} out of mapped range"))
                    })
            }
            Source::File(file) => {
                let mut file = file.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                read_line_at(&mut file, begin)
            }
        }
    }

    fn offset_at(&self, index: usize) -> Result<u64> {
        self.offsets.get(index).ok_or_else(|| {
            ShardsetError::Format(format!("missing index entry {index}"))
        })
    }
}

impl crate::Dataset for ShardReader {
    type Item = LazyRecord;

    fn len(&self) -> usize {
        self.num_samples
    }

    fn get(&self, index: usize) -> Result<LazyRecord> {
        ShardReader::get(self, index)
    }
}

/// Sequential record iterator. In file-handle mode it carries its own
/// position cursor and seeks per record, so it never permanently moves the
/// shared handle for interleaved random access.
#[derive(Debug)]
pub struct RecordIter<'a> {
    reader: &'a ShardReader,
    index: usize,
    file_pos: Option<u64>,
}

impl Iterator for RecordIter<'_> {
    type Item = Result<LazyRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.index >= self.reader.len() {
            return None;
        }
        let result = match &self.reader.source {
            Source::Mmap(_) => self.reader.get(self.index),
            Source::File(file) => self.next_from_file(file),
        };
        self.index += 1;
        Some(result)
    }
}

impl RecordIter<'_> {
    fn next_from_file(&mut self, file: &Mutex<File>) -> Result<LazyRecord> {
        let pos = match self.file_pos {
            Some(pos) => pos,
            None => self.reader.offset_at(0)?,
        };
        let mut guard = file.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.seek(SeekFrom::Start(pos))?;
        let mut line = Vec::new();
        BufReader::new(&mut *guard).read_until(b'\n', &mut line)?;
        drop(guard);
        if line.is_empty() {
            return Err(ShardsetError::Format(format!(
                "unexpected end of shard body at record {}",
                self.index
            )));
        }
        self.file_pos = Some(pos + line.len() as u64);
        let wire = parse_wire(&line, self.index)?;
        Ok(LazyRecord::from_wire(wire, self.reader.ctx.clone()))
    }
}

fn parse_wire(bytes: &[u8], index: usize) -> Result<JsonMap<String, JsonValue>> {
    let parsed: JsonValue = serde_json::from_slice(bytes)
        .map_err(|e| ShardsetError::Format(format!("unparsable record {index}: {e}")))?;
    match parsed {
        JsonValue::Object(map) => Ok(map),
        _ => Err(ShardsetError::Format(format!(
            "record {index} is not an object"
        ))),
    }
}

/// Locates the footer by reading a fixed-size tail and scanning backward for
/// the last newline-delimited line, growing the window only if no newline is
/// found.
fn read_footer_offset(file: &mut File, file_len: u64) -> Result<u64> {
    let mut window = TAIL_WINDOW;
    loop {
        let start = file_len.saturating_sub(window);
        file.seek(SeekFrom::Start(start))?;
        let mut buf = Vec::with_capacity((file_len - start) as usize);
        file.read_to_end(&mut buf)?;

        let content_end = buf
            .iter()
            .rposition(|&b| !b.is_ascii_whitespace())
            .map(|p| p + 1);
        let Some(content_end) = content_end else {
            if start == 0 {
                return Err(ShardsetError::Format("missing footer offset line".into()));
            }
            window *= 4;
            continue;
        };
        let tail = &buf[..content_end];
        if let Some(pos) = tail.iter().rposition(|&b| b == b'\n') {
            return parse_offset_line(&tail[pos + 1..]);
        }
        if start == 0 {
            return parse_offset_line(tail);
        }
        window *= 4;
    }
}

fn parse_offset_line(bytes: &[u8]) -> Result<u64> {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .ok_or_else(|| ShardsetError::Format("unparsable footer offset line".into()))
}

fn read_line_at(file: &mut File, offset: u64) -> Result<Vec<u8>> {
    file.seek(SeekFrom::Start(offset))?;
    let mut line = Vec::new();
    BufReader::new(file).read_until(b'\n', &mut line)?;
    Ok(line)
}

/// Materializes the offset index from its footer location.
///
/// A sidecar-backed index (`...bin`) is mapped directly — sidecar storage is
/// used specifically to skip the decode step on this hot path. An inline
/// index is text-decoded and decompressed; the terminal `npy` stage of an
/// index denotes a bare little-endian `u64` buffer, not an NPY container.
fn resolve_index(
    footer: &Footer,
    registry: &Arc<CodecRegistry>,
    sidecar_path: &Path,
    mmap_mode: bool,
    file_len: u64,
) -> Result<OffsetIndex> {
    let parts = footer.index_extensions();
    let chain = format::parse_transforms(&footer.index_key, &parts, registry)?;

    if matches!(chain.last(), Some(Transform::Sidecar)) {
        if chain.iter().any(|t| matches!(t, Transform::Compress(_))) {
            return Err(ShardsetError::Format(
                "compressed sidecar-backed index is not supported".into(),
            ));
        }
        let reference = SidecarRef::from_json(&footer.index_key, &footer.index_value)?;
        let file = File::open(sidecar_path).map_err(|e| {
            ShardsetError::Format(format!(
                "cannot open sidecar '{}' for index: {e}",
                sidecar_path.display()
            ))
        })?;
        // Safety: same single-writer contract as the body map.
        #[allow(unsafe_code)]
        let map = unsafe { Mmap::map(&file)? };
        let start = reference.offset as usize;
        let length = reference.length as usize;
        if start + length > map.len() || length % 8 != 0 {
            return Err(ShardsetError::Format(format!(
                "sidecar index region {start}..{} invalid for sidecar of {} bytes",
                start + length,
                map.len()
            )));
        }
        return validated(
            OffsetIndex::Mapped {
                map,
                start,
                count: length / 8,
                _backing: Some(file),
            },
            file_len,
        );
    }

    let text = footer.index_value.as_str().ok_or_else(|| {
        ShardsetError::Format(format!(
            "expected encoded string for key '{}'",
            footer.index_key
        ))
    })?;
    let mut data = footer.encoding.decode(text)?;
    for transform in chain.iter().rev() {
        match transform {
            Transform::Compress(ext) => {
                data = registry.get(ext)?.decompress(&data).map_err(|e| {
                    ShardsetError::Codec(format!("{e} for key '{}'", footer.index_key))
                })?;
            }
            Transform::Type(TypeTag::Npy) => break,
            _ => {
                return Err(ShardsetError::Format(format!(
                    "unsupported index extension chain '{}'",
                    footer.index_key
                )));
            }
        }
    }
    if data.len() % 8 != 0 {
        return Err(ShardsetError::Format(format!(
            "index buffer of {} bytes is not a u64 array",
            data.len()
        )));
    }

    let index = if mmap_mode {
        let mut tmp = tempfile::tempfile()?;
        tmp.write_all(&data)?;
        tmp.flush()?;
        // Safety: the temporary file is owned by this process alone.
        #[allow(unsafe_code)]
        let map = unsafe { Mmap::map(&tmp)? };
        OffsetIndex::Mapped {
            map,
            start: 0,
            count: data.len() / 8,
            _backing: Some(tmp),
        }
    } else {
        OffsetIndex::InMemory(
            data.chunks_exact(8)
                .map(|b| u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
                .collect(),
        )
    };
    validated(index, file_len)
}

fn validated(index: OffsetIndex, file_len: u64) -> Result<OffsetIndex> {
    let count = index.len();
    if count > 0 {
        let first = index.get(0).unwrap_or(u64::MAX);
        let last = index.get(count - 1).unwrap_or(u64::MAX);
        if first > last || last > file_len {
            return Err(ShardsetError::Format(format!(
                "index offsets {first}..{last} exceed shard of {file_len} bytes"
            )));
        }
    }
    Ok(index)
}
