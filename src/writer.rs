//! The shard write engine.
//!
//! A [`ShardWriter`] appends transcoded records to the shard body one line at
//! a time, tracking each record's starting offset. Closing the shard pushes
//! the final body length onto the index, transcodes the index itself through
//! the same policy machinery as field values, and emits the footer line plus
//! the trailing footer-offset line. A shard file is structurally valid only
//! once [`ShardWriter::close`] completes; a crash mid-write leaves an invalid
//! file with no recovery attempted.

use crate::codec::CodecRegistry;
use crate::error::{Result, ShardsetError};
use crate::format::{self, Footer, Transform, FORMAT_VERSION, SIDECAR_EXT};
use crate::io::{BodyWriter, SidecarWriter};
use crate::lazy::{EagerEntry, EagerRecord};
use crate::transcode::{self, TranscodePolicy};
use crate::value::Record;
use serde_json::{Map as JsonMap, Value as JsonValue};
use std::hash::Hasher as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use twox_hash::XxHash64;

/// Configuration for a shard (or dataset) writer.
#[derive(Debug, Clone)]
pub struct WriterOptions {
    /// Field transcoding policy.
    pub policy: TranscodePolicy,
    /// Compression codec extension for the offset index.
    pub index_compression: Option<String>,
    /// Compute an XxHash64 content hash over the body and store it in the
    /// footer.
    pub hash: bool,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            policy: TranscodePolicy::default(),
            index_compression: Some("zst".to_owned()),
            hash: false,
        }
    }
}

/// Identity and linkage recorded in a shard's footer at close time.
#[derive(Debug, Clone, Default)]
pub struct ShardLabels {
    /// Position of this shard within its dataset.
    pub shard_id: u64,
    /// File name of the previous shard in the chain.
    pub shard_prev: Option<String>,
    /// File name of the next shard in the chain.
    pub shard_next: Option<String>,
    /// Optional split name.
    pub split: Option<String>,
    /// Optional dataset name.
    pub dataset_name: Option<String>,
    /// Caller-supplied content hash; takes precedence over the writer's own
    /// digest when [`WriterOptions::hash`] is enabled.
    pub hash: Option<String>,
}

/// Writes one shard file (and, on overflow, its sidecar).
#[derive(Debug)]
pub struct ShardWriter {
    path: PathBuf,
    body: BodyWriter,
    policy: TranscodePolicy,
    index_compression: Option<String>,
    registry: Arc<CodecRegistry>,
    offsets: Vec<u64>,
    sidecar: SidecarWriter,
    hasher: Option<XxHash64>,
}

impl ShardWriter {
    /// Creates a shard at `path` with default options.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::create_with(path, WriterOptions::default())
    }

    /// Creates a shard at `path`, truncating any existing file.
    pub fn create_with<P: AsRef<Path>>(path: P, options: WriterOptions) -> Result<Self> {
        let registry = Arc::new(CodecRegistry::new());
        let policy = options.policy.validated(&registry)?;
        let index_compression = match options.index_compression {
            Some(ext) if ext == "none" => None,
            Some(ext) if !registry.contains(&ext) => {
                return Err(ShardsetError::Policy(format!(
                    "index compression codec '{ext}' is not registered"
                )));
            }
            other => other,
        };
        let path = path.as_ref().to_path_buf();
        let body = BodyWriter::create(&path)?;
        let sidecar = SidecarWriter::new(path.with_extension(SIDECAR_EXT));
        log::debug!("opened shard {}", path.display());
        Ok(Self {
            path,
            body,
            policy,
            index_compression,
            registry,
            offsets: Vec::new(),
            sidecar,
            hasher: options.hash.then(|| XxHash64::with_seed(0)),
        })
    }

    /// Transcodes and appends one record as one body line.
    pub fn write(&mut self, record: &Record) -> Result<()> {
        let wire =
            transcode::encode_record(record, &self.policy, &self.registry, &mut self.sidecar)?;
        self.write_wire(&wire)
    }

    /// Appends a record captured from another shard, copying still-encoded
    /// payloads verbatim where this writer's policy permits.
    ///
    /// Sidecar-backed payloads are re-appended to this shard's sidecar
    /// byte-for-byte when the sidecar is enabled here; text-embedded payloads
    /// are carried verbatim when the encodings match and re-encoded without
    /// decompression otherwise. Everything else falls back to the ordinary
    /// decode-then-transcode path.
    pub fn write_eager(&mut self, record: &EagerRecord) -> Result<()> {
        let mut wire = JsonMap::with_capacity(record.entries.len());
        for entry in &record.entries {
            match entry {
                EagerEntry::Plain { key, value } => {
                    let (encoded, chain) = transcode::encode_tree(
                        key,
                        value,
                        &self.policy,
                        &self.registry,
                        &mut self.sidecar,
                    )?;
                    wire.insert(format::join_key(key, &chain, &self.policy.ext_sep), encoded);
                }
                EagerEntry::Stored {
                    logical,
                    chain,
                    wire: stored,
                    payload,
                } => {
                    let key = format::join_key(logical, chain, &self.policy.ext_sep);
                    match payload {
                        Some(bytes) if self.policy.binary_threshold.is_some() => {
                            let reference = self.sidecar.append(bytes)?;
                            wire.insert(key, reference.to_json());
                        }
                        Some(bytes) => {
                            // No sidecar here: decode and re-transcode.
                            let inner = &chain[..chain.len().saturating_sub(1)];
                            let value = transcode::decode_payload(
                                &key,
                                bytes.clone(),
                                inner,
                                &self.registry,
                            )?;
                            let (encoded, chain) = transcode::encode_tree(
                                logical,
                                &value,
                                &self.policy,
                                &self.registry,
                                &mut self.sidecar,
                            )?;
                            wire.insert(
                                format::join_key(logical, &chain, &self.policy.ext_sep),
                                encoded,
                            );
                        }
                        None if record.encoding == self.policy.encoding => {
                            wire.insert(key, stored.clone());
                        }
                        None => {
                            // Same compression stages, different text
                            // encoding: re-encode the bytes without touching
                            // the payload.
                            let text = stored.as_str().ok_or_else(|| {
                                ShardsetError::Format(format!(
                                    "expected encoded string for key '{key}'"
                                ))
                            })?;
                            let bytes = record.encoding.decode(text)?;
                            wire.insert(key, self.policy.encoding.encode(&bytes).into());
                        }
                    }
                }
            }
        }
        self.write_wire(&wire)
    }

    fn write_wire(&mut self, wire: &JsonMap<String, JsonValue>) -> Result<()> {
        let line = serde_json::to_string(wire)
            .map_err(|e| ShardsetError::Format(format!("record serialization failed: {e}")))?;
        self.offsets.push(self.body.current_offset());
        let _ = self.body.write_line(line.as_bytes())?;
        if let Some(hasher) = &mut self.hasher {
            hasher.write(line.as_bytes());
            hasher.write(b"\n");
        }
        Ok(())
    }

    /// Current body size in bytes, used by callers for size-based rollover.
    pub fn tell(&self) -> u64 {
        self.body.current_offset()
    }

    /// Number of records written so far.
    pub fn num_records(&self) -> usize {
        self.offsets.len()
    }

    /// The shard file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flushes the offset index, emits the footer and the trailing
    /// footer-offset line, and closes the shard and its sidecar.
    pub fn close(mut self, labels: &ShardLabels) -> Result<()> {
        // Final fence: N+1 entries serve both begin/end slicing and
        // line-start seeks.
        self.offsets.push(self.body.current_offset());

        let mut index_bytes = Vec::with_capacity(self.offsets.len() * 8);
        for offset in &self.offsets {
            index_bytes.extend_from_slice(&offset.to_le_bytes());
        }
        let (index_value, index_chain) = self.place_index(index_bytes)?;
        let index_key = format::join_key(format::INDEX_KEY, &index_chain, &self.policy.ext_sep);

        let footer = Footer {
            index_key,
            index_value,
            num_samples: self.offsets.len() as u64 - 1,
            shard_id: labels.shard_id,
            version: FORMAT_VERSION.to_owned(),
            shard_prev: labels.shard_prev.clone(),
            shard_next: labels.shard_next.clone(),
            split: labels.split.clone(),
            dataset_name: labels.dataset_name.clone(),
            hash: labels.hash.clone().or_else(|| {
                self.hasher
                    .take()
                    .map(|hasher| format!("{:016x}", hasher.finish()))
            }),
            encoding: self.policy.encoding,
            ext_sep: self.policy.ext_sep.clone(),
            compression: self.policy.compression.clone(),
            index_compression: self.index_compression.clone(),
            compress_threshold: self.policy.compress_threshold,
            compress_ratio: self.policy.compress_ratio,
            binary_threshold: self.policy.binary_threshold,
        };

        let footer_offset = self.body.current_offset();
        let footer_line = serde_json::to_string(&footer.to_json())
            .map_err(|e| ShardsetError::Format(format!("footer serialization failed: {e}")))?;
        self.body.write_line(footer_line.as_bytes())?;
        self.body.write_line(footer_offset.to_string().as_bytes())?;
        self.body.flush()?;
        self.sidecar.finish()?;
        log::debug!(
            "closed shard {} ({} records, footer at {})",
            self.path.display(),
            footer.num_samples,
            footer_offset
        );
        Ok(())
    }

    /// Places the serialized offset index per policy. A sidecar-placed index
    /// stays uncompressed so readers can map the region directly; otherwise
    /// the index is compressed under `index_compression` (when it pays off
    /// under the usual threshold and ratio gates) and text-encoded.
    fn place_index(&mut self, index_bytes: Vec<u8>) -> Result<(JsonValue, Vec<Transform>)> {
        let mut chain = vec![Transform::Type(format::TypeTag::Npy)];
        if let Some(threshold) = self.policy.binary_threshold
            && index_bytes.len() > threshold
        {
            let reference = self.sidecar.append(&index_bytes)?;
            chain.push(Transform::Sidecar);
            return Ok((reference.to_json(), chain));
        }
        let mut data = index_bytes;
        if let Some(ext) = &self.index_compression
            && data.len() >= self.policy.compress_threshold
        {
            let compressed = self.registry.get(ext)?.compress(&data)?;
            if (compressed.len() as f64) <= self.policy.compress_ratio * data.len() as f64 {
                data = compressed;
                chain.push(Transform::Compress(ext.clone()));
            }
        }
        Ok((self.policy.encoding.encode(&data).into(), chain))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    #[test]
    fn closed_shard_ends_with_footer_offset_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("one.sds");
        let mut writer = ShardWriter::create(&path).unwrap();
        let mut record = Record::new();
        record.insert("id".into(), Value::Int(1));
        writer.write(&record).unwrap();
        writer.close(&ShardLabels::default()).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let mut lines = contents.lines().rev();
        let offset: u64 = lines.next().unwrap().parse().unwrap();
        let footer_line = lines.next().unwrap();
        assert_eq!(
            contents.as_bytes()[offset as usize..]
                .split(|&b| b == b'\n')
                .next()
                .unwrap(),
            footer_line.as_bytes()
        );
        let footer: serde_json::Value = serde_json::from_str(footer_line).unwrap();
        assert_eq!(footer["num_samples"], 1);
        assert_eq!(footer["version"], "1.0");
    }

    #[test]
    fn tell_reports_body_growth() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = ShardWriter::create(dir.path().join("grow.sds")).unwrap();
        assert_eq!(writer.tell(), 0);
        let mut record = Record::new();
        record.insert("k".into(), Value::Int(1));
        writer.write(&record).unwrap();
        let after_one = writer.tell();
        assert!(after_one > 0);
        writer.write(&record).unwrap();
        assert_eq!(writer.tell(), after_one * 2);
        assert_eq!(writer.num_records(), 2);
    }

    #[test]
    fn hash_option_lands_in_footer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hashed.sds");
        let options = WriterOptions {
            hash: true,
            ..WriterOptions::default()
        };
        let mut writer = ShardWriter::create_with(&path, options).unwrap();
        let mut record = Record::new();
        record.insert("k".into(), Value::from("v"));
        writer.write(&record).unwrap();
        writer.close(&ShardLabels::default()).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let footer_line = contents.lines().rev().nth(1).unwrap();
        let footer: serde_json::Value = serde_json::from_str(footer_line).unwrap();
        let digest = footer["hash"].as_str().unwrap();
        assert_eq!(digest.len(), 16);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
