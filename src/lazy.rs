//! Lazy, cache-on-first-access record decoding.
//!
//! A [`LazyRecord`] is a map-like view over one decoded record line: an
//! explicit two-tier map of raw stored entries and a decoded-value cache
//! behind a single lookup API. The first access of logical key `K` resolves
//! the stored (possibly extension-suffixed) key, runs the decode chain once,
//! caches the plain value under `K`, and drops the now-redundant suffixed
//! entry. Iteration follows the insertion order of logical keys.

use crate::error::{Result, ShardsetError};
use crate::format::{self, Transform};
use crate::transcode::{self, DecodeCtx};
use crate::value::{Record, Value};
use indexmap::IndexMap;
use serde_json::Value as JsonValue;

#[derive(Debug, Clone)]
enum Slot {
    /// Still in wire form, under its stored (suffixed) key.
    Raw(JsonValue),
    /// Decoded and cached, under its logical key.
    Ready(Value),
}

/// A lazily-decoded record.
#[derive(Debug, Clone)]
pub struct LazyRecord {
    slots: IndexMap<String, Slot>,
    ctx: DecodeCtx,
}

impl LazyRecord {
    pub(crate) fn from_wire(
        wire: serde_json::Map<String, JsonValue>,
        ctx: DecodeCtx,
    ) -> Self {
        let slots = wire.into_iter().map(|(k, v)| (k, Slot::Raw(v))).collect();
        Self { slots, ctx }
    }

    /// Number of logical fields.
    pub fn len(&self) -> usize {
        self.keys().len()
    }

    /// True if the record has no fields.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Logical field names in insertion order.
    pub fn keys(&self) -> Vec<String> {
        let mut keys = Vec::with_capacity(self.slots.len());
        for stored in self.slots.keys() {
            let (logical, _) = format::split_key(stored, &self.ctx.ext_sep);
            if !keys.iter().any(|k| k == logical) {
                keys.push(logical.to_owned());
            }
        }
        keys
    }

    /// Whether the record has a field with this logical name.
    pub fn contains_key(&self, key: &str) -> bool {
        self.slots.keys().any(|stored| {
            format::split_key(stored, &self.ctx.ext_sep).0 == key
        })
    }

    /// Looks up logical key `key`, decoding and caching it on first access.
    ///
    /// Returns `Ok(None)` if the record has no such field.
    pub fn get(&mut self, key: &str) -> Result<Option<&Value>> {
        if !matches!(self.slots.get(key), Some(Slot::Ready(_))) {
            let resolved = self.resolve(key)?;
            if !resolved {
                return Ok(None);
            }
        }
        match self.slots.get(key) {
            Some(Slot::Ready(value)) => Ok(Some(value)),
            _ => Ok(None),
        }
    }

    /// Decodes the stored entry for `key` and replaces it (plus any other
    /// suffixed aliases) with the cached plain value. Returns false if no
    /// stored key resolves to `key`.
    fn resolve(&mut self, key: &str) -> Result<bool> {
        let matches: Vec<usize> = self
            .slots
            .keys()
            .enumerate()
            .filter(|(_, stored)| format::split_key(stored, &self.ctx.ext_sep).0 == key)
            .map(|(i, _)| i)
            .collect();
        let Some(&first) = matches.first() else {
            return Ok(false);
        };

        let (stored_key, slot) = self
            .slots
            .get_index(first)
            .map(|(k, v)| (k.clone(), v.clone()))
            .ok_or_else(|| ShardsetError::Format("lazy slot vanished".into()))?;
        let value = match slot {
            Slot::Ready(value) => value,
            Slot::Raw(wire) => transcode::decode_entry(&stored_key, &wire, &self.ctx)?.1,
        };

        // Drop every alias, back to front so indices stay valid, then cache
        // at the original position to preserve iteration order.
        for &idx in matches.iter().rev() {
            self.slots.shift_remove_index(idx);
        }
        self.slots
            .shift_insert(first, key.to_owned(), Slot::Ready(value));
        Ok(true)
    }

    /// Forces every field, returning the record as a plain nested structure.
    pub fn materialize(&mut self) -> Result<Record> {
        let mut record = Record::with_capacity(self.slots.len());
        for key in self.keys() {
            let value = self.get(&key)?.cloned().ok_or_else(|| {
                ShardsetError::Format(format!("field '{key}' vanished during materialize"))
            })?;
            record.insert(key, value);
        }
        Ok(record)
    }

    /// Forces every field and consumes the wrapper.
    pub fn into_record(mut self) -> Result<Record> {
        self.materialize()
    }

    /// Captures the record in a re-encodable form for writing into another
    /// shard without forcing a full decode of untouched payloads.
    ///
    /// Top-level transcoded leaves keep their stored wire form (sidecar-
    /// backed payloads are pulled as raw bytes so the destination can copy
    /// them verbatim); everything else is decoded to plain values.
    pub fn eagerize(&self) -> Result<EagerRecord> {
        let mut entries = Vec::with_capacity(self.slots.len());
        for (stored_key, slot) in &self.slots {
            let (logical, parts) = format::split_key(stored_key, &self.ctx.ext_sep);
            match slot {
                Slot::Ready(value) => entries.push(EagerEntry::Plain {
                    key: stored_key.clone(),
                    value: value.clone(),
                }),
                Slot::Raw(wire) if parts.is_empty() => entries.push(EagerEntry::Plain {
                    key: logical.to_owned(),
                    value: transcode::decode_tree(stored_key, wire, &self.ctx)?,
                }),
                Slot::Raw(wire) => {
                    let chain =
                        format::parse_transforms(stored_key, &parts, &self.ctx.registry)?;
                    let payload = if matches!(chain.last(), Some(Transform::Sidecar)) {
                        let reference = format::SidecarRef::from_json(stored_key, wire)?;
                        let mut sidecar = self
                            .ctx
                            .sidecar
                            .lock()
                            .unwrap_or_else(|poisoned| poisoned.into_inner());
                        Some(sidecar.read(stored_key, reference)?)
                    } else {
                        None
                    };
                    entries.push(EagerEntry::Stored {
                        logical: logical.to_owned(),
                        chain,
                        wire: wire.clone(),
                        payload,
                    });
                }
            }
        }
        Ok(EagerRecord {
            entries,
            encoding: self.ctx.encoding,
        })
    }
}

/// A record captured by [`LazyRecord::eagerize`] for rewriting into a new
/// shard.
#[derive(Debug, Clone)]
pub struct EagerRecord {
    pub(crate) entries: Vec<EagerEntry>,
    /// Text encoding the stored entries were written under.
    pub(crate) encoding: crate::encoding::Encoding,
}

impl EagerRecord {
    /// Number of fields.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if the record has no fields.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone)]
pub(crate) enum EagerEntry {
    /// A plain decoded field.
    Plain { key: String, value: Value },
    /// A still-encoded top-level leaf: its transform chain, its stored wire
    /// value, and (for sidecar-backed leaves) the raw sidecar bytes.
    Stored {
        logical: String,
        chain: Vec<Transform>,
        wire: JsonValue,
        payload: Option<Vec<u8>>,
    },
}
