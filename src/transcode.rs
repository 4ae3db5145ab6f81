//! The per-field transcoder: serialize, maybe compress, encode or sidecar.
//!
//! For each scalar leaf the transcoder decides serialization form, whether to
//! compress, and where the bytes land (text-embedded in the record line or
//! offloaded to the sidecar), and records those decisions as a suffix chain
//! appended to the field's key. Numbers, booleans, nulls, and short strings
//! pass through untouched and untagged. Maps and lists are walked
//! recursively; only leaves transcode, container shape is preserved.
//!
//! Decoding reverses the chain right-to-left: fetch sidecar bytes or
//! text-decode, undo compression stages, then apply the innermost type tag
//! (or parse JSON when there is none).

use crate::codec::CodecRegistry;
use crate::encoding::Encoding;
use crate::error::{Result, ShardsetError};
use crate::format::{self, SidecarRef, Transform, TypeTag, DEFAULT_EXT_SEP};
use crate::io::{SidecarReader, SidecarWriter};
use crate::value::{Record, TypedArray, Value};
use serde_json::{Map as JsonMap, Value as JsonValue};
use std::sync::{Arc, Mutex};

/// The writer-side transcoding policy.
///
/// Stored verbatim in every shard footer so readers never need out-of-band
/// configuration.
#[derive(Debug, Clone)]
pub struct TranscodePolicy {
    /// Compression codec extension, or `None` to disable compression.
    pub compression: Option<String>,
    /// Minimum serialized size (bytes) at which compression is attempted.
    pub compress_threshold: usize,
    /// Keep the compressed form only if `compressed <= ratio * serialized`.
    /// Must lie in `(0, 1]`.
    pub compress_ratio: f64,
    /// Text encoding for byte payloads embedded in the record line.
    pub encoding: Encoding,
    /// Payloads larger than this move to the sidecar file; `None` disables
    /// the sidecar entirely.
    pub binary_threshold: Option<usize>,
    /// Key-extension separator.
    pub ext_sep: String,
}

impl Default for TranscodePolicy {
    fn default() -> Self {
        Self {
            compression: Some("zst".to_owned()),
            compress_threshold: 128,
            compress_ratio: 0.67,
            encoding: Encoding::A85,
            binary_threshold: None,
            ext_sep: DEFAULT_EXT_SEP.to_owned(),
        }
    }
}

impl TranscodePolicy {
    /// Validates option consistency and resolves the `"none"` codec alias.
    ///
    /// # Errors
    /// Returns [`ShardsetError::Policy`] for a ratio outside `(0, 1]`, an
    /// empty separator, or an unregistered compression codec.
    pub fn validated(mut self, registry: &CodecRegistry) -> Result<Self> {
        if !(self.compress_ratio > 0.0 && self.compress_ratio <= 1.0) {
            return Err(ShardsetError::Policy(format!(
                "compress_ratio {} outside (0, 1]",
                self.compress_ratio
            )));
        }
        if self.ext_sep.is_empty() {
            return Err(ShardsetError::Policy("ext_sep must be non-empty".into()));
        }
        if self.compression.as_deref() == Some("none") {
            self.compression = None;
        }
        if let Some(ext) = &self.compression
            && !registry.contains(ext)
        {
            return Err(ShardsetError::Policy(format!(
                "compression codec '{ext}' is not registered"
            )));
        }
        Ok(self)
    }
}

/// Transcodes one record into its wire (JSON object) form, appending
/// oversized payloads to `sidecar`.
pub(crate) fn encode_record(
    record: &Record,
    policy: &TranscodePolicy,
    registry: &CodecRegistry,
    sidecar: &mut SidecarWriter,
) -> Result<JsonMap<String, JsonValue>> {
    let mut wire = JsonMap::with_capacity(record.len());
    for (key, value) in record {
        let (encoded, chain) = encode_tree(key, value, policy, registry, sidecar)?;
        wire.insert(format::join_key(key, &chain, &policy.ext_sep), encoded);
    }
    Ok(wire)
}

pub(crate) fn encode_tree(
    key: &str,
    value: &Value,
    policy: &TranscodePolicy,
    registry: &CodecRegistry,
    sidecar: &mut SidecarWriter,
) -> Result<(JsonValue, Vec<Transform>)> {
    match value {
        Value::Map(record) => {
            let wire = encode_record(record, policy, registry, sidecar)?;
            Ok((JsonValue::Object(wire), Vec::new()))
        }
        Value::List(items) => {
            let mut wire = Vec::with_capacity(items.len());
            for item in items {
                let (encoded, chain) = encode_tree(key, item, policy, registry, sidecar)?;
                if chain.is_empty() {
                    wire.push(encoded);
                } else {
                    // A list position carries no key to suffix; wrap the leaf
                    // in a single-entry object whose key is the bare chain.
                    let mut wrapper = JsonMap::with_capacity(1);
                    wrapper.insert(format::join_key("", &chain, &policy.ext_sep), encoded);
                    wire.push(JsonValue::Object(wrapper));
                }
            }
            Ok((JsonValue::Array(wire), Vec::new()))
        }
        leaf => encode_leaf(key, leaf, policy, registry, sidecar),
    }
}

fn encode_leaf(
    key: &str,
    value: &Value,
    policy: &TranscodePolicy,
    registry: &CodecRegistry,
    sidecar: &mut SidecarWriter,
) -> Result<(JsonValue, Vec<Transform>)> {
    let (serialized, tag, original_text): (Vec<u8>, TypeTag, Option<&str>) = match value {
        Value::Null => return Ok((JsonValue::Null, Vec::new())),
        Value::Bool(b) => return Ok((JsonValue::from(*b), Vec::new())),
        Value::Int(n) => return Ok((JsonValue::from(*n), Vec::new())),
        Value::Float(f) => {
            let number = serde_json::Number::from_f64(*f).ok_or_else(|| {
                ShardsetError::Format(format!("non-finite float for key '{key}'"))
            })?;
            return Ok((JsonValue::Number(number), Vec::new()));
        }
        Value::Str(s) => {
            let short_limit = policy
                .compress_threshold
                .min(policy.binary_threshold.unwrap_or(usize::MAX));
            if s.len() < short_limit {
                return Ok((JsonValue::from(s.clone()), Vec::new()));
            }
            (s.as_bytes().to_vec(), TypeTag::Str, Some(s.as_str()))
        }
        Value::Bytes(b) => (b.clone(), TypeTag::Raw, None),
        Value::Array(a) => (a.to_npy(), TypeTag::Npy, None),
        Value::List(_) | Value::Map(_) => {
            return Err(ShardsetError::Format(format!(
                "container reached leaf transcoder for key '{key}'"
            )));
        }
    };

    let mut chain = vec![Transform::Type(tag)];
    let mut data = serialized;

    if let Some(ext) = &policy.compression
        && data.len() >= policy.compress_threshold
    {
        let compressed = registry.get(ext)?.compress(&data)?;
        if (compressed.len() as f64) <= policy.compress_ratio * data.len() as f64 {
            data = compressed;
            chain.push(Transform::Compress(ext.clone()));
        }
    }

    if let Some(threshold) = policy.binary_threshold
        && data.len() > threshold
    {
        let reference = sidecar.append(&data)?;
        chain.push(Transform::Sidecar);
        return Ok((reference.to_json(), chain));
    }

    // Uncompressed long strings stay plain text rather than being
    // double-encoded.
    if chain.len() == 1 && tag == TypeTag::Str {
        if let Some(text) = original_text {
            return Ok((JsonValue::from(text.to_owned()), Vec::new()));
        }
    }

    Ok((JsonValue::from(policy.encoding.encode(&data)), chain))
}

/// Everything a decoder needs besides the wire value itself: the footer's
/// declared encoding and separator, the codec registry, and the shared
/// sidecar handle.
#[derive(Debug, Clone)]
pub(crate) struct DecodeCtx {
    pub(crate) encoding: Encoding,
    pub(crate) ext_sep: String,
    pub(crate) registry: Arc<CodecRegistry>,
    pub(crate) sidecar: Arc<Mutex<SidecarReader>>,
}

impl DecodeCtx {
    fn read_sidecar(&self, key: &str, reference: SidecarRef) -> Result<Vec<u8>> {
        let mut sidecar = self
            .sidecar
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        sidecar.read(key, reference)
    }
}

/// Eagerly decodes a full wire record into logical form.
pub(crate) fn decode_record(
    wire: &JsonMap<String, JsonValue>,
    ctx: &DecodeCtx,
) -> Result<Record> {
    let mut record = Record::with_capacity(wire.len());
    for (stored_key, value) in wire {
        let (logical, decoded) = decode_entry(stored_key, value, ctx)?;
        record.insert(logical, decoded);
    }
    Ok(record)
}

/// Decodes one stored entry, returning the logical key and plain value.
pub(crate) fn decode_entry(
    stored_key: &str,
    wire: &JsonValue,
    ctx: &DecodeCtx,
) -> Result<(String, Value)> {
    let (logical, parts) = format::split_key(stored_key, &ctx.ext_sep);
    if parts.is_empty() {
        return Ok((logical.to_owned(), decode_tree(stored_key, wire, ctx)?));
    }
    let chain = format::parse_transforms(stored_key, &parts, &ctx.registry)?;
    let value = decode_chain(stored_key, wire, chain, ctx)?;
    Ok((logical.to_owned(), value))
}

/// Recursively decodes a wire value whose containers may hold suffixed keys.
pub(crate) fn decode_tree(key: &str, wire: &JsonValue, ctx: &DecodeCtx) -> Result<Value> {
    match wire {
        JsonValue::Object(obj) => {
            // Unwrap the single-entry chain wrapper produced for transcoded
            // leaves in list positions.
            if obj.len() == 1 {
                let (only_key, only_value) = obj
                    .iter()
                    .next()
                    .ok_or_else(|| ShardsetError::Format("empty wrapper object".into()))?;
                let (logical, parts) = format::split_key(only_key, &ctx.ext_sep);
                if logical.is_empty() && !parts.is_empty() {
                    let chain = format::parse_transforms(only_key, &parts, &ctx.registry)?;
                    return decode_chain(only_key, only_value, chain, ctx);
                }
            }
            let mut record = Record::with_capacity(obj.len());
            for (stored_key, value) in obj {
                let (logical, decoded) = decode_entry(stored_key, value, ctx)?;
                record.insert(logical, decoded);
            }
            Ok(Value::Map(record))
        }
        JsonValue::Array(items) => {
            let mut list = Vec::with_capacity(items.len());
            for item in items {
                list.push(decode_tree(key, item, ctx)?);
            }
            Ok(Value::List(list))
        }
        scalar => json_scalar_to_value(key, scalar),
    }
}

fn decode_chain(
    key: &str,
    wire: &JsonValue,
    mut chain: Vec<Transform>,
    ctx: &DecodeCtx,
) -> Result<Value> {
    let data = if matches!(chain.last(), Some(Transform::Sidecar)) {
        chain.pop();
        let reference = SidecarRef::from_json(key, wire)?;
        ctx.read_sidecar(key, reference)?
    } else {
        let text = wire.as_str().ok_or_else(|| {
            ShardsetError::Format(format!("expected encoded string for key '{key}'"))
        })?;
        ctx.encoding.decode(text).map_err(|e| with_key(e, key))?
    };
    decode_payload(key, data, &chain, &ctx.registry)
}

/// Folds the remaining transform stages (right-to-left) over raw payload
/// bytes. `chain` must not contain the sidecar stage.
pub(crate) fn decode_payload(
    key: &str,
    data: Vec<u8>,
    chain: &[Transform],
    registry: &CodecRegistry,
) -> Result<Value> {
    let mut data = data;
    for (pos, transform) in chain.iter().enumerate().rev() {
        match transform {
            Transform::Sidecar => {
                return Err(ShardsetError::Format(format!(
                    "misplaced 'bin' extension in key '{key}'"
                )));
            }
            Transform::Compress(ext) => {
                data = registry
                    .get(ext)?
                    .decompress(&data)
                    .map_err(|e| with_key(e, key))?;
            }
            Transform::Type(tag) => {
                if pos != 0 {
                    return Err(ShardsetError::Format(format!(
                        "type extension is not innermost in key '{key}'"
                    )));
                }
                return match tag {
                    TypeTag::Npy => TypedArray::from_npy(&data)
                        .map(Value::Array)
                        .map_err(|e| with_key(e, key)),
                    TypeTag::Raw => Ok(Value::Bytes(data)),
                    TypeTag::Str => String::from_utf8(data).map(Value::Str).map_err(|_| {
                        ShardsetError::Format(format!("invalid UTF-8 payload for key '{key}'"))
                    }),
                };
            }
        }
    }

    // No type tag: the payload is JSON written by a whole-value compressor.
    let json: JsonValue = serde_json::from_slice(&data).map_err(|e| {
        ShardsetError::Format(format!("invalid JSON payload for key '{key}': {e}"))
    })?;
    json_to_value_plain(key, &json)
}

fn with_key(err: ShardsetError, key: &str) -> ShardsetError {
    match err {
        ShardsetError::Codec(msg) => ShardsetError::Codec(format!("{msg} for key '{key}'")),
        ShardsetError::Format(msg) => ShardsetError::Format(format!("{msg} for key '{key}'")),
        other => other,
    }
}

fn json_scalar_to_value(key: &str, json: &JsonValue) -> Result<Value> {
    match json {
        JsonValue::Null => Ok(Value::Null),
        JsonValue::Bool(b) => Ok(Value::Bool(*b)),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(Value::Int(i))
            } else if let Some(f) = n.as_f64() {
                Ok(Value::Float(f))
            } else {
                Err(ShardsetError::Format(format!(
                    "unrepresentable number for key '{key}'"
                )))
            }
        }
        JsonValue::String(s) => Ok(Value::Str(s.clone())),
        _ => Err(ShardsetError::Format(format!(
            "expected scalar for key '{key}'"
        ))),
    }
}

/// Converts plain JSON (no suffixed keys) into a logical value.
fn json_to_value_plain(key: &str, json: &JsonValue) -> Result<Value> {
    match json {
        JsonValue::Object(obj) => {
            let mut record = Record::with_capacity(obj.len());
            for (k, v) in obj {
                record.insert(k.clone(), json_to_value_plain(key, v)?);
            }
            Ok(Value::Map(record))
        }
        JsonValue::Array(items) => {
            let mut list = Vec::with_capacity(items.len());
            for item in items {
                list.push(json_to_value_plain(key, item)?);
            }
            Ok(Value::List(list))
        }
        scalar => json_scalar_to_value(key, scalar),
    }
}
