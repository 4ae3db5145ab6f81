//! The self-describing shard format: extension-chain grammar and footer.
//!
//! A transcoded key is `<logical><sep><ext1><sep><ext2>...` where each
//! extension names one reversible transform, outermost last; readers reverse
//! the chain right-to-left. Decode behavior is selected entirely by parsing
//! this suffix chain — there is no fixed schema. The parser is total over the
//! closed set of known tags and fails with a format error on anything else
//! rather than guessing.
//!
//! The footer is the one JSON object trailing the record body. It carries the
//! offset index under a self-describing `index.<exts>` key together with the
//! writer's full transcoding policy, so a reader never needs out-of-band
//! configuration. The final line of a shard file is the decimal byte offset
//! at which the footer line begins.

use crate::codec::CodecRegistry;
use crate::encoding::Encoding;
use crate::error::{Result, ShardsetError};
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};

/// Shard file extension.
pub const SHARD_EXT: &str = "sds";
/// Sidecar file extension (replaces the shard extension on the same stem).
pub const SIDECAR_EXT: &str = "binx";
/// Format version written into every footer.
pub const FORMAT_VERSION: &str = "1.0";
/// Default key-extension separator.
pub const DEFAULT_EXT_SEP: &str = ".";
/// The footer key prefix under which the offset index is stored.
pub const INDEX_KEY: &str = "index";

/// Returns the canonical member file name for shard `id` inside a sharded
/// dataset directory.
pub fn shard_file_name(id: u64) -> String {
    format!("shard-{id:05}.{SHARD_EXT}")
}

/// Serialization form of a leaf value, named by its type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeTag {
    /// NPY container holding a numeric array.
    Npy,
    /// Raw bytes.
    Raw,
    /// UTF-8 string bytes.
    Str,
}

impl TypeTag {
    /// The tag stored in the key chain.
    pub fn ext(&self) -> &'static str {
        match self {
            Self::Npy => "npy",
            Self::Raw => "raw",
            Self::Str => "str",
        }
    }
}

/// One reversible transform applied to a stored value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transform {
    /// Serialization of a typed leaf (innermost stage).
    Type(TypeTag),
    /// Compression under the named codec extension.
    Compress(String),
    /// The value lives in the sidecar file; the stored form is an
    /// offset/length reference.
    Sidecar,
}

impl Transform {
    /// The extension tag for this transform.
    pub fn ext(&self) -> &str {
        match self {
            Self::Type(tag) => tag.ext(),
            Self::Compress(ext) => ext,
            Self::Sidecar => "bin",
        }
    }
}

/// Splits a stored key into its logical name and extension parts.
pub fn split_key<'a>(key: &'a str, sep: &str) -> (&'a str, Vec<&'a str>) {
    match key.split_once(sep) {
        Some((logical, rest)) => (logical, rest.split(sep).collect()),
        None => (key, Vec::new()),
    }
}

/// Parses the extension parts of a stored key into an ordered transform
/// chain.
///
/// # Errors
/// Returns [`ShardsetError::Format`] naming `key` if any tag is unknown.
pub fn parse_transforms(key: &str, parts: &[&str], registry: &CodecRegistry) -> Result<Vec<Transform>> {
    let mut chain = Vec::with_capacity(parts.len());
    for part in parts {
        let transform = match *part {
            "npy" => Transform::Type(TypeTag::Npy),
            "raw" => Transform::Type(TypeTag::Raw),
            "str" => Transform::Type(TypeTag::Str),
            "bin" => Transform::Sidecar,
            ext if registry.contains(ext) && ext != "none" => {
                Transform::Compress(ext.to_owned())
            }
            other => {
                return Err(ShardsetError::Format(format!(
                    "unknown extension '{other}' in key '{key}'"
                )));
            }
        };
        chain.push(transform);
    }
    Ok(chain)
}

/// Joins a logical name and transform chain back into a stored key.
pub fn join_key(logical: &str, chain: &[Transform], sep: &str) -> String {
    let mut key = logical.to_owned();
    for t in chain {
        key.push_str(sep);
        key.push_str(t.ext());
    }
    key
}

/// A reference into the sidecar file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SidecarRef {
    /// Byte offset of the payload inside the sidecar.
    pub offset: u64,
    /// Payload length in bytes.
    pub length: u64,
}

impl SidecarRef {
    /// Converts to the stored JSON shape `{"offset": .., "length": ..}`.
    pub fn to_json(self) -> JsonValue {
        let mut map = JsonMap::new();
        map.insert("offset".into(), JsonValue::from(self.offset));
        map.insert("length".into(), JsonValue::from(self.length));
        JsonValue::Object(map)
    }

    /// Parses the stored JSON shape, naming `key` on failure.
    pub fn from_json(key: &str, value: &JsonValue) -> Result<Self> {
        let obj = value.as_object().ok_or_else(|| {
            ShardsetError::Format(format!("expected offset/length object for key '{key}'"))
        })?;
        let field = |name: &str| {
            obj.get(name).and_then(JsonValue::as_u64).ok_or_else(|| {
                ShardsetError::Format(format!("missing sidecar field '{name}' for key '{key}'"))
            })
        };
        Ok(Self {
            offset: field("offset")?,
            length: field("length")?,
        })
    }
}

/// The parsed shard footer: index location, shard identity and linkage, and
/// the writer's transcoding policy.
#[derive(Debug, Clone)]
pub struct Footer {
    /// The full stored index key (`index.<exts>`).
    pub index_key: String,
    /// The stored index value: an encoded string or a sidecar reference.
    pub index_value: JsonValue,
    /// Number of records in the shard body.
    pub num_samples: u64,
    /// Position of this shard within its dataset.
    pub shard_id: u64,
    /// Format version tag.
    pub version: String,
    /// File name of the previous shard in the chain, if any.
    pub shard_prev: Option<String>,
    /// File name of the next shard in the chain, if any.
    pub shard_next: Option<String>,
    /// Optional split name this shard belongs to.
    pub split: Option<String>,
    /// Optional dataset name.
    pub dataset_name: Option<String>,
    /// Optional content hash of the shard body.
    pub hash: Option<String>,
    /// Text encoding used for string-embedded byte payloads.
    pub encoding: Encoding,
    /// Key-extension separator.
    pub ext_sep: String,
    /// Field compression codec extension, if compression was enabled.
    pub compression: Option<String>,
    /// Offset-index compression codec extension.
    pub index_compression: Option<String>,
    /// Minimum serialized size at which compression was attempted.
    pub compress_threshold: usize,
    /// Maximum compressed/serialized ratio at which compression was kept.
    pub compress_ratio: f64,
    /// Size above which payloads were moved to the sidecar.
    pub binary_threshold: Option<usize>,
}

impl Footer {
    /// Serializes the footer to its JSON object form.
    pub fn to_json(&self) -> JsonValue {
        let mut map = JsonMap::new();
        map.insert(self.index_key.clone(), self.index_value.clone());
        map.insert("encoding".into(), self.encoding.name().into());
        map.insert("ext_sep".into(), self.ext_sep.clone().into());
        if let Some(c) = &self.compression {
            map.insert("compression".into(), c.clone().into());
        }
        if let Some(c) = &self.index_compression {
            map.insert("index_compression".into(), c.clone().into());
        }
        map.insert("compress_threshold".into(), self.compress_threshold.into());
        map.insert("compress_ratio".into(), self.compress_ratio.into());
        if let Some(t) = self.binary_threshold {
            map.insert("binary_threshold".into(), t.into());
        }
        map.insert("num_samples".into(), self.num_samples.into());
        map.insert("shard_id".into(), self.shard_id.into());
        map.insert("version".into(), self.version.clone().into());
        if let Some(v) = &self.shard_prev {
            map.insert("shard_prev".into(), v.clone().into());
        }
        if let Some(v) = &self.shard_next {
            map.insert("shard_next".into(), v.clone().into());
        }
        if let Some(v) = &self.split {
            map.insert("split".into(), v.clone().into());
        }
        if let Some(v) = &self.dataset_name {
            map.insert("dataset_name".into(), v.clone().into());
        }
        if let Some(v) = &self.hash {
            map.insert("hash".into(), v.clone().into());
        }
        JsonValue::Object(map)
    }

    /// Parses a footer object. `encoding_override` substitutes for a missing
    /// `encoding` field (shards from writers that predate the policy fields).
    pub fn from_json(obj: &JsonMap<String, JsonValue>, encoding_override: Option<Encoding>) -> Result<Self> {
        let ext_sep = obj
            .get("ext_sep")
            .and_then(JsonValue::as_str)
            .unwrap_or(DEFAULT_EXT_SEP)
            .to_owned();

        let index_prefix = format!("{INDEX_KEY}{ext_sep}");
        let index_key = obj
            .keys()
            .find(|k| *k == INDEX_KEY || k.starts_with(&index_prefix))
            .cloned()
            .ok_or_else(|| ShardsetError::Format("missing index in shard footer".into()))?;
        let index_value = obj
            .get(&index_key)
            .cloned()
            .unwrap_or(JsonValue::Null);

        let num_samples = obj
            .get("num_samples")
            .and_then(JsonValue::as_u64)
            .ok_or_else(|| ShardsetError::Format("missing num_samples in shard footer".into()))?;

        let encoding = match obj.get("encoding").and_then(JsonValue::as_str) {
            Some(name) => Encoding::from_name(name)?,
            None => encoding_override.unwrap_or(Encoding::A85),
        };

        let opt_str = |name: &str| {
            obj.get(name)
                .and_then(JsonValue::as_str)
                .map(str::to_owned)
        };

        Ok(Self {
            index_key,
            index_value,
            num_samples,
            shard_id: obj.get("shard_id").and_then(JsonValue::as_u64).unwrap_or(0),
            version: opt_str("version").unwrap_or_else(|| FORMAT_VERSION.to_owned()),
            shard_prev: opt_str("shard_prev"),
            shard_next: opt_str("shard_next"),
            split: opt_str("split"),
            dataset_name: opt_str("dataset_name"),
            hash: opt_str("hash"),
            encoding,
            ext_sep,
            compression: opt_str("compression"),
            index_compression: opt_str("index_compression"),
            compress_threshold: obj
                .get("compress_threshold")
                .and_then(JsonValue::as_u64)
                .unwrap_or(128) as usize,
            compress_ratio: obj
                .get("compress_ratio")
                .and_then(JsonValue::as_f64)
                .unwrap_or(0.67),
            binary_threshold: obj
                .get("binary_threshold")
                .and_then(JsonValue::as_u64)
                .map(|t| t as usize),
        })
    }

    /// The extension parts of the index key (everything after `index`).
    pub fn index_extensions(&self) -> Vec<&str> {
        let (_, parts) = split_key(&self.index_key, &self.ext_sep);
        parts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_splitting_recovers_logical_name() {
        let (logical, parts) = split_key("embedding.npy.zst", ".");
        assert_eq!(logical, "embedding");
        assert_eq!(parts, vec!["npy", "zst"]);

        let (logical, parts) = split_key("plain", ".");
        assert_eq!(logical, "plain");
        assert!(parts.is_empty());

        // custom separator leaves dots in the logical name alone
        let (logical, parts) = split_key("file.name#raw#bin", "#");
        assert_eq!(logical, "file.name");
        assert_eq!(parts, vec!["raw", "bin"]);
    }

    #[test]
    fn transform_chains_parse_and_rejoin() {
        let registry = CodecRegistry::new();
        let (logical, parts) = split_key("x.npy.zst.bin", ".");
        let chain = parse_transforms("x.npy.zst.bin", &parts, &registry).unwrap();
        assert_eq!(
            chain,
            vec![
                Transform::Type(TypeTag::Npy),
                Transform::Compress("zst".into()),
                Transform::Sidecar,
            ]
        );
        assert_eq!(join_key(logical, &chain, "."), "x.npy.zst.bin");
    }

    #[test]
    fn unknown_tags_are_format_errors() {
        let registry = CodecRegistry::new();
        let err = parse_transforms("x.pickle", &["pickle"], &registry).unwrap_err();
        assert!(matches!(err, ShardsetError::Format(_)));
        assert!(err.to_string().contains("x.pickle"));
    }

    #[test]
    fn footer_round_trips() {
        let footer = Footer {
            index_key: "index.npy.zst".into(),
            index_value: JsonValue::from("<~encoded~>"),
            num_samples: 42,
            shard_id: 3,
            version: FORMAT_VERSION.into(),
            shard_prev: Some("shard-00002.sds".into()),
            shard_next: None,
            split: Some("train".into()),
            dataset_name: None,
            hash: None,
            encoding: Encoding::A85,
            ext_sep: ".".into(),
            compression: Some("zst".into()),
            index_compression: Some("zst".into()),
            compress_threshold: 128,
            compress_ratio: 0.67,
            binary_threshold: Some(1024),
        };
        let json = footer.to_json();
        let obj = json.as_object().expect("footer is an object");
        let parsed = Footer::from_json(obj, None).unwrap();
        assert_eq!(parsed.index_key, footer.index_key);
        assert_eq!(parsed.num_samples, 42);
        assert_eq!(parsed.shard_id, 3);
        assert_eq!(parsed.shard_prev.as_deref(), Some("shard-00002.sds"));
        assert_eq!(parsed.split.as_deref(), Some("train"));
        assert_eq!(parsed.encoding, Encoding::A85);
        assert_eq!(parsed.compression.as_deref(), Some("zst"));
        assert_eq!(parsed.binary_threshold, Some(1024));
        assert_eq!(parsed.index_extensions(), vec!["npy", "zst"]);
    }

    #[test]
    fn footer_without_index_is_rejected() {
        let mut obj = JsonMap::new();
        obj.insert("num_samples".into(), 1.into());
        assert!(matches!(
            Footer::from_json(&obj, None).unwrap_err(),
            ShardsetError::Format(_)
        ));
    }

    #[test]
    fn sidecar_ref_round_trips() {
        let r = SidecarRef {
            offset: 1024,
            length: 77,
        };
        assert_eq!(SidecarRef::from_json("k", &r.to_json()).unwrap(), r);
        assert!(SidecarRef::from_json("k", &JsonValue::from("nope")).is_err());
    }

    #[test]
    fn shard_names_are_zero_padded() {
        assert_eq!(shard_file_name(0), "shard-00000.sds");
        assert_eq!(shard_file_name(123), "shard-00123.sds");
    }
}
