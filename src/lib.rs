//! # Shardset
//!
//! A dataset interchange toolkit built around a self-describing, shard-based
//! storage format for sequences of structured records, plus the permutation
//! engine used to reorder or subset those records without copying data.
//!
//! ## Overview
//!
//! A shard is one append-only file of newline-terminated JSON records,
//! followed by a footer object and a final line holding the footer's byte
//! offset. Every shard is self-contained: the footer carries the offset
//! index, the shard's position in its dataset chain, and the writer's full
//! transcoding policy, so a reader never needs out-of-band configuration.
//!
//! ```text
//! [record line 0] [record line 1] ... [footer line] [footer offset line]
//! ```
//!
//! ### Key Features
//!
//! *   **Random access by record number:** an offset index maps record
//!     numbers to byte ranges; readers seek rather than scan.
//! *   **Per-field transcoding:** each leaf value independently decides its
//!     serialization, whether compression pays for itself, and whether the
//!     payload is text-embedded or spilled to a sidecar file. The decisions
//!     are recorded as a suffix chain on the field's key (`name.npy.zst`)
//!     and reversed at read time.
//! *   **Lazy decoding:** records come back as [`LazyRecord`] views that
//!     decode each field on first access and cache the result.
//! *   **Datasets larger than RAM:** readers can memory-map the shard body
//!     and the offset index instead of holding them in memory.
//! *   **Size-based sharding:** the dataset writer rolls shards over by size
//!     and link-chains them; a single bare file is promoted to a directory
//!     of numbered shards on the first rollover.
//! *   **Zero-copy reordering:** seeded shuffles, stable key sorts, and
//!     hand-built permutations apply through an [`IndexedView`] at read
//!     time; a shuffle is exactly undone by the inverse permutation.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use shardset::{DatasetReader, DatasetWriter, Record, Value};
//!
//! let mut writer = DatasetWriter::create("corpus.sds")?;
//! let mut record = Record::new();
//! record.insert("id".into(), Value::Int(1));
//! record.insert("text".into(), Value::from("hello"));
//! writer.write(&record)?;
//! writer.close()?;
//!
//! let reader = DatasetReader::open("corpus.sds")?;
//! let mut first = reader.get(0)?;
//! println!("{:?}", first.get("text")?);
//! # Ok::<(), shardset::ShardsetError>(())
//! ```
//!
//! ### Reordering
//!
//! ```rust,no_run
//! use shardset::{indexing, Dataset, DatasetReader, IndexedView};
//!
//! let reader = DatasetReader::open("corpus.sds")?;
//! let perm = indexing::shuffle(reader.len(), 42);
//! let shuffled = IndexedView::new(&reader, perm);
//! for record in shuffled.iter() {
//!     let _record = record?;
//! }
//! # Ok::<(), shardset::ShardsetError>(())
//! ```
//!
//! ## Concurrency
//!
//! The core is single-threaded, synchronous, blocking I/O: each shard file
//! has exactly one writer for its lifetime and is read-only thereafter.
//! Reader instances may move across threads (their internal handles are
//! guarded), but sharing one instance between threads requires external
//! synchronization. Memory mapping is used only on the read path.
//!
//! ## Error Handling
//!
//! Every failure surfaces as a [`ShardsetError`] raised at the point of
//! detection with the offending key, index, or path attached. Partially
//! written shards are invalid by design: a shard without its trailing
//! footer-offset line must be regenerated from source data.

#![deny(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::panic)]
#![warn(missing_docs)]

pub mod codec;
pub mod dataset;
pub mod encoding;
pub mod error;
pub mod format;
pub mod indexing;
pub mod lazy;
pub mod reader;
pub mod transcode;
pub mod value;
pub mod writer;

// Internal plumbing shared by the writer and reader.
mod io;

pub use codec::{Codec, CodecRegistry};
pub use dataset::{DatasetReader, DatasetWriter, DatasetWriterOptions};
pub use encoding::Encoding;
pub use error::{Result, ShardsetError};
pub use indexing::{IndexedView, ReorderOptions};
pub use lazy::{EagerRecord, LazyRecord};
pub use reader::{ReaderOptions, ShardReader};
pub use transcode::TranscodePolicy;
pub use value::{Record, TypedArray, Value};
pub use writer::{ShardLabels, ShardWriter, WriterOptions};

/// The capability every data source exposes: a length, random access by
/// index, and forward iteration derived from the two.
///
/// The permutation engine and the multi-shard assembler require nothing
/// more, so any indexable source — a shard reader, a whole dataset, or an
/// [`IndexedView`] over either — can be reordered and consumed uniformly.
pub trait Dataset {
    /// The record type this dataset yields.
    type Item;

    /// Number of records.
    fn len(&self) -> usize;

    /// Returns record `index`.
    ///
    /// # Errors
    /// Returns [`ShardsetError::Bounds`] for `index >= len()`.
    fn get(&self, index: usize) -> Result<Self::Item>;

    /// True if the dataset holds no records.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterates records in index order.
    fn iter(&self) -> DatasetIter<'_, Self>
    where
        Self: Sized,
    {
        DatasetIter {
            dataset: self,
            index: 0,
        }
    }
}

/// Forward iterator over any [`Dataset`].
#[derive(Debug)]
pub struct DatasetIter<'a, D> {
    dataset: &'a D,
    index: usize,
}

impl<D: Dataset> Iterator for DatasetIter<'_, D> {
    type Item = Result<D::Item>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.index >= self.dataset.len() {
            return None;
        }
        let item = self.dataset.get(self.index);
        self.index += 1;
        Some(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.dataset.len().saturating_sub(self.index);
        (remaining, Some(remaining))
    }
}
