//! Multi-shard dataset assembly.
//!
//! On write, shards roll over by size and are link-chained through the
//! `shard_prev`/`shard_next` footer fields. A dataset starts as one bare
//! file and is promoted — once, irreversibly — to a directory of numbered
//! `shard-NNNNN` members the first time a rollover happens, so single-shard
//! and multi-shard datasets share one on-disk convention once more than one
//! shard exists.
//!
//! On read, input paths expand (directories to their sorted `shard-*`
//! members), one [`ShardReader`] opens per file, and a cumulative-length
//! table dispatches global record indices to the owning shard.

use crate::error::{Result, ShardsetError};
use crate::format::{self, SHARD_EXT, SIDECAR_EXT};
use crate::lazy::{EagerRecord, LazyRecord};
use crate::reader::{ReaderOptions, ShardReader};
use crate::value::Record;
use crate::writer::{ShardLabels, ShardWriter, WriterOptions};
use std::fs;
use std::path::{Path, PathBuf};

/// Configuration for a [`DatasetWriter`].
#[derive(Debug, Clone, Default)]
pub struct DatasetWriterOptions {
    /// Roll over to a new shard when the projected body plus index overhead
    /// would exceed this many bytes. `None` keeps everything in one shard.
    pub shard_size: Option<u64>,
    /// Per-shard writer configuration.
    pub writer: WriterOptions,
    /// Split name stamped into every shard footer.
    pub split: Option<String>,
    /// Dataset name stamped into every shard footer.
    pub dataset_name: Option<String>,
    /// When the output is an existing shard directory, continue numbering
    /// after its members instead of overwriting.
    pub append: bool,
}

#[derive(Debug)]
enum Layout {
    Unsharded { path: PathBuf },
    Sharded { dir: PathBuf },
}

/// Writes a dataset across one or more link-chained shards.
#[derive(Debug)]
pub struct DatasetWriter {
    layout: Layout,
    options: DatasetWriterOptions,
    shard_id: u64,
    prev_shard_name: Option<String>,
    current: Option<ShardWriter>,
    records_written: u64,
}

impl DatasetWriter {
    /// Creates a dataset at `path` with default options (single shard).
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::create_with(path, DatasetWriterOptions::default())
    }

    /// Creates a dataset at `path`.
    ///
    /// A bare `path` starts in single-file layout; an existing directory
    /// starts sharded (continuing after its members when `append` is set).
    pub fn create_with<P: AsRef<Path>>(path: P, options: DatasetWriterOptions) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let (layout, shard_id, prev_shard_name) = if path.is_dir() {
            let mut shard_id = 0;
            let mut prev = None;
            if options.append {
                let members = shard_members(&path)?;
                if let Some(last) = members.last() {
                    prev = last
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned());
                    shard_id = members.len() as u64;
                }
            }
            (Layout::Sharded { dir: path }, shard_id, prev)
        } else {
            (Layout::Unsharded { path }, 0, None)
        };

        let mut writer = Self {
            layout,
            options,
            shard_id,
            prev_shard_name,
            current: None,
            records_written: 0,
        };
        writer.open_shard()?;
        Ok(writer)
    }

    fn current_path(&self) -> PathBuf {
        match &self.layout {
            Layout::Unsharded { path } => path.clone(),
            Layout::Sharded { dir } => dir.join(format::shard_file_name(self.shard_id)),
        }
    }

    fn open_shard(&mut self) -> Result<()> {
        let writer = ShardWriter::create_with(self.current_path(), self.options.writer.clone())?;
        self.current = Some(writer);
        Ok(())
    }

    fn writer(&mut self) -> Result<&mut ShardWriter> {
        self.current
            .as_mut()
            .ok_or_else(|| ShardsetError::Policy("dataset writer already closed".into()))
    }

    /// Appends one record, rolling over to a new shard first if the current
    /// one would exceed the configured size.
    pub fn write(&mut self, record: &Record) -> Result<()> {
        if self.should_roll()? {
            self.roll()?;
        }
        self.writer()?.write(record)?;
        self.records_written += 1;
        Ok(())
    }

    /// Appends a record captured from another shard via
    /// [`LazyRecord::eagerize`], copying sidecar payloads verbatim where the
    /// policy allows.
    pub fn write_eager(&mut self, record: &EagerRecord) -> Result<()> {
        if self.should_roll()? {
            self.roll()?;
        }
        self.writer()?.write_eager(record)?;
        self.records_written += 1;
        Ok(())
    }

    fn should_roll(&mut self) -> Result<bool> {
        let Some(shard_size) = self.options.shard_size else {
            return Ok(false);
        };
        let writer = self.writer()?;
        let records = writer.num_records() as u64;
        Ok(records > 0 && writer.tell() + (records + 1) * 8 > shard_size)
    }

    /// Closes the current shard with a forward pointer, promotes a bare file
    /// to a shard directory on the first rollover, and opens the next shard.
    fn roll(&mut self) -> Result<()> {
        let next_name = format::shard_file_name(self.shard_id + 1);
        self.close_current(Some(next_name))?;

        if let Layout::Unsharded { path } = &self.layout {
            let path = path.clone();
            let staging = path.with_extension("tmp");
            fs::rename(&path, &staging)?;
            fs::create_dir_all(&path)?;
            let first = path.join(format::shard_file_name(0));
            fs::rename(&staging, &first)?;
            let sidecar = path.with_extension(SIDECAR_EXT);
            if sidecar.exists() {
                fs::rename(&sidecar, first.with_extension(SIDECAR_EXT))?;
            }
            log::debug!(
                "promoted {} to a shard directory",
                path.display()
            );
            self.layout = Layout::Sharded { dir: path };
        }

        self.prev_shard_name = Some(format::shard_file_name(self.shard_id));
        self.shard_id += 1;
        log::debug!("rolling over to shard {}", self.shard_id);
        self.open_shard()
    }

    fn close_current(&mut self, shard_next: Option<String>) -> Result<()> {
        if let Some(writer) = self.current.take() {
            writer.close(&ShardLabels {
                shard_id: self.shard_id,
                shard_prev: self.prev_shard_name.clone(),
                shard_next,
                split: self.options.split.clone(),
                dataset_name: self.options.dataset_name.clone(),
                hash: None,
            })?;
        }
        Ok(())
    }

    /// Current shard body size in bytes.
    pub fn tell(&self) -> u64 {
        self.current.as_ref().map_or(0, ShardWriter::tell)
    }

    /// Total records written across all shards.
    pub fn records_written(&self) -> u64 {
        self.records_written
    }

    /// Closes the final shard. The dataset is not readable until this
    /// completes.
    pub fn close(mut self) -> Result<()> {
        self.close_current(None)
    }
}

/// Reads a dataset from one or more shard files or shard directories.
#[derive(Debug)]
pub struct DatasetReader {
    shards: Vec<ShardReader>,
    cumulative: Vec<u64>,
}

impl DatasetReader {
    /// Opens a dataset from a single file or directory path with default
    /// options.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_many(std::iter::once(path), &ReaderOptions::default())
    }

    /// Opens a dataset from any mix of shard files and shard directories.
    /// Directories expand to their sorted `shard-*` members.
    pub fn open_many<I, P>(paths: I, options: &ReaderOptions) -> Result<Self>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let mut shard_paths = Vec::new();
        for path in paths {
            let path = path.as_ref();
            if path.is_dir() {
                shard_paths.extend(shard_members(path)?);
            } else {
                shard_paths.push(path.to_path_buf());
            }
        }

        let mut shards = Vec::with_capacity(shard_paths.len());
        let mut cumulative = Vec::with_capacity(shard_paths.len());
        let mut total = 0u64;
        for path in shard_paths {
            let shard = ShardReader::open_with(&path, options)?;
            total += shard.len() as u64;
            cumulative.push(total);
            shards.push(shard);
        }
        Ok(Self { shards, cumulative })
    }

    /// Total number of records across all shards.
    pub fn len(&self) -> usize {
        self.cumulative.last().copied().unwrap_or(0) as usize
    }

    /// True if the dataset holds no records.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The opened shards in order.
    pub fn shards(&self) -> &[ShardReader] {
        &self.shards
    }

    /// Random access by global record index.
    pub fn get(&self, index: usize) -> Result<LazyRecord> {
        let (shard, local) = self.locate(index)?;
        shard.get(local)
    }

    /// Random access with every field decoded up front.
    pub fn get_eager(&self, index: usize) -> Result<Record> {
        let (shard, local) = self.locate(index)?;
        shard.get_eager(local)
    }

    fn locate(&self, index: usize) -> Result<(&ShardReader, usize)> {
        if index >= self.len() {
            return Err(ShardsetError::Bounds {
                index,
                len: self.len(),
            });
        }
        let global = index as u64;
        let shard_idx = self.cumulative.partition_point(|&c| c <= global);
        let shard = self.shards.get(shard_idx).ok_or_else(|| {
            ShardsetError::Format(format!("no shard owns record {index}"))
        })?;
        let base = if shard_idx == 0 {
            0
        } else {
            self.cumulative[shard_idx - 1]
        };
        Ok((shard, (global - base) as usize))
    }

    /// Sequential iteration concatenating shard iterators in order.
    pub fn iter(&self) -> impl Iterator<Item = Result<LazyRecord>> + '_ {
        self.shards.iter().flat_map(ShardReader::iter)
    }

    /// Releases all shard and sidecar handles.
    pub fn close(self) {}
}

impl crate::Dataset for DatasetReader {
    type Item = LazyRecord;

    fn len(&self) -> usize {
        DatasetReader::len(self)
    }

    fn get(&self, index: usize) -> Result<LazyRecord> {
        DatasetReader::get(self, index)
    }
}

/// Sorted `shard-*.<ext>` members of a dataset directory.
fn shard_members(dir: &Path) -> Result<Vec<PathBuf>> {
    let suffix = format!(".{SHARD_EXT}");
    let mut members = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let Some(name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            continue;
        };
        if name.starts_with("shard-") && name.ends_with(&suffix) {
            members.push(path);
        }
    }
    members.sort();
    Ok(members)
}
