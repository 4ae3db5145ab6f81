//! Permutations and zero-copy reordering views.
//!
//! A permutation is an array of record indices describing a reordering or
//! subset of any indexable dataset. Permutations are built in one pass
//! (identity, seeded shuffle, stable key sort, or the inverse of another
//! permutation), optionally trimmed by stride/offset/count, persisted as a
//! flat little-endian `u64` file with no header, and consumed by an
//! [`IndexedView`] that applies them at read time without copying data.

use crate::error::{Result, ShardsetError};
use crate::Dataset;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::fs;
use std::path::{Path, PathBuf};

/// The identity permutation `[0, 1, ..., n-1]`.
pub fn identity(n: usize) -> Vec<u64> {
    (0..n as u64).collect()
}

/// A uniformly random permutation of `[0, n)`, fully determined by `seed`:
/// the same seed always yields the bit-identical permutation, which is what
/// makes an exact undo via [`reverse`] possible.
pub fn shuffle(n: usize, seed: u64) -> Vec<u64> {
    let mut indices = identity(n);
    let mut rng = StdRng::seed_from_u64(seed);
    indices.shuffle(&mut rng);
    indices
}

/// The inverse permutation: `reverse(p)[p[i]] == i` for all `i`. Applying a
/// shuffle and then its reverse restores the original order exactly.
///
/// # Errors
/// Returns [`ShardsetError::Policy`] if `indices` is not a permutation of
/// `[0, len)`.
pub fn reverse(indices: &[u64]) -> Result<Vec<u64>> {
    let n = indices.len() as u64;
    let mut inverse = vec![u64::MAX; indices.len()];
    for (i, &target) in indices.iter().enumerate() {
        if target >= n {
            return Err(ShardsetError::Policy(format!(
                "cannot invert: index {target} outside [0, {n})"
            )));
        }
        inverse[target as usize] = i as u64;
    }
    if inverse.contains(&u64::MAX) {
        return Err(ShardsetError::Policy(
            "cannot invert: duplicate indices".into(),
        ));
    }
    Ok(inverse)
}

/// Indices that stable-sort `dataset` by `key_fn`; ties keep their original
/// relative order. The key is evaluated exactly once per record.
pub fn sort_by_key<D, K, F>(dataset: &D, mut key_fn: F) -> Result<Vec<u64>>
where
    D: Dataset,
    K: Ord,
    F: FnMut(&mut D::Item) -> K,
{
    let mut keys = Vec::with_capacity(dataset.len());
    for i in 0..dataset.len() {
        let mut item = dataset.get(i)?;
        keys.push(key_fn(&mut item));
    }
    let mut indices = identity(dataset.len());
    indices.sort_by(|&a, &b| keys[a as usize].cmp(&keys[b as usize]));
    Ok(indices)
}

/// Applies stride subsampling, then drops the first `offset` entries, then
/// keeps at most `count` entries, in that order.
///
/// # Errors
/// Returns [`ShardsetError::Policy`] for a zero stride.
pub fn trim(
    indices: Vec<u64>,
    stride: Option<usize>,
    offset: Option<usize>,
    count: Option<usize>,
) -> Result<Vec<u64>> {
    if stride == Some(0) {
        return Err(ShardsetError::Policy("stride must be positive".into()));
    }
    Ok(indices
        .into_iter()
        .step_by(stride.unwrap_or(1))
        .skip(offset.unwrap_or(0))
        .take(count.unwrap_or(usize::MAX))
        .collect())
}

/// Persists a permutation as a flat little-endian `u64` file with no header
/// — the interchange format shared with the standalone indexing tooling.
pub fn save_index<P: AsRef<Path>>(path: P, indices: &[u64]) -> Result<()> {
    let mut bytes = Vec::with_capacity(indices.len() * 8);
    for index in indices {
        bytes.extend_from_slice(&index.to_le_bytes());
    }
    fs::write(path, bytes)?;
    Ok(())
}

/// Loads a permutation written by [`save_index`].
pub fn load_index<P: AsRef<Path>>(path: P) -> Result<Vec<u64>> {
    let path = path.as_ref();
    let bytes = fs::read(path)?;
    if bytes.len() % 8 != 0 {
        return Err(ShardsetError::Format(format!(
            "index file '{}' of {} bytes is not a u64 array",
            path.display(),
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(8)
        .map(|b| u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
        .collect())
}

/// Concatenates permutations loaded from several index files, in order.
pub fn join_indices<I, P>(paths: I) -> Result<Vec<u64>>
where
    I: IntoIterator<Item = P>,
    P: AsRef<Path>,
{
    let mut joined = Vec::new();
    for path in paths {
        joined.extend(load_index(path)?);
    }
    Ok(joined)
}

/// A zero-copy view that reorders or subsets an underlying dataset through a
/// permutation. Owns neither; indices outside `[0, len)` are silently
/// dropped at construction.
#[derive(Debug)]
pub struct IndexedView<'a, D: Dataset> {
    dataset: &'a D,
    indices: Vec<u64>,
}

impl<'a, D: Dataset> IndexedView<'a, D> {
    /// Wraps `dataset`, keeping only in-range entries of `indices`.
    pub fn new(dataset: &'a D, indices: Vec<u64>) -> Self {
        let len = dataset.len() as u64;
        let indices = indices.into_iter().filter(|&i| i < len).collect();
        Self { dataset, indices }
    }

    /// The retained permutation.
    pub fn indices(&self) -> &[u64] {
        &self.indices
    }
}

impl<D: Dataset> Dataset for IndexedView<'_, D> {
    type Item = D::Item;

    fn len(&self) -> usize {
        self.indices.len()
    }

    fn get(&self, index: usize) -> Result<Self::Item> {
        let target = *self.indices.get(index).ok_or(ShardsetError::Bounds {
            index,
            len: self.indices.len(),
        })?;
        self.dataset.get(target as usize)
    }
}

/// Mutually exclusive reorder requests, resolved into one permutation.
///
/// At most one of the shuffle seed, the explicit index file, and a sort key
/// (via [`ReorderOptions::resolve_with_sort`]) may be supplied; conflicting
/// requests are a caller error, not an ambiguity to resolve silently.
///
/// A negative shuffle seed is shorthand for "shuffle with the absolute seed,
/// then invert" — the documented mechanism for un-shuffling a dataset that
/// was shuffled with the positive seed. The sign is never persisted.
#[derive(Debug, Clone, Default)]
pub struct ReorderOptions {
    /// Seeded shuffle request.
    pub shuffle: Option<i64>,
    /// Explicit permutation file request.
    pub index_file: Option<PathBuf>,
}

impl ReorderOptions {
    /// Resolves the options into a permutation over `dataset`.
    pub fn resolve<D: Dataset>(&self, dataset: &D) -> Result<Vec<u64>> {
        match (&self.shuffle, &self.index_file) {
            (Some(_), Some(_)) => Err(ShardsetError::Policy(
                "shuffle and index file are mutually exclusive".into(),
            )),
            (Some(seed), None) => {
                let seed = *seed;
                let n = dataset.len();
                if seed < 0 {
                    reverse(&shuffle(n, seed.unsigned_abs()))
                } else {
                    Ok(shuffle(n, seed as u64))
                }
            }
            (None, Some(path)) => load_index(path),
            (None, None) => Ok(identity(dataset.len())),
        }
    }

    /// Resolves a sort-key request, which excludes every other reorder
    /// source.
    pub fn resolve_with_sort<D, K, F>(&self, dataset: &D, key_fn: F) -> Result<Vec<u64>>
    where
        D: Dataset,
        K: Ord,
        F: FnMut(&mut D::Item) -> K,
    {
        if self.shuffle.is_some() || self.index_file.is_some() {
            return Err(ShardsetError::Policy(
                "sort key conflicts with shuffle/index file reorder requests".into(),
            ));
        }
        sort_by_key(dataset, key_fn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Numbers(Vec<i64>);

    impl Dataset for Numbers {
        type Item = i64;

        fn len(&self) -> usize {
            self.0.len()
        }

        fn get(&self, index: usize) -> Result<i64> {
            self.0.get(index).copied().ok_or(ShardsetError::Bounds {
                index,
                len: self.0.len(),
            })
        }
    }

    #[test]
    fn identity_is_sequential() {
        assert_eq!(identity(4), vec![0, 1, 2, 3]);
        assert!(identity(0).is_empty());
    }

    #[test]
    fn shuffle_is_deterministic_per_seed() {
        for n in [0, 1, 5, 10_000] {
            for seed in [0, 1, 42] {
                let a = shuffle(n, seed);
                let b = shuffle(n, seed);
                assert_eq!(a, b, "n={n} seed={seed}");
                let mut sorted = a.clone();
                sorted.sort_unstable();
                assert_eq!(sorted, identity(n), "shuffle must be a permutation");
            }
        }
        assert_ne!(shuffle(100, 1), shuffle(100, 2));
    }

    #[test]
    fn reverse_inverts_a_shuffle() {
        for seed in [0, 1, 42] {
            let p = shuffle(1000, seed);
            let inv = reverse(&p).unwrap();
            for (i, &target) in p.iter().enumerate() {
                assert_eq!(inv[target as usize], i as u64);
            }
        }
    }

    #[test]
    fn reverse_rejects_non_permutations() {
        assert!(matches!(
            reverse(&[0, 5]).unwrap_err(),
            ShardsetError::Policy(_)
        ));
        assert!(matches!(
            reverse(&[0, 0, 1]).unwrap_err(),
            ShardsetError::Policy(_)
        ));
    }

    #[test]
    fn shuffle_then_reverse_restores_order() {
        for n in [0usize, 1, 5, 10_000] {
            for seed in [0, 1, 42] {
                let data = Numbers((0..n as i64).collect());
                let shuffled_view_indices = shuffle(n, seed);
                let shuffled = IndexedView::new(&data, shuffled_view_indices.clone());
                let unshuffled =
                    IndexedView::new(&shuffled, reverse(&shuffled_view_indices).unwrap());
                let restored: Vec<i64> = unshuffled
                    .iter()
                    .collect::<Result<_>>()
                    .unwrap();
                assert_eq!(restored, (0..n as i64).collect::<Vec<_>>(), "n={n} seed={seed}");
            }
        }
    }

    #[test]
    fn sort_is_stable_and_idempotent() {
        let data = Numbers(vec![3, 1, 2, 1, 3]);
        let order = sort_by_key(&data, |item| *item).unwrap();
        assert_eq!(order, vec![1, 3, 2, 0, 4]);

        // sorting an already-sorted dataset yields the identity
        let sorted = Numbers(vec![1, 1, 2, 3, 3]);
        assert_eq!(sort_by_key(&sorted, |item| *item).unwrap(), identity(5));

        // sort, materialize, sort again: same final order both times
        let once: Vec<i64> = IndexedView::new(&data, order)
            .iter()
            .collect::<Result<_>>()
            .unwrap();
        let again = Numbers(once.clone());
        let reorder = sort_by_key(&again, |item| *item).unwrap();
        assert_eq!(reorder, identity(5));
    }

    #[test]
    fn trim_composes_stride_then_offset_then_count() {
        let trimmed = trim(identity(100), Some(2), Some(10), Some(5)).unwrap();
        assert_eq!(trimmed, vec![20, 22, 24, 26, 28]);

        let trimmed = trim(identity(10), None, Some(7), None).unwrap();
        assert_eq!(trimmed, vec![7, 8, 9]);

        assert!(matches!(
            trim(identity(10), Some(0), None, None).unwrap_err(),
            ShardsetError::Policy(_)
        ));
    }

    #[test]
    fn out_of_range_indices_are_dropped_at_construction() {
        let data = Numbers(vec![10, 11, 12, 13, 14]);
        let view = IndexedView::new(&data, vec![u64::MAX, 0, 4, 5, 2]);
        assert_eq!(view.len(), 3);
        let values: Vec<i64> = view.iter().collect::<Result<_>>().unwrap();
        assert_eq!(values, vec![10, 14, 12]);
    }

    #[test]
    fn index_files_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("perm.idx");
        let perm = shuffle(100, 7);
        save_index(&path, &perm).unwrap();
        assert_eq!(load_index(&path).unwrap(), perm);
        assert_eq!(
            std::fs::metadata(&path).unwrap().len(),
            100 * 8,
            "flat u64 file with no header"
        );

        let other = dir.path().join("other.idx");
        save_index(&other, &[1, 2]).unwrap();
        let joined = join_indices([&other, &path]).unwrap();
        assert_eq!(joined.len(), 102);
        assert_eq!(&joined[..2], &[1, 2]);
    }

    #[test]
    fn corrupt_index_file_is_a_format_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.idx");
        std::fs::write(&path, [1, 2, 3]).unwrap();
        assert!(matches!(
            load_index(&path).unwrap_err(),
            ShardsetError::Format(_)
        ));
    }

    #[test]
    fn conflicting_reorders_are_policy_errors() {
        let data = Numbers(vec![1, 2, 3]);
        let conflict = ReorderOptions {
            shuffle: Some(1),
            index_file: Some(PathBuf::from("p.idx")),
        };
        assert!(matches!(
            conflict.resolve(&data).unwrap_err(),
            ShardsetError::Policy(_)
        ));

        let with_shuffle = ReorderOptions {
            shuffle: Some(1),
            index_file: None,
        };
        assert!(matches!(
            with_shuffle
                .resolve_with_sort(&data, |item| *item)
                .unwrap_err(),
            ShardsetError::Policy(_)
        ));

        assert_eq!(
            ReorderOptions::default().resolve(&data).unwrap(),
            identity(3)
        );
    }

    #[test]
    fn negative_seed_is_shuffle_then_reverse() {
        let data = Numbers((0..50).collect());
        let forward = ReorderOptions {
            shuffle: Some(42),
            index_file: None,
        }
        .resolve(&data)
        .unwrap();
        let backward = ReorderOptions {
            shuffle: Some(-42),
            index_file: None,
        }
        .resolve(&data)
        .unwrap();
        assert_eq!(backward, reverse(&forward).unwrap());
    }
}
