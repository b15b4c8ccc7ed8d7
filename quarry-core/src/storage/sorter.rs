// quarry-core/src/storage/sorter.rs
//! External merge sorter used by blocking stages and index builds.
//!
//! Records accumulate in memory until their approximate size passes the
//! memory limit. The buffer is then stably sorted and written out as a run;
//! at the end the runs are k-way merged. Ties between runs resolve by run
//! order, so the overall sort is stable with respect to insertion order.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{ErrorCode, QuarryError, Result};
use crate::log_debug;
use crate::metrics::Metrics;

use super::spill::{SpillFile, SpillReader, SpillWriter};

#[derive(Clone)]
pub struct SorterOptions {
    pub memory_limit: u64,
    pub allow_disk_use: bool,
    pub spill_dir: PathBuf,
    pub metrics: Option<Arc<Metrics>>,
    /// Keep only the first `limit` records (top-k).
    pub limit: Option<usize>,
}

impl SorterOptions {
    pub fn new(memory_limit: u64, allow_disk_use: bool, spill_dir: PathBuf) -> Self {
        SorterOptions {
            memory_limit,
            allow_disk_use,
            spill_dir,
            metrics: None,
            limit: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_limit(mut self, limit: Option<usize>) -> Self {
        self.limit = limit;
        self
    }
}

/// Error raised by a blocking stage that ran out of memory without
/// permission to spill.
pub fn memory_limit_error(stage: &str, limit: u64) -> QuarryError {
    QuarryError::new(
        ErrorCode::QueryExceededMemoryLimitNoDiskUseAllowed,
        format!(
            "{} exceeded memory limit of {} bytes, but did not opt in to external sorting",
            stage, limit
        ),
    )
}

pub struct Sorter<K, V> {
    buffer: Vec<(K, V)>,
    buffered_bytes: u64,
    runs: Vec<SpillFile>,
    options: SorterOptions,
    stage: &'static str,
}

impl<K, V> Sorter<K, V>
where
    K: Ord + Serialize + DeserializeOwned,
    V: Serialize + DeserializeOwned,
{
    pub fn new(stage: &'static str, options: SorterOptions) -> Self {
        Sorter {
            buffer: Vec::new(),
            buffered_bytes: 0,
            runs: Vec::new(),
            options,
            stage,
        }
    }

    /// Add a record whose in-memory footprint is roughly `size` bytes.
    pub fn push(&mut self, key: K, value: V, size: usize) -> Result<()> {
        self.buffer.push((key, value));
        self.buffered_bytes += size as u64;
        if self.buffered_bytes > self.options.memory_limit {
            self.shrink_or_spill()?;
        }
        Ok(())
    }

    pub fn spilled_runs(&self) -> usize {
        self.runs.len()
    }

    fn shrink_or_spill(&mut self) -> Result<()> {
        // A top-k sort can often stay in memory by discarding the tail.
        if let Some(limit) = self.options.limit {
            if self.buffer.len() > limit {
                let per_record = self.buffered_bytes / self.buffer.len() as u64;
                self.buffer.sort_by(|a, b| a.0.cmp(&b.0));
                self.buffer.truncate(limit);
                self.buffered_bytes = per_record * self.buffer.len() as u64;
                if self.buffered_bytes <= self.options.memory_limit {
                    return Ok(());
                }
            }
        }
        if !self.options.allow_disk_use {
            return Err(memory_limit_error(self.stage, self.options.memory_limit));
        }
        self.spill()
    }

    fn spill(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        self.buffer.sort_by(|a, b| a.0.cmp(&b.0));
        if let Some(limit) = self.options.limit {
            self.buffer.truncate(limit);
        }
        let mut writer = SpillWriter::create(&self.options.spill_dir)?;
        for record in self.buffer.drain(..) {
            writer.write(&record)?;
        }
        let run = writer.finish(self.options.metrics.as_deref())?;
        log_debug!(
            "{} spilled run {} ({} records, {} bytes)",
            self.stage,
            self.runs.len(),
            run.records(),
            run.len_bytes()
        );
        self.runs.push(run);
        self.buffered_bytes = 0;
        Ok(())
    }

    /// Finish input and return the records in key order.
    pub fn finish(mut self) -> Result<SortedStream<K, V>> {
        let limit = self.options.limit;
        if self.runs.is_empty() {
            self.buffer.sort_by(|a, b| a.0.cmp(&b.0));
            if let Some(limit) = limit {
                self.buffer.truncate(limit);
            }
            return Ok(SortedStream {
                source: Source::Memory(self.buffer.into_iter()),
                remaining: limit,
            });
        }
        self.spill()?;
        let mut readers: Vec<SpillReader<(K, V)>> = self.runs.iter().map(|r| r.reader()).collect();
        let mut heap = BinaryHeap::with_capacity(readers.len());
        for (run, reader) in readers.iter_mut().enumerate() {
            if let Some((key, value)) = reader.next_record()? {
                heap.push(HeapItem { key, value, run });
            }
        }
        Ok(SortedStream {
            source: Source::Merge { readers, heap },
            remaining: limit,
        })
    }
}

struct HeapItem<K, V> {
    key: K,
    value: V,
    run: usize,
}

impl<K: Ord, V> PartialEq for HeapItem<K, V> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<K: Ord, V> Eq for HeapItem<K, V> {}

impl<K: Ord, V> PartialOrd for HeapItem<K, V> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<K: Ord, V> Ord for HeapItem<K, V> {
    // Reversed: BinaryHeap is a max-heap and we want the smallest key, then
    // the earliest run.
    fn cmp(&self, other: &Self) -> Ordering {
        other.key.cmp(&self.key).then_with(|| other.run.cmp(&self.run))
    }
}

enum Source<K, V> {
    Memory(std::vec::IntoIter<(K, V)>),
    Merge {
        readers: Vec<SpillReader<(K, V)>>,
        heap: BinaryHeap<HeapItem<K, V>>,
    },
}

pub struct SortedStream<K, V> {
    source: Source<K, V>,
    remaining: Option<usize>,
}

impl<K, V> SortedStream<K, V>
where
    K: Ord + DeserializeOwned,
    V: DeserializeOwned,
{
    pub fn next_record(&mut self) -> Result<Option<(K, V)>> {
        if self.remaining == Some(0) {
            return Ok(None);
        }
        let next = match &mut self.source {
            Source::Memory(iter) => iter.next(),
            Source::Merge { readers, heap } => match heap.pop() {
                Some(item) => {
                    if let Some((key, value)) = readers[item.run].next_record()? {
                        heap.push(HeapItem {
                            key,
                            value,
                            run: item.run,
                        });
                    }
                    Some((item.key, item.value))
                }
                None => None,
            },
        };
        if next.is_some() {
            if let Some(remaining) = &mut self.remaining {
                *remaining -= 1;
            }
        }
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(dir: &std::path::Path, limit: u64, disk: bool) -> SorterOptions {
        SorterOptions::new(limit, disk, dir.to_path_buf())
    }

    fn drain(mut stream: SortedStream<i64, u32>) -> Vec<(i64, u32)> {
        let mut out = Vec::new();
        while let Some(rec) = stream.next_record().unwrap() {
            out.push(rec);
        }
        out
    }

    #[test]
    fn test_in_memory_sort_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let mut sorter = Sorter::new("$sort", options(dir.path(), 1 << 20, false));
        for (i, key) in [3i64, 1, 3, 2, 1].iter().enumerate() {
            sorter.push(*key, i as u32, 16).unwrap();
        }
        let out = drain(sorter.finish().unwrap());
        assert_eq!(out, vec![(1, 1), (1, 4), (2, 3), (3, 0), (3, 2)]);
    }

    #[test]
    fn test_spilled_merge_matches_memory_sort() {
        let dir = tempfile::tempdir().unwrap();
        let metrics = Arc::new(Metrics::new());
        let mut sorter = Sorter::new("$sort", options(dir.path(), 100, true).with_metrics(metrics.clone()));
        let keys: Vec<i64> = (0..200).map(|i| (i * 37) % 50).collect();
        for (i, key) in keys.iter().enumerate() {
            sorter.push(*key, i as u32, 16).unwrap();
        }
        assert!(sorter.spilled_runs() > 1);
        let out = drain(sorter.finish().unwrap());

        let mut expected: Vec<(i64, u32)> = keys.iter().enumerate().map(|(i, k)| (*k, i as u32)).collect();
        expected.sort_by_key(|r| r.0);
        assert_eq!(out, expected);
        assert!(metrics.spills.get() > 1);
    }

    #[test]
    fn test_limit_without_disk() {
        let dir = tempfile::tempdir().unwrap();
        let mut sorter = Sorter::new("$sort", options(dir.path(), 64, false).with_limit(Some(2)));
        for i in (0..100i64).rev() {
            sorter.push(i, 0, 16).unwrap();
        }
        let out = drain(sorter.finish().unwrap());
        assert_eq!(out.iter().map(|r| r.0).collect::<Vec<_>>(), vec![0, 1]);
    }

    #[test]
    fn test_memory_limit_without_disk_use() {
        let dir = tempfile::tempdir().unwrap();
        let mut sorter: Sorter<i64, u32> = Sorter::new("$sort", options(dir.path(), 32, false));
        sorter.push(1, 0, 16).unwrap();
        sorter.push(2, 0, 16).unwrap();
        let err = sorter.push(3, 0, 16).unwrap_err();
        assert_eq!(err.code(), ErrorCode::QueryExceededMemoryLimitNoDiskUseAllowed);
    }
}
