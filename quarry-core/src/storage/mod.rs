// quarry-core/src/storage/mod.rs
//! Record storage, durability and spill files.
//!
//! ```text
//! storage
//!   ├── record_store   versioned records per collection
//!   ├── journal        append-only commit log (checksummed frames)
//!   ├── checkpoint     consistent image at one timestamp
//!   ├── spill / sorter temp files and external merge sort
//!   └── frame          [len][crc32][bincode] codec
//! ```

pub mod checkpoint;
pub mod frame;
pub mod journal;
pub mod record_store;
pub mod sorter;
pub mod spill;

pub use checkpoint::{CollectionImage, IndexImage};
pub use journal::Journal;
pub use record_store::{RecordId, RecordStore, ScanDirection};
pub use sorter::{memory_limit_error, SortedStream, Sorter, SorterOptions};
pub use spill::{SpillFile, SpillReader, SpillWriter};
