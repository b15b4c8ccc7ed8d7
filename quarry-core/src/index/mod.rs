// quarry-core/src/index/mod.rs
//! Secondary indexes.
//!
//! ```text
//! index
//!   ├── key         IndexKey / KeyPattern, descending components
//!   ├── keygen      document -> keys, multikey detection
//!   ├── bounds      interval lists per key field
//!   ├── tree        versioned ordered entries (key, record id)
//!   ├── descriptor  parsed index spec and options
//!   └── build       two-phase build state and side-write queue
//! ```

pub mod bounds;
pub mod build;
pub mod descriptor;
pub mod key;
pub mod keygen;
pub mod tree;

pub use bounds::{IndexBounds, Interval, OrderedIntervalList};
pub use build::{BuildPhase, DrainStats, IndexBuild, SideWrite};
pub use descriptor::{IndexDescriptor, ID_INDEX_NAME};
pub use key::{Direction, IndexKey, KeyPart, KeyPattern};
pub use keygen::{generate_keys, path_values, GeneratedKeys};
pub use tree::{IndexEntryKey, IndexTree, ScanBatch, UniqueConstraint};
