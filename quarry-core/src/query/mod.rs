// quarry-core/src/query/mod.rs
//! Find-style query processing.
//!
//! ```text
//! query
//!   ├── operators   $eq/$gt/... predicate parsing
//!   ├── matcher     filter documents -> MatchExpr trees
//!   ├── projection  inclusion/exclusion/computed projections
//!   ├── update      $set/$unset/$inc/$push and replacements
//!   ├── sort        sort specs and sort keys
//!   ├── shape       literal-free query shapes (plan cache keys)
//!   ├── plan_cache  shape -> cached access path
//!   ├── stages      executable plan stages (pull-based)
//!   └── planner     candidate enumeration, trials, executors
//! ```

pub mod matcher;
pub mod operators;
pub mod plan_cache;
pub mod planner;
pub mod projection;
pub mod shape;
pub mod sort;
pub mod stages;
pub mod update;

pub use matcher::{MatchExpr, Matcher};
pub use plan_cache::{CacheLookup, CacheState, PlanCache, PlanChoice};
pub use planner::{distinct, plan_distinct_documents, plan_find, FindQuery, PlanExecutor};
pub use projection::Projection;
pub use shape::QueryShape;
pub use sort::SortSpec;
pub use stages::{Member, PlanStage, StageState};
pub use update::UpdateSpec;
