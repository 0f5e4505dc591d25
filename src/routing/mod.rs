//! Route aggregation
//!
//! A route is served by an ordered list of mappings, each binding it to one
//! connector endpoint. The engine consumes that list according to the
//! route's strategy:
//! - `priority_order` / `first_success`: first success wins
//! - `all_parallel`: every mapping concurrently, successes as a list
//! - `merge_results`: every mapping concurrently, successes deep-merged
//! - `chain`: each response feeds the next mapping's request

pub mod engine;
pub mod mapping;
pub mod merge;
pub mod transform;

pub use engine::{build_request, AggregationEngine, RouteOutcome};
pub use mapping::{AggregationStrategy, CachePolicy, MappingSuccess, RouteConfig, RouteMapping};
pub use merge::deep_merge;
pub use transform::{apply_request, apply_response, Transform};
