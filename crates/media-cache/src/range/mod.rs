//! # Progressive Range Cache
//!
//! Caches arbitrary byte intervals of remote media resources on local disk
//! and serves overlapping consumer requests from a single upstream transfer
//! per resource.
//!
//! ## Components
//!
//! - [`RangeSet`]: canonical set of downloaded intervals
//! - [`ResourceMetadata`]: persisted per-origin record
//! - [`MetadataStore`]: directory-backed record and data file storage
//! - [`RangeCacheManager`]: the actor consumers talk to
//! - `FetchOperation`: per-origin transfer and pending request fan-out

mod fetch;
mod manager;
mod metadata;
mod range_set;
mod request;
mod store;

pub use fetch::FetchState;
pub use manager::{CacheStats, RangeCacheManager};
pub use metadata::ResourceMetadata;
pub use range_set::{ByteRange, RangeSet};
pub use request::{ContentInfo, PendingRequest, PreloadOutcome, RequestEvent, RequestId};
pub use store::MetadataStore;

pub(crate) use metadata::unix_millis;
