//! Connection and request descriptors
//!
//! - [`types`]: `Connection`, `Request`, `Mechanism`, `IpContext`, `Path`
//! - [`metadata`]: process-local per-connection key-value map

pub mod metadata;
pub mod types;

pub use metadata::MetadataMap;
pub use types::{
    Connection, ConnectionContext, IpContext, Mechanism, Path, PathSegment, Request, State,
};
