//! sluice-query: interactive queries over the state of a running fleet.
//! - `ClusterMetadata`: which instance owns which partitions, refreshed on membership change
//! - `QueryRouter`: point lookups routed to the owner, scatter-gather counts across the fleet
//! - `HttpRemote`: the reqwest client one instance uses to ask another
//! - `http::router`: the axum surface (`/store/...`, `/metrics`)

pub mod error;
pub mod http;
pub mod metadata;
pub mod remote;
pub mod router;

pub use error::QueryError;
pub use metadata::{ClusterMetadata, HostInfo, InstanceMetadata};
pub use remote::{HttpRemote, RemoteQuery};
pub use router::QueryRouter;
