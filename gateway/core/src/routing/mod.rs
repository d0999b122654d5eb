//! Edge-vs-Cloud Query Routing
//!
//! ```text
//! +------------------+
//! |  RoutingEngine   |  <-- entry point for every image query
//! +--------+---------+
//!          |
//!          v
//! +------------------+     +----------------------+
//! |  DetectorPolicy  | <-- | DetectorMetadataCache|
//! +--------+---------+     +----------------------+
//!          |
//!    +-----+------+-------------+
//!    |            |             |
//!    v            v             v
//! +------+   +---------+   +------------+
//! | Edge |   |  Cloud  |   | QueueWriter|  <-- outage / audit / escalation
//! +------+   +---------+   +------------+
//! ```

pub mod engine;
pub mod policy;

pub use engine::{
    Collaborators, EngineError, ImageQueryRequest, RouteError, RoutedResponse, RoutingEngine,
};
pub use policy::{AuditSampler, ConnectivityState, CooldownTracker, DetectorPolicy};
