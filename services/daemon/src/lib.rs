//! fleet daemon library.
//!
//! Every cluster member runs a `fleetd` daemon. Its main job is answering
//! "list all instances in this project" from state that is spread across the
//! cluster: the daemon renders the instances it hosts, asks the other members
//! for theirs, and merges everything into one ordered answer.
//!
//! ## Architecture
//!
//! ```text
//! InstanceLister::list_with_retry          (RetryPolicy, store lock contention)
//! └── InstanceLister::list
//!     ├── topology::resolve                (ClusterStore transaction)
//!     ├── RemoteFetcher                    (one task per remote node, timeout)
//!     ├── RenderPool                       (bounded local rendering)
//!     └── ResultAccumulator                (shared by all producers)
//! ```
//!
//! ## Modules
//!
//! - `listing`: request model and the listing pipeline
//! - `topology`, `remote`, `pool`, `aggregate`: pipeline stages
//! - `store`, `instance`: backend interfaces
//! - `memory`: in-memory backends for development mode and tests
//! - `client`: reqwest connector to other cluster members
//! - `update`, `operation`: instance updates run as background operations

pub mod aggregate;
pub mod api;
pub mod client;
pub mod config;
pub mod error;
pub mod instance;
pub mod listing;
pub mod memory;
pub mod operation;
pub mod pool;
pub mod remote;
pub mod state;
pub mod store;
pub mod topology;
pub mod update;

// Re-export commonly used types
pub use error::ListingError;
pub use listing::{InstanceLister, ListingRequest, ListingResult, Recursion, Route};
pub use state::AppState;
