//! Collective - process groups and cross-rank communication
//!
//! [`ProcessGroupContext`] manages activation and group membership,
//! [`CollectiveChannel`] runs broadcast, all-reduce and barrier on top of it,
//! and [`Transport`] is the seam to the actual communication backend.

pub mod channel;
pub mod context;
pub mod local;
pub mod transport;

pub use channel::{CollectiveChannel, PendingReduce};
pub use context::{
    resolve_local_rank, ActivateOptions, ActivationGuard, ProcessGroupContext, LOCAL_RANK_ENV,
};
pub use local::LocalTransport;
pub use transport::{GroupId, Transport, Work};
