//! Collective transport trait definition
//!
//! A transport is the external communication backend (NCCL, Gloo, MPI, or the
//! in-process [`LocalTransport`](crate::LocalTransport)). Every operation is
//! collective: all ranks of a group must issue it, in the same order.

use runtime_core::{Numeric, Rank, Result};
use std::fmt;

/// Opaque handle to a communication group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupId(pub u64);

impl GroupId {
    /// The default group spanning every rank
    pub const WORLD: GroupId = GroupId(0);
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == GroupId::WORLD {
            f.write_str("world")
        } else {
            write!(f, "group-{}", self.0)
        }
    }
}

/// In-flight collective operation
pub trait Work: Send {
    /// Block until every rank has contributed and return the result
    fn wait(self: Box<Self>) -> Result<Numeric>;
}

/// Communication backend connecting the ranks of one training run
pub trait Transport: Send + Sync {
    /// Backend name, for logs
    fn backend(&self) -> &str;

    /// Global rank of this process
    fn rank(&self) -> Rank;

    /// Number of ranks in the world group
    fn world_size(&self) -> usize;

    /// Bring up the world group
    fn init(&self) -> Result<()>;

    /// Tear down the world group
    fn shutdown(&self) -> Result<()>;

    /// Create an auxiliary group spanning every rank
    fn new_group(&self) -> Result<GroupId>;

    /// Destroy an auxiliary group created by [`Transport::new_group`]
    fn destroy_group(&self, group: GroupId) -> Result<()>;

    /// Replace `value` on every rank with the value held by `source`.
    ///
    /// Non-source ranks must pass a buffer of the same kind and shape.
    fn broadcast(&self, group: GroupId, value: &mut Numeric, source: Rank) -> Result<()>;

    /// Issue an elementwise sum across ranks; the result is read through [`Work::wait`]
    fn all_reduce(&self, group: GroupId, value: Numeric) -> Result<Box<dyn Work>>;

    /// Block until every rank of the group arrives
    fn barrier(&self, group: GroupId) -> Result<()>;
}
