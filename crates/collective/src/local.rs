//! In-process transport connecting ranks that run as threads of one process
//!
//! Every rank holds its own [`LocalTransport`]; all of them share a rendezvous
//! table keyed by `(generation, group, sequence)`. Ranks issue collectives in
//! the same order, so the n-th operation on a group lines up across ranks
//! without any extra coordination.

use parking_lot::{Condvar, Mutex};
use runtime_core::{Error, Numeric, Rank, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::transport::{GroupId, Transport, Work};

type SlotKey = (u64, GroupId, u64);

/// Rendezvous point for one collective operation
struct Slot {
    op: &'static str,
    source: Option<Rank>,
    arrived: usize,
    departed: usize,
    value: Option<Numeric>,
    failure: Option<String>,
}

impl Slot {
    fn new(op: &'static str) -> Self {
        Self {
            op,
            source: None,
            arrived: 0,
            departed: 0,
            value: None,
            failure: None,
        }
    }
}

struct Shared {
    world_size: usize,
    timeout: Option<Duration>,
    slots: Mutex<HashMap<SlotKey, Slot>>,
    ready: Condvar,
}

impl Shared {
    /// Deposit this rank's contribution without waiting for peers
    fn issue(
        &self,
        key: SlotKey,
        op: &'static str,
        rank: Rank,
        contribute: impl FnOnce(&mut Slot) -> std::result::Result<(), String>,
    ) {
        let mut slots = self.slots.lock();
        let slot = slots.entry(key).or_insert_with(|| Slot::new(op));

        if slot.op != op {
            let message = format!("rank {} issued {} while peers issued {}", rank, op, slot.op);
            slot.failure.get_or_insert(message);
        } else if let Err(message) = contribute(slot) {
            slot.failure.get_or_insert(message);
        }

        slot.arrived += 1;
        if slot.arrived == self.world_size {
            self.ready.notify_all();
        }
    }

    /// Wait until every rank has arrived, then read the outcome
    fn complete<R>(
        &self,
        key: SlotKey,
        op: &'static str,
        read: impl FnOnce(&Slot) -> std::result::Result<R, String>,
    ) -> Result<R> {
        let deadline = self.timeout.map(|timeout| Instant::now() + timeout);
        let mut slots = self.slots.lock();

        loop {
            let arrived = slots.get(&key).map(|slot| slot.arrived).unwrap_or(0);
            if arrived >= self.world_size {
                break;
            }
            match deadline {
                Some(deadline) => {
                    if self.ready.wait_until(&mut slots, deadline).timed_out() {
                        let arrived = slots.get(&key).map(|slot| slot.arrived).unwrap_or(0);
                        if arrived < self.world_size {
                            return Err(Error::Collective {
                                operation: op.to_string(),
                                message: format!(
                                    "timed out with {} of {} ranks arrived",
                                    arrived, self.world_size
                                ),
                            });
                        }
                    }
                }
                None => self.ready.wait(&mut slots),
            }
        }

        let slot = slots.get_mut(&key).ok_or_else(|| Error::Internal {
            message: format!("rendezvous slot for {} vanished", op),
        })?;

        let outcome = match &slot.failure {
            Some(message) => Err(message.clone()),
            None => read(&*slot),
        };

        slot.departed += 1;
        if slot.departed == self.world_size {
            slots.remove(&key);
        }

        outcome.map_err(|message| Error::Collective {
            operation: op.to_string(),
            message,
        })
    }
}

#[derive(Default)]
struct RankState {
    initialized: bool,
    generation: u64,
    next_group: u64,
    sequences: HashMap<GroupId, u64>,
}

/// One rank's endpoint of an in-process world
pub struct LocalTransport {
    rank: Rank,
    shared: Arc<Shared>,
    state: Mutex<RankState>,
}

impl LocalTransport {
    /// Create the endpoints of a world with `world_size` ranks, indexed by rank
    pub fn world(world_size: usize) -> Vec<Arc<LocalTransport>> {
        Self::build(world_size, None)
    }

    /// Like [`LocalTransport::world`], but collectives fail once `timeout` passes
    /// without every rank arriving
    pub fn world_with_timeout(world_size: usize, timeout: Duration) -> Vec<Arc<LocalTransport>> {
        Self::build(world_size, Some(timeout))
    }

    fn build(world_size: usize, timeout: Option<Duration>) -> Vec<Arc<LocalTransport>> {
        let shared = Arc::new(Shared {
            world_size,
            timeout,
            slots: Mutex::new(HashMap::new()),
            ready: Condvar::new(),
        });

        (0..world_size)
            .map(|rank| {
                Arc::new(LocalTransport {
                    rank,
                    shared: Arc::clone(&shared),
                    state: Mutex::new(RankState::default()),
                })
            })
            .collect()
    }

    /// Allocate the next rendezvous key on `group`
    fn next_key(&self, group: GroupId) -> Result<SlotKey> {
        let mut state = self.state.lock();
        if !state.initialized {
            return Err(Error::Collective {
                operation: "issue".to_string(),
                message: format!("rank {} transport is not initialized", self.rank),
            });
        }
        let generation = state.generation;
        let seq = state
            .sequences
            .get_mut(&group)
            .ok_or(Error::UnregisteredGroup { group: group.0 })?;
        let key = (generation, group, *seq);
        *seq += 1;
        Ok(key)
    }
}

impl Transport for LocalTransport {
    fn backend(&self) -> &str {
        "local"
    }

    fn rank(&self) -> Rank {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.shared.world_size
    }

    fn init(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.initialized {
            return Err(Error::Collective {
                operation: "init".to_string(),
                message: format!("rank {} is already initialized", self.rank),
            });
        }
        state.initialized = true;
        state.generation += 1;
        state.next_group = 1;
        state.sequences.clear();
        state.sequences.insert(GroupId::WORLD, 0);

        info!(
            rank = self.rank,
            world_size = self.shared.world_size,
            generation = state.generation,
            "Local transport initialized"
        );
        Ok(())
    }

    fn shutdown(&self) -> Result<()> {
        let mut state = self.state.lock();
        if !state.initialized {
            return Err(Error::Collective {
                operation: "shutdown".to_string(),
                message: format!("rank {} is not initialized", self.rank),
            });
        }
        state.initialized = false;
        state.sequences.clear();

        info!(rank = self.rank, "Local transport shut down");
        Ok(())
    }

    fn new_group(&self) -> Result<GroupId> {
        let mut state = self.state.lock();
        if !state.initialized {
            return Err(Error::Collective {
                operation: "new_group".to_string(),
                message: format!("rank {} transport is not initialized", self.rank),
            });
        }
        let group = GroupId(state.next_group);
        state.next_group += 1;
        state.sequences.insert(group, 0);

        debug!(rank = self.rank, %group, "Created group");
        Ok(group)
    }

    fn destroy_group(&self, group: GroupId) -> Result<()> {
        if group == GroupId::WORLD {
            return Err(Error::Collective {
                operation: "destroy_group".to_string(),
                message: "the world group is torn down by shutdown".to_string(),
            });
        }
        let mut state = self.state.lock();
        state
            .sequences
            .remove(&group)
            .ok_or(Error::UnregisteredGroup { group: group.0 })?;

        debug!(rank = self.rank, %group, "Destroyed group");
        Ok(())
    }

    fn broadcast(&self, group: GroupId, value: &mut Numeric, source: Rank) -> Result<()> {
        if source >= self.shared.world_size {
            return Err(Error::RankMismatch {
                source_rank: source,
                rank: self.rank,
            });
        }

        let key = self.next_key(group)?;
        let payload = (self.rank == source).then(|| value.clone());
        self.shared.issue(key, "broadcast", self.rank, |slot| {
            match slot.source {
                Some(agreed) if agreed != source => {
                    return Err(format!("ranks disagree on source: {} vs {}", agreed, source));
                }
                _ => slot.source = Some(source),
            }
            if let Some(payload) = payload {
                slot.value = Some(payload);
            }
            Ok(())
        });

        let received = self.shared.complete(key, "broadcast", |slot| {
            slot.value
                .clone()
                .ok_or_else(|| "source rank contributed no payload".to_string())
        })?;

        if !same_layout(&received, value) {
            return Err(Error::Collective {
                operation: "broadcast".to_string(),
                message: format!(
                    "rank {} buffer {} {:?} does not match source {} {:?}",
                    self.rank,
                    value.kind(),
                    value.shape(),
                    received.kind(),
                    received.shape()
                ),
            });
        }

        *value = received;
        Ok(())
    }

    fn all_reduce(&self, group: GroupId, value: Numeric) -> Result<Box<dyn Work>> {
        value.ensure_reducible()?;

        let key = self.next_key(group)?;
        self.shared.issue(key, "all_reduce", self.rank, |slot| {
            let sum = match slot.value.take() {
                None => value,
                Some(acc) => acc.checked_add(&value).map_err(|e| e.to_string())?,
            };
            slot.value = Some(sum);
            Ok(())
        });

        Ok(Box::new(LocalWork {
            shared: Arc::clone(&self.shared),
            key,
        }))
    }

    fn barrier(&self, group: GroupId) -> Result<()> {
        let key = self.next_key(group)?;
        self.shared.issue(key, "barrier", self.rank, |_| Ok(()));
        self.shared.complete(key, "barrier", |_| Ok(()))
    }
}

/// Pending all-reduce on a [`LocalTransport`]
struct LocalWork {
    shared: Arc<Shared>,
    key: SlotKey,
}

impl Work for LocalWork {
    fn wait(self: Box<Self>) -> Result<Numeric> {
        self.shared.complete(self.key, "all_reduce", |slot| {
            slot.value
                .clone()
                .ok_or_else(|| "no contributions recorded".to_string())
        })
    }
}

fn same_layout(a: &Numeric, b: &Numeric) -> bool {
    match (a, b) {
        (Numeric::Int(_), Numeric::Int(_)) | (Numeric::Float(_), Numeric::Float(_)) => true,
        (Numeric::Array(x), Numeric::Array(y)) => x.dtype() == y.dtype() && x.shape() == y.shape(),
        _ => false,
    }
}
