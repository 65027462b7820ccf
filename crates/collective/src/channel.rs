//! Collective operations over an active process group
//!
//! In single-rank mode (distributed disabled, or a group of one) every
//! operation degenerates to a local no-op, so calling code is identical on one
//! rank and on many.

use runtime_core::{BincodeCodec, Codec, Error, NdArray, Numeric, Rank, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::context::ProcessGroupContext;
use crate::transport::{GroupId, Work};

/// Broadcast, all-reduce and barrier bound to one [`ProcessGroupContext`]
pub struct CollectiveChannel<C: Codec = BincodeCodec> {
    context: Arc<ProcessGroupContext>,
    codec: C,
}

impl CollectiveChannel<BincodeCodec> {
    pub fn new(context: Arc<ProcessGroupContext>) -> Self {
        Self::with_codec(context, BincodeCodec)
    }
}

impl<C: Codec> CollectiveChannel<C> {
    /// Use `codec` to serialize generic broadcast payloads
    pub fn with_codec(context: Arc<ProcessGroupContext>, codec: C) -> Self {
        Self { context, codec }
    }

    pub fn context(&self) -> &Arc<ProcessGroupContext> {
        &self.context
    }

    /// Broadcast a numeric value natively; every rank returns the source's value
    #[instrument(skip(self, value))]
    pub fn broadcast_numeric(&self, value: Numeric, source: Rank) -> Result<Numeric> {
        self.context.ensure_activated("broadcast")?;
        if !self.context.is_distributed() {
            self.check_local_source(source)?;
            return Ok(value);
        }

        let mut value = value;
        self.context
            .transport()
            .broadcast(GroupId::WORLD, &mut value, source)?;
        Ok(value)
    }

    /// Broadcast an arbitrary serializable value.
    ///
    /// Every rank passes a value; only the source's survives. The payload is
    /// sent as a length followed by a byte buffer on the stat group.
    #[instrument(skip(self, value))]
    pub fn broadcast<T>(&self, value: T, source: Rank) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
    {
        self.context.ensure_activated("broadcast")?;
        if !self.context.is_distributed() {
            self.check_local_source(source)?;
            return Ok(value);
        }

        let rank = self.context.rank()?;
        let size = self.context.size()?;
        if source >= size {
            return Err(Error::RankMismatch {
                source_rank: source,
                rank,
            });
        }

        let group = self.context.stat_group()?;
        let transport = self.context.transport();

        let encoded = if rank == source {
            self.codec.encode(&value)?
        } else {
            Vec::new()
        };

        let mut length = Numeric::Int(encoded.len() as i64);
        transport.broadcast(group, &mut length, source)?;
        let length = length
            .as_i64()
            .and_then(|len| usize::try_from(len).ok())
            .ok_or_else(|| Error::Collective {
                operation: "broadcast".to_string(),
                message: format!("invalid payload length {}", length),
            })?;

        let buffer = if rank == source {
            encoded
        } else {
            vec![0u8; length]
        };
        let mut buffer = Numeric::Array(NdArray::from_bytes(buffer));
        transport.broadcast(group, &mut buffer, source)?;

        if rank == source {
            return Ok(value);
        }
        debug!(source, bytes = length, "Received broadcast payload");
        self.codec.decode(&buffer.into_bytes()?)
    }

    /// Sum `value` across ranks, blocking until the result is available
    pub fn all_reduce(&self, value: Numeric) -> Result<Numeric> {
        match self.all_reduce_async(value.clone())?.pop() {
            Some(pending) => pending.wait(),
            None => Ok(value),
        }
    }

    /// Issue an all-reduce without waiting.
    ///
    /// Returns no handles in single-rank mode, where the value is already final.
    pub fn all_reduce_async(&self, value: Numeric) -> Result<Vec<PendingReduce>> {
        self.context.ensure_activated("all_reduce")?;
        if !self.context.is_distributed() {
            return Ok(Vec::new());
        }

        value.ensure_reducible()?;
        let work = self
            .context
            .transport()
            .all_reduce(GroupId::WORLD, value)?;
        Ok(vec![PendingReduce { work }])
    }

    /// Block until every rank arrives
    pub fn barrier(&self) -> Result<()> {
        self.context.ensure_activated("barrier")?;
        if !self.context.is_distributed() {
            return Ok(());
        }

        let group = self.context.stat_group()?;
        self.context.transport().barrier(group)
    }

    /// In single-rank mode only rank 0 may be the source
    fn check_local_source(&self, source: Rank) -> Result<()> {
        let rank = self.context.rank()?;
        if rank != source || source != 0 {
            return Err(Error::RankMismatch {
                source_rank: source,
                rank,
            });
        }
        Ok(())
    }
}

/// Handle to an all-reduce issued by [`CollectiveChannel::all_reduce_async`]
pub struct PendingReduce {
    work: Box<dyn Work>,
}

impl PendingReduce {
    /// Block until the reduced value is available
    pub fn wait(self) -> Result<Numeric> {
        self.work.wait()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ActivateOptions, LocalTransport};
    use runtime_core::JsonCodec;
    use serde::Deserialize;
    use std::thread;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct RunInfo {
        session_time: String,
        seed: u64,
    }

    fn spawn_ranks<T, F>(world_size: usize, f: F) -> Vec<T>
    where
        T: Send + 'static,
        F: Fn(CollectiveChannel) -> T + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let handles: Vec<_> = LocalTransport::world(world_size)
            .into_iter()
            .map(|transport| {
                let f = Arc::clone(&f);
                thread::spawn(move || {
                    let context = ProcessGroupContext::new(transport);
                    let _guard = context.activate(ActivateOptions::enabled()).unwrap();
                    f(CollectiveChannel::new(context))
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    }

    fn local_channel(options: ActivateOptions) -> (CollectiveChannel, crate::ActivationGuard) {
        let context = ProcessGroupContext::new(LocalTransport::world(1).remove(0));
        let guard = context.activate(options).unwrap();
        (CollectiveChannel::new(context), guard)
    }

    #[test]
    fn test_disabled_operations_are_identity() {
        let (channel, _guard) = local_channel(ActivateOptions::disabled());

        assert_eq!(channel.all_reduce(Numeric::Int(5)).unwrap(), Numeric::Int(5));
        assert!(channel.all_reduce_async(Numeric::Int(5)).unwrap().is_empty());
        assert_eq!(channel.broadcast("hello".to_string(), 0).unwrap(), "hello");
        assert!(matches!(
            channel.broadcast("hello".to_string(), 3),
            Err(Error::RankMismatch { source_rank: 3, rank: 0 })
        ));
        channel.barrier().unwrap();
    }

    #[test]
    fn test_single_rank_enabled_rejects_nonzero_source() {
        let (channel, _guard) = local_channel(ActivateOptions::enabled().with_local_rank(0));

        assert_eq!(channel.broadcast(7u32, 0).unwrap(), 7);
        assert!(matches!(
            channel.broadcast(7u32, 1),
            Err(Error::RankMismatch { source_rank: 1, rank: 0 })
        ));
        assert!(matches!(
            channel.broadcast_numeric(Numeric::Int(1), 2),
            Err(Error::RankMismatch { .. })
        ));
    }

    #[test]
    fn test_requires_activation() {
        let context = ProcessGroupContext::new(LocalTransport::world(1).remove(0));
        let channel = CollectiveChannel::new(context);
        assert!(matches!(channel.barrier(), Err(Error::NotActivated { .. })));
        assert!(matches!(
            channel.all_reduce(Numeric::Int(1)),
            Err(Error::NotActivated { .. })
        ));
    }

    #[test]
    fn test_broadcast_struct_payload() {
        let results = spawn_ranks(3, |channel| {
            let rank = channel.context().rank().unwrap();
            let info = RunInfo {
                session_time: format!("rank-{}", rank),
                seed: rank as u64,
            };
            channel.broadcast(info, 1).unwrap()
        });

        for info in results {
            assert_eq!(info.session_time, "rank-1");
            assert_eq!(info.seed, 1);
        }
    }

    #[test]
    fn test_broadcast_with_json_codec() {
        let handles: Vec<_> = LocalTransport::world(2)
            .into_iter()
            .map(|transport| {
                thread::spawn(move || {
                    let context = ProcessGroupContext::new(transport);
                    let _guard = context.activate(ActivateOptions::enabled()).unwrap();
                    let channel = CollectiveChannel::with_codec(context, JsonCodec);
                    let rank = channel.context().rank().unwrap();
                    channel.broadcast(vec![rank; 3], 0).unwrap()
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), vec![0, 0, 0]);
        }
    }

    #[test]
    fn test_all_reduce_async_then_wait() {
        let results = spawn_ranks(2, |channel| {
            let rank = channel.context().rank().unwrap() as f64;
            let mut value = channel.all_reduce_async(Numeric::Float(rank + 0.5)).unwrap();
            let mut count = channel.all_reduce_async(Numeric::Int(1)).unwrap();
            (
                value.pop().unwrap().wait().unwrap(),
                count.pop().unwrap().wait().unwrap(),
            )
        });

        for (value, count) in results {
            assert_eq!(value, Numeric::Float(2.0));
            assert_eq!(count, Numeric::Int(2));
        }
    }

    #[test]
    fn test_all_reduce_rejects_bytes() {
        let results = spawn_ranks(2, |channel| {
            let bytes = Numeric::Array(NdArray::from_bytes(vec![1, 2]));
            let rejected = channel.all_reduce(bytes).is_err();
            // keep ranks in step after the local rejection
            channel.barrier().unwrap();
            rejected
        });
        assert!(results.into_iter().all(|rejected| rejected));
    }

    #[test]
    fn test_broadcast_numeric_and_barrier() {
        let results = spawn_ranks(2, |channel| {
            let rank = channel.context().rank().unwrap();
            let value = Numeric::from(vec![rank as f64; 2]);
            let value = channel.broadcast_numeric(value, 1).unwrap();
            channel.barrier().unwrap();
            value
        });
        assert!(results.iter().all(|v| *v == Numeric::from(vec![1.0, 1.0])));
    }
}
