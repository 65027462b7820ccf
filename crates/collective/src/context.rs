//! Process group lifecycle
//!
//! A [`ProcessGroupContext`] owns this process's membership in a training
//! group. Activation brings the group up and returns an [`ActivationGuard`];
//! dropping the guard (or calling [`ActivationGuard::deactivate`]) tears down
//! every auxiliary group, then the default group, and resets the identity.

use parking_lot::Mutex;
use runtime_core::{Error, GroupConfig, Rank, Result};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

use crate::transport::{GroupId, Transport};

/// Environment variable consulted for the local rank
pub const LOCAL_RANK_ENV: &str = "LOCAL_RANK";

/// Options for [`ProcessGroupContext::activate`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivateOptions {
    /// Run as a real multi-rank group
    pub enabled: bool,

    /// Explicit local rank; takes priority over `LOCAL_RANK`
    pub local_rank: Option<Rank>,

    /// Backend the transport must report, if set
    pub backend: Option<String>,
}

impl ActivateOptions {
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            ..Self::default()
        }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn with_local_rank(mut self, local_rank: Rank) -> Self {
        self.local_rank = Some(local_rank);
        self
    }

    pub fn with_backend(mut self, backend: impl Into<String>) -> Self {
        self.backend = Some(backend.into());
        self
    }

    pub fn from_config(config: &GroupConfig) -> Self {
        Self {
            enabled: config.enabled,
            local_rank: config.local_rank,
            backend: Some(config.backend.clone()),
        }
    }
}

#[derive(Debug)]
struct ActiveGroup {
    enabled: bool,
    rank: Rank,
    size: usize,
    local_rank: Rank,
    extra_groups: HashSet<GroupId>,
    stat_group: Option<GroupId>,
}

impl ActiveGroup {
    fn single() -> Self {
        Self {
            enabled: false,
            rank: 0,
            size: 1,
            local_rank: 0,
            extra_groups: HashSet::new(),
            stat_group: None,
        }
    }
}

#[derive(Debug, Default)]
enum ContextState {
    #[default]
    Inactive,
    Active(ActiveGroup),
}

/// Membership of this process in a training group
pub struct ProcessGroupContext {
    transport: Arc<dyn Transport>,
    state: Mutex<ContextState>,
}

impl ProcessGroupContext {
    pub fn new(transport: Arc<dyn Transport>) -> Arc<Self> {
        Arc::new(Self {
            transport,
            state: Mutex::new(ContextState::Inactive),
        })
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Enter the active state.
    ///
    /// With `enabled == false` the context behaves as a single-rank group and
    /// no transport call is made. If anything fails after the default group
    /// is up, it is torn down again before the error is returned.
    #[instrument(skip(self), fields(backend = self.transport.backend()))]
    pub fn activate(self: &Arc<Self>, options: ActivateOptions) -> Result<ActivationGuard> {
        let mut state = self.state.lock();
        if matches!(*state, ContextState::Active(_)) {
            return Err(Error::AlreadyActivated);
        }
        if let Some(backend) = &options.backend {
            if backend.as_str() != self.transport.backend() {
                return Err(Error::InvalidConfig {
                    message: format!(
                        "group backend {:?} does not match transport backend {:?}",
                        backend,
                        self.transport.backend()
                    ),
                });
            }
        }

        if !options.enabled {
            *state = ContextState::Active(ActiveGroup::single());
            info!("Process group activated in single-rank mode");
            return Ok(ActivationGuard::new(Arc::clone(self)));
        }

        self.transport.init()?;
        let rank = self.transport.rank();
        let size = self.transport.world_size();
        *state = ContextState::Active(ActiveGroup {
            enabled: true,
            rank,
            size,
            local_rank: rank,
            extra_groups: HashSet::new(),
            stat_group: None,
        });
        drop(state);

        // From here on the guard owns teardown, including on the error path.
        let guard = ActivationGuard::new(Arc::clone(self));

        let env = std::env::var(LOCAL_RANK_ENV).ok();
        let local_rank = resolve_local_rank(options.local_rank, env.as_deref(), rank)?;
        if let ContextState::Active(group) = &mut *self.state.lock() {
            group.local_rank = local_rank;
        }

        info!(rank, size, local_rank, "Process group activated");
        Ok(guard)
    }

    pub fn is_activated(&self) -> bool {
        matches!(*self.state.lock(), ContextState::Active(_))
    }

    /// True inside an activation with distributed mode on
    pub fn is_enabled(&self) -> bool {
        matches!(&*self.state.lock(), ContextState::Active(group) if group.enabled)
    }

    /// True when collectives actually have peers to talk to
    pub fn is_distributed(&self) -> bool {
        matches!(&*self.state.lock(), ContextState::Active(group) if group.enabled && group.size > 1)
    }

    pub fn rank(&self) -> Result<Rank> {
        self.with_active("rank", |group| Ok(group.rank))
    }

    pub fn size(&self) -> Result<usize> {
        self.with_active("size", |group| Ok(group.size))
    }

    pub fn local_rank(&self) -> Result<Rank> {
        self.with_active("local_rank", |group| Ok(group.local_rank))
    }

    /// True unless this is an enabled group on a non-zero rank
    pub fn is_master(&self) -> bool {
        match &*self.state.lock() {
            ContextState::Active(group) if group.enabled => group.rank == 0,
            _ => true,
        }
    }

    /// True unless this is an enabled group on a non-zero local rank
    pub fn is_local_master(&self) -> bool {
        match &*self.state.lock() {
            ContextState::Active(group) if group.enabled => group.local_rank == 0,
            _ => true,
        }
    }

    /// Per-rank share of a global batch size; lower ranks take the remainder
    pub fn split_batch_size(&self, batch_size: usize) -> usize {
        match &*self.state.lock() {
            ContextState::Active(group) if group.enabled && group.size > 0 => {
                let extra = usize::from(group.rank < batch_size % group.size);
                batch_size / group.size + extra
            }
            _ => batch_size,
        }
    }

    /// Create an auxiliary group and track it for teardown
    pub fn register_extra_group(&self) -> Result<GroupId> {
        let mut state = self.state.lock();
        let group = Self::enabled_group(&mut state, "register_extra_group")?;
        let id = self.transport.new_group()?;
        group.extra_groups.insert(id);
        debug!(group = %id, "Registered extra group");
        Ok(id)
    }

    /// Destroy an auxiliary group. With `None`, an arbitrary registered group
    /// is removed; `Ok(None)` means nothing was registered.
    pub fn unregister_extra_group(&self, group: Option<GroupId>) -> Result<Option<GroupId>> {
        let mut state = self.state.lock();
        let active = Self::enabled_group(&mut state, "unregister_extra_group")?;

        let id = match group {
            Some(id) => {
                if !active.extra_groups.remove(&id) {
                    return Err(Error::UnregisteredGroup { group: id.0 });
                }
                id
            }
            None => match active.extra_groups.iter().next().copied() {
                Some(id) => {
                    active.extra_groups.remove(&id);
                    id
                }
                None => return Ok(None),
            },
        };
        if active.stat_group == Some(id) {
            active.stat_group = None;
        }

        self.transport.destroy_group(id)?;
        debug!(group = %id, "Unregistered extra group");
        Ok(Some(id))
    }

    /// Auxiliary group used by generic payload broadcasts and barriers,
    /// created on first use and destroyed with the other extra groups
    pub fn stat_group(&self) -> Result<GroupId> {
        let mut state = self.state.lock();
        let active = Self::enabled_group(&mut state, "stat_group")?;
        if let Some(id) = active.stat_group {
            return Ok(id);
        }
        let id = self.transport.new_group()?;
        active.extra_groups.insert(id);
        active.stat_group = Some(id);
        debug!(group = %id, "Created stat group");
        Ok(id)
    }

    /// Fail unless inside an activation
    pub fn ensure_activated(&self, operation: &str) -> Result<()> {
        self.with_active(operation, |_| Ok(()))
    }

    fn with_active<T>(&self, operation: &str, f: impl FnOnce(&ActiveGroup) -> Result<T>) -> Result<T> {
        match &*self.state.lock() {
            ContextState::Active(group) => f(group),
            ContextState::Inactive => Err(Error::NotActivated {
                operation: operation.to_string(),
            }),
        }
    }

    fn enabled_group<'a>(state: &'a mut ContextState, operation: &str) -> Result<&'a mut ActiveGroup> {
        match state {
            ContextState::Active(group) if group.enabled => Ok(group),
            ContextState::Active(_) => Err(Error::NotEnabled {
                operation: operation.to_string(),
            }),
            ContextState::Inactive => Err(Error::NotActivated {
                operation: operation.to_string(),
            }),
        }
    }

    /// Leave the active state. Every step runs even if an earlier one fails;
    /// the first error is returned.
    fn teardown(&self) -> Result<()> {
        let mut state = self.state.lock();
        let ContextState::Active(mut group) = std::mem::take(&mut *state) else {
            return Ok(());
        };

        let mut first_error = None;
        for id in group.extra_groups.drain() {
            if let Err(e) = self.transport.destroy_group(id) {
                warn!(group = %id, error = %e, "Failed to destroy extra group");
                first_error.get_or_insert(e);
            }
        }

        if group.enabled {
            if let Err(e) = self.transport.shutdown() {
                warn!(error = %e, "Failed to shut down default group");
                first_error.get_or_insert(e);
            }
        }

        info!(rank = group.rank, "Process group deactivated");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Scope of one activation; tears the group down when dropped
#[must_use = "dropping the guard deactivates the process group"]
pub struct ActivationGuard {
    context: Arc<ProcessGroupContext>,
    released: bool,
}

impl std::fmt::Debug for ActivationGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivationGuard")
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

impl ActivationGuard {
    fn new(context: Arc<ProcessGroupContext>) -> Self {
        Self {
            context,
            released: false,
        }
    }

    pub fn context(&self) -> &Arc<ProcessGroupContext> {
        &self.context
    }

    /// Tear down now and report teardown failures
    pub fn deactivate(mut self) -> Result<()> {
        self.released = true;
        self.context.teardown()
    }
}

impl Drop for ActivationGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.context.teardown() {
            error!(error = %e, "Process group teardown failed");
        }
    }
}

/// Pick the local rank: explicit value, then the environment, then the global rank
pub fn resolve_local_rank(explicit: Option<Rank>, env: Option<&str>, rank: Rank) -> Result<Rank> {
    if let Some(local_rank) = explicit {
        return Ok(local_rank);
    }
    match env {
        Some(raw) => raw.trim().parse().map_err(|_| Error::InvalidConfig {
            message: format!("{} must be a non-negative integer, got {:?}", LOCAL_RANK_ENV, raw),
        }),
        None => Ok(rank),
    }
}
