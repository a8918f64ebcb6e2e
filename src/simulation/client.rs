use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::Rng;
use rand::SeedableRng;
use strum::AsRefStr;
use strum::Display;
use tracing::debug;
use tracing::instrument;
use tracing::trace;

use crate::cache::Result as CacheResult;
use crate::error::CacheError;
use crate::storage::Storage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum Action {
    CreateUser,
    DeleteUser,
    RenameUser,
    SetPrimaryGid,
    AddIpMask,
    DelIpMask,
    CreateGroup,
    DeleteGroup,
    RenameGroup,
}

// Creation is weighted up so the name space fills before deletes start to dominate.
const ACTIONS: [(Action, u32); 9] = [
    (Action::CreateUser, 6),
    (Action::DeleteUser, 2),
    (Action::RenameUser, 2),
    (Action::SetPrimaryGid, 2),
    (Action::AddIpMask, 2),
    (Action::DelIpMask, 1),
    (Action::CreateGroup, 3),
    (Action::DeleteGroup, 1),
    (Action::RenameGroup, 1),
];

/// Totals of one or more clients.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ClientStats {
    /// Operations the cache accepted.
    pub applied:     usize,
    /// Operations refused because of the current cache content, e.g. creating a name that exists.
    pub refused:     usize,
    /// Operations that failed because the database could not be reached.
    pub unavailable: usize,
}

impl ClientStats {
    pub fn total(&self) -> usize {
        self.applied + self.refused + self.unavailable
    }

    pub fn merge(&mut self, other: &ClientStats) {
        self.applied += other.applied;
        self.refused += other.refused;
        self.unavailable += other.unavailable;
    }

    fn count(&mut self, outcome: CacheResult<()>) {
        match outcome {
            Ok(()) => self.applied += 1,
            Err(CacheError::Unavailable(_)) => self.unavailable += 1,
            Err(_) => self.refused += 1,
        }
    }
}

/// Performs random mutations through one node.
pub struct Client {
    id:           usize,
    node:         Arc<Storage>,
    rng:          StdRng,
    names:        usize,
    peak_workers: Arc<AtomicUsize>,
}

impl Client {
    pub fn new(id: usize, node: Arc<Storage>, seed: u64, names: usize, peak_workers: Arc<AtomicUsize>) -> Self {
        Self {
            id,
            node,
            rng: StdRng::seed_from_u64(seed),
            names: names.max(1),
            peak_workers,
        }
    }

    #[instrument(level = "debug", skip(self), fields(client = self.id))]
    pub fn run(mut self, operations: usize) -> ClientStats {
        let mut stats = ClientStats::default();
        for _ in 0..operations {
            let action = self.pick();
            let outcome = self.perform(action);
            trace!("{action}: {outcome:?}");
            stats.count(outcome);
            self.peak_workers
                .fetch_max(self.node.pool().worker_count(), Ordering::Relaxed);
        }
        debug!("client {} done: {stats:?}", self.id);
        stats
    }

    fn pick(&mut self) -> Action {
        let total: u32 = ACTIONS.iter().map(|(_, weight)| weight).sum();
        let mut roll = self.rng.random_range(0..total);
        for (action, weight) in ACTIONS {
            if roll < weight {
                return action;
            }
            roll -= weight;
        }
        Action::CreateUser
    }

    fn user_name(&mut self) -> String {
        format!("user{}", self.rng.random_range(0..self.names))
    }

    fn group_name(&mut self) -> String {
        format!("group{}", self.rng.random_range(0..self.names))
    }

    fn ip_mask(&mut self) -> String {
        format!("*@10.0.{}.*", self.rng.random_range(0..4))
    }

    fn uid(&mut self) -> CacheResult<i32> {
        let name = self.user_name();
        self.node
            .users()
            .name_to_id(&name)
            .ok_or(CacheError::NotFound(name))
    }

    fn perform(&mut self, action: Action) -> CacheResult<()> {
        let users = self.node.users().clone();
        let groups = self.node.groups().clone();
        match action {
            Action::CreateUser => users.create(&self.user_name()).map(|_| ()),
            Action::DeleteUser => users.delete(&self.user_name()),
            Action::RenameUser => users.rename(&self.user_name(), &self.user_name()),
            Action::SetPrimaryGid => {
                let uid = self.uid()?;
                let gid = groups.name_to_gid(&self.group_name());
                users.set_primary_gid(uid, gid)
            }
            Action::AddIpMask => {
                let uid = self.uid()?;
                users.add_ip_mask(uid, &self.ip_mask()).map(|_| ())
            }
            Action::DelIpMask => {
                let uid = self.uid()?;
                users.del_ip_mask(uid, &self.ip_mask()).map(|_| ())
            }
            Action::CreateGroup => groups.create(&self.group_name()).map(|_| ()),
            Action::DeleteGroup => groups.delete(&self.group_name()),
            Action::RenameGroup => groups.rename(&self.group_name(), &self.group_name()),
        }
    }
}
