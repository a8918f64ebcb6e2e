use std::fmt::Debug;
use std::sync::Arc;

use fieldx::fxstruct;
use tracing::info;
use tracing::instrument;
use tracing::warn;

use crate::backend::reply_ok;
use crate::cache::IdentityCache;
use crate::config::Config;
use crate::doc;
use crate::error::DbError;
use crate::error::StorageError;
use crate::pool::Pool;
use crate::record::Group;
use crate::record::User;
use crate::replicator::Replicator;
use crate::task::Task;
use crate::traits::Connector;

/// The persistence layer of one process: the worker pool, the replicator and the identity caches, started and
/// stopped in the right order.
///
/// ```no_run
/// # use std::sync::Arc;
/// # use idcache::prelude::*;
/// let config = Config::from_file("idcache.toml")?;
/// let storage = Storage::start(config, Arc::new(MemoryDatabase::default()))?;
/// let uid = storage.users().create("alice")?;
/// assert!(storage.users().exists_id(uid));
/// storage.shutdown();
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[fxstruct(no_new, get)]
pub struct Storage {
    config:     Config,
    pool:       Arc<Pool>,
    replicator: Arc<Replicator>,
    users:      Arc<IdentityCache<User>>,
    groups:     Arc<IdentityCache<Group>>,
}

impl Storage {
    /// Start the pool, prepare the database, load the caches and start replicating.
    #[instrument(level = "debug", skip_all, fields(db = %connector.address()))]
    pub fn start(config: Config, connector: Arc<dyn Connector>) -> Result<Self, StorageError> {
        config.validate()?;

        let pool = Pool::builder()
            .connector(connector.clone())
            .config(config.pool())
            .build()
            .map_err(|source| StorageError::Builder { what: "pool", source })?;
        pool.start()?;

        let storage = Self::bootstrap(config, connector, pool.clone());
        if storage.is_err() {
            pool.stop();
        }
        storage
    }

    fn bootstrap(config: Config, connector: Arc<dyn Connector>, pool: Arc<Pool>) -> Result<Self, StorageError> {
        Self::prepare_database(&config, &pool)?;

        let log = config.replicator().log_collection();
        let users = IdentityCache::<User>::new(pool.clone(), log.as_str());
        let groups = IdentityCache::<Group>::new(pool.clone(), log.as_str());

        let replicator = Replicator::builder()
            .connector(connector)
            .config(config.replicator())
            .build()
            .map_err(|source| StorageError::Builder {
                what: "replicator",
                source,
            })?;
        replicator.register(users.clone())?;
        replicator.register(groups.clone())?;
        replicator.start()?;

        info!(
            "storage ready: {} users, {} groups, {} workers max",
            users.len(),
            groups.len(),
            pool.max_workers()
        );
        Ok(Self {
            config,
            pool,
            replicator,
            users,
            groups,
        })
    }

    // Create the capped change log and the indexes the caches rely on.
    fn prepare_database(config: &Config, pool: &Pool) -> Result<(), DbError> {
        let rc = config.replicator();
        let (task, signal) = Task::run_command(doc!({
            "create": rc.log_collection(),
            "capped": true,
            "size": rc.log_size(),
            "max": rc.log_capacity(),
        }));
        pool.queue(task);
        let reply = signal.outcome()?;
        if !reply_ok(&reply) {
            // Normally because it already exists.
            warn!(
                "change log '{}' not created: {}",
                rc.log_collection(),
                reply.get("errmsg").and_then(|m| m.as_str()).unwrap_or("no reason given")
            );
        }

        pool.queue(Task::ensure_index("users", doc!({"uid": 1}), true));
        pool.queue(Task::ensure_index("users", doc!({"name": 1}), true));
        pool.queue(Task::ensure_index("groups", doc!({"gid": 1}), true));
        pool.queue(Task::ensure_index("groups", doc!({"name": 1}), true));
        pool.queue(Task::ensure_index(rc.log_collection(), doc!({"timestamp": 1}), false));
        Ok(())
    }

    /// Stop replicating, then let the pool drain and close its connections.
    #[instrument(level = "debug", skip(self))]
    pub fn shutdown(self) {
        self.replicator.stop();
        self.pool.stop();
        info!("storage shut down");
    }
}

impl Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("pool", &self.pool)
            .field("replicator", &self.replicator)
            .field("users", &self.users)
            .field("groups", &self.groups)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryDatabase;
    use crate::error::PoolError;
    use crate::record::Record;

    fn config() -> Config {
        let mut config = Config::new();
        config.replicator_mut().set_poll_interval_ms(5);
        config
    }

    #[test]
    fn bootstrap_prepares_the_database() {
        let db = MemoryDatabase::default();
        let storage = Storage::start(config(), Arc::new(db.clone())).unwrap();
        let gid = storage.groups().create("staff").unwrap();
        storage.shutdown();

        assert_eq!(db.documents("groups"), vec![doc!({"gid": gid, "name": "staff"})]);
        assert_eq!(db.documents("updatelog").len(), 1);
        assert_eq!(db.open_connections(), 0);

        // Indexes are in place: a duplicate name is refused.
        let mut conn = db.connect().unwrap();
        assert!(conn.insert("groups", &doc!({"gid": 9, "name": "staff"})).is_err());

        // A second start finds everything in place.
        let storage = Storage::start(config(), Arc::new(db.clone())).unwrap();
        assert!(storage.groups().exists("staff"));
        storage.shutdown();
    }

    #[test]
    fn fails_without_database() {
        let db = MemoryDatabase::default();
        db.set_online(false);
        let err = Storage::start(config(), Arc::new(db)).unwrap_err();
        assert!(matches!(err, StorageError::Pool(PoolError::NoWorkers(_))));
    }

    #[test]
    fn rejects_invalid_config() {
        let mut config = config();
        config.pool_mut().set_max_workers(0);
        let err = Storage::start(config, Arc::new(MemoryDatabase::default())).unwrap_err();
        assert!(matches!(err, StorageError::Config(_)));
    }

    #[test]
    fn change_log_is_capped() {
        let db = MemoryDatabase::default();
        let mut config = config();
        config.replicator_mut().set_log_capacity(3);
        config.pool_mut().set_max_workers(1);
        let storage = Storage::start(config, Arc::new(db.clone())).unwrap();
        assert_eq!(storage.config().replicator().log_capacity(), 3);

        let gids: Vec<_> = (0..5)
            .map(|i| storage.groups().create(&format!("g{i}")).unwrap())
            .collect();
        storage.shutdown();
        assert_eq!(db.documents(Group::COLLECTION).len(), 5);

        // Only the newest notes survive, oldest first.
        let log = db.documents("updatelog");
        assert_eq!(log.len(), 3);
        let ids: Vec<_> = log.iter().filter_map(|entry| entry["id"].as_i64()).collect();
        assert_eq!(ids, gids[2..].iter().map(|gid| i64::from(*gid)).collect::<Vec<_>>());
    }
}
