//! In-memory identity caches.
//!
//! An [`IdentityCache`] answers lookups from memory and applies writes to memory first; the same write queues a
//! [`Task`] that persists it together with a change-log note. The [`Replicator`](crate::replicator::Replicator) feeds
//! notes from every process back through [`Replicable::replicate`], which re-reads the row and reconciles the cache
//! with what the database actually holds.
//!
//! The cache keeps the records in one map keyed by id plus a name index. Each has its own lock; when both are
//! needed they are taken in the order names, then records, so a reader never observes one direction without the
//! other.
mod group;
mod user;

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use fieldx::fxstruct;
use parking_lot::Mutex;
use parking_lot::RwLock;
use tracing::debug;
use tracing::error;
use tracing::instrument;
use tracing::warn;

use crate::document::Document;
use crate::document::Order;
use crate::document::Query;
use crate::error::CacheError;
use crate::error::DbError;
use crate::pool::Pool;
use crate::record::Record;
use crate::task::LogNote;
use crate::task::Task;

#[doc(inline)]
pub use crate::traits::Replicable;

pub type Result<T> = std::result::Result<T, CacheError>;

type Listener<Id> = Box<dyn Fn(Id) + Send + Sync>;

#[fxstruct(sync, no_new)]
pub struct IdentityCache<R: Record> {
    name:           String,
    /// The pool persisting this cache's writes.
    #[fieldx(get(clone))]
    pool:           Arc<Pool>,
    /// Collection receiving a change-log note for every write.
    #[fieldx(get)]
    log_collection: String,
    by_name:        RwLock<HashMap<String, R::Id>>,
    records:        RwLock<HashMap<R::Id, R>>,
    // Serializes id allocation.
    alloc:          Mutex<()>,
    listeners:      RwLock<Vec<Listener<R::Id>>>,
}

impl<R: Record> IdentityCache<R> {
    /// An empty cache persisting through `pool` and noting changes in `log_collection`. Fill it with
    /// [`populate`](Replicable::populate) or by registering it with a replicator.
    pub fn new(pool: Arc<Pool>, log_collection: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: format!("{} cache", R::KIND),
            pool,
            log_collection: log_collection.into(),
            by_name: RwLock::new(HashMap::new()),
            records: RwLock::new(HashMap::new()),
            alloc: Mutex::new(()),
            listeners: RwLock::new(Vec::new()),
        })
    }

    fn id_filter(id: R::Id) -> Document {
        let mut filter = Document::new();
        filter.insert(R::ID_FIELD.to_string(), id.into());
        filter
    }

    fn note(&self, id: R::Id) -> LogNote {
        LogNote::new(&self.log_collection, R::COLLECTION, id)
    }

    fn not_found(what: impl Debug) -> CacheError {
        let err = CacheError::NotFound(format!("{} {what:?}", R::KIND));
        debug!("{err}");
        err
    }

    // Writes change memory before the database, so they are refused outright once nothing would persist them.
    fn check_writable(&self) -> Result<()> {
        if self.pool.accepts_tasks() {
            Ok(())
        }
        else {
            debug!("{}: the pool is stopped, refusing to write", self.name);
            Err(CacheError::Unavailable(DbError::Abandoned))
        }
    }

    fn already_exists(name: &str) -> CacheError {
        let err = CacheError::AlreadyExists(format!("{} {name:?}", R::KIND));
        debug!("{err}");
        err
    }

    #[inline]
    pub fn exists(&self, name: &str) -> bool {
        self.by_name.read().contains_key(name)
    }

    #[inline]
    pub fn exists_id(&self, id: R::Id) -> bool {
        self.records.read().contains_key(&id)
    }

    pub fn lookup(&self, name: &str) -> Result<R> {
        let names = self.by_name.read();
        names
            .get(name)
            .and_then(|id| self.records.read().get(id).cloned())
            .ok_or_else(|| Self::not_found(name))
    }

    pub fn lookup_id(&self, id: R::Id) -> Result<R> {
        self.records.read().get(&id).cloned().ok_or_else(|| Self::not_found(id))
    }

    #[inline]
    pub fn name_to_id(&self, name: &str) -> Option<R::Id> {
        self.by_name.read().get(name).copied()
    }

    #[inline]
    pub fn id_to_name(&self, id: R::Id) -> Option<String> {
        self.records.read().get(&id).map(|r| r.name().to_string())
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// All names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.by_name.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// All records ordered by id, taken under both locks so the two maps agree.
    pub fn snapshot(&self) -> Vec<R> {
        let _names = self.by_name.read();
        let records = self.records.read();
        let mut all: Vec<R> = records.values().cloned().collect();
        all.sort_by_key(|r| r.id());
        all
    }

    /// Highest id present in the database.
    fn persisted_max_id(&self) -> Result<Option<R::Id>> {
        let (task, signal) = Task::select(
            R::COLLECTION,
            Query::all().sort_by(R::ID_FIELD, Order::Descending).limit(1),
        );
        self.pool.queue(task);
        let rows = signal.outcome()?;
        Ok(rows
            .first()
            .and_then(|doc| doc.get(R::ID_FIELD))
            .and_then(R::id_from_value))
    }

    /// Create a record named `name` with the next free id.
    ///
    /// Fails with [`CacheError::Unavailable`] if the current maximum id cannot be read from the database.
    #[instrument(level = "debug", skip(self), fields(cache = %self.name))]
    pub fn create(&self, name: &str) -> Result<R::Id> {
        self.check_writable()?;
        if self.exists(name) {
            return Err(Self::already_exists(name));
        }

        let _alloc = self.alloc.lock();
        let persisted = self.persisted_max_id().inspect_err(|err| {
            error!("cannot allocate an id for {} {name:?}: {err}", R::KIND);
        })?;
        let local = self.records.read().keys().max().copied();
        let id = match persisted.max(local) {
            Some(max) => R::next_id(max).ok_or_else(|| {
                let err = CacheError::Rejected(format!("no {} id left after {max}", R::KIND));
                error!("cannot create {} {name:?}: {err}", R::KIND);
                err
            })?,
            None => R::first_id(),
        };

        let record = R::new(id, name);
        {
            let mut names = self.by_name.write();
            if names.contains_key(name) {
                return Err(Self::already_exists(name));
            }
            let mut records = self.records.write();
            names.insert(name.to_string(), id);
            records.insert(id, record.clone());
        }

        self.pool
            .queue(Task::insert(R::COLLECTION, record.to_document()).with_note(self.note(id)));
        debug!("created {} {name:?} with id {id}", R::KIND);
        Ok(id)
    }

    #[instrument(level = "debug", skip(self), fields(cache = %self.name))]
    pub fn delete(&self, name: &str) -> Result<()> {
        self.check_writable()?;
        let id = {
            let mut names = self.by_name.write();
            let mut records = self.records.write();
            let id = names.remove(name).ok_or_else(|| Self::not_found(name))?;
            records.remove(&id);
            id
        };

        self.pool
            .queue(Task::delete(R::COLLECTION, Self::id_filter(id)).with_note(self.note(id)));
        Ok(())
    }

    #[instrument(level = "debug", skip(self), fields(cache = %self.name))]
    pub fn rename(&self, old_name: &str, new_name: &str) -> Result<()> {
        self.check_writable()?;
        let id = {
            let mut names = self.by_name.write();
            if names.contains_key(new_name) {
                return Err(Self::already_exists(new_name));
            }
            let mut records = self.records.write();
            let id = names.remove(old_name).ok_or_else(|| Self::not_found(old_name))?;
            names.insert(new_name.to_string(), id);
            if let Some(record) = records.get_mut(&id) {
                record.set_name(new_name);
            }
            id
        };

        let mut set = Document::new();
        set.insert("name".into(), new_name.into());
        let mut update = Document::new();
        update.insert("$set".into(), set.into());
        self.pool
            .queue(Task::update(R::COLLECTION, Self::id_filter(id), update, false).with_note(self.note(id)));
        Ok(())
    }

    /// Change a record's attributes in memory and persist them. The id and name cannot be changed this way; use
    /// [`rename`](Self::rename) for the latter.
    pub fn modify<F>(&self, id: R::Id, f: F) -> Result<R>
    where
        F: FnOnce(&mut R),
    {
        self.check_writable()?;
        let updated = {
            let mut records = self.records.write();
            let record = records.get_mut(&id).ok_or_else(|| Self::not_found(id))?;
            let mut changed = record.clone();
            f(&mut changed);
            if changed.id() != id || changed.name() != record.name() {
                return Err(CacheError::Rejected(format!(
                    "{} {id}: id and name cannot be modified in place",
                    R::KIND
                )));
            }
            *record = changed.clone();
            changed
        };

        let mut fields = updated.to_document();
        fields.remove(R::ID_FIELD);
        fields.remove("name");
        if !fields.is_empty() {
            let mut update = Document::new();
            update.insert("$set".into(), fields.into());
            self.pool
                .queue(Task::update(R::COLLECTION, Self::id_filter(id), update, false).with_note(self.note(id)));
        }
        Ok(updated)
    }

    /// Register a callback invoked with the id of every record refreshed or evicted by replication.
    pub fn on_replicated<F>(&self, callback: F)
    where
        F: Fn(R::Id) + Send + Sync + 'static,
    {
        self.listeners.write().push(Box::new(callback));
    }

    // Bring one record in line with its database row.
    fn refresh(&self, record: R) {
        let id = record.id();
        let mut names = self.by_name.write();
        let mut records = self.records.write();

        if let Some(previous) = records.get(&id) {
            if previous.name() != record.name() && names.get(previous.name()) == Some(&id) {
                names.remove(previous.name());
            }
        }
        // Names are unique, so a record still holding this name is stale.
        if let Some(other) = names.insert(record.name().to_string(), id) {
            if other != id {
                records.remove(&other);
            }
        }
        records.insert(id, record);
    }

    fn evict(&self, id: R::Id) {
        let mut names = self.by_name.write();
        let mut records = self.records.write();
        if let Some(record) = records.remove(&id) {
            if names.get(record.name()) == Some(&id) {
                names.remove(record.name());
            }
        }
    }

    fn notify(&self, id: R::Id) {
        for listener in self.listeners.read().iter() {
            listener(id);
        }
    }
}

impl<R: Record> Replicable for IdentityCache<R> {
    fn name(&self) -> &str {
        &self.name
    }

    fn collection(&self) -> &str {
        R::COLLECTION
    }

    #[instrument(level = "debug", skip(self), fields(cache = %self.name))]
    fn populate(&self) -> bool {
        let (task, signal) = Task::select(R::COLLECTION, Query::all());
        self.pool.queue(task);
        let rows = match signal.outcome() {
            Ok(rows) => rows,
            Err(err) => {
                error!("populating {} failed: {err}", self.name);
                return false;
            }
        };

        let mut by_name = HashMap::with_capacity(rows.len());
        let mut by_id = HashMap::with_capacity(rows.len());
        for row in &rows {
            match R::from_document(row) {
                Some(record) => {
                    by_name.insert(record.name().to_string(), record.id());
                    by_id.insert(record.id(), record);
                }
                None => warn!("{}: skipping malformed row {}", self.name, serde_json::Value::Object(row.clone())),
            }
        }

        let count = by_id.len();
        {
            let mut names = self.by_name.write();
            let mut records = self.records.write();
            *names = by_name;
            *records = by_id;
        }
        debug!("{} populated with {count} records", self.name);
        true
    }

    fn replicate(&self, id: &serde_json::Value) -> bool {
        let Some(id) = R::id_from_value(id)
        else {
            debug!("{}: ignoring change of non-integer id {id}", self.name);
            return true;
        };

        let (task, signal) = Task::select(R::COLLECTION, Query::new(Self::id_filter(id)).limit(1));
        self.pool.queue(task);
        let rows = match signal.outcome() {
            Ok(rows) => rows,
            Err(err) => {
                warn!("{}: replicating {} {id} failed: {err}", self.name, R::KIND);
                return false;
            }
        };

        match rows.first() {
            Some(row) => match R::from_document(row) {
                Some(record) => self.refresh(record),
                None => {
                    warn!("{}: {} {id} has a malformed row, dropping it", self.name, R::KIND);
                    self.evict(id);
                }
            },
            None => self.evict(id),
        }

        self.notify(id);
        true
    }
}

impl<R: Record> Debug for IdentityCache<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityCache")
            .field("name", &self.name)
            .field("collection", &R::COLLECTION)
            .field("records", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryDatabase;
    use crate::doc;
    use crate::record::Group;
    use crate::traits::Connector;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;
    use std::thread;
    use std::time::Duration;

    pub(super) fn setup() -> (MemoryDatabase, Arc<Pool>) {
        let db = MemoryDatabase::default();
        let pool = Pool::builder()
            .connector(Arc::new(db.clone()))
            .max_workers(1)
            .build()
            .unwrap();
        pool.start().unwrap();
        (db, pool)
    }

    // With a single worker the queue is FIFO, so a select round-trip means every earlier write is done.
    pub(super) fn flush(pool: &Pool) {
        let (task, signal) = Task::run_command(doc!({"ping": 1}));
        pool.queue(task);
        signal.outcome().unwrap();
    }

    #[test]
    fn create_lookup_delete() {
        let (db, pool) = setup();
        let groups = IdentityCache::<Group>::new(pool.clone(), "updatelog");

        let gid = groups.create("staff").unwrap();
        assert_eq!(gid, 1);
        assert_eq!(groups.create("wheel").unwrap(), 2);
        assert!(matches!(groups.create("staff"), Err(CacheError::AlreadyExists(_))));
        assert_eq!(groups.lookup("staff").unwrap(), Group::new(1, "staff"));
        assert_eq!(groups.lookup_id(2).unwrap().name, "wheel");
        assert_eq!(groups.name_to_id("wheel"), Some(2));
        assert_eq!(groups.id_to_name(1).as_deref(), Some("staff"));

        groups.delete("staff").unwrap();
        assert!(!groups.exists("staff"));
        assert!(!groups.exists_id(1));
        assert!(matches!(groups.delete("staff"), Err(CacheError::NotFound(_))));

        flush(&pool);
        assert_eq!(db.documents("groups"), vec![doc!({"gid": 2, "name": "wheel"})]);
        assert_eq!(db.documents("updatelog").len(), 3);
        pool.stop();
    }

    #[test]
    fn ids_continue_after_database_max() {
        let (db, pool) = setup();
        db.connect()
            .unwrap()
            .insert("groups", &doc!({"gid": 41, "name": "old"}))
            .unwrap();
        let groups = IdentityCache::<Group>::new(pool.clone(), "updatelog");
        assert_eq!(groups.create("new").unwrap(), 42);
        pool.stop();
    }

    #[test]
    fn exhausted_id_space_is_refused() {
        let (db, pool) = setup();
        db.connect()
            .unwrap()
            .insert("groups", &doc!({"gid": i32::MAX, "name": "last"}))
            .unwrap();
        let groups = IdentityCache::<Group>::new(pool.clone(), "updatelog");
        assert!(matches!(groups.create("overflow"), Err(CacheError::Rejected(_))));
        assert!(!groups.exists("overflow"));
        flush(&pool);
        assert_eq!(db.documents("groups").len(), 1);
        pool.stop();
    }

    #[test]
    fn writes_after_shutdown_are_refused() {
        let (db, pool) = setup();
        let groups = IdentityCache::<Group>::new(pool.clone(), "updatelog");
        let gid = groups.create("staff").unwrap();
        assert_eq!(groups.log_collection(), "updatelog");
        assert!(Arc::ptr_eq(&groups.pool(), &pool));
        pool.stop();

        let unavailable = |r: Result<()>| matches!(r, Err(CacheError::Unavailable(DbError::Abandoned)));
        let (tx, rx) = std::sync::mpsc::channel();
        {
            let groups = groups.clone();
            thread::spawn(move || {
                let _ = tx.send(groups.create("late").map(|_| ()));
            });
        }
        let late = rx.recv_timeout(Duration::from_secs(2)).expect("create blocked after shutdown");
        assert!(unavailable(late));
        assert!(unavailable(groups.rename("staff", "wheel")));
        assert!(unavailable(groups.delete("staff")));
        assert!(unavailable(groups.modify(gid, |_| ()).map(|_| ())));

        // Memory still agrees with the database.
        assert_eq!(groups.snapshot(), vec![Group::new(gid, "staff")]);
        assert_eq!(db.documents("groups"), vec![doc!({"gid": gid, "name": "staff"})]);
        // Reads keep working.
        assert!(groups.exists("staff"));
    }

    #[test]
    fn allocation_needs_the_database() {
        let (db, pool) = setup();
        let groups = IdentityCache::<Group>::new(pool.clone(), "updatelog");
        db.set_online(false);
        assert!(matches!(groups.create("staff"), Err(CacheError::Unavailable(_))));
        assert!(!groups.exists("staff"));
        db.set_online(true);
        assert_eq!(groups.create("staff").unwrap(), 1);
        pool.stop();
    }

    #[test]
    fn rename_rules() {
        let (db, pool) = setup();
        let groups = IdentityCache::<Group>::new(pool.clone(), "updatelog");
        groups.create("a").unwrap();
        groups.create("b").unwrap();
        assert!(matches!(groups.rename("a", "b"), Err(CacheError::AlreadyExists(_))));
        assert!(matches!(groups.rename("zz", "c"), Err(CacheError::NotFound(_))));
        groups.rename("a", "c").unwrap();
        assert_eq!(groups.names(), vec!["b".to_string(), "c".to_string()]);
        assert_eq!(groups.lookup_id(1).unwrap().name, "c");

        flush(&pool);
        assert!(db.documents("groups").contains(&doc!({"gid": 1, "name": "c"})));
        pool.stop();
    }

    #[test]
    fn populate_and_replicate() {
        let (db, pool) = setup();
        let mut conn = db.connect().unwrap();
        conn.insert("groups", &doc!({"gid": 1, "name": "staff"})).unwrap();
        conn.insert("groups", &doc!({"gid": 2, "name": "wheel"})).unwrap();
        conn.insert("groups", &doc!({"gid": "bogus"})).unwrap();

        let groups = IdentityCache::<Group>::new(pool.clone(), "updatelog");
        let seen = Arc::new(AtomicUsize::new(0));
        {
            let seen = seen.clone();
            groups.on_replicated(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert!(groups.populate());
        assert_eq!(groups.len(), 2);

        // Another process renames wheel to staff2 and drops staff.
        conn.update("groups", &doc!({"gid": 2}), &doc!({"$set": {"name": "staff2"}}), false)
            .unwrap();
        conn.delete("groups", &doc!({"gid": 1})).unwrap();
        for _ in 0..2 {
            assert!(groups.replicate(&2.into()));
            assert!(groups.replicate(&1.into()));
        }
        assert!(groups.replicate(&"x".into()));
        assert_eq!(seen.load(Ordering::SeqCst), 4);
        assert_eq!(groups.snapshot(), vec![Group::new(2, "staff2")]);
        assert!(!groups.exists("wheel"));

        // A row taking over a name evicts the stale holder.
        conn.delete("groups", &doc!({"gid": 2})).unwrap();
        conn.insert("groups", &doc!({"gid": 3, "name": "staff2"})).unwrap();
        assert!(groups.replicate(&3.into()));
        assert_eq!(groups.snapshot(), vec![Group::new(3, "staff2")]);

        db.set_online(false);
        assert!(!groups.populate());
        assert!(!groups.replicate(&3.into()));
        assert_eq!(groups.len(), 1);
        db.set_online(true);
        pool.stop();
    }

    #[test]
    fn concurrent_creates() {
        let (_db, pool) = setup();
        let groups = IdentityCache::<Group>::new(pool.clone(), "updatelog");

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let groups = groups.clone();
                thread::spawn(move || {
                    let mine: Vec<_> = (0..10).map(|i| groups.create(&format!("g{t}-{i}")).unwrap()).collect();
                    let shared = groups.create("shared").is_ok();
                    (mine, shared)
                })
            })
            .collect();

        let mut ids = Vec::new();
        let mut winners = 0;
        for h in handles {
            let (mine, shared) = h.join().unwrap();
            ids.extend(mine);
            winners += shared as usize;
        }
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 80);
        assert_eq!(winners, 1);
        assert_eq!(groups.len(), 81);
        pool.stop();
    }
}
