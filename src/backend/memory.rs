//! In-process document database.
//!
//! Behaves like a small document server: collections of JSON documents, unique indexes, capped collections and
//! tailable cursors over insertion order. On top of that it has knobs the tests need to provoke the failure modes a
//! real server exhibits: going offline, slow operations and expiring cursors.
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::debug;
use tracing::trace;

use crate::doc;
use crate::document::apply_update;
use crate::document::matches;
use crate::document::upsert_seed;
use crate::document::validate_filter;
use crate::document::Document;
use crate::document::Query;
use crate::error::DbError;
use crate::traits::Connection;
use crate::traits::Connector;
use crate::traits::TailCursor;
use crate::types::LogEntry;
use crate::types::LogId;
use crate::types::TailPoll;

const COMMANDS: [&str; 5] = ["create", "drop", "count", "distinct", "ping"];

#[derive(Debug, Clone, PartialEq, Eq)]
struct Index {
    fields: Vec<String>,
    unique: bool,
}

impl Index {
    fn key_of(&self, doc: &Document) -> Vec<Value> {
        self.fields
            .iter()
            .map(|f| doc.get(f).cloned().unwrap_or(Value::Null))
            .collect()
    }
}

#[derive(Debug, Default)]
struct Collection {
    // Documents in insertion order, each with its position.
    docs:    Vec<(u64, Document)>,
    indexes: Vec<Index>,
    // Maximum number of documents for a capped collection.
    capped:  Option<usize>,
    // Position of the newest document a capped collection has evicted.
    evicted: u64,
}

impl Collection {
    fn check_unique(&self, doc: &Document, skip: Option<u64>) -> Result<(), String> {
        for index in self.indexes.iter().filter(|i| i.unique) {
            let key = index.key_of(doc);
            if self
                .docs
                .iter()
                .any(|(pos, other)| Some(*pos) != skip && index.key_of(other) == key)
            {
                return Err(format!(
                    "E11000 duplicate key error: index {} dup key {}",
                    index.fields.join("_"),
                    Value::Array(key)
                ));
            }
        }
        Ok(())
    }

    fn push(&mut self, pos: u64, doc: Document) -> Result<(), String> {
        self.check_unique(&doc, None)?;
        self.docs.push((pos, doc));
        if let Some(max) = self.capped {
            if self.docs.len() > max {
                let excess = self.docs.len() - max;
                if let Some((pos, _)) = self.docs.drain(..excess).last() {
                    self.evicted = pos;
                }
            }
        }
        Ok(())
    }

    fn matching(&self, filter: &Document) -> Result<Vec<usize>, String> {
        let mut found = Vec::new();
        for (i, (_, doc)) in self.docs.iter().enumerate() {
            if matches(doc, filter)? {
                found.push(i);
            }
        }
        Ok(found)
    }
}

#[derive(Debug, Default)]
struct State {
    collections: HashMap<String, Collection>,
    // Global insertion counter; positions are never reused.
    last_pos:    u64,
}

impl State {
    fn next_pos(&mut self) -> u64 {
        self.last_pos += 1;
        self.last_pos
    }
}

#[derive(Debug)]
struct Inner {
    address:     String,
    state:       Mutex<State>,
    online:      AtomicBool,
    latency:     Mutex<Duration>,
    connections: AtomicUsize,
    // Bumped to invalidate every open cursor.
    cursor_era:  AtomicU64,
    idle_limit:  Mutex<Option<u32>>,
}

/// Handle to a shared in-memory database. Clones refer to the same data.
#[derive(Debug, Clone)]
pub struct MemoryDatabase {
    inner: Arc<Inner>,
}

impl Default for MemoryDatabase {
    fn default() -> Self {
        Self::new("memory://localhost")
    }
}

impl MemoryDatabase {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                address:     address.into(),
                state:       Mutex::new(State::default()),
                online:      AtomicBool::new(true),
                latency:     Mutex::new(Duration::ZERO),
                connections: AtomicUsize::new(0),
                cursor_era:  AtomicU64::new(0),
                idle_limit:  Mutex::new(None),
            }),
        }
    }

    /// Take the server down or bring it back. While offline new connections are refused and every operation on an
    /// existing connection fails.
    pub fn set_online(&self, online: bool) {
        debug!("{} is going {}", self.inner.address, if online { "online" } else { "offline" });
        self.inner.online.store(online, Ordering::SeqCst);
    }

    #[inline]
    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::SeqCst)
    }

    /// Delay applied to every operation except cursor polling.
    pub fn set_latency(&self, latency: Duration) {
        *self.inner.latency.lock() = latency;
    }

    /// Number of connections currently open.
    pub fn open_connections(&self) -> usize {
        self.inner.connections.load(Ordering::SeqCst)
    }

    /// Make every open tailing cursor report itself dead on its next poll.
    pub fn kill_cursors(&self) {
        self.inner.cursor_era.fetch_add(1, Ordering::SeqCst);
    }

    /// Cursors that come up empty this many times in a row die, like a server-side idle timeout. `None` disables it.
    pub fn set_cursor_idle_limit(&self, limit: Option<u32>) {
        *self.inner.idle_limit.lock() = limit;
    }

    /// Snapshot of a collection, bypassing connection state.
    pub fn documents(&self, collection: &str) -> Vec<Document> {
        self.inner
            .state
            .lock()
            .collections
            .get(collection)
            .map(|c| c.docs.iter().map(|(_, d)| d.clone()).collect())
            .unwrap_or_default()
    }

    pub fn collection_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.inner.state.lock().collections.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Connector for MemoryDatabase {
    fn address(&self) -> String {
        self.inner.address.clone()
    }

    fn connect(&self) -> Result<Box<dyn Connection>, DbError> {
        if !self.is_online() {
            return Err(DbError::connection(&self.inner.address, "connection refused"));
        }
        let count = self.inner.connections.fetch_add(1, Ordering::SeqCst) + 1;
        trace!("{}: connection opened, {count} open", self.inner.address);
        Ok(Box::new(MemoryConnection {
            inner: self.inner.clone(),
        }))
    }
}

struct MemoryConnection {
    inner: Arc<Inner>,
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.inner.connections.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MemoryConnection {
    // Common prologue of every operation: simulated network delay, then the availability check.
    fn enter(&self, op: &'static str, collection: &str) -> Result<(), DbError> {
        let latency = *self.inner.latency.lock();
        if !latency.is_zero() {
            thread::sleep(latency);
        }
        if self.inner.online.load(Ordering::SeqCst) {
            Ok(())
        }
        else {
            Err(DbError::operation(op, collection, "network error: server unreachable"))
        }
    }

    fn command(&self, name: &str, command: &Document) -> Result<Document, DbError> {
        let target = command.get(name).and_then(Value::as_str).map(str::to_owned);
        let mut state = self.inner.state.lock();

        Ok(match name {
            "ping" => doc!({"ok": 1}),
            "create" => {
                let Some(target) = target
                else {
                    return Err(DbError::operation("command", "", "create needs a collection name"));
                };
                if state.collections.contains_key(&target) {
                    doc!({"ok": 0, "errmsg": "collection already exists", "code": 48})
                }
                else {
                    let capped = command.get("capped").and_then(Value::as_bool).unwrap_or(false);
                    let max = command.get("max").and_then(Value::as_u64).map(|m| m as usize);
                    state.collections.insert(
                        target,
                        Collection {
                            capped: if capped { Some(max.unwrap_or(usize::MAX)) } else { None },
                            ..Default::default()
                        },
                    );
                    doc!({"ok": 1})
                }
            }
            "drop" => match target.and_then(|t| state.collections.remove(&t)) {
                Some(_) => doc!({"ok": 1}),
                None => doc!({"ok": 0, "errmsg": "ns not found", "code": 26}),
            },
            "count" => {
                let target = target.unwrap_or_default();
                let filter = command
                    .get("query")
                    .and_then(Value::as_object)
                    .cloned()
                    .unwrap_or_default();
                let n = match state.collections.get(&target) {
                    Some(c) => c
                        .matching(&filter)
                        .map_err(|e| DbError::operation("count", &target, e))?
                        .len(),
                    None => 0,
                };
                doc!({"ok": 1, "n": n})
            }
            "distinct" => {
                let target = target.unwrap_or_default();
                let Some(key) = command.get("key").and_then(Value::as_str)
                else {
                    return Err(DbError::operation("distinct", &target, "distinct needs a key"));
                };
                let mut values: Vec<Value> = Vec::new();
                for (_, d) in state.collections.get(&target).map(|c| c.docs.as_slice()).unwrap_or(&[]) {
                    if let Some(v) = d.get(key) {
                        if !values.contains(v) {
                            values.push(v.clone());
                        }
                    }
                }
                doc!({"ok": 1, "values": values})
            }
            _ => return Err(DbError::operation("command", "", format!("no such command: '{name}'"))),
        })
    }
}

impl Connection for MemoryConnection {
    fn find(&mut self, collection: &str, query: &Query) -> Result<Vec<Document>, DbError> {
        self.enter("select", collection)?;
        let fail = |e: String| DbError::operation("select", collection, e);
        validate_filter(&query.filter).map_err(fail)?;
        let state = self.inner.state.lock();
        match state.collections.get(collection) {
            Some(c) => query.run(c.docs.iter().map(|(_, d)| d)).map_err(fail),
            None => Ok(Vec::new()),
        }
    }

    fn insert(&mut self, collection: &str, document: &Document) -> Result<(), DbError> {
        self.enter("insert", collection)?;
        let mut state = self.inner.state.lock();
        let pos = state.next_pos();
        state
            .collections
            .entry(collection.to_owned())
            .or_default()
            .push(pos, document.clone())
            .map_err(|e| DbError::operation("insert", collection, e))
    }

    fn update(&mut self, collection: &str, filter: &Document, update: &Document, upsert: bool)
        -> Result<u64, DbError> {
        self.enter("update", collection)?;
        let fail = |e: String| DbError::operation("update", collection, e);
        validate_filter(filter).map_err(fail)?;
        let mut state = self.inner.state.lock();
        let pos = state.next_pos();
        let coll = state.collections.entry(collection.to_owned()).or_default();

        let found = coll.matching(filter).map_err(fail)?;
        if found.is_empty() {
            if !upsert {
                return Ok(0);
            }
            let seed = upsert_seed(filter, update).map_err(fail)?;
            coll.push(pos, seed).map_err(fail)?;
            return Ok(1);
        }

        // Validate every change before applying any, so a failed update leaves the collection untouched.
        let mut changed = Vec::with_capacity(found.len());
        for &i in &found {
            let (pos, doc) = &coll.docs[i];
            let mut new_doc = doc.clone();
            apply_update(&mut new_doc, update).map_err(fail)?;
            coll.check_unique(&new_doc, Some(*pos)).map_err(fail)?;
            changed.push((i, new_doc));
        }
        let count = changed.len() as u64;
        for (i, new_doc) in changed {
            coll.docs[i].1 = new_doc;
        }
        Ok(count)
    }

    fn delete(&mut self, collection: &str, filter: &Document) -> Result<u64, DbError> {
        self.enter("delete", collection)?;
        let fail = |e: String| DbError::operation("delete", collection, e);
        validate_filter(filter).map_err(fail)?;
        let mut state = self.inner.state.lock();
        let Some(coll) = state.collections.get_mut(collection)
        else {
            return Ok(0);
        };
        let found = coll.matching(filter).map_err(fail)?;
        for &i in found.iter().rev() {
            coll.docs.remove(i);
        }
        Ok(found.len() as u64)
    }

    fn ensure_index(&mut self, collection: &str, keys: &Document, unique: bool) -> Result<(), DbError> {
        self.enter("ensure index", collection)?;
        if keys.is_empty() {
            return Err(DbError::operation("ensure index", collection, "index needs at least one key"));
        }
        let index = Index {
            fields: keys.keys().cloned().collect(),
            unique,
        };
        let mut state = self.inner.state.lock();
        let coll = state.collections.entry(collection.to_owned()).or_default();
        if coll.indexes.iter().any(|i| i.fields == index.fields) {
            return Ok(());
        }
        if unique {
            let mut seen = Vec::with_capacity(coll.docs.len());
            for (_, doc) in &coll.docs {
                let key = index.key_of(doc);
                if seen.contains(&key) {
                    return Err(DbError::operation(
                        "ensure index",
                        collection,
                        format!("cannot build unique index, duplicate key {}", Value::Array(key)),
                    ));
                }
                seen.push(key);
            }
        }
        coll.indexes.push(index);
        Ok(())
    }

    fn run_command(&mut self, command: &Document) -> Result<Document, DbError> {
        self.enter("command", "")?;
        // Documents keep their keys sorted, so the command name is found by name rather than by position.
        let name = match COMMANDS.iter().find(|c| command.contains_key(**c)) {
            Some(name) => *name,
            None => match command.keys().next() {
                Some(other) => return Err(DbError::operation("command", "", format!("no such command: '{other}'"))),
                None => return Err(DbError::operation("command", "", "empty command")),
            },
        };
        self.command(name, command)
    }

    fn latest_position(&mut self, collection: &str) -> Result<Option<LogId>, DbError> {
        self.enter("latest position", collection)?;
        Ok(self
            .inner
            .state
            .lock()
            .collections
            .get(collection)
            .and_then(|c| c.docs.last())
            .map(|(pos, _)| LogId(*pos)))
    }

    fn tail(&mut self, collection: &str, after: Option<LogId>) -> Result<Box<dyn TailCursor>, DbError> {
        self.enter("tail", collection)?;
        Ok(Box::new(MemoryTail {
            inner:      self.inner.clone(),
            collection: collection.to_owned(),
            after:      after.map(|id| id.0).unwrap_or(0),
            era:        self.inner.cursor_era.load(Ordering::SeqCst),
            idle:       0,
            dead:       false,
        }))
    }
}

struct MemoryTail {
    inner:      Arc<Inner>,
    collection: String,
    after:      u64,
    era:        u64,
    idle:       u32,
    dead:       bool,
}

impl TailCursor for MemoryTail {
    fn poll(&mut self) -> Result<TailPoll, DbError> {
        if !self.inner.online.load(Ordering::SeqCst) {
            return Err(DbError::operation("tail", &self.collection, "network error: server unreachable"));
        }
        if self.dead || self.era != self.inner.cursor_era.load(Ordering::SeqCst) {
            self.dead = true;
            return Ok(TailPoll::Dead);
        }

        let next = {
            let inner = self.inner.clone();
            let state = inner.state.lock();
            let Some(coll) = state.collections.get(&self.collection)
            else {
                return Ok(self.idle());
            };
            if coll.evicted > self.after {
                return Err(DbError::PositionLost(self.collection.clone()));
            }
            coll.docs.iter().find(|(pos, _)| *pos > self.after).cloned()
        };

        Ok(match next {
            Some((pos, document)) => {
                self.after = pos;
                self.idle = 0;
                TailPoll::Entry(LogEntry {
                    id: LogId(pos),
                    document,
                })
            }
            None => self.idle(),
        })
    }
}

impl MemoryTail {
    fn idle(&mut self) -> TailPoll {
        self.idle += 1;
        if self.inner.idle_limit.lock().is_some_and(|limit| self.idle >= limit) {
            self.dead = true;
            TailPoll::Dead
        }
        else {
            TailPoll::Empty
        }
    }
}
