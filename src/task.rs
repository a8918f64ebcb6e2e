//! Units of database work.
//!
//! A [`Task`] carries the parameters of exactly one database operation and, where the operation has a result, the
//! [`Promise`] half of a completion signal. Tasks are built by client code, queued on the
//! [`Pool`](crate::pool::Pool) and executed by whichever worker pops them first.
use std::fmt::Debug;

use serde_json::Value;
use tracing::debug;
use tracing::error;

use crate::document::Document;
use crate::document::Query;
use crate::error::DbError;
use crate::signal::promise;
use crate::signal::Promise;
use crate::signal::Signal;
use crate::traits::Connection;

pub type Outcome<T> = Result<T, DbError>;

/// Change-log entry appended after a successful write, on the same connection.
#[derive(Debug, Clone, PartialEq)]
pub struct LogNote {
    /// The change-log collection.
    pub log:        String,
    /// Collection of the changed row.
    pub collection: String,
    pub id:         Value,
}

impl LogNote {
    pub fn new(log: impl Into<String>, collection: impl Into<String>, id: impl Into<Value>) -> Self {
        Self {
            log:        log.into(),
            collection: collection.into(),
            id:         id.into(),
        }
    }

    fn to_document(&self) -> Document {
        let mut doc = Document::new();
        doc.insert("collection".into(), Value::from(self.collection.clone()));
        doc.insert("id".into(), self.id.clone());
        doc.insert("timestamp".into(), Value::from(chrono::Utc::now().timestamp_millis()));
        doc
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum TaskKind {
    Select,
    Update,
    Delete,
    Insert,
    EnsureIndex,
    RunCommand,
    Function,
}

type DbFn = Box<dyn FnOnce(&mut dyn Connection) + Send>;

pub enum Task {
    Select {
        collection: String,
        query:      Query,
        reply:      Promise<Outcome<Vec<Document>>>,
    },
    Update {
        collection: String,
        filter:     Document,
        update:     Document,
        upsert:     bool,
        note:       Option<LogNote>,
        reply:      Option<Promise<Outcome<u64>>>,
    },
    Delete {
        collection: String,
        filter:     Document,
        note:       Option<LogNote>,
        reply:      Option<Promise<Outcome<u64>>>,
    },
    Insert {
        collection: String,
        document:   Document,
        /// Failure is expected and only logged at debug level.
        fail_okay:  bool,
        note:       Option<LogNote>,
    },
    EnsureIndex {
        collection: String,
        keys:       Document,
        unique:     bool,
    },
    RunCommand {
        command: Document,
        reply:   Promise<Outcome<Document>>,
    },
    Function(DbFn),
}

impl Task {
    pub fn select(collection: impl Into<String>, query: Query) -> (Self, Signal<Outcome<Vec<Document>>>) {
        let (reply, signal) = promise();
        (
            Self::Select {
                collection: collection.into(),
                query,
                reply,
            },
            signal,
        )
    }

    /// Fire-and-forget update.
    pub fn update(collection: impl Into<String>, filter: Document, update: Document, upsert: bool) -> Self {
        Self::Update {
            collection: collection.into(),
            filter,
            update,
            upsert,
            note: None,
            reply: None,
        }
    }

    /// Update reporting the number of affected documents.
    pub fn update_counted(collection: impl Into<String>, filter: Document, update: Document, upsert: bool)
        -> (Self, Signal<Outcome<u64>>) {
        let (reply, signal) = promise();
        (
            Self::Update {
                collection: collection.into(),
                filter,
                update,
                upsert,
                note: None,
                reply: Some(reply),
            },
            signal,
        )
    }

    pub fn delete(collection: impl Into<String>, filter: Document) -> Self {
        Self::Delete {
            collection: collection.into(),
            filter,
            note: None,
            reply: None,
        }
    }

    pub fn delete_counted(collection: impl Into<String>, filter: Document) -> (Self, Signal<Outcome<u64>>) {
        let (reply, signal) = promise();
        (
            Self::Delete {
                collection: collection.into(),
                filter,
                note: None,
                reply: Some(reply),
            },
            signal,
        )
    }

    pub fn insert(collection: impl Into<String>, document: Document) -> Self {
        Self::Insert {
            collection: collection.into(),
            document,
            fail_okay: false,
            note: None,
        }
    }

    pub fn ensure_index(collection: impl Into<String>, keys: Document, unique: bool) -> Self {
        Self::EnsureIndex {
            collection: collection.into(),
            keys,
            unique,
        }
    }

    pub fn run_command(command: Document) -> (Self, Signal<Outcome<Document>>) {
        let (reply, signal) = promise();
        (Self::RunCommand { command, reply }, signal)
    }

    /// Run arbitrary code against the worker's connection.
    pub fn function<F>(f: F) -> Self
    where
        F: FnOnce(&mut dyn Connection) + Send + 'static,
    {
        Self::Function(Box::new(f))
    }

    /// Like [`Task::function`], but the closure's return value is delivered through a signal.
    pub fn call<T, F>(f: F) -> (Self, Signal<T>)
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn Connection) -> T + Send + 'static,
    {
        let (reply, signal) = promise();
        (Self::function(move |conn| reply.resolve(f(conn))), signal)
    }

    /// Attach a change-log note to a write task. Other kinds of tasks are returned unchanged.
    pub fn with_note(mut self, log_note: LogNote) -> Self {
        match &mut self {
            Self::Update { note, .. } | Self::Delete { note, .. } | Self::Insert { note, .. } => {
                *note = Some(log_note);
            }
            _ => (),
        }
        self
    }

    /// Mark an insert as allowed to fail quietly.
    pub fn fail_okay(mut self) -> Self {
        if let Self::Insert { fail_okay, .. } = &mut self {
            *fail_okay = true;
        }
        self
    }

    pub fn kind(&self) -> TaskKind {
        match self {
            Self::Select { .. } => TaskKind::Select,
            Self::Update { .. } => TaskKind::Update,
            Self::Delete { .. } => TaskKind::Delete,
            Self::Insert { .. } => TaskKind::Insert,
            Self::EnsureIndex { .. } => TaskKind::EnsureIndex,
            Self::RunCommand { .. } => TaskKind::RunCommand,
            Self::Function(_) => TaskKind::Function,
        }
    }

    pub fn collection(&self) -> Option<&str> {
        match self {
            Self::Select { collection, .. }
            | Self::Update { collection, .. }
            | Self::Delete { collection, .. }
            | Self::Insert { collection, .. }
            | Self::EnsureIndex { collection, .. } => Some(collection),
            Self::RunCommand { .. } | Self::Function(_) => None,
        }
    }

    /// Perform the operation on `conn` and resolve the signal, if any. Database errors are logged here and handed to
    /// the waiting side; they never propagate out of this method.
    ///
    /// A write's change-log note is appended after the write even if it failed or matched nothing, so that every
    /// cache re-reads the row and drops in-memory changes the database did not accept.
    pub fn execute(self, conn: &mut dyn Connection) {
        let kind = self.kind();
        match self {
            Self::Select { collection, query, reply } => {
                let result = conn.find(&collection, &query);
                if let Err(err) = &result {
                    report(kind, &collection, &query.filter, err);
                }
                reply.resolve(result);
            }
            Self::Update { collection, filter, update, upsert, note, reply } => {
                let result = conn.update(&collection, &filter, &update, upsert);
                if let Err(err) = &result {
                    report(kind, &collection, &filter, err);
                }
                append_note(conn, note);
                if let Some(reply) = reply {
                    reply.resolve(result);
                }
            }
            Self::Delete { collection, filter, note, reply } => {
                let result = conn.delete(&collection, &filter);
                if let Err(err) = &result {
                    report(kind, &collection, &filter, err);
                }
                append_note(conn, note);
                if let Some(reply) = reply {
                    reply.resolve(result);
                }
            }
            Self::Insert { collection, document, fail_okay, note } => {
                match conn.insert(&collection, &document) {
                    Ok(()) => (),
                    Err(err) if fail_okay => debug!("{kind} into '{collection}' failed as allowed: {err}"),
                    Err(err) => report(kind, &collection, &document, &err),
                }
                append_note(conn, note);
            }
            Self::EnsureIndex { collection, keys, unique } => {
                if let Err(err) = conn.ensure_index(&collection, &keys, unique) {
                    report(kind, &collection, &keys, &err);
                }
            }
            Self::RunCommand { command, reply } => {
                let result = conn.run_command(&command);
                if let Err(err) = &result {
                    report(kind, "", &command, err);
                }
                reply.resolve(result);
            }
            Self::Function(f) => f(conn),
        }
    }
}

fn report(kind: TaskKind, collection: &str, filter: &Document, err: &DbError) {
    let filter = serde_json::Value::Object(filter.clone());
    error!(
        op = kind.as_ref(),
        collection,
        filter = %filter,
        "database operation failed: {err}"
    );
}

fn append_note(conn: &mut dyn Connection, note: Option<LogNote>) {
    let Some(note) = note
    else {
        return;
    };
    if let Err(err) = conn.insert(&note.log, &note.to_document()) {
        error!(
            collection = %note.collection,
            id = %note.id,
            "failed to record change in '{}': {err}",
            note.log
        );
    }
}

impl Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut s = f.debug_struct("Task");
        s.field("kind", &self.kind());
        if let Some(collection) = self.collection() {
            s.field("collection", &collection);
        }
        s.finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryDatabase;
    use crate::doc;
    use crate::traits::Connector;

    fn setup() -> (MemoryDatabase, Box<dyn Connection>) {
        let db = MemoryDatabase::default();
        let conn = db.connect().unwrap();
        (db, conn)
    }

    #[test]
    fn insert_then_select() {
        let (_db, mut conn) = setup();
        Task::insert("groups", doc!({"gid": 1, "name": "staff"})).execute(conn.as_mut());

        let (task, signal) = Task::select("groups", Query::new(doc!({"gid": 1})));
        task.execute(conn.as_mut());
        let rows = signal.outcome().unwrap();
        assert_eq!(rows, vec![doc!({"gid": 1, "name": "staff"})]);
    }

    #[test]
    fn write_notes_go_to_the_log() {
        let (db, mut conn) = setup();
        let note = LogNote::new("updatelog", "users", 3);
        Task::insert("users", doc!({"uid": 3, "name": "joe"}))
            .with_note(note.clone())
            .execute(conn.as_mut());

        // Nothing matched; still logged so that readers re-check uid 4.
        let (task, signal) = Task::update_counted("users", doc!({"uid": 4}), doc!({"$set": {"name": "x"}}), false);
        task.with_note(LogNote::new("updatelog", "users", 4)).execute(conn.as_mut());
        assert_eq!(signal.outcome(), Ok(0));

        let (task, signal) = Task::delete_counted("users", doc!({"uid": 3}));
        task.with_note(note).execute(conn.as_mut());
        assert_eq!(signal.outcome(), Ok(1));

        let log = db.documents("updatelog");
        let ids: Vec<_> = log.iter().map(|d| d["id"].as_i64().unwrap()).collect();
        assert_eq!(ids, vec![3, 4, 3]);
        assert!(log.iter().all(|d| d["collection"] == "users" && d["timestamp"].is_i64()));
    }

    #[test]
    fn failure_resolves_with_error() {
        let (_db, mut conn) = setup();
        let (task, signal) = Task::select("groups", Query::new(doc!({"gid": {"$regex": "x"}})));
        task.execute(conn.as_mut());
        assert!(matches!(signal.outcome(), Err(DbError::Operation { op: "select", .. })));

        let (task, signal) = Task::run_command(doc!({"nope": 1}));
        task.execute(conn.as_mut());
        assert!(signal.outcome().is_err());
    }

    #[test]
    fn call_returns_closure_value() {
        let (_db, mut conn) = setup();
        let (task, signal) = Task::call(|conn| {
            conn.insert("t", &doc!({"a": 1}))?;
            conn.latest_position("t")
        });
        assert_eq!(task.kind(), TaskKind::Function);
        task.execute(conn.as_mut());
        assert!(signal.wait().unwrap().unwrap().is_some());
    }

    #[test]
    fn kind_names() {
        assert_eq!(TaskKind::EnsureIndex.to_string(), "ensure_index");
        let task = Task::insert("x", doc!({})).fail_okay();
        assert!(matches!(task, Task::Insert { fail_okay: true, .. }));
        assert_eq!(format!("{task:?}"), "Task { kind: Insert, collection: \"x\", .. }");
    }
}
