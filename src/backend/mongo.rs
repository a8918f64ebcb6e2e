//! MongoDB backend over the driver's blocking API.
//!
//! Change-log positions come from the server: every document inserted into the log collection gets an empty BSON
//! timestamp in [`POSITION_FIELD`], which the server replaces with a unique, increasing value. Tailing polls for the
//! first entry past the last seen position, so a cursor never blocks the replicator beyond one round-trip.
use mongodb::bson;
use mongodb::bson::Bson;
use mongodb::bson::Timestamp;
use mongodb::error::ErrorKind;
use mongodb::sync::Client;
use mongodb::sync::Collection;
use mongodb::sync::Database;
use serde_json::Value;
use tracing::debug;
use tracing::instrument;

use crate::config::Config;
use crate::document::Document;
use crate::document::Order;
use crate::document::Query;
use crate::error::DbError;
use crate::traits::Connection;
use crate::traits::Connector;
use crate::traits::TailCursor;
use crate::types::LogEntry;
use crate::types::LogId;
use crate::types::TailPoll;

/// Field of a change-log document holding its server-assigned position.
pub const POSITION_FIELD: &str = "pos";

/// Connects to one MongoDB database. The driver client is shared by every connection it hands out.
#[derive(Debug, Clone)]
pub struct MongoConnector {
    client:         Client,
    address:        String,
    database:       String,
    log_collection: String,
}

impl MongoConnector {
    /// Connector for the database and change log named in `config`.
    pub fn new(config: &Config) -> Result<Self, DbError> {
        let database = config.database();
        Self::with_uri(
            &database.connection_url(),
            database.url(),
            database.name().as_str(),
            config.replicator().log_collection().as_str(),
        )
    }

    /// Connector for an explicit URI. `address` is what logs and errors show instead of the URI.
    pub fn with_uri(
        uri: &str,
        address: impl Into<String>,
        database: impl Into<String>,
        log_collection: impl Into<String>,
    ) -> Result<Self, DbError> {
        let address = address.into();
        let client = Client::with_uri_str(uri).map_err(|err| DbError::connection(&address, err))?;
        Ok(Self {
            client,
            address,
            database: database.into(),
            log_collection: log_collection.into(),
        })
    }
}

impl Connector for MongoConnector {
    fn address(&self) -> String {
        self.address.clone()
    }

    #[instrument(level = "trace", skip(self), fields(address = %self.address))]
    fn connect(&self) -> Result<Box<dyn Connection>, DbError> {
        let db = self.client.database(&self.database);
        // The driver connects lazily; make sure the server is there before handing out a connection.
        db.run_command(bson::doc! { "ping": 1 })
            .run()
            .map_err(|err| DbError::connection(&self.address, err))?;
        debug!("connected to {}", self.address);
        Ok(Box::new(MongoConnection {
            db,
            address: self.address.clone(),
            log_collection: self.log_collection.clone(),
        }))
    }
}

pub struct MongoConnection {
    db:             Database,
    address:        String,
    log_collection: String,
}

impl MongoConnection {
    fn collection(&self, name: &str) -> Collection<bson::Document> {
        self.db.collection::<bson::Document>(name)
    }

    fn error(&self, op: &'static str, collection: &str, err: mongodb::error::Error) -> DbError {
        map_error(&self.address, op, collection, err)
    }

    fn convert(op: &'static str, collection: &str, document: &Document) -> Result<bson::Document, DbError> {
        to_bson(document).map_err(|msg| DbError::operation(op, collection, msg))
    }
}

impl Connection for MongoConnection {
    fn find(&mut self, collection: &str, query: &Query) -> Result<Vec<Document>, DbError> {
        let filter = Self::convert("find", collection, &query.filter)?;
        let rows = self.collection(collection);
        let mut find = rows.find(filter);
        if !query.sort.is_empty() {
            find = find.sort(sort_document(&query.sort));
        }
        if query.limit > 0 {
            find = find.limit(query.limit as i64);
        }
        if query.skip > 0 {
            find = find.skip(query.skip as u64);
        }

        let cursor = find.run().map_err(|err| self.error("find", collection, err))?;
        cursor
            .map(|row| row.map(from_bson).map_err(|err| self.error("find", collection, err)))
            .collect()
    }

    fn insert(&mut self, collection: &str, document: &Document) -> Result<(), DbError> {
        let mut document = Self::convert("insert", collection, document)?;
        if collection == self.log_collection {
            // Filled in by the server.
            document.insert(POSITION_FIELD, Timestamp { time: 0, increment: 0 });
        }
        self.collection(collection)
            .insert_one(document)
            .run()
            .map_err(|err| self.error("insert", collection, err))?;
        Ok(())
    }

    fn update(&mut self, collection: &str, filter: &Document, update: &Document, upsert: bool) -> Result<u64, DbError> {
        let filter = Self::convert("update", collection, filter)?;
        let update = Self::convert("update", collection, update)?;
        let result = self
            .collection(collection)
            .update_many(filter, update)
            .upsert(upsert)
            .run()
            .map_err(|err| self.error("update", collection, err))?;
        Ok(result.matched_count + u64::from(result.upserted_id.is_some()))
    }

    fn delete(&mut self, collection: &str, filter: &Document) -> Result<u64, DbError> {
        let filter = Self::convert("delete", collection, filter)?;
        let result = self
            .collection(collection)
            .delete_many(filter)
            .run()
            .map_err(|err| self.error("delete", collection, err))?;
        Ok(result.deleted_count)
    }

    fn ensure_index(&mut self, collection: &str, keys: &Document, unique: bool) -> Result<(), DbError> {
        let name = index_name(keys);
        let keys = Self::convert("ensure_index", collection, keys)?;
        self.db
            .run_command(bson::doc! {
                "createIndexes": collection,
                "indexes": [{ "key": keys, "name": name, "unique": unique }],
            })
            .run()
            .map_err(|err| self.error("ensure_index", collection, err))?;
        Ok(())
    }

    fn run_command(&mut self, command: &Document) -> Result<Document, DbError> {
        let command = Self::convert("run_command", "", command)?;
        match self.db.run_command(command).run() {
            Ok(reply) => Ok(from_bson(reply)),
            Err(err) => match err.kind.as_ref() {
                // The server answered: report the refusal the way the server words it.
                ErrorKind::Command(failure) => {
                    let mut reply = Document::new();
                    reply.insert("ok".into(), Value::from(0));
                    reply.insert("errmsg".into(), Value::from(failure.message.clone()));
                    reply.insert("code".into(), Value::from(failure.code));
                    Ok(reply)
                }
                _ => Err(self.error("run_command", "", err)),
            },
        }
    }

    fn latest_position(&mut self, collection: &str) -> Result<Option<LogId>, DbError> {
        let newest = self
            .collection(collection)
            .find_one(bson::doc! { POSITION_FIELD: { "$exists": true } })
            .sort(bson::doc! { POSITION_FIELD: -1 })
            .run()
            .map_err(|err| self.error("latest position", collection, err))?;
        Ok(newest.as_ref().and_then(position_of))
    }

    fn tail(&mut self, collection: &str, after: Option<LogId>) -> Result<Box<dyn TailCursor>, DbError> {
        Ok(Box::new(MongoTail {
            collection: self.collection(collection),
            address: self.address.clone(),
            name: collection.to_owned(),
            after,
        }))
    }
}

struct MongoTail {
    collection: Collection<bson::Document>,
    address:    String,
    name:       String,
    after:      Option<LogId>,
}

impl MongoTail {
    fn error(&self, err: mongodb::error::Error) -> DbError {
        map_error(&self.address, "tail", &self.name, err)
    }

    // The entry at the last seen position is still there, so nothing between it and the next one was evicted.
    fn position_held(&self, after: LogId) -> Result<bool, DbError> {
        let found = self
            .collection
            .find_one(bson::doc! { POSITION_FIELD: position_timestamp(after) })
            .run()
            .map_err(|err| self.error(err))?;
        Ok(found.is_some())
    }
}

impl TailCursor for MongoTail {
    fn poll(&mut self) -> Result<TailPoll, DbError> {
        let filter = match self.after {
            Some(after) => bson::doc! { POSITION_FIELD: { "$gt": position_timestamp(after) } },
            None => bson::doc! { POSITION_FIELD: { "$exists": true } },
        };
        let next = self
            .collection
            .find_one(filter)
            .sort(bson::doc! { POSITION_FIELD: 1 })
            .run()
            .map_err(|err| self.error(err))?;

        let Some(document) = next
        else {
            return Ok(TailPoll::Empty);
        };
        let Some(id) = position_of(&document)
        else {
            return Err(DbError::operation("tail", &self.name, "log entry without a position"));
        };
        if let Some(after) = self.after {
            if !self.position_held(after)? {
                return Err(DbError::PositionLost(self.name.clone()));
            }
        }

        self.after = Some(id);
        let mut document = from_bson(document);
        document.remove(POSITION_FIELD);
        Ok(TailPoll::Entry(LogEntry { id, document }))
    }
}

fn map_error(address: &str, op: &'static str, collection: &str, err: mongodb::error::Error) -> DbError {
    match err.kind.as_ref() {
        ErrorKind::Io(_) | ErrorKind::ServerSelection { .. } | ErrorKind::ConnectionPoolCleared { .. } => {
            DbError::connection(address, err)
        }
        _ => DbError::operation(op, collection, err),
    }
}

fn to_bson(document: &Document) -> Result<bson::Document, String> {
    match Bson::try_from(Value::Object(document.clone())) {
        Ok(Bson::Document(document)) => Ok(document),
        Ok(other) => Err(format!("expected a document, got {other}")),
        Err(err) => Err(err.to_string()),
    }
}

// Server-side `_id`s are not part of the document model.
fn from_bson(mut document: bson::Document) -> Document {
    document.remove("_id");
    match Bson::Document(document).into_relaxed_extjson() {
        Value::Object(map) => map,
        _ => Document::new(),
    }
}

fn sort_document(sort: &[(String, Order)]) -> bson::Document {
    sort.iter()
        .map(|(field, order)| {
            let direction = match order {
                Order::Ascending => 1,
                Order::Descending => -1,
            };
            (field.clone(), Bson::Int32(direction))
        })
        .collect()
}

// Same naming the server uses by default: `field_1_other_-1`.
fn index_name(keys: &Document) -> String {
    keys.iter()
        .map(|(field, direction)| format!("{field}_{direction}"))
        .collect::<Vec<_>>()
        .join("_")
}

fn position_of(document: &bson::Document) -> Option<LogId> {
    match document.get(POSITION_FIELD) {
        Some(Bson::Timestamp(ts)) => Some(LogId((u64::from(ts.time) << 32) | u64::from(ts.increment))),
        _ => None,
    }
}

fn position_timestamp(id: LogId) -> Timestamp {
    Timestamp {
        time:      (id.0 >> 32) as u32,
        increment: (id.0 & 0xffff_ffff) as u32,
    }
}
