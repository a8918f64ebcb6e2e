//! Identity records kept by the caches.
use std::fmt::Debug;
use std::fmt::Display;
use std::hash::Hash;

use globset::GlobBuilder;
use globset::GlobSet;
use globset::GlobSetBuilder;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::doc;
use crate::document::Document;

/// A row of an identity collection: a numeric id and a unique name plus whatever else the record carries.
pub trait Record: Clone + Debug + PartialEq + Send + Sync + 'static {
    type Id: Copy + Eq + Ord + Hash + Debug + Display + Into<Value> + Send + Sync + 'static;

    const COLLECTION: &'static str;
    const ID_FIELD: &'static str;
    /// What the record is called in messages.
    const KIND: &'static str;

    /// A fresh record with default attributes.
    fn new(id: Self::Id, name: &str) -> Self;
    fn id(&self) -> Self::Id;
    fn name(&self) -> &str;
    fn set_name(&mut self, name: &str);

    fn to_document(&self) -> Document;
    /// `None` if the document lacks a required field or has a wrong type.
    fn from_document(doc: &Document) -> Option<Self>;

    /// Extract an id from a change-log entry; anything that is not an integer in range yields `None`.
    fn id_from_value(value: &Value) -> Option<Self::Id>;

    /// Id of the first record in an empty collection.
    fn first_id() -> Self::Id;
    /// `None` once the id space is exhausted.
    fn next_id(after: Self::Id) -> Option<Self::Id>;
}

fn i32_from_value(value: &Value) -> Option<i32> {
    value.as_i64().and_then(|v| i32::try_from(v).ok())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub gid:  i32,
    pub name: String,
}

impl Record for Group {
    type Id = i32;

    const COLLECTION: &'static str = "groups";
    const ID_FIELD: &'static str = "gid";
    const KIND: &'static str = "group";

    fn new(gid: i32, name: &str) -> Self {
        Self {
            gid,
            name: name.to_string(),
        }
    }

    fn id(&self) -> i32 {
        self.gid
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn set_name(&mut self, name: &str) {
        self.name = name.to_string();
    }

    fn to_document(&self) -> Document {
        doc!({"gid": self.gid, "name": self.name})
    }

    fn from_document(doc: &Document) -> Option<Self> {
        serde_json::from_value(Value::Object(doc.clone())).ok()
    }

    fn id_from_value(value: &Value) -> Option<i32> {
        i32_from_value(value)
    }

    fn first_id() -> i32 {
        1
    }

    fn next_id(after: i32) -> Option<i32> {
        after.checked_add(1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub uid:         i32,
    pub name:        String,
    /// `-1` when the user has no primary group.
    #[serde(rename = "primary gid", default = "no_group")]
    pub primary_gid: i32,
    #[serde(rename = "ip masks", default)]
    pub ip_masks:    IpMasks,
}

fn no_group() -> i32 {
    -1
}

impl User {
    /// Does any of the user's `ident@address` masks match? Matching is case-insensitive, `*` and `?` are wildcards.
    pub fn ident_ip_allowed(&self, ident_address: &str) -> bool {
        self.ip_masks.is_match(ident_address)
    }
}

/// A user's `ident@address` masks together with their compiled matcher.
///
/// The matcher is rebuilt whenever the list changes. Malformed masks are kept in the list, so they round-trip through
/// the database, but never match anything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct IpMasks {
    masks:   Vec<String>,
    matcher: GlobSet,
}

impl IpMasks {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn as_slice(&self) -> &[String] {
        &self.masks
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.masks.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.masks.is_empty()
    }

    pub fn contains(&self, mask: &str) -> bool {
        self.masks.iter().any(|m| m == mask)
    }

    /// Returns `false` if the mask was already there.
    pub fn insert(&mut self, mask: &str) -> bool {
        if self.contains(mask) {
            return false;
        }
        self.masks.push(mask.to_string());
        self.rebuild();
        true
    }

    /// Returns `false` if there was no such mask.
    pub fn remove(&mut self, mask: &str) -> bool {
        let before = self.masks.len();
        self.masks.retain(|m| m != mask);
        if self.masks.len() == before {
            return false;
        }
        self.rebuild();
        true
    }

    #[inline]
    pub fn is_match(&self, ident_address: &str) -> bool {
        self.matcher.is_match(ident_address)
    }

    fn rebuild(&mut self) {
        self.matcher = compile_masks(&self.masks);
    }
}

fn compile_masks(masks: &[String]) -> GlobSet {
    let mut builder = GlobSetBuilder::new();
    for mask in masks {
        match GlobBuilder::new(mask).case_insensitive(true).build() {
            Ok(glob) => {
                builder.add(glob);
            }
            Err(err) => debug!("ignoring malformed ip mask '{mask}': {err}"),
        }
    }
    builder.build().unwrap_or_else(|err| {
        debug!("cannot compile ip masks {masks:?}: {err}");
        GlobSet::empty()
    })
}

impl From<Vec<String>> for IpMasks {
    fn from(masks: Vec<String>) -> Self {
        let matcher = compile_masks(&masks);
        Self { masks, matcher }
    }
}

impl From<IpMasks> for Vec<String> {
    fn from(masks: IpMasks) -> Self {
        masks.masks
    }
}

impl PartialEq for IpMasks {
    fn eq(&self, other: &Self) -> bool {
        self.masks == other.masks
    }
}

impl Eq for IpMasks {}

impl Record for User {
    type Id = i32;

    const COLLECTION: &'static str = "users";
    const ID_FIELD: &'static str = "uid";
    const KIND: &'static str = "user";

    fn new(uid: i32, name: &str) -> Self {
        Self {
            uid,
            name: name.to_string(),
            primary_gid: no_group(),
            ip_masks: IpMasks::new(),
        }
    }

    fn id(&self) -> i32 {
        self.uid
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn set_name(&mut self, name: &str) {
        self.name = name.to_string();
    }

    fn to_document(&self) -> Document {
        doc!({
            "uid": self.uid,
            "name": self.name,
            "primary gid": self.primary_gid,
            "ip masks": self.ip_masks.as_slice(),
        })
    }

    fn from_document(doc: &Document) -> Option<Self> {
        serde_json::from_value(Value::Object(doc.clone())).ok()
    }

    fn id_from_value(value: &Value) -> Option<i32> {
        i32_from_value(value)
    }

    fn first_id() -> i32 {
        1
    }

    fn next_id(after: i32) -> Option<i32> {
        after.checked_add(1)
    }
}
