//! Documents, filters, update expressions and query specifications.
//!
//! The document model is JSON: a [`Document`] is a JSON object. Filters and update expressions follow the usual
//! document-database conventions restricted to what the identity caches need:
//!
//! - filters: `{"field": value}` equality (an array field matches if it contains the value), and the operators
//!   `$eq`, `$ne`, `$gt`, `$gte`, `$lt`, `$lte`, `$in`, `$nin`, `$exists`;
//! - updates: either a replacement document or an operator document with `$set`, `$unset`, `$inc`, `$push`,
//!   `$pull`.
use std::cmp::Ordering;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;

pub type Document = Map<String, Value>;

/// Build a [`Document`] from JSON syntax. Anything but a JSON object produces an empty document.
///
/// ```
/// let d = idcache::doc!({"gid": 1, "name": "staff"});
/// assert_eq!(d["name"], "staff");
/// ```
#[macro_export]
macro_rules! doc {
    ($($json:tt)+) => {
        $crate::document::into_document($crate::serde_json::json!($($json)+))
    };
}

#[inline]
pub fn into_document(value: Value) -> Document {
    match value {
        Value::Object(map) => map,
        _ => Document::new(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Order {
    Ascending,
    Descending,
}

/// Parameters of a point or range query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub filter: Document,
    pub sort:   Vec<(String, Order)>,
    /// Maximum number of documents to return; 0 means unlimited.
    pub limit:  usize,
    pub skip:   usize,
}

impl Query {
    pub fn new(filter: Document) -> Self {
        Self {
            filter,
            ..Default::default()
        }
    }

    /// Matches every document of a collection.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn sort_by(mut self, field: impl Into<String>, order: Order) -> Self {
        self.sort.push((field.into(), order));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn skip(mut self, skip: usize) -> Self {
        self.skip = skip;
        self
    }

    /// Apply the query to a set of candidate documents.
    pub fn run<'a, I>(&self, docs: I) -> Result<Vec<Document>, String>
    where
        I: IntoIterator<Item = &'a Document>,
    {
        let mut selected = Vec::new();
        for doc in docs {
            if matches(doc, &self.filter)? {
                selected.push(doc.clone());
            }
        }

        if !self.sort.is_empty() {
            selected.sort_by(|a, b| {
                for (field, order) in &self.sort {
                    let ord = compare_fields(a.get(field), b.get(field));
                    let ord = match order {
                        Order::Ascending => ord,
                        Order::Descending => ord.reverse(),
                    };
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                Ordering::Equal
            });
        }

        let iter = selected.into_iter().skip(self.skip);
        Ok(if self.limit > 0 {
            iter.take(self.limit).collect()
        }
        else {
            iter.collect()
        })
    }
}

// Missing fields sort before present ones; incomparable values are considered equal.
fn compare_fields(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => compare_values(a, b).unwrap_or(Ordering::Equal),
    }
}

pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            if let (Some(x), Some(y)) = (x.as_i64(), y.as_i64()) {
                Some(x.cmp(&y))
            }
            else {
                x.as_f64()?.partial_cmp(&y.as_f64()?)
            }
        }
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => None,
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => compare_values(a, b) == Some(Ordering::Equal),
        _ => a == b,
    }
}

// Equality the way a document database applies it to a field: arrays match any member.
fn field_equals(field: Option<&Value>, expected: &Value) -> bool {
    match field {
        None => expected.is_null(),
        Some(Value::Array(items)) if !expected.is_array() => items.iter().any(|i| values_equal(i, expected)),
        Some(v) => values_equal(v, expected),
    }
}

fn is_operator_doc(value: &Value) -> bool {
    value
        .as_object()
        .is_some_and(|m| !m.is_empty() && m.keys().all(|k| k.starts_with('$')))
}

/// Test a document against a filter.
pub fn matches(doc: &Document, filter: &Document) -> Result<bool, String> {
    for (field, condition) in filter {
        let actual = doc.get(field);
        if is_operator_doc(condition) {
            for (op, operand) in condition.as_object().into_iter().flatten() {
                if !apply_operator(op, actual, operand)? {
                    return Ok(false);
                }
            }
        }
        else if !field_equals(actual, condition) {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Reject filters with unknown operators or malformed operands, whatever documents they would be applied to.
pub fn validate_filter(filter: &Document) -> Result<(), String> {
    for condition in filter.values().filter(|c| is_operator_doc(c)) {
        for (op, operand) in condition.as_object().into_iter().flatten() {
            apply_operator(op, None, operand)?;
        }
    }
    Ok(())
}

fn apply_operator(op: &str, actual: Option<&Value>, operand: &Value) -> Result<bool, String> {
    let ordered = |accept: fn(Ordering) -> bool| {
        actual
            .and_then(|a| compare_values(a, operand))
            .is_some_and(accept)
    };

    Ok(match op {
        "$eq" => field_equals(actual, operand),
        "$ne" => !field_equals(actual, operand),
        "$gt" => ordered(|o| o == Ordering::Greater),
        "$gte" => ordered(|o| o != Ordering::Less),
        "$lt" => ordered(|o| o == Ordering::Less),
        "$lte" => ordered(|o| o != Ordering::Greater),
        "$in" | "$nin" => {
            let Value::Array(candidates) = operand
            else {
                return Err(format!("{op} needs an array, got {operand}"));
            };
            let found = candidates.iter().any(|c| field_equals(actual, c));
            if op == "$in" {
                found
            }
            else {
                !found
            }
        }
        "$exists" => actual.is_some() == operand.as_bool().unwrap_or(true),
        _ => return Err(format!("unknown query operator {op}")),
    })
}

/// Tells whether an update is an operator document (`{"$set": ...}`) rather than a replacement.
pub fn is_update_expression(update: &Document) -> bool {
    update.keys().next().is_some_and(|k| k.starts_with('$'))
}

/// Apply an update expression or a replacement document to `doc`.
pub fn apply_update(doc: &mut Document, update: &Document) -> Result<(), String> {
    if !is_update_expression(update) {
        if let Some(key) = update.keys().find(|k| k.starts_with('$')) {
            return Err(format!("replacement document may not contain operator {key}"));
        }
        *doc = update.clone();
        return Ok(());
    }

    for (op, fields) in update {
        let Value::Object(fields) = fields
        else {
            return Err(format!("{op} needs a document, got {fields}"));
        };

        for (field, value) in fields {
            match op.as_str() {
                "$set" => {
                    doc.insert(field.clone(), value.clone());
                }
                "$unset" => {
                    doc.remove(field);
                }
                "$inc" => {
                    let delta = value
                        .as_i64()
                        .ok_or_else(|| format!("$inc of '{field}' needs an integer, got {value}"))?;
                    let current = match doc.get(field) {
                        None => 0,
                        Some(v) => v
                            .as_i64()
                            .ok_or_else(|| format!("cannot $inc non-integer field '{field}'"))?,
                    };
                    doc.insert(field.clone(), Value::from(current + delta));
                }
                "$push" => match doc.entry(field.clone()).or_insert_with(|| Value::Array(vec![])) {
                    Value::Array(items) => items.push(value.clone()),
                    _ => return Err(format!("cannot $push to non-array field '{field}'")),
                },
                "$pull" => {
                    if let Some(Value::Array(items)) = doc.get_mut(field) {
                        items.retain(|i| !values_equal(i, value));
                    }
                }
                _ => return Err(format!("unknown update operator {op}")),
            }
        }
    }

    Ok(())
}

/// The document an upsert creates when nothing matched: the equality terms of the filter with the update applied on
/// top of them.
pub fn upsert_seed(filter: &Document, update: &Document) -> Result<Document, String> {
    let mut doc: Document = filter
        .iter()
        .filter(|(_, v)| !is_operator_doc(v))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    if is_update_expression(update) {
        apply_update(&mut doc, update)?;
    }
    else {
        for (k, v) in update {
            doc.insert(k.clone(), v.clone());
        }
    }

    Ok(doc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc;

    fn people() -> Vec<Document> {
        vec![
            doc!({"uid": 1, "name": "alice", "ip masks": ["*@10.0.0.*"]}),
            doc!({"uid": 3, "name": "carol"}),
            doc!({"uid": 2, "name": "bob", "primary gid": 5}),
        ]
    }

    #[test]
    fn equality_and_operators() {
        let docs = people();
        assert!(matches(&docs[0], &doc!({"name": "alice"})).unwrap());
        assert!(!matches(&docs[0], &doc!({"name": "bob"})).unwrap());
        assert!(matches(&docs[0], &doc!({"ip masks": "*@10.0.0.*"})).unwrap());
        assert!(matches(&docs[1], &doc!({"uid": {"$gt": 2, "$lte": 3}})).unwrap());
        assert!(matches(&docs[2], &doc!({"uid": {"$in": [2, 7]}})).unwrap());
        assert!(!matches(&docs[1], &doc!({"primary gid": {"$exists": true}})).unwrap());
        assert!(matches(&docs[1], &doc!({})).unwrap());
        assert!(matches(&docs[0], &doc!({"uid": {"$bogus": 1}})).is_err());
        // Rejected even behind a term that fails first.
        assert!(validate_filter(&doc!({"name": "nobody", "uid": {"$bogus": 1}})).is_err());
        assert!(validate_filter(&doc!({"uid": {"$in": 2}})).is_err());
        assert!(validate_filter(&doc!({"uid": {"$in": [2]}, "name": "x"})).is_ok());
    }

    #[test]
    fn sort_limit_skip() {
        let docs = people();
        let q = Query::all().sort_by("uid", Order::Descending).limit(1);
        let out = q.run(&docs).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0]["uid"], 3);

        let q = Query::all().sort_by("uid", Order::Ascending).skip(1);
        let uids: Vec<_> = q.run(&docs).unwrap().iter().map(|d| d["uid"].clone()).collect();
        assert_eq!(uids, vec![Value::from(2), Value::from(3)]);
    }

    #[test]
    fn update_expressions() {
        let mut d = doc!({"uid": 1, "name": "alice", "logins": 1});
        apply_update(&mut d, &doc!({"$set": {"name": "alicia"}, "$inc": {"logins": 2}})).unwrap();
        assert_eq!(d["name"], "alicia");
        assert_eq!(d["logins"], 3);

        apply_update(&mut d, &doc!({"$push": {"ip masks": "*@*"}})).unwrap();
        apply_update(&mut d, &doc!({"$pull": {"ip masks": "*@*"}})).unwrap();
        assert_eq!(d["ip masks"], Value::Array(vec![]));

        assert!(apply_update(&mut d, &doc!({"$rename": {"name": "n"}})).is_err());
        assert!(apply_update(&mut d, &doc!({"$inc": {"name": 1}})).is_err());

        apply_update(&mut d, &doc!({"uid": 1, "name": "replaced"})).unwrap();
        assert_eq!(d, doc!({"uid": 1, "name": "replaced"}));
    }

    #[test]
    fn upsert_seeds_from_filter() {
        let seeded = upsert_seed(&doc!({"gid": 4, "uid": {"$gt": 1}}), &doc!({"$set": {"name": "ops"}})).unwrap();
        assert_eq!(seeded, doc!({"gid": 4, "name": "ops"}));
    }
}
