use std::cmp::Ordering as CmpOrdering;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, Result};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::new_id;

/// Every remote round-trip is bounded; a hung connection surfaces as an
/// error instead of blocking the caller indefinitely.
const REQUEST_TIMEOUT_SECONDS: u64 = 20;

pub fn request_timeout() -> Duration {
    Duration::from_secs(REQUEST_TIMEOUT_SECONDS)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    Desc,
}

/// Equality-only filter over document fields.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Filter(pub Vec<(String, Value)>);

impl Filter {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn eq(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.0.push((field.to_string(), value.into()));
        self
    }

    pub fn matches(&self, doc: &Value) -> bool {
        self.0
            .iter()
            .all(|(field, expected)| doc.get(field) == Some(expected))
    }
}

#[derive(Clone, Debug)]
pub struct UpdateOutcome {
    pub matched: u64,
    pub upserted_id: Option<String>,
}

/// Remote document-store port. Documents are JSON objects carrying an opaque
/// string `id`; collections are named per entity.
pub trait DocumentStore: Send + Sync {
    fn insert_one(&self, collection: &str, doc: Value) -> Result<String>;
    fn find_one(&self, collection: &str, filter: &Filter) -> Result<Option<Value>>;
    fn find(
        &self,
        collection: &str,
        filter: &Filter,
        sort: Option<(&str, SortOrder)>,
    ) -> Result<Vec<Value>>;
    fn update_one(
        &self,
        collection: &str,
        filter: &Filter,
        patch: Value,
        upsert: bool,
    ) -> Result<UpdateOutcome>;
    fn delete_many(&self, collection: &str, filter: &Filter) -> Result<u64>;
    fn count(&self, collection: &str, filter: &Filter) -> Result<u64>;
    fn sum(&self, collection: &str, filter: &Filter, field: &str) -> Result<i64>;
}

fn compare_sort_values(a: &Value, b: &Value) -> CmpOrdering {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            let x = x.as_f64().unwrap_or(0.0);
            let y = y.as_f64().unwrap_or(0.0);
            x.partial_cmp(&y).unwrap_or(CmpOrdering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Null, Value::Null) => CmpOrdering::Equal,
        (Value::Null, _) => CmpOrdering::Less,
        (_, Value::Null) => CmpOrdering::Greater,
        _ => CmpOrdering::Equal,
    }
}

fn sort_docs(docs: &mut [Value], sort: Option<(&str, SortOrder)>) {
    let Some((field, order)) = sort else {
        return;
    };

    docs.sort_by(|a, b| {
        let av = a.get(field).unwrap_or(&Value::Null);
        let bv = b.get(field).unwrap_or(&Value::Null);
        let cmp = compare_sort_values(av, bv);
        match order {
            SortOrder::Asc => cmp,
            SortOrder::Desc => cmp.reverse(),
        }
    });
}

/// Stores that key documents by a native `_id` get it folded into the one
/// opaque `id` string callers see.
fn normalize_doc_id(mut doc: Value) -> Value {
    if let Some(obj) = doc.as_object_mut() {
        if !obj.contains_key("id") {
            if let Some(native) = obj.remove("_id") {
                let id = match native {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                obj.insert("id".to_string(), Value::String(id));
            }
        } else {
            obj.remove("_id");
        }
    }
    doc
}

fn apply_patch(doc: &mut Value, patch: &Value) {
    let (Some(target), Some(fields)) = (doc.as_object_mut(), patch.as_object()) else {
        return;
    };
    for (key, value) in fields {
        target.insert(key.clone(), value.clone());
    }
}

static INMEM_NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// In-memory [`DocumentStore`] used as the remote double in tests.
pub struct InMemoryDocumentStore {
    target_id: String,
    collections: Mutex<BTreeMap<String, BTreeMap<String, Value>>>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        let id = INMEM_NEXT_ID.fetch_add(1, Ordering::Relaxed);
        Self {
            target_id: format!("inmem:{id}"),
            collections: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn target_id(&self) -> &str {
        &self.target_id
    }

    /// Raw dump of a collection, insertion-keyed. Test helper.
    pub fn dump(&self, collection: &str) -> Vec<Value> {
        self.collections
            .lock()
            .map(|c| {
                c.get(collection)
                    .map(|docs| docs.values().cloned().collect())
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }
}

impl Default for InMemoryDocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DocumentStore for InMemoryDocumentStore {
    fn insert_one(&self, collection: &str, mut doc: Value) -> Result<String> {
        let mut collections = self
            .collections
            .lock()
            .map_err(|_| anyhow!("poisoned lock"))?;

        let id = doc
            .get("id")
            .and_then(|v| v.as_str())
            .map(|v| v.to_string())
            .unwrap_or_else(new_id);
        if let Some(obj) = doc.as_object_mut() {
            obj.insert("id".to_string(), Value::String(id.clone()));
        }

        collections
            .entry(collection.to_string())
            .or_default()
            .insert(id.clone(), doc);
        Ok(id)
    }

    fn find_one(&self, collection: &str, filter: &Filter) -> Result<Option<Value>> {
        let collections = self
            .collections
            .lock()
            .map_err(|_| anyhow!("poisoned lock"))?;
        Ok(collections
            .get(collection)
            .and_then(|docs| docs.values().find(|doc| filter.matches(doc)).cloned()))
    }

    fn find(
        &self,
        collection: &str,
        filter: &Filter,
        sort: Option<(&str, SortOrder)>,
    ) -> Result<Vec<Value>> {
        let collections = self
            .collections
            .lock()
            .map_err(|_| anyhow!("poisoned lock"))?;
        let mut out: Vec<Value> = collections
            .get(collection)
            .map(|docs| {
                docs.values()
                    .filter(|doc| filter.matches(doc))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        sort_docs(&mut out, sort);
        Ok(out)
    }

    fn update_one(
        &self,
        collection: &str,
        filter: &Filter,
        patch: Value,
        upsert: bool,
    ) -> Result<UpdateOutcome> {
        let mut collections = self
            .collections
            .lock()
            .map_err(|_| anyhow!("poisoned lock"))?;
        let docs = collections.entry(collection.to_string()).or_default();

        if let Some(doc) = docs.values_mut().find(|doc| filter.matches(doc)) {
            apply_patch(doc, &patch);
            return Ok(UpdateOutcome {
                matched: 1,
                upserted_id: None,
            });
        }

        if !upsert {
            return Ok(UpdateOutcome {
                matched: 0,
                upserted_id: None,
            });
        }

        // Upsert seeds the new document from the filter's equality pairs,
        // then applies the patch, mirroring document-store upsert semantics.
        let mut doc = Value::Object(serde_json::Map::new());
        if let Some(obj) = doc.as_object_mut() {
            for (field, value) in &filter.0 {
                obj.insert(field.clone(), value.clone());
            }
        }
        apply_patch(&mut doc, &patch);

        let id = doc
            .get("id")
            .and_then(|v| v.as_str())
            .map(|v| v.to_string())
            .unwrap_or_else(new_id);
        if let Some(obj) = doc.as_object_mut() {
            obj.insert("id".to_string(), Value::String(id.clone()));
        }
        docs.insert(id.clone(), doc);

        Ok(UpdateOutcome {
            matched: 0,
            upserted_id: Some(id),
        })
    }

    fn delete_many(&self, collection: &str, filter: &Filter) -> Result<u64> {
        let mut collections = self
            .collections
            .lock()
            .map_err(|_| anyhow!("poisoned lock"))?;
        let Some(docs) = collections.get_mut(collection) else {
            return Ok(0);
        };

        let before = docs.len();
        docs.retain(|_, doc| !filter.matches(doc));
        Ok((before - docs.len()) as u64)
    }

    fn count(&self, collection: &str, filter: &Filter) -> Result<u64> {
        Ok(self.find(collection, filter, None)?.len() as u64)
    }

    fn sum(&self, collection: &str, filter: &Filter, field: &str) -> Result<i64> {
        let docs = self.find(collection, filter, None)?;
        Ok(docs
            .iter()
            .filter_map(|doc| doc.get(field).and_then(|v| v.as_i64()))
            .sum())
    }
}

#[derive(Debug, Serialize)]
struct QueryRequest<'a> {
    filter: &'a Filter,
    #[serde(skip_serializing_if = "Option::is_none")]
    sort: Option<SortSpec<'a>>,
}

#[derive(Debug, Serialize)]
struct SortSpec<'a> {
    field: &'a str,
    order: SortOrder,
}

#[derive(Debug, Serialize)]
struct UpdateRequest<'a> {
    filter: &'a Filter,
    patch: &'a Value,
    upsert: bool,
}

#[derive(Debug, Serialize)]
struct AggregateRequest<'a> {
    filter: &'a Filter,
    #[serde(skip_serializing_if = "Option::is_none")]
    field: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct InsertResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct FindOneResponse {
    #[serde(default)]
    doc: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct FindResponse {
    #[serde(default)]
    docs: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct UpdateResponse {
    matched: u64,
    #[serde(default)]
    upserted_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DeleteResponse {
    deleted: u64,
}

#[derive(Debug, Deserialize)]
struct CountResponse {
    count: u64,
}

#[derive(Debug, Deserialize)]
struct SumResponse {
    sum: i64,
}

/// JSON-over-HTTP [`DocumentStore`] client for the hosted document service.
pub struct HttpDocumentStore {
    http: Client,
    base_url: String,
    id_token: String,
}

impl HttpDocumentStore {
    pub fn new(base_url: String, id_token: String) -> Result<Self> {
        if base_url.trim().is_empty() {
            return Err(anyhow!("missing_base_url"));
        }
        let http = Client::builder().timeout(request_timeout()).build()?;
        Ok(Self {
            http,
            base_url,
            id_token,
        })
    }

    fn endpoint(&self, collection: &str, verb: &str) -> String {
        format!(
            "{}/v1/collections/{collection}:{verb}",
            self.base_url.trim_end_matches('/')
        )
    }

    fn post<Req: Serialize, Resp: serde::de::DeserializeOwned>(
        &self,
        collection: &str,
        verb: &str,
        body: &Req,
    ) -> Result<Resp> {
        let resp = self
            .http
            .post(self.endpoint(collection, verb))
            .bearer_auth(&self.id_token)
            .json(body)
            .send()?;

        let status = resp.status();
        let text = resp.text().unwrap_or_default();
        if !status.is_success() {
            return Err(anyhow!("document store {verb} failed: HTTP {status} {text}"));
        }

        Ok(serde_json::from_str(&text)?)
    }
}

impl DocumentStore for HttpDocumentStore {
    fn insert_one(&self, collection: &str, doc: Value) -> Result<String> {
        let parsed: InsertResponse = self.post(collection, "insertOne", &doc)?;
        Ok(parsed.id)
    }

    fn find_one(&self, collection: &str, filter: &Filter) -> Result<Option<Value>> {
        let parsed: FindOneResponse = self.post(
            collection,
            "findOne",
            &QueryRequest { filter, sort: None },
        )?;
        Ok(parsed.doc.map(normalize_doc_id))
    }

    fn find(
        &self,
        collection: &str,
        filter: &Filter,
        sort: Option<(&str, SortOrder)>,
    ) -> Result<Vec<Value>> {
        let parsed: FindResponse = self.post(
            collection,
            "find",
            &QueryRequest {
                filter,
                sort: sort.map(|(field, order)| SortSpec { field, order }),
            },
        )?;
        Ok(parsed.docs.into_iter().map(normalize_doc_id).collect())
    }

    fn update_one(
        &self,
        collection: &str,
        filter: &Filter,
        patch: Value,
        upsert: bool,
    ) -> Result<UpdateOutcome> {
        let parsed: UpdateResponse = self.post(
            collection,
            "updateOne",
            &UpdateRequest {
                filter,
                patch: &patch,
                upsert,
            },
        )?;
        Ok(UpdateOutcome {
            matched: parsed.matched,
            upserted_id: parsed.upserted_id,
        })
    }

    fn delete_many(&self, collection: &str, filter: &Filter) -> Result<u64> {
        let parsed: DeleteResponse = self.post(
            collection,
            "deleteMany",
            &QueryRequest { filter, sort: None },
        )?;
        Ok(parsed.deleted)
    }

    fn count(&self, collection: &str, filter: &Filter) -> Result<u64> {
        let parsed: CountResponse = self.post(
            collection,
            "count",
            &AggregateRequest {
                filter,
                field: None,
            },
        )?;
        Ok(parsed.count)
    }

    fn sum(&self, collection: &str, filter: &Filter, field: &str) -> Result<i64> {
        let parsed: SumResponse = self.post(
            collection,
            "sum",
            &AggregateRequest {
                filter,
                field: Some(field),
            },
        )?;
        Ok(parsed.sum)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn upsert_creates_then_updates_in_place() {
        let store = InMemoryDocumentStore::new();
        let filter = Filter::new().eq("userId", "u1").eq("provider", "openai");

        let first = store
            .update_one("provider_settings", &filter, json!({"apiKey": "k1"}), true)
            .expect("upsert");
        assert_eq!(first.matched, 0);
        assert!(first.upserted_id.is_some());

        let second = store
            .update_one("provider_settings", &filter, json!({"apiKey": "k2"}), true)
            .expect("upsert");
        assert_eq!(second.matched, 1);
        assert!(second.upserted_id.is_none());

        assert_eq!(store.count("provider_settings", &filter).expect("count"), 1);
        let doc = store
            .find_one("provider_settings", &filter)
            .expect("find")
            .expect("doc");
        assert_eq!(doc["apiKey"], "k2");
    }

    #[test]
    fn find_sorts_by_numeric_field() {
        let store = InMemoryDocumentStore::new();
        for (id, at) in [("a", 30), ("b", 10), ("c", 20)] {
            store
                .insert_one("sessions", json!({"id": id, "started_at": at}))
                .expect("insert");
        }

        let docs = store
            .find("sessions", &Filter::new(), Some(("started_at", SortOrder::Asc)))
            .expect("find");
        let ids: Vec<&str> = docs.iter().map(|d| d["id"].as_str().unwrap()).collect();
        assert_eq!(ids, ["b", "c", "a"]);
    }

    #[test]
    fn sum_ignores_missing_fields() {
        let store = InMemoryDocumentStore::new();
        store
            .insert_one("ai_messages", json!({"sessionId": "s1", "tokens": 7}))
            .expect("insert");
        store
            .insert_one("ai_messages", json!({"sessionId": "s1"}))
            .expect("insert");

        let filter = Filter::new().eq("sessionId", "s1");
        assert_eq!(store.sum("ai_messages", &filter, "tokens").expect("sum"), 7);
    }
}
