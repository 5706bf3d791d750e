use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The current wall-clock time as an RFC3339 string with second precision.
pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// A stored document: a mapping from string keys to JSON values.
///
/// Every document carries a string `id` (assigned at insertion when absent)
/// and the system timestamps `createdAt` / `updatedAt`. The newtype derefs
/// to the underlying [`serde_json::Map`] so callers can treat it as a plain
/// JSON object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Document(pub Map<String, Value>);

impl Document {
    pub fn new() -> Self {
        Document(Map::new())
    }

    /// The document id, if assigned.
    pub fn id(&self) -> Option<&str> {
        self.0.get("id").and_then(Value::as_str)
    }

    /// Assign a fresh v4 UUID as the id if none is present, and return it.
    pub fn ensure_id(&mut self) -> String {
        if let Some(id) = self.id() {
            return id.to_string();
        }
        let id = uuid::Uuid::new_v4().to_string();
        self.0.insert("id".into(), Value::String(id.clone()));
        id
    }

    /// Stamp `createdAt` and `updatedAt` with the current time (insert path).
    pub fn stamp_created(&mut self) {
        let now = now_rfc3339();
        self.0.insert("createdAt".into(), Value::String(now.clone()));
        self.0.insert("updatedAt".into(), Value::String(now));
    }

    /// Stamp `updatedAt` with the current time (mutation path).
    pub fn stamp_updated(&mut self) {
        self.0
            .insert("updatedAt".into(), Value::String(now_rfc3339()));
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    pub fn into_inner(self) -> Map<String, Value> {
        self.0
    }

    /// Build a document from any JSON value; non-objects yield an empty map.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(map) => Document(map),
            _ => Document(Map::new()),
        }
    }
}

impl From<Map<String, Value>> for Document {
    fn from(map: Map<String, Value>) -> Self {
        Document(map)
    }
}

impl std::ops::Deref for Document {
    type Target = Map<String, Value>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::ops::DerefMut for Document {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}
