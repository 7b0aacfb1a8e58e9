use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Marker key set on enrichment items whose detail extraction failed.
pub const ENRICHMENT_ERROR_KEY: &str = "enrichment_error";

/// One extracted record: an open field bag.
///
/// Well-known keys are `name`, `location`, `rating`, `reviews`, `price`,
/// `url` and, after enrichment, `website`, `phone`, `email`, `facebook`,
/// `instagram`, `pinterest`, `twitter`. Nothing is mandatory and extra keys
/// are kept. Null values are never stored, so an absent field is always
/// absent rather than `null`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScrapedItem(Map<String, Value>);

impl ScrapedItem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds an item from a JSON object, dropping null fields.
    /// Returns `None` for anything that is not an object.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(Self(
                map.into_iter().filter(|(_, v)| !v.is_null()).collect(),
            )),
            _ => None,
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        let value = value.into();
        if value.is_null() {
            self.0.remove(key);
        } else {
            self.0.insert(key.to_string(), value);
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn url(&self) -> Option<&str> {
        self.get_str("url")
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Overlays `other` on top of `self`; keys in `other` win.
    pub fn merge(&mut self, other: ScrapedItem) {
        for (k, v) in other.0 {
            self.0.insert(k, v);
        }
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }
}

impl From<Map<String, Value>> for ScrapedItem {
    fn from(map: Map<String, Value>) -> Self {
        Self(map.into_iter().filter(|(_, v)| !v.is_null()).collect())
    }
}
