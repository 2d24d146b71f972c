use memdex_error::{MemdexError, Result};

/// Client-side document builder.
///
/// An item is plain JSON until it reaches a namespace; validation against
/// the payload type and the tagsmatcher merge happen at write time, under
/// the namespace lock.
#[derive(Debug, Clone, Default)]
pub struct Item {
    value: serde_json::Value,
}

impl Item {
    #[must_use]
    pub fn new() -> Self {
        Self {
            value: serde_json::Value::Object(serde_json::Map::new()),
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let value =
            serde_json::from_str(json).map_err(|e| MemdexError::parse_json(e.to_string()))?;
        Ok(Self { value })
    }

    /// Set one top-level field.
    pub fn set(&mut self, field: &str, value: impl Into<serde_json::Value>) -> &mut Self {
        if let serde_json::Value::Object(map) = &mut self.value {
            map.insert(field.to_owned(), value.into());
        }
        self
    }

    #[must_use]
    pub fn get(&self, field: &str) -> Option<&serde_json::Value> {
        self.value.get(field)
    }

    #[must_use]
    pub fn to_json(&self) -> String {
        self.value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_and_serialize() {
        let mut item = Item::new();
        item.set("id", 7).set("name", "widget");
        let json = item.to_json();
        assert!(json.contains("\"id\":7"));
        let parsed = Item::from_json(&json).unwrap();
        assert_eq!(parsed.get("name").unwrap(), "widget");
    }

    #[test]
    fn test_invalid_json_is_parse_error() {
        let err = Item::from_json("{oops").unwrap_err();
        assert_eq!(err.code(), memdex_error::ErrorCode::ParseJson);
    }
}
