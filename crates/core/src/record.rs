use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// One record flowing through a curation pipeline.
///
/// The payload is schemaless JSON; operators read and write named
/// fields without the core knowing what a "document" or "sample" is.
/// Stage-computed values (filter stats, dedup keys) are attached as
/// additional fields on the same record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    /// Stable identity, preserved across stages.
    pub id: Uuid,
    /// Arbitrary payload fields.
    pub data: Value,
}

impl Record {
    /// Create a record with a fresh id.
    pub fn new(data: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            data,
        }
    }

    /// Read a named field, if the payload is an object and the field exists.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.data.as_object().and_then(|obj| obj.get(name))
    }

    /// Set a named field, converting a non-object payload into an object
    /// holding the previous payload under `"value"`.
    pub fn set_field(&mut self, name: &str, value: Value) {
        if !self.data.is_object() {
            let old = std::mem::replace(&mut self.data, Value::Object(Default::default()));
            if !old.is_null() {
                if let Some(obj) = self.data.as_object_mut() {
                    obj.insert("value".to_string(), old);
                }
            }
        }
        if let Some(obj) = self.data.as_object_mut() {
            obj.insert(name.to_string(), value);
        }
    }

    /// Read a named field as a string slice.
    pub fn field_str(&self, name: &str) -> Option<&str> {
        self.field(name).and_then(|v| v.as_str())
    }

    /// Read a named field as an f64.
    pub fn field_f64(&self, name: &str) -> Option<f64> {
        self.field(name).and_then(|v| v.as_f64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn field_access_on_object_payload() {
        let rec = Record::new(json!({"text": "hello", "score": 0.5}));
        assert_eq!(rec.field_str("text"), Some("hello"));
        assert_eq!(rec.field_f64("score"), Some(0.5));
        assert!(rec.field("missing").is_none());
    }

    #[test]
    fn set_field_promotes_scalar_payload() {
        let mut rec = Record::new(json!("just text"));
        rec.set_field("lang", json!("en"));
        assert_eq!(rec.field_str("lang"), Some("en"));
        assert_eq!(rec.field_str("value"), Some("just text"));
    }

    #[test]
    fn id_survives_serde_roundtrip() {
        let rec = Record::new(json!({"k": 1}));
        let encoded = serde_json::to_string(&rec).unwrap();
        let decoded: Record = serde_json::from_str(&encoded).unwrap();
        assert_eq!(rec.id, decoded.id);
    }
}
