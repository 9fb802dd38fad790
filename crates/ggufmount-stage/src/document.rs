//! Staged JSON documents.
//!
//! Each document is a JSON object mapping a metadata key to its typed value:
//!
//! ```json
//! {
//!   "general.name": { "type": "string", "value": "tiny" },
//!   "tokenizer.ggml.scores": { "type": "array", "element_type": "f32", "value": [0.0, -1.5] }
//! }
//! ```
//!
//! Nested arrays store each inner array as `{"element_type": .., "value": [..]}`.
//! Non-finite floats are written as the strings `"NaN"`, `"inf"` and `"-inf"`.
//! Key order is preserved in both directions, and a hand-edited file that
//! repeats a key keeps both entries so validation can report it.

use std::fmt;
use std::fs;
use std::io::Write;
use std::path::Path;

use ggufmount_codec::{MetadataValue, ValueType};
use serde::de::{self, MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Number, Value, json};

use crate::error::DocumentError;

/// An ordered list of typed metadata entries.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Document {
    entries: Vec<(String, MetadataValue)>,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: Vec<(String, MetadataValue)>) -> Self {
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[(String, MetadataValue)] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<(String, MetadataValue)> {
        self.entries
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn get(&self, key: &str) -> Option<&MetadataValue> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut MetadataValue> {
        self.entries.iter_mut().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Replace the value of `key` in place, or append it. Returns the old value.
    pub fn insert(&mut self, key: impl Into<String>, value: MetadataValue) -> Option<MetadataValue> {
        let key = key.into();
        match self.get_mut(&key) {
            Some(slot) => Some(std::mem::replace(slot, value)),
            None => {
                self.entries.push((key, value));
                None
            }
        }
    }

    /// Remove every entry named `key`, returning the first value removed.
    pub fn remove(&mut self, key: &str) -> Option<MetadataValue> {
        let mut first = None;
        let mut kept = Vec::with_capacity(self.entries.len());
        for (k, v) in self.entries.drain(..) {
            if k == key {
                first.get_or_insert(v);
            } else {
                kept.push((k, v));
            }
        }
        self.entries = kept;
        first
    }

    pub fn retain(&mut self, mut keep: impl FnMut(&str, &MetadataValue) -> bool) {
        self.entries.retain(|(k, v)| keep(k, v));
    }

    /// Keys that appear more than once, in first-seen order.
    pub fn duplicate_keys(&self) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        let mut dups = Vec::new();
        for (k, _) in &self.entries {
            if !seen.insert(k.as_str()) && !dups.contains(k) {
                dups.push(k.clone());
            }
        }
        dups
    }

    /// Read a document from disk.
    pub fn load(path: &Path) -> Result<Self, DocumentError> {
        let text = fs::read_to_string(path).map_err(|e| DocumentError::io(path, e))?;
        serde_json::from_str(&text).map_err(|e| DocumentError::json(path, e))
    }

    /// Write the document atomically (temp file in the same directory, then rename).
    pub fn store(&self, path: &Path) -> Result<(), DocumentError> {
        write_json_atomic(path, self)
    }
}

/// Serialize `value` as pretty JSON and atomically replace `path` with it.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), DocumentError> {
    let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
    fs::create_dir_all(dir).map_err(|e| DocumentError::io(dir, e))?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| DocumentError::io(dir, e))?;
    serde_json::to_writer_pretty(&mut tmp, value).map_err(|e| DocumentError::json(path, e))?;
    tmp.write_all(b"\n").map_err(|e| DocumentError::io(path, e))?;
    tmp.as_file().sync_all().map_err(|e| DocumentError::io(path, e))?;
    tmp.persist(path).map_err(|e| DocumentError::io(path, e.error))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Typed JSON encoding
// ---------------------------------------------------------------------------

fn float_json(v: f64) -> Value {
    match Number::from_f64(v) {
        Some(n) => Value::Number(n),
        None if v.is_nan() => Value::from("NaN"),
        None if v > 0.0 => Value::from("inf"),
        None => Value::from("-inf"),
    }
}

fn array_body(items: &[MetadataValue]) -> Vec<Value> {
    items
        .iter()
        .map(|item| match item {
            MetadataValue::Array(elem, inner) => json!({
                "element_type": elem.name(),
                "value": array_body(inner),
            }),
            other => bare_json(other),
        })
        .collect()
}

fn bare_json(value: &MetadataValue) -> Value {
    match value {
        MetadataValue::U8(v) => Value::from(*v),
        MetadataValue::I8(v) => Value::from(*v),
        MetadataValue::U16(v) => Value::from(*v),
        MetadataValue::I16(v) => Value::from(*v),
        MetadataValue::U32(v) => Value::from(*v),
        MetadataValue::I32(v) => Value::from(*v),
        MetadataValue::U64(v) => Value::from(*v),
        MetadataValue::I64(v) => Value::from(*v),
        MetadataValue::F32(v) => float_json(f64::from(*v)),
        MetadataValue::F64(v) => float_json(*v),
        MetadataValue::Bool(v) => Value::from(*v),
        MetadataValue::String(s) => Value::from(s.as_str()),
        MetadataValue::Array(_, items) => Value::Array(array_body(items)),
    }
}

/// Typed JSON form of one value: `{"type": .., "value": ..}`.
pub fn value_to_json(value: &MetadataValue) -> Value {
    let mut obj = Map::new();
    obj.insert("type".into(), Value::from(value.value_type().name()));
    if let MetadataValue::Array(elem, _) = value {
        obj.insert("element_type".into(), Value::from(elem.name()));
    }
    obj.insert("value".into(), bare_json(value));
    Value::Object(obj)
}

fn type_field(obj: &Map<String, Value>, field: &str) -> Result<ValueType, String> {
    let name = obj
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| format!("missing \"{field}\""))?;
    ValueType::from_name(name).ok_or_else(|| format!("unknown type \"{name}\""))
}

fn float_from_json(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => match s.as_str() {
            "NaN" | "nan" => Some(f64::NAN),
            "inf" | "+inf" | "Infinity" => Some(f64::INFINITY),
            "-inf" | "-Infinity" => Some(f64::NEG_INFINITY),
            _ => None,
        },
        _ => None,
    }
}

fn scalar_from_json(ty: ValueType, v: &Value) -> Result<MetadataValue, String> {
    let mismatch = || format!("value {v} does not fit type {ty}");
    let signed = || v.as_i64().ok_or_else(mismatch);
    let unsigned = || v.as_u64().ok_or_else(mismatch);
    Ok(match ty {
        ValueType::U8 => MetadataValue::U8(u8::try_from(unsigned()?).map_err(|_| mismatch())?),
        ValueType::I8 => MetadataValue::I8(i8::try_from(signed()?).map_err(|_| mismatch())?),
        ValueType::U16 => MetadataValue::U16(u16::try_from(unsigned()?).map_err(|_| mismatch())?),
        ValueType::I16 => MetadataValue::I16(i16::try_from(signed()?).map_err(|_| mismatch())?),
        ValueType::U32 => MetadataValue::U32(u32::try_from(unsigned()?).map_err(|_| mismatch())?),
        ValueType::I32 => MetadataValue::I32(i32::try_from(signed()?).map_err(|_| mismatch())?),
        ValueType::U64 => MetadataValue::U64(unsigned()?),
        ValueType::I64 => MetadataValue::I64(signed()?),
        ValueType::F32 => MetadataValue::F32(float_from_json(v).ok_or_else(mismatch)? as f32),
        ValueType::F64 => MetadataValue::F64(float_from_json(v).ok_or_else(mismatch)?),
        ValueType::Bool => MetadataValue::Bool(v.as_bool().ok_or_else(mismatch)?),
        ValueType::String => MetadataValue::String(v.as_str().ok_or_else(mismatch)?.to_owned()),
        ValueType::Array => return Err("array used where a scalar was expected".into()),
    })
}

fn array_from_json(elem: ValueType, v: &Value) -> Result<MetadataValue, String> {
    let items = v.as_array().ok_or_else(|| format!("expected a JSON array of {elem}"))?;
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        out.push(if elem == ValueType::Array {
            let obj = item.as_object().ok_or("nested array must be an object")?;
            let inner = type_field(obj, "element_type")?;
            array_from_json(inner, obj.get("value").unwrap_or(&Value::Null))?
        } else {
            scalar_from_json(elem, item)?
        });
    }
    Ok(MetadataValue::Array(elem, out))
}

/// Decode the typed JSON form produced by [`value_to_json`].
pub fn value_from_json(v: &Value) -> Result<MetadataValue, String> {
    let obj = v.as_object().ok_or("expected {\"type\": .., \"value\": ..}")?;
    let ty = type_field(obj, "type")?;
    let body = obj.get("value").ok_or("missing \"value\"")?;
    if ty == ValueType::Array {
        array_from_json(type_field(obj, "element_type")?, body)
    } else {
        scalar_from_json(ty, body)
    }
}

impl Serialize for Document {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (k, v) in &self.entries {
            map.serialize_entry(k, &value_to_json(v))?;
        }
        map.end()
    }
}

struct DocumentVisitor;

impl<'de> Visitor<'de> for DocumentVisitor {
    type Value = Document;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a map of metadata keys to typed values")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Document, A::Error> {
        let mut entries = Vec::with_capacity(map.size_hint().unwrap_or(0));
        while let Some((key, raw)) = map.next_entry::<String, Value>()? {
            let value =
                value_from_json(&raw).map_err(|e| de::Error::custom(format!("key \"{key}\": {e}")))?;
            entries.push((key, value));
        }
        Ok(Document { entries })
    }
}

impl<'de> Deserialize<'de> for Document {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_map(DocumentVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_json_shape() {
        let v = MetadataValue::Array(ValueType::U32, vec![MetadataValue::U32(1)]);
        assert_eq!(
            value_to_json(&v),
            json!({"type": "array", "element_type": "u32", "value": [1]})
        );
        assert_eq!(value_to_json(&MetadataValue::Bool(true)), json!({"type": "bool", "value": true}));
    }

    #[test]
    fn non_finite_floats_use_strings() {
        let v = value_to_json(&MetadataValue::F32(f32::NEG_INFINITY));
        assert_eq!(v, json!({"type": "f32", "value": "-inf"}));
        let back = value_from_json(&v).unwrap();
        assert_eq!(back, MetadataValue::F32(f32::NEG_INFINITY));

        let nan = value_from_json(&json!({"type": "f64", "value": "NaN"})).unwrap();
        assert!(matches!(nan, MetadataValue::F64(x) if x.is_nan()));
    }

    #[test]
    fn nested_arrays_round_trip() {
        let v = MetadataValue::Array(
            ValueType::Array,
            vec![
                MetadataValue::Array(ValueType::String, vec![MetadataValue::String("a".into())]),
                MetadataValue::Array(ValueType::I8, vec![]),
            ],
        );
        assert_eq!(value_from_json(&value_to_json(&v)).unwrap(), v);
    }

    #[test]
    fn out_of_range_integers_are_rejected() {
        assert!(value_from_json(&json!({"type": "u8", "value": 256})).is_err());
        assert!(value_from_json(&json!({"type": "i8", "value": -129})).is_err());
        assert!(value_from_json(&json!({"type": "u32", "value": "7"})).is_err());
        assert!(value_from_json(&json!({"type": "float", "value": 1.0})).is_err());
    }

    #[test]
    fn document_preserves_order_and_duplicates() {
        let text = r#"{
            "b": {"type": "u8", "value": 1},
            "a": {"type": "string", "value": "x"},
            "b": {"type": "u8", "value": 2}
        }"#;
        let doc: Document = serde_json::from_str(text).unwrap();
        assert_eq!(doc.keys().collect::<Vec<_>>(), ["b", "a", "b"]);
        assert_eq!(doc.duplicate_keys(), ["b"]);
        assert_eq!(doc.get("b"), Some(&MetadataValue::U8(1)));
    }

    #[test]
    fn insert_replaces_in_place_and_remove_drops_all() {
        let mut doc = Document::new();
        doc.insert("x", MetadataValue::U8(1));
        doc.insert("y", MetadataValue::U8(2));
        assert_eq!(doc.insert("x", MetadataValue::U8(3)), Some(MetadataValue::U8(1)));
        assert_eq!(doc.keys().collect::<Vec<_>>(), ["x", "y"]);
        assert_eq!(doc.remove("x"), Some(MetadataValue::U8(3)));
        assert_eq!(doc.remove("x"), None);
        assert_eq!(doc.len(), 1);
    }

    #[test]
    fn store_and_load() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("sub/doc.json");
        let doc = Document::from_entries(vec![
            ("k".into(), MetadataValue::I64(-5)),
            ("s".into(), MetadataValue::string_array(["<|end|>", ""])),
        ]);
        doc.store(&path).unwrap();
        assert_eq!(Document::load(&path).unwrap(), doc);
    }

    #[test]
    fn load_reports_path_on_bad_json() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("bad.json");
        fs::write(&path, "{\"k\": {\"type\": \"u8\"}}").unwrap();
        let err = Document::load(&path).unwrap_err();
        assert!(matches!(err, DocumentError::Json { .. }));
        assert!(err.to_string().contains("bad.json"));
    }
}
