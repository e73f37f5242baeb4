use indexmap::IndexMap;
use serde_json::Map as JsonMap;
use serde_json::Value;

pub(crate) const REF_KEY: &str = "__ref";
pub(crate) const REF_LIST_KEY: &str = "__refs";

/// One stored field value. Reference semantics are explicit tags rather than
/// shape conventions, so every reader switches on the tag and every writer
/// constructs it deliberately.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordValue {
    /// String, number, boolean, or null.
    Scalar(Value),
    /// An embedded plain object, stored inline under its parent.
    Object(IndexMap<String, RecordValue>),
    /// A single reference to another record.
    Ref(String),
    /// An ordered list of references.
    RefList(Vec<String>),
    /// A positional list of any of the other variants.
    Array(Vec<RecordValue>),
}

impl RecordValue {
    pub fn null() -> Self {
        Self::Scalar(Value::Null)
    }

    pub fn string(value: impl Into<String>) -> Self {
        Self::Scalar(Value::String(value.into()))
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Scalar(Value::String(s)) => Some(s),
            _ => None,
        }
    }

    pub fn as_ref_id(&self) -> Option<&str> {
        match self {
            Self::Ref(id) => Some(id),
            _ => None,
        }
    }

    pub fn as_ref_list(&self) -> Option<&[String]> {
        match self {
            Self::RefList(ids) => Some(ids),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Scalar(Value::Null))
    }

    /// The serialized form used by dehydration: refs become `{"__ref": id}`
    /// and ref lists `{"__refs": [ids]}`.
    pub fn to_json(&self) -> Value {
        match self {
            Self::Scalar(value) => value.clone(),
            Self::Object(fields) => {
                let mut map = JsonMap::new();
                for (key, value) in fields {
                    map.insert(key.clone(), value.to_json());
                }
                Value::Object(map)
            }
            Self::Ref(id) => {
                let mut map = JsonMap::new();
                map.insert(REF_KEY.to_owned(), Value::String(id.clone()));
                Value::Object(map)
            }
            Self::RefList(ids) => {
                let mut map = JsonMap::new();
                map.insert(
                    REF_LIST_KEY.to_owned(),
                    Value::Array(ids.iter().map(|id| Value::String(id.clone())).collect()),
                );
                Value::Object(map)
            }
            Self::Array(items) => Value::Array(items.iter().map(Self::to_json).collect()),
        }
    }

    /// Inverse of [`to_json`]: an object carrying exactly a `__ref` or
    /// `__refs` key is a reference marker, everything else is structural.
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Object(map) => {
                if map.len() == 1 {
                    if let Some(Value::String(id)) = map.get(REF_KEY) {
                        return Self::Ref(id.clone());
                    }
                    if let Some(Value::Array(ids)) = map.get(REF_LIST_KEY) {
                        let ids = ids
                            .iter()
                            .filter_map(|id| id.as_str().map(str::to_owned))
                            .collect();
                        return Self::RefList(ids);
                    }
                }
                let fields = map
                    .iter()
                    .map(|(key, value)| (key.clone(), Self::from_json(value)))
                    .collect();
                Self::Object(fields)
            }
            Value::Array(items) => Self::Array(items.iter().map(Self::from_json).collect()),
            scalar => Self::Scalar(scalar.clone()),
        }
    }
}

/// A partial snapshot handed to [`Record::apply`]. `None` removes the field.
pub type RecordPatch = IndexMap<String, Option<RecordValue>>;

/// One record snapshot: field key to stored value.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Record {
    fields: IndexMap<String, RecordValue>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, field: &str) -> Option<&RecordValue> {
        self.fields.get(field)
    }

    pub fn insert(&mut self, field: impl Into<String>, value: RecordValue) {
        self.fields.insert(field.into(), value);
    }

    pub fn contains(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    pub fn typename(&self) -> Option<&str> {
        self.get("__typename").and_then(RecordValue::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &RecordValue)> {
        self.fields.iter()
    }

    pub fn field_keys(&self) -> impl Iterator<Item = &String> {
        self.fields.keys()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Merge a partial snapshot over this one. Arrays and reference lists
    /// replace, scalars and refs overwrite, nested plain objects merge one
    /// level deep. A `None` value removes the field. Returns whether any
    /// field actually changed.
    pub fn apply(&mut self, patch: RecordPatch) -> bool {
        let mut changed = false;
        for (field, value) in patch {
            match value {
                None => {
                    changed |= self.fields.shift_remove(&field).is_some();
                }
                Some(incoming) => match (self.fields.get_mut(&field), incoming) {
                    (
                        Some(RecordValue::Object(existing)),
                        RecordValue::Object(incoming_fields),
                    ) => {
                        for (key, value) in incoming_fields {
                            if existing.get(&key) != Some(&value) {
                                existing.insert(key, value);
                                changed = true;
                            }
                        }
                    }
                    (Some(existing), incoming) => {
                        if *existing != incoming {
                            *existing = incoming;
                            changed = true;
                        }
                    }
                    (None, incoming) => {
                        self.fields.insert(field, incoming);
                        changed = true;
                    }
                },
            }
        }
        changed
    }

    pub fn to_json(&self) -> Value {
        let mut map = JsonMap::new();
        for (key, value) in &self.fields {
            map.insert(key.clone(), value.to_json());
        }
        Value::Object(map)
    }

    pub fn from_json(value: &Value) -> Option<Self> {
        let map = value.as_object()?;
        let mut record = Self::new();
        for (key, value) in map {
            record.insert(key.clone(), RecordValue::from_json(value));
        }
        Some(record)
    }
}
