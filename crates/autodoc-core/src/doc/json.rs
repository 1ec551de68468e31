//! Bridge between Automerge objects and `serde_json` values.
//!
//! Reading hydrates any object into plain JSON (text objects become strings,
//! counters and timestamps become integers, bytes become base64). Writing
//! maps JSON objects to maps, arrays to lists and strings to string scalars.

use automerge::transaction::Transactable;
use automerge::{AutoCommit, ObjId, ObjType, ReadDoc, ScalarValue, Value};
use base64::Engine;
use serde_json::{Map, Number, Value as Json};

use crate::error::SyncError;

/// Hydrate the object `obj` into JSON.
pub fn to_json<R: ReadDoc>(doc: &R, obj: &ObjId) -> Result<Json, SyncError> {
    match doc.object_type(obj)? {
        ObjType::Map | ObjType::Table => {
            let mut out = Map::new();
            for key in doc.keys(obj) {
                if let Some((value, id)) = doc.get(obj, key.as_str())? {
                    out.insert(key, value_to_json(doc, value, &id)?);
                }
            }
            Ok(Json::Object(out))
        }
        ObjType::List => {
            let len = doc.length(obj);
            let mut out = Vec::with_capacity(len);
            for index in 0..len {
                if let Some((value, id)) = doc.get(obj, index)? {
                    out.push(value_to_json(doc, value, &id)?);
                }
            }
            Ok(Json::Array(out))
        }
        ObjType::Text => Ok(Json::String(doc.text(obj)?)),
    }
}

fn value_to_json<R: ReadDoc>(doc: &R, value: Value<'_>, id: &ObjId) -> Result<Json, SyncError> {
    match value {
        Value::Object(_) => to_json(doc, id),
        Value::Scalar(scalar) => Ok(scalar_to_json(&scalar)),
    }
}

fn scalar_to_json(scalar: &ScalarValue) -> Json {
    match scalar {
        ScalarValue::Null => Json::Null,
        ScalarValue::Boolean(b) => Json::Bool(*b),
        ScalarValue::Str(s) => Json::String(s.to_string()),
        ScalarValue::Int(n) => Json::from(*n),
        ScalarValue::Uint(n) => Json::from(*n),
        ScalarValue::F64(f) => Number::from_f64(*f).map_or(Json::Null, Json::Number),
        ScalarValue::Bytes(bytes) => {
            Json::String(base64::engine::general_purpose::STANDARD.encode(bytes))
        }
        other => other.to_i64().map_or(Json::Null, Json::from),
    }
}

enum Slot<'a> {
    Key(&'a str),
    Index(usize),
}

/// Write `value` under `key` of the map `obj`, replacing what was there.
pub fn put_json(doc: &mut AutoCommit, obj: &ObjId, key: &str, value: &Json) -> Result<(), SyncError> {
    write(doc, obj, Slot::Key(key), value)
}

/// Insert `value` at `index` of the list `obj`.
pub fn insert_json(
    doc: &mut AutoCommit,
    obj: &ObjId,
    index: usize,
    value: &Json,
) -> Result<(), SyncError> {
    write(doc, obj, Slot::Index(index), value)
}

/// Append `value` to the end of the list `obj`.
pub fn push_json(doc: &mut AutoCommit, obj: &ObjId, value: &Json) -> Result<(), SyncError> {
    let len = doc.length(obj);
    insert_json(doc, obj, len, value)
}

/// Id of the object stored at `key` of map `obj`, creating it with `kind` if absent.
pub fn ensure_object(
    doc: &mut AutoCommit,
    obj: &ObjId,
    key: &str,
    kind: ObjType,
) -> Result<ObjId, SyncError> {
    if let Some((Value::Object(existing), id)) = doc.get(obj, key)? {
        if existing == kind {
            return Ok(id);
        }
    }
    Ok(doc.put_object(obj, key, kind)?)
}

fn write(doc: &mut AutoCommit, obj: &ObjId, slot: Slot<'_>, value: &Json) -> Result<(), SyncError> {
    let kind = match value {
        Json::Object(_) => Some(ObjType::Map),
        Json::Array(_) => Some(ObjType::List),
        _ => None,
    };

    if let Some(kind) = kind {
        let child = match slot {
            Slot::Key(key) => doc.put_object(obj, key, kind)?,
            Slot::Index(index) => doc.insert_object(obj, index, kind)?,
        };
        match value {
            Json::Object(map) => {
                for (key, item) in map {
                    write(doc, &child, Slot::Key(key), item)?;
                }
            }
            Json::Array(items) => {
                for (index, item) in items.iter().enumerate() {
                    write(doc, &child, Slot::Index(index), item)?;
                }
            }
            _ => {}
        }
        return Ok(());
    }

    let scalar = json_to_scalar(value)?;
    match slot {
        Slot::Key(key) => doc.put(obj, key, scalar)?,
        Slot::Index(index) => doc.insert(obj, index, scalar)?,
    }
    Ok(())
}

fn json_to_scalar(value: &Json) -> Result<ScalarValue, SyncError> {
    Ok(match value {
        Json::Null => ScalarValue::Null,
        Json::Bool(b) => ScalarValue::Boolean(*b),
        Json::String(s) => ScalarValue::Str(s.as_str().into()),
        Json::Number(n) => {
            if let Some(i) = n.as_i64() {
                ScalarValue::Int(i)
            } else if let Some(u) = n.as_u64() {
                ScalarValue::Uint(u)
            } else if let Some(f) = n.as_f64() {
                ScalarValue::F64(f)
            } else {
                return Err(SyncError::Serialization(format!("unsupported number {n}")));
            }
        }
        Json::Object(_) | Json::Array(_) => {
            return Err(SyncError::Serialization("expected a scalar".to_string()))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use automerge::ROOT;
    use serde_json::json;

    #[test]
    fn test_write_then_hydrate_nested() {
        let mut doc = AutoCommit::new();
        let value = json!({
            "name": "general",
            "count": 3,
            "ratio": 0.5,
            "muted": false,
            "topic": null,
            "tags": ["a", "b"],
            "meta": { "owner": "did:plc:alice", "pins": [1, 2] }
        });
        for (key, item) in value.as_object().unwrap() {
            put_json(&mut doc, &ROOT, key, item).unwrap();
        }

        assert_eq!(to_json(&doc, &ROOT).unwrap(), value);
    }

    #[test]
    fn test_push_appends() {
        let mut doc = AutoCommit::new();
        let list = ensure_object(&mut doc, &ROOT, "messages", ObjType::List).unwrap();
        push_json(&mut doc, &list, &json!("first")).unwrap();
        push_json(&mut doc, &list, &json!({ "body": "second" })).unwrap();

        assert_eq!(
            to_json(&doc, &ROOT).unwrap(),
            json!({ "messages": ["first", { "body": "second" }] })
        );
    }

    #[test]
    fn test_ensure_object_reuses_existing() {
        let mut doc = AutoCommit::new();
        let first = ensure_object(&mut doc, &ROOT, "dms", ObjType::Map).unwrap();
        let second = ensure_object(&mut doc, &ROOT, "dms", ObjType::Map).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_text_and_bytes_hydrate() {
        let mut doc = AutoCommit::new();
        let text = doc.put_object(&ROOT, "draft", ObjType::Text).unwrap();
        doc.splice_text(&text, 0, 0, "hello").unwrap();
        doc.put(&ROOT, "blob", ScalarValue::Bytes(vec![1, 2, 3])).unwrap();

        let json = to_json(&doc, &ROOT).unwrap();
        assert_eq!(json["draft"], "hello");
        assert_eq!(json["blob"], "AQID");
    }

    #[test]
    fn test_counter_hydrates_as_integer() {
        let mut doc = AutoCommit::new();
        doc.put(&ROOT, "unread", ScalarValue::counter(2)).unwrap();
        doc.increment(&ROOT, "unread", 3).unwrap();
        assert_eq!(to_json(&doc, &ROOT).unwrap()["unread"], 5);
    }
}
