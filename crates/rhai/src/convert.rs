//! Value conversions between rhai and the server.
//!
//! Reply conversion follows the established script-conversion rules of
//! the EVAL command family: integers stay integers, floats truncate,
//! strings become bulk replies, `true` becomes 1 and `false`/unit become
//! null, and maps with an `ok`/`err` field select status and error
//! replies.

use ember_core::ReplyValue;
use ember_scripting::debugger::printer::DebugValue;
use rhai::{Array, Dynamic, Map};

/// Converts a script return value into a reply.
pub fn dynamic_to_reply(value: &Dynamic) -> ReplyValue {
    if value.is_unit() {
        return ReplyValue::Null;
    }
    if let Ok(flag) = value.as_bool() {
        return if flag {
            ReplyValue::Integer(1)
        } else {
            ReplyValue::Null
        };
    }
    if let Ok(n) = value.as_int() {
        return ReplyValue::Integer(n);
    }
    if let Ok(f) = value.as_float() {
        return ReplyValue::Integer(f as i64);
    }
    if let Ok(ch) = value.as_char() {
        return ReplyValue::bulk(ch.to_string());
    }
    if value.is_string() {
        let text = value.clone().into_string().unwrap_or_default();
        return ReplyValue::Bulk(text.into_bytes());
    }
    if value.is_array() {
        let items = value.clone().into_array().unwrap_or_default();
        return ReplyValue::Array(items.iter().map(dynamic_to_reply).collect());
    }
    if value.is_map() {
        if let Some(map) = value.read_lock::<Map>() {
            if let Some(ok) = map.get("ok") {
                return ReplyValue::Simple(ok.to_string());
            }
            if let Some(err) = map.get("err") {
                return ReplyValue::Error(err.to_string());
            }
        }
        return ReplyValue::Null;
    }
    ReplyValue::Null
}

/// Converts a command reply into the value scripts observe.
pub fn reply_to_dynamic(reply: &ReplyValue) -> Dynamic {
    match reply {
        ReplyValue::Null => Dynamic::from(false),
        ReplyValue::Integer(n) => Dynamic::from(*n),
        ReplyValue::Simple(s) => {
            let mut map = Map::new();
            map.insert("ok".into(), Dynamic::from(s.clone()));
            Dynamic::from_map(map)
        }
        ReplyValue::Bulk(data) => Dynamic::from(String::from_utf8_lossy(data).into_owned()),
        ReplyValue::Array(items) => {
            let array: Array = items.iter().map(reply_to_dynamic).collect();
            Dynamic::from_array(array)
        }
        ReplyValue::Error(message) => {
            let mut map = Map::new();
            map.insert("err".into(), Dynamic::from(message.clone()));
            Dynamic::from_map(map)
        }
    }
}

/// Renders a script value for the debugger.
pub fn dynamic_to_debug(value: &Dynamic) -> DebugValue {
    if value.is_unit() {
        return DebugValue::Nil;
    }
    if let Ok(flag) = value.as_bool() {
        return DebugValue::Bool(flag);
    }
    if let Ok(n) = value.as_int() {
        return DebugValue::Int(n);
    }
    if let Ok(f) = value.as_float() {
        return DebugValue::Num(f);
    }
    if let Ok(ch) = value.as_char() {
        return DebugValue::Str(ch.to_string());
    }
    if value.is_string() {
        return DebugValue::Str(value.clone().into_string().unwrap_or_default());
    }
    if value.is_array() {
        let items = value.clone().into_array().unwrap_or_default();
        return DebugValue::Table(
            items
                .iter()
                .enumerate()
                .map(|(i, item)| (DebugValue::Int(i as i64 + 1), dynamic_to_debug(item)))
                .collect(),
        );
    }
    if value.is_map() {
        if let Some(map) = value.read_lock::<Map>() {
            return DebugValue::Table(
                map.iter()
                    .map(|(key, val)| {
                        (DebugValue::Str(key.to_string()), dynamic_to_debug(val))
                    })
                    .collect(),
            );
        }
    }
    DebugValue::Opaque {
        type_tag: value.type_name().to_string(),
        repr: value.to_string(),
    }
}

/// Converts one script-provided command argument to bytes.
pub fn dynamic_to_cmd_arg(value: &Dynamic) -> Result<Vec<u8>, String> {
    if value.is_string() {
        return Ok(value
            .clone()
            .into_string()
            .unwrap_or_default()
            .into_bytes());
    }
    if let Ok(n) = value.as_int() {
        return Ok(n.to_string().into_bytes());
    }
    if let Ok(f) = value.as_float() {
        return Ok(f.to_string().into_bytes());
    }
    Err(format!(
        "command arguments must be strings or numbers, got {}",
        value.type_name()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_reply_conversion() {
        assert_eq!(dynamic_to_reply(&Dynamic::UNIT), ReplyValue::Null);
        assert_eq!(dynamic_to_reply(&Dynamic::from(true)), ReplyValue::Integer(1));
        assert_eq!(dynamic_to_reply(&Dynamic::from(false)), ReplyValue::Null);
        assert_eq!(dynamic_to_reply(&Dynamic::from(7_i64)), ReplyValue::Integer(7));
        assert_eq!(
            dynamic_to_reply(&Dynamic::from(3.9_f64)),
            ReplyValue::Integer(3)
        );
        assert_eq!(
            dynamic_to_reply(&Dynamic::from("ok".to_string())),
            ReplyValue::bulk("ok")
        );
    }

    #[test]
    fn test_status_and_error_maps() {
        let mut map = Map::new();
        map.insert("ok".into(), Dynamic::from("FINE".to_string()));
        assert_eq!(
            dynamic_to_reply(&Dynamic::from_map(map)),
            ReplyValue::Simple("FINE".to_string())
        );

        let mut map = Map::new();
        map.insert("err".into(), Dynamic::from("broken".to_string()));
        assert_eq!(
            dynamic_to_reply(&Dynamic::from_map(map)),
            ReplyValue::Error("broken".to_string())
        );
    }

    #[test]
    fn test_array_round_trip() {
        let reply = ReplyValue::Array(vec![ReplyValue::Integer(1), ReplyValue::bulk("x")]);
        let dynamic = reply_to_dynamic(&reply);
        assert_eq!(dynamic_to_reply(&dynamic), reply);
    }

    #[test]
    fn test_null_reply_becomes_false() {
        let dynamic = reply_to_dynamic(&ReplyValue::Null);
        assert_eq!(dynamic.as_bool(), Ok(false));
    }

    #[test]
    fn test_debug_rendering_of_containers() {
        let array: Array = vec![Dynamic::from(1_i64), Dynamic::from("a".to_string())];
        let value = dynamic_to_debug(&Dynamic::from_array(array));
        let DebugValue::Table(pairs) = value else {
            panic!("expected table");
        };
        assert_eq!(pairs[0].0, DebugValue::Int(1));
        assert_eq!(pairs[1].1, DebugValue::Str("a".to_string()));
    }

    #[test]
    fn test_cmd_arg_conversion() {
        assert_eq!(
            dynamic_to_cmd_arg(&Dynamic::from("SET".to_string())).unwrap(),
            b"SET".to_vec()
        );
        assert_eq!(dynamic_to_cmd_arg(&Dynamic::from(5_i64)).unwrap(), b"5".to_vec());
        assert!(dynamic_to_cmd_arg(&Dynamic::UNIT).is_err());
    }
}
