//! Human rendering of script values for debugger output.
//!
//! Scalars print with a type tag. Containers are tried as an ordered
//! sequence and as a keyed mapping in parallel: when the keys form
//! `1,2,3,…` in encounter order, the sequence form is emitted. Recursion
//! depth is bounded.

use ember_core::ReplyValue;

/// Maximum container nesting rendered before cutting off.
pub const MAX_RENDER_DEPTH: usize = 7;

/// A language-neutral value tree engines hand to the debugger.
#[derive(Debug, Clone, PartialEq)]
pub enum DebugValue {
    /// Absent value.
    Nil,
    /// Boolean.
    Bool(bool),
    /// Integer.
    Int(i64),
    /// Floating point number.
    Num(f64),
    /// String.
    Str(String),
    /// Container of key/value pairs in encounter order.
    Table(Vec<(DebugValue, DebugValue)>),
    /// Anything else, pre-rendered by the engine.
    Opaque {
        /// Type tag, e.g. `function`.
        type_tag: String,
        /// Engine-rendered representation.
        repr: String,
    },
}

/// Renders a value for the debugger log.
pub fn render(value: &DebugValue) -> String {
    let mut out = String::new();
    render_into(value, &mut out, 0);
    out
}

fn render_into(value: &DebugValue, out: &mut String, depth: usize) {
    match value {
        DebugValue::Nil => out.push_str("(nil)"),
        DebugValue::Bool(b) => out.push_str(if *b { "(bool) true" } else { "(bool) false" }),
        DebugValue::Int(n) => out.push_str(&format!("(integer) {n}")),
        DebugValue::Num(n) => out.push_str(&format!("(number) {n}")),
        DebugValue::Str(s) => {
            out.push('"');
            for ch in s.chars() {
                match ch {
                    '"' => out.push_str("\\\""),
                    '\\' => out.push_str("\\\\"),
                    other => out.push(other),
                }
            }
            out.push('"');
        }
        DebugValue::Table(pairs) => {
            if depth >= MAX_RENDER_DEPTH {
                out.push_str("{...}");
                return;
            }
            let sequential = pairs
                .iter()
                .enumerate()
                .all(|(i, (key, _))| *key == DebugValue::Int(i as i64 + 1));
            out.push('{');
            for (i, (key, val)) in pairs.iter().enumerate() {
                if i > 0 {
                    out.push_str("; ");
                }
                if !sequential {
                    render_into(key, out, depth + 1);
                    out.push('=');
                }
                render_into(val, out, depth + 1);
            }
            out.push('}');
        }
        DebugValue::Opaque { type_tag, repr } => {
            out.push_str(&format!("({type_tag}) {repr}"));
        }
    }
}

impl From<&ReplyValue> for DebugValue {
    fn from(reply: &ReplyValue) -> Self {
        match reply {
            ReplyValue::Null => DebugValue::Nil,
            ReplyValue::Integer(n) => DebugValue::Int(*n),
            ReplyValue::Simple(s) => DebugValue::Opaque {
                type_tag: "status".to_string(),
                repr: s.clone(),
            },
            ReplyValue::Bulk(data) => DebugValue::Str(String::from_utf8_lossy(data).into_owned()),
            ReplyValue::Error(message) => DebugValue::Opaque {
                type_tag: "error".to_string(),
                repr: message.clone(),
            },
            ReplyValue::Array(items) => DebugValue::Table(
                items
                    .iter()
                    .enumerate()
                    .map(|(i, item)| (DebugValue::Int(i as i64 + 1), DebugValue::from(item)))
                    .collect(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_rendering() {
        assert_eq!(render(&DebugValue::Nil), "(nil)");
        assert_eq!(render(&DebugValue::Int(42)), "(integer) 42");
        assert_eq!(render(&DebugValue::Str("a\"b".to_string())), "\"a\\\"b\"");
    }

    #[test]
    fn test_sequence_rendering_when_keys_are_ordinal() {
        let table = DebugValue::Table(vec![
            (DebugValue::Int(1), DebugValue::Int(10)),
            (DebugValue::Int(2), DebugValue::Int(20)),
        ]);
        assert_eq!(render(&table), "{(integer) 10; (integer) 20}");
    }

    #[test]
    fn test_mapping_rendering_otherwise() {
        let table = DebugValue::Table(vec![
            (DebugValue::Str("a".to_string()), DebugValue::Int(1)),
            (DebugValue::Int(2), DebugValue::Int(2)),
        ]);
        assert_eq!(render(&table), "{\"a\"=(integer) 1; (integer) 2=(integer) 2}");
    }

    #[test]
    fn test_out_of_order_ordinals_render_as_mapping() {
        let table = DebugValue::Table(vec![
            (DebugValue::Int(2), DebugValue::Int(20)),
            (DebugValue::Int(1), DebugValue::Int(10)),
        ]);
        assert!(render(&table).contains('='));
    }

    #[test]
    fn test_depth_is_bounded() {
        let mut value = DebugValue::Table(vec![]);
        for _ in 0..(MAX_RENDER_DEPTH + 3) {
            value = DebugValue::Table(vec![(DebugValue::Int(1), value)]);
        }
        let rendered = render(&value);
        assert!(rendered.contains("{...}"));
    }

    #[test]
    fn test_reply_conversion() {
        let reply = ReplyValue::Array(vec![ReplyValue::Integer(1), ReplyValue::bulk("x")]);
        let value = DebugValue::from(&reply);
        assert_eq!(render(&value), "{(integer) 1; \"x\"}");
    }
}
