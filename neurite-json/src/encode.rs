use serde_json::Value;

/// Encode a value in the compact wire form.
pub fn encode(value: &Value) -> String {
    let mut out = String::new();
    write_value(&mut out, value, Mode::Compact, 0);
    out
}

/// Encode a value with a newline and two-space indent per nesting level.
pub fn encode_pretty(value: &Value) -> String {
    let mut out = String::new();
    write_value(&mut out, value, Mode::Pretty, 0);
    out
}

/// Encode a value in canonical form: compact, with object keys sorted
/// lexicographically at every level. Endpoints that compute signatures over
/// JSON must use this form.
pub fn encode_canonical(value: &Value) -> String {
    let mut out = String::new();
    write_value(&mut out, value, Mode::Canonical, 0);
    out
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mode {
    Compact,
    Pretty,
    Canonical,
}

fn write_indent(out: &mut String, level: usize) {
    out.push('\n');
    for _ in 0..level {
        out.push_str("  ");
    }
}

fn write_value(out: &mut String, value: &Value, mode: Mode, level: usize) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(true) => out.push_str("true"),
        Value::Bool(false) => out.push_str("false"),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => write_string(out, s),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                if mode == Mode::Pretty {
                    write_indent(out, level + 1);
                }
                write_value(out, item, mode, level + 1);
            }
            if mode == Mode::Pretty && !items.is_empty() {
                write_indent(out, level);
            }
            out.push(']');
        }
        Value::Object(map) => {
            out.push('{');

            let mut keys: Vec<&String> = map.keys().collect();
            if mode == Mode::Canonical {
                keys.sort();
            }

            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                if mode == Mode::Pretty {
                    write_indent(out, level + 1);
                }
                write_string(out, key);
                out.push(':');
                if mode == Mode::Pretty {
                    out.push(' ');
                }
                write_value(out, &map[key.as_str()], mode, level + 1);
            }
            if mode == Mode::Pretty && !map.is_empty() {
                write_indent(out, level);
            }
            out.push('}');
        }
    }
}

fn write_string(out: &mut String, s: &str) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\u{0008}' => out.push_str("\\b"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\u{000C}' => out.push_str("\\f"),
            '\r' => out.push_str("\\r"),
            c if (c as u32) < 0x20 => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out.push('"');
}
