use serde_json::{Map, Number, Value};

/// Parse depth ceiling. Nesting past this is treated as malformed input
/// rather than a reason to exhaust the stack.
const MAX_DEPTH: usize = 128;

/// What went wrong while decoding, without the input offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonErrorKind {
    /// Input ended in the middle of a value.
    UnexpectedEof,

    /// A byte that no production allows at this position.
    UnexpectedByte(u8),

    /// A raw control byte (≤ 0x1F) appeared inside a string.
    ControlByte(u8),

    /// A backslash escape that is not one of the recognized forms.
    BadEscape,

    /// A `\u` escape in the surrogate range without a valid partner.
    BadSurrogate,

    /// Malformed number (no digits, overflow, or an exponent form).
    BadNumber,

    /// Non-whitespace bytes after the top-level value.
    TrailingData,

    /// Nesting exceeded the parser's depth ceiling.
    TooDeep,

    /// The top-level value was not an object where one was required.
    NotAnObject,

    /// The decoded bytes were not valid UTF-8.
    InvalidUtf8,
}

/// A decode failure with the byte offset it occurred at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsonError {
    pub kind: JsonErrorKind,
    pub offset: usize,
}

impl std::fmt::Display for JsonError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            JsonErrorKind::UnexpectedEof => write!(f, "unexpected end of input"),
            JsonErrorKind::UnexpectedByte(b) => {
                write!(f, "unexpected byte 0x{b:02x} at offset {}", self.offset)
            }
            JsonErrorKind::ControlByte(b) => {
                write!(f, "control byte 0x{b:02x} in string at offset {}", self.offset)
            }
            JsonErrorKind::BadEscape => write!(f, "invalid escape at offset {}", self.offset),
            JsonErrorKind::BadSurrogate => {
                write!(f, "invalid surrogate escape at offset {}", self.offset)
            }
            JsonErrorKind::BadNumber => write!(f, "invalid number at offset {}", self.offset),
            JsonErrorKind::TrailingData => {
                write!(f, "trailing data after value at offset {}", self.offset)
            }
            JsonErrorKind::TooDeep => write!(f, "nesting too deep at offset {}", self.offset),
            JsonErrorKind::NotAnObject => write!(f, "top-level value is not an object"),
            JsonErrorKind::InvalidUtf8 => {
                write!(f, "invalid UTF-8 in string at offset {}", self.offset)
            }
        }
    }
}

impl std::error::Error for JsonError {}

/// Decode a single JSON value from `input`.
///
/// Leading and trailing ASCII whitespace is permitted; any other trailing
/// bytes are an error.
pub fn decode(input: &[u8]) -> Result<Value, JsonError> {
    let mut p = Parser { input, pos: 0 };
    p.skip_whitespace();
    let value = p.parse_value(0)?;
    p.skip_whitespace();
    if p.pos != p.input.len() {
        return Err(p.err(JsonErrorKind::TrailingData));
    }
    Ok(value)
}

/// Decode a top-level JSON object, the shape every request body and every
/// stored record must have.
pub fn decode_object(input: &[u8]) -> Result<Map<String, Value>, JsonError> {
    match decode(input)? {
        Value::Object(map) => Ok(map),
        _ => Err(JsonError {
            kind: JsonErrorKind::NotAnObject,
            offset: 0,
        }),
    }
}

struct Parser<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn err(&self, kind: JsonErrorKind) -> JsonError {
        JsonError {
            kind,
            offset: self.pos,
        }
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.pos += 1;
        Some(b)
    }

    fn skip_whitespace(&mut self) {
        while let Some(b) = self.peek() {
            match b {
                b' ' | b'\t' | b'\n' | b'\r' => self.pos += 1,
                _ => break,
            }
        }
    }

    fn expect(&mut self, want: u8) -> Result<(), JsonError> {
        match self.bump() {
            Some(b) if b == want => Ok(()),
            Some(b) => {
                self.pos -= 1;
                Err(self.err(JsonErrorKind::UnexpectedByte(b)))
            }
            None => Err(self.err(JsonErrorKind::UnexpectedEof)),
        }
    }

    fn expect_literal(&mut self, lit: &[u8]) -> Result<(), JsonError> {
        for &want in lit {
            self.expect(want)?;
        }
        Ok(())
    }

    fn parse_value(&mut self, depth: usize) -> Result<Value, JsonError> {
        if depth > MAX_DEPTH {
            return Err(self.err(JsonErrorKind::TooDeep));
        }

        match self.peek() {
            Some(b'{') => self.parse_object(depth),
            Some(b'[') => self.parse_array(depth),
            Some(b'"') => Ok(Value::String(self.parse_string()?)),
            Some(b't') => {
                self.expect_literal(b"true")?;
                Ok(Value::Bool(true))
            }
            Some(b'f') => {
                self.expect_literal(b"false")?;
                Ok(Value::Bool(false))
            }
            Some(b'n') => {
                self.expect_literal(b"null")?;
                Ok(Value::Null)
            }
            Some(b'-') | Some(b'0'..=b'9') => self.parse_number(),
            Some(b) => Err(self.err(JsonErrorKind::UnexpectedByte(b))),
            None => Err(self.err(JsonErrorKind::UnexpectedEof)),
        }
    }

    fn parse_object(&mut self, depth: usize) -> Result<Value, JsonError> {
        self.expect(b'{')?;
        let mut map = Map::new();

        self.skip_whitespace();
        if self.peek() == Some(b'}') {
            self.pos += 1;
            return Ok(Value::Object(map));
        }

        loop {
            self.skip_whitespace();
            let key = self.parse_string()?;
            self.skip_whitespace();
            self.expect(b':')?;
            self.skip_whitespace();
            let value = self.parse_value(depth + 1)?;

            // Duplicate keys discard the earlier value.
            map.insert(key, value);

            self.skip_whitespace();
            match self.bump() {
                Some(b',') => continue,
                Some(b'}') => return Ok(Value::Object(map)),
                Some(b) => {
                    self.pos -= 1;
                    return Err(self.err(JsonErrorKind::UnexpectedByte(b)));
                }
                None => return Err(self.err(JsonErrorKind::UnexpectedEof)),
            }
        }
    }

    fn parse_array(&mut self, depth: usize) -> Result<Value, JsonError> {
        self.expect(b'[')?;
        let mut items = Vec::new();

        self.skip_whitespace();
        if self.peek() == Some(b']') {
            self.pos += 1;
            return Ok(Value::Array(items));
        }

        loop {
            self.skip_whitespace();
            items.push(self.parse_value(depth + 1)?);
            self.skip_whitespace();
            match self.bump() {
                Some(b',') => continue,
                Some(b']') => return Ok(Value::Array(items)),
                Some(b) => {
                    self.pos -= 1;
                    return Err(self.err(JsonErrorKind::UnexpectedByte(b)));
                }
                None => return Err(self.err(JsonErrorKind::UnexpectedEof)),
            }
        }
    }

    /// Read exactly four hex digits of a `\uXXXX` escape.
    fn parse_hex4(&mut self) -> Result<u32, JsonError> {
        let mut out: u32 = 0;
        for _ in 0..4 {
            let b = self.bump().ok_or_else(|| self.err(JsonErrorKind::UnexpectedEof))?;
            let digit = match b {
                b'0'..=b'9' => u32::from(b - b'0'),
                b'a'..=b'f' => u32::from(b - b'a') + 10,
                b'A'..=b'F' => u32::from(b - b'A') + 10,
                _ => {
                    self.pos -= 1;
                    return Err(self.err(JsonErrorKind::BadEscape));
                }
            };
            out = out << 4 | digit;
        }
        Ok(out)
    }

    fn parse_string(&mut self) -> Result<String, JsonError> {
        self.expect(b'"')?;
        let mut out = String::new();

        loop {
            let b = self.bump().ok_or_else(|| self.err(JsonErrorKind::UnexpectedEof))?;
            match b {
                b'"' => return Ok(out),
                b'\\' => {
                    let esc = self.bump().ok_or_else(|| self.err(JsonErrorKind::UnexpectedEof))?;
                    match esc {
                        b'"' => out.push('"'),
                        b'\\' => out.push('\\'),
                        b'/' => out.push('/'),
                        b'b' => out.push('\u{0008}'),
                        b't' => out.push('\t'),
                        b'n' => out.push('\n'),
                        b'f' => out.push('\u{000C}'),
                        b'r' => out.push('\r'),
                        b'u' => {
                            let hi = self.parse_hex4()?;
                            let scalar = if (0xD800..=0xDBFF).contains(&hi) {
                                // High surrogate: the low half must follow
                                // immediately as another \u escape.
                                if self.bump() != Some(b'\\') || self.bump() != Some(b'u') {
                                    return Err(self.err(JsonErrorKind::BadSurrogate));
                                }
                                let lo = self.parse_hex4()?;
                                if !(0xDC00..=0xDFFF).contains(&lo) {
                                    return Err(self.err(JsonErrorKind::BadSurrogate));
                                }
                                0x10000 + ((hi - 0xD800) << 10 | (lo - 0xDC00))
                            } else if (0xDC00..=0xDFFF).contains(&hi) {
                                return Err(self.err(JsonErrorKind::BadSurrogate));
                            } else {
                                hi
                            };

                            // An escaped NUL is dropped, never appended, so a
                            // stored string can always be handed to NUL-terminated
                            // consumers without truncation surprises.
                            if scalar != 0 {
                                match char::from_u32(scalar) {
                                    Some(c) => out.push(c),
                                    None => return Err(self.err(JsonErrorKind::BadSurrogate)),
                                }
                            }
                        }
                        _ => {
                            self.pos -= 1;
                            return Err(self.err(JsonErrorKind::BadEscape));
                        }
                    }
                }
                0x00..=0x1F => {
                    self.pos -= 1;
                    return Err(self.err(JsonErrorKind::ControlByte(b)));
                }
                _ => {
                    // Multi-byte UTF-8 sequences pass through whole.
                    let start = self.pos - 1;
                    let len = utf8_len(b);
                    if len == 0 || start + len > self.input.len() {
                        return Err(self.err(JsonErrorKind::InvalidUtf8));
                    }
                    let chunk = &self.input[start..start + len];
                    match std::str::from_utf8(chunk) {
                        Ok(s) => out.push_str(s),
                        Err(_) => return Err(self.err(JsonErrorKind::InvalidUtf8)),
                    }
                    self.pos = start + len;
                }
            }
        }
    }

    fn parse_number(&mut self) -> Result<Value, JsonError> {
        let start = self.pos;

        if self.peek() == Some(b'-') {
            self.pos += 1;
        }

        let int_start = self.pos;
        while matches!(self.peek(), Some(b'0'..=b'9')) {
            self.pos += 1;
        }
        if self.pos == int_start {
            return Err(self.err(JsonErrorKind::BadNumber));
        }

        let mut is_float = false;
        if self.peek() == Some(b'.') {
            self.pos += 1;
            is_float = true;
            let frac_start = self.pos;
            while matches!(self.peek(), Some(b'0'..=b'9')) {
                self.pos += 1;
            }
            if self.pos == frac_start {
                return Err(self.err(JsonErrorKind::BadNumber));
            }
        }

        // No exponent form: a following 'e'/'E' is malformed input, and will
        // be caught as an unexpected byte by the caller's structural parse.

        let text = std::str::from_utf8(&self.input[start..self.pos])
            .map_err(|_| self.err(JsonErrorKind::BadNumber))?;

        if is_float {
            let f: f64 = text.parse().map_err(|_| self.err(JsonErrorKind::BadNumber))?;
            match Number::from_f64(f) {
                Some(n) => Ok(Value::Number(n)),
                None => Err(self.err(JsonErrorKind::BadNumber)),
            }
        } else {
            let i: i64 = text.parse().map_err(|_| self.err(JsonErrorKind::BadNumber))?;
            Ok(Value::Number(Number::from(i)))
        }
    }
}

/// Total length of a UTF-8 sequence given its first byte, 0 if the byte
/// cannot start a sequence.
fn utf8_len(first: u8) -> usize {
    match first {
        0x20..=0x7F => 1,
        0xC2..=0xDF => 2,
        0xE0..=0xEF => 3,
        0xF0..=0xF4 => 4,
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_simple_object() {
        let v = decode(br#"{"a": 1, "b": "two", "c": [true, false, null]}"#).unwrap();
        assert_eq!(v, json!({"a": 1, "b": "two", "c": [true, false, null]}));
    }

    #[test]
    fn preserves_key_order() {
        let v = decode_object(br#"{"zebra": 1, "apple": 2, "mango": 3}"#).unwrap();
        let keys: Vec<&str> = v.keys().map(String::as_str).collect();
        assert_eq!(keys, ["zebra", "apple", "mango"]);
    }

    #[test]
    fn duplicate_keys_keep_last() {
        let v = decode_object(br#"{"a": 1, "a": 2}"#).unwrap();
        assert_eq!(v.get("a"), Some(&json!(2)));
        assert_eq!(v.len(), 1);
    }

    #[test]
    fn decodes_simple_escapes() {
        let v = decode(br#""\" \\ \/ \b \t \n \f \r""#).unwrap();
        assert_eq!(
            v,
            Value::String("\" \\ / \u{0008} \t \n \u{000C} \r".to_string())
        );
    }

    #[test]
    fn decodes_unicode_escape() {
        let v = decode(b"\"\\u00e9\"").unwrap();
        assert_eq!(v, Value::String("\u{00e9}".to_string()));
    }

    #[test]
    fn decodes_surrogate_pair() {
        let v = decode(b"\"\\ud83d\\ude00\"").unwrap();
        assert_eq!(v, Value::String("\u{1F600}".to_string()));
    }

    #[test]
    fn rejects_unpaired_high_surrogate() {
        let err = decode(br#""\ud83d!""#).unwrap_err();
        assert_eq!(err.kind, JsonErrorKind::BadSurrogate);
    }

    #[test]
    fn rejects_lone_low_surrogate() {
        let err = decode(br#""\ude00""#).unwrap_err();
        assert_eq!(err.kind, JsonErrorKind::BadSurrogate);
    }

    #[test]
    fn drops_escaped_nul() {
        let v = decode(br#""ab\u0000cd""#).unwrap();
        assert_eq!(v, Value::String("abcd".to_string()));
    }

    #[test]
    fn rejects_raw_control_byte_in_string() {
        let err = decode(b"\"a\x01b\"").unwrap_err();
        assert_eq!(err.kind, JsonErrorKind::ControlByte(0x01));
    }

    #[test]
    fn allows_whitespace_outside_strings() {
        let v = decode(b" \t\r\n {\"a\": 1} \n").unwrap();
        assert_eq!(v, json!({"a": 1}));
    }

    #[test]
    fn rejects_exponent_numbers() {
        assert!(decode(b"1e5").is_err());
        assert!(decode(br#"{"a": 2.5E3}"#).is_err());
    }

    #[test]
    fn decodes_negative_and_float() {
        assert_eq!(decode(b"-42").unwrap(), json!(-42));
        assert_eq!(decode(b"3.25").unwrap(), json!(3.25));
    }

    #[test]
    fn rejects_bare_minus_and_dot() {
        assert!(decode(b"-").is_err());
        assert!(decode(b"1.").is_err());
    }

    #[test]
    fn integer_overflow_is_an_error() {
        assert!(decode(b"99999999999999999999999").is_err());
    }

    #[test]
    fn rejects_trailing_data() {
        let err = decode(b"{} {}").unwrap_err();
        assert_eq!(err.kind, JsonErrorKind::TrailingData);
    }

    #[test]
    fn rejects_truncated_input() {
        for input in [&b"{\"a\": "[..], &b"[1, 2"[..], &b"\"abc"[..], &b"tru"[..]] {
            assert!(decode(input).is_err(), "accepted {input:?}");
        }
    }

    #[test]
    fn top_level_must_be_object_for_decode_object() {
        let err = decode_object(b"[1, 2]").unwrap_err();
        assert_eq!(err.kind, JsonErrorKind::NotAnObject);
    }

    #[test]
    fn rejects_absurd_nesting() {
        let mut input = Vec::new();
        input.extend(std::iter::repeat(b'[').take(4096));
        input.extend(std::iter::repeat(b']').take(4096));
        let err = decode(&input).unwrap_err();
        assert_eq!(err.kind, JsonErrorKind::TooDeep);
    }

    #[test]
    fn decodes_multibyte_utf8_passthrough() {
        let v = decode("\"κόσμε 日本\"".as_bytes()).unwrap();
        assert_eq!(v, Value::String("κόσμε 日本".to_string()));
    }
}
