//! Compatibility shim for the legacy hex-framed serializer.
//!
//! The legacy client ships a dynamic-language dump of its parameter hash.
//! This decoder accepts only the shapes those clients actually send: a flat
//! hash of single-quoted strings, integers, and undef. Anything else is
//! rejected; nothing is ever evaluated.

use serde_json::Value;
use thiserror::Error;

use super::wire::Params;

#[derive(Error, Debug)]
#[error("dumper parse failed at byte {pos}: {reason}")]
pub struct DumperError {
    pub pos: usize,
    pub reason: String,
}

/// Decode a legacy parameter hash.
pub fn decode_params(text: &str) -> Result<Params, DumperError> {
    let mut p = Parser::new(text);
    p.skip_ws();
    if p.eat_str("$VAR1") {
        p.skip_ws();
        p.expect(b'=')?;
        p.skip_ws();
    }
    p.expect(b'{')?;

    let mut params = Params::new();
    loop {
        p.skip_ws();
        if p.eat(b'}') {
            break;
        }
        let key = p.quoted_string()?;
        p.skip_ws();
        p.expect(b'=')?;
        p.expect(b'>')?;
        p.skip_ws();
        let value = p.scalar()?;
        params.insert(key, value);
        p.skip_ws();
        if !p.eat(b',') {
            p.skip_ws();
            p.expect(b'}')?;
            break;
        }
    }
    p.skip_ws();
    p.eat(b';');
    p.skip_ws();
    if !p.done() {
        return Err(p.error("trailing garbage"));
    }
    Ok(params)
}

/// Render a JSON value in the legacy serializer's notation.
pub fn encode_value(value: &Value) -> String {
    let mut out = String::from("$VAR1 = ");
    render(value, &mut out);
    out.push(';');
    out
}

fn render(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("undef"),
        Value::Bool(b) => out.push_str(if *b { "1" } else { "0" }),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => render_string(s, out),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                render(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            out.push('{');
            for (i, (key, item)) in map.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                render_string(key, out);
                out.push_str(" => ");
                render(item, out);
            }
            out.push('}');
        }
    }
}

fn render_string(s: &str, out: &mut String) {
    out.push('\'');
    for c in s.chars() {
        if c == '\'' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('\'');
}

struct Parser<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            bytes: text.as_bytes(),
            pos: 0,
        }
    }

    fn error(&self, reason: impl Into<String>) -> DumperError {
        DumperError {
            pos: self.pos,
            reason: reason.into(),
        }
    }

    fn done(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn skip_ws(&mut self) {
        while self
            .peek()
            .is_some_and(|b| b.is_ascii_whitespace())
        {
            self.pos += 1;
        }
    }

    fn eat(&mut self, byte: u8) -> bool {
        if self.peek() == Some(byte) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn eat_str(&mut self, s: &str) -> bool {
        if self.bytes[self.pos..].starts_with(s.as_bytes()) {
            self.pos += s.len();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, byte: u8) -> Result<(), DumperError> {
        if self.eat(byte) {
            Ok(())
        } else {
            Err(self.error(format!("expected {:?}", byte as char)))
        }
    }

    fn quoted_string(&mut self) -> Result<String, DumperError> {
        self.expect(b'\'')?;
        let mut out = String::new();
        loop {
            match self.peek() {
                Some(b'\'') => {
                    self.pos += 1;
                    return Ok(out);
                }
                Some(b'\\') => {
                    self.pos += 1;
                    match self.peek() {
                        Some(c @ (b'\'' | b'\\')) => {
                            out.push(c as char);
                            self.pos += 1;
                        }
                        _ => return Err(self.error("bad escape")),
                    }
                }
                Some(_) => {
                    // Consume one UTF-8 scalar, not one byte.
                    let rest = std::str::from_utf8(&self.bytes[self.pos..])
                        .map_err(|_| self.error("invalid utf8"))?;
                    let c = rest.chars().next().ok_or_else(|| self.error("eof"))?;
                    out.push(c);
                    self.pos += c.len_utf8();
                }
                None => return Err(self.error("unterminated string")),
            }
        }
    }

    fn scalar(&mut self) -> Result<Value, DumperError> {
        if self.peek() == Some(b'\'') {
            return Ok(Value::String(self.quoted_string()?));
        }
        if self.eat_str("undef") {
            return Ok(Value::Null);
        }
        match self.peek() {
            Some(b'-' | b'0'..=b'9') => {
                let start = self.pos;
                if self.peek() == Some(b'-') {
                    self.pos += 1;
                }
                while self.peek().is_some_and(|b| b.is_ascii_digit()) {
                    self.pos += 1;
                }
                let digits = std::str::from_utf8(&self.bytes[start..self.pos])
                    .map_err(|_| self.error("invalid utf8"))?;
                let n: i64 = digits
                    .parse()
                    .map_err(|_| self.error(format!("bad integer {digits:?}")))?;
                Ok(Value::from(n))
            }
            _ => Err(self.error("unsupported value shape")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_flat_hash() {
        let params = decode_params(
            "$VAR1 = {'host' => 'h1','user' => 'alice','expire' => 0,'msg' => 'a \\'quoted\\' word','key' => undef};",
        )
        .unwrap();
        assert_eq!(params["host"], "h1");
        assert_eq!(params["expire"], 0);
        assert_eq!(params["msg"], "a 'quoted' word");
        assert_eq!(params["key"], Value::Null);
    }

    #[test]
    fn tolerates_whitespace_and_bare_hash() {
        let params = decode_params("{ 'host' => 'h1' , 'expire' => -1 }").unwrap();
        assert_eq!(params["host"], "h1");
        assert_eq!(params["expire"], -1);
    }

    #[test]
    fn rejects_nested_and_code_shapes() {
        assert!(decode_params("$VAR1 = {'a' => ['b']};").is_err());
        assert!(decode_params("$VAR1 = {'a' => {'b' => 1}};").is_err());
        assert!(decode_params("$VAR1 = {'a' => sub { 1 }};").is_err());
        assert!(decode_params("system('rm -rf /')").is_err());
    }

    #[test]
    fn encode_renders_response_shapes() {
        let value = serde_json::json!({
            "type": "success",
            "message": "it's done",
            "data": ["h2", "h1"],
            "temporary": 0,
        });
        let text = encode_value(&value);
        assert!(text.starts_with("$VAR1 = {"));
        assert!(text.contains("'message' => 'it\\'s done'"));
        assert!(text.contains("'data' => ['h2','h1']"));
        assert!(text.ends_with("};"));
    }

    #[test]
    fn encode_decode_flat_round_trip() {
        let value = serde_json::json!({"host": "h1", "expire": 7, "key": null});
        let decoded = decode_params(&encode_value(&value)).unwrap();
        assert_eq!(decoded["host"], "h1");
        assert_eq!(decoded["expire"], 7);
        assert_eq!(decoded["key"], Value::Null);
    }
}
