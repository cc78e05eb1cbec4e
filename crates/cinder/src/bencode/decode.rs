use std::collections::BTreeMap;

use bytes::Bytes;
use thiserror::Error;
use tracing::warn;

use super::value::Value;

const MAX_DEPTH: usize = 64;

/// Any violation of the canonical encoding.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("malformed bencode at byte {offset}: {reason}")]
pub struct MalformedEncoding {
    pub offset: usize,
    pub reason: &'static str,
}

/// Decode exactly one value, rejecting trailing bytes.
pub fn decode(data: &[u8]) -> Result<Value, MalformedEncoding> {
    let mut d = Decoder { data, pos: 0, strict: true };
    let value = d.value(0)?;

    if d.pos != data.len() {
        return Err(d.err("trailing data after value"));
    }

    Ok(value)
}

/// Like [`decode`], for what other programs send us: trailing bytes only
/// produce a warning, and dictionary keys may come in any order. Of
/// duplicated keys the last one wins.
pub fn decode_sloppy(data: &[u8]) -> Result<Value, MalformedEncoding> {
    let mut d = Decoder { data, pos: 0, strict: false };
    let value = d.value(0)?;

    if d.pos != data.len() {
        warn!("ignoring {} trailing bytes after bencoded value", data.len() - d.pos);
    }

    Ok(value)
}

struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
    /// Require sorted, unique dictionary keys.
    strict: bool,
}

impl<'a> Decoder<'a> {
    fn err(&self, reason: &'static str) -> MalformedEncoding {
        MalformedEncoding { offset: self.pos, reason }
    }

    fn peek(&self) -> Result<u8, MalformedEncoding> {
        self.data.get(self.pos).copied().ok_or_else(|| self.err("unexpected end of input"))
    }

    fn value(&mut self, depth: usize) -> Result<Value, MalformedEncoding> {
        if depth > MAX_DEPTH {
            return Err(self.err("nesting too deep"));
        }

        match self.peek()? {
            b'i' => self.integer().map(Value::Integer),
            b'l' => {
                self.pos += 1;
                let mut list = Vec::new();
                while self.peek()? != b'e' {
                    list.push(self.value(depth + 1)?);
                }
                self.pos += 1;
                Ok(Value::List(list))
            }
            b'd' => {
                self.pos += 1;
                let mut dict = BTreeMap::new();
                let mut last: Option<Bytes> = None;
                while self.peek()? != b'e' {
                    let key_at = self.pos;
                    let key = self.bytes()?;
                    if let Some(prev) = last.as_ref().filter(|_| self.strict) {
                        if key <= *prev {
                            return Err(MalformedEncoding {
                                offset: key_at,
                                reason: "dictionary keys unsorted or duplicated",
                            });
                        }
                    }
                    let v = self.value(depth + 1)?;
                    last = Some(key.clone());
                    dict.insert(key, v);
                }
                self.pos += 1;
                Ok(Value::Dict(dict))
            }
            b'0'..=b'9' => self.bytes().map(Value::Bytes),
            _ => Err(self.err("unexpected character")),
        }
    }

    fn integer(&mut self) -> Result<i64, MalformedEncoding> {
        // skip the `i`
        self.pos += 1;
        let start = self.pos;
        let end = self.data[start..]
            .iter()
            .position(|b| *b == b'e')
            .map(|p| start + p)
            .ok_or_else(|| self.err("unterminated integer"))?;

        let digits = &self.data[start..end];
        let unsigned = digits.strip_prefix(b"-").unwrap_or(digits);

        if unsigned.is_empty() || !unsigned.iter().all(u8::is_ascii_digit) {
            return Err(self.err("invalid integer"));
        }
        if unsigned[0] == b'0' && (unsigned.len() > 1 || digits.len() != unsigned.len()) {
            return Err(self.err("leading zero or negative zero"));
        }

        let n = std::str::from_utf8(digits)
            .ok()
            .and_then(|s| s.parse::<i64>().ok())
            .ok_or_else(|| self.err("integer out of range"))?;

        self.pos = end + 1;
        Ok(n)
    }

    fn bytes(&mut self) -> Result<Bytes, MalformedEncoding> {
        let start = self.pos;
        let colon = self.data[start..]
            .iter()
            .position(|b| *b == b':')
            .map(|p| start + p)
            .ok_or_else(|| self.err("unterminated string length"))?;

        let digits = &self.data[start..colon];
        if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
            return Err(self.err("invalid string length"));
        }
        if digits[0] == b'0' && digits.len() > 1 {
            return Err(self.err("leading zero in string length"));
        }

        let len = std::str::from_utf8(digits)
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .ok_or_else(|| self.err("string length out of range"))?;

        let begin = colon + 1;
        let end = begin
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| self.err("string runs past end of input"))?;

        self.pos = end;
        Ok(Bytes::copy_from_slice(&self.data[begin..end]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_scalars() {
        assert_eq!(decode(b"i42e").unwrap(), Value::Integer(42));
        assert_eq!(decode(b"i-7e").unwrap(), Value::Integer(-7));
        assert_eq!(decode(b"i0e").unwrap(), Value::Integer(0));
        assert_eq!(decode(b"4:spam").unwrap().as_str(), Some("spam"));
        assert_eq!(decode(b"0:").unwrap().as_bytes().unwrap().len(), 0);
    }

    #[test]
    fn reject_bad_integers() {
        for bad in [&b"i03e"[..], b"i-0e", b"ie", b"i-e", b"i1x2e", b"i12"] {
            assert!(decode(bad).is_err(), "{:?}", String::from_utf8_lossy(bad));
        }
    }

    #[test]
    fn reject_unsorted_and_duplicate_keys() {
        assert!(decode(b"d1:bi1e1:ai2ee").is_err());
        assert!(decode(b"d1:ai1e1:ai2ee").is_err());
        assert!(decode(b"d1:ai1e1:bi2ee").is_ok());
    }

    #[test]
    fn trailing_bytes() {
        assert_eq!(
            decode(b"i1eXX").unwrap_err().reason,
            "trailing data after value"
        );
        assert_eq!(decode_sloppy(b"i1eXX").unwrap(), Value::Integer(1));
    }

    #[test]
    fn sloppy_accepts_any_key_order() {
        let v = decode_sloppy(b"d1:bi1e1:ai2e1:bi3ee").unwrap();
        assert_eq!(v.get(b"a").and_then(Value::as_integer), Some(2));
        assert_eq!(v.get(b"b").and_then(Value::as_integer), Some(3));
        // everything else is still checked
        assert!(decode_sloppy(b"d1:ai03ee").is_err());
    }

    #[test]
    fn truncated_input() {
        assert!(decode(b"l4:spam").is_err());
        assert!(decode(b"5:spam").is_err());
        assert!(decode(b"d3:foo").is_err());
        assert!(decode(b"").is_err());
    }

    #[test]
    fn non_utf8_is_opaque() {
        let v = decode(b"2:\xff\xfe").unwrap();
        assert_eq!(v.as_str(), None);
        assert_eq!(&v.as_bytes().unwrap()[..], b"\xff\xfe");
    }

    #[test]
    fn nesting_limit() {
        let mut deep = vec![b'l'; 100];
        deep.extend(vec![b'e'; 100]);
        assert_eq!(decode(&deep).unwrap_err().reason, "nesting too deep");
    }

    #[test]
    fn dict_lookup() {
        let v = decode(b"d8:completei5e10:incompletei3e8:intervali1800ee").unwrap();
        assert_eq!(v.get(b"interval").and_then(Value::as_integer), Some(1800));
        assert_eq!(v.get(b"complete").and_then(Value::as_integer), Some(5));
        assert!(v.get(b"peers").is_none());
    }
}
