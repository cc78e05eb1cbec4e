use super::value::Value;

/// Encode a value into a fresh buffer.
///
/// Dictionary keys come out strictly increasing because [`Value::Dict`]
/// is ordered by raw bytes.
pub fn encode(value: &Value) -> Vec<u8> {
    let mut buf = Vec::new();
    encode_into(value, &mut buf);
    buf
}

pub fn encode_into(value: &Value, buf: &mut Vec<u8>) {
    match value {
        Value::Integer(i) => {
            buf.push(b'i');
            buf.extend_from_slice(i.to_string().as_bytes());
            buf.push(b'e');
        }
        Value::Bytes(b) => put_bytes(b, buf),
        Value::List(l) => {
            buf.push(b'l');
            for v in l {
                encode_into(v, buf);
            }
            buf.push(b'e');
        }
        Value::Dict(d) => {
            buf.push(b'd');
            for (k, v) in d {
                put_bytes(k, buf);
                encode_into(v, buf);
            }
            buf.push(b'e');
        }
        Value::Cached(c) => buf.extend_from_slice(c.as_bytes()),
    }
}

fn put_bytes(b: &[u8], buf: &mut Vec<u8>) {
    buf.extend_from_slice(b.len().to_string().as_bytes());
    buf.push(b':');
    buf.extend_from_slice(b);
}
