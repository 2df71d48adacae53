//! Minimal CSV row encoding.

/// Encode one row terminated by `\n`. Fields containing a comma, a quote or a
/// line break are quoted and inner quotes are doubled.
pub fn encode_row<S: AsRef<str>>(fields: &[S]) -> Vec<u8> {
    let mut out = Vec::with_capacity(fields.iter().map(|f| f.as_ref().len() + 1).sum());
    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            out.push(b',');
        }
        let field = field.as_ref();
        if field.contains(&[',', '"', '\r', '\n'][..]) {
            out.push(b'"');
            for byte in field.bytes() {
                if byte == b'"' {
                    out.push(b'"');
                }
                out.push(byte);
            }
            out.push(b'"');
        } else {
            out.extend_from_slice(field.as_bytes());
        }
    }
    out.push(b'\n');
    out
}
