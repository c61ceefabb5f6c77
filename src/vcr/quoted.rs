//! Decoding of quoted filenames in git output.
//!
//! Paths containing bytes outside the printable-ASCII set come back
//! double-quoted with C-style escapes (`"r\303\251sum\303\251.html"`).
//! The decoder converts them back to their raw byte sequence; everything
//! else passes through untouched.

/// Decode a possibly-quoted path from git output.
pub fn decode_quoted_path(raw: &str) -> String {
    let inner = match raw.strip_prefix('"').and_then(|s| s.strip_suffix('"')) {
        Some(inner) => inner,
        None => return raw.to_string(),
    };

    let mut bytes: Vec<u8> = Vec::with_capacity(inner.len());
    let mut chars = inner.bytes().peekable();
    while let Some(b) = chars.next() {
        if b != b'\\' {
            bytes.push(b);
            continue;
        }
        match chars.next() {
            Some(b'n') => bytes.push(b'\n'),
            Some(b't') => bytes.push(b'\t'),
            Some(b'r') => bytes.push(b'\r'),
            Some(b'\\') => bytes.push(b'\\'),
            Some(b'"') => bytes.push(b'"'),
            Some(d @ b'0'..=b'7') => {
                // Up to three octal digits.
                let mut value = (d - b'0') as u32;
                for _ in 0..2 {
                    match chars.peek() {
                        Some(&d @ b'0'..=b'7') => {
                            value = value * 8 + (d - b'0') as u32;
                            chars.next();
                        }
                        _ => break,
                    }
                }
                bytes.push(value as u8);
            }
            Some(other) => {
                bytes.push(b'\\');
                bytes.push(other);
            }
            None => bytes.push(b'\\'),
        }
    }

    String::from_utf8_lossy(&bytes).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_paths_pass_through() {
        assert_eq!(decode_quoted_path("docs/index.html"), "docs/index.html");
    }

    #[test]
    fn octal_escapes_decode_to_utf8() {
        assert_eq!(
            decode_quoted_path("\"r\\303\\251sum\\303\\251.html\""),
            "r\u{e9}sum\u{e9}.html"
        );
    }

    #[test]
    fn control_escapes_decode() {
        assert_eq!(decode_quoted_path("\"a\\tb\""), "a\tb");
        assert_eq!(decode_quoted_path("\"a\\\"b\""), "a\"b");
        assert_eq!(decode_quoted_path("\"a\\\\b\""), "a\\b");
    }

    #[test]
    fn unterminated_quote_is_literal() {
        assert_eq!(decode_quoted_path("\"half"), "\"half");
    }
}
