//! URL helpers: percent-decoding, path canonicalization, and escaping for links and HTML.

use std::fmt;

/// Resolve //, /./, and /../ in a decoded URL path.
///
/// Returns None if the path is invalid or would climb above the root.
pub fn make_safe_url(url: &[u8]) -> Option<Vec<u8>> {
    // URLs not starting with a slash are illegal.
    if !url.starts_with(b"/") {
        return None;
    }

    let mut out = Vec::with_capacity(url.len());
    let mut src = 0;
    while src < url.len() {
        let rest = &url[src..];
        if rest.starts_with(b"//") {
            // skip slash
            src += 1;
        } else if rest.starts_with(b"/.") && matches!(rest.get(2), Some(b'/') | None) {
            // skip slash dot
            src += 2;
        } else if rest.starts_with(b"/..") && matches!(rest.get(3), Some(b'/') | None) {
            // skip slash dot dot, and drop the previous component
            src += 3;
            loop {
                match out.pop() {
                    None => return None,
                    Some(b'/') => break,
                    Some(_) => {}
                }
            }
        } else {
            out.push(url[src]);
            src += 1;
        }
    }

    // Always preserve leading slash
    if out.is_empty() {
        out.push(b'/');
    }
    Some(out)
}

/// Decode %XX (where XX are hexadecimal digits) into the byte it represents.
///
/// Malformed escapes are kept as they are.
pub fn url_decode(url: &[u8]) -> Vec<u8> {
    let mut decoded = Vec::with_capacity(url.len());
    let mut i = 0;
    while i < url.len() {
        let c = url[i];
        if c == b'%'
            && i + 2 < url.len()
            && url[i + 1].is_ascii_hexdigit()
            && url[i + 2].is_ascii_hexdigit()
        {
            decoded.push(hex_to_digit(url[i + 1]) * 16 + hex_to_digit(url[i + 2]));
            i += 3;
        } else {
            decoded.push(c);
            i += 1;
        }
    }
    decoded
}

/// Convert hex digit to integer.
fn hex_to_digit(hex: u8) -> u8 {
    match hex {
        b'A'..=b'F' => hex - b'A' + 10,
        b'a'..=b'f' => hex - b'a' + 10,
        _ => hex - b'0',
    }
}

/// Encode bytes to be an RFC3986-compliant URL part.
pub struct UrlEncoded<'a>(pub &'a [u8]);

impl<'a> fmt::Display for UrlEncoded<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &b in self.0 {
            if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~') {
                write!(f, "{}", b as char)?;
            } else {
                write!(f, "%{:02X}", b)?;
            }
        }
        Ok(())
    }
}

/// Escape < > & ' " into HTML entities.
pub struct HtmlEscaped<'a>(pub &'a str);

impl<'a> fmt::Display for HtmlEscaped<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for c in self.0.chars() {
            match c {
                '<' => f.write_str("&lt;")?,
                '>' => f.write_str("&gt;")?,
                '&' => f.write_str("&amp;")?,
                '\'' => f.write_str("&apos;")?,
                '"' => f.write_str("&quot;")?,
                c => write!(f, "{}", c)?,
            }
        }
        Ok(())
    }
}
