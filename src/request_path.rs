//! Request-path parsing: decode a URL pathname into safe segments or
//! refuse the whole request. A refusal is a clean non-match (the caller
//! answers 404), never an error.

use percent_encoding::percent_decode_str;

/// A validated request path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedPath {
    /// The pathname exactly as it appeared on the request line.
    pub pathname: String,
    /// Decoded, validated segments. Empty for `/`.
    pub segments: Vec<String>,
}

impl ParsedPath {
    /// True when the literal request path names a handler source file.
    /// Source is never served as a dynamic route via its own name.
    pub fn names_module_source(&self) -> bool {
        self.pathname.ends_with(".mjs")
    }
}

/// Parse a pathname into segments. Returns `None` on any rejection:
/// invalid percent-encoding, `.` / `..`, encoded separators, or a segment
/// beginning with `_` (underscore prefixes hide private trees).
pub fn parse(pathname: &str) -> Option<ParsedPath> {
    let mut segments = Vec::new();
    for raw in pathname.split('/') {
        if raw.is_empty() {
            continue;
        }
        let segment = decode_segment(raw)?;
        if segment.is_empty()
            || segment == "."
            || segment == ".."
            || segment.contains('/')
            || segment.contains('\\')
            || segment.starts_with('_')
        {
            return None;
        }
        segments.push(segment);
    }
    Some(ParsedPath {
        pathname: pathname.to_string(),
        segments,
    })
}

/// Percent-decode one raw segment. `percent_decode_str` passes malformed
/// sequences through untouched, so malformed `%` runs are rejected up
/// front to keep decode failures a parse failure.
fn decode_segment(raw: &str) -> Option<String> {
    let bytes = raw.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            if i + 2 >= bytes.len()
                || !bytes[i + 1].is_ascii_hexdigit()
                || !bytes[i + 2].is_ascii_hexdigit()
            {
                return None;
            }
            i += 3;
        } else {
            i += 1;
        }
    }
    percent_decode_str(raw).decode_utf8().ok().map(|s| s.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segments(path: &str) -> Option<Vec<String>> {
        parse(path).map(|p| p.segments)
    }

    #[test]
    fn splits_and_drops_empties() {
        assert_eq!(segments("/a//b/"), Some(vec!["a".into(), "b".into()]));
        assert_eq!(segments("/"), Some(vec![]));
    }

    #[test]
    fn decodes_percent_sequences() {
        assert_eq!(segments("/caf%C3%A9"), Some(vec!["café".into()]));
    }

    #[test]
    fn rejects_invalid_encoding() {
        assert_eq!(parse("/bad%zz"), None);
        assert_eq!(parse("/bad%2"), None);
        assert_eq!(parse("/bad%"), None);
    }

    #[test]
    fn rejects_traversal_segments() {
        assert_eq!(parse("/.."), None);
        assert_eq!(parse("/a/../b"), None);
        assert_eq!(parse("/%2e%2e"), None);
        assert_eq!(parse("/a/."), None);
    }

    #[test]
    fn rejects_encoded_separators() {
        assert_eq!(parse("/a%2fb"), None);
        assert_eq!(parse("/a%5cb"), None);
    }

    #[test]
    fn rejects_underscore_prefix_anywhere() {
        assert_eq!(parse("/_lib/secret"), None);
        assert_eq!(parse("/ok/_private"), None);
        assert_eq!(parse("/%5flib"), None);
    }

    #[test]
    fn keeps_pathname_verbatim() {
        let parsed = parse("/a%20b").unwrap();
        assert_eq!(parsed.pathname, "/a%20b");
        assert_eq!(parsed.segments, vec!["a b"]);
    }

    #[test]
    fn flags_literal_module_source_paths() {
        assert!(parse("/handler.mjs").unwrap().names_module_source());
        assert!(!parse("/handler").unwrap().names_module_source());
    }
}
