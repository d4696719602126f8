//! MIME message parsing for user-data
//!
//! A payload is parsed into a tree: `multipart/*` entities become
//! containers whose children are parsed recursively, everything else is a
//! leaf part with its transfer encoding already removed.

use super::types::{essence, is_multipart};
use crate::InitError;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use std::collections::HashMap;
use tracing::debug;

/// Boundary used when serializing a tree that was not parsed from MIME
pub const DEFAULT_BOUNDARY: &str = "===============instance-init-part==";

/// A leaf of the message tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Part {
    /// Declared MIME type, parameters included
    pub content_type: String,
    /// Filename from Content-Disposition, or a generated `part-NNN`
    pub filename: Option<String>,
    /// Decoded body
    pub body: Vec<u8>,
    /// Headers with lower-cased names
    pub headers: HashMap<String, String>,
}

impl Part {
    /// A part with no headers beyond its content type
    pub fn new(content_type: &str, body: impl Into<Vec<u8>>) -> Self {
        Self {
            content_type: content_type.to_string(),
            filename: None,
            body: body.into(),
            headers: HashMap::new(),
        }
    }

    pub fn with_filename(mut self, filename: &str) -> Self {
        self.filename = Some(filename.to_string());
        self
    }

    /// Content type without parameters, lower-cased
    pub fn mime_type(&self) -> String {
        essence(&self.content_type)
    }

    /// Body as text, invalid UTF-8 replaced
    pub fn text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

/// Node of a parsed message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Leaf(Part),
    Multipart {
        content_type: String,
        boundary: String,
        children: Vec<Node>,
    },
}

impl Node {
    /// An empty `multipart/mixed` container
    pub fn empty() -> Self {
        Node::Multipart {
            content_type: "multipart/mixed".to_string(),
            boundary: DEFAULT_BOUNDARY.to_string(),
            children: Vec::new(),
        }
    }

    /// Leaf parts in document order
    pub fn parts(&self) -> Vec<&Part> {
        let mut parts = Vec::new();
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            match node {
                Node::Leaf(part) => parts.push(part),
                Node::Multipart { children, .. } => stack.extend(children.iter().rev()),
            }
        }
        parts
    }

    /// Mutable leaf parts in document order
    pub fn parts_mut(&mut self) -> Vec<&mut Part> {
        let mut parts = Vec::new();
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            match node {
                Node::Leaf(part) => parts.push(part),
                Node::Multipart { children, .. } => stack.extend(children.iter_mut().rev()),
            }
        }
        parts
    }
}

/// Whether a payload starts with MIME headers
pub fn looks_like_mime(data: &[u8]) -> bool {
    let head = &data[..data.len().min(64)];
    let head = String::from_utf8_lossy(head).to_lowercase();
    head.starts_with("content-type:") || head.starts_with("mime-version:")
}

/// Parse a MIME entity (headers, blank line, body) into a tree
///
/// Only the header blocks are read as text. Bodies stay raw bytes until a
/// transfer encoding is removed.
pub fn parse_message(data: &[u8]) -> Result<Node, InitError> {
    let (header_block, body) = split_headers(data);
    let headers = parse_headers(&String::from_utf8_lossy(header_block));

    let content_type = headers
        .get("content-type")
        .cloned()
        .unwrap_or_else(|| "text/plain".to_string());

    if is_multipart(&content_type) {
        let boundary = extract_param(&content_type, "boundary").ok_or_else(|| {
            InitError::InvalidData(format!("{} without a boundary", essence(&content_type)))
        })?;
        debug!("Found MIME boundary: {}", boundary);

        let children = split_multipart(body, &boundary)
            .into_iter()
            .map(parse_message)
            .collect::<Result<Vec<_>, _>>()?;

        return Ok(Node::Multipart {
            content_type,
            boundary,
            children,
        });
    }

    let filename = headers
        .get("content-disposition")
        .and_then(|cd| extract_param(cd, "filename"));

    let body = match headers
        .get("content-transfer-encoding")
        .map(|s| s.trim().to_lowercase())
        .as_deref()
    {
        Some("base64") => decode_base64(body)?,
        Some("quoted-printable") => decode_quoted_printable(body),
        // 7bit, 8bit and binary are taken as they are
        _ => body.to_vec(),
    };

    Ok(Node::Leaf(Part {
        content_type,
        filename,
        body,
        headers,
    }))
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Split an entity at the first blank line
///
/// An entity that starts with a blank line has no headers.
fn split_headers(data: &[u8]) -> (&[u8], &[u8]) {
    if let Some(rest) = data.strip_prefix(b"\r\n") {
        return (&[][..], rest);
    }
    if let Some(rest) = data.strip_prefix(b"\n") {
        return (&[][..], rest);
    }

    let crlf = find(data, b"\r\n\r\n").map(|i| (i, 4));
    let lf = find(data, b"\n\n").map(|i| (i, 2));
    let split = match (crlf, lf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    };

    match split {
        Some((idx, len)) => (&data[..idx], &data[idx + len..]),
        None => (data, &[][..]),
    }
}

fn parse_headers(block: &str) -> HashMap<String, String> {
    let mut headers = HashMap::new();
    let mut current: Option<(String, String)> = None;

    for line in block.lines() {
        if line.starts_with(' ') || line.starts_with('\t') {
            // Continuation of previous header
            if let Some((_, value)) = current.as_mut() {
                value.push(' ');
                value.push_str(line.trim());
            }
        } else if let Some((name, value)) = line.split_once(':') {
            if let Some((n, v)) = current.take() {
                headers.insert(n, v);
            }
            current = Some((name.trim().to_lowercase(), value.trim().to_string()));
        }
    }

    if let Some((n, v)) = current {
        headers.insert(n, v);
    }
    headers
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delimiter {
    Part,
    Close,
}

/// Classify a line as `--boundary` or `--boundary--`
///
/// Delimiters start the line and may only be followed by whitespace.
fn delimiter_line(line: &[u8], boundary: &str) -> Option<Delimiter> {
    let rest = line.strip_prefix(b"--")?.strip_prefix(boundary.as_bytes())?;
    let (kind, rest) = match rest.strip_prefix(b"--") {
        Some(rest) => (Delimiter::Close, rest),
        None => (Delimiter::Part, rest),
    };
    rest.iter().all(u8::is_ascii_whitespace).then_some(kind)
}

/// Body sections between `--boundary` delimiter lines
///
/// The preamble and everything after the close delimiter are dropped. The
/// line break before each delimiter belongs to the delimiter.
fn split_multipart<'a>(body: &'a [u8], boundary: &str) -> Vec<&'a [u8]> {
    let mut sections = Vec::new();
    let mut section_start: Option<usize> = None;
    let mut pos = 0;

    while pos < body.len() {
        let line_end = body[pos..]
            .iter()
            .position(|&b| b == b'\n')
            .map_or(body.len(), |i| pos + i + 1);

        if let Some(kind) = delimiter_line(&body[pos..line_end], boundary) {
            if let Some(start) = section_start {
                sections.push(strip_line_break(&body[start..pos]));
            }
            if kind == Delimiter::Close {
                return sections;
            }
            section_start = Some(line_end);
        }
        pos = line_end;
    }

    // Unterminated message, keep the last section
    if let Some(start) = section_start {
        sections.push(strip_line_break(&body[start..]));
    }
    sections
}

fn strip_line_break(section: &[u8]) -> &[u8] {
    section
        .strip_suffix(b"\r\n")
        .or_else(|| section.strip_suffix(b"\n"))
        .unwrap_or(section)
}

/// Extract a header parameter: `name="value"` or `name=value`
fn extract_param(header: &str, name: &str) -> Option<String> {
    let lower = header.to_lowercase();
    let needle = format!("{name}=");

    // Match whole parameter names only
    let idx = lower.match_indices(&needle).find_map(|(idx, _)| {
        let prefix = lower[..idx].trim_end();
        (idx == 0 || prefix.ends_with(';')).then_some(idx)
    })?;
    let after = &header[idx + needle.len()..];

    let value = if let Some(quoted) = after.strip_prefix('"') {
        let mut value = String::new();
        let mut chars = quoted.chars();
        loop {
            match chars.next()? {
                '\\' => value.push(chars.next()?),
                '"' => break,
                c => value.push(c),
            }
        }
        value
    } else {
        let end = after
            .find(|c: char| c == ';' || c.is_whitespace())
            .unwrap_or(after.len());
        after[..end].to_string()
    };

    (!value.is_empty()).then_some(value)
}

/// Quote a parameter value
fn quote_param(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for c in value.chars() {
        match c {
            '"' | '\\' => {
                quoted.push('\\');
                quoted.push(c);
            }
            // Header values stay on one line
            '\r' | '\n' => quoted.push(' '),
            c => quoted.push(c),
        }
    }
    quoted.push('"');
    quoted
}

fn decode_base64(data: &[u8]) -> Result<Vec<u8>, InitError> {
    let clean: Vec<u8> = data
        .iter()
        .copied()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();

    BASE64
        .decode(&clean)
        .map_err(|e| InitError::InvalidData(format!("Base64 decode error: {e}")))
}

fn decode_quoted_printable(bytes: &[u8]) -> Vec<u8> {
    let mut result = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] != b'=' {
            result.push(bytes[i]);
            i += 1;
            continue;
        }

        // Soft line break
        if bytes[i + 1..].starts_with(b"\r\n") {
            i += 3;
            continue;
        }
        if bytes[i + 1..].starts_with(b"\n") {
            i += 2;
            continue;
        }

        let hex = bytes
            .get(i + 1..i + 3)
            .and_then(|h| std::str::from_utf8(h).ok())
            .and_then(|h| u8::from_str_radix(h, 16).ok());
        match hex {
            Some(byte) => {
                result.push(byte);
                i += 3;
            }
            None => {
                // Invalid encoding, pass through
                result.push(b'=');
                i += 1;
            }
        }
    }

    result
}

/// Serialize a tree back into a MIME message
///
/// Bodies that are not valid UTF-8 are written base64 encoded. A container
/// whose boundary appears as a line inside its children is written with a
/// fresh boundary.
pub fn create_multipart(root: &Node) -> String {
    let mut output = String::from("MIME-Version: 1.0\r\n");
    match root {
        Node::Multipart { .. } => write_node(&mut output, root),
        Node::Leaf(_) => {
            let wrapper = Node::Multipart {
                content_type: "multipart/mixed".to_string(),
                boundary: DEFAULT_BOUNDARY.to_string(),
                children: vec![root.clone()],
            };
            write_node(&mut output, &wrapper);
        }
    }
    output
}

fn write_node(output: &mut String, node: &Node) {
    match node {
        Node::Multipart {
            content_type,
            boundary,
            children,
        } => {
            let rendered: Vec<String> = children
                .iter()
                .map(|child| {
                    let mut text = String::new();
                    write_node(&mut text, child);
                    text
                })
                .collect();
            let boundary = fresh_boundary(boundary, &rendered);

            output.push_str(&format!(
                "Content-Type: {}; boundary={}\r\n\r\n",
                essence(content_type),
                quote_param(&boundary)
            ));
            for child in &rendered {
                output.push_str(&format!("--{boundary}\r\n"));
                output.push_str(child);
                output.push_str("\r\n");
            }
            output.push_str(&format!("--{boundary}--\r\n"));
        }
        Node::Leaf(part) => {
            output.push_str(&format!(
                "Content-Type: {}\r\n",
                part.content_type.replace(['\r', '\n'], " ")
            ));
            if let Some(filename) = &part.filename {
                output.push_str(&format!(
                    "Content-Disposition: attachment; filename={}\r\n",
                    quote_param(filename)
                ));
            }

            match std::str::from_utf8(&part.body) {
                Ok(text) => {
                    output.push_str("\r\n");
                    output.push_str(text);
                }
                Err(_) => {
                    output.push_str("Content-Transfer-Encoding: base64\r\n\r\n");
                    output.push_str(&BASE64.encode(&part.body));
                }
            }
        }
    }
}

/// `preferred`, or the first `preferred.N` no rendered child uses as a line
fn fresh_boundary(preferred: &str, rendered: &[String]) -> String {
    let collides = |candidate: &str| {
        rendered.iter().any(|text| {
            text.split('\n')
                .any(|line| delimiter_line(line.as_bytes(), candidate).is_some())
        })
    };

    if !collides(preferred) {
        return preferred.to_string();
    }

    let mut n = 1;
    loop {
        let candidate = format!("{preferred}.{n}");
        if !collides(&candidate) {
            debug!("Boundary {} collides with a body, using {}", preferred, candidate);
            return candidate;
        }
        n += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaves(node: &Node) -> Vec<&Part> {
        node.parts()
    }

    #[test]
    fn test_parse_simple_multipart() {
        let data = r#"MIME-Version: 1.0
Content-Type: multipart/mixed; boundary="BOUNDARY"

--BOUNDARY
Content-Type: text/cloud-config

#cloud-config
hostname: test

--BOUNDARY
Content-Type: text/x-shellscript

#!/bin/bash
echo hello

--BOUNDARY--
"#;

        let root = parse_message(data.as_bytes()).unwrap();
        let parts = leaves(&root);
        assert_eq!(parts.len(), 2);

        assert_eq!(parts[0].mime_type(), "text/cloud-config");
        assert_eq!(parts[0].text(), "#cloud-config\nhostname: test\n");

        assert_eq!(parts[1].mime_type(), "text/x-shellscript");
        assert_eq!(parts[1].text(), "#!/bin/bash\necho hello\n");
    }

    #[test]
    fn test_parse_nested_multipart() {
        let data = "Content-Type: multipart/mixed; boundary=outer\n\n\
--outer\n\
Content-Type: text/plain\n\n\
a\n\
--outer\n\
Content-Type: multipart/alternative; boundary=inner\n\n\
--inner\n\
Content-Type: text/plain\n\n\
b\n\
--inner\n\
Content-Type: text/plain\n\n\
c\n\
--inner--\n\
\n\
--outer\n\
Content-Type: text/plain\n\n\
d\n\
--outer--\n";

        let root = parse_message(data.as_bytes()).unwrap();
        let bodies: Vec<_> = leaves(&root).iter().map(|p| p.text().into_owned()).collect();
        assert_eq!(bodies, ["a", "b", "c", "d"]);

        let Node::Multipart { children, .. } = &root else {
            panic!("Expected container");
        };
        assert_eq!(children.len(), 3);
        assert!(matches!(children[1], Node::Multipart { .. }));
    }

    #[test]
    fn test_parse_with_filename() {
        let data = r#"Content-Type: multipart/mixed; boundary=abc123

--abc123
Content-Type: text/x-shellscript
Content-Disposition: attachment; filename="setup.sh"

#!/bin/bash
echo setup

--abc123--
"#;

        let root = parse_message(data.as_bytes()).unwrap();
        let parts = leaves(&root);
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].filename.as_deref(), Some("setup.sh"));
    }

    #[test]
    fn test_parse_base64_content() {
        let data = r#"Content-Type: multipart/mixed; boundary=test

--test
Content-Type: text/plain
Content-Transfer-Encoding: base64

SGVsbG8gV29ybGQh

--test--
"#;

        let root = parse_message(data.as_bytes()).unwrap();
        assert_eq!(leaves(&root)[0].body, b"Hello World!");
    }

    #[test]
    fn test_parse_binary_base64_content() {
        let data = "Content-Type: multipart/mixed; boundary=b\n\n--b\n\
Content-Type: application/octet-stream\n\
Content-Transfer-Encoding: BASE64\n\n\
/wD+\n--b--\n";

        let root = parse_message(data.as_bytes()).unwrap();
        assert_eq!(leaves(&root)[0].body, [0xff, 0x00, 0xfe]);
    }

    #[test]
    fn test_part_without_headers() {
        let data = "Content-Type: multipart/mixed; boundary=b\n\n--b\n\n#!/bin/sh\n\necho hi\n--b--\n";

        let root = parse_message(data.as_bytes()).unwrap();
        let parts = leaves(&root);
        assert_eq!(parts[0].content_type, "text/plain");
        assert_eq!(parts[0].text(), "#!/bin/sh\n\necho hi");
    }

    #[test]
    fn test_crlf_message() {
        let data = "Content-Type: multipart/mixed; boundary=b\r\n\r\n--b\r\n\
Content-Type: text/x-shellscript\r\n\r\n#!/bin/sh\r\n--b--\r\n";

        let root = parse_message(data.as_bytes()).unwrap();
        assert_eq!(leaves(&root)[0].text(), "#!/bin/sh");
    }

    #[test]
    fn test_multipart_without_boundary() {
        let result = parse_message(b"Content-Type: multipart/mixed\n\nbody");
        assert!(matches!(result, Err(InitError::InvalidData(_))));
    }

    #[test]
    fn test_single_entity_message() {
        let root = parse_message(b"Content-Type: text/x-shellscript\n\n#!/bin/sh\n").unwrap();
        let Node::Leaf(part) = root else {
            panic!("Expected leaf");
        };
        assert_eq!(part.text(), "#!/bin/sh\n");
    }

    #[test]
    fn test_extract_param() {
        assert_eq!(
            extract_param("multipart/mixed; boundary=\"abc123\"", "boundary").as_deref(),
            Some("abc123")
        );
        assert_eq!(
            extract_param("multipart/mixed; boundary=simple", "boundary").as_deref(),
            Some("simple")
        );
        assert_eq!(
            extract_param("attachment; filename=script.sh", "filename").as_deref(),
            Some("script.sh")
        );
        // Not fooled by a parameter with the same suffix
        assert_eq!(extract_param("attachment; xfilename=a", "filename"), None);
    }

    #[test]
    fn test_decode_quoted_printable() {
        assert_eq!(decode_quoted_printable(b"caf=C3=A9"), "café".as_bytes());
        assert_eq!(decode_quoted_printable(b"soft=\nbreak"), b"softbreak");
        assert_eq!(decode_quoted_printable(b"a=zz"), b"a=zz");
        assert_eq!(decode_quoted_printable(b"end="), b"end=");
    }

    #[test]
    fn test_looks_like_mime() {
        assert!(looks_like_mime(b"Content-Type: multipart/mixed; boundary=x\n"));
        assert!(looks_like_mime(b"MIME-Version: 1.0\n"));
        assert!(!looks_like_mime(b"#!/bin/sh\n"));
    }

    #[test]
    fn test_create_multipart_reparses() {
        let root = Node::Multipart {
            content_type: "multipart/mixed".to_string(),
            boundary: "XYZ".to_string(),
            children: vec![
                Node::Leaf(Part::new("text/x-shellscript", "#!/bin/sh\necho a\n").with_filename("a.sh")),
                Node::Leaf(Part::new("application/octet-stream", vec![0xff, 0x01])),
            ],
        };

        let text = create_multipart(&root);
        assert!(text.starts_with("MIME-Version: 1.0\r\n"));
        assert!(text.contains("--XYZ--"));

        let reparsed = parse_message(text.as_bytes()).unwrap();
        let parts = leaves(&reparsed);
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].filename.as_deref(), Some("a.sh"));
        assert_eq!(parts[0].body, b"#!/bin/sh\necho a\n");
        assert_eq!(parts[1].body, [0xff, 0x01]);
    }

    #[test]
    fn test_create_multipart_wraps_leaf() {
        let root = Node::Leaf(Part::new("text/plain", "hello"));
        let text = create_multipart(&root);
        assert!(text.contains(DEFAULT_BOUNDARY));
        assert_eq!(leaves(&parse_message(text.as_bytes()).unwrap())[0].body, b"hello");
    }

    #[test]
    fn test_boundary_text_inside_a_line() {
        let data = "Content-Type: multipart/mixed; boundary=sep\n\n--sep\n\
Content-Type: text/x-shellscript\n\n#!/bin/sh\necho x--sep y\n--sep--\n";

        let root = parse_message(data.as_bytes()).unwrap();
        let parts = leaves(&root);
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].text(), "#!/bin/sh\necho x--sep y");
    }

    #[test]
    fn test_nested_boundary_sharing_a_prefix() {
        let data = "Content-Type: multipart/mixed; boundary=sep\n\n\
--sep\n\
Content-Type: multipart/mixed; boundary=sep-in\n\n\
--sep-in\n\
Content-Type: text/plain\n\n\
b\n\
--sep-in\n\
Content-Type: text/plain\n\n\
c\n\
--sep-in--\n\
--sep\n\
Content-Type: text/plain\n\n\
d\n\
--sep--\n";

        let root = parse_message(data.as_bytes()).unwrap();
        let bodies: Vec<_> = leaves(&root).iter().map(|p| p.text().into_owned()).collect();
        assert_eq!(bodies, ["b", "c", "d"]);
    }

    #[test]
    fn test_delimiter_with_transport_padding() {
        let data = "Content-Type: multipart/mixed; boundary=b\n\n--b \t\nContent-Type: text/plain\n\nx\n--b--  \n";

        let root = parse_message(data.as_bytes()).unwrap();
        assert_eq!(leaves(&root)[0].body, b"x");
    }

    #[test]
    fn test_binary_body_kept_as_bytes() {
        let mut data = b"Content-Type: multipart/mixed; boundary=b\n\n--b\n\
Content-Type: application/octet-stream\n\
Content-Transfer-Encoding: binary\n\n"
            .to_vec();
        data.extend_from_slice(&[0xff, 0xfe, 0x00, 0x01]);
        data.extend_from_slice(b"\n--b--\n");

        let root = parse_message(&data).unwrap();
        assert_eq!(leaves(&root)[0].body, [0xff, 0xfe, 0x00, 0x01]);
    }

    #[test]
    fn test_quoted_filename_escapes() {
        assert_eq!(
            extract_param(r#"attachment; filename="a \"b\" c.sh""#, "filename").as_deref(),
            Some(r#"a "b" c.sh"#)
        );

        let root = Node::Leaf(Part::new("text/plain", "x").with_filename(r#"say "hi"\now.sh"#));
        let reparsed = parse_message(create_multipart(&root).as_bytes()).unwrap();
        assert_eq!(leaves(&reparsed)[0].filename.as_deref(), Some(r#"say "hi"\now.sh"#));
    }

    #[test]
    fn test_create_multipart_avoids_colliding_boundary() {
        let body = "#!/bin/sh\ncat <<EOF\n--XYZ\n--XYZ--\nEOF\n";
        let root = Node::Multipart {
            content_type: "multipart/mixed".to_string(),
            boundary: "XYZ".to_string(),
            children: vec![
                Node::Leaf(Part::new("text/x-shellscript", body)),
                Node::Leaf(Part::new("text/plain", "second")),
            ],
        };

        let text = create_multipart(&root);
        let reparsed = parse_message(text.as_bytes()).unwrap();
        let parts = leaves(&reparsed);
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].text(), body);
        assert_eq!(parts[1].text(), "second");

        let Node::Multipart { boundary, .. } = reparsed else {
            panic!("Expected container");
        };
        assert_ne!(boundary, "XYZ");
    }
}
