//! User-data decoding and dispatch
//!
//! Raw user-data may be:
//! - A single document (script, cloud-config, anything else)
//! - A MIME message, multipart containers nested to any depth
//! - Either of the above, gzip compressed
//!
//! Decoding yields a [`Node`] tree whose leaves are handed to content
//! handlers by [`dispatch`].

pub mod dispatch;
pub mod mime;
pub mod types;

pub use dispatch::{DispatchReport, HandlerFailure, dispatch, dispatch_payload};
pub use mime::{Node, Part, create_multipart};
pub use types::ContentType;

use crate::InitError;
use flate2::read::GzDecoder;
use std::io::Read;
use tracing::debug;

/// Decode raw user-data into a message tree
///
/// Non-MIME payloads become a single `text/plain` part. Parts without a
/// filename are named `part-001`, `part-002`, ... in document order.
pub fn decode_userdata(data: &[u8]) -> Result<Node, InitError> {
    if data.is_empty() {
        return Ok(Node::empty());
    }

    let data = decompress_if_needed(data)?;

    let mut root = if mime::looks_like_mime(&data) {
        mime::parse_message(&data)?
    } else {
        Node::Leaf(Part::new("text/plain", data))
    };

    let parts = root.parts_mut();
    debug!("Decoded {} user-data part(s)", parts.len());
    for (idx, part) in parts.into_iter().enumerate() {
        if part.filename.is_none() {
            part.filename = Some(format!("part-{:03}", idx + 1));
        }
    }

    Ok(root)
}

/// Decompress gzip data if needed
fn decompress_if_needed(data: &[u8]) -> Result<Vec<u8>, InitError> {
    // Check for gzip magic bytes
    if data.len() >= 2 && data[0] == 0x1f && data[1] == 0x8b {
        debug!("Decompressing gzip user-data");
        let mut decoder = GzDecoder::new(data);
        let mut decompressed = Vec::new();
        decoder
            .read_to_end(&mut decompressed)
            .map_err(|e| InitError::InvalidData(format!("Gzip decompression failed: {e}")))?;
        Ok(decompressed)
    } else {
        Ok(data.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_script() {
        let root = decode_userdata(b"#!/bin/bash\necho hello world").unwrap();

        let Node::Leaf(part) = root else {
            panic!("Expected a single part");
        };
        assert_eq!(part.content_type, "text/plain");
        assert_eq!(part.body, b"#!/bin/bash\necho hello world");
        assert_eq!(part.filename.as_deref(), Some("part-001"));
    }

    #[test]
    fn test_decode_empty() {
        let root = decode_userdata(b"").unwrap();
        assert!(root.parts().is_empty());
    }

    #[test]
    fn test_decode_gzip() {
        use flate2::Compression;
        use flate2::write::GzEncoder;
        use std::io::Write;

        let original = b"#cloud-config\nhostname: compressed";
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(original).unwrap();
        let compressed = encoder.finish().unwrap();

        let root = decode_userdata(&compressed).unwrap();
        assert_eq!(root.parts()[0].body, original);
    }

    #[test]
    fn test_corrupt_gzip() {
        let result = decode_userdata(&[0x1f, 0x8b, 0x00, 0x01]);
        assert!(matches!(result, Err(InitError::InvalidData(_))));
    }

    #[test]
    fn test_default_filenames() {
        let data = br#"MIME-Version: 1.0
Content-Type: multipart/mixed; boundary="BOUNDARY"

--BOUNDARY
Content-Type: text/cloud-config

#cloud-config
hostname: test

--BOUNDARY
Content-Type: text/x-shellscript
Content-Disposition: attachment; filename="named.sh"

#!/bin/bash
echo hello

--BOUNDARY
Content-Type: text/x-shellscript

#!/bin/bash
echo again

--BOUNDARY--
"#;

        let root = decode_userdata(data).unwrap();
        let names: Vec<_> = root
            .parts()
            .iter()
            .map(|p| p.filename.clone().unwrap())
            .collect();
        assert_eq!(names, ["part-001", "named.sh", "part-003"]);
    }

    #[test]
    fn test_decode_8bit_part_preserves_bytes() {
        let mut data = b"Content-Type: multipart/mixed; boundary=sep\n\n--sep\n\
Content-Type: application/octet-stream\n\
Content-Transfer-Encoding: 8bit\n\n"
            .to_vec();
        data.extend_from_slice(&[0xff, 0xfe, 0x00, 0x01]);
        data.extend_from_slice(b"\n--sep\nContent-Type: text/x-shellscript\n\n#!/bin/sh\necho x--sep y\n--sep--\n");

        let root = decode_userdata(&data).unwrap();
        let parts = root.parts();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].body, [0xff, 0xfe, 0x00, 0x01]);
        assert_eq!(parts[1].body, b"#!/bin/sh\necho x--sep y");
        assert_eq!(parts[1].filename.as_deref(), Some("part-002"));
    }
}
