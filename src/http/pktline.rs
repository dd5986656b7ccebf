//! Git packet-line framing.
//!
//! Each packet line is prefixed with a 4-character lower-case hex length that
//! includes the prefix itself:
//!
//! - `0000` -- flush packet (end of section)
//! - `0004`+ -- data packet
//!
//! The proxy only ever writes one framed section itself: the
//! `# service=git-upload-pack` preamble that smart-HTTP clients expect ahead of
//! the ref advertisement.  Everything after it is produced by `git-upload-pack`.

use bytes::{BufMut, Bytes, BytesMut};

/// Largest payload a single data packet can carry (`0xffff` minus the prefix).
pub const MAX_PKT_PAYLOAD: usize = 0xffff - 4;

/// Flush packet.
pub const FLUSH_PKT: &[u8] = b"0000";

/// Encode a byte slice as a Git packet-line (4-hex-digit length prefix + data).
///
/// The length includes the 4 prefix bytes themselves.  Callers are responsible
/// for including any trailing newline in `data`.
///
/// # Panics
///
/// Panics if `data` is longer than [`MAX_PKT_PAYLOAD`].
pub fn encode_pkt_line(data: &[u8]) -> Vec<u8> {
    let total_len = data.len() + 4;
    assert!(
        data.len() <= MAX_PKT_PAYLOAD,
        "packet-line data too large ({total_len} bytes)"
    );
    let mut buf = Vec::with_capacity(total_len);
    buf.extend_from_slice(format!("{total_len:04x}").as_bytes());
    buf.extend_from_slice(data);
    buf
}

/// Build the smart-HTTP advertisement preamble for `service`:
/// `PKT "# service=<service>\n"` followed by a flush packet.
pub fn service_header(service: &str) -> Bytes {
    let line = encode_pkt_line(format!("# service={service}\n").as_bytes());
    let mut buf = BytesMut::with_capacity(line.len() + FLUSH_PKT.len());
    buf.put_slice(&line);
    buf.put_slice(FLUSH_PKT);
    buf.freeze()
}
