//! multipart/mixed message assembly (RFC 5322 headers, RFC 2045/2046 parts).
//!
//! Layout of a built message:
//!
//! ```text
//! From / To / Subject / Date / MIME-Version / Content-Type   (CRLF, blank line)
//! --boundary  text/plain; charset=utf-8, quoted-printable
//! --boundary  attachment 1, base64
//! ...
//! --boundary--
//! ```
//!
//! Part order is stable: body first, then attachments in the order given.

use crate::model::Attachment;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::Utc;
use lettre::Address;
use std::io::Write;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

/// Maximum encoded line length, excluding CRLF.
const MAX_LINE: usize = 76;
const CRLF: &str = "\r\n";
const BOUNDARY_ATTEMPTS: usize = 3;
/// `To` value when the recipients are not to be disclosed to each other.
pub const UNDISCLOSED_RECIPIENTS: &str = "undisclosed-recipients:;";

#[derive(Debug, Error)]
pub enum MimeError {
    #[error("failed to write message: {0}")]
    Io(#[from] std::io::Error),
    #[error("header {0} contains a line break")]
    HeaderInjection(&'static str),
    #[error("header {header} holds an invalid mailbox {value:?}")]
    Mailbox { header: &'static str, value: String },
    #[error("could not find a boundary absent from the message content")]
    BoundaryCollision,
}

/// Top-level addressing headers. Mailboxes are `addr` or `Name <addr>`. An
/// empty `to` is written as [`UNDISCLOSED_RECIPIENTS`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHeaders {
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
}

/// Encoded message ready for SMTP DATA.
#[derive(Debug, Clone)]
pub struct BuiltMessage {
    pub boundary: String,
    pub bytes: Vec<u8>,
}

struct EncodedPart {
    headers: Vec<(&'static str, String)>,
    body: String,
}

/// Build a complete multipart/mixed message. Nothing is returned unless every
/// part was written.
pub fn build(
    headers: &MessageHeaders,
    body_text: &str,
    attachments: &[Attachment],
) -> Result<BuiltMessage, MimeError> {
    let to_values = headers.to.iter().map(|v| ("To", v));
    for (name, value) in [("From", &headers.from), ("Subject", &headers.subject)].into_iter().chain(to_values) {
        if value.contains(['\r', '\n']) {
            return Err(MimeError::HeaderInjection(name));
        }
    }
    let from = encode_mailbox("From", &headers.from)?;
    let to = if headers.to.is_empty() {
        UNDISCLOSED_RECIPIENTS.to_string()
    } else {
        headers
            .to
            .iter()
            .map(|v| encode_mailbox("To", v))
            .collect::<Result<Vec<_>, _>>()?
            .join(", ")
    };

    debug!("encoding message body");
    let mut parts = Vec::with_capacity(attachments.len() + 1);
    parts.push(EncodedPart {
        headers: vec![
            ("Content-Type", "text/plain; charset=utf-8".to_string()),
            ("Content-Transfer-Encoding", "quoted-printable".to_string()),
        ],
        body: encode_quoted_printable(body_text),
    });
    for attachment in attachments {
        debug!(file_name = %attachment.file_name, bytes = attachment.payload.len(), "encoding attachment");
        parts.push(EncodedPart {
            headers: vec![
                ("Content-Type", attachment.mime_type.clone()),
                ("Content-Transfer-Encoding", "base64".to_string()),
                ("Content-Disposition", content_disposition(&attachment.file_name)),
            ],
            body: encode_base64_wrapped(&attachment.payload),
        });
    }

    let boundary = pick_boundary(&parts)?;
    let mut buf: Vec<u8> = Vec::new();

    write!(buf, "From: {from}{CRLF}")?;
    write!(buf, "To: {to}{CRLF}")?;
    write!(buf, "Subject: {}{CRLF}", encode_header_value(&headers.subject))?;
    write!(buf, "Date: {}{CRLF}", Utc::now().to_rfc2822())?;
    write!(buf, "MIME-Version: 1.0{CRLF}")?;
    write!(buf, "Content-Type: multipart/mixed; boundary=\"{boundary}\"{CRLF}")?;
    buf.write_all(CRLF.as_bytes())?;

    for (idx, part) in parts.iter().enumerate() {
        if idx > 0 {
            buf.write_all(CRLF.as_bytes())?;
        }
        write!(buf, "--{boundary}{CRLF}")?;
        for (name, value) in &part.headers {
            write!(buf, "{name}: {value}{CRLF}")?;
        }
        buf.write_all(CRLF.as_bytes())?;
        buf.write_all(part.body.as_bytes())?;
    }
    write!(buf, "{CRLF}--{boundary}--{CRLF}")?;

    info!(attachments = attachments.len(), bytes = buf.len(), "message built");
    Ok(BuiltMessage { boundary, bytes: buf })
}

/// `=_` can never occur in quoted-printable output (a literal `=` is always
/// followed by hex or CRLF) nor in base64 output, so a collision is not
/// expected; the check still runs.
fn pick_boundary(parts: &[EncodedPart]) -> Result<String, MimeError> {
    for _ in 0..BOUNDARY_ATTEMPTS {
        let boundary = format!("=_{}", Uuid::new_v4().simple());
        let delimiter = format!("--{boundary}");
        let clash = parts.iter().any(|p| {
            p.body.contains(&delimiter) || p.headers.iter().any(|(_, v)| v.contains(&delimiter))
        });
        if !clash {
            return Ok(boundary);
        }
    }
    Err(MimeError::BoundaryCollision)
}

/// `attachment; filename="..."`, with an RFC 2231 `filename*` parameter added
/// for non-ASCII names.
fn content_disposition(file_name: &str) -> String {
    let quoted = file_name
        .replace(['\r', '\n'], " ")
        .replace('\\', "\\\\")
        .replace('"', "\\\"");
    if file_name.is_ascii() {
        return format!("attachment; filename=\"{quoted}\"");
    }
    let mut extended = String::new();
    for b in file_name.bytes() {
        if b.is_ascii_alphanumeric() || b"!#$&+-.^_`|~".contains(&b) {
            extended.push(b as char);
        } else {
            extended.push_str(&format!("%{b:02X}"));
        }
    }
    format!(
        "attachment; filename=\"{}\"; filename*=utf-8''{extended}",
        encode_header_value(&quoted)
    )
}

/// Render one mailbox. Only the display name is ever encoded; the address is
/// validated and written as is.
fn encode_mailbox(header: &'static str, value: &str) -> Result<String, MimeError> {
    let invalid = || MimeError::Mailbox {
        header,
        value: value.to_string(),
    };
    let value = value.trim();
    let (name, addr) = match value.strip_suffix('>').and_then(|v| v.rsplit_once('<')) {
        Some((name, addr)) => (name.trim().trim_matches('"').trim(), addr.trim()),
        None => ("", value),
    };
    let addr: Address = addr.parse().map_err(|_| invalid())?;
    if name.is_empty() {
        return Ok(addr.to_string());
    }
    if name.is_ascii() {
        let quoted = name.replace('\\', "\\\\").replace('"', "\\\"");
        return Ok(format!("\"{quoted}\" <{addr}>"));
    }
    Ok(format!("{} <{addr}>", encode_header_value(name)))
}

/// ASCII passes through; anything else becomes RFC 2047 `B` encoded-words,
/// folded so no word exceeds 75 characters.
pub fn encode_header_value(value: &str) -> String {
    if value.is_ascii() {
        return value.to_string();
    }
    // 45 input bytes -> 60 base64 chars + 12 chars of =?utf-8?B?...?= framing
    const CHUNK: usize = 45;
    let mut words = Vec::new();
    let mut chunk = String::new();
    for ch in value.chars() {
        if chunk.len() + ch.len_utf8() > CHUNK {
            words.push(format!("=?utf-8?B?{}?=", STANDARD.encode(chunk.as_bytes())));
            chunk.clear();
        }
        chunk.push(ch);
    }
    if !chunk.is_empty() {
        words.push(format!("=?utf-8?B?{}?=", STANDARD.encode(chunk.as_bytes())));
    }
    words.join("\r\n ")
}

/// Standard base64 split into 76-character CRLF-terminated lines.
pub fn encode_base64_wrapped(data: &[u8]) -> String {
    let encoded = STANDARD.encode(data);
    let mut out = String::with_capacity(encoded.len() + encoded.len() / MAX_LINE * 2 + 2);
    for line in encoded.as_bytes().chunks(MAX_LINE) {
        // base64 output is ASCII
        out.push_str(std::str::from_utf8(line).unwrap_or_default());
        out.push_str(CRLF);
    }
    out
}

/// Quoted-printable encoding of UTF-8 text. Line breaks in the input (`\n` or
/// `\r\n`) become CRLF hard breaks; longer lines get `=` soft breaks so no
/// encoded line exceeds 76 characters. Whitespace at the end of a line is
/// escaped.
pub fn encode_quoted_printable(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + text.len() / 8);
    let mut lines = text.split('\n').peekable();
    while let Some(raw) = lines.next() {
        let is_last = lines.peek().is_none();
        // A trailing '\r' belongs to a CRLF pair, except on the final segment.
        let line = if is_last { raw } else { raw.strip_suffix('\r').unwrap_or(raw) };
        encode_qp_line(line.as_bytes(), &mut out);
        if !is_last {
            out.push_str(CRLF);
        }
    }
    out
}

fn encode_qp_line(bytes: &[u8], out: &mut String) {
    let mut width = 0;
    for (idx, &b) in bytes.iter().enumerate() {
        let at_end = idx + 1 == bytes.len();
        let literal = match b {
            b' ' | b'\t' => !at_end,
            b'=' => false,
            33..=126 => true,
            _ => false,
        };
        let token_len = if literal { 1 } else { 3 };
        // leave room for the soft-break '='
        if width + token_len > MAX_LINE - 1 {
            out.push('=');
            out.push_str(CRLF);
            width = 0;
        }
        if literal {
            out.push(b as char);
        } else {
            out.push_str(&format!("={b:02X}"));
        }
        width += token_len;
    }
}
