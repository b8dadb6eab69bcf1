//! Output classification heuristics.
//!
//! The messaging client only communicates through free-form terminal output,
//! so connection state is inferred from phrase and glyph heuristics over the
//! accumulated stdout/stderr buffer. Everything here is a pure function of
//! that buffer; the supervisor re-runs the checks as chunks arrive, which
//! keeps phrases split across stream flushes detectable.

use std::sync::OnceLock;

use regex::Regex;

use crate::session::QrPayload;

/// Block-drawing glyphs the client uses to render QR codes in a terminal.
const QR_GLYPHS: &[char] = &['▄', '█', '▀', '▌', '▐', '▬'];

/// Minimum QR-like lines for a block to be accepted as an ASCII payload.
const QR_MIN_LINES: usize = 10;
/// Collected-line count after which a short non-QR line closes the block.
const QR_CLOSE_LINES: usize = 20;
/// Blank lines tolerated inside a block before it is closed.
const QR_MAX_BLANK_LINES: usize = 3;
/// Lines longer than this count as QR content when they carry a glyph.
const QR_LONG_LINE: usize = 25;

fn qr_url_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"https?://\S+").expect("static regex"))
}

fn has_qr_glyph(text: &str) -> bool {
    text.chars().any(|c| QR_GLYPHS.contains(&c))
}

/// A line is QR-like if it carries block glyphs and is either long or made
/// of nothing but glyphs and whitespace.
fn is_qr_like(line: &str) -> bool {
    has_qr_glyph(line)
        && (line.trim().chars().count() > QR_LONG_LINE
            || line.chars().all(|c| QR_GLYPHS.contains(&c) || c.is_whitespace()))
}

/// Extract a contiguous block of QR-like lines as an ASCII-art payload.
///
/// Returns `None` when fewer than [`QR_MIN_LINES`] lines were collected.
pub fn extract_ascii_qr(output: &str) -> Option<String> {
    let mut qr_lines: Vec<&str> = Vec::new();
    let mut in_block = false;
    let mut blank_run = 0usize;

    for line in output.lines() {
        if is_qr_like(line) {
            in_block = true;
            blank_run = 0;
            qr_lines.push(line);
        } else if in_block {
            if line.trim().is_empty() {
                blank_run += 1;
                if blank_run > QR_MAX_BLANK_LINES && qr_lines.len() >= QR_CLOSE_LINES {
                    break;
                }
            } else if line.trim().chars().count() < QR_LONG_LINE && !has_qr_glyph(line) {
                if qr_lines.len() >= QR_CLOSE_LINES {
                    break;
                }
            } else {
                blank_run = 0;
            }
        }
    }

    if qr_lines.len() >= QR_MIN_LINES {
        Some(qr_lines.join("\n"))
    } else {
        None
    }
}

/// First `http(s)://` URL in the buffer.
pub fn find_qr_url(output: &str) -> Option<String> {
    qr_url_regex()
        .find(output)
        .map(|m| m.as_str().to_string())
}

/// Best QR payload extractable from the buffer. A pairing URL is preferred
/// over ASCII art.
pub fn qr_payload(output: &str) -> Option<QrPayload> {
    if let Some(url) = find_qr_url(output) {
        return Some(QrPayload::Url(url));
    }
    extract_ascii_qr(output).map(QrPayload::AsciiArt)
}

/// Whether a chunk looks like the start of QR output.
pub fn has_qr_hint(chunk: &str) -> bool {
    has_qr_glyph(chunk) || chunk.contains("http://") || chunk.contains("https://")
}

/// The remote side dropped the session or demands an explicit logout first.
pub fn has_disconnect_phrase(text: &str) -> bool {
    let lower = text.to_lowercase();
    lower.contains("disconnected")
        || lower.contains("use \"logout\" command")
        || lower.contains("logout command first")
        || (lower.contains("error") && lower.contains("logout"))
}

/// Explicit error mark emitted by the client on fatal failures.
pub fn has_error_mark(text: &str) -> bool {
    text.to_lowercase().contains("✖  error")
}

/// Successful authentication: a success marker co-occurring with a
/// "logged in" phrase. Either alone trips on unrelated lines, so both are
/// required, checked over the cumulative buffer.
pub fn has_login_success(output: &str) -> bool {
    let lower = output.to_lowercase();
    lower.contains("success") && lower.contains("logged in")
}

/// Chunk-level login hint: "logged in" outside device/settings listings.
pub fn chunk_login_hint(chunk: &str) -> bool {
    let lower = chunk.to_lowercase();
    lower.contains("logged in") && !lower.contains("device") && !lower.contains("settings")
}

/// A send operation was dispatched.
pub fn has_message_sent(text: &str) -> bool {
    let lower = text.to_lowercase();
    lower.contains("sending message:") || lower.contains("awaiting  sending message")
}

/// The underlying connection reset mid-operation.
pub fn has_stream_error(text: &str) -> bool {
    let lower = text.to_lowercase();
    lower.contains("stream errored") || lower.contains("connection errored")
}

/// Another client session pre-empted this one.
pub fn has_conflict(text: &str) -> bool {
    let lower = text.to_lowercase();
    lower.contains("conflict") || lower.contains("replaced")
}

/// Checkmark-style success marker independent of context.
pub fn has_explicit_success(text: &str) -> bool {
    let lower = text.to_lowercase();
    lower.contains("✔  success")
        || lower.contains("✔ success")
        || lower.contains("success   done")
        || (lower.contains("success") && lower.contains("done"))
}
