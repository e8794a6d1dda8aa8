//! Identifier scheme for stored faces.
//!
//! Every face from a source image is named `<source_key>_face_<n>` with a
//! 1-based `n`. Entries also carry the source key explicitly; the string
//! parser below is used to check that the two agree.

use crate::eid::Eid;

const FACE_DELIMITER: &str = "_face_";

/// Longest file-name part kept in a generated source key.
const MAX_FILE_NAME_LEN: usize = 100;

/// Identifier for the `index`-th (0-based) face found in `source_key`.
pub fn face_identifier(source_key: &str, index: usize) -> String {
    format!("{source_key}{FACE_DELIMITER}{}", index + 1)
}

/// Splits an identifier into `(source_key, face_number)`.
///
/// Only the last `_face_<digits>` suffix counts, so source keys that
/// themselves contain `_face_` still resolve correctly.
pub fn parse_identifier(identifier: &str) -> Option<(&str, usize)> {
    let (source_key, n) = identifier.rsplit_once(FACE_DELIMITER)?;
    if source_key.is_empty() || n.is_empty() || !n.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    match n.parse::<usize>() {
        Ok(n) if n >= 1 => Some((source_key, n)),
        _ => None,
    }
}

/// Reduces an uploaded file name to characters safe for a storage key.
pub fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '-'
            }
        })
        .take(MAX_FILE_NAME_LEN)
        .collect();

    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "image".to_string()
    } else {
        cleaned.to_string()
    }
}

/// Fresh source key for an uploaded file: `<ulid>_<sanitized name>`.
pub fn new_source_key(file_name: &str) -> String {
    format!("{}_{}", Eid::new(), sanitize_file_name(file_name))
}

/// Source key derived from the file itself: `<sanitized name>_<digest>`,
/// where the digest is the first 16 hex digits of the content's SHA256.
/// Ingesting the same file again yields the same key.
pub fn content_source_key(file_name: &str, bytes: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let digest = Sha256::digest(bytes);
    let hex: String = digest[..8].iter().map(|b| format!("{b:02x}")).collect();
    format!("{}_{hex}", sanitize_file_name(file_name))
}

/// A source key is usable when it is a valid flat storage key.
pub fn is_valid_source_key(source_key: &str) -> bool {
    !source_key.is_empty()
        && source_key.len() <= u16::MAX as usize - 16
        && !source_key.starts_with('.')
        && !source_key.contains(['/', '\\'])
}
