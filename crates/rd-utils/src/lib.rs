//! Shared helpers and error types for rdeck.

use std::path::Path;

use chrono::{DateTime, Local, Utc};
use thiserror::Error;

/// Result type for shared helpers.
pub type UtilsResult<T> = Result<T, UtilsError>;

/// Shared error variants for cross-crate helpers.
#[derive(Debug, Error)]
pub enum UtilsError {
    /// An IO error occurred.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// A parsing error occurred.
    #[error("parse error: {0}")]
    Parse(String),
}

const FULL_ADDRESS_KEY: &str = "full address:";

/// Decode a connection template. Templates written by the Windows client are
/// usually UTF-16 with a byte order mark; hand-edited ones are UTF-8 or
/// Latin-1.
pub fn decode_template(bytes: &[u8]) -> UtilsResult<String> {
    if let Some(rest) = bytes.strip_prefix(&[0xFF, 0xFE]) {
        return decode_utf16(rest, u16::from_le_bytes);
    }
    if let Some(rest) = bytes.strip_prefix(&[0xFE, 0xFF]) {
        return decode_utf16(rest, u16::from_be_bytes);
    }
    let bytes = bytes.strip_prefix(&[0xEF, 0xBB, 0xBF]).unwrap_or(bytes);
    match std::str::from_utf8(bytes) {
        Ok(text) => Ok(text.to_string()),
        Err(_) => Ok(bytes.iter().map(|&byte| char::from(byte)).collect()),
    }
}

fn decode_utf16(bytes: &[u8], word: fn([u8; 2]) -> u16) -> UtilsResult<String> {
    if bytes.len() % 2 != 0 {
        return Err(UtilsError::Parse("odd byte count in UTF-16 template".into()));
    }
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| word([pair[0], pair[1]]))
        .collect();
    String::from_utf16(&units).map_err(|err| UtilsError::Parse(err.to_string()))
}

/// Read and decode a connection template from disk.
pub fn read_template(path: &Path) -> UtilsResult<String> {
    let bytes = std::fs::read(path)?;
    decode_template(&bytes)
}

/// Write a template copy as UTF-8, creating the parent directory.
pub fn write_template(path: &Path, contents: &str) -> UtilsResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, contents)?;
    Ok(())
}

/// Point a template at `machine`: blank lines and stray byte order marks are
/// dropped, the `full address` line is replaced or appended.
pub fn rewrite_full_address(template: &str, machine: &str) -> String {
    let address_line = format!("{FULL_ADDRESS_KEY}s:{machine}");
    let mut replaced = false;
    let mut lines = Vec::new();
    for line in template.lines() {
        let line = line.replace('\u{feff}', "");
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line.starts_with(FULL_ADDRESS_KEY) {
            lines.push(address_line.clone());
            replaced = true;
        } else {
            lines.push(line.to_string());
        }
    }
    if !replaced {
        lines.push(address_line);
    }
    let mut out = lines.join("\n");
    out.push('\n');
    out
}

/// Render a last-used time in local time, `Never` when unset.
pub fn format_last_used(at: Option<DateTime<Utc>>) -> String {
    match at {
        Some(at) => at.with_timezone(&Local).format("%d/%m %H:%M").to_string(),
        None => "Never".into(),
    }
}

/// Make a machine name safe to embed in a file name.
pub fn file_stem(input: &str) -> String {
    let stem: String = input
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.') {
                ch
            } else {
                '_'
            }
        })
        .collect();
    let stem = stem.trim_matches('.');
    if stem.is_empty() {
        "machine".into()
    } else {
        stem.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_utf16_le_with_bom() {
        let mut bytes = vec![0xFF, 0xFE];
        for unit in "screen mode id:i:2".encode_utf16() {
            bytes.extend_from_slice(&unit.to_le_bytes());
        }
        assert_eq!(decode_template(&bytes).unwrap(), "screen mode id:i:2");
    }

    #[test]
    fn decodes_utf8_bom_and_latin1() {
        assert_eq!(decode_template(b"\xEF\xBB\xBFa:b").unwrap(), "a:b");
        assert_eq!(decode_template(b"caf\xE9").unwrap(), "café");
    }

    #[test]
    fn rejects_truncated_utf16() {
        assert!(matches!(
            decode_template(&[0xFF, 0xFE, 0x41]),
            Err(UtilsError::Parse(_))
        ));
    }

    #[test]
    fn template_files_round_trip_through_disk() {
        let temp = tempfile::TempDir::new().unwrap();
        assert!(matches!(
            read_template(&temp.path().join("missing.rdp")),
            Err(UtilsError::Io(_))
        ));

        let path = temp.path().join("share").join("web-01.rdp");
        write_template(&path, "full address:s:web-01\n").unwrap();
        assert_eq!(read_template(&path).unwrap(), "full address:s:web-01\n");
    }

    #[test]
    fn replaces_existing_full_address() {
        let template = "screen mode id:i:2\r\n\r\nfull address:s:old-host\r\nusername:s:me\r\n";
        assert_eq!(
            rewrite_full_address(template, "web-01"),
            "screen mode id:i:2\nfull address:s:web-01\nusername:s:me\n"
        );
    }

    #[test]
    fn appends_missing_full_address() {
        assert_eq!(
            rewrite_full_address("\u{feff}audiomode:i:0\n", "db"),
            "audiomode:i:0\nfull address:s:db\n"
        );
    }

    #[test]
    fn never_used_placeholder() {
        assert_eq!(format_last_used(None), "Never");
    }

    #[test]
    fn file_stem_replaces_unsafe_characters() {
        assert_eq!(file_stem("web 01/prod"), "web_01_prod");
        assert_eq!(file_stem(".."), "machine");
    }
}
