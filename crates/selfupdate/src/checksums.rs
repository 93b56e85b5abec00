//! checksums.txt parsing and SHA-256 verification

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Parse a checksums file into `name -> lowercase hex digest`.
///
/// Accepted line formats (the ones release tooling emits):
/// - `<sha256>  <filename>`
/// - `<sha256> *<filename>`
///
/// Blank lines and `#` comments are skipped. A malformed line or an empty
/// result is an error.
pub fn parse_checksums(data: &[u8]) -> Result<HashMap<String, String>> {
    let text = std::str::from_utf8(data)
        .map_err(|e| Error::Checksums(format!("not utf-8: {e}")))?;

    let mut out = HashMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line.split_whitespace();
        let (Some(sum), Some(name)) = (fields.next(), fields.next()) else {
            return Err(Error::Checksums(format!("invalid line: {line:?}")));
        };
        let sum = sum.to_lowercase();
        let name = name.trim_start_matches('*');
        if sum.len() != 64 || !sum.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(Error::Checksums(format!(
                "invalid sha256 {sum:?} for {name:?}"
            )));
        }
        out.insert(name.to_string(), sum);
    }
    if out.is_empty() {
        return Err(Error::Checksums("checksums file empty".into()));
    }
    Ok(out)
}

/// Emit the canonical `<sha256>  <filename>` form, sorted by filename so the
/// output is deterministic. `parse_checksums(serialize_checksums(m))`
/// recovers `m`.
pub fn serialize_checksums(map: &HashMap<String, String>) -> String {
    let mut names: Vec<&String> = map.keys().collect();
    names.sort();
    let mut out = String::new();
    for name in names {
        out.push_str(&map[name].to_lowercase());
        out.push_str("  ");
        out.push_str(name);
        out.push('\n');
    }
    out
}

/// SHA-256 of a file's contents as lowercase hex.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SUM_A: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
    const SUM_B: &str = "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";

    #[test]
    fn parses_both_separator_styles() {
        let data = format!("{SUM_A}  clipal-linux-amd64\n{SUM_B} *clipal-darwin-arm64\n");
        let map = parse_checksums(data.as_bytes()).unwrap();
        assert_eq!(map["clipal-linux-amd64"], SUM_A);
        assert_eq!(map["clipal-darwin-arm64"], SUM_B);
    }

    #[test]
    fn skips_comments_and_blank_lines() {
        let data = format!("# release v0.2.0\n\n{SUM_A}  clipal-linux-amd64\n");
        let map = parse_checksums(data.as_bytes()).unwrap();
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn digests_are_lowercased() {
        let data = format!("{}  tool\n", SUM_A.to_uppercase());
        let map = parse_checksums(data.as_bytes()).unwrap();
        assert_eq!(map["tool"], SUM_A);
    }

    #[test]
    fn rejects_short_digest() {
        assert!(parse_checksums(b"abc123  file\n").is_err());
    }

    #[test]
    fn rejects_non_hex_digest() {
        let bad = "z".repeat(64);
        let data = format!("{bad}  file\n");
        assert!(parse_checksums(data.as_bytes()).is_err());
    }

    #[test]
    fn rejects_missing_filename() {
        let data = format!("{SUM_A}\n");
        assert!(parse_checksums(data.as_bytes()).is_err());
    }

    #[test]
    fn rejects_empty_file() {
        assert!(parse_checksums(b"").is_err());
        assert!(parse_checksums(b"# only a comment\n").is_err());
    }

    #[test]
    fn serialize_then_parse_round_trips() {
        let mut map = HashMap::new();
        map.insert("clipal-linux-amd64".to_string(), SUM_A.to_string());
        map.insert("clipal-darwin-arm64".to_string(), SUM_B.to_string());
        let parsed = parse_checksums(serialize_checksums(&map).as_bytes()).unwrap();
        assert_eq!(parsed, map);
    }

    #[test]
    fn sha256_file_matches_known_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");
        std::fs::write(&path, b"hello world").unwrap();
        assert_eq!(
            sha256_file(&path).unwrap(),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }
}
