//! Payload table loading.
//!
//! Every module is driven by a flat newline-separated table: one payload per
//! line, blank lines and `#` comments ignored. A complete default set ships
//! embedded in the binary; a user-supplied directory overlays individual
//! tables by file name, so replacing `mid_paths.txt` does not silently drop
//! the defaults for every other module.

use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TableError {
    #[error("failed to read table {name}: {source}")]
    Io {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("charmap line {line}: {reason}")]
    BadCharmap { line: usize, reason: String },
}

/// File names recognised in a user table directory.
const TABLE_FILES: &[&str] = &[
    "mid_paths.txt",
    "end_paths.txt",
    "ip_headers.txt",
    "ip_values.txt",
    "scheme_headers.txt",
    "url_headers.txt",
    "url_paths.txt",
    "port_headers.txt",
    "ports.txt",
    "nginx.txt",
    "haproxy.txt",
    "path_prefix.txt",
    "unicode_charmap.txt",
];

const EMBEDDED: &[(&str, &str)] = &[
    ("mid_paths.txt", include_str!("../payloads/mid_paths.txt")),
    ("end_paths.txt", include_str!("../payloads/end_paths.txt")),
    ("ip_headers.txt", include_str!("../payloads/ip_headers.txt")),
    ("ip_values.txt", include_str!("../payloads/ip_values.txt")),
    (
        "scheme_headers.txt",
        include_str!("../payloads/scheme_headers.txt"),
    ),
    ("url_headers.txt", include_str!("../payloads/url_headers.txt")),
    ("url_paths.txt", include_str!("../payloads/url_paths.txt")),
    (
        "port_headers.txt",
        include_str!("../payloads/port_headers.txt"),
    ),
    ("ports.txt", include_str!("../payloads/ports.txt")),
    ("nginx.txt", include_str!("../payloads/nginx.txt")),
    ("haproxy.txt", include_str!("../payloads/haproxy.txt")),
    ("path_prefix.txt", include_str!("../payloads/path_prefix.txt")),
    (
        "unicode_charmap.txt",
        include_str!("../payloads/unicode_charmap.txt"),
    ),
];

/// One alternative spelling of an ASCII letter: a sequence of code points
/// whose NFKC normalization equals that letter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharmapEntry {
    pub letter: char,
    pub substitute: String,
}

/// All payload tables for one run, resolved once at startup.
#[derive(Debug, Clone)]
pub struct TableSet {
    pub mid_paths: Vec<String>,
    pub end_paths: Vec<String>,
    pub ip_headers: Vec<String>,
    pub ip_values: Vec<String>,
    pub scheme_headers: Vec<String>,
    pub url_headers: Vec<String>,
    pub url_paths: Vec<String>,
    pub port_headers: Vec<String>,
    pub ports: Vec<String>,
    pub nginx: Vec<String>,
    pub haproxy: Vec<String>,
    pub path_prefix: Vec<String>,
    pub charmap: Vec<CharmapEntry>,
}

impl TableSet {
    /// The tables compiled into the binary.
    pub fn embedded() -> Result<Self, TableError> {
        let map: HashMap<&str, &str> = EMBEDDED.iter().copied().collect();
        Self::from_sources(|name| Ok(Some(map[name].to_string())))
    }

    /// Embedded defaults with per-file overrides from `dir`.
    pub fn load_dir(dir: &Path) -> Result<Self, TableError> {
        let map: HashMap<&str, &str> = EMBEDDED.iter().copied().collect();
        Self::from_sources(|name| {
            let candidate = dir.join(name);
            if candidate.is_file() {
                tracing::debug!(table = name, path = %candidate.display(), "tables.override");
                return std::fs::read_to_string(&candidate)
                    .map(Some)
                    .map_err(|source| TableError::Io { name, source });
            }
            Ok(Some(map[name].to_string()))
        })
    }

    /// Write the embedded defaults into `dir`, replacing what is there.
    /// Backing store for `-update-payloads`.
    pub fn write_defaults(dir: &Path) -> Result<(), TableError> {
        std::fs::create_dir_all(dir).map_err(|source| TableError::Io {
            name: "payload dir",
            source,
        })?;
        for (name, contents) in EMBEDDED.iter().copied() {
            std::fs::write(dir.join(name), contents).map_err(|source| TableError::Io {
                name,
                source,
            })?;
        }
        Ok(())
    }

    fn from_sources<F>(mut read: F) -> Result<Self, TableError>
    where
        F: FnMut(&'static str) -> Result<Option<String>, TableError>,
    {
        let charmap_text = read("unicode_charmap.txt")?.unwrap_or_default();
        let mut fetch = |name: &'static str| -> Result<Vec<String>, TableError> {
            let text = read(name)?.unwrap_or_default();
            Ok(parse_lines(&text))
        };

        Ok(Self {
            mid_paths: fetch("mid_paths.txt")?,
            end_paths: fetch("end_paths.txt")?,
            ip_headers: fetch("ip_headers.txt")?,
            ip_values: fetch("ip_values.txt")?,
            scheme_headers: fetch("scheme_headers.txt")?,
            url_headers: fetch("url_headers.txt")?,
            url_paths: fetch("url_paths.txt")?,
            port_headers: fetch("port_headers.txt")?,
            ports: fetch("ports.txt")?,
            nginx: fetch("nginx.txt")?,
            haproxy: fetch("haproxy.txt")?,
            path_prefix: fetch("path_prefix.txt")?,
            charmap: parse_charmap(&charmap_text)?,
        })
    }

    /// Recognised table file names (for diagnostics and `-update-payloads`).
    pub fn file_names() -> &'static [&'static str] {
        TABLE_FILES
    }
}

/// One payload per line; blank lines and `#` comments skipped. Trailing `\r`
/// from CRLF files is stripped, interior whitespace is payload content.
pub fn parse_lines(text: &str) -> Vec<String> {
    text.lines()
        .map(|l| l.strip_suffix('\r').unwrap_or(l))
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(str::to_string)
        .collect()
}

/// Parse `letter \t U+XXXX[,U+XXXX…]` lines. Repeated letters accumulate as
/// alternative substitutions.
pub fn parse_charmap(text: &str) -> Result<Vec<CharmapEntry>, TableError> {
    let mut entries = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        let line_no = idx + 1;
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (letter_part, points_part) = line.split_once('\t').ok_or_else(|| {
            TableError::BadCharmap {
                line: line_no,
                reason: "expected `letter<TAB>codepoints`".into(),
            }
        })?;

        let mut letters = letter_part.chars();
        let letter = match (letters.next(), letters.next()) {
            (Some(c), None) if c.is_ascii_alphabetic() => c,
            _ => {
                return Err(TableError::BadCharmap {
                    line: line_no,
                    reason: format!("{letter_part:?} is not a single ASCII letter"),
                })
            }
        };

        let mut substitute = String::new();
        for point in points_part.split(',') {
            let point = point.trim();
            let hex = point.strip_prefix("U+").ok_or_else(|| TableError::BadCharmap {
                line: line_no,
                reason: format!("{point:?} missing U+ prefix"),
            })?;
            let value = u32::from_str_radix(hex, 16).map_err(|_| TableError::BadCharmap {
                line: line_no,
                reason: format!("{point:?} is not hex"),
            })?;
            let c = char::from_u32(value).ok_or_else(|| TableError::BadCharmap {
                line: line_no,
                reason: format!("{point:?} is not a scalar value"),
            })?;
            substitute.push(c);
        }
        entries.push(CharmapEntry { letter, substitute });
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_tables_are_nonempty() {
        let t = TableSet::embedded().unwrap();
        assert!(!t.mid_paths.is_empty());
        assert!(!t.end_paths.is_empty());
        assert!(!t.ip_headers.is_empty());
        assert!(!t.ip_values.is_empty());
        assert!(!t.charmap.is_empty());
    }

    #[test]
    fn comments_and_blanks_skipped() {
        let lines = parse_lines("# comment\n\n..;/\r\n;/\n");
        assert_eq!(lines, vec!["..;/", ";/"]);
    }

    #[test]
    fn charmap_parses_sequences() {
        let entries = parse_charmap("a\tU+FF41\nk\tU+212A,U+0301\n").unwrap();
        assert_eq!(entries[0].letter, 'a');
        assert_eq!(entries[0].substitute, "\u{FF41}");
        assert_eq!(entries[1].substitute, "\u{212A}\u{301}");
    }

    #[test]
    fn charmap_rejects_malformed() {
        assert!(parse_charmap("ab\tU+FF41").is_err());
        assert!(parse_charmap("a U+FF41").is_err());
        assert!(parse_charmap("a\tFF41").is_err());
        assert!(parse_charmap("a\tU+ZZZZ").is_err());
        assert!(parse_charmap("a\tU+D800").is_err());
    }

    #[test]
    fn dir_overlay_replaces_single_table() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("mid_paths.txt"), "onlyone/\n").unwrap();
        let t = TableSet::load_dir(tmp.path()).unwrap();
        assert_eq!(t.mid_paths, vec!["onlyone/"]);
        // Everything else still has embedded content.
        assert!(!t.end_paths.is_empty());
    }

    #[test]
    fn write_defaults_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        TableSet::write_defaults(tmp.path()).unwrap();
        let from_disk = TableSet::load_dir(tmp.path()).unwrap();
        let embedded = TableSet::embedded().unwrap();
        assert_eq!(from_disk.mid_paths, embedded.mid_paths);
        assert_eq!(from_disk.charmap, embedded.charmap);
    }
}
