//! Path-rewriting modules: the mutations that operate purely on the request
//! target. All of them split the raw URI into path and query once, mutate
//! the path, and re-append the query bytes untouched — repeated slashes,
//! stray escapes and params included.

use crate::{ModuleOpts, PayloadIter, Seed};
use gatecrash_payload::TargetUrl;
use std::sync::Arc;

/// Split the raw URI at the first `?`. The tail keeps its `?` so
/// reassembly is pure concatenation.
fn split_query(target: &TargetUrl) -> (String, String) {
    let path = target.path_portion().to_string();
    let tail = target.raw_uri[path.len()..].to_string();
    (path, tail)
}

/// Exactly one payload: the unmodified target, used as the baseline.
pub(crate) fn dumb_check(target: &TargetUrl) -> PayloadIter {
    let seed = Seed::new("dumb_check", target);
    Box::new(std::iter::once(seed.plain()))
}

/// Insert each mid-path payload after every `/` in the path. Empty segments
/// and trailing slashes are boundaries like any other; nothing collapses.
pub(crate) fn mid_paths(target: &TargetUrl, opts: &ModuleOpts) -> PayloadIter {
    let seed = Seed::new("mid_paths", target);
    let (path, tail) = split_query(target);
    let path: Arc<str> = path.into();
    let tail: Arc<str> = tail.into();
    let table: Arc<[String]> = opts.tables.mid_paths.clone().into();

    let boundaries: Vec<usize> = path
        .bytes()
        .enumerate()
        .filter_map(|(i, b)| (b == b'/').then_some(i))
        .collect();

    Box::new(boundaries.into_iter().flat_map(move |slash| {
        let path = path.clone();
        let tail = tail.clone();
        let table = table.clone();
        let seed = seed.clone();
        (0..table.len()).map(move |pi| {
            let insert = &table[pi];
            let mutated = format!(
                "{}{}{}{}",
                &path[..=slash],
                insert,
                &path[slash + 1..],
                tail
            );
            seed.with_uri(mutated)
        })
    }))
}

/// Append each suffix payload to the path, before any query string.
pub(crate) fn end_paths(target: &TargetUrl, opts: &ModuleOpts) -> PayloadIter {
    let seed = Seed::new("end_paths", target);
    let (path, tail) = split_query(target);
    let table = opts.tables.end_paths.clone();

    Box::new(table.into_iter().map(move |suffix| {
        seed.with_uri(format!("{path}{suffix}{tail}"))
    }))
}

/// One payload per alphabetic path byte: the lowercased path with exactly
/// that byte uppercased. Candidates equal to the original target are
/// skipped, so `/Admin` starts at `/aDmin`, not itself.
pub(crate) fn case_substitution(target: &TargetUrl) -> PayloadIter {
    let seed = Seed::new("case_substitution", target);
    let (path, tail) = split_query(target);
    let lower = path.to_ascii_lowercase();

    let positions: Vec<usize> = path
        .bytes()
        .enumerate()
        .filter_map(|(i, b)| b.is_ascii_alphabetic().then_some(i))
        .collect();

    Box::new(positions.into_iter().filter_map(move |i| {
        let mut candidate = lower.clone().into_bytes();
        candidate[i] = candidate[i].to_ascii_uppercase();
        // lower is ASCII-lowercased path bytes, still valid UTF-8.
        let candidate = String::from_utf8(candidate).expect("ascii case toggle");
        if candidate == path {
            return None;
        }
        Some(seed.with_uri(format!("{candidate}{tail}")))
    }))
}

const RESERVED: &[u8] = b"/%:?#[]@!$&'()*+,;=";

/// Percent-encode one eligible path character at a time: `%XX` and `%xx`,
/// plus the double-encoded `%25XX` / `%25xx` forms. Multi-byte characters
/// encode every UTF-8 byte of that character in one payload.
pub(crate) fn char_encode(target: &TargetUrl) -> PayloadIter {
    let seed = Seed::new("char_encode", target);
    let (path, tail) = split_query(target);
    let path: Arc<str> = path.into();
    let tail: Arc<str> = tail.into();

    let positions: Vec<(usize, char)> = path
        .char_indices()
        .filter(|(_, c)| !(c.is_ascii() && RESERVED.contains(&(*c as u8))))
        .collect();

    Box::new(positions.into_iter().flat_map(move |(i, c)| {
        let mut buf = [0u8; 4];
        let bytes = c.encode_utf8(&mut buf).as_bytes();

        let upper: String = bytes.iter().map(|b| format!("%{b:02X}")).collect();
        let lower: String = bytes.iter().map(|b| format!("%{b:02x}")).collect();
        let double_upper: String = bytes.iter().map(|b| format!("%25{b:02X}")).collect();
        let double_lower: String = bytes.iter().map(|b| format!("%25{b:02x}")).collect();
        let mut variants = vec![upper.clone(), double_upper];
        if lower != upper {
            variants.insert(1, lower);
            variants.push(double_lower);
        }

        let path = path.clone();
        let tail = tail.clone();
        let seed = seed.clone();
        let width = c.len_utf8();
        variants.into_iter().map(move |encoded| {
            let mutated = format!("{}{}{}{}", &path[..i], encoded, &path[i + width..], tail);
            seed.with_uri(mutated)
        })
    }))
}

/// Swap one path letter at a time for a Unicode sequence that NFKC-folds
/// back to it, walking the charmap alternatives for that letter.
pub(crate) fn unicode_path_normalization(target: &TargetUrl, opts: &ModuleOpts) -> PayloadIter {
    let seed = Seed::new("unicode_path_normalization", target);
    let (path, tail) = split_query(target);
    let path: Arc<str> = path.into();
    let tail: Arc<str> = tail.into();
    let charmap: Arc<[crate::CharmapEntry]> = opts.tables.charmap.clone().into();

    let positions: Vec<(usize, char)> = path
        .char_indices()
        .filter(|(_, c)| c.is_ascii_alphabetic())
        .collect();

    Box::new(positions.into_iter().flat_map(move |(i, letter)| {
        let path = path.clone();
        let tail = tail.clone();
        let charmap = charmap.clone();
        let seed = seed.clone();
        (0..charmap.len()).filter_map(move |ci| {
            let entry = &charmap[ci];
            if entry.letter != letter {
                return None;
            }
            let mutated = format!(
                "{}{}{}{}",
                &path[..i],
                entry.substitute,
                &path[i + letter.len_utf8()..],
                tail
            );
            Some(seed.with_uri(mutated))
        })
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TableSet;
    use std::sync::Arc;

    fn opts() -> ModuleOpts {
        ModuleOpts::new(Arc::new(TableSet::embedded().unwrap()))
    }

    fn uris(iter: PayloadIter) -> Vec<String> {
        iter.map(|p| p.raw_uri).collect()
    }

    #[test]
    fn dumb_check_is_identity() {
        let t = TargetUrl::parse("http://127.0.0.1:8080/admin/..;/").unwrap();
        let got = uris(dumb_check(&t));
        assert_eq!(got, vec!["/admin/..;/"]);
    }

    #[test]
    fn mid_paths_inserts_at_every_boundary() {
        let t = TargetUrl::parse("http://h/a/b").unwrap();
        let mut o = opts();
        let tables = TableSet {
            mid_paths: vec!["X/".into()],
            ..(*o.tables).clone()
        };
        o.tables = Arc::new(tables);
        let got = uris(mid_paths(&t, &o));
        assert_eq!(got, vec!["/X/a/b", "/a/X/b"]);
    }

    #[test]
    fn mid_paths_keeps_empty_segments() {
        let t = TargetUrl::parse("http://h/a//b").unwrap();
        let mut o = opts();
        o.tables = Arc::new(TableSet {
            mid_paths: vec!["X/".into()],
            ..(*o.tables).clone()
        });
        let got = uris(mid_paths(&t, &o));
        assert_eq!(got, vec!["/X/a//b", "/a/X//b", "/a//X/b"]);
    }

    #[test]
    fn mid_paths_preserves_query() {
        let t = TargetUrl::parse("http://h/a?q=1").unwrap();
        let mut o = opts();
        o.tables = Arc::new(TableSet {
            mid_paths: vec!["..;/".into()],
            ..(*o.tables).clone()
        });
        let got = uris(mid_paths(&t, &o));
        assert_eq!(got, vec!["/..;/a?q=1"]);
    }

    #[test]
    fn end_paths_appends_before_query() {
        let t = TargetUrl::parse("http://h/admin?x=1").unwrap();
        let mut o = opts();
        o.tables = Arc::new(TableSet {
            end_paths: vec!["/;foo".into()],
            ..(*o.tables).clone()
        });
        let got = uris(end_paths(&t, &o));
        assert_eq!(got, vec!["/admin/;foo?x=1"]);
    }

    #[test]
    fn case_substitution_first_payload() {
        let t = TargetUrl::parse("http://127.0.0.1:8080/Admin").unwrap();
        let got = uris(case_substitution(&t));
        assert_eq!(got.first().map(String::as_str), Some("/aDmin"));
        // Five letters, one candidate collides with the input.
        assert_eq!(got.len(), 4);
    }

    #[test]
    fn case_substitution_all_lowercase_input() {
        let t = TargetUrl::parse("http://h/ab").unwrap();
        let got = uris(case_substitution(&t));
        assert_eq!(got, vec!["/Ab", "/aB"]);
    }

    #[test]
    fn char_encode_variants_for_letter() {
        let t = TargetUrl::parse("http://h/a").unwrap();
        let got = uris(char_encode(&t));
        assert_eq!(got, vec!["/%61", "/%2561"]);
    }

    #[test]
    fn char_encode_skips_reserved() {
        let t = TargetUrl::parse("http://h/;=").unwrap();
        assert!(uris(char_encode(&t)).is_empty());
    }

    #[test]
    fn char_encode_preserves_query() {
        let t = TargetUrl::parse("http://h/a?b=c").unwrap();
        let got = uris(char_encode(&t));
        assert!(got.iter().all(|u| u.ends_with("?b=c")));
        // Query bytes themselves are never encoded.
        assert_eq!(got.len(), 2);
    }

    #[test]
    fn unicode_substitutes_single_letters() {
        let t = TargetUrl::parse("http://h/ab").unwrap();
        let mut o = opts();
        o.tables = Arc::new(TableSet {
            charmap: vec![
                crate::CharmapEntry {
                    letter: 'a',
                    substitute: "\u{FF41}".into(),
                },
                crate::CharmapEntry {
                    letter: 'a',
                    substitute: "\u{1D43}".into(),
                },
            ],
            ..(*o.tables).clone()
        });
        let got = uris(unicode_path_normalization(&t, &o));
        assert_eq!(got, vec!["/\u{FF41}b", "/\u{1D43}b"]);
    }

    #[test]
    fn boundary_uris_survive() {
        for raw in ["/", "/..;/", "/%2e%2e/", "/a//b"] {
            let t = TargetUrl::parse(&format!("http://h{raw}")).unwrap();
            let got = uris(dumb_check(&t));
            assert_eq!(got, vec![raw.to_string()]);
        }
    }
}
