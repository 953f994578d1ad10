use sandfs_protocol::PatternKind;

use crate::normalize::normalize;
use crate::normalize::segments;

/// Whether `pattern` (interpreted as `kind`) matches the already-normalized
/// `path`, per the matching rules in the permission engine contract.
pub fn matches(pattern: &str, kind: PatternKind, path: &str) -> bool {
    let pattern = normalize(pattern);
    match kind {
        PatternKind::File => pattern == path,
        PatternKind::Directory => path == pattern || path.starts_with(&format!("{pattern}/")),
        PatternKind::Glob => glob_match(&pattern, path),
    }
}

/// Length of the concrete (non-wildcard) prefix of a rule's pattern, used as
/// the final specificity tie-breaker. `File`/`Directory` patterns have no
/// wildcards, so their whole normalized length counts.
pub fn specificity(pattern: &str, kind: PatternKind) -> usize {
    let pattern = normalize(pattern);
    match kind {
        PatternKind::File | PatternKind::Directory => pattern.len(),
        PatternKind::Glob => {
            let segs = segments(&pattern);
            let mut prefix_len = 0;
            for seg in segs {
                if seg == "**" || seg.contains('*') {
                    break;
                }
                prefix_len += seg.len() + 1;
            }
            prefix_len
        }
    }
}

fn glob_match(pattern: &str, path: &str) -> bool {
    let pattern_segs = segments(pattern);
    let path_segs = segments(path);
    match_segments(&pattern_segs, &path_segs)
}

fn match_segments(pattern: &[&str], path: &[&str]) -> bool {
    match pattern.first() {
        None => path.is_empty(),
        Some(&"**") => {
            if match_segments(&pattern[1..], path) {
                return true;
            }
            match path.split_first() {
                Some((_, rest)) => match_segments(pattern, rest),
                None => false,
            }
        }
        Some(seg) => match path.split_first() {
            Some((head, rest)) => segment_matches(seg, head) && match_segments(&pattern[1..], rest),
            None => false,
        },
    }
}

/// Matches a single path segment against a pattern segment containing at
/// most the `*` wildcard (matches any run of characters, including none).
fn segment_matches(pattern: &str, text: &str) -> bool {
    match_bytes(pattern.as_bytes(), text.as_bytes())
}

fn match_bytes(pattern: &[u8], text: &[u8]) -> bool {
    match (pattern.first(), text.first()) {
        (None, None) => true,
        (None, Some(_)) => false,
        (Some(b'*'), _) => {
            match_bytes(&pattern[1..], text) || (!text.is_empty() && match_bytes(pattern, &text[1..]))
        }
        (Some(_), None) => false,
        (Some(p), Some(t)) if p == t => match_bytes(&pattern[1..], &text[1..]),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn file_matches_exact_only() {
        assert!(matches("/secrets/k", PatternKind::File, "/secrets/k"));
        assert!(!matches("/secrets/k", PatternKind::File, "/secrets/k2"));
        assert!(!matches("/secrets/k", PatternKind::File, "/secrets"));
    }

    #[test]
    fn directory_matches_self_and_descendants() {
        assert!(matches("/secrets", PatternKind::Directory, "/secrets"));
        assert!(matches("/secrets/", PatternKind::Directory, "/secrets/k"));
        assert!(!matches("/secrets", PatternKind::Directory, "/secretsplus"));
    }

    #[test]
    fn glob_double_star_suffix() {
        assert!(matches("/**/*.key", PatternKind::Glob, "/secrets/public.key"));
        assert!(matches("/**/*.key", PatternKind::Glob, "/public.key"));
        assert!(!matches("/**/*.key", PatternKind::Glob, "/secrets/public.pem"));
    }

    #[test]
    fn glob_prefix_and_everything_under() {
        assert!(matches("/output/**", PatternKind::Glob, "/output"));
        assert!(matches("/output/**", PatternKind::Glob, "/output/a/b.txt"));
        assert!(!matches("/output/**", PatternKind::Glob, "/outputs/a"));
    }

    #[test]
    fn glob_prefix_double_star_suffix() {
        assert!(matches("/x/**/y", PatternKind::Glob, "/x/y"));
        assert!(matches("/x/**/y", PatternKind::Glob, "/x/a/b/y"));
        assert!(!matches("/x/**/y", PatternKind::Glob, "/x/a/b/z"));
    }

    #[test]
    fn glob_everything() {
        assert!(matches("/**/*", PatternKind::Glob, "/a/b/c"));
        assert!(matches("/**/*", PatternKind::Glob, "/a"));
    }

    #[test]
    fn specificity_prefers_longer_literal_prefix() {
        let a = specificity("/secrets/**", PatternKind::Glob);
        let b = specificity("/**", PatternKind::Glob);
        assert!(a > b);
    }
}
