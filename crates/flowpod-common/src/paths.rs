//! File reference escape syntax
//!
//! Every file reference on a Workflow (`inputs`, `variables`, `data`) may
//! carry a rename target using the `source[:target]` syntax. A literal `:`
//! or `\` inside either half is written as `\:` or `\\`.
//!
//! The source part may itself contain colons, so the separator is the
//! rightmost colon that is not escaped and has a non-empty target after it.
//!
//! Also holds the lexical slash-path helpers used to build in-container
//! paths. They never touch the local filesystem.

/// A file reference split into its source path and optional rename target
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PathSpec {
    /// Path of the file to read, unescaped
    pub source_path: String,
    /// Name the file should be given at its destination, unescaped
    pub target_name: Option<String>,
}

/// Unescape a file reference.
///
/// Replaces every `\:` with `:` and then every `\\` with `\`. The order is
/// fixed: `\\:` becomes `\:` after the first pass and `\:` after the second.
pub fn unescape(text: &str) -> String {
    text.replace("\\:", ":").replace("\\\\", "\\")
}

/// Split `path` into its source path and optional rename target.
///
/// The separator is the rightmost `:` that
/// - is not immediately preceded by a backslash,
/// - has at least one character before it, and
/// - has at least one character after it.
///
/// Without such a colon the whole string is the source path. Both halves
/// are unescaped independently after splitting, so a target is never
/// `Some("")`.
pub fn split(path: &str) -> PathSpec {
    match separator_index(path) {
        Some(idx) => PathSpec {
            source_path: unescape(&path[..idx]),
            target_name: Some(unescape(&path[idx + 1..])),
        },
        None => PathSpec {
            source_path: unescape(path),
            target_name: None,
        },
    }
}

fn separator_index(path: &str) -> Option<usize> {
    let bytes = path.as_bytes();
    (1..bytes.len().saturating_sub(1))
        .rev()
        .find(|&i| bytes[i] == b':' && bytes[i - 1] != b'\\')
}

/// Lexically clean a slash-separated path.
///
/// Collapses repeated slashes, drops `.` elements and resolves `..` against
/// the preceding element. A rooted path never climbs above `/`. An empty
/// result is `.` (or `/` when rooted).
pub fn clean(path: &str) -> String {
    let rooted = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();

    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                if parts.last().is_some_and(|last| *last != "..") {
                    parts.pop();
                } else if !rooted {
                    parts.push("..");
                }
            }
            other => parts.push(other),
        }
    }

    let joined = parts.join("/");
    match (rooted, joined.is_empty()) {
        (true, _) => format!("/{joined}"),
        (false, true) => ".".to_string(),
        (false, false) => joined,
    }
}

/// Join path elements with `/` and clean the result.
///
/// Empty elements are skipped; joining only empty elements gives `""`.
pub fn join<'a>(elements: impl IntoIterator<Item = &'a str>) -> String {
    let parts: Vec<&str> = elements.into_iter().filter(|e| !e.is_empty()).collect();
    if parts.is_empty() {
        return String::new();
    }
    clean(&parts.join("/"))
}

/// Last element of a slash-separated path, ignoring trailing slashes
pub fn base_name(path: &str) -> &str {
    if path.is_empty() {
        return ".";
    }
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return "/";
    }
    match trimmed.rfind('/') {
        Some(idx) => &trimmed[idx + 1..],
        None => trimmed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(source: &str, target: Option<&str>) -> PathSpec {
        PathSpec {
            source_path: source.to_string(),
            target_name: target.map(str::to_string),
        }
    }

    #[test]
    fn plain_path_has_no_target() {
        assert_eq!(split("/hello/world"), spec("/hello/world", None));
    }

    #[test]
    fn colon_separates_rename_target() {
        assert_eq!(
            split("/hello/world:other"),
            spec("/hello/world", Some("other"))
        );
    }

    #[test]
    fn escaped_leading_colon_is_part_of_source() {
        assert_eq!(split("\\:escaped"), spec(":escaped", None));
    }

    #[test]
    fn escaped_colon_then_rename() {
        assert_eq!(
            split("\\:escaped:renamed"),
            spec(":escaped", Some("renamed"))
        );
    }

    #[test]
    fn rightmost_unescaped_colon_wins() {
        assert_eq!(split("a:b:c"), spec("a:b", Some("c")));
        assert_eq!(
            split("s3\\:bucket/key:dir\\:name"),
            spec("s3:bucket/key", Some("dir:name"))
        );
    }

    #[test]
    fn multiple_escaped_colons_before_separator() {
        assert_eq!(
            split("x\\:y\\:z:final"),
            spec("x:y:z", Some("final"))
        );
        assert_eq!(split("x\\:y\\:z"), spec("x:y:z", None));
    }

    #[test]
    fn trailing_colon_is_not_a_separator() {
        assert_eq!(split("/data/file:"), spec("/data/file:", None));
    }

    #[test]
    fn leading_colon_is_not_a_separator() {
        assert_eq!(split(":target"), spec(":target", None));
    }

    #[test]
    fn single_character_source_splits() {
        assert_eq!(split("a:b"), spec("a", Some("b")));
    }

    #[test]
    fn escaped_trailing_colon_falls_back_to_earlier_separator() {
        assert_eq!(split("a:b\\:"), spec("a", Some("b:")));
    }

    #[test]
    fn strings_without_unescaped_colon_round_through_unescape() {
        for s in [
            "/plain/path",
            "rel/path.txt",
            "with\\:escaped",
            "back\\\\slash",
            "",
            "x",
        ] {
            assert_eq!(split(s), spec(&unescape(s), None), "input {s:?}");
        }
    }

    #[test]
    fn unescape_replaces_colon_before_backslash() {
        assert_eq!(unescape("\\:"), ":");
        assert_eq!(unescape("\\\\"), "\\");
        // `\\:` contains `\:` at offset 1, which is replaced first
        assert_eq!(unescape("\\\\:"), "\\:");
    }

    #[test]
    fn double_backslash_before_colon_still_blocks_split() {
        // The colon is preceded by a backslash character, so it never separates
        assert_eq!(split("ab\\\\:c"), spec("ab\\:c", None));
    }

    #[test]
    fn clean_collapses_and_resolves() {
        assert_eq!(clean("/mnt//package/./repo"), "/mnt/package/repo");
        assert_eq!(clean("/mnt/package/../other"), "/mnt/other");
        assert_eq!(clean("/../x"), "/x");
        assert_eq!(clean("a/../../b"), "../b");
        assert_eq!(clean(""), ".");
        assert_eq!(clean("/"), "/");
        assert_eq!(clean("dir/"), "dir");
    }

    #[test]
    fn join_skips_empty_elements() {
        assert_eq!(join(["/mnt/package", "repo.git"]), "/mnt/package/repo.git");
        assert_eq!(join(["/tmp/workdir/", "", "run.instance"]), "/tmp/workdir/run.instance");
        assert_eq!(join(["/mnt/package/repo", "../shared"]), "/mnt/package/shared");
        assert_eq!(join(["", ""]), "");
    }

    #[test]
    fn base_name_of_urls_and_paths() {
        assert_eq!(base_name("https://example.com/org/repo.git"), "repo.git");
        assert_eq!(base_name("git@github.com:org/repo.git"), "repo.git");
        assert_eq!(base_name("/a/b/"), "b");
        assert_eq!(base_name("plain"), "plain");
        assert_eq!(base_name("///"), "/");
        assert_eq!(base_name(""), ".");
    }
}
