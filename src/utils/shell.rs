//! Shell escaping and command composition.

/// Escape a value for use inside single quotes.
/// Replaces `'` with `'\''` (end quote, escaped quote, start quote).
pub fn escape_single_quote_content(value: &str) -> String {
    value.replace('\'', "'\\''")
}

/// Quote a single argument for shell execution.
/// - Empty strings become `''`
/// - Strings with shell metacharacters are wrapped in single quotes
/// - Embedded single quotes are escaped
pub fn quote_arg(arg: &str) -> String {
    if arg.is_empty() {
        return "''".to_string();
    }

    const SHELL_META: &[char] = &[
        ' ', '\t', '\n', '\'', '"', '\\', '$', '`', '!', '*', '?', '[', ']', '(', ')', '{', '}',
        '<', '>', '|', '&', ';', '#', '~',
    ];

    if !arg.contains(SHELL_META) {
        return arg.to_string();
    }

    format!("'{}'", escape_single_quote_content(arg))
}

/// Quote a path for shell execution (always quotes).
pub fn quote_path(path: &str) -> String {
    format!("'{}'", escape_single_quote_content(path))
}

/// Prefix `command` with `cd <dir> &&`.
pub fn in_dir(dir: &str, command: &str) -> String {
    format!("cd {} && {}", quote_path(dir), command)
}

/// Prefix `command` with an `export` of every pair.
///
/// Used where the environment cannot be passed to the process directly,
/// e.g. over an ssh session. Keys are expected to be valid identifiers.
pub fn with_exports(pairs: &[(String, String)], command: &str) -> String {
    if pairs.is_empty() {
        return command.to_string();
    }
    let exports = pairs
        .iter()
        .map(|(key, value)| format!("{}={}", key, quote_path(value)))
        .collect::<Vec<_>>()
        .join(" ");
    format!("export {}; {}", exports, command)
}

/// Parent directory of a POSIX path, `/` for top-level entries.
pub fn posix_parent(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) => "/",
        Some(idx) => &trimmed[..idx],
        None => ".",
    }
}

/// Join POSIX path segments without touching the local filesystem rules.
pub fn posix_join(base: &str, name: &str) -> String {
    if base.is_empty() {
        return name.to_string();
    }
    format!("{}/{}", base.trim_end_matches('/'), name.trim_start_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quote_arg_simple() {
        assert_eq!(quote_arg("release"), "release");
    }

    #[test]
    fn quote_arg_with_spaces() {
        assert_eq!(quote_arg("hello world"), "'hello world'");
    }

    #[test]
    fn quote_arg_with_single_quote() {
        assert_eq!(quote_arg("it's"), "'it'\\''s'");
    }

    #[test]
    fn quote_arg_empty() {
        assert_eq!(quote_arg(""), "''");
    }

    #[test]
    fn quote_path_with_quote() {
        assert_eq!(quote_path("/var/www/it's"), "'/var/www/it'\\''s'");
    }

    #[test]
    fn in_dir_quotes_directory() {
        assert_eq!(
            in_dir("/srv/app releases", "make"),
            "cd '/srv/app releases' && make"
        );
    }

    #[test]
    fn with_exports_quotes_values() {
        let pairs = vec![
            ("TASK_ID".to_string(), "12".to_string()),
            ("NOTE".to_string(), "it's live".to_string()),
        ];
        assert_eq!(
            with_exports(&pairs, "env"),
            "export TASK_ID='12' NOTE='it'\\''s live'; env"
        );
    }

    #[test]
    fn with_exports_empty_is_passthrough() {
        assert_eq!(with_exports(&[], "uptime"), "uptime");
    }

    #[test]
    fn posix_parent_cases() {
        assert_eq!(posix_parent("/srv/app/current"), "/srv/app");
        assert_eq!(posix_parent("/srv/app/current/"), "/srv/app");
        assert_eq!(posix_parent("/current"), "/");
        assert_eq!(posix_parent("current"), ".");
    }

    #[test]
    fn posix_join_cases() {
        assert_eq!(posix_join("/srv/releases/", "1_2_x"), "/srv/releases/1_2_x");
        assert_eq!(posix_join("", "a"), "a");
    }
}
