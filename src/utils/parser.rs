//! Line-oriented parsing for the free-text project fields.
//!
//! Command lists and variable blocks are stored as multi-line text. Blank
//! lines and lines starting with `#` or `//` are comments.

use regex::Regex;
use std::sync::LazyLock;

static ENV_KEY_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap());

fn is_comment(line: &str) -> bool {
    line.starts_with('#') || line.starts_with("//")
}

/// Split a multi-line command block into the commands it contains.
///
/// Order is preserved and every command is trimmed.
pub fn parse_commands(block: &str) -> Vec<String> {
    block
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !is_comment(line))
        .map(str::to_string)
        .collect()
}

/// Whether `key` is usable as a shell variable name.
pub fn is_env_key(key: &str) -> bool {
    ENV_KEY_PATTERN.is_match(key)
}

/// Parse `KEY=value` lines into ordered pairs.
///
/// Lines without `=` or with a key that is not a valid shell identifier are
/// skipped. Only the first `=` separates key from value.
pub fn parse_key_values(block: &str) -> Vec<(String, String)> {
    parse_commands(block)
        .into_iter()
        .filter_map(|line| {
            let (key, value) = line.split_once('=')?;
            let key = key.trim();
            if !is_env_key(key) {
                return None;
            }
            Some((key.to_string(), value.trim().to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_commands_skips_comments_and_blanks() {
        let block = "\n  npm ci  \n# install deps\n\n// build next\nnpm run build\n   \n  ./bin/check --fast\n";
        assert_eq!(
            parse_commands(block),
            vec!["npm ci", "npm run build", "./bin/check --fast"]
        );
    }

    #[test]
    fn parse_commands_empty_input() {
        assert!(parse_commands("").is_empty());
        assert!(parse_commands("   \n\t\n").is_empty());
    }

    #[test]
    fn parse_commands_keeps_single_slash() {
        assert_eq!(parse_commands("/usr/bin/env true"), vec!["/usr/bin/env true"]);
    }

    #[test]
    fn parse_commands_handles_crlf() {
        assert_eq!(parse_commands("a\r\nb\r\n"), vec!["a", "b"]);
    }

    #[test]
    fn parse_key_values_splits_on_first_equals() {
        let block = "APP_ENV = production\n# NOPE=1\nDSN=postgres://u:p@h/db?x=1\nnot a pair\n1BAD=x\n";
        assert_eq!(
            parse_key_values(block),
            vec![
                ("APP_ENV".to_string(), "production".to_string()),
                ("DSN".to_string(), "postgres://u:p@h/db?x=1".to_string()),
            ]
        );
    }

    #[test]
    fn env_key_validation() {
        assert!(is_env_key("_PRIVATE"));
        assert!(is_env_key("A1"));
        assert!(!is_env_key("A-B"));
        assert!(!is_env_key(""));
        assert!(!is_env_key("$(rm)"));
    }
}
