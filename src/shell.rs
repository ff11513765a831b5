//! Building the remote shell command line.
//!
//! Every value that reaches the remote shell goes through
//! [`shell_escape::unix::escape`], so credentials containing quotes, `$` or
//! backticks arrive at the script unchanged.

use std::borrow::Cow;

use shell_escape::unix::escape;

/// Quote a single word for a POSIX shell.
pub fn quote(s: &str) -> String {
    escape(Cow::Borrowed(s)).into_owned()
}

/// `NAME=value` assignments followed by the command, e.g.
/// `a='x y' b=z /tmp/run.sh`. Names are emitted as-is and must be valid
/// shell identifiers.
pub fn with_env(vars: &[(&str, &str)], command: &str) -> String {
    let mut out = String::new();
    for (name, value) in vars {
        out.push_str(name);
        out.push('=');
        out.push_str(&quote(value));
        out.push(' ');
    }
    out.push_str(command);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_plain_word_unchanged() {
        assert_eq!(quote("root"), "root");
        assert_eq!(quote("/tmp/shutdown.ps1"), "/tmp/shutdown.ps1");
    }

    #[test]
    fn test_quote_spaces_and_metacharacters() {
        assert_eq!(quote("my vm"), "'my vm'");
        assert_eq!(quote("pa$$"), "'pa$$'");
        assert_eq!(quote("`reboot`"), "'`reboot`'");
    }

    #[test]
    fn test_quote_single_quote() {
        assert_eq!(quote("it's"), "'it'\\''s'");
    }

    #[test]
    fn test_quote_empty() {
        assert_eq!(quote(""), "''");
    }

    #[test]
    fn test_with_env_orders_assignments() {
        let cmd = with_env(&[("a", "1"), ("b", "two words")], "/tmp/run.sh");
        assert_eq!(cmd, "a=1 b='two words' /tmp/run.sh");
    }

    #[test]
    fn test_with_env_no_vars() {
        assert_eq!(with_env(&[], "true"), "true");
    }
}
