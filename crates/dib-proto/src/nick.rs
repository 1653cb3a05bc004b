//! Nickname validation and sanitisation per RFC 2812 §2.3.1.
//!
//! Discord names are arbitrary Unicode; IRC nicknames are not. The bridge
//! derives a nickname by stripping everything outside the RFC set and then
//! fixing up the first character.

/// Default maximum nickname length (modern servers advertise `NICKLEN=30`).
pub const DEFAULT_NICK_MAX_LEN: usize = 30;

/// `[ ] \ ` ^ _ { | }`
#[inline]
fn is_special(c: char) -> bool {
    matches!(c, '[' | ']' | '\\' | '`' | '_' | '^' | '{' | '|' | '}')
}

#[inline]
fn is_nick_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || is_special(c) || c == '-'
}

/// Strip characters that cannot appear in a nickname.
///
/// A leading digit or hyphen gets an `_` prepended. The result may be empty
/// when nothing in `source` survives; callers pick a fallback.
pub fn sanitize_nick(source: &str) -> String {
    let mut out: String = source.chars().filter(|c| is_nick_char(*c)).collect();
    if out.starts_with(|c: char| c.is_ascii_digit() || c == '-') {
        out.insert(0, '_');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_unicode_and_spaces() {
        assert_eq!(sanitize_nick("Bob Smith"), "BobSmith");
        assert_eq!(sanitize_nick("zoë ☕"), "zo");
        assert_eq!(sanitize_nick("42isTheAnswer"), "_42isTheAnswer");
        assert_eq!(sanitize_nick("-dash"), "_-dash");
        assert_eq!(sanitize_nick("☕☕"), "");
    }

    #[test]
    fn sanitized_output_is_a_legal_nick() {
        for raw in ["Bob", "[x]", "9lives", "ünïcode-name"] {
            let nick = sanitize_nick(raw);
            let first = nick.chars().next().unwrap();
            assert!(first.is_ascii_alphabetic() || is_special(first), "{raw:?} -> {nick:?}");
            assert!(nick.chars().all(is_nick_char), "{raw:?} -> {nick:?}");
        }
    }
}
