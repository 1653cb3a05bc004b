//! RFC 1459 case mapping.
//!
//! Besides ASCII letters, `[]\~` fold onto `{}|^`. Nick reservations in the
//! bridge are keyed by the folded form so `Bob[d]` and `bob{d}` collide the
//! same way the server would make them collide.

#[inline]
const fn fold(c: char) -> char {
    match c {
        'A'..='Z' => (c as u8 + 32) as char,
        '[' => '{',
        ']' => '}',
        '\\' => '|',
        '~' => '^',
        _ => c,
    }
}

/// Fold a string with the RFC 1459 mapping.
pub fn irc_to_lower(s: &str) -> String {
    s.chars().map(fold).collect()
}

/// Case-insensitive comparison under the RFC 1459 mapping.
pub fn irc_eq(a: &str, b: &str) -> bool {
    a.len() == b.len() && a.chars().zip(b.chars()).all(|(x, y)| fold(x) == fold(y))
}
