//! CTCP `ACTION` support.
//!
//! Only ACTION matters to the bridge: it is how `/me` travels on IRC.
//! Other CTCP requests are passed through as ordinary text.

const DELIM: char = '\x01';

/// Wrap text as a CTCP ACTION payload.
pub fn wrap_action(text: &str) -> String {
    format!("{DELIM}ACTION {text}{DELIM}")
}

/// If `text` is a CTCP ACTION, return its body.
///
/// The trailing delimiter is optional since some clients omit it.
pub fn action_text(text: &str) -> Option<&str> {
    let body = text.strip_prefix(DELIM)?;
    let body = body.strip_suffix(DELIM).unwrap_or(body);
    let (verb, rest) = match body.split_once(' ') {
        Some((verb, rest)) => (verb, rest),
        None => (body, ""),
    };
    verb.eq_ignore_ascii_case("ACTION").then_some(rest)
}
