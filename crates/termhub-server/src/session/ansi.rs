//! Terminal control-sequence stripping for plain-text previews.

use regex::Regex;
use std::borrow::Cow;
use std::sync::OnceLock;

/// CSI, OSC, string (DCS/SOS/PM/APC), charset, two-byte escapes, then
/// leftover C0 controls. `\t` and `\n` survive; `\r` does not.
const CONTROL_PATTERN: &str = concat!(
    r"\x1b\[[0-?]*[ -/]*[@-~]",
    r"|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)",
    r"|\x1b[PX^_][^\x1b]*\x1b\\",
    r"|\x1b[()*+][0-9A-Za-z]",
    r"|\x1b[@-Z\\-_=>78c]",
    r"|[\x00-\x08\x0b-\x1f\x7f]",
);

fn control_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(CONTROL_PATTERN).expect("control pattern is valid"))
}

/// Remove terminal control sequences, leaving human-readable text.
pub fn strip_control(text: &str) -> Cow<'_, str> {
    control_regex().replace_all(text, "")
}

/// Byte offset of a trailing escape sequence that has not been terminated
/// yet, if `text` ends inside one.
pub fn incomplete_escape_start(text: &str) -> Option<usize> {
    let bytes = text.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != 0x1b {
            i += 1;
            continue;
        }
        match escape_len(&bytes[i..]) {
            Some(len) => i += len,
            None => return Some(i),
        }
    }
    None
}

/// Length of the escape sequence at the start of `seq`, or `None` when the
/// input ends before the sequence does.
fn escape_len(seq: &[u8]) -> Option<usize> {
    let string_end = |from: usize, bel: bool| {
        for (j, &b) in seq.iter().enumerate().skip(from) {
            match b {
                0x07 if bel => return Some(j + 1),
                0x1b => return (j + 1 < seq.len()).then_some(j + 2),
                _ => {}
            }
        }
        None
    };

    match *seq.get(1)? {
        b'[' => seq[2..]
            .iter()
            .position(|b| (0x40..=0x7e).contains(b))
            .map(|p| p + 3),
        b']' => string_end(2, true),
        b'P' | b'X' | b'^' | b'_' => string_end(2, false),
        b'(' | b')' | b'*' | b'+' => (seq.len() > 2).then_some(3),
        _ => Some(2),
    }
}
