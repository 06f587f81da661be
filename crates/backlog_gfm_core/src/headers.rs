use serde::Serialize;
use tracing::debug;

/// GFM only recognises ATX headers up to level six.
pub const MAX_HEADER_LEVEL: usize = 6;

/// Outcome of running [`normalize_headers`] over one body of text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HeaderFixResult {
    pub content: String,
    pub changed: bool,
    pub change_count: usize,
}

impl HeaderFixResult {
    fn unchanged(content: &str) -> Self {
        Self {
            content: content.to_string(),
            changed: false,
            change_count: 0,
        }
    }
}

/// Insert a single space after the leading `#` run of every line that starts
/// with 1-6 `#` immediately followed by a non-whitespace, non-`#` character.
///
/// Only column-0 header tokens are touched. Lines with seven or more leading
/// `#` are left alone, and the rest of every line is preserved byte for byte,
/// including `\r` before a line feed.
pub fn normalize_headers(content: &str) -> HeaderFixResult {
    if content.is_empty() {
        return HeaderFixResult::unchanged(content);
    }

    let mut output = String::with_capacity(content.len() + 16);
    let mut change_count = 0usize;

    for (index, line) in content.split('\n').enumerate() {
        if index > 0 {
            output.push('\n');
        }
        match unspaced_header_level(line) {
            Some(level) => {
                let (hashes, rest) = line.split_at(level);
                output.push_str(hashes);
                output.push(' ');
                output.push_str(rest);
                change_count += 1;
                debug!(
                    line = index + 1,
                    "fixed header: \"{}\" -> \"{} {}\"",
                    preview(line),
                    hashes,
                    preview(rest)
                );
            }
            None => output.push_str(line),
        }
    }

    if change_count == 0 {
        return HeaderFixResult::unchanged(content);
    }

    HeaderFixResult {
        content: output,
        changed: true,
        change_count,
    }
}

/// Cheap check used by `check` before diffing: does any line still need a space after `#`?
pub fn has_unspaced_headers(content: &str) -> bool {
    content
        .split('\n')
        .any(|line| unspaced_header_level(line).is_some())
}

/// Returns the header level when `line` opens with an unspaced ATX header.
fn unspaced_header_level(line: &str) -> Option<usize> {
    let level = line.bytes().take_while(|byte| *byte == b'#').count();
    if level == 0 || level > MAX_HEADER_LEVEL {
        return None;
    }
    let next = line[level..].chars().next()?;
    if is_header_separator(next) {
        return None;
    }
    Some(level)
}

/// Characters that already separate `#` from the heading text: ASCII blanks,
/// the Unicode space separators, U+2028/U+2029 and U+FEFF. Unlike
/// `char::is_whitespace`, U+0085 is not one of them.
fn is_header_separator(ch: char) -> bool {
    matches!(
        ch,
        '\t' | '\n'
            | '\u{0B}'
            | '\u{0C}'
            | '\r'
            | ' '
            | '\u{A0}'
            | '\u{1680}'
            | '\u{2000}'..='\u{200A}'
            | '\u{2028}'
            | '\u{2029}'
            | '\u{202F}'
            | '\u{205F}'
            | '\u{3000}'
            | '\u{FEFF}'
    )
}

fn preview(text: &str) -> String {
    const LIMIT: usize = 40;
    let trimmed = text.trim_end_matches('\r');
    if trimmed.chars().count() <= LIMIT {
        return trimmed.to_string();
    }
    let mut out = trimmed.chars().take(LIMIT).collect::<String>();
    out.push_str("...");
    out
}
