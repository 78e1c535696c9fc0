//! Full-text search helpers.
//!
//! Indexed message text carries hidden sentinel tokens after the user text:
//! one naming the dialog and one per index bucket the message belongs to.
//! The tokenizer treats `\x07` as a word character, so a sentinel can never
//! collide with a word typed by a user. A search appends the same sentinels
//! to restrict a single `MATCH` to one dialog and one filter.

use chatstore_core::{DialogId, MESSAGE_DB_INDEX_COUNT};

/// Character that starts every sentinel token.
pub const SENTINEL: char = '\x07';

/// Longest user query considered, in bytes.
pub const MAX_QUERY_BYTES: usize = 1024;

/// Text to store in the indexed column of a searchable message.
pub fn indexed_text(text: &str, dialog_id: DialogId, index_mask: i32) -> String {
    let mut out = String::with_capacity(text.len() + 24);
    out.push_str(text);
    out.push(' ');
    out.push(SENTINEL);
    out.push_str(&dialog_id.get().to_string());
    for index in 0..MESSAGE_DB_INDEX_COUNT {
        if index_mask & (1 << index) != 0 {
            out.push(' ');
            out.push(SENTINEL);
            out.push(SENTINEL);
            out.push_str(&index.to_string());
        }
    }
    out
}

/// Query term restricting matches to one dialog.
pub fn dialog_term(dialog_id: DialogId) -> String {
    format!("\"{}{}\"", SENTINEL, dialog_id.get())
}

/// Query term restricting matches to one index bucket.
pub fn filter_term(index: usize) -> String {
    format!("\"{}{}{}\"", SENTINEL, SENTINEL, index)
}

/// Turn free user input into an FTS5 expression.
///
/// Every run of letters, digits and underscores becomes a quoted prefix term,
/// so punctuation can never produce a syntax error and partial words match.
/// Returns an empty string when the input has no words.
pub fn prepare_query(query: &str) -> String {
    let query = truncate_utf8(query, MAX_QUERY_BYTES);
    let mut terms = Vec::new();
    let mut word = String::new();
    for c in query.chars() {
        if c.is_alphanumeric() || c == '_' {
            word.push(c);
        } else if !word.is_empty() {
            terms.push(format!("\"{}\"*", word));
            word.clear();
        }
    }
    if !word.is_empty() {
        terms.push(format!("\"{}\"*", word));
    }
    terms.join(" ")
}

fn truncate_utf8(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prepare_query_words() {
        assert_eq!(prepare_query("hello, world!"), "\"hello\"* \"world\"*");
        assert_eq!(prepare_query("snake_case 42"), "\"snake_case\"* \"42\"*");
        assert_eq!(prepare_query("  ?! "), "");
        assert_eq!(prepare_query("\"quoted\" OR NOT"), "\"quoted\"* \"OR\"* \"NOT\"*");
    }

    #[test]
    fn test_prepare_query_unicode() {
        assert_eq!(prepare_query("привет мир"), "\"привет\"* \"мир\"*");
    }

    #[test]
    fn test_truncate_on_char_boundary() {
        let long = "ж".repeat(MAX_QUERY_BYTES);
        let truncated = truncate_utf8(&long, MAX_QUERY_BYTES);
        assert!(truncated.len() <= MAX_QUERY_BYTES);
        assert_eq!(truncated.chars().count(), MAX_QUERY_BYTES / 2);
    }

    #[test]
    fn test_indexed_text_sentinels() {
        let text = indexed_text("hi", DialogId::new(5), (1 << 3) | (1 << 9));
        assert_eq!(text, "hi \x075 \x07\x073 \x07\x079");
    }

    #[test]
    fn test_terms() {
        assert_eq!(dialog_term(DialogId::new(-100)), "\"\x07-100\"");
        assert_eq!(filter_term(10), "\"\x07\x0710\"");
    }
}
