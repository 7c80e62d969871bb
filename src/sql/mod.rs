//! SQL text helpers shared by every backend.
//!
//! Queries may carry dialect fragments as comments: `/*MYSQL ... */` and
//! `/*SQLITE ... */`. [`parse_query`] keeps the fragments of one dialect and
//! strips every other comment, so one query string serves both backends.

pub mod builder;
pub mod schema;

pub use builder::{
    escape_reserved_word, find_in_set, make_fulltext_query, make_insert_query, make_like_query,
    make_update_query, make_where_query, prepare_insert_query, prepare_update_query,
    prepare_where_query,
};
pub use schema::{Field, FieldType, get_field_size, get_field_type, get_fields, get_indexes, get_tables};

use crate::db::Dialect;

/// Byte offset of the first `needle` at or after `from` that is not inside a
/// single or double quoted string. Backslash escapes the next character
/// inside quotes.
pub(crate) fn find_unquoted(haystack: &str, needle: &str, from: usize) -> Option<usize> {
    let bytes = haystack.as_bytes();
    let needle = needle.as_bytes();
    let mut quote: Option<u8> = None;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            Some(q) => {
                if b == b'\\' {
                    i += 2;
                    continue;
                }
                if b == q {
                    quote = None;
                }
            }
            None => {
                if i >= from && bytes[i..].starts_with(needle) {
                    return Some(i);
                }
                if b == b'\'' || b == b'"' {
                    quote = Some(b);
                }
            }
        }
        i += 1;
    }
    None
}

/// Resolve dialect comments, innermost first.
///
/// A comment whose body starts with the dialect tag is replaced by the rest
/// of its body, trimmed; any other comment is removed. Comment markers inside
/// quoted strings are left alone.
pub fn parse_query(query: &str, dialect: Dialect) -> String {
    let tag = dialect.tag();
    let mut query = query.to_string();
    let mut search_from = 0;
    while let Some(start) = find_unquoted(&query, "/*", search_from) {
        let Some(end) = find_unquoted(&query, "*/", start + 2) else {
            search_from = start + 2;
            continue;
        };
        let mut open = start;
        while let Some(inner) = find_unquoted(&query, "/*", open + 2) {
            if inner >= end {
                break;
            }
            open = inner;
        }
        let replacement = query[open + 2..end]
            .strip_prefix(tag)
            .map(|rest| rest.trim().to_string())
            .unwrap_or_default();
        query = format!("{}{}{}", &query[..open], replacement, &query[end + 2..]);
        search_from = 0;
    }
    query
}
