//! Cache keys derived from normalized query text.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Prefix shared by local cache files and remote cache tables.
pub const KEY_PREFIX: &str = "bqt_";

/// Lowercase hex SHA-256 digest of a normalized query.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// File stem used by the local backend, e.g. `bqt_<hex>`.
    pub fn file_stem(&self) -> String {
        format!("{}{}", KEY_PREFIX, self.0)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// Sorted for binary search.
const KEYWORDS: &[&str] = &[
    "ALL", "AND", "ANY", "ARRAY", "AS", "ASC", "BETWEEN", "BY", "CASE", "CAST", "CROSS",
    "CURRENT_DATE", "CURRENT_TIMESTAMP", "DATE", "DESC", "DISTINCT", "ELSE", "END", "EXCEPT",
    "EXISTS", "EXTRACT", "FALSE", "FIRST", "FOLLOWING", "FOR", "FROM", "FULL", "GROUP", "HAVING",
    "IF", "IFNULL", "IN", "INNER", "INTERSECT", "INTERVAL", "IS", "JOIN", "LAST", "LEFT", "LIKE",
    "LIMIT", "NOT", "NULL", "NULLS", "OFFSET", "ON", "OR", "ORDER", "OUTER", "OVER", "PARTITION",
    "PRECEDING", "QUALIFY", "RANGE", "RIGHT", "ROWS", "SAFE_CAST", "SELECT", "STRUCT", "THEN",
    "TIMESTAMP", "TRUE", "UNBOUNDED", "UNION", "UNNEST", "USING", "WHEN", "WHERE", "WINDOW",
    "WITH",
];

fn is_keyword(word: &str) -> bool {
    KEYWORDS.binary_search(&word).is_ok()
}

fn push_word(out: &mut String, word: &mut String) {
    if word.is_empty() {
        return;
    }
    let upper = word.to_ascii_uppercase();
    if is_keyword(&upper) {
        out.push_str(&upper);
    } else {
        out.push_str(word);
    }
    word.clear();
}

fn push_space(out: &mut String) {
    if !out.is_empty() && !out.ends_with(' ') {
        out.push(' ');
    }
}

/// Canonical form of a query.
///
/// Comments are removed, keywords outside quotes are upper-cased, whitespace
/// runs collapse to a single space and trailing semicolons are dropped. Text
/// inside `'...'`, `"..."` and `` `...` `` is kept byte for byte.
pub fn normalize(query: &str) -> String {
    let chars: Vec<char> = query.chars().collect();
    let mut out = String::with_capacity(query.len());
    let mut word = String::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();

        if c.is_ascii_alphanumeric() || c == '_' {
            word.push(c);
            i += 1;
            continue;
        }
        push_word(&mut out, &mut word);

        match c {
            '\'' | '"' | '`' => {
                out.push(c);
                i += 1;
                while i < chars.len() {
                    let q = chars[i];
                    out.push(q);
                    i += 1;
                    if q == '\\' && i < chars.len() {
                        out.push(chars[i]);
                        i += 1;
                    } else if q == c {
                        break;
                    }
                }
            }
            '-' if next == Some('-') => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
                push_space(&mut out);
            }
            '#' => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
                push_space(&mut out);
            }
            '/' if next == Some('*') => {
                i += 2;
                while i < chars.len() && !(chars[i] == '*' && chars.get(i + 1) == Some(&'/')) {
                    i += 1;
                }
                i = (i + 2).min(chars.len());
                push_space(&mut out);
            }
            c if c.is_whitespace() => {
                push_space(&mut out);
                i += 1;
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }
    push_word(&mut out, &mut word);

    let mut normalized = out.trim().to_string();
    while normalized.ends_with(';') || normalized.ends_with(' ') {
        normalized.pop();
    }
    normalized
}

/// Cache key of a query: SHA-256 over its normalized text.
pub fn resolve(query: &str) -> CacheKey {
    let digest = Sha256::digest(normalize(query).as_bytes());
    CacheKey(hex::encode(digest))
}
