//! Entity matching for `search_nodes`.
//!
//! Substring matching is always available. The full-text strategies need the
//! FTS5 tables from [`crate::schema`] and fall back to substring matching
//! whenever they cannot answer.

use std::fmt;
use std::str::FromStr;

use rusqlite::{params, Connection};
use tracing::{debug, warn};

use crate::error::Result;

/// How `search_nodes` matches entities
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SearchMode {
    /// Case-insensitive substring match on name, type, and observations
    Substring,
    /// Tokenized, stemmed phrase match; results ordered by name
    #[default]
    FullText,
    /// Like `FullText`, but name/type hits rank above observation-only hits
    Ranked,
}

impl SearchMode {
    fn as_str(self) -> &'static str {
        match self {
            Self::Substring => "substring",
            Self::FullText => "full-text",
            Self::Ranked => "ranked",
        }
    }
}

impl fmt::Display for SearchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SearchMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "substring" | "like" => Ok(Self::Substring),
            "full-text" | "fulltext" | "fts" => Ok(Self::FullText),
            "ranked" => Ok(Self::Ranked),
            other => Err(format!(
                "unknown search mode '{other}' (expected substring, full-text or ranked)"
            )),
        }
    }
}

/// Ids of entities matching `query`, in result order.
pub(crate) fn matching_entity_ids(
    conn: &Connection,
    query: &str,
    mode: SearchMode,
    full_text_enabled: bool,
) -> Result<Vec<i64>> {
    let mode = effective_mode(query, mode, full_text_enabled);
    debug!(%mode, query, "searching entities");

    let attempt = match mode {
        SearchMode::Substring => return substring_ids(conn, query),
        SearchMode::FullText => full_text_ids(conn, query),
        SearchMode::Ranked => ranked_ids(conn, query),
    };

    match attempt {
        Ok(ids) => Ok(ids),
        Err(err) => {
            warn!(error = %err, %mode, "Full-text search failed, falling back to substring search");
            substring_ids(conn, query)
        }
    }
}

/// Queries without a single word character have no FTS tokens; an empty
/// query must match everything, which only substring matching does.
fn effective_mode(query: &str, mode: SearchMode, full_text_enabled: bool) -> SearchMode {
    if !full_text_enabled || !query.chars().any(char::is_alphanumeric) {
        return SearchMode::Substring;
    }
    mode
}

fn substring_ids(conn: &Connection, query: &str) -> Result<Vec<i64>> {
    let pattern = like_pattern(query);
    let mut stmt = conn.prepare_cached(
        r"SELECT e.id FROM entities e
          WHERE e.name LIKE ?1 ESCAPE '\'
             OR e.entity_type LIKE ?1 ESCAPE '\'
             OR EXISTS (
                 SELECT 1 FROM observations o
                 WHERE o.entity_id = e.id AND o.content LIKE ?1 ESCAPE '\'
             )
          ORDER BY e.name",
    )?;
    collect_ids(&mut stmt, &pattern)
}

fn full_text_ids(conn: &Connection, query: &str) -> Result<Vec<i64>> {
    let phrase = escape_fts5_query(query);
    let mut stmt = conn.prepare_cached(
        "SELECT e.id FROM entities e
         WHERE e.id IN (
             SELECT CAST(entity_id AS INTEGER) FROM entities_fts WHERE entities_fts MATCH ?1
             UNION
             SELECT CAST(entity_id AS INTEGER) FROM observations_fts WHERE observations_fts MATCH ?1
         )
         ORDER BY e.name",
    )?;
    collect_ids(&mut stmt, &phrase)
}

fn ranked_ids(conn: &Connection, query: &str) -> Result<Vec<i64>> {
    let phrase = escape_fts5_query(query);
    let mut stmt = conn.prepare_cached(
        "WITH hits AS (
             SELECT CAST(entity_id AS INTEGER) AS id, 1.0 AS score
             FROM entities_fts WHERE entities_fts MATCH ?1
             UNION ALL
             SELECT CAST(entity_id AS INTEGER) AS id, 0.5 AS score
             FROM observations_fts WHERE observations_fts MATCH ?1
         ),
         best AS (
             SELECT id, MAX(score) AS score FROM hits GROUP BY id
         )
         SELECT e.id FROM entities e
         JOIN best b ON b.id = e.id
         ORDER BY b.score DESC, e.name",
    )?;
    collect_ids(&mut stmt, &phrase)
}

fn collect_ids(stmt: &mut rusqlite::CachedStatement<'_>, arg: &str) -> Result<Vec<i64>> {
    let rows = stmt.query_map(params![arg], |row| row.get::<_, i64>(0))?;
    let mut ids = Vec::new();
    for row in rows {
        ids.push(row?);
    }
    Ok(ids)
}

/// `%query%` with LIKE wildcards in the query taken literally
pub(crate) fn like_pattern(query: &str) -> String {
    let mut pattern = String::with_capacity(query.len() + 2);
    pattern.push('%');
    for c in query.chars() {
        if matches!(c, '\\' | '%' | '_') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

/// Quote the whole query as one FTS5 phrase.
///
/// Operators (`AND`, `OR`, `NOT`, `NEAR`), prefix stars, column filters and
/// quotes lose their meaning; embedded quotes are doubled.
pub(crate) fn escape_fts5_query(query: &str) -> String {
    format!("\"{}\"", query.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fts5_query_is_one_literal_phrase() {
        assert_eq!(escape_fts5_query("software engineer"), "\"software engineer\"");
        assert_eq!(escape_fts5_query("a OR b"), "\"a OR b\"");
        assert_eq!(escape_fts5_query("say \"hi\""), "\"say \"\"hi\"\"\"");
        assert_eq!(escape_fts5_query("name:*"), "\"name:*\"");
    }

    #[test]
    fn like_pattern_escapes_wildcards() {
        assert_eq!(like_pattern("apple"), "%apple%");
        assert_eq!(like_pattern("100%"), "%100\\%%");
        assert_eq!(like_pattern("snake_case"), "%snake\\_case%");
        assert_eq!(like_pattern(""), "%%");
    }

    #[test]
    fn punctuation_and_empty_queries_use_substring() {
        assert_eq!(effective_mode("", SearchMode::Ranked, true), SearchMode::Substring);
        assert_eq!(effective_mode("--", SearchMode::FullText, true), SearchMode::Substring);
        assert_eq!(effective_mode("apple", SearchMode::FullText, false), SearchMode::Substring);
        assert_eq!(effective_mode("apple", SearchMode::Ranked, true), SearchMode::Ranked);
    }

    #[test]
    fn search_mode_parses_cli_spellings() {
        assert_eq!("full-text".parse::<SearchMode>().unwrap(), SearchMode::FullText);
        assert_eq!("Ranked".parse::<SearchMode>().unwrap(), SearchMode::Ranked);
        assert_eq!("like".parse::<SearchMode>().unwrap(), SearchMode::Substring);
        assert!("fuzzy".parse::<SearchMode>().is_err());
        assert_eq!(SearchMode::FullText.to_string(), "full-text");
    }

    #[test]
    fn missing_fts_tables_fall_back_to_substring() {
        let conn = Connection::open_in_memory().unwrap();
        crate::schema::initialize(&conn, false).unwrap();
        conn.execute(
            "INSERT INTO entities (name, entity_type) VALUES ('Apple', 'Fruit')",
            [],
        )
        .unwrap();

        // Claims full-text is on although the tables do not exist
        let ids = matching_entity_ids(&conn, "appl", SearchMode::Ranked, true).unwrap();
        assert_eq!(ids, vec![1]);
    }
}
