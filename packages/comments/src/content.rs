// ABOUTME: Content codec abstraction mapping caller columns to typed content
// ABOUTME: Ships a plain text codec matching the default migration schema

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use talkback_storage::{StorageError, StorageResult};

/// An owned SQL bind value, so the engine can bind caller content without
/// knowing its concrete types.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

/// Maps the caller-owned content columns of a comment row to and from a
/// typed value.
///
/// The engine owns the structural columns (key, level, linkage, counter,
/// state); everything else on the row belongs to the codec. `encode`
/// returns only the fields that are set, which is what makes partial
/// updates work by omission and lets inserts fall back to column defaults.
pub trait ContentCodec: Send + Sync {
    type Content: Clone + Send + Sync;

    /// Content column names, selected on every fetch.
    fn columns(&self) -> &'static [&'static str];

    /// Subset of `columns` that `update` may touch. Structural columns can
    /// never appear here; that is checked once at store construction.
    fn updatable_columns(&self) -> &'static [&'static str];

    fn decode(&self, row: &SqliteRow) -> StorageResult<Self::Content>;

    fn encode(&self, content: &Self::Content) -> Vec<(&'static str, SqlValue)>;
}

/// Content of a plain text comment, matching the bundled migration: an
/// optional display name, the comment body and the creation timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextContent {
    pub author: Option<String>,
    pub body: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

impl TextContent {
    pub fn new(author: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            author: Some(author.into()),
            body: Some(body.into()),
            created_at: Some(Utc::now()),
        }
    }

    /// A body-only value, as handed to `update` for an edit.
    pub fn body_edit(body: impl Into<String>) -> Self {
        Self {
            author: None,
            body: Some(body.into()),
            created_at: None,
        }
    }
}

/// Codec for [`TextContent`]. Only the body is editable after creation.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextCodec;

impl ContentCodec for TextCodec {
    type Content = TextContent;

    fn columns(&self) -> &'static [&'static str] {
        &["author", "body", "created_at"]
    }

    fn updatable_columns(&self) -> &'static [&'static str] {
        &["body"]
    }

    fn decode(&self, row: &SqliteRow) -> StorageResult<TextContent> {
        let created_at_str: Option<String> = row.try_get("created_at")?;
        let created_at = match created_at_str {
            Some(raw) => Some(parse_timestamp(&raw)?),
            None => None,
        };

        Ok(TextContent {
            author: row.try_get("author")?,
            body: row.try_get("body")?,
            created_at,
        })
    }

    fn encode(&self, content: &TextContent) -> Vec<(&'static str, SqlValue)> {
        let mut values = Vec::new();
        if let Some(author) = &content.author {
            values.push(("author", SqlValue::Text(author.clone())));
        }
        if let Some(body) = &content.body {
            values.push(("body", SqlValue::Text(body.clone())));
        }
        if let Some(created_at) = &content.created_at {
            values.push(("created_at", SqlValue::Text(created_at.to_rfc3339())));
        }
        values
    }
}

fn parse_timestamp(raw: &str) -> StorageResult<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Ok(parsed.with_timezone(&Utc));
    }

    // SQLite's datetime('now', 'utc') default stores "YYYY-MM-DD HH:MM:SS".
    chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .map(|naive| naive.and_utc())
        .map_err(|_| StorageError::Database(format!("Invalid created_at timestamp: {raw}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_skips_unset_fields() {
        let codec = TextCodec;
        let edit = TextContent::body_edit("updated");

        let values = codec.encode(&edit);
        assert_eq!(values, vec![("body", SqlValue::Text("updated".into()))]);
    }

    #[test]
    fn encode_emits_all_set_fields() {
        let codec = TextCodec;
        let content = TextContent::new("ada", "hello");

        let columns: Vec<&str> = codec.encode(&content).iter().map(|(c, _)| *c).collect();
        assert_eq!(columns, vec!["author", "body", "created_at"]);
    }

    #[test]
    fn timestamps_parse_both_storage_formats() {
        assert!(parse_timestamp("2026-01-02T03:04:05+00:00").is_ok());
        assert!(parse_timestamp("2026-01-02 03:04:05").is_ok());
        assert!(parse_timestamp("yesterday-ish").is_err());
    }
}
