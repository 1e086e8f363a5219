// ABOUTME: Pagination and mutation orchestrator for threaded comments
// ABOUTME: Owns the transaction boundary and the four comment query shapes

use std::collections::HashMap;

use sqlx::query::Query;
use sqlx::sqlite::{Sqlite, SqliteArguments, SqlitePool};
use sqlx::{Row, Transaction};
use tracing::{debug, error};

use talkback_storage::StorageError;

use crate::content::{ContentCodec, SqlValue};
use crate::list::{CommentList, CommentRow};
use crate::types::{
    Comment, CommentError, CommentKind, CommentResult, CommentState, Cursor, NewComment, ReplyLink,
};

/// Columns owned by the engine. They are immutable after row creation and
/// may never appear in a codec's updatable set.
const STRUCTURAL_COLUMNS: &[&str] = &["id", "level", "parent_id", "origin_id", "child_count", "state"];

/// Table layout the store operates on.
///
/// `target_column: None` makes the store unscoped: every root belongs to
/// one implicit target and no target id is accepted. This is a
/// configuration choice, not a per-call one.
#[derive(Debug, Clone)]
pub struct CommentConfig {
    pub table: String,
    pub target_column: Option<String>,
}

impl Default for CommentConfig {
    fn default() -> Self {
        Self {
            table: "comments".to_string(),
            target_column: Some("target_id".to_string()),
        }
    }
}

/// Storage orchestrator for threaded comments.
///
/// Each call owns exactly one transaction for its whole duration; a failed
/// statement rolls the transaction back before the error is reported. The
/// pagination cursor produced by [`find`](Self::find) lives on the
/// instance, so one instance must not be shared across overlapping
/// pagination sessions.
pub struct CommentStorage<M: ContentCodec> {
    pool: SqlitePool,
    codec: M,
    config: CommentConfig,
    list: CommentList<M::Content>,
    last_loaded_key: Option<i64>,
    loaded: bool,
}

impl<M: ContentCodec> CommentStorage<M> {
    /// Validates the table layout and the codec's column declarations;
    /// misconfiguration is reported here, never at call time.
    pub fn new(pool: SqlitePool, codec: M, config: CommentConfig) -> CommentResult<Self> {
        if !valid_identifier(&config.table) {
            return Err(config_error(format!("Invalid table name: {}", config.table)));
        }

        if let Some(column) = &config.target_column {
            if !valid_identifier(column) || STRUCTURAL_COLUMNS.contains(&column.as_str()) {
                return Err(config_error(format!("Invalid target column name: {column}")));
            }
        }

        if codec.columns().is_empty() {
            return Err(config_error(
                "Codec must declare at least one content column".to_string(),
            ));
        }

        for column in codec.columns() {
            if !valid_identifier(column)
                || STRUCTURAL_COLUMNS.contains(column)
                || config.target_column.as_deref() == Some(*column)
            {
                return Err(config_error(format!("Invalid content column name: {column}")));
            }
        }

        for column in codec.updatable_columns() {
            if !codec.columns().contains(column) {
                return Err(config_error(format!(
                    "Updatable column {column} is not a content column"
                )));
            }
        }

        Ok(Self {
            pool,
            codec,
            config,
            list: CommentList::new(),
            last_loaded_key: None,
            loaded: false,
        })
    }

    /// Load one page of comments: up to `length` items starting at the
    /// cursor (or at the newest root when no cursor is given), with every
    /// returned root carrying its full reply subtree as nested children.
    ///
    /// A page may exceed `length` when a reply subtree straddles the
    /// boundary, and may be shorter when the data runs out. Replies whose
    /// parent falls outside the window (resuming mid-subtree) are returned
    /// as top-level items.
    pub async fn find(
        &mut self,
        target: Option<i64>,
        cursor: Option<Cursor>,
        length: usize,
    ) -> CommentResult<Vec<Comment<M::Content>>> {
        if length == 0 {
            return Err(CommentError::InvalidArgument(
                "Length must be greater than 0".to_string(),
            ));
        }
        let target = self.check_target(target)?;
        if let Some(cursor) = &cursor {
            if cursor.key <= 0 {
                return Err(CommentError::InvalidArgument(format!(
                    "Invalid search key: {}",
                    cursor.key
                )));
            }
            if matches!(cursor.origin_key, Some(origin) if origin <= 0) {
                return Err(CommentError::InvalidArgument(format!(
                    "Invalid origin key: {:?}",
                    cursor.origin_key
                )));
            }
        }

        let mut tx = self.pool.begin().await.map_err(StorageError::Sqlx)?;

        let (search_key, origin_key) = match cursor {
            Some(cursor) => (cursor.key, cursor.origin_key),
            None => (self.resolve_search_key(&mut tx, target).await?, None),
        };

        debug!(
            "Loading a page of {} comment(s) from key {} (origin {:?})",
            length, search_key, origin_key
        );

        let mut list = CommentList::new();
        // One extra unit of budget buys the row that proves a next page
        // exists, without another round trip.
        let mut budget = length as i64 + 1;
        let mut scan_from = search_key;

        if let Some(origin) = origin_key {
            // Resuming inside a subtree: the whole subtree is reloaded, the
            // rows at and before the search key are already consumed by
            // earlier pages, and the root scan continues below the origin.
            let fetched = self.load_reply_rows(&mut tx, &mut list, &[origin]).await? as i64;
            let offset = list.offset(search_key)? as i64;
            let remaining_after = fetched - (offset + 1);
            budget = if budget > remaining_after {
                budget - remaining_after
            } else {
                0
            };
            scan_from = origin - 1;
        }

        let mut first_root = None;
        if budget > 0 {
            first_root = self
                .load_root_rows(&mut tx, &mut list, target, scan_from, budget)
                .await?;
        }

        tx.commit().await.map_err(StorageError::Sqlx)?;

        let start = if origin_key.is_some() {
            Some(search_key)
        } else {
            first_root
        };
        self.materialize(list, start, length)
    }

    /// Where the page after the last completed [`find`](Self::find)
    /// resumes, or `None` when that page ended the data.
    pub fn next_cursor(&self) -> CommentResult<Option<Cursor>> {
        if !self.loaded {
            return Err(CommentError::NotLoaded);
        }

        match self.last_loaded_key {
            Some(key) => self.list.next_comment_key(key),
            None => Ok(None),
        }
    }

    /// Insert a comment and return its storage-assigned key.
    ///
    /// For a reply, the origin's `child_count` increment and the row insert
    /// commit together or not at all.
    pub async fn insert(&self, new: &NewComment<M::Content>) -> CommentResult<i64> {
        let target = self.check_target(new.target_id)?;
        if let Some(link) = &new.reply_to {
            validate_link(link)?;
        }

        let mut tx = self.pool.begin().await.map_err(StorageError::Sqlx)?;

        if let Some(link) = &new.reply_to {
            let sql = format!(
                "UPDATE {} SET child_count = child_count + 1 WHERE id = ?",
                self.config.table
            );
            let result = sqlx::query(&sql)
                .bind(link.origin_key)
                .execute(&mut *tx)
                .await
                .map_err(|e| {
                    error!(
                        "Cannot increment child count for comment {}: {}",
                        link.origin_key, e
                    );
                    StorageError::Sqlx(e)
                })?;
            if result.rows_affected() == 0 {
                return Err(CommentError::NotFound(link.origin_key));
            }
        }

        let mut columns: Vec<&str> = vec!["level", "state"];
        let mut values: Vec<SqlValue> = vec![
            SqlValue::Integer(new.reply_to.as_ref().map_or(0, |link| link.level)),
            SqlValue::Text(CommentState::Live.as_str().to_string()),
        ];
        match &new.reply_to {
            Some(link) => {
                columns.push("parent_id");
                values.push(SqlValue::Integer(link.parent_key));
                columns.push("origin_id");
                values.push(SqlValue::Integer(link.origin_key));
            }
            None => {
                columns.push("child_count");
                values.push(SqlValue::Integer(0));
            }
        }
        if let Some(column) = &self.config.target_column {
            columns.push(column.as_str());
            // check_target guarantees presence when the column is configured
            values.push(SqlValue::Integer(target.unwrap_or_default()));
        }
        for (column, value) in self.codec.encode(&new.content) {
            columns.push(column);
            values.push(value);
        }

        let placeholders = vec!["?"; columns.len()].join(", ");
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.config.table,
            columns.join(", "),
            placeholders
        );
        let mut query = sqlx::query(&sql);
        for value in &values {
            query = bind_value(query, value);
        }
        let result = query.execute(&mut *tx).await.map_err(|e| {
            error!("Cannot insert a comment: {e}");
            StorageError::Sqlx(e)
        })?;
        let key = result.last_insert_rowid();

        tx.commit().await.map_err(StorageError::Sqlx)?;

        debug!("Inserted comment {}", key);
        Ok(key)
    }

    /// Update the content of an existing comment. Only codec-declared
    /// updatable columns change, and only the fields set on `content` are
    /// included in the statement.
    pub async fn update(&self, key: i64, content: &M::Content) -> CommentResult<()> {
        if key <= 0 {
            return Err(CommentError::InvalidArgument(format!(
                "Invalid comment key: {key}"
            )));
        }

        let updatable = self.codec.updatable_columns();
        let changes: Vec<(&str, SqlValue)> = self
            .codec
            .encode(content)
            .into_iter()
            .filter(|(column, _)| updatable.contains(column))
            .collect();
        if changes.is_empty() {
            return Err(CommentError::Logic(
                "No updatable columns are set on the given content".to_string(),
            ));
        }

        let set_clause = changes
            .iter()
            .map(|(column, _)| format!("{column} = ?"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "UPDATE {} SET {} WHERE id = ?",
            self.config.table, set_clause
        );

        let mut tx = self.pool.begin().await.map_err(StorageError::Sqlx)?;

        let mut query = sqlx::query(&sql);
        for (_, value) in &changes {
            query = bind_value(query, value);
        }
        let result = query.bind(key).execute(&mut *tx).await.map_err(|e| {
            error!("Cannot update comment {key}: {e}");
            StorageError::Sqlx(e)
        })?;
        if result.rows_affected() == 0 {
            return Err(CommentError::NotFound(key));
        }

        tx.commit().await.map_err(StorageError::Sqlx)?;

        debug!("Updated comment {}", key);
        Ok(())
    }

    /// Delete a comment.
    ///
    /// A root disappears together with its whole subtree in one statement.
    /// A reply takes its descendants with it: the descendants are
    /// soft-deleted, the reply's own row is removed, and the origin's
    /// `child_count` drops by the exact number of rows taken out of
    /// service.
    pub async fn delete(&self, comment: &Comment<M::Content>) -> CommentResult<()> {
        if comment.key <= 0 {
            return Err(CommentError::InvalidArgument(format!(
                "Invalid comment key: {}",
                comment.key
            )));
        }
        if let CommentKind::Reply(link) = &comment.kind {
            validate_link(link)?;
        }

        let mut tx = self.pool.begin().await.map_err(StorageError::Sqlx)?;

        match comment.kind {
            CommentKind::Root { .. } => {
                let sql = format!(
                    "DELETE FROM {} WHERE id = ? OR origin_id = ?",
                    self.config.table
                );
                let result = sqlx::query(&sql)
                    .bind(comment.key)
                    .bind(comment.key)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| {
                        error!("Cannot delete comment {}: {}", comment.key, e);
                        StorageError::Sqlx(e)
                    })?;
                if result.rows_affected() == 0 {
                    return Err(CommentError::NotFound(comment.key));
                }
            }
            CommentKind::Reply(link) => {
                self.delete_reply(&mut tx, comment.key, &link).await?;
            }
        }

        tx.commit().await.map_err(StorageError::Sqlx)?;

        debug!("Deleted comment {}", comment.key);
        Ok(())
    }

    /// Remove a reply and its descendants, keeping the origin's counter
    /// exact.
    ///
    /// The blast radius is computed on the merge list's traversal order:
    /// descendants are contiguous immediately after their ancestor with
    /// strictly greater level, so the walk from the target stops at the
    /// first sibling-or-shallower row. Getting this order wrong would
    /// silently corrupt `child_count` and orphan replies, which is why the
    /// list's ordering contract is a hard dependency here.
    async fn delete_reply(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        key: i64,
        link: &ReplyLink,
    ) -> CommentResult<()> {
        let mut list = CommentList::new();
        self.load_reply_rows(tx, &mut list, &[link.origin_key]).await?;

        let total = list.len();
        match list.set_iteration_context(key, total.max(1)) {
            // The reply is gone from the live subtree; stale caller state,
            // not an internal defect.
            Err(CommentError::UnknownKey(_)) => return Err(CommentError::NotFound(key)),
            other => other?,
        }

        let mut doomed = Vec::new();
        for row in list.iter() {
            if row.key == key {
                doomed.push(row.key);
            } else if row.kind.level() > link.level {
                doomed.push(row.key);
            } else {
                break;
            }
        }

        let descendants = &doomed[1..];
        if !descendants.is_empty() {
            let placeholders = vec!["?"; descendants.len()].join(", ");
            let sql = format!(
                "UPDATE {} SET state = ? WHERE id IN ({})",
                self.config.table, placeholders
            );
            let mut query = sqlx::query(&sql).bind(CommentState::Deleted.as_str());
            for descendant in descendants {
                query = query.bind(*descendant);
            }
            query.execute(&mut **tx).await.map_err(|e| {
                error!("Cannot soft-delete descendants of comment {key}: {e}");
                StorageError::Sqlx(e)
            })?;
        }

        let sql = format!("DELETE FROM {} WHERE id = ?", self.config.table);
        let result = sqlx::query(&sql)
            .bind(key)
            .execute(&mut **tx)
            .await
            .map_err(|e| {
                error!("Cannot delete comment {key}: {e}");
                StorageError::Sqlx(e)
            })?;
        if result.rows_affected() == 0 {
            return Err(CommentError::NotFound(key));
        }

        let sql = format!(
            "UPDATE {} SET child_count = child_count - ? WHERE id = ?",
            self.config.table
        );
        let result = sqlx::query(&sql)
            .bind(doomed.len() as i64)
            .bind(link.origin_key)
            .execute(&mut **tx)
            .await
            .map_err(|e| {
                error!(
                    "Cannot decrement child count for comment {}: {}",
                    link.origin_key, e
                );
                StorageError::Sqlx(e)
            })?;
        if result.rows_affected() == 0 {
            return Err(CommentError::NotFound(link.origin_key));
        }

        Ok(())
    }

    async fn resolve_search_key(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        target: Option<i64>,
    ) -> CommentResult<i64> {
        let mut sql = format!("SELECT MAX(id) FROM {} WHERE level = 0", self.config.table);
        if let Some(column) = &self.config.target_column {
            sql.push_str(&format!(" AND {column} = ?"));
        }

        let mut query = sqlx::query_scalar::<_, Option<i64>>(&sql);
        if let Some(target) = target {
            query = query.bind(target);
        }
        let max = query
            .fetch_one(&mut **tx)
            .await
            .map_err(StorageError::Sqlx)?;

        max.ok_or(CommentError::SearchKeyUnavailable)
    }

    /// Fetch up to `count` budget units of root rows descending from
    /// `search_from`. A root costs one unit plus one per live reply; roots
    /// with replies are remembered and their subtrees fetched in one
    /// batched query afterwards. Returns the first (newest) root fetched.
    async fn load_root_rows(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        list: &mut CommentList<M::Content>,
        target: Option<i64>,
        search_from: i64,
        count: i64,
    ) -> CommentResult<Option<i64>> {
        let mut sql = format!(
            "SELECT id, child_count, {} FROM {} WHERE id <= ? AND level = 0",
            self.select_columns(),
            self.config.table
        );
        if let Some(column) = &self.config.target_column {
            sql.push_str(&format!(" AND {column} = ?"));
        }
        sql.push_str(" ORDER BY id DESC LIMIT ?");

        debug!("Loading up to {} root comment(s) from key {}", count, search_from);

        let mut query = sqlx::query(&sql).bind(search_from);
        if let Some(target) = target {
            query = query.bind(target);
        }
        let rows = query
            .bind(count)
            .fetch_all(&mut **tx)
            .await
            .map_err(StorageError::Sqlx)?;

        let mut remaining = count;
        let mut first_root = None;
        let mut origin_keys = Vec::new();
        for row in &rows {
            if remaining <= 0 {
                break;
            }
            let key: i64 = row.try_get("id").map_err(StorageError::Sqlx)?;
            let child_count: i64 = row.try_get("child_count").map_err(StorageError::Sqlx)?;
            let content = self.codec.decode(row)?;
            list.insert(CommentRow {
                key,
                kind: CommentKind::Root { child_count },
                content,
            });

            first_root.get_or_insert(key);
            remaining -= 1;
            if child_count > 0 {
                origin_keys.push(key);
                remaining -= child_count;
            }
        }

        if !origin_keys.is_empty() {
            self.load_reply_rows(tx, list, &origin_keys).await?;
        }

        Ok(first_root)
    }

    /// Fetch every live reply of the given origins, oldest first, in one
    /// batched query. Returns the number of rows fetched.
    async fn load_reply_rows(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        list: &mut CommentList<M::Content>,
        origin_keys: &[i64],
    ) -> CommentResult<usize> {
        let placeholders = vec!["?"; origin_keys.len()].join(", ");
        let sql = format!(
            "SELECT id, level, parent_id, origin_id, {} FROM {} WHERE origin_id IN ({}) AND state = ? ORDER BY id ASC",
            self.select_columns(),
            self.config.table,
            placeholders
        );

        debug!("Loading replies for {} origin comment(s)", origin_keys.len());

        let mut query = sqlx::query(&sql);
        for key in origin_keys {
            query = query.bind(*key);
        }
        let rows = query
            .bind(CommentState::Live.as_str())
            .fetch_all(&mut **tx)
            .await
            .map_err(StorageError::Sqlx)?;

        for row in &rows {
            let key: i64 = row.try_get("id").map_err(StorageError::Sqlx)?;
            let level: i64 = row.try_get("level").map_err(StorageError::Sqlx)?;
            let parent_key: i64 = row.try_get("parent_id").map_err(StorageError::Sqlx)?;
            let origin_key: i64 = row.try_get("origin_id").map_err(StorageError::Sqlx)?;
            let content = self.codec.decode(row)?;
            list.insert(CommentRow {
                key,
                kind: CommentKind::Reply(ReplyLink {
                    level,
                    parent_key,
                    origin_key,
                }),
                content,
            });
        }

        Ok(rows.len())
    }

    /// Turn the merge list's window into entity trees: every reply nests
    /// under its parent when the parent was materialized in this window,
    /// otherwise it becomes a top-level item. Records the resumption
    /// anchor for [`next_cursor`](Self::next_cursor).
    fn materialize(
        &mut self,
        mut list: CommentList<M::Content>,
        start: Option<i64>,
        length: usize,
    ) -> CommentResult<Vec<Comment<M::Content>>> {
        let Some(start) = start else {
            self.list = list;
            self.last_loaded_key = None;
            self.loaded = true;
            return Ok(Vec::new());
        };

        list.set_iteration_context(start, length)?;

        let mut result: Vec<Comment<M::Content>> = Vec::new();
        // Traversal paths of materialized comments, so children can be
        // attached without shared ownership of tree nodes.
        let mut paths: HashMap<i64, Vec<usize>> = HashMap::new();
        let mut last_key = None;

        for row in list.iter() {
            last_key = Some(row.key);
            let comment = Comment::new(row.key, row.kind, row.content.clone());

            let parent_path = row
                .kind
                .parent_key()
                .and_then(|parent| paths.get(&parent).cloned());
            match parent_path {
                Some(mut path) => {
                    let parent = node_at_path_mut(&mut result, &path);
                    path.push(parent.children.len());
                    parent.children.push(comment);
                    paths.insert(row.key, path);
                }
                None => {
                    result.push(comment);
                    paths.insert(row.key, vec![result.len() - 1]);
                }
            }
        }

        self.list = list;
        self.last_loaded_key = last_key;
        self.loaded = true;
        Ok(result)
    }

    fn check_target(&self, target: Option<i64>) -> CommentResult<Option<i64>> {
        match (&self.config.target_column, target) {
            (Some(_), Some(target)) if target > 0 => Ok(Some(target)),
            (Some(_), Some(target)) => Err(CommentError::InvalidArgument(format!(
                "Invalid target id: {target}"
            ))),
            (Some(column), None) => Err(CommentError::InvalidArgument(format!(
                "A target id is required: this store is scoped by {column}"
            ))),
            (None, Some(_)) => Err(CommentError::InvalidArgument(
                "This store is not target-scoped".to_string(),
            )),
            (None, None) => Ok(None),
        }
    }

    fn select_columns(&self) -> String {
        self.codec.columns().join(", ")
    }
}

fn validate_link(link: &ReplyLink) -> CommentResult<()> {
    if link.level < 1 || link.parent_key < 1 || link.origin_key < 1 {
        return Err(CommentError::Logic(format!(
            "A reply requires a positive level, parent key and origin key (got level {}, parent {}, origin {})",
            link.level, link.parent_key, link.origin_key
        )));
    }
    Ok(())
}

fn bind_value<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    value: &SqlValue,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    match value {
        SqlValue::Null => query.bind(None::<String>),
        SqlValue::Integer(value) => query.bind(*value),
        SqlValue::Real(value) => query.bind(*value),
        SqlValue::Text(value) => query.bind(value.clone()),
    }
}

fn node_at_path_mut<'a, C>(roots: &'a mut [Comment<C>], path: &[usize]) -> &'a mut Comment<C> {
    let (first, rest) = path.split_first().expect("paths are never empty");
    let mut node = &mut roots[*first];
    for index in rest {
        node = &mut node.children[*index];
    }
    node
}

fn valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn config_error(message: String) -> CommentError {
    CommentError::Storage(StorageError::Config(message))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_reject_sql_fragments() {
        assert!(valid_identifier("comments"));
        assert!(valid_identifier("blog_comments"));
        assert!(valid_identifier("_hidden"));
        assert!(!valid_identifier(""));
        assert!(!valid_identifier("1comments"));
        assert!(!valid_identifier("comments; DROP TABLE users"));
        assert!(!valid_identifier("comments--"));
    }
}
