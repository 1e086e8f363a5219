// ABOUTME: Data types for the threaded comment engine
// ABOUTME: Comment entities, cursors, state flags and the error enum

use serde::{Deserialize, Serialize};
use thiserror::Error;

use talkback_storage::StorageError;

/// Comment engine errors
#[derive(Error, Debug)]
pub enum CommentError {
    /// Malformed caller input, rejected before any storage access.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    /// Caller misuse of the API surface (missing reply linkage, cursor
    /// misuse), rejected before any storage access.
    #[error("Logic error: {0}")]
    Logic(String),
    /// The pagination cursor was queried before any completed load.
    #[error("Comments have not been loaded yet")]
    NotLoaded,
    /// No live root comments exist to resolve a search key from.
    #[error("Cannot resolve a search key: no comments exist")]
    SearchKeyUnavailable,
    /// A mutation matched zero rows.
    #[error("Comment {0} not found")]
    NotFound(i64),
    /// A merge-list lookup referenced a key that was never fetched. This is
    /// an internal consistency defect, not a normal runtime condition.
    #[error("Comment {0} is not present in the loaded row set")]
    UnknownKey(i64),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

pub type CommentResult<T> = Result<T, CommentError>;

/// Row liveness flag. Deleting a reply soft-deletes its descendants so the
/// surviving rows keep their subtree positions without being served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommentState {
    Live,
    Deleted,
}

impl CommentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommentState::Live => "live",
            CommentState::Deleted => "deleted",
        }
    }
}

/// Linkage of a reply to the tree it lives in.
///
/// `level` is the reply depth (1 = direct reply to a root), `parent_key`
/// the comment immediately above it, `origin_key` its level-0 ancestor.
/// For level-1 replies parent and origin coincide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyLink {
    pub level: i64,
    pub parent_key: i64,
    pub origin_key: i64,
}

/// Structural role of a comment row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommentKind {
    /// Level-0 comment attached directly to the target. `child_count` is
    /// the transactionally maintained number of live replies in its
    /// subtree.
    Root { child_count: i64 },
    Reply(ReplyLink),
}

impl CommentKind {
    pub fn is_reply(&self) -> bool {
        matches!(self, CommentKind::Reply(_))
    }

    pub fn level(&self) -> i64 {
        match self {
            CommentKind::Root { .. } => 0,
            CommentKind::Reply(link) => link.level,
        }
    }

    pub fn parent_key(&self) -> Option<i64> {
        match self {
            CommentKind::Root { .. } => None,
            CommentKind::Reply(link) => Some(link.parent_key),
        }
    }

    pub fn origin_key(&self) -> Option<i64> {
        match self {
            CommentKind::Root { .. } => None,
            CommentKind::Reply(link) => Some(link.origin_key),
        }
    }
}

/// A materialized comment with its direct children nested recursively.
///
/// Entities are constructed fresh from every query result and never cached
/// across calls.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Comment<C> {
    pub key: i64,
    pub kind: CommentKind,
    pub content: C,
    pub children: Vec<Comment<C>>,
}

impl<C> Comment<C> {
    pub fn new(key: i64, kind: CommentKind, content: C) -> Self {
        Self {
            key,
            kind,
            content,
            children: Vec::new(),
        }
    }
}

/// Input for inserting a comment. `reply_to: None` creates a root.
#[derive(Debug, Clone)]
pub struct NewComment<C> {
    /// Required when the store is configured with a target column,
    /// rejected otherwise.
    pub target_id: Option<i64>,
    pub reply_to: Option<ReplyLink>,
    pub content: C,
}

/// Pagination cursor: where the next page should resume.
///
/// `origin_key` is present when the anchor sits inside a reply subtree, in
/// which case the next `find` first reloads that subtree before scanning
/// older roots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub key: i64,
    pub origin_key: Option<i64>,
}
