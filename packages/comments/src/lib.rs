// ABOUTME: Threaded comment pagination and mutation engine
// ABOUTME: Merges root and reply rows into ordered pages with resumable cursors

pub mod content;
pub mod list;
pub mod storage;
pub mod types;

// Re-export main types
pub use content::{ContentCodec, SqlValue, TextCodec, TextContent};
pub use list::{CommentList, CommentRow};
pub use storage::{CommentConfig, CommentStorage};
pub use types::{
    Comment, CommentError, CommentKind, CommentResult, CommentState, Cursor, NewComment, ReplyLink,
};
