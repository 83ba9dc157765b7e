mod articles;
mod content;
mod feeds;
mod retention;
mod schema;
mod settings;
mod types;

pub use articles::RuleArticle;
pub use schema::{Database, DatabaseError};
pub use settings::{is_encrypted_blob, SettingKey};
pub use types::{
    Article, ArticleFilter, Feed, FeedKind, NewFeed, ParsedArticle, SelectorConfig, UpdateStatus,
};
