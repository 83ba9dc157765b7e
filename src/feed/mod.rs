//! Feed ingestion: format dispatch, normalisation, OPML and discovery.
//!
//! - [`parser`] — fetch + parse any supported feed kind into `ParsedArticle`s
//! - [`xpath`] — selector-driven extraction for `html+xpath` / `xml+xpath`
//! - [`script`] — user scripts whose stdout is an RSS/Atom document
//! - [`opml`] — OPML 2.0 import/export with selector extension attributes
//! - [`discovery`] — feed autodiscovery and friend-links expansion
//!
//! The parser never touches the store: it returns value objects and the
//! fetch layer decides what to persist.

pub mod discovery;
pub mod opml;
pub mod parser;
pub mod script;
pub mod xpath;

pub use discovery::{DiscoveredFeed, DiscoveryError, DiscoveryState};
pub use opml::{generate_opml, parse_opml, OpmlOutline};
pub use parser::{fetch_feed, parse_feed_bytes, FetchedFeed, ParseError};
