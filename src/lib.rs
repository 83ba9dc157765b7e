//! trawl — a personal RSS/Atom aggregation service.
//!
//! The pipeline: the [`fetch`] scheduler drives [`feed`] parsing on
//! per-feed cadences, normalised articles land in [`storage`], [`enrich`]
//! adds translations and summaries, [`media`] rewrites and proxies images,
//! and [`api`] exposes the whole thing as JSON for the front end.

pub mod api;
pub mod cache;
pub mod config;
pub mod content;
pub mod enrich;
pub mod error;
pub mod feed;
pub mod fetch;
pub mod media;
pub mod rules;
pub mod state;
pub mod storage;
pub mod util;
pub mod vault;
