//! The JSON surface the front end talks to, co-hosted with the static UI.
//!
//! Routing follows the method-router convention: a wrong method on a known
//! path is a 405 straight from axum, malformed parameters are 400 via
//! [`crate::error::AppError`], and every handler returns
//! `application/json` except the OPML export (`text/xml`) and the media
//! proxy (the image's own type).

mod articles;
mod discovery;
mod feeds;
mod media;
mod opml;
mod rules;
mod settings;
mod system;

use axum::routing::{get, post, put};
use axum::Router;
use std::sync::Arc;
use tower_http::services::ServeDir;

use crate::state::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    let static_dir = state.config.static_dir.clone();

    Router::new()
        // feeds
        .route("/api/feeds", get(feeds::list).post(feeds::add))
        .route("/api/feeds/{id}", put(feeds::update).delete(feeds::remove))
        .route("/api/feeds/batch-delete", post(feeds::batch_delete))
        .route("/api/feeds/batch-move", post(feeds::batch_move))
        // articles
        .route("/api/articles", get(articles::list))
        .route("/api/articles/filter", post(articles::filtered))
        .route("/api/articles/mark-all-read", post(articles::mark_all_read))
        .route("/api/articles/clear-read-later", post(articles::clear_read_later))
        .route("/api/articles/{id}/content", get(articles::content))
        .route("/api/articles/{id}/images", get(articles::images))
        .route("/api/articles/{id}/read", post(articles::mark_read))
        .route("/api/articles/{id}/toggle-favorite", post(articles::toggle_favorite))
        .route("/api/articles/{id}/toggle-hide", post(articles::toggle_hide))
        .route(
            "/api/articles/{id}/toggle-read-later",
            post(articles::toggle_read_later),
        )
        .route("/api/articles/{id}/translate", post(articles::translate))
        .route("/api/articles/{id}/summarize", post(articles::summarize))
        .route(
            "/api/articles/{id}/fetch-full-text",
            post(articles::fetch_full_text),
        )
        .route("/api/unread-counts", get(articles::unread_counts))
        .route("/api/filter-counts", get(articles::filter_counts))
        // settings
        .route("/api/settings", get(settings::get_all).post(settings::update))
        // opml
        .route("/api/opml/import", post(opml::import))
        .route("/api/opml/export", get(opml::export))
        // media proxy
        .route("/api/media", get(media::proxy))
        // system
        .route("/api/refresh", post(system::refresh))
        .route("/api/progress", get(system::progress))
        .route("/api/cleanup", post(system::cleanup))
        .route("/api/cleanup/content", post(system::cleanup_content))
        .route("/api/speed-test", post(system::speed_test))
        .route("/api/browser/open", post(system::open_browser))
        .route("/api/updates/check", get(system::check_updates))
        .route("/api/updates/download", post(system::download_update))
        .route("/api/updates/install", post(system::install_update))
        // discovery
        .route("/api/discovery/start", post(discovery::start))
        .route("/api/discovery/progress", get(discovery::progress))
        // rules
        .route("/api/rules/apply", post(rules::apply))
        // static UI
        .fallback_service(ServeDir::new(static_dir))
        .with_state(state)
}
