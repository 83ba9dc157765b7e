use axum::extract::{FromRequest, Multipart, Request, State};
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use axum::Json;
use std::sync::Arc;

use crate::error::{AppError, AppResult};
use crate::feed::{generate_opml, parse_opml};
use crate::state::AppState;
use crate::storage::{DatabaseError, NewFeed};

const MAX_OPML_SIZE: usize = 10 * 1024 * 1024;

/// Import subscriptions. Accepts either `multipart/form-data` with a
/// single `file` part or the raw OPML document as the request body.
pub async fn import(
    State(state): State<Arc<AppState>>,
    request: Request,
) -> AppResult<Json<serde_json::Value>> {
    let content_type = request
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_owned();

    let xml = if content_type.starts_with("multipart/form-data") {
        let mut multipart = Multipart::from_request(request, &())
            .await
            .map_err(|e| AppError::InvalidInput(format!("bad multipart body: {e}")))?;

        let mut xml = None;
        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|e| AppError::InvalidInput(format!("bad multipart field: {e}")))?
        {
            if field.name() == Some("file") {
                xml = Some(
                    field
                        .text()
                        .await
                        .map_err(|e| AppError::InvalidInput(format!("unreadable file part: {e}")))?,
                );
                break;
            }
        }
        xml.ok_or_else(|| AppError::InvalidInput("missing `file` part".to_owned()))?
    } else {
        let bytes = axum::body::to_bytes(request.into_body(), MAX_OPML_SIZE)
            .await
            .map_err(|e| AppError::InvalidInput(format!("unreadable body: {e}")))?;
        String::from_utf8_lossy(&bytes).into_owned()
    };

    let outlines = parse_opml(&xml).map_err(|e| AppError::Decode(e.to_string()))?;
    if outlines.is_empty() {
        return Err(AppError::InvalidInput(
            "no feeds found in OPML document".to_owned(),
        ));
    }

    let mut imported = 0u64;
    let mut skipped = 0u64;
    for outline in outlines {
        let feed = NewFeed {
            title: outline.title,
            url: outline.xml_url,
            category: outline.category,
            image_url: None,
            kind: outline.kind,
            selectors: outline.selectors,
            script_path: outline.script_path,
            hidden: false,
            image_mode: false,
            proxy_url: None,
            refresh_interval: outline.refresh_interval,
            managed: false,
        };
        match state.db.add_feed(&feed).await {
            Ok(_) => imported += 1,
            Err(DatabaseError::DuplicateUrl(_)) => skipped += 1,
            Err(e) => return Err(AppError::Internal(e.to_string())),
        }
    }

    tracing::info!(imported = imported, skipped = skipped, "OPML import finished");
    Ok(Json(
        serde_json::json!({ "imported": imported, "skipped": skipped }),
    ))
}

/// Export the subscription list as OPML 2.0 (`text/xml`).
pub async fn export(State(state): State<Arc<AppState>>) -> AppResult<Response> {
    let feeds = state.db.get_feeds().await?;
    let opml = generate_opml(&feeds).map_err(|e| AppError::Internal(e.to_string()))?;

    Ok((
        [(CONTENT_TYPE, "text/xml; charset=utf-8")],
        opml,
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::router;
    use crate::state::test_support::test_state;
    use axum::body::Body;
    use axum::http::{Request as HttpRequest, StatusCode};
    use tower::ServiceExt;

    const OPML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<opml version="2.0">
  <head><title>Subs</title></head>
  <body>
    <outline text="Tech" title="Tech">
      <outline type="rss" text="Example" xmlUrl="https://example.com/rss"/>
    </outline>
    <outline type="rss" text="Other" xmlUrl="https://other.example.com/rss"/>
  </body>
</opml>"#;

    #[tokio::test]
    async fn test_import_raw_body() {
        let (state, _rx) = test_state().await;
        let app = router(Arc::clone(&state));

        let response = app
            .oneshot(
                HttpRequest::builder()
                    .method("POST")
                    .uri("/api/opml/import")
                    .header("Content-Type", "text/xml")
                    .body(Body::from(OPML))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let feeds = state.db.get_feeds().await.unwrap();
        assert_eq!(feeds.len(), 2);
        let tech = feeds.iter().find(|f| f.url == "https://example.com/rss").unwrap();
        assert_eq!(tech.category, "Tech");
    }

    #[tokio::test]
    async fn test_import_multipart() {
        let (state, _rx) = test_state().await;
        let app = router(Arc::clone(&state));

        let boundary = "X-TRAWL-BOUNDARY";
        let body = format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"subs.opml\"\r\nContent-Type: text/xml\r\n\r\n{OPML}\r\n--{boundary}--\r\n"
        );

        let response = app
            .oneshot(
                HttpRequest::builder()
                    .method("POST")
                    .uri("/api/opml/import")
                    .header(
                        "Content-Type",
                        format!("multipart/form-data; boundary={boundary}"),
                    )
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(state.db.get_feeds().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_import_duplicates_are_skipped() {
        let (state, _rx) = test_state().await;
        let app = router(Arc::clone(&state));

        for _ in 0..2 {
            let response = app
                .clone()
                .oneshot(
                    HttpRequest::builder()
                        .method("POST")
                        .uri("/api/opml/import")
                        .header("Content-Type", "text/xml")
                        .body(Body::from(OPML))
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        assert_eq!(state.db.get_feeds().await.unwrap().len(), 2, "re-import adds nothing");
    }

    #[tokio::test]
    async fn test_import_garbage_400() {
        let (state, _rx) = test_state().await;
        let app = router(state);

        let response = app
            .oneshot(
                HttpRequest::builder()
                    .method("POST")
                    .uri("/api/opml/import")
                    .header("Content-Type", "text/xml")
                    .body(Body::from("<html>nope</html>"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_export_roundtrips_import() {
        let (state, _rx) = test_state().await;
        let app = router(Arc::clone(&state));

        app.clone()
            .oneshot(
                HttpRequest::builder()
                    .method("POST")
                    .uri("/api/opml/import")
                    .header("Content-Type", "text/xml")
                    .body(Body::from(OPML))
                    .unwrap(),
            )
            .await
            .unwrap();

        let response = app
            .oneshot(
                HttpRequest::builder()
                    .uri("/api/opml/export")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .unwrap()
            .to_str()
            .unwrap()
            .to_owned();
        assert!(content_type.starts_with("text/xml"));

        let body = axum::body::to_bytes(response.into_body(), 1 << 20).await.unwrap();
        let exported = String::from_utf8(body.to_vec()).unwrap();
        let parsed = parse_opml(&exported).unwrap();
        assert_eq!(parsed.len(), 2);
        assert!(parsed.iter().any(|o| o.category == "Tech"));
    }
}
