//! HTTP API routes and handlers.

mod llm;
mod stt;
mod tts;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

// Audio uploads dwarf the default 2 MiB body cap.
const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

/// Create the main API router.
pub fn router(state: AppState) -> Router {
    let v1_routes = Router::new()
        .route("/llm", post(llm::generate))
        .route("/llm/stream", post(llm::generate_stream))
        .route("/stt", post(stt::transcribe))
        .route("/tts", post(tts::synthesize))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES));

    Router::new()
        .route("/health", get(|| async { "ok" }))
        .nest("/v1", v1_routes)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    #[tokio::test]
    async fn health_returns_ok() {
        let (state, _dir) = testutil::app_state().await;
        let app = router(state);

        let resp = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn unknown_route_is_404() {
        let (state, _dir) = testutil::app_state().await;
        let app = router(state);

        let resp = app
            .oneshot(Request::get("/v1/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
