//! Shared fixtures for the HTTP backend tests.

use serde_json::{Value as JsonValue, json};
use url::Url;

/// Serve `router` on an ephemeral local port and return its base URL.
pub(crate) async fn serve(router: axum::Router) -> Url {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}").parse().unwrap()
}

/// GoTrue token response for `user_id`; the refresh token is `refresh-<user_id>`.
pub(crate) fn session_json(user_id: &str, access_token: &str) -> JsonValue {
    json!({
        "access_token": access_token,
        "token_type": "bearer",
        "expires_in": 3600,
        "refresh_token": format!("refresh-{user_id}"),
        "user": { "id": user_id, "email": format!("{user_id}@example.com") }
    })
}
