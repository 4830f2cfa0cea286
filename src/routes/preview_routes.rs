use axum::extract::{Path, State};
use axum::http::header::{CACHE_CONTROL, CONTENT_SECURITY_POLICY};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};

use crate::models::DocumentVersion;
use crate::service::game_service::GameService;

/// Opaque origin for generated code: scripts run, host state stays out of reach.
pub const PREVIEW_SANDBOX: &str = "allow-scripts";

const HOST_PAGE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <title>gamesmith</title>
  <style>
    body { margin: 0; font-family: system-ui, sans-serif; display: flex; flex-direction: column; height: 100vh; }
    form { display: flex; gap: .5rem; padding: .5rem; }
    input { flex: 1; padding: .4rem; }
    #status { padding: 0 .5rem; font-size: .85rem; color: #555; white-space: pre-wrap; max-height: 6rem; overflow: auto; }
    iframe { flex: 1; border: 0; border-top: 1px solid #ddd; }
  </style>
</head>
<body>
  <form id="prompt">
    <input id="instruction" placeholder="Describe a game, or how to change this one" autocomplete="off">
    <button>Generate</button>
  </form>
  <div id="status"></div>
  <iframe id="preview" sandbox="allow-scripts" src="/preview"></iframe>
  <script>
    const status = document.getElementById("status");
    const preview = document.getElementById("preview");
    const socket = new WebSocket(`${location.protocol === "https:" ? "wss" : "ws"}://${location.host}/ws/generate`);
    let streamed = "";
    socket.onmessage = (msg) => {
      const event = JSON.parse(msg.data);
      if (event.type === "stream_start") { streamed = ""; status.textContent = "Generating..."; }
      if (event.type === "stream_chunk") { streamed += event.content; status.textContent = streamed.slice(-400); }
      if (event.type === "stream_end") {
        status.textContent = `Version ${event.version} ready in ${(event.elapsed_ms / 1000).toFixed(1)}s`;
        preview.src = `/preview/${event.version}`;
      }
      if (event.type === "error") { status.textContent = `${event.kind}: ${event.message}`; }
    };
    document.getElementById("prompt").onsubmit = (e) => {
      e.preventDefault();
      const input = document.getElementById("instruction");
      socket.send(JSON.stringify({ instruction: input.value }));
      input.value = "";
    };
  </script>
</body>
</html>
"#;

const EMPTY_PREVIEW: &str = "<!DOCTYPE html><html><body><p>No game yet. Describe one above.</p></body></html>";

/// GET `/` — host page with the sandboxed preview frame
pub async fn index_handler() -> impl IntoResponse {
    Html(HOST_PAGE)
}

/// GET `/preview` — the current document
pub async fn current_preview_handler(State(svc): State<GameService>) -> Response {
    match svc.store().current().await {
        Some(version) => sandboxed(version),
        None => (StatusCode::NOT_FOUND, sandbox_headers(), Html(EMPTY_PREVIEW)).into_response(),
    }
}

/// GET `/preview/{version}` — a specific committed version
pub async fn version_preview_handler(
    Path(version): Path<usize>,
    State(svc): State<GameService>,
) -> Response {
    match svc.store().version(version).await {
        Some(version) => sandboxed(version),
        None => (StatusCode::NOT_FOUND, format!("No version {version}")).into_response(),
    }
}

fn sandbox_headers() -> [(axum::http::HeaderName, String); 2] {
    [
        (CONTENT_SECURITY_POLICY, format!("sandbox {PREVIEW_SANDBOX}")),
        (CACHE_CONTROL, "no-store".to_string()),
    ]
}

fn sandboxed(version: DocumentVersion) -> Response {
    (sandbox_headers(), Html(version.document.html)).into_response()
}
