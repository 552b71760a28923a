use std::path::{Component, Path, PathBuf};

use actix_files::NamedFile;
use actix_web::{
    HttpRequest, HttpResponse, Result as ActixResult,
    error::{ErrorInternalServerError, ErrorNotFound},
    http::header,
    web,
};
use serde::Serialize;
use tokio::fs;

use crate::{config::ServerConfiguration, startup::AppState};

pub const CLIENT_SCRIPT_PATH: &str = "/_live/script.js";
pub const CLIENT_WS_PATH: &str = "/_live/ws";
pub const CLIENT_HEALTH_PATH: &str = "/_live/health";

const CLIENT_MARKER: &str = "__live_serve_client";

/// Settings handed to the browser client through the injected snippet.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientOptions {
    pub ws_path: &'static str,
    pub health_path: &'static str,
    pub notify: bool,
    pub reload_on_restart: bool,
    pub inject_notification: bool,
    pub timestamps: bool,
}

impl ClientOptions {
    pub fn from_config(config: &ServerConfiguration) -> Self {
        Self {
            ws_path: CLIENT_WS_PATH,
            health_path: CLIENT_HEALTH_PATH,
            notify: config.browser().notify,
            reload_on_restart: config.browser().reload_on_restart,
            inject_notification: config.browser().inject_notification,
            timestamps: config.logging().timestamps,
        }
    }
}

pub async fn serve_file(
    req: HttpRequest,
    tail: web::Path<String>,
    state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    let target = locate_file(&state.root, tail.as_str())
        .await
        .map_err(|_| ErrorNotFound("Not Found"))?;

    if is_html(&target) {
        let raw = fs::read(&target).await.map_err(ErrorInternalServerError)?;
        // Pages in legacy encodings are served as-is, without live reload.
        if let Ok(text) = String::from_utf8(raw) {
            let injected =
                inject_live_client(&text, &state.client).map_err(ErrorInternalServerError)?;

            return Ok(HttpResponse::Ok()
                .append_header((header::CACHE_CONTROL, "no-cache, no-store, must-revalidate"))
                .content_type("text/html; charset=utf-8")
                .body(injected));
        }
        tracing::debug!(path = %target.display(), "page is not UTF-8, serving without client");
    }

    let file = NamedFile::open_async(&target)
        .await
        .map_err(|_| ErrorNotFound("Not Found"))?;

    Ok(file.into_response(&req))
}

async fn locate_file(root: &Path, tail: &str) -> anyhow::Result<PathBuf> {
    let mut full_path = sanitize_path(root, tail)?;

    let metadata = fs::metadata(&full_path).await?;
    if metadata.is_dir() {
        full_path.push("index.html");
        if !fs::metadata(&full_path).await?.is_file() {
            anyhow::bail!("directory has no index.html");
        }
    }

    Ok(full_path)
}

/// Join a request path onto `root`, refusing anything that could escape it.
fn sanitize_path(root: &Path, tail: &str) -> anyhow::Result<PathBuf> {
    let mut target = root.to_path_buf();

    for component in Path::new(tail.trim_start_matches('/')).components() {
        match component {
            Component::Normal(part) => target.push(part),
            Component::CurDir => {}
            _ => anyhow::bail!("invalid path"),
        }
    }

    Ok(target)
}

fn is_html(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| matches!(ext.to_ascii_lowercase().as_str(), "html" | "htm"))
        .unwrap_or(false)
}

/// The script tags served to pages, also printed at startup.
pub fn client_snippet(options: &ClientOptions) -> anyhow::Result<String> {
    Ok(format!(
        r#"<script id="__live_serve_config">window.__LIVE_SERVE__ = {};</script><script id="{CLIENT_MARKER}" defer src="{CLIENT_SCRIPT_PATH}"></script>"#,
        serde_json::to_string(options)?
    ))
}

/// Insert the client snippet before `</body>`, else before `</head>`, else at the end.
pub fn inject_live_client(original: &str, options: &ClientOptions) -> anyhow::Result<String> {
    if original.contains(CLIENT_MARKER) {
        return Ok(original.to_string());
    }

    let snippet = client_snippet(options)?;
    let lowered = original.to_ascii_lowercase();
    let anchor = lowered.rfind("</body>").or_else(|| lowered.rfind("</head>"));

    let mut result = String::with_capacity(original.len() + snippet.len() + 2);
    match anchor {
        Some(idx) => {
            result.push_str(&original[..idx]);
            result.push_str(&snippet);
            result.push('\n');
            result.push_str(&original[idx..]);
        }
        None => {
            result.push_str(original);
            if !result.ends_with('\n') {
                result.push('\n');
            }
            result.push_str(&snippet);
        }
    }
    Ok(result)
}
