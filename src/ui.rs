//! Admin dashboard served on its own port.
//!
//! Shows what is being served and how many browsers are listening, and
//! offers a button to reload all of them by hand.

use std::{net::TcpListener, path::PathBuf};

use actix_web::{HttpResponse, dev::Server, http::header, web};
use serde::Serialize;

use crate::{
    config::{ServerConfiguration, WatchEvent},
    reload::{Broadcaster, LiveMessage},
};

#[derive(Clone)]
pub struct UiState {
    root: PathBuf,
    local_url: String,
    ui_url: String,
    watching: bool,
    events: Vec<WatchEvent>,
    reload_debounce_ms: u64,
    inject_changes: bool,
    broadcaster: Broadcaster,
}

impl UiState {
    pub fn new(
        config: &ServerConfiguration,
        broadcaster: Broadcaster,
        local_url: String,
        ui_url: String,
    ) -> Self {
        Self {
            root: config.serve().root.clone(),
            local_url,
            ui_url,
            watching: config.watch().enabled,
            events: config.watch().events.iter().copied().collect(),
            reload_debounce_ms: config.browser().reload_debounce_ms,
            inject_changes: config.browser().inject_changes,
            broadcaster,
        }
    }

    fn report(&self) -> StatusReport<'_> {
        StatusReport {
            root: self.root.display().to_string(),
            local_url: &self.local_url,
            ui_url: &self.ui_url,
            clients: self.broadcaster.client_count(),
            watching: self.watching,
            events: &self.events,
            reload_debounce_ms: self.reload_debounce_ms,
            inject_changes: self.inject_changes,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusReport<'a> {
    root: String,
    local_url: &'a str,
    ui_url: &'a str,
    clients: usize,
    watching: bool,
    events: &'a [WatchEvent],
    reload_debounce_ms: u64,
    inject_changes: bool,
}

#[derive(Debug, Serialize)]
struct ReloadAccepted {
    clients: usize,
}

pub fn configure_ui(cfg: &mut web::ServiceConfig) {
    cfg.route("/", web::get().to(dashboard))
        .route("/api/status", web::get().to(status))
        .route("/api/reload", web::post().to(reload_all));
}

pub fn run(listener: TcpListener, state: UiState) -> anyhow::Result<Server> {
    let shared_state = web::Data::new(state);

    let server = actix_web::HttpServer::new(move || {
        actix_web::App::new()
            .app_data(shared_state.clone())
            .configure(configure_ui)
    })
    .workers(1)
    .listen(listener)?
    .run();

    Ok(server)
}

async fn status(state: web::Data<UiState>) -> HttpResponse {
    HttpResponse::Ok()
        .append_header((header::CACHE_CONTROL, "no-store"))
        .json(state.report())
}

async fn reload_all(state: web::Data<UiState>) -> HttpResponse {
    let clients = state.broadcaster.send(LiveMessage::Reload);
    tracing::info!(clients, "manual reload requested from dashboard");
    HttpResponse::Accepted().json(ReloadAccepted { clients })
}

async fn dashboard(state: web::Data<UiState>) -> HttpResponse {
    let report = state.report();
    let events = report
        .events
        .iter()
        .map(|event| format!("{event:?}").to_ascii_lowercase())
        .collect::<Vec<_>>()
        .join(", ");

    let body = format!(
        r#"<!doctype html>
<html lang="en">
<head>
<meta charset="utf-8">
<title>live-serve</title>
<style>
body {{ font: 15px/1.5 sans-serif; margin: 2rem auto; max-width: 42rem; color: #1d1f21; }}
h1 {{ font-size: 1.3rem; }}
dt {{ font-weight: bold; float: left; width: 9rem; }}
dd {{ margin: 0 0 .4rem 9rem; }}
button {{ margin-top: 1rem; padding: .4rem 1rem; }}
</style>
</head>
<body>
<h1>live-serve</h1>
<dl>
<dt>Serving</dt><dd>{root}</dd>
<dt>Address</dt><dd><a href="{local_url}">{local_url}</a></dd>
<dt>Clients</dt><dd id="clients">{clients}</dd>
<dt>Watching</dt><dd>{watching} ({events})</dd>
<dt>Debounce</dt><dd>{debounce} ms</dd>
<dt>CSS inject</dt><dd>{inject}</dd>
</dl>
<button id="reload">Reload all browsers</button>
<script>
document.getElementById("reload").addEventListener("click", () => {{
  fetch("/api/reload", {{ method: "POST" }})
    .then((res) => res.json())
    .then((body) => {{ document.getElementById("clients").textContent = body.clients; }});
}});
</script>
</body>
</html>
"#,
        root = escape_html(&report.root),
        local_url = escape_html(report.local_url),
        clients = report.clients,
        watching = if report.watching { "on" } else { "off" },
        events = escape_html(&events),
        debounce = report.reload_debounce_ms,
        inject = if report.inject_changes { "on" } else { "off" },
    );

    HttpResponse::Ok()
        .content_type("text/html; charset=utf-8")
        .body(body)
}

fn escape_html(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(ch),
        }
    }
    escaped
}
