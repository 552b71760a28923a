use actix_web::{HttpRequest, HttpResponse, web};
use actix_ws::Message;
use futures_util::StreamExt;

use crate::startup::AppState;

pub fn build_internal_scope() -> actix_web::Scope {
    web::scope("/_live")
        .route("/health", web::get().to(|| async { "OK" }))
        .route("/script.js", web::get().to(script))
        .route("/ws", web::get().to(ws_handler))
}

async fn script() -> HttpResponse {
    HttpResponse::Ok()
        .append_header(("Cache-Control", "no-store, max-age=0"))
        .content_type("application/javascript")
        .body(include_str!("./js/client.js"))
}

async fn ws_handler(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> actix_web::Result<HttpResponse> {
    let (response, mut session, mut msg_stream) = actix_ws::handle(&req, stream)?;
    let mut subscription = state.broadcaster.subscribe();

    let peer = req
        .peer_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|| String::from("unknown"));
    let log_connections = state.log_connections;
    if log_connections {
        tracing::info!(%peer, clients = state.broadcaster.client_count(), "browser connected");
    } else {
        tracing::debug!(%peer, clients = state.broadcaster.client_count(), "browser connected");
    }

    actix_web::rt::spawn(async move {
        loop {
            tokio::select! {
                message = subscription.recv() => {
                    let Some(message) = message else { break };
                    match serde_json::to_string(&message) {
                        Ok(payload) => {
                            if session.text(payload).await.is_err() {
                                break;
                            }
                        }
                        Err(error) => {
                            tracing::error!(%error, "failed to serialize live message");
                        }
                    }
                }
                incoming = msg_stream.next() => {
                    match incoming {
                        Some(Ok(Message::Ping(bytes))) => {
                            if session.pong(&bytes).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Close(reason))) => {
                            let _ = session.close(reason).await;
                            break;
                        }
                        Some(Ok(
                            Message::Text(_)
                            | Message::Binary(_)
                            | Message::Continuation(_)
                            | Message::Pong(_)
                            | Message::Nop,
                        )) => {}
                        Some(Err(_)) | None => break,
                    }
                }
            }
        }

        // Unregister before logging so the count is already accurate.
        drop(subscription);
        if log_connections {
            tracing::info!(%peer, "browser disconnected");
        } else {
            tracing::debug!(%peer, "browser disconnected");
        }
    });

    Ok(response)
}
