//! C8 — Progress Stream: bridges the per-job pub/sub channel to a
//! server-push WebSocket connection (§4.8).
//!
//! This is a plain `poem` handler, not a `poem_openapi` operation — like the
//! teacher's own worker-connect endpoint, a WebSocket upgrade doesn't fit the
//! `OpenApi` macro, so it is nested into the route tree separately.

use futures_util::{SinkExt, StreamExt};
use poem::web::websocket::{Message, WebSocket, WebSocketStream};
use poem::web::{Data, Path};
use poem::{handler, Endpoint, IntoResponse, Request, Response, Route};
use tracing::Instrument;

use crate::auth::bearer_token_from_request;
use crate::bootstrap::Services;
use crate::model::{JobId, JobRecord, ProgressEvent};
use crate::repo::progress_channel_key;

pub fn route(services: Services) -> impl Endpoint {
    Route::new().at("/jobs/:job_id", ws.data(services))
}

#[handler]
fn ws(Path(job_id): Path<String>, req: &Request, websocket: WebSocket, Data(services): Data<&Services>) -> Response {
    let job_id = JobId(job_id);
    let services = services.clone();
    let owner_token = if services.config.auth_enabled {
        match bearer_token_from_request(req) {
            Some(token) => Some(token),
            // §6.1: auth is required whenever enabled, same as the REST surface.
            None => return Response::builder().status(poem::http::StatusCode::UNAUTHORIZED).finish(),
        }
    } else {
        None
    };

    websocket
        .on_upgrade(move |socket| {
            async move {
                let record = match services.repo.read(&job_id).await {
                    Ok(Some(record)) => record,
                    // §4.8 step 1: refuse the connection if the job is unknown.
                    _ => return,
                };

                if let Some(token) = owner_token {
                    match services.authenticator.authenticate(&token).await {
                        Ok(principal) if principal.owner_token == record.owner_token => {}
                        // A job's progress stream is only visible to its owner.
                        _ => return,
                    }
                }

                forward_progress(services, job_id, record, socket).await;
            }
            .in_current_span()
        })
        .into_response()
}

async fn forward_progress(services: Services, job_id: JobId, record: JobRecord, socket: WebSocketStream) {
    let (mut sink, mut client_messages) = socket.split();

    let snapshot = ProgressEvent::Status {
        status: record.status.as_str().to_string(),
        progress: record.progress,
    };
    if !send_event(&mut sink, &snapshot).await {
        return;
    }
    if record.status.is_terminal() {
        return;
    }

    let channel = progress_channel_key(&services.config.kv.key_prefix, &job_id);
    let mut progress_messages = match services.kv.subscribe(&channel).await {
        Ok(stream) => stream,
        Err(_) => return,
    };

    loop {
        tokio::select! {
            frame = progress_messages.next() => {
                let Some(payload) = frame else { break };
                let is_done = serde_json::from_str::<ProgressEvent>(&payload)
                    .map(|event| matches!(event, ProgressEvent::Done { .. }))
                    .unwrap_or(false);
                if sink.send(Message::Text(payload)).await.is_err() {
                    break;
                }
                if is_done {
                    break;
                }
            }
            client_frame = client_messages.next() => {
                match client_frame {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }

    let _ = sink.close().await;
}

async fn send_event(
    sink: &mut futures_util::stream::SplitSink<WebSocketStream, Message>,
    event: &ProgressEvent,
) -> bool {
    match serde_json::to_string(event) {
        Ok(json) => sink.send(Message::Text(json)).await.is_ok(),
        Err(_) => false,
    }
}
