use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use tracing::{debug, error, info, warn};

use crate::errors::AppError;
use crate::models::{GenerateBody, VoiceCommand, WsEvent};
use crate::service::game_service::GameService;
use crate::session::text::GenerationEvent;
use crate::session::voice::ConversationSnapshot;

/// GET `/ws/generate` — upgrades to a WebSocket for streaming generation.
pub async fn ws_generate_handler(
    ws: WebSocketUpgrade,
    State(svc): State<GameService>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_generate_socket(socket, svc))
}

/// Handles a single generation socket.
///
/// Protocol:
/// - Client sends JSON `{ "instruction": "..." }`
/// - Server streams back:
///   1. `{ "type": "stream_start", "instruction": "..." }`
///   2. `{ "type": "stream_chunk", "content": "..." }` (repeated)
///   3. `{ "type": "stream_end", "version": 2, "elapsed_ms": 8100 }`
///   or `{ "type": "error", "kind": "...", "message": "..." }` on failure.
async fn handle_generate_socket(mut socket: WebSocket, svc: GameService) {
    info!("Generation socket connected");

    while let Some(msg) = socket.recv().await {
        let msg = match msg {
            Ok(m) => m,
            Err(e) => {
                warn!("WebSocket receive error: {e}");
                break;
            }
        };

        let text = match &msg {
            Message::Text(t) => t.to_string(),
            Message::Close(_) => break,
            _ => continue,
        };

        let body: GenerateBody = match serde_json::from_str(&text) {
            Ok(b) => b,
            Err(e) => {
                let err = AppError::invalid_input(format!("Invalid request: {e}"));
                send_event(&mut socket, &WsEvent::from(&err)).await;
                continue;
            }
        };

        if !stream_iteration(&mut socket, &svc, &body.instruction).await {
            break;
        }
    }

    info!("Generation socket disconnected");
}

/// Runs one iteration and relays it over the socket. Returns `false` once
/// the client is gone, which also cancels the in-flight call.
async fn stream_iteration(socket: &mut WebSocket, svc: &GameService, instruction: &str) -> bool {
    let mut stream = match svc.start_iteration(instruction).await {
        Ok(stream) => stream,
        Err(e) => return send_event(socket, &WsEvent::from(&e)).await,
    };

    let start = WsEvent::StreamStart { instruction: instruction.trim().to_string() };
    if !send_event(socket, &start).await {
        return false;
    }

    while let Some(event) = stream.next().await {
        match event {
            GenerationEvent::Partial(content) => {
                if !send_event(socket, &WsEvent::StreamChunk { content }).await {
                    debug!("Client left during generation {}", stream.id());
                    return false;
                }
            }
            GenerationEvent::Completed(result) => {
                let event = match svc.complete_iteration(&result).await {
                    Ok(version) => WsEvent::StreamEnd { version, elapsed_ms: result.elapsed_ms },
                    Err(e) => {
                        warn!("Generation {} produced no usable document: {e}", stream.id());
                        WsEvent::from(&e)
                    }
                };
                return send_event(socket, &event).await;
            }
            GenerationEvent::Failed(e) => return send_event(socket, &WsEvent::from(&e)).await,
        }
    }

    error!("Generation {} ended without a terminal event", stream.id());
    true
}

/// GET `/ws/voice` — upgrades to a WebSocket carrying one voice conversation.
pub async fn ws_voice_handler(
    ws: WebSocketUpgrade,
    State(svc): State<GameService>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_voice_socket(socket, svc))
}

/// Handles a single voice socket.
///
/// Binary frames are microphone audio; `{ "type": "finalize" }` turns the
/// conversation into a generation relayed like `/ws/generate`. Every state
/// change is pushed as a `voice_state` event. The conversation always ends
/// with the socket.
async fn handle_voice_socket(mut socket: WebSocket, svc: GameService) {
    info!("Voice socket connected");
    let session = svc.new_voice_session();
    let mut states = session.subscribe();

    if let Err(e) = session.start_session().await {
        send_event(&mut socket, &WsEvent::from(&e)).await;
        session.end_session().await;
        return;
    }

    loop {
        tokio::select! {
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let event = voice_state(&states.borrow_and_update());
                if !send_event(&mut socket, &event).await {
                    break;
                }
            }
            msg = socket.recv() => {
                let msg = match msg {
                    Some(Ok(m)) => m,
                    Some(Err(e)) => {
                        warn!("WebSocket receive error: {e}");
                        break;
                    }
                    None => break,
                };
                match msg {
                    Message::Binary(pcm) => {
                        if let Err(e) = session.send_audio(&pcm).await {
                            if !send_event(&mut socket, &WsEvent::from(&e)).await {
                                break;
                            }
                        }
                    }
                    Message::Text(t) => {
                        match serde_json::from_str::<VoiceCommand>(t.as_str()) {
                            Ok(VoiceCommand::Finalize) => {
                                let delivered = match session.finalize_description() {
                                    Ok(description) => {
                                        info!("Finalized voice description ({} chars)", description.len());
                                        stream_iteration(&mut socket, &svc, &description).await
                                    }
                                    Err(e) => send_event(&mut socket, &WsEvent::from(&e)).await,
                                };
                                if !delivered {
                                    break;
                                }
                            }
                            Err(e) => debug!("Ignoring unknown voice command: {e}"),
                        }
                    }
                    Message::Close(_) => break,
                    _ => continue,
                }
            }
        }
    }

    session.end_session().await;
    info!("Voice socket disconnected");
}

fn voice_state(snapshot: &ConversationSnapshot) -> WsEvent {
    WsEvent::VoiceState {
        status: snapshot.status,
        mode: snapshot.mode,
        transcript: snapshot.transcript.clone(),
    }
}

/// Helper: serialize a `WsEvent` and send it over the socket. Returns whether
/// the frame went out.
async fn send_event(socket: &mut WebSocket, event: &WsEvent) -> bool {
    match serde_json::to_string(event) {
        Ok(json) => socket.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            error!("Failed to encode socket event: {e}");
            true
        }
    }
}
