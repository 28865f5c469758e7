use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use uuid::Uuid;

use parley_protocol::{ClientMessage, DtlsParameters, MediaKind, RtpCapabilities, RtpParameters, ServerMessage};

use crate::error::MediaError;
use crate::media::RoomEvents;
use crate::state::AppState;

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let connection_id = Uuid::new_v4();
    tracing::info!("WebSocket connection {connection_id} established");

    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    state.connections.add_connection(connection_id, tx).await;

    // Outbound messages are funneled through a channel so broadcasts from
    // other tasks and direct replies share one writer.
    let mut send_task = tokio::spawn(async move {
        while let Some(payload) = rx.recv().await {
            if sink.send(Message::Text(payload.into())).await.is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(message) => {
                                handle_client_message(&state, connection_id, message).await;
                            }
                            Err(err) => {
                                tracing::debug!("Unparseable message from {connection_id}: {err}");
                                state
                                    .connections
                                    .send_to_connection(connection_id, &ServerMessage::Error {
                                        message: "Invalid message format".to_string(),
                                    })
                                    .await;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        tracing::debug!("WebSocket error on {connection_id}: {err}");
                        break;
                    }
                }
            }
            _ = &mut send_task => break,
        }
    }

    handle_disconnect(&state, connection_id).await;
    send_task.abort();
    tracing::info!("WebSocket connection {connection_id} closed");
}

async fn handle_client_message(state: &AppState, connection_id: Uuid, message: ClientMessage) {
    let reply = match message {
        ClientMessage::JoinRoom {
            room_code,
            user_id,
            peer_name,
        } => handle_join_room(state, connection_id, room_code, user_id, peer_name).await,
        ClientMessage::LeaveRoom => handle_leave_room(state, connection_id).await,
        ClientMessage::GetRouterRtpCapabilities { room_id } => {
            handle_get_router_rtp_capabilities(state, room_id).await
        }
        ClientMessage::CreateWebrtcTransport { producing } => {
            handle_create_webrtc_transport(state, connection_id, producing).await
        }
        ClientMessage::ConnectWebrtcTransport {
            transport_id,
            dtls_parameters,
        } => handle_connect_webrtc_transport(state, connection_id, transport_id, dtls_parameters)
            .await,
        ClientMessage::Produce {
            transport_id,
            kind,
            rtp_parameters,
            app_data,
        } => handle_produce(state, connection_id, transport_id, kind, rtp_parameters, app_data)
            .await,
        ClientMessage::Consume {
            producer_id,
            rtp_capabilities,
        } => handle_consume(state, connection_id, producer_id, rtp_capabilities).await,
        ClientMessage::ResumeConsumer { consumer_id } => {
            handle_resume_consumer(state, connection_id, consumer_id).await
        }
        ClientMessage::GetPeers => handle_get_peers(state, connection_id).await,
    };
    state
        .connections
        .send_to_connection(connection_id, &reply)
        .await;
}

/// User-facing message for a failed join; internals stay in the logs.
fn friendly_join_error(err: &MediaError) -> String {
    match err.root() {
        MediaError::Validation(message) => message.clone(),
        MediaError::NotFound(_) => "Room not found".to_string(),
        MediaError::NoWorkersAvailable => {
            "Media servers are at capacity, please try again shortly".to_string()
        }
        _ => "Could not join the room".to_string(),
    }
}

async fn handle_join_room(
    state: &AppState,
    connection_id: Uuid,
    room_code: String,
    user_id: Option<Uuid>,
    peer_name: String,
) -> ServerMessage {
    match join_room(state, connection_id, room_code, user_id, peer_name).await {
        Ok(reply) => reply,
        Err(err) => {
            tracing::warn!("Join failed for connection {connection_id}: {err}");
            ServerMessage::JoinRoomError {
                message: friendly_join_error(&err),
            }
        }
    }
}

async fn join_room(
    state: &AppState,
    connection_id: Uuid,
    room_code: String,
    user_id: Option<Uuid>,
    peer_name: String,
) -> Result<ServerMessage, MediaError> {
    let peer_name = peer_name.trim().to_string();
    if peer_name.is_empty() {
        return Err(MediaError::Validation("Peer name is required".to_string()));
    }
    if state.media.get_peer_by_connection(connection_id).await?.is_some() {
        return Err(MediaError::Validation(
            "Already in a room, leave it first".to_string(),
        ));
    }

    let room_id = state
        .rooms
        .room_id_by_code(&room_code)
        .await?
        .ok_or_else(|| MediaError::NotFound(format!("room with code {room_code}")))?;

    let router = state.media.get_or_create_room(room_id).await?;
    let peer = state
        .media
        .add_peer(room_id, user_id, peer_name, connection_id)
        .await?;
    state.connections.join_room(connection_id, room_id).await;

    state
        .connections
        .broadcast_to_room(room_id, Some(connection_id), &ServerMessage::NewPeer {
            peer_id: peer.peer_id,
            peer_name: peer.peer_name.clone(),
        })
        .await;

    let existing_producers = state
        .media
        .producers_in_room(room_id, Some(connection_id))
        .await?;
    let existing_peers = state
        .media
        .existing_peers_in_room(room_id, Some(connection_id))
        .await?;

    Ok(ServerMessage::JoinRoomSuccess {
        room_id,
        rtp_capabilities: router.rtp_capabilities(),
        existing_producers,
        existing_peers,
    })
}

/// Leaving always succeeds from the client's point of view; teardown
/// problems are logged and the TTL backstop reaps whatever remains.
async fn handle_leave_room(state: &AppState, connection_id: Uuid) -> ServerMessage {
    teardown_peer(state, connection_id).await;
    ServerMessage::LeaveRoomSuccess
}

async fn teardown_peer(state: &AppState, connection_id: Uuid) {
    match state.media.get_peer_by_connection(connection_id).await {
        Ok(Some(peer)) => {
            state
                .connections
                .broadcast_to_room(peer.room_id, Some(connection_id), &ServerMessage::PeerLeft {
                    peer_id: peer.peer_id,
                })
                .await;
        }
        Ok(None) => {}
        Err(err) => {
            tracing::warn!("Could not read peer for connection {connection_id}: {err}");
        }
    }

    let left = state.connections.leave_room(connection_id).await;

    if let Err(err) = state.media.close_peer(connection_id).await {
        tracing::error!("Teardown for connection {connection_id} failed: {err}");
    }

    if let Some((room_id, true)) = left {
        if let Err(err) = state.media.close_room(room_id).await {
            tracing::error!("Could not close empty room {room_id}: {err}");
        }
    }
}

async fn handle_get_router_rtp_capabilities(state: &AppState, room_id: Uuid) -> ServerMessage {
    match state.media.get_router_rtp_capabilities(room_id).await {
        Ok(rtp_capabilities) => ServerMessage::RouterRtpCapabilities {
            success: true,
            rtp_capabilities: Some(rtp_capabilities),
            error: None,
        },
        Err(err) => ServerMessage::RouterRtpCapabilities {
            success: false,
            rtp_capabilities: None,
            error: Some(err.to_string()),
        },
    }
}

async fn handle_create_webrtc_transport(
    state: &AppState,
    connection_id: Uuid,
    producing: bool,
) -> ServerMessage {
    match state
        .media
        .create_webrtc_transport(connection_id, producing)
        .await
    {
        Ok(transport) => ServerMessage::WebrtcTransportCreated {
            success: true,
            id: Some(transport.id()),
            ice_parameters: Some(transport.ice_parameters()),
            ice_candidates: Some(transport.ice_candidates()),
            dtls_parameters: Some(transport.dtls_parameters()),
            error: None,
        },
        Err(err) => ServerMessage::WebrtcTransportCreated {
            success: false,
            id: None,
            ice_parameters: None,
            ice_candidates: None,
            dtls_parameters: None,
            error: Some(err.to_string()),
        },
    }
}

async fn handle_connect_webrtc_transport(
    state: &AppState,
    connection_id: Uuid,
    transport_id: Uuid,
    dtls_parameters: DtlsParameters,
) -> ServerMessage {
    match state
        .media
        .connect_webrtc_transport(connection_id, transport_id, dtls_parameters)
        .await
    {
        Ok(()) => ServerMessage::WebrtcTransportConnected {
            success: true,
            error: None,
        },
        Err(err) => ServerMessage::WebrtcTransportConnected {
            success: false,
            error: Some(err.to_string()),
        },
    }
}

async fn handle_produce(
    state: &AppState,
    connection_id: Uuid,
    transport_id: Uuid,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    app_data: Option<serde_json::Value>,
) -> ServerMessage {
    match state
        .media
        .produce(connection_id, transport_id, kind, rtp_parameters, app_data)
        .await
    {
        Ok(producer_id) => ServerMessage::Produced {
            success: true,
            id: Some(producer_id),
            error: None,
        },
        Err(err) => ServerMessage::Produced {
            success: false,
            id: None,
            error: Some(err.to_string()),
        },
    }
}

async fn handle_consume(
    state: &AppState,
    connection_id: Uuid,
    producer_id: Uuid,
    rtp_capabilities: RtpCapabilities,
) -> ServerMessage {
    match state
        .media
        .consume(connection_id, producer_id, rtp_capabilities)
        .await
    {
        Ok(info) => ServerMessage::Consumed {
            success: true,
            id: Some(info.id),
            producer_id: Some(info.producer_id),
            kind: Some(info.kind),
            rtp_parameters: Some(info.rtp_parameters),
            app_data: info.app_data,
            error: None,
        },
        Err(err) => ServerMessage::Consumed {
            success: false,
            id: None,
            producer_id: None,
            kind: None,
            rtp_parameters: None,
            app_data: None,
            error: Some(err.to_string()),
        },
    }
}

async fn handle_resume_consumer(
    state: &AppState,
    connection_id: Uuid,
    consumer_id: Uuid,
) -> ServerMessage {
    match state.media.resume_consumer(connection_id, consumer_id).await {
        Ok(()) => ServerMessage::ConsumerResumed {
            success: true,
            error: None,
        },
        Err(err) => ServerMessage::ConsumerResumed {
            success: false,
            error: Some(err.to_string()),
        },
    }
}

async fn handle_get_peers(state: &AppState, connection_id: Uuid) -> ServerMessage {
    let peers = match state.media.get_peer_by_connection(connection_id).await {
        Ok(Some(peer)) => state
            .media
            .existing_peers_in_room(peer.room_id, Some(connection_id))
            .await
            .unwrap_or_else(|err| {
                tracing::warn!("Could not list peers for connection {connection_id}: {err}");
                Vec::new()
            }),
        Ok(None) => Vec::new(),
        Err(err) => {
            tracing::warn!("Could not read peer for connection {connection_id}: {err}");
            Vec::new()
        }
    };
    ServerMessage::PeersList { peers }
}

async fn handle_disconnect(state: &AppState, connection_id: Uuid) {
    teardown_peer(state, connection_id).await;
    state.connections.remove_connection(connection_id).await;
}
