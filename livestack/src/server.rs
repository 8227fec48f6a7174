//! WebSocket endpoint streaming log lines and display artifacts to viewers.
//!
//! Every connection attaches its own subscription. Each event becomes one JSON text
//! message: `{"type": "livestack_log", "payload": "<line>"}` or
//! `{"type": "livestack_image", "payload": "data:<content-type>;base64,<data>"}`.

use std::future::Future;
use std::io;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::TcpListener;

use crate::broadcast::{Broadcaster, StreamEvent};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "payload")]
pub enum WireMessage {
    #[serde(rename = "livestack_log")]
    Log(String),
    /// Data URL of the encoded image.
    #[serde(rename = "livestack_image")]
    Image(String),
}

impl WireMessage {
    pub fn from_event(event: &StreamEvent) -> Self {
        match event {
            StreamEvent::Log(line) => WireMessage::Log(line.to_string()),
            StreamEvent::Artifact(artifact) => WireMessage::Image(format!(
                "data:{};base64,{}",
                artifact.content_type,
                STANDARD.encode(&artifact.data)
            )),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

pub fn router(broadcaster: Broadcaster) -> Router {
    Router::new()
        .route("/", get(ws_handler))
        .with_state(broadcaster)
}

/// Serves the stream on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, broadcaster: Broadcaster, shutdown: F) -> io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    log::info!("streaming on ws://{}", listener.local_addr()?);
    axum::serve(listener, router(broadcaster))
        .with_graceful_shutdown(shutdown)
        .await
}

async fn ws_handler(ws: WebSocketUpgrade, State(broadcaster): State<Broadcaster>) -> Response {
    ws.on_upgrade(move |socket| session(socket, broadcaster))
}

async fn session(socket: WebSocket, broadcaster: Broadcaster) {
    let mut subscription = broadcaster.attach();
    let id = subscription.id();
    log::info!("viewer {id} connected");

    let (mut sender, mut receiver) = socket.split();

    let mut recv_task = tokio::spawn(async move {
        while let Some(message) = receiver.next().await {
            match message {
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(err) => {
                    log::debug!("viewer receive error: {err}");
                    break;
                }
            }
        }
    });

    loop {
        tokio::select! {
            event = subscription.recv() => {
                let Some(event) = event else {
                    break;
                };
                let text = match WireMessage::from_event(&event).to_json() {
                    Ok(text) => text,
                    Err(err) => {
                        log::warn!("failed to encode stream event: {err}");
                        continue;
                    }
                };
                if let Err(err) = sender.send(Message::Text(text)).await {
                    log::debug!("viewer {id} send error: {err}");
                    break;
                }
            }
            _ = &mut recv_task => break,
        }
    }

    recv_task.abort();
    drop(subscription);
    log::info!("viewer {id} disconnected");
}
