use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::broadcast;
use tracing::{info, warn};
use uuid::Uuid;

use tandem_types::events::couple_channel;

use crate::dispatcher::Dispatcher;

/// Forward-only event stream for one couple channel.
///
/// Authentication and couple membership were checked at the HTTP upgrade
/// layer; this loop only relays serialized events until the client goes
/// away. Clients send nothing but close/ping frames on this socket.
pub async fn handle_connection(
    socket: WebSocket,
    dispatcher: Dispatcher,
    couple_id: Uuid,
    user_id: Uuid,
) {
    let (mut sender, mut receiver) = socket.split();
    let channel = couple_channel(couple_id);
    info!("User {} connected to {}", user_id, channel);

    dispatcher.connect_user(user_id).await;
    let mut events = dispatcher.subscribe(couple_id).await;

    loop {
        tokio::select! {
            result = events.recv() => {
                match result {
                    Ok(event) => {
                        let text = match serde_json::to_string(&event) {
                            Ok(text) => text,
                            Err(e) => {
                                warn!("Failed to serialize event on {}: {}", channel, e);
                                continue;
                            }
                        };
                        if sender.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Receiver on {} lagged by {} events", channel, n);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    dispatcher.disconnect_user(user_id).await;
    info!("User {} disconnected from {}", user_id, channel);
}
