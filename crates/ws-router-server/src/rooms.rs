use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use futures_util::{SinkExt, StreamExt};
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::Message;
use ws_router::WebSocket;

/// Named broadcast channels. A room exists while it has members.
pub struct Rooms {
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
    capacity: usize,
}

impl Rooms {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    /// Sender and subscription for `room`, creating the room if needed.
    ///
    /// The subscription is taken under the lock so a concurrent
    /// [`leave`](Self::leave) never removes a room that is being joined.
    pub fn join(&self, room: &str) -> (broadcast::Sender<String>, broadcast::Receiver<String>) {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        let tx = channels
            .entry(room.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0);
        (tx.clone(), tx.subscribe())
    }

    /// Drop `room` once nobody is subscribed to it.
    pub fn leave(&self, room: &str) {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        if channels.get(room).is_some_and(|tx| tx.receiver_count() == 0) {
            channels.remove(room);
            tracing::debug!(room, "room closed");
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Relay text frames between `socket` and the other members of `room` until
/// either side closes.
pub async fn serve_member(rooms: &Rooms, room: &str, socket: WebSocket) {
    let (tx, mut rx) = rooms.join(room);
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    // Only fails when no member is subscribed, which cannot
                    // happen while this one is.
                    let _ = tx.send(text.as_str().to_string());
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    tracing::debug!(room, %err, "member socket error");
                    break;
                }
            },
            outgoing = rx.recv() => match outgoing {
                Ok(text) => {
                    if sink.send(Message::text(text)).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(room, skipped, "member lagging; messages dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    drop(rx);
    rooms.leave(room);
}
