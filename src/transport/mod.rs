//! Client-facing transport: the websocket endpoint and its message format.

pub mod protocol;
pub mod server;

use tokio::sync::mpsc;

use crate::transport::protocol::ServerMessage;

/// Outbound queue to one client's socket writer.
///
/// Unbounded so that producers (audio relay, coordinator, session) never
/// block on a slow client; the writer task drains it in order.
pub type ClientSender = mpsc::UnboundedSender<ServerMessage>;

/// Receiving end of [`ClientSender`].
pub type ClientReceiver = mpsc::UnboundedReceiver<ServerMessage>;

/// Create a client queue.
pub fn client_channel() -> (ClientSender, ClientReceiver) {
    mpsc::unbounded_channel()
}
