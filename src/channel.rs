//! Moving tunnel messages over a WebSocket text channel.

use anyhow::{Context, Result, bail};
use futures_util::{Sink, SinkExt};
use tokio_tungstenite::tungstenite::{
    Error as TungsteniteError, Message, error::ProtocolError as WsProtocolError,
};
use tracing::{debug, info};

use crate::protocol::TunnelMessage;

/// Outbound frames a session queues before the writer drains them.
pub const OUTBOUND_QUEUE: usize = 64;

#[derive(Debug)]
pub enum Frame {
    Message(TunnelMessage),
    /// Ping/pong/raw frames handled by the WebSocket layer itself.
    Control,
    Closed,
}

/// Interprets one item read from the channel.
///
/// A peer going away is a normal close. A frame that is not a valid tunnel
/// message is an error; the channel must not be read any further.
pub fn read_frame(item: Option<Result<Message, TungsteniteError>>) -> Result<Frame> {
    match item {
        None => Ok(Frame::Closed),
        Some(Ok(Message::Text(text))) => {
            let message = TunnelMessage::decode(&text).context("Protocol violation")?;
            Ok(Frame::Message(message))
        }
        Some(Ok(Message::Binary(data))) => {
            bail!(
                "Protocol violation: binary frame of {} bytes on text channel",
                data.len()
            )
        }
        Some(Ok(Message::Close(_))) => {
            info!("WebSocket connection closed");
            Ok(Frame::Closed)
        }
        Some(Ok(_)) => Ok(Frame::Control),
        Some(Err(
            e @ (TungsteniteError::ConnectionClosed
            | TungsteniteError::Protocol(WsProtocolError::ResetWithoutClosingHandshake)),
        )) => {
            debug!("Peer disconnected: {e}");
            Ok(Frame::Closed)
        }
        Some(Err(e)) => Err(e).context("WebSocket error"),
    }
}

pub async fn send_frame<S>(sink: &mut S, message: &TunnelMessage) -> Result<()>
where
    S: Sink<Message, Error = TungsteniteError> + Unpin,
{
    let frame = message.encode()?;
    sink.send(Message::Text(frame.into()))
        .await
        .with_context(|| format!("Failed to send {} message", message.kind()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_text_frames() {
        let frame = read_frame(Some(Ok(Message::Text(r#"{"type":"pong"}"#.to_string().into())))).unwrap();
        assert!(matches!(frame, Frame::Message(TunnelMessage::Pong)));
    }

    #[test]
    fn malformed_text_is_a_violation() {
        let err = read_frame(Some(Ok(Message::Text(r#"{"type":"bogus"}"#.to_string().into())))).unwrap_err();
        assert!(err.to_string().contains("Protocol violation"));
    }

    #[test]
    fn binary_frames_are_violations() {
        assert!(read_frame(Some(Ok(Message::Binary(vec![1, 2, 3].into())))).is_err());
    }

    #[test]
    fn peer_disconnects_are_clean_closes() {
        assert!(matches!(read_frame(None).unwrap(), Frame::Closed));
        assert!(matches!(
            read_frame(Some(Ok(Message::Close(None)))).unwrap(),
            Frame::Closed
        ));
        assert!(matches!(
            read_frame(Some(Err(TungsteniteError::ConnectionClosed))).unwrap(),
            Frame::Closed
        ));
    }

    #[test]
    fn websocket_pings_are_control_frames() {
        assert!(matches!(
            read_frame(Some(Ok(Message::Ping(Vec::new().into())))).unwrap(),
            Frame::Control
        ));
    }
}
