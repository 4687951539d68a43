//! Adapts an upgraded client websocket into a relay [`Endpoint`].

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::{SinkExt, StreamExt};

use crate::relay::{CloseReason, Endpoint, Frame};
use crate::AppError;

/// Wrap `socket` so the relay can pump [`Frame`]s through it.
///
/// Ping and pong are answered by axum and never reach the relay.
#[must_use]
pub fn client_endpoint(socket: WebSocket) -> Endpoint {
    let (sink, stream) = socket.split();
    let sink = sink
        .sink_map_err(AppError::from)
        .with(|frame: Frame| async move { Ok::<_, AppError>(to_message(frame)) });
    let stream = stream.filter_map(|msg| async move {
        match msg {
            Ok(msg) => from_message(msg).map(Ok),
            Err(err) => Some(Err(AppError::from(err))),
        }
    });

    Endpoint {
        sink: Box::pin(sink),
        stream: Box::pin(stream),
    }
}

fn to_message(frame: Frame) -> Message {
    match frame {
        Frame::Binary(bytes) => Message::Binary(bytes),
        Frame::Text(text) => Message::Text(text.into()),
        Frame::Close(reason) => Message::Close(reason.map(|r| CloseFrame {
            code: r.code,
            reason: r.reason.into(),
        })),
    }
}

fn from_message(msg: Message) -> Option<Frame> {
    match msg {
        Message::Binary(bytes) => Some(Frame::Binary(bytes)),
        Message::Text(text) => Some(Frame::Text(text.as_str().to_owned())),
        Message::Close(frame) => Some(Frame::Close(frame.map(|f| CloseReason {
            code: f.code,
            reason: f.reason.as_str().to_owned(),
        }))),
        Message::Ping(_) | Message::Pong(_) => None,
    }
}
