//! Bidirectional frame relay between a client and a sandbox stream.
//!
//! The relay copies frames both ways until either side closes or fails,
//! then closes the other side. Binary and text frames pass through
//! untouched; text frames carry the terminal's resize/control messages,
//! which the relay never parses.

use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, PollSender};
use tracing::debug;

use crate::{AppError, Result};

/// Close code for a normal closure.
pub const NORMAL_CLOSURE: u16 = 1000;
/// Close code sent to the surviving leg when its peer failed.
pub const INTERNAL_ERROR: u16 = 1011;

const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Close code and reason carried by a close frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    /// Websocket close code.
    pub code: u16,
    /// Human-readable reason.
    pub reason: String,
}

impl CloseReason {
    /// A normal (1000) closure with `reason`.
    #[must_use]
    pub fn normal(reason: impl Into<String>) -> Self {
        Self {
            code: NORMAL_CLOSURE,
            reason: reason.into(),
        }
    }
}

/// A single message on either leg.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Terminal/display bytes.
    Binary(Bytes),
    /// Text payload, including the opaque resize/control side-channel.
    Text(String),
    /// End of stream.
    Close(Option<CloseReason>),
}

impl Frame {
    fn len(&self) -> usize {
        match self {
            Self::Binary(bytes) => bytes.len(),
            Self::Text(text) => text.len(),
            Self::Close(_) => 0,
        }
    }
}

/// Outgoing half of an endpoint.
pub type FrameSink = Pin<Box<dyn Sink<Frame, Error = AppError> + Send>>;
/// Incoming half of an endpoint.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame>> + Send>>;

/// One side of a relay.
pub struct Endpoint {
    /// Frames written to the peer.
    pub sink: FrameSink,
    /// Frames read from the peer.
    pub stream: FrameStream,
}

/// Which leg of the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Leg {
    /// The public client connection.
    Client,
    /// The sandbox-internal connection.
    Sandbox,
}

impl Leg {
    /// Lowercase leg name for logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::Sandbox => "sandbox",
        }
    }
}

/// Why a relay ended.
#[derive(Debug)]
pub enum RelayOutcome {
    /// Force-closed by the controller (stop, destroy, shutdown).
    Stopped,
    /// `by` closed its stream.
    Closed {
        /// The leg that hung up.
        by: Leg,
    },
    /// I/O failure on `leg`.
    Failed {
        /// The leg that failed.
        leg: Leg,
        /// Underlying error.
        error: AppError,
    },
}

impl RelayOutcome {
    /// Short description for disconnect events.
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::Stopped => "stopped by controller".into(),
            Self::Closed { by: Leg::Client } => "client closed".into(),
            Self::Closed { by: Leg::Sandbox } => "sandbox closed".into(),
            Self::Failed { leg, error } => format!("{} leg failed: {error}", leg.as_str()),
        }
    }
}

enum PumpEnd {
    Closed(Option<CloseReason>),
    Eof,
    ReadFailed(AppError),
    WriteFailed(AppError),
}

/// Copy frames from `stream` into `sink` until the stream ends or fails.
async fn pump(stream: &mut FrameStream, sink: &mut FrameSink) -> PumpEnd {
    let mut frames: u64 = 0;
    let mut bytes: usize = 0;
    let end = loop {
        match stream.next().await {
            None => break PumpEnd::Eof,
            Some(Err(err)) => break PumpEnd::ReadFailed(err),
            Some(Ok(Frame::Close(reason))) => break PumpEnd::Closed(reason),
            Some(Ok(frame)) => {
                bytes += frame.len();
                frames += 1;
                if let Err(err) = sink.send(frame).await {
                    break PumpEnd::WriteFailed(err);
                }
            }
        }
    };
    debug!(frames, bytes, "pump finished");
    end
}

/// Send an optional close frame, then close the sink, bounded by a grace period.
async fn shutdown(sink: &mut FrameSink, close: Option<CloseReason>) {
    let _ = tokio::time::timeout(CLOSE_GRACE, async {
        if let Some(reason) = close {
            let _ = sink.send(Frame::Close(Some(reason))).await;
        }
        let _ = sink.close().await;
    })
    .await;
}

/// Relay frames between `client` and `sandbox` until either side ends or
/// `cancel` fires, then close both sides.
///
/// On cancellation the client receives a normal-closure frame.
///
/// The first leg to end decides the outcome and the other pump is
/// dropped mid-flight; a frame it had already read but not yet
/// forwarded is lost. This only happens while the relay is closing.
pub async fn run(client: Endpoint, sandbox: Endpoint, cancel: &CancellationToken) -> RelayOutcome {
    let Endpoint {
        sink: mut client_sink,
        stream: mut client_stream,
    } = client;
    let Endpoint {
        sink: mut sandbox_sink,
        stream: mut sandbox_stream,
    } = sandbox;

    let (outcome, to_client, to_sandbox) = tokio::select! {
        biased;
        () = cancel.cancelled() => (
            RelayOutcome::Stopped,
            Some(CloseReason::normal("session stopped")),
            Some(CloseReason::normal("session stopped")),
        ),
        end = pump(&mut client_stream, &mut sandbox_sink) => match end {
            PumpEnd::Closed(reason) => (
                RelayOutcome::Closed { by: Leg::Client },
                None,
                Some(reason.unwrap_or_else(|| CloseReason::normal("client closed"))),
            ),
            PumpEnd::Eof => (
                RelayOutcome::Closed { by: Leg::Client },
                None,
                Some(CloseReason::normal("client closed")),
            ),
            PumpEnd::ReadFailed(error) => (
                RelayOutcome::Failed { leg: Leg::Client, error },
                None,
                Some(CloseReason::normal("client disconnected")),
            ),
            PumpEnd::WriteFailed(error) => (
                RelayOutcome::Failed { leg: Leg::Sandbox, error },
                Some(CloseReason { code: INTERNAL_ERROR, reason: "sandbox stream failed".into() }),
                None,
            ),
        },
        end = pump(&mut sandbox_stream, &mut client_sink) => match end {
            PumpEnd::Closed(reason) => (
                RelayOutcome::Closed { by: Leg::Sandbox },
                Some(reason.unwrap_or_else(|| CloseReason::normal("sandbox closed"))),
                None,
            ),
            PumpEnd::Eof => (
                RelayOutcome::Closed { by: Leg::Sandbox },
                Some(CloseReason::normal("sandbox closed")),
                None,
            ),
            PumpEnd::ReadFailed(error) => (
                RelayOutcome::Failed { leg: Leg::Sandbox, error },
                Some(CloseReason { code: INTERNAL_ERROR, reason: "sandbox stream failed".into() }),
                None,
            ),
            PumpEnd::WriteFailed(error) => (
                RelayOutcome::Failed { leg: Leg::Client, error },
                None,
                Some(CloseReason::normal("client disconnected")),
            ),
        },
    };

    shutdown(&mut client_sink, to_client).await;
    shutdown(&mut sandbox_sink, to_sandbox).await;
    outcome
}

/// An in-memory connected endpoint pair; frames sent on one arrive on the other.
#[must_use]
pub fn duplex(capacity: usize) -> (Endpoint, Endpoint) {
    let (a_tx, a_rx) = mpsc::channel::<Frame>(capacity);
    let (b_tx, b_rx) = mpsc::channel::<Frame>(capacity);
    (channel_endpoint(a_tx, b_rx), channel_endpoint(b_tx, a_rx))
}

fn channel_endpoint(tx: mpsc::Sender<Frame>, rx: mpsc::Receiver<Frame>) -> Endpoint {
    let sink = PollSender::new(tx).sink_map_err(|_| AppError::Io("peer endpoint dropped".into()));
    let stream = futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|frame| (Ok(frame), rx))
    });
    Endpoint {
        sink: Box::pin(sink),
        stream: Box::pin(stream),
    }
}
