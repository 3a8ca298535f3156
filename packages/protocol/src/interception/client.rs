// packages/protocol/src/interception/client.rs
//! Sink through which a protocol handler reports back to the host
//!
//! Events arrive in transport order: `Response`, any number of `Data`, then
//! `Finished`; or a single `Failed`. A streamed body that breaks after the
//! metadata went out ends with `Failed` in place of `Finished`, so the host
//! may see `Response`, some `Data`, then `Failed`.

use crate::utils::errors::InterceptError;
use bytes::Bytes;
use hyper::{HeaderMap, StatusCode};
use tokio::sync::mpsc;

/// One callback in a request's completion path
///
/// Exactly one terminal event (`Finished` or `Failed`) is emitted per
/// request unless it was stopped first. `Failed` normally stands alone, but
/// may follow `Response` and `Data` when the body stream malfunctions.
#[derive(Debug)]
pub enum TransportEvent {
    Response { status: StatusCode, headers: HeaderMap },
    Data(Bytes),
    Finished,
    Failed(InterceptError),
}

impl TransportEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransportEvent::Finished | TransportEvent::Failed(_))
    }
}

/// Receiver of transport events for one request
///
/// `emit` runs under the emitting task's state lock and must not call back
/// into that task.
pub trait ProtocolClient: Send + Sync {
    fn emit(&self, event: TransportEvent);
}

impl ProtocolClient for mpsc::UnboundedSender<TransportEvent> {
    fn emit(&self, event: TransportEvent) {
        // The host may have dropped the request; nothing left to notify
        let _ = self.send(event);
    }
}

/// Channel-backed client, returning the receiving half for the host
pub fn channel_client() -> (
    mpsc::UnboundedSender<TransportEvent>,
    mpsc::UnboundedReceiver<TransportEvent>,
) {
    mpsc::unbounded_channel()
}
