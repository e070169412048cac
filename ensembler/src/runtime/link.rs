use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::ProtocolError;
use crate::events::Event;
use crate::protocol::{Envelope, Frame, PeerRole};

use super::evaluator::Inbound;

/// Cloneable sending half of a [`PeerLink`].
#[derive(Clone, Debug)]
pub struct PeerSender {
    identity: String,
    inbound: mpsc::UnboundedSender<Inbound>,
}

impl PeerSender {
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Deliver a frame to the evaluator as if it arrived from this peer.
    pub fn send(&self, frame: Frame) -> Result<(), ProtocolError> {
        self.inbound
            .send(Inbound::Frame(Envelope {
                identity: self.identity.clone(),
                frame,
            }))
            .map_err(|_| ProtocolError::Closed)
    }
}

/// In-process transport between one peer and the evaluator.
///
/// Created by [`EvaluatorHandle::attach`](super::EvaluatorHandle::attach).
/// Attaching is not connecting: the peer still has to send `CONNECT` before
/// anything else. Dropping the link detaches the transport without a
/// protocol-level `DISCONNECT`, like a dropped socket.
#[derive(Debug)]
pub struct PeerLink {
    sender: PeerSender,
    link_id: Uuid,
    outbound: mpsc::UnboundedReceiver<Frame>,
    next_seq: u64,
}

impl PeerLink {
    pub(crate) fn new(
        identity: String,
        link_id: Uuid,
        inbound: mpsc::UnboundedSender<Inbound>,
        outbound: mpsc::UnboundedReceiver<Frame>,
    ) -> Self {
        Self {
            sender: PeerSender { identity, inbound },
            link_id,
            outbound,
            next_seq: 0,
        }
    }

    pub fn identity(&self) -> &str {
        self.sender.identity()
    }

    pub fn sender(&self) -> PeerSender {
        self.sender.clone()
    }

    pub fn send(&self, frame: Frame) -> Result<(), ProtocolError> {
        self.sender.send(frame)
    }

    /// Next frame from the evaluator. `None` once the evaluator dropped this
    /// link, either because it shut down or because the peer timed out.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.outbound.recv().await
    }

    /// Next frame if one is already queued.
    pub fn try_recv(&mut self) -> Option<Frame> {
        self.outbound.try_recv().ok()
    }

    pub fn connect(&self, role: PeerRole) -> Result<(), ProtocolError> {
        self.send(Frame::Connect {
            identity: self.identity().to_string(),
            role,
        })
    }

    pub fn disconnect(&self) -> Result<(), ProtocolError> {
        self.send(Frame::Disconnect)
    }

    pub fn heartbeat(&self) -> Result<(), ProtocolError> {
        self.send(Frame::Heartbeat)
    }

    pub fn ack(&self, event_id: u64) -> Result<(), ProtocolError> {
        self.send(Frame::Ack { event_id })
    }

    /// Send an event under the next sequence number and return that number.
    pub fn send_event(&mut self, event: Event) -> Result<u64, ProtocolError> {
        self.next_seq += 1;
        let seq = self.next_seq;
        self.send(Frame::Event { seq, event })?;
        Ok(seq)
    }
}

impl Drop for PeerLink {
    fn drop(&mut self) {
        let _ = self.sender.inbound.send(Inbound::Detach {
            identity: self.sender.identity.clone(),
            link_id: self.link_id,
        });
    }
}
