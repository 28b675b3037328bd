//! Connection transport.
//!
//! A session talks to its peer through a pair of frame channels. Network
//! listeners (WebSocket, TCP) own the socket and pump encoded frames into
//! and out of a [`Transport`]; tests connect two transports back to back
//! with [`duplex_pair`].

use crate::error::{SessionError, SessionResult};
use bytes::Bytes;
use docsync_protocol::Message;
use tokio::sync::mpsc;

/// Default number of frames buffered in each direction.
pub const DEFAULT_CAPACITY: usize = 64;

/// One end of a framed, duplex connection.
#[derive(Debug)]
pub struct Transport {
    outbound: mpsc::Sender<Bytes>,
    inbound: mpsc::Receiver<Bytes>,
}

impl Transport {
    /// Wraps existing channels.
    pub fn new(outbound: mpsc::Sender<Bytes>, inbound: mpsc::Receiver<Bytes>) -> Self {
        Self { outbound, inbound }
    }

    /// Splits into independently owned halves.
    pub fn split(self, compression_level: i32) -> (FrameSender, FrameReceiver) {
        (
            FrameSender {
                tx: self.outbound,
                compression_level,
            },
            FrameReceiver { rx: self.inbound },
        )
    }
}

/// Creates two connected transports.
pub fn duplex_pair(capacity: usize) -> (Transport, Transport) {
    let (a_tx, b_rx) = mpsc::channel(capacity);
    let (b_tx, a_rx) = mpsc::channel(capacity);
    (Transport::new(a_tx, a_rx), Transport::new(b_tx, b_rx))
}

/// Sending half; cheap to clone.
#[derive(Debug, Clone)]
pub struct FrameSender {
    tx: mpsc::Sender<Bytes>,
    compression_level: i32,
}

impl FrameSender {
    /// Encodes and sends a message.
    pub async fn send(&self, msg: &Message) -> SessionResult<()> {
        let frame = msg.encode(self.compression_level)?;
        self.tx
            .send(Bytes::from(frame))
            .await
            .map_err(|_| SessionError::Disconnected)
    }

    /// Returns true once the receiving side has gone away.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Receiving half.
#[derive(Debug)]
pub struct FrameReceiver {
    rx: mpsc::Receiver<Bytes>,
}

impl FrameReceiver {
    /// Receives the next message. `None` when the peer hung up; a frame
    /// that fails to decode is returned as an error without ending the
    /// stream.
    pub async fn recv(&mut self) -> Option<SessionResult<Message>> {
        let frame = self.rx.recv().await?;
        Some(Message::decode(&frame).map_err(SessionError::from))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docsync_protocol::Profile;

    #[tokio::test]
    async fn frames_cross_the_pair() {
        let (a, b) = duplex_pair(4);
        let (a_tx, _a_rx) = a.split(3);
        let (_b_tx, mut b_rx) = b.split(3);

        let mut msg = Message::request(Profile::GetCheckpoint).with_property("client", "c1");
        msg.serial = 5;
        a_tx.send(&msg).await.unwrap();

        let got = b_rx.recv().await.unwrap().unwrap();
        assert_eq!(got, msg);
    }

    #[tokio::test]
    async fn hang_up_is_visible_both_ways() {
        let (a, b) = duplex_pair(4);
        let (a_tx, mut a_rx) = a.split(3);
        drop(b);

        assert!(a_rx.recv().await.is_none());
        assert!(a_tx.is_closed());
        let msg = Message::request(Profile::Handshake);
        assert!(matches!(a_tx.send(&msg).await, Err(SessionError::Disconnected)));
    }

    #[tokio::test]
    async fn garbage_frames_are_errors() {
        let (tx, rx) = mpsc::channel(1);
        let (out_tx, _out_rx) = mpsc::channel::<Bytes>(1);
        let transport = Transport::new(out_tx, rx);
        let (_sender, mut receiver) = transport.split(0);
        tx.send(Bytes::from_static(b"\xff\x00")).await.unwrap();
        assert!(matches!(receiver.recv().await, Some(Err(SessionError::Protocol(_)))));
    }
}
