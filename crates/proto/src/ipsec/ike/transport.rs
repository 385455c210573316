//! Datagram transport of the IKE daemon
//!
//! The engine hands outgoing messages to a [`Transmitter`] after releasing
//! its lock. [`run`] drives an engine from a UDP socket and the timer
//! channel.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::constants::MAX_MESSAGE_LEN;
use super::engine::IkeContext;
use crate::ipsec::logging;
use crate::ipsec::timer::TimerEvent;
use crate::ipsec::{Error, Result};

/// Sender of IKE datagrams
pub trait Transmitter: Send + Sync {
    /// Send `data` to `to`; failures are only logged
    fn send(&self, to: SocketAddr, data: Vec<u8>);
}

/// Transmitter that keeps messages in memory
///
/// Used to connect engines in tests and simulations.
#[derive(Debug, Default)]
pub struct QueueTransmitter {
    queue: Mutex<VecDeque<(SocketAddr, Vec<u8>)>>,
}

impl QueueTransmitter {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Take every queued message, oldest first
    pub fn drain(&self) -> Vec<(SocketAddr, Vec<u8>)> {
        self.queue.lock().drain(..).collect()
    }

    /// Number of queued messages
    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Whether nothing is queued
    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }
}

impl Transmitter for QueueTransmitter {
    fn send(&self, to: SocketAddr, data: Vec<u8>) {
        self.queue.lock().push_back((to, data));
    }
}

/// Transmitter writing to a UDP socket without waiting
#[derive(Debug, Clone)]
pub struct UdpTransmitter {
    socket: Arc<UdpSocket>,
}

impl UdpTransmitter {
    /// Wrap a bound socket
    pub fn new(socket: Arc<UdpSocket>) -> Self {
        UdpTransmitter { socket }
    }
}

impl Transmitter for UdpTransmitter {
    fn send(&self, to: SocketAddr, data: Vec<u8>) {
        if let Err(e) = self.socket.try_send_to(&data, to) {
            warn!(peer = %to, error = %e, "Failed to send IKE message");
        }
    }
}

/// Serve an engine until `shutdown` fires
///
/// Datagrams from `socket` are dispatched as received on `if_index`;
/// events from `timers` are handed to the engine. Failures of single
/// messages are logged by the engine and do not stop the loop.
pub async fn run(
    context: Arc<IkeContext>,
    socket: Arc<UdpSocket>,
    if_index: u32,
    mut timers: mpsc::UnboundedReceiver<TimerEvent>,
    mut shutdown: oneshot::Receiver<()>,
) -> Result<()> {
    let mut buffer = vec![0u8; MAX_MESSAGE_LEN];
    loop {
        tokio::select! {
            received = socket.recv_from(&mut buffer) => {
                let (len, from) = received.map_err(|e| Error::Io(e.to_string()))?;
                if let Err(e) = context.dispatch(&buffer[..len], from, if_index) {
                    debug!(peer = %from, error = %e, "IKE message rejected");
                }
            }
            event = timers.recv() => {
                match event {
                    Some(event) => {
                        if let Err(e) = context.handle_timer(&event) {
                            logging::log_error("timer", &e.to_string());
                        }
                    }
                    None => return Ok(()),
                }
            }
            _ = &mut shutdown => return Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_transmitter() {
        let queue = QueueTransmitter::new();
        let peer: SocketAddr = "10.0.0.2:500".parse().unwrap();
        queue.send(peer, vec![1]);
        queue.send(peer, vec![2]);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.drain(), vec![(peer, vec![1]), (peer, vec![2])]);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_udp_transmitter_delivers() {
        let a = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let to = b.local_addr().unwrap();
        UdpTransmitter::new(a).send(to, b"hello".to_vec());

        let mut buffer = [0u8; 16];
        let (len, _) = b.recv_from(&mut buffer).await.unwrap();
        assert_eq!(&buffer[..len], b"hello");
    }
}
