//! In-memory TUN double.
//!
//! Frames written by the code under test are captured for inspection;
//! frames injected by the test are read back as if they arrived from the
//! kernel. Closing the incoming side yields end-of-stream, which is how
//! tests simulate device shutdown.

use std::io;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use sshtun_core::pump::PacketIo;

/// Fake TUN device; clones share the same queues.
#[derive(Clone)]
pub struct FakeTun {
    name: String,
    incoming_tx: Arc<Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>>,
    incoming_rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>>,
    outgoing: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl FakeTun {
    pub fn new(name: &str) -> FakeTun {
        let (tx, rx) = mpsc::unbounded_channel();
        FakeTun {
            name: name.to_string(),
            incoming_tx: Arc::new(Mutex::new(Some(tx))),
            incoming_rx: Arc::new(tokio::sync::Mutex::new(rx)),
            outgoing: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue a frame as if received from the kernel.
    pub fn inject_packet(&self, packet: Vec<u8>) {
        if let Some(tx) = self.incoming_tx.lock().unwrap().as_ref() {
            let _ = tx.send(packet);
        }
    }

    /// End the incoming stream; pending reads observe EOF after the
    /// already-queued frames drain.
    pub fn close_incoming(&self) {
        self.incoming_tx.lock().unwrap().take();
    }

    /// Frames written to the device so far, oldest first.
    pub fn take_outgoing(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut *self.outgoing.lock().unwrap())
    }

    pub fn outgoing_count(&self) -> usize {
        self.outgoing.lock().unwrap().len()
    }
}

#[async_trait::async_trait]
impl PacketIo for FakeTun {
    async fn read_packet(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut rx = self.incoming_rx.lock().await;
        match rx.recv().await {
            Some(packet) => {
                let n = packet.len().min(buf.len());
                buf[..n].copy_from_slice(&packet[..n]);
                Ok(n)
            }
            None => Ok(0),
        }
    }

    async fn write_packet(&self, buf: &[u8]) -> io::Result<()> {
        self.outgoing.lock().unwrap().push(buf.to_vec());
        Ok(())
    }
}
