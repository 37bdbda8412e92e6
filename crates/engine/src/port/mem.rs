//! Queue-backed completion port.
//!
//! Identical contract to the kernel port: completions are delivered in post
//! order and a null-overlapped sentinel wakes the worker for shutdown. Used
//! by the in-memory channel family and by every engine test.

use super::{CompletionPacket, IoPort, PortEvent};
use crossbeam::channel::{unbounded, Receiver, Sender};

enum Msg {
    Packet(CompletionPacket),
    Shutdown,
}

pub struct MemPort {
    tx: Sender<Msg>,
    rx: Receiver<Msg>,
}

impl MemPort {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        MemPort { tx, rx }
    }
}

impl Default for MemPort {
    fn default() -> Self {
        MemPort::new()
    }
}

impl IoPort for MemPort {
    fn wait(&self) -> PortEvent {
        match self.rx.recv() {
            Ok(Msg::Packet(packet)) => PortEvent::Packet(packet),
            // All senders gone counts as shutdown
            Ok(Msg::Shutdown) | Err(_) => PortEvent::Shutdown,
        }
    }

    fn post(&self, packet: CompletionPacket) {
        // Receiver lives as long as the port; send cannot fail
        let _ = self.tx.send(Msg::Packet(packet));
    }

    fn post_shutdown(&self) {
        let _ = self.tx.send(Msg::Shutdown);
    }
}
