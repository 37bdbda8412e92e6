//! engine

use crate::{port::IoPort, worker};
use crossbeam::channel::{bounded, Receiver, RecvTimeoutError};
use std::{sync::Arc, thread::JoinHandle, time::Duration};
use tracing::{debug, warn};

/// How long engine teardown waits for the worker to acknowledge the
/// shutdown sentinel before giving up on it
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Owns the completion port and the worker thread servicing it.
///
/// Channel families post their overlapped operations against the engine's
/// port; completions flow back through the worker into the per-channel
/// handlers. Dropping the engine posts the shutdown sentinel and waits a
/// bounded grace period for the worker to exit.
pub struct Engine {
    port: Arc<dyn IoPort>,
    #[cfg(windows)]
    iocp: Option<Arc<crate::port::IocpPort>>,
    worker: Option<JoinHandle<()>>,
    ack: Receiver<()>,
}

impl Engine {
    /// Build an engine around any port backend
    pub fn with_port(port: Arc<dyn IoPort>) -> Engine {
        let (tx, ack) = bounded(1);
        let worker_port = Arc::clone(&port);
        let worker = std::thread::Builder::new()
            .name("portchan-worker".into())
            .spawn(move || worker::run(worker_port, tx))
            .expect("spawning the completion worker");
        Engine {
            port,
            #[cfg(windows)]
            iocp: None,
            worker: Some(worker),
            ack,
        }
    }

    /// Build an engine over a real I/O completion port
    #[cfg(windows)]
    pub fn new() -> std::io::Result<Engine> {
        let iocp = Arc::new(crate::port::IocpPort::new()?);
        let mut engine = Engine::with_port(Arc::clone(&iocp) as Arc<dyn IoPort>);
        engine.iocp = Some(iocp);
        Ok(engine)
    }

    pub fn port(&self) -> &Arc<dyn IoPort> {
        &self.port
    }

    /// The typed completion port, when the engine runs on one. Socket
    /// families need it to associate their handles.
    #[cfg(windows)]
    pub fn iocp(&self) -> Option<&Arc<crate::port::IocpPort>> {
        self.iocp.as_ref()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.port.post_shutdown();
        match self.ack.recv_timeout(SHUTDOWN_GRACE) {
            Ok(()) => {
                if let Some(worker) = self.worker.take() {
                    let _ = worker.join();
                }
                debug!("engine worker joined");
            }
            Err(RecvTimeoutError::Timeout) => {
                // No portable forced termination; the thread is abandoned
                warn!("engine worker did not stop in time; detaching");
                drop(self.worker.take());
            }
            Err(RecvTimeoutError::Disconnected) => {
                if let Some(worker) = self.worker.take() {
                    let _ = worker.join();
                }
            }
        }
    }
}
