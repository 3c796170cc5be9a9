//! Deferred release of in-memory file state.
//!
//! A file that was evicted or removed cannot be released while a
//! construction still holds its blocks. The constructor queues such files
//! here once they are clean; a worker thread drops them outside the
//! constructor's critical path.

use crate::construct::Shared;
use crate::error::CoreResult;
use crate::types::Ino;
use crossbeam_channel::{unbounded, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{error, trace};

#[derive(Debug)]
pub(crate) struct DropQueue {
    tx: Option<Sender<Ino>>,
    worker: Option<JoinHandle<()>>,
}

impl DropQueue {
    pub(crate) fn spawn(shared: Arc<Shared>) -> CoreResult<Self> {
        let (tx, rx) = unbounded::<Ino>();
        let worker = thread::Builder::new()
            .name("segfs-drop".to_string())
            .spawn(move || {
                for ino in rx {
                    let dropped = shared.state.lock().files.drop_if_clean(ino);
                    trace!(target: "segfs::segctor", ino = ino.0, dropped, "drop queue");
                }
            })?;
        Ok(Self {
            tx: Some(tx),
            worker: Some(worker),
        })
    }

    /// A sender for the constructor and foreground evictions.
    pub(crate) fn sender(&self) -> Option<Sender<Ino>> {
        self.tx.clone()
    }

    pub(crate) fn send(&self, ino: Ino) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(ino);
        }
    }

    /// Stops the worker once every queued file is handled.
    ///
    /// Every other sender must be gone first, or this blocks.
    pub(crate) fn shutdown(&mut self) {
        self.tx = None;
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!(target: "segfs::segctor", "drop queue worker panicked");
            }
        }
    }
}
