//! Deferred buffer processing off the dispatch path
//!
//! The transport's dispatch thread must never touch storage or the display;
//! it only queues work items here. A single worker drains the queue in
//! FIFO order, which is also completion-signal order, so payloads are
//! consumed exactly as the remote produced them.

use std::thread::JoinHandle;

use tracing::debug;

use crate::mmal::wire::BufferTransfer;

/// One returned buffer waiting for host-side processing.
#[derive(Debug, Clone, Copy)]
pub struct WorkItem {
    pub buffer: usize,
    pub transfer: BufferTransfer,
}

/// Handle to the worker thread plus the submission side of its queue.
pub struct IoWorker {
    tx: Option<flume::Sender<WorkItem>>,
    handle: Option<JoinHandle<()>>,
}

impl IoWorker {
    /// Spawn the worker. `handler` runs once per item, serially; its
    /// failures are its own to log — the queue keeps draining.
    pub fn spawn<F>(name: &str, mut handler: F) -> Self
    where
        F: FnMut(WorkItem) + Send + 'static,
    {
        let (tx, rx) = flume::unbounded::<WorkItem>();
        let handle = std::thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || {
                for item in rx.iter() {
                    handler(item);
                }
                debug!("io worker drained and stopped");
            })
            .expect("spawn io worker");
        IoWorker {
            tx: Some(tx),
            handle: Some(handle),
        }
    }

    /// Queue handle for producers. Sends never block.
    pub fn sender(&self) -> flume::Sender<WorkItem> {
        self.tx.as_ref().expect("worker still running").clone()
    }

    /// Stop accepting work, drain what is queued, and join the thread.
    pub fn shutdown(&mut self) {
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for IoWorker {
    fn drop(&mut self) {
        // Close the queue but do not join: a producer elsewhere may still
        // hold a sender clone, and drop must not block on it.
        self.tx.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    #[test]
    fn items_run_in_submission_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut worker = {
            let seen = Arc::clone(&seen);
            IoWorker::spawn("test-io", move |item| {
                seen.lock().unwrap().push(item.buffer);
            })
        };
        let tx = worker.sender();
        for i in 0..32 {
            tx.send(WorkItem {
                buffer: i,
                transfer: BufferTransfer::default(),
            })
            .unwrap();
        }
        drop(tx);
        worker.shutdown();
        assert_eq!(&*seen.lock().unwrap(), &(0..32).collect::<Vec<_>>());
    }

    #[test]
    fn shutdown_drains_pending_items() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut worker = {
            let count = Arc::clone(&count);
            IoWorker::spawn("test-io", move |_| {
                count.fetch_add(1, Ordering::Relaxed);
            })
        };
        let tx = worker.sender();
        for i in 0..10 {
            tx.send(WorkItem {
                buffer: i,
                transfer: BufferTransfer::default(),
            })
            .unwrap();
        }
        drop(tx);
        worker.shutdown();
        assert_eq!(count.load(Ordering::Relaxed), 10);
    }
}
