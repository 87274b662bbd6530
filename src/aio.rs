use std::io;
use std::sync::Arc;
use std::thread;

use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::debug;

use crate::memory::{Memory, MemoryOps};

/// One positional file operation against a disk- or file-backed memory.
/// `host_ptr` aims at CPU-visible memory owned by the other port and stays
/// valid until `completion` runs (the XD cannot retire with writes pending).
/// The completion receives the operation's I/O status.
pub(crate) struct AioOp {
    pub(crate) file_mem: Arc<Memory>,
    pub(crate) file_off: usize,
    pub(crate) host_ptr: *mut u8,
    pub(crate) nbytes: usize,
    /// true = host -> file, false = file -> host
    pub(crate) is_write: bool,
    pub(crate) completion: Box<dyn FnOnce(io::Result<()>) + Send>,
}

// host_ptr is owned by the issuing XD for the lifetime of the op
unsafe impl Send for AioOp {}

/// Thread-backed async file I/O: channels enqueue operations and get their
/// completion callbacks invoked from the AIO thread.
pub(crate) struct AioContext {
    tx: Mutex<Option<Sender<AioOp>>>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl AioContext {
    pub(crate) fn new() -> Arc<AioContext> {
        let (tx, rx) = unbounded::<AioOp>();
        let worker = thread::Builder::new()
            .name("ferry-aio".into())
            .spawn(move || aio_loop(rx))
            .unwrap();
        Arc::new(AioContext {
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
        })
    }

    pub(crate) fn enqueue(&self, op: AioOp) {
        self.tx
            .lock()
            .as_ref()
            .expect("aio context already shut down")
            .send(op)
            .unwrap();
    }

    /// Drains queued operations and joins the worker.
    pub(crate) fn shutdown(&self) {
        drop(self.tx.lock().take());
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
            debug!(target: "ferry::dma", "aio context drained");
        }
    }
}

fn aio_loop(rx: Receiver<AioOp>) {
    while let Ok(op) = rx.recv() {
        let result = if op.nbytes == 0 {
            Ok(())
        } else if op.is_write {
            let src = unsafe { std::slice::from_raw_parts(op.host_ptr, op.nbytes) };
            op.file_mem.put_bytes(op.file_off, src)
        } else {
            let dst = unsafe { std::slice::from_raw_parts_mut(op.host_ptr, op.nbytes) };
            op.file_mem.get_bytes(op.file_off, dst)
        };
        (op.completion)(result);
    }
}
