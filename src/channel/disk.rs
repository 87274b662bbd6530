use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::error;

use crate::aio::{AioContext, AioOp};
use crate::bgwork::TimeLimit;
use crate::channel::{
    ChannelOps, ChannelXdQueue, PathEndpoint, SupportedPath, XferDesKind, XferDesOps,
    CPU_MEM_KINDS,
};
use crate::memory::{MemoryKind, MemoryOps};
use crate::transfer::StepFlags;
use crate::xfer_des::{IoRequest, XferDes};
use crate::NodeId;

// in-flight AIO request budget per XD
const MAX_INFLIGHT: usize = 8;

/// Issues one positional file operation at a time against the AIO context;
/// request completion drives the usual read/write accounting from the AIO
/// thread.
struct FileLikeXd {
    xd: XferDes,
    aio: Arc<AioContext>,
    inflight: Arc<AtomicUsize>,
    is_read: bool,
}

impl FileLikeXd {
    fn new(xd: XferDes, aio: Arc<AioContext>, read_kind: XferDesKind) -> FileLikeXd {
        let is_read = xd.kind == read_kind;
        FileLikeXd {
            xd,
            aio,
            inflight: Arc::new(AtomicUsize::new(0)),
            is_read,
        }
    }

    fn progress(&self, work_until: TimeLimit) -> bool {
        let mut did_work = false;
        let state = &mut *self.xd.state.lock();
        loop {
            if self.inflight.load(Ordering::Acquire) >= MAX_INFLIGHT {
                break;
            }
            let req = match self.xd.get_one_request(state, StepFlags::CONTIG_ONLY) {
                Some(req) => req,
                None => break,
            };
            self.submit(&req);
            did_work = true;
            if work_until.is_expired() {
                break;
            }
        }
        did_work
    }

    fn submit(&self, req: &IoRequest) {
        assert_eq!(req.nlines, 1);
        let in_port = &self.xd.input_ports[req.src_port_idx];
        let out_port = &self.xd.output_ports[req.dst_port_idx];
        assert!(in_port.serdez_op.is_none() && out_port.serdez_op.is_none());

        let (file_mem, file_off, host_ptr) = if self.is_read {
            let host = out_port
                .mem
                .get_direct_ptr(req.dst_off, req.nbytes)
                .expect("file read target must be CPU-visible");
            (in_port.mem.clone(), req.src_off, host)
        } else {
            let host = in_port
                .mem
                .get_direct_ptr(req.src_off, req.nbytes)
                .expect("file write source must be CPU-visible");
            (out_port.mem.clone(), req.dst_off, host)
        };

        self.inflight.fetch_add(1, Ordering::AcqRel);
        let me = self.xd.self_arc();
        let inflight = self.inflight.clone();
        let req = req.clone();
        let is_write = !self.is_read;
        self.aio.enqueue(AioOp {
            file_mem,
            file_off,
            host_ptr,
            nbytes: req.nbytes,
            is_write,
            completion: Box::new(move |result| {
                if let Err(e) = result {
                    error!(target: "ferry::request",
                           guid = me.base().guid, error = %e, "file i/o failed");
                    me.base().mark_failed();
                }
                // account the bytes either way so the pipeline drains
                me.base().notify_request_read_done(&req);
                me.base().notify_request_write_done(&req);
                inflight.fetch_sub(1, Ordering::AcqRel);
                // a freed slot may be all the xd was waiting for
                me.base().update_progress();
            }),
        });
    }
}

/// Copies between disk-backed memory and host memory.
pub(crate) struct DiskXferDes {
    inner: FileLikeXd,
}

impl DiskXferDes {
    pub(crate) fn new(xd: XferDes, aio: Arc<AioContext>) -> DiskXferDes {
        assert!(matches!(
            xd.kind,
            XferDesKind::DiskRead | XferDesKind::DiskWrite
        ));
        DiskXferDes {
            inner: FileLikeXd::new(xd, aio, XferDesKind::DiskRead),
        }
    }
}

impl XferDesOps for DiskXferDes {
    fn base(&self) -> &XferDes {
        &self.inner.xd
    }
    fn progress(&self, work_until: TimeLimit) -> bool {
        self.inner.progress(work_until)
    }
}

/// Copies between an attached user file and host memory.
pub(crate) struct FileXferDes {
    inner: FileLikeXd,
}

impl FileXferDes {
    pub(crate) fn new(xd: XferDes, aio: Arc<AioContext>) -> FileXferDes {
        assert!(matches!(
            xd.kind,
            XferDesKind::FileRead | XferDesKind::FileWrite
        ));
        FileXferDes {
            inner: FileLikeXd::new(xd, aio, XferDesKind::FileRead),
        }
    }
}

impl XferDesOps for FileXferDes {
    fn base(&self) -> &XferDes {
        &self.inner.xd
    }
    fn progress(&self, work_until: TimeLimit) -> bool {
        self.inner.progress(work_until)
    }
}

fn storage_paths(kind: MemoryKind, read_kind: XferDesKind, write_kind: XferDesKind) -> Vec<SupportedPath> {
    let mut paths = Vec::new();
    for cpu in CPU_MEM_KINDS {
        paths.push(SupportedPath {
            src: PathEndpoint::LocalKind(kind),
            dst: PathEndpoint::LocalKind(cpu),
            bandwidth: 100,
            latency: 10000,
            redops_allowed: false,
            serdez_allowed: false,
            xd_kind: read_kind,
        });
        paths.push(SupportedPath {
            src: PathEndpoint::LocalKind(cpu),
            dst: PathEndpoint::LocalKind(kind),
            bandwidth: 100,
            latency: 10000,
            redops_allowed: false,
            serdez_allowed: false,
            xd_kind: write_kind,
        });
    }
    paths
}

pub(crate) struct DiskChannel {
    node: NodeId,
    aio: Arc<AioContext>,
    paths: Vec<SupportedPath>,
    xdq: ChannelXdQueue,
}

impl DiskChannel {
    pub(crate) fn new(node: NodeId, aio: Arc<AioContext>) -> DiskChannel {
        DiskChannel {
            node,
            aio,
            paths: storage_paths(
                MemoryKind::Disk,
                XferDesKind::DiskRead,
                XferDesKind::DiskWrite,
            ),
            xdq: ChannelXdQueue::new(),
        }
    }

    pub(crate) fn aio(&self) -> Arc<AioContext> {
        self.aio.clone()
    }
}

impl ChannelOps for DiskChannel {
    fn kind(&self) -> XferDesKind {
        XferDesKind::DiskRead
    }
    fn node(&self) -> NodeId {
        self.node
    }
    fn paths(&self) -> &[SupportedPath] {
        &self.paths
    }
    fn xd_queue(&self) -> &ChannelXdQueue {
        &self.xdq
    }
}

pub(crate) struct FileChannel {
    node: NodeId,
    aio: Arc<AioContext>,
    paths: Vec<SupportedPath>,
    xdq: ChannelXdQueue,
}

impl FileChannel {
    pub(crate) fn new(node: NodeId, aio: Arc<AioContext>) -> FileChannel {
        FileChannel {
            node,
            aio,
            paths: storage_paths(
                MemoryKind::File,
                XferDesKind::FileRead,
                XferDesKind::FileWrite,
            ),
            xdq: ChannelXdQueue::new(),
        }
    }

    pub(crate) fn aio(&self) -> Arc<AioContext> {
        self.aio.clone()
    }
}

impl ChannelOps for FileChannel {
    fn kind(&self) -> XferDesKind {
        XferDesKind::FileRead
    }
    fn node(&self) -> NodeId {
        self.node
    }
    fn paths(&self) -> &[SupportedPath] {
        &self.paths
    }
    fn xd_queue(&self) -> &ChannelXdQueue {
        &self.xdq
    }
}
