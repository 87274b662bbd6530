use tracing::error;

use crate::bgwork::TimeLimit;
use crate::channel::{
    ChannelOps, ChannelXdQueue, PathEndpoint, SupportedPath, XferDesKind, XferDesOps,
    CPU_MEM_KINDS,
};
use crate::memory::{MemoryKind, MemoryOps};
use crate::transfer::StepFlags;
use crate::xfer_des::XferDes;
use crate::NodeId;

/// Moves bytes between the globally addressable segment and host memory,
/// one request at a time through the segment's get/put interface.
pub(crate) struct GlobalXferDes {
    pub(crate) xd: XferDes,
}

impl GlobalXferDes {
    pub(crate) fn new(xd: XferDes) -> GlobalXferDes {
        assert!(matches!(
            xd.kind,
            XferDesKind::GlobalRead | XferDesKind::GlobalWrite
        ));
        GlobalXferDes { xd }
    }
}

impl XferDesOps for GlobalXferDes {
    fn base(&self) -> &XferDes {
        &self.xd
    }

    fn progress(&self, work_until: TimeLimit) -> bool {
        let mut did_work = false;
        let state = &mut *self.xd.state.lock();
        loop {
            let req = match self.xd.get_one_request(state, StepFlags::CONTIG_ONLY) {
                Some(req) => req,
                None => break,
            };
            assert_eq!(req.nlines, 1);
            let in_port = &self.xd.input_ports[req.src_port_idx];
            let out_port = &self.xd.output_ports[req.dst_port_idx];
            assert!(in_port.serdez_op.is_none() && out_port.serdez_op.is_none());

            let result = match self.xd.kind {
                XferDesKind::GlobalRead => {
                    let host = out_port
                        .mem
                        .get_direct_ptr(req.dst_off, req.nbytes)
                        .expect("global read target must be CPU-visible");
                    let dst = unsafe { std::slice::from_raw_parts_mut(host, req.nbytes) };
                    in_port.mem.get_bytes(req.src_off, dst)
                }
                XferDesKind::GlobalWrite => {
                    let host = in_port
                        .mem
                        .get_direct_ptr(req.src_off, req.nbytes)
                        .expect("global write source must be CPU-visible");
                    let src = unsafe { std::slice::from_raw_parts(host, req.nbytes) };
                    out_port.mem.put_bytes(req.dst_off, src)
                }
                _ => unreachable!(),
            };
            if let Err(e) = result {
                error!(target: "ferry::request",
                       guid = self.xd.guid, error = %e, "global segment i/o failed");
                self.xd.mark_failed();
            }

            self.xd.notify_request_read_done(&req);
            self.xd.notify_request_write_done(&req);
            did_work = true;
            if work_until.is_expired() {
                break;
            }
        }
        did_work
    }
}

/// GAS-style access to the global segment; the read and write roles are two
/// channel instances.
pub(crate) struct GlobalChannel {
    node: NodeId,
    kind: XferDesKind,
    paths: Vec<SupportedPath>,
    xdq: ChannelXdQueue,
}

impl GlobalChannel {
    pub(crate) fn new(node: NodeId, kind: XferDesKind) -> GlobalChannel {
        let mut paths = Vec::new();
        for cpu in CPU_MEM_KINDS {
            match kind {
                XferDesKind::GlobalRead => paths.push(SupportedPath {
                    src: PathEndpoint::GlobalKind(MemoryKind::Global),
                    dst: PathEndpoint::LocalKind(cpu),
                    bandwidth: 512,
                    latency: 2000,
                    redops_allowed: false,
                    serdez_allowed: false,
                    xd_kind: XferDesKind::GlobalRead,
                }),
                XferDesKind::GlobalWrite => paths.push(SupportedPath {
                    src: PathEndpoint::LocalKind(cpu),
                    dst: PathEndpoint::GlobalKind(MemoryKind::Global),
                    bandwidth: 512,
                    latency: 2000,
                    redops_allowed: false,
                    serdez_allowed: false,
                    xd_kind: XferDesKind::GlobalWrite,
                }),
                _ => panic!("global channel kind must be read or write"),
            }
        }
        GlobalChannel {
            node,
            kind,
            paths,
            xdq: ChannelXdQueue::new(),
        }
    }
}

impl ChannelOps for GlobalChannel {
    fn kind(&self) -> XferDesKind {
        self.kind
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
