use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use enum_dispatch::enum_dispatch;
use parking_lot::Mutex;
use tracing::debug;

use crate::aio::AioContext;
use crate::bgwork::{BackgroundWorkItem, BgWorkHandle, TimeLimit};
use crate::memory::{Memory, MemoryId, MemoryKind, MemoryOps};
use crate::serdez::{SerdezId, NO_SERDEZ};
use crate::xfer_des::XferDes;
use crate::NodeId;

pub(crate) mod disk;
pub(crate) mod global;
pub(crate) mod memcpy;
pub(crate) mod remote_write;

use disk::{DiskChannel, DiskXferDes, FileChannel, FileXferDes};
use global::{GlobalChannel, GlobalXferDes};
use memcpy::{MemcpyChannel, MemcpyXferDes};
use remote_write::{RemoteWriteChannel, RemoteWriteXferDes};

/// The kind of executor a transfer descriptor runs on.
#[derive(
    serde::Serialize, serde::Deserialize, Debug, PartialEq, Eq, Hash, Clone, Copy, PartialOrd, Ord,
)]
pub enum XferDesKind {
    None,
    MemCpy,
    RemoteWrite,
    DiskRead,
    DiskWrite,
    FileRead,
    FileWrite,
    GlobalRead,
    GlobalWrite,
}

/// One side of a supported path.
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PathEndpoint {
    SpecificMemory(MemoryId),
    LocalKind(MemoryKind),
    GlobalKind(MemoryKind),
    LocalRdma,
    RemoteRdma,
}

/// A (src, dst) capability a channel advertises, with its cost model and the
/// XD kind that executes it.
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone)]
pub(crate) struct SupportedPath {
    pub(crate) src: PathEndpoint,
    pub(crate) dst: PathEndpoint,
    pub(crate) bandwidth: u32,
    pub(crate) latency: u32,
    pub(crate) redops_allowed: bool,
    pub(crate) serdez_allowed: bool,
    pub(crate) xd_kind: XferDesKind,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct PathMatch {
    pub(crate) xd_kind: XferDesKind,
    pub(crate) bandwidth: u32,
    pub(crate) latency: u32,
}

// rdma-ness depends on whether the memory is local or remote to us, not to
// the channel
fn rdma_capable(mem: &Memory, my_node: NodeId) -> bool {
    if mem.owner_node() == my_node {
        mem.get_rdma_info().is_some()
    } else {
        mem.get_remote_addr(0).is_some()
    }
}

fn endpoint_matches(
    ep: &PathEndpoint,
    mem: &Memory,
    channel_node: NodeId,
    my_node: NodeId,
) -> bool {
    match ep {
        PathEndpoint::SpecificMemory(id) => mem.id() == *id,
        PathEndpoint::LocalKind(k) => (mem.kind() == *k) && (mem.owner_node() == channel_node),
        PathEndpoint::GlobalKind(k) => mem.kind() == *k,
        PathEndpoint::LocalRdma => {
            (mem.owner_node() == channel_node) && rdma_capable(mem, my_node)
        }
        PathEndpoint::RemoteRdma => {
            (mem.owner_node() != channel_node) && rdma_capable(mem, my_node)
        }
    }
}

/// The path query every channel shares: veto on serdez/redop allowance,
/// then match src and dst endpoint types in order.
pub(crate) fn supports_path_common(
    paths: &[SupportedPath],
    channel_node: NodeId,
    my_node: NodeId,
    src_mem: &Memory,
    dst_mem: &Memory,
    src_serdez: SerdezId,
    dst_serdez: SerdezId,
    redop: u32,
) -> Option<PathMatch> {
    for p in paths {
        if !p.serdez_allowed && ((src_serdez != NO_SERDEZ) || (dst_serdez != NO_SERDEZ)) {
            continue;
        }
        if !p.redops_allowed && (redop != 0) {
            continue;
        }
        if !endpoint_matches(&p.src, src_mem, channel_node, my_node) {
            continue;
        }
        if !endpoint_matches(&p.dst, dst_mem, channel_node, my_node) {
            continue;
        }
        return Some(PathMatch {
            xd_kind: p.xd_kind,
            bandwidth: p.bandwidth,
            latency: p.latency,
        });
    }
    None
}

// ---------------------------------------------------------------------
// transfer descriptor variants

#[enum_dispatch]
pub(crate) trait XferDesOps: Send + Sync {
    fn base(&self) -> &XferDes;
    /// Makes best-effort forward progress within the time limit; returns
    /// true iff any work was done.  Must not block indefinitely.
    fn progress(&self, work_until: TimeLimit) -> bool;
}

#[enum_dispatch(XferDesOps)]
pub(crate) enum XferDesVariant {
    Memcpy(MemcpyXferDes),
    RemoteWrite(RemoteWriteXferDes),
    Disk(DiskXferDes),
    FileXd(FileXferDes),
    Global(GlobalXferDes),
}

// ---------------------------------------------------------------------
// the per-channel ready queue (the single-XDQ pattern)

/// One ready-XD queue per channel, registered with the background worker as
/// a single work item.  The `active` flag keeps the channel enqueued with
/// the worker pool exactly while XDs are waiting.
pub(crate) struct ChannelXdQueue {
    queue: Mutex<VecDeque<Arc<XferDesVariant>>>,
    active: AtomicBool,
    bgwork: OnceLock<(BgWorkHandle, Weak<Channel>)>,
}

impl ChannelXdQueue {
    pub(crate) fn new() -> ChannelXdQueue {
        ChannelXdQueue {
            queue: Mutex::new(VecDeque::new()),
            active: AtomicBool::new(false),
            bgwork: OnceLock::new(),
        }
    }

    fn attach(&self, handle: BgWorkHandle, me: Weak<Channel>) {
        self.bgwork
            .set((handle, me))
            .unwrap_or_else(|_| panic!("channel registered twice"));
    }

    fn activate(&self) {
        if !self.active.swap(true, Ordering::AcqRel) {
            let (handle, me) = self.bgwork.get().expect("channel not registered");
            if let Some(ch) = me.upgrade() {
                handle.make_active(ch);
            }
        }
    }

    pub(crate) fn enqueue(&self, xd: Arc<XferDesVariant>) {
        self.queue.lock().push_back(xd);
        self.activate();
    }

    /// Drains ready XDs until the queue runs dry or the slice expires.
    /// Returns true iff the item should immediately be re-queued.
    pub(crate) fn do_work(&self, work_until: TimeLimit) -> bool {
        loop {
            let xd = match self.queue.lock().pop_front() {
                Some(xd) => xd,
                None => break,
            };

            xd.base().begin_progress();
            xd.progress(work_until);
            if xd.base().is_completed() {
                xd.base().notify_completion_once();
                xd.base().mark_done_scheduling();
            } else if xd.base().end_progress() {
                self.queue.lock().push_back(xd);
            }

            if work_until.is_expired() {
                if !self.queue.lock().is_empty() {
                    return true;
                }
                break;
            }
        }

        self.active.store(false, Ordering::Release);
        // re-check for an enqueue that raced with deactivation
        if !self.queue.lock().is_empty() && !self.active.swap(true, Ordering::AcqRel) {
            return true;
        }
        false
    }
}

// ---------------------------------------------------------------------
// channels

#[enum_dispatch]
pub(crate) trait ChannelOps: Send + Sync {
    fn kind(&self) -> XferDesKind;
    fn node(&self) -> NodeId;
    fn paths(&self) -> &[SupportedPath];
    fn xd_queue(&self) -> &ChannelXdQueue;

    #[allow(clippy::too_many_arguments)]
    fn supports_path(
        &self,
        my_node: NodeId,
        src_mem: &Memory,
        dst_mem: &Memory,
        src_serdez: SerdezId,
        dst_serdez: SerdezId,
        redop: u32,
    ) -> Option<PathMatch> {
        supports_path_common(
            self.paths(),
            self.node(),
            my_node,
            src_mem,
            dst_mem,
            src_serdez,
            dst_serdez,
            redop,
        )
    }
}

#[enum_dispatch(ChannelOps)]
pub(crate) enum Channel {
    Memcpy(MemcpyChannel),
    RemoteWrite(RemoteWriteChannel),
    Disk(DiskChannel),
    FileCh(FileChannel),
    Global(GlobalChannel),
    Remote(RemoteChannel),
}

impl Channel {
    pub(crate) fn enqueue_ready_xd(&self, xd: Arc<XferDesVariant>) {
        self.xd_queue().enqueue(xd);
    }

    pub(crate) fn register_bgwork(me: &Arc<Channel>, handle: BgWorkHandle) {
        me.xd_queue().attach(handle, Arc::downgrade(me));
    }
}

impl BackgroundWorkItem for Channel {
    fn do_work(self: Arc<Self>, work_until: TimeLimit) -> bool {
        self.xd_queue().do_work(work_until)
    }

    fn name(&self) -> &str {
        match self {
            Channel::Memcpy(_) => "memcpy channel",
            Channel::RemoteWrite(_) => "remote write channel",
            Channel::Disk(_) => "disk channel",
            Channel::FileCh(_) => "file channel",
            Channel::Global(_) => "global channel",
            Channel::Remote(_) => "remote channel",
        }
    }
}

/// Proxy for a channel hosted on another node: answers path queries from the
/// owner's announced paths but can never execute anything here.
pub(crate) struct RemoteChannel {
    node: NodeId,
    kind: XferDesKind,
    paths: Vec<SupportedPath>,
    xdq: ChannelXdQueue,
}

impl RemoteChannel {
    pub(crate) fn new(node: NodeId, kind: XferDesKind, paths: Vec<SupportedPath>) -> RemoteChannel {
        RemoteChannel {
            node,
            kind,
            paths,
            xdq: ChannelXdQueue::new(),
        }
    }
}

impl ChannelOps for RemoteChannel {
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
        panic!("remote channel cannot execute xds");
    }

    fn supports_path(
        &self,
        my_node: NodeId,
        src_mem: &Memory,
        dst_mem: &Memory,
        src_serdez: SerdezId,
        dst_serdez: SerdezId,
        redop: u32,
    ) -> Option<PathMatch> {
        // simultaneous serialization/deserialization is not allowed anywhere
        if (src_serdez != NO_SERDEZ) && (dst_serdez != NO_SERDEZ) {
            return None;
        }
        supports_path_common(
            &self.paths,
            self.node,
            my_node,
            src_mem,
            dst_mem,
            src_serdez,
            dst_serdez,
            redop,
        )
    }
}

// ---------------------------------------------------------------------
// process-wide registry, one channel per role

pub(crate) struct ChannelManager {
    channels: Vec<Arc<Channel>>,
    memcpy: Arc<Channel>,
    remote_write: Arc<Channel>,
    disk: Arc<Channel>,
    file: Arc<Channel>,
    global_read: Arc<Channel>,
    global_write: Arc<Channel>,
}

impl ChannelManager {
    pub(crate) fn new(
        my_node: NodeId,
        bgwork: BgWorkHandle,
        aio: Arc<AioContext>,
    ) -> ChannelManager {
        let memcpy = Arc::new(Channel::Memcpy(MemcpyChannel::new(my_node)));
        let remote_write = Arc::new(Channel::RemoteWrite(RemoteWriteChannel::new(my_node)));
        let disk = Arc::new(Channel::Disk(DiskChannel::new(my_node, aio.clone())));
        let file = Arc::new(Channel::FileCh(FileChannel::new(my_node, aio)));
        let global_read = Arc::new(Channel::Global(GlobalChannel::new(
            my_node,
            XferDesKind::GlobalRead,
        )));
        let global_write = Arc::new(Channel::Global(GlobalChannel::new(
            my_node,
            XferDesKind::GlobalWrite,
        )));

        let channels = vec![
            memcpy.clone(),
            remote_write.clone(),
            disk.clone(),
            file.clone(),
            global_read.clone(),
            global_write.clone(),
        ];
        for ch in &channels {
            Channel::register_bgwork(ch, bgwork.clone());
            debug!(target: "ferry::dma", name = ch.name(), "channel registered");
        }

        ChannelManager {
            channels,
            memcpy,
            remote_write,
            disk,
            file,
            global_read,
            global_write,
        }
    }

    pub(crate) fn get_for_kind(&self, kind: XferDesKind) -> Arc<Channel> {
        match kind {
            XferDesKind::MemCpy => self.memcpy.clone(),
            XferDesKind::RemoteWrite => self.remote_write.clone(),
            XferDesKind::DiskRead | XferDesKind::DiskWrite => self.disk.clone(),
            XferDesKind::FileRead | XferDesKind::FileWrite => self.file.clone(),
            XferDesKind::GlobalRead => self.global_read.clone(),
            XferDesKind::GlobalWrite => self.global_write.clone(),
            XferDesKind::None => panic!("no channel for kind None"),
        }
    }

    /// Best-bandwidth channel able to carry (src, dst) with the requested
    /// serdez/redop demands.
    pub(crate) fn find_best(
        &self,
        my_node: NodeId,
        src_mem: &Memory,
        dst_mem: &Memory,
        src_serdez: SerdezId,
        dst_serdez: SerdezId,
        redop: u32,
    ) -> Option<(Arc<Channel>, PathMatch)> {
        let mut best: Option<(Arc<Channel>, PathMatch)> = None;
        for ch in &self.channels {
            if let Some(m) =
                ch.supports_path(my_node, src_mem, dst_mem, src_serdez, dst_serdez, redop)
            {
                let better = match &best {
                    None => true,
                    Some((_, cur)) => m.bandwidth > cur.bandwidth,
                };
                if better {
                    best = Some((ch.clone(), m));
                }
            }
        }
        best
    }
}

pub(crate) const CPU_MEM_KINDS: [MemoryKind; 4] = [
    MemoryKind::System,
    MemoryKind::Registered,
    MemoryKind::ZeroCopy,
    MemoryKind::Socket,
];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{RemoteMemory, SystemMemory};

    fn sys(node: crate::NodeId, index: u64, kind: MemoryKind) -> Memory {
        Memory::System(SystemMemory::new(MemoryId::new(node, index), kind, 64))
    }

    #[test]
    fn kind_paths_match_local_memories_only() {
        let paths = vec![SupportedPath {
            src: PathEndpoint::LocalKind(MemoryKind::System),
            dst: PathEndpoint::LocalKind(MemoryKind::System),
            bandwidth: 1,
            latency: 0,
            redops_allowed: false,
            serdez_allowed: false,
            xd_kind: XferDesKind::MemCpy,
        }];
        let a = sys(0, 1, MemoryKind::System);
        let b = sys(0, 2, MemoryKind::System);
        assert!(supports_path_common(&paths, 0, 0, &a, &b, 0, 0, 0).is_some());
        // serdez demanded but not allowed
        assert!(supports_path_common(&paths, 0, 0, &a, &b, 7, 0, 0).is_none());
        // redop demanded but not allowed
        assert!(supports_path_common(&paths, 0, 0, &a, &b, 0, 0, 3).is_none());
        // memory belongs to another node
        let far = Memory::Remote(RemoteMemory::new(
            MemoryId::new(1, 1),
            MemoryKind::System,
            0,
            64,
            false,
        ));
        assert!(supports_path_common(&paths, 0, 0, &far, &b, 0, 0, 0).is_none());
    }

    #[test]
    fn rdma_paths_need_registration() {
        let paths = vec![SupportedPath {
            src: PathEndpoint::LocalRdma,
            dst: PathEndpoint::RemoteRdma,
            bandwidth: 1,
            latency: 0,
            redops_allowed: false,
            serdez_allowed: false,
            xd_kind: XferDesKind::RemoteWrite,
        }];
        let plain = sys(0, 1, MemoryKind::System);
        let reg = sys(0, 2, MemoryKind::Registered);
        let far_reg = Memory::Remote(RemoteMemory::new(
            MemoryId::new(1, 3),
            MemoryKind::Registered,
            0x1000,
            64,
            true,
        ));
        assert!(supports_path_common(&paths, 0, 0, &reg, &far_reg, 0, 0, 0).is_some());
        assert!(supports_path_common(&paths, 0, 0, &plain, &far_reg, 0, 0, 0).is_none());
        assert!(supports_path_common(&paths, 0, 0, &reg, &plain, 0, 0, 0).is_none());
    }

    #[test]
    fn remote_channel_rejects_two_sided_serdez() {
        let ch = RemoteChannel::new(
            1,
            XferDesKind::MemCpy,
            vec![SupportedPath {
                src: PathEndpoint::GlobalKind(MemoryKind::System),
                dst: PathEndpoint::GlobalKind(MemoryKind::System),
                bandwidth: 1,
                latency: 0,
                redops_allowed: false,
                serdez_allowed: true,
                xd_kind: XferDesKind::MemCpy,
            }],
        );
        let a = sys(0, 1, MemoryKind::System);
        let b = sys(0, 2, MemoryKind::System);
        assert!(ch.supports_path(0, &a, &b, 4, 0, 0).is_some());
        assert!(ch.supports_path(0, &a, &b, 4, 5, 0).is_none());
    }
}
