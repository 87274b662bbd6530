use std::collections::HashMap;
use std::fs::File;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::aio::AioContext;
use crate::bgwork::BackgroundWorkManager;
use crate::channel::{Channel, ChannelManager, XferDesKind, XferDesOps, XferDesVariant};
use crate::channel::disk::{DiskXferDes, FileXferDes};
use crate::channel::global::GlobalXferDes;
use crate::channel::memcpy::MemcpyXferDes;
use crate::channel::remote_write::RemoteWriteXferDes;
use crate::env_var::config;
use crate::event::Event;
use crate::memory::{
    DiskMemory, FileMemory, GlobalMemory, Memory, MemoryId, MemoryKind, MemoryOps, MemoryTable,
    RemoteMemory, SystemMemory,
};
use crate::network::{
    Backend, LoopbackNetwork, MeshEndpoint, MeshState, MessageHandler, Network, NetworkOps,
    Payload, WireMessage,
};
use crate::serdez::{CustomSerdez, SerdezId, SerdezTable, NO_SERDEZ};
use crate::transfer::IterDesc;
use crate::xd_queue::XferDesQueue;
use crate::xfer_des::{PortInit, PortKind, XferDes};
use crate::{make_guid, NodeId, XferDesId, NO_GUID};

/// Tunables for `DmaEngine::start`.
#[derive(Debug, Clone, Default)]
pub struct EngineOptions {
    pub backend: Backend,
    /// Overrides the `FERRY_THREADS` worker count.
    pub worker_threads: Option<usize>,
}

/// One endpoint of a copy pipeline node.
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone)]
pub struct PortDesc {
    pub(crate) mem: MemoryId,
    pub(crate) iter: IterDesc,
    pub(crate) serdez: SerdezId,
    pub(crate) peer: Option<(usize, usize)>,
    pub(crate) ib: Option<(usize, usize)>,
    pub(crate) kind: PortKind,
}

impl PortDesc {
    /// A port reading or writing user memory directly (no peer XD).
    pub fn direct(mem: MemoryId, iter: IterDesc) -> PortDesc {
        PortDesc {
            mem,
            iter,
            serdez: NO_SERDEZ,
            peer: None,
            ib: None,
            kind: PortKind::Data,
        }
    }

    /// A port on a circular intermediate buffer window of `mem`.
    pub fn ib(mem: MemoryId, ib_offset: usize, ib_size: usize) -> PortDesc {
        PortDesc {
            mem,
            iter: IterDesc::fifo(ib_offset, ib_size),
            serdez: NO_SERDEZ,
            peer: None,
            ib: Some((ib_offset, ib_size)),
            kind: PortKind::Data,
        }
    }

    /// Links this port to port `port_idx` of the graph's `xd_index`-th XD.
    pub fn with_peer(mut self, xd_index: usize, port_idx: usize) -> PortDesc {
        self.peer = Some((xd_index, port_idx));
        self
    }

    pub fn with_serdez(mut self, serdez: SerdezId) -> PortDesc {
        self.serdez = serdez;
        self
    }

    /// Marks this input as the gather control stream.
    pub fn gather_control(mut self) -> PortDesc {
        self.kind = PortKind::GatherControl;
        self
    }

    /// Marks this input as the scatter control stream.
    pub fn scatter_control(mut self) -> PortDesc {
        self.kind = PortKind::ScatterControl;
        self
    }
}

/// One node of a copy graph handed to `submit`/`submit_graph`.
#[derive(Debug, Clone)]
pub struct XferDesc {
    pub(crate) kind: Option<XferDesKind>,
    pub(crate) target_node: NodeId,
    pub(crate) inputs: Vec<PortDesc>,
    pub(crate) outputs: Vec<PortDesc>,
    pub(crate) priority: i32,
    pub(crate) metadata_event: Option<Event>,
}

impl XferDesc {
    /// Kind chosen by the channel path query on the primary ports.
    pub fn auto(inputs: Vec<PortDesc>, outputs: Vec<PortDesc>) -> XferDesc {
        XferDesc {
            kind: None,
            target_node: 0,
            inputs,
            outputs,
            priority: 0,
            metadata_event: None,
        }
    }

    pub fn with_kind(kind: XferDesKind, inputs: Vec<PortDesc>, outputs: Vec<PortDesc>) -> XferDesc {
        XferDesc {
            kind: Some(kind),
            target_node: 0,
            inputs,
            outputs,
            priority: 0,
            metadata_event: None,
        }
    }

    pub fn memcpy(inputs: Vec<PortDesc>, outputs: Vec<PortDesc>) -> XferDesc {
        XferDesc::with_kind(XferDesKind::MemCpy, inputs, outputs)
    }

    pub fn remote_write(inputs: Vec<PortDesc>, outputs: Vec<PortDesc>) -> XferDesc {
        XferDesc::with_kind(XferDesKind::RemoteWrite, inputs, outputs)
    }

    /// Executes the XD on `node` (its GUID owner).
    pub fn on_node(mut self, node: NodeId) -> XferDesc {
        self.target_node = node;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> XferDesc {
        self.priority = priority;
        self
    }

    /// Defers channel enqueue until `event` triggers (instance metadata).
    pub fn with_metadata_event(mut self, event: Event) -> XferDesc {
        self.metadata_event = Some(event);
        self
    }
}

#[derive(serde::Serialize, serde::Deserialize)]
struct WirePortDesc {
    mem: MemoryId,
    iter: IterDesc,
    serdez: SerdezId,
    peer_guid: XferDesId,
    peer_port_idx: usize,
    ib_offset: usize,
    ib_size: usize,
    kind: PortKind,
}

#[derive(serde::Serialize, serde::Deserialize)]
struct WireXferDesc {
    guid: XferDesId,
    launch_node: NodeId,
    kind: XferDesKind,
    priority: i32,
    fence_id: u64,
    inputs: Vec<WirePortDesc>,
    outputs: Vec<WirePortDesc>,
}

/// Completion handle for a submitted copy graph; finishes once every XD in
/// the graph has retired.
pub struct CopyFence {
    id: u64,
    remaining: AtomicUsize,
    successful: AtomicBool,
    event: Event,
    xd_guids: Mutex<Vec<XferDesId>>,
    engine: Weak<EngineInner>,
}

impl CopyFence {
    pub fn wait(&self) {
        self.event.wait();
    }

    pub fn has_completed(&self) -> bool {
        self.event.has_triggered()
    }

    /// False once any XD in the graph reported a failed request (storage
    /// I/O errors surface here).
    pub fn succeeded(&self) -> bool {
        self.successful.load(Ordering::Acquire)
    }

    fn mark_one_finished(&self, successful: bool) {
        if !successful {
            self.successful.store(false, Ordering::Release);
        }
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            if let Some(engine) = self.engine.upgrade() {
                for guid in self.xd_guids.lock().drain(..) {
                    engine.xdq.destroy_xferdes(guid);
                }
                engine.fences.lock().remove(&self.id);
            }
            self.event.trigger();
        }
    }
}

pub(crate) struct EngineInner {
    my_node: NodeId,
    xdq: Arc<XferDesQueue>,
    channels: ChannelManager,
    bgwork: BackgroundWorkManager,
    memories: MemoryTable,
    serdez: SerdezTable,
    fences: Mutex<HashMap<u64, Arc<CopyFence>>>,
    next_mem_index: AtomicU64,
    next_xd_index: AtomicU64,
    next_fence_id: AtomicU64,
    aio: Arc<AioContext>,
    mesh: Option<Arc<MeshState>>,
}

/// The data-movement engine: a per-node bundle of channels, worker threads,
/// and the XD queue, with an explicit start/stop lifecycle.
pub struct DmaEngine {
    inner: Arc<EngineInner>,
}

impl DmaEngine {
    /// Starts a single-node engine on the loopback network.
    pub fn start(opts: EngineOptions) -> DmaEngine {
        assert_eq!(
            opts.backend,
            Backend::Loopback,
            "multi-node engines come from start_mesh"
        );
        let engine = Self::build(0, None, &opts);
        engine
            .inner
            .xdq
            .attach_network(Arc::new(Network::Loopback(LoopbackNetwork)));
        engine.finish_start(&opts);
        engine
    }

    /// Starts `nodes` engines sharing an in-process mesh network.
    pub fn start_mesh(nodes: usize, opts: EngineOptions) -> Vec<DmaEngine> {
        let state = MeshState::new(nodes);
        let engines: Vec<DmaEngine> = (0..nodes)
            .map(|n| Self::build(n, Some(state.clone()), &opts))
            .collect();
        for (n, engine) in engines.iter().enumerate() {
            engine.inner.xdq.attach_network(Arc::new(Network::Mesh(
                MeshEndpoint::new(state.clone(), n, nodes),
            )));
            state.bind(
                n,
                Arc::new(EngineHandler {
                    inner: Arc::downgrade(&engine.inner),
                }),
            );
            engine.finish_start(&opts);
        }
        engines
    }

    fn build(my_node: NodeId, mesh: Option<Arc<MeshState>>, _opts: &EngineOptions) -> DmaEngine {
        let xdq = XferDesQueue::new(my_node);
        let bgwork = BackgroundWorkManager::new();
        let aio = AioContext::new();
        let channels = ChannelManager::new(my_node, bgwork.handle(), aio.clone());
        let inner = Arc::new(EngineInner {
            my_node,
            xdq,
            channels,
            bgwork,
            memories: MemoryTable::new(),
            serdez: SerdezTable::new(),
            fences: Mutex::new(HashMap::new()),
            next_mem_index: AtomicU64::new(1),
            next_xd_index: AtomicU64::new(1),
            next_fence_id: AtomicU64::new(1),
            aio,
            mesh,
        });
        let weak = Arc::downgrade(&inner);
        inner
            .xdq
            .attach_fence_notify(Box::new(move |fence_id, successful| {
                if let Some(engine) = weak.upgrade() {
                    engine.fence_finished(fence_id, successful);
                }
            }));
        DmaEngine { inner }
    }

    fn finish_start(&self, opts: &EngineOptions) {
        let threads = opts.worker_threads.unwrap_or_else(|| config().threads);
        self.inner.bgwork.start_workers(threads);
        info!(target: "ferry::dma",
              node = self.inner.my_node, threads, "dma engine started");
    }

    pub fn my_node(&self) -> NodeId {
        self.inner.my_node
    }

    /// Joins the worker threads and drains the AIO context.  Outstanding
    /// copies must have completed.
    pub fn shutdown(&self) {
        self.inner.bgwork.shutdown();
        self.inner.aio.shutdown();
        if let Some(mesh) = &self.inner.mesh {
            mesh.unbind(self.inner.my_node);
        }
        info!(target: "ferry::dma", node = self.inner.my_node, "dma engine stopped");
    }

    // ------------------------------------------------------------------
    // registration

    pub fn register_system_memory(&self, size: usize) -> MemoryId {
        self.register_memory(MemoryKind::System, size)
    }

    /// Allocates and registers a host memory of the given CPU kind.
    /// `Registered` memories are RDMA-reachable.
    pub fn register_memory(&self, kind: MemoryKind, size: usize) -> MemoryId {
        let id = self.alloc_mem_id();
        self.inner
            .memories
            .insert(Arc::new(Memory::System(SystemMemory::new(id, kind, size))))
    }

    pub fn register_disk_memory(&self, file: File, size: usize) -> MemoryId {
        let id = self.alloc_mem_id();
        self.inner
            .memories
            .insert(Arc::new(Memory::Disk(DiskMemory::new(id, file, size))))
    }

    pub fn register_file_memory(&self, file: File, size: usize) -> MemoryId {
        let id = self.alloc_mem_id();
        self.inner
            .memories
            .insert(Arc::new(Memory::FileMem(FileMemory::new(id, file, size))))
    }

    pub fn register_global_memory(&self, size: usize) -> MemoryId {
        let id = self.alloc_mem_id();
        self.inner
            .memories
            .insert(Arc::new(Memory::Global(GlobalMemory::new(id, size))))
    }

    /// Makes a memory owned by `owner` (a mesh peer) addressable from this
    /// engine for path queries and remote writes.
    pub fn attach_remote_memory(&self, owner: &DmaEngine, id: MemoryId) {
        assert_ne!(owner.inner.my_node, self.inner.my_node);
        let mem = owner.inner.memories.lookup(id);
        let rdma = mem.get_remote_addr(0);
        self.inner
            .memories
            .insert(Arc::new(Memory::Remote(RemoteMemory::new(
                id,
                mem.kind(),
                rdma.map_or(0, |a| a.addr),
                mem.size(),
                rdma.is_some(),
            ))));
    }

    pub fn register_serdez(&self, id: SerdezId, op: Arc<dyn CustomSerdez>) {
        self.inner.serdez.register(id, op);
    }

    /// Raw access for seeding and checking test data.
    pub fn write_memory(&self, mem: MemoryId, offset: usize, bytes: &[u8]) {
        self.inner
            .memories
            .lookup(mem)
            .put_bytes(offset, bytes)
            .expect("memory seed write failed");
    }

    pub fn read_memory(&self, mem: MemoryId, offset: usize, bytes: &mut [u8]) {
        self.inner
            .memories
            .lookup(mem)
            .get_bytes(offset, bytes)
            .expect("memory read-back failed");
    }

    /// Which XD kind (if any) can carry src -> dst with the given serdez
    /// demands, and at what cost.
    pub fn query_path(
        &self,
        src: MemoryId,
        dst: MemoryId,
        src_serdez: SerdezId,
        dst_serdez: SerdezId,
    ) -> Option<(XferDesKind, u32, u32)> {
        let src_mem = self.inner.memories.lookup(src);
        let dst_mem = self.inner.memories.lookup(dst);
        self.inner
            .channels
            .find_best(
                self.inner.my_node,
                &src_mem,
                &dst_mem,
                src_serdez,
                dst_serdez,
                0,
            )
            .map(|(_, m)| (m.xd_kind, m.bandwidth, m.latency))
    }

    // ------------------------------------------------------------------
    // submission

    pub fn submit(&self, desc: XferDesc) -> Arc<CopyFence> {
        self.submit_graph(vec![desc])
    }

    /// Lowers a copy graph into linked XDs, creating each on its target node
    /// and returning a fence that finishes when all of them have.
    pub fn submit_graph(&self, descs: Vec<XferDesc>) -> Arc<CopyFence> {
        assert!(!descs.is_empty());
        let inner = &self.inner;

        let fence_id = inner.next_fence_id.fetch_add(1, Ordering::Relaxed);
        let guids: Vec<XferDesId> = descs
            .iter()
            .map(|d| {
                make_guid(
                    d.target_node,
                    inner.my_node,
                    inner.next_xd_index.fetch_add(1, Ordering::Relaxed),
                )
            })
            .collect();

        let fence = Arc::new(CopyFence {
            id: fence_id,
            remaining: AtomicUsize::new(descs.len()),
            successful: AtomicBool::new(true),
            event: Event::new(),
            xd_guids: Mutex::new(guids.clone()),
            engine: Arc::downgrade(inner),
        });
        inner.fences.lock().insert(fence_id, fence.clone());

        for (idx, desc) in descs.into_iter().enumerate() {
            let kind = desc.kind.unwrap_or_else(|| self.auto_kind(&desc));
            let to_wire = |p: &PortDesc| WirePortDesc {
                mem: p.mem,
                iter: p.iter.clone(),
                serdez: p.serdez,
                peer_guid: p.peer.map_or(NO_GUID, |(xd, _)| guids[xd]),
                peer_port_idx: p.peer.map_or(0, |(_, port)| port),
                ib_offset: p.ib.map_or(0, |(off, _)| off),
                ib_size: p.ib.map_or(0, |(_, size)| size),
                kind: p.kind,
            };
            let wire = WireXferDesc {
                guid: guids[idx],
                launch_node: inner.my_node,
                kind,
                priority: desc.priority,
                fence_id,
                inputs: desc.inputs.iter().map(to_wire).collect(),
                outputs: desc.outputs.iter().map(to_wire).collect(),
            };
            if desc.target_node == inner.my_node {
                inner.create_xd_local(wire, desc.metadata_event.unwrap_or(Event::NO_EVENT));
            } else {
                assert!(
                    desc.metadata_event.is_none(),
                    "metadata events do not travel to remote nodes"
                );
                let desc_bytes = crate::serialize(&wire).expect("unencodable xd descriptor");
                inner.xdq.network().send(
                    desc.target_node,
                    WireMessage::XferDesCreate { desc_bytes },
                    Payload::None,
                );
            }
        }

        fence
    }

    fn auto_kind(&self, desc: &XferDesc) -> XferDesKind {
        let inner = &self.inner;
        let src = inner.memories.lookup(desc.inputs[0].mem);
        let dst = inner.memories.lookup(desc.outputs[0].mem);
        let (_, m) = inner
            .channels
            .find_best(
                inner.my_node,
                &src,
                &dst,
                desc.inputs[0].serdez,
                desc.outputs[0].serdez,
                0,
            )
            .unwrap_or_else(|| {
                panic!(
                    "no channel supports {:?} -> {:?}",
                    src.kind(),
                    dst.kind()
                )
            });
        m.xd_kind
    }

    fn alloc_mem_id(&self) -> MemoryId {
        MemoryId::new(
            self.inner.my_node,
            self.inner.next_mem_index.fetch_add(1, Ordering::Relaxed),
        )
    }
}

impl EngineInner {
    fn fence_finished(&self, fence_id: u64, successful: bool) {
        let fence = self.fences.lock().get(&fence_id).cloned();
        match fence {
            Some(fence) => fence.mark_one_finished(successful),
            None => debug!(target: "ferry::dma", fence_id, "completion for retired fence"),
        }
    }

    fn create_xd_local(&self, wire: WireXferDesc, metadata_event: Event) {
        let channel = self.channels.get_for_kind(wire.kind);
        let build_port = |p: &WirePortDesc| PortInit {
            mem: self.memories.lookup(p.mem),
            iter: p.iter.instantiate(),
            serdez_op: self.serdez.get(p.serdez),
            peer_guid: p.peer_guid,
            peer_port_idx: p.peer_port_idx,
            ib_offset: p.ib_offset,
            ib_size: p.ib_size,
            port_kind: p.kind,
        };
        let inputs: Vec<PortInit> = wire.inputs.iter().map(build_port).collect();
        let outputs: Vec<PortInit> = wire.outputs.iter().map(build_port).collect();

        let xd = XferDes::new(
            wire.guid,
            wire.launch_node,
            wire.kind,
            wire.priority,
            config().max_req_size,
            channel.clone(),
            self.xdq.clone(),
            wire.fence_id,
            inputs,
            outputs,
            metadata_event,
        );

        let variant = match wire.kind {
            XferDesKind::MemCpy => XferDesVariant::Memcpy(MemcpyXferDes::new(xd)),
            XferDesKind::RemoteWrite => {
                XferDesVariant::RemoteWrite(RemoteWriteXferDes::new(xd))
            }
            XferDesKind::DiskRead | XferDesKind::DiskWrite => {
                let aio = match &*channel {
                    Channel::Disk(c) => c.aio(),
                    _ => unreachable!(),
                };
                XferDesVariant::Disk(DiskXferDes::new(xd, aio))
            }
            XferDesKind::FileRead | XferDesKind::FileWrite => {
                let aio = match &*channel {
                    Channel::FileCh(c) => c.aio(),
                    _ => unreachable!(),
                };
                XferDesVariant::FileXd(FileXferDes::new(xd, aio))
            }
            XferDesKind::GlobalRead | XferDesKind::GlobalWrite => {
                XferDesVariant::Global(GlobalXferDes::new(xd))
            }
            XferDesKind::None => panic!("cannot instantiate an XD of kind None"),
        };
        let xd = Arc::new(variant);
        xd.base().set_self_ref(&xd);
        info!(target: "ferry::dma",
              guid = wire.guid, kind = ?wire.kind, "xd created");
        self.xdq.clone().enqueue_xferdes(xd);
    }
}

/// Receiver-side dispatch bound into the mesh; holds the engine weakly so
/// shutdown isn't kept alive by the network.
struct EngineHandler {
    inner: Weak<EngineInner>,
}

impl MessageHandler for EngineHandler {
    fn handle_message(&self, sender: NodeId, msg: WireMessage, payload: Vec<u8>) {
        let this = match self.inner.upgrade() {
            Some(inner) => inner,
            None => return,
        };
        this.handle_message(sender, msg, payload);
    }
}

impl EngineInner {
    fn handle_message(&self, sender: NodeId, msg: WireMessage, payload: Vec<u8>) {
        match msg {
            WireMessage::UpdateBytesWrite {
                guid,
                port_idx,
                span_start,
                span_size,
            } => self
                .xdq
                .update_pre_bytes_write(guid, port_idx, span_start, span_size),
            WireMessage::UpdateBytesTotal {
                guid,
                port_idx,
                pre_bytes_total,
            } => self
                .xdq
                .update_pre_bytes_total(guid, port_idx, pre_bytes_total),
            WireMessage::UpdateBytesRead {
                guid,
                port_idx,
                span_start,
                span_size,
            } => self
                .xdq
                .update_next_bytes_read(guid, port_idx, span_start, span_size),
            WireMessage::XferDesCreate { desc_bytes } => {
                let wire: WireXferDesc =
                    crate::deserialize(&desc_bytes).expect("undecodable xd descriptor");
                self.create_xd_local(wire, Event::NO_EVENT);
            }
            WireMessage::XferDesDestroy { guid } => self.xdq.destroy_xferdes(guid),
            WireMessage::NotifyComplete {
                fence_id,
                successful,
            } => self.fence_finished(fence_id, successful),
            WireMessage::RemoteWrite {
                next_xd_guid,
                next_port_idx,
                span_start,
                span_size,
                pre_bytes_total,
                req_token,
                ..
            } => {
                info!(target: "ferry::xd",
                      next = next_xd_guid, start = span_start, size = span_size,
                      pbt = pre_bytes_total, "remote write received");
                if next_xd_guid != NO_GUID {
                    if pre_bytes_total != usize::MAX {
                        self.xdq
                            .update_pre_bytes_total(next_xd_guid, next_port_idx, pre_bytes_total);
                    }
                    self.xdq.update_pre_bytes_write(
                        next_xd_guid,
                        next_port_idx,
                        span_start,
                        span_size,
                    );
                }
                // don't ack empty requests
                if !payload.is_empty() {
                    self.xdq.network().send(
                        sender,
                        WireMessage::RemoteWriteAck { req_token },
                        Payload::None,
                    );
                }
            }
            WireMessage::RemoteWriteAck { req_token } => {
                self.xdq.network().complete_pending(req_token)
            }
            WireMessage::Write1D {
                next_xd_guid,
                next_port_idx,
                span_start,
                ..
            } => {
                info!(target: "ferry::xd",
                      next = next_xd_guid, start = span_start, size = payload.len(),
                      "1d write received");
                if next_xd_guid != NO_GUID {
                    self.xdq.update_pre_bytes_write(
                        next_xd_guid,
                        next_port_idx,
                        span_start,
                        payload.len(),
                    );
                }
            }
        }
    }
}
