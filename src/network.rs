use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use enum_dispatch::enum_dispatch;
use parking_lot::{Mutex, RwLock};
use tracing::trace;

use crate::memory::RemoteAddress;
use crate::{NodeId, XferDesId};

// transports discount the header when recommending payload sizes
const MESH_MAX_MESSAGE: usize = 16 << 10;

lazy_static! {
    static ref WIRE_HEADER_LEN: usize = bincode::serialized_size(&WireMessage::RemoteWrite {
        dst: RemoteAddress {
            rkey: u64::MAX,
            addr: u64::MAX,
        },
        next_xd_guid: u64::MAX,
        next_port_idx: usize::MAX,
        span_start: usize::MAX,
        span_size: usize::MAX,
        pre_bytes_total: usize::MAX,
        req_token: u64::MAX,
    })
    .unwrap() as usize;
}

/// The list of available network backends, used to specify how engines reach
/// each other.
#[derive(serde::Serialize, serde::Deserialize, Debug, PartialEq, Eq, Clone, Copy, Default)]
pub enum Backend {
    /// Single-process, single-node; remote sends are a protocol violation.
    #[default]
    Loopback,
    /// N in-process virtual nodes sharing an address space.
    Mesh,
}

/// Everything that crosses between nodes.  All messages are fire-and-forget
/// with reliable delivery; `sender` is implicit from the transport.
#[derive(serde::Serialize, serde::Deserialize, Debug)]
pub(crate) enum WireMessage {
    UpdateBytesWrite {
        guid: XferDesId,
        port_idx: usize,
        span_start: usize,
        span_size: usize,
    },
    UpdateBytesTotal {
        guid: XferDesId,
        port_idx: usize,
        pre_bytes_total: usize,
    },
    UpdateBytesRead {
        guid: XferDesId,
        port_idx: usize,
        span_start: usize,
        span_size: usize,
    },
    XferDesCreate {
        desc_bytes: Vec<u8>,
    },
    XferDesDestroy {
        guid: XferDesId,
    },
    NotifyComplete {
        fence_id: u64,
        successful: bool,
    },
    /// Payload write with piggybacked flow-control updates; acked.
    RemoteWrite {
        dst: RemoteAddress,
        next_xd_guid: XferDesId,
        next_port_idx: usize,
        span_start: usize,
        span_size: usize,
        /// `usize::MAX` when the final total is not yet known.
        pre_bytes_total: usize,
        req_token: u64,
    },
    RemoteWriteAck {
        req_token: u64,
    },
    /// Payload write whose completion rides the transport itself; no
    /// explicit ack.
    Write1D {
        dst: RemoteAddress,
        next_xd_guid: XferDesId,
        next_port_idx: usize,
        span_start: usize,
    },
}

/// Source bytes for a payload-bearing message, marshalled at send time.
pub(crate) enum Payload {
    None,
    Contig {
        base: *const u8,
        bytes: usize,
    },
    Lines {
        base: *const u8,
        bytes_per_line: usize,
        lines: usize,
        stride: usize,
    },
    Owned(Vec<u8>),
}

impl Payload {
    fn marshal(self) -> Vec<u8> {
        match self {
            Payload::None => Vec::new(),
            Payload::Contig { base, bytes } => {
                let mut v = vec![0u8; bytes];
                unsafe { std::ptr::copy_nonoverlapping(base, v.as_mut_ptr(), bytes) };
                v
            }
            Payload::Lines {
                base,
                bytes_per_line,
                lines,
                stride,
            } => {
                let mut v = vec![0u8; bytes_per_line * lines];
                for l in 0..lines {
                    unsafe {
                        std::ptr::copy_nonoverlapping(
                            base.add(l * stride),
                            v.as_mut_ptr().add(l * bytes_per_line),
                            bytes_per_line,
                        )
                    };
                }
                v
            }
            Payload::Owned(v) => v,
        }
    }
}

pub(crate) type Completion = Box<dyn FnOnce() + Send>;

/// Receiver-side dispatch, implemented by the engine.
pub(crate) trait MessageHandler: Send + Sync {
    fn handle_message(&self, sender: NodeId, msg: WireMessage, payload: Vec<u8>);
}

#[enum_dispatch]
pub(crate) trait NetworkOps: Send + Sync {
    fn my_node(&self) -> NodeId;
    fn num_nodes(&self) -> usize;
    /// Preferred upper bound on a single payload message to `target`.
    fn recommended_max_payload(&self, target: NodeId) -> usize;
    fn send(&self, target: NodeId, msg: WireMessage, payload: Payload);
    /// Payload send with transport-level completion callbacks: `local` fires
    /// once the source bytes have been captured, `remote` once the message
    /// has been processed at the target.
    fn send_with_completions(
        &self,
        target: NodeId,
        msg: WireMessage,
        payload: Payload,
        local: Option<Completion>,
        remote: Option<Completion>,
    );
    /// Registers a completion to run when the matching ack returns.
    fn register_pending(&self, comp: Completion) -> u64;
    fn complete_pending(&self, token: u64);
}

#[enum_dispatch(NetworkOps)]
pub(crate) enum Network {
    Loopback(LoopbackNetwork),
    Mesh(MeshEndpoint),
}

/// Single-node network: supplies identity and nothing else.  Construction of
/// remote paths is never attempted when there is no real network.
pub(crate) struct LoopbackNetwork;

impl NetworkOps for LoopbackNetwork {
    fn my_node(&self) -> NodeId {
        0
    }
    fn num_nodes(&self) -> usize {
        1
    }
    fn recommended_max_payload(&self, _target: NodeId) -> usize {
        MESH_MAX_MESSAGE - *WIRE_HEADER_LEN
    }
    fn send(&self, target: NodeId, msg: WireMessage, _payload: Payload) {
        panic!("loopback network has no peer {} for {:?}", target, msg);
    }
    fn send_with_completions(
        &self,
        target: NodeId,
        msg: WireMessage,
        _payload: Payload,
        _local: Option<Completion>,
        _remote: Option<Completion>,
    ) {
        panic!("loopback network has no peer {} for {:?}", target, msg);
    }
    fn register_pending(&self, _comp: Completion) -> u64 {
        panic!("loopback network cannot track pending operations");
    }
    fn complete_pending(&self, _token: u64) {
        panic!("loopback network cannot track pending operations");
    }
}

/// Shared state of the in-process mesh: one handler slot per virtual node.
pub(crate) struct MeshState {
    endpoints: RwLock<Vec<Option<Arc<dyn MessageHandler>>>>,
}

impl MeshState {
    pub(crate) fn new(nodes: usize) -> Arc<MeshState> {
        Arc::new(MeshState {
            endpoints: RwLock::new(vec![None; nodes]),
        })
    }

    pub(crate) fn bind(&self, node: NodeId, handler: Arc<dyn MessageHandler>) {
        let mut eps = self.endpoints.write();
        assert!(eps[node].is_none(), "node {} bound twice", node);
        eps[node] = Some(handler);
    }

    pub(crate) fn unbind(&self, node: NodeId) {
        self.endpoints.write()[node] = None;
    }

    fn deliver(&self, sender: NodeId, target: NodeId, bytes: Vec<u8>, payload: Vec<u8>) {
        let handler = self.endpoints.read()[target]
            .clone()
            .unwrap_or_else(|| panic!("mesh node {} is not bound", target));
        let msg: WireMessage = crate::deserialize(&bytes).expect("undecodable mesh message");

        // payload-bearing messages behave like RDMA: bytes land at the
        // destination address before the handler sees the message
        match &msg {
            WireMessage::RemoteWrite { dst, .. } | WireMessage::Write1D { dst, .. } => {
                if !payload.is_empty() {
                    unsafe {
                        std::ptr::copy_nonoverlapping(
                            payload.as_ptr(),
                            dst.addr as *mut u8,
                            payload.len(),
                        )
                    };
                }
            }
            _ => {}
        }

        trace!(target: "ferry::dma", sender, target, ?msg, "mesh deliver");
        handler.handle_message(sender, msg, payload);
    }
}

/// One node's attachment to the mesh.
pub(crate) struct MeshEndpoint {
    state: Arc<MeshState>,
    node: NodeId,
    nodes: usize,
    pending: Mutex<HashMap<u64, Completion>>,
    next_token: AtomicU64,
}

impl MeshEndpoint {
    pub(crate) fn new(state: Arc<MeshState>, node: NodeId, nodes: usize) -> MeshEndpoint {
        MeshEndpoint {
            state,
            node,
            nodes,
            pending: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
        }
    }
}

impl NetworkOps for MeshEndpoint {
    fn my_node(&self) -> NodeId {
        self.node
    }
    fn num_nodes(&self) -> usize {
        self.nodes
    }
    fn recommended_max_payload(&self, _target: NodeId) -> usize {
        MESH_MAX_MESSAGE - *WIRE_HEADER_LEN
    }

    fn send(&self, target: NodeId, msg: WireMessage, payload: Payload) {
        assert_ne!(target, self.node, "mesh send to self");
        let bytes = crate::serialize(&msg).expect("unencodable mesh message");
        self.state.deliver(self.node, target, bytes, payload.marshal());
    }

    fn send_with_completions(
        &self,
        target: NodeId,
        msg: WireMessage,
        payload: Payload,
        local: Option<Completion>,
        remote: Option<Completion>,
    ) {
        assert_ne!(target, self.node, "mesh send to self");
        let bytes = crate::serialize(&msg).expect("unencodable mesh message");
        let payload = payload.marshal();
        // source bytes are captured once marshalled
        if let Some(local) = local {
            local();
        }
        self.state.deliver(self.node, target, bytes, payload);
        if let Some(remote) = remote {
            remote();
        }
    }

    fn register_pending(&self, comp: Completion) -> u64 {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.pending.lock().insert(token, comp);
        token
    }

    fn complete_pending(&self, token: u64) {
        let comp = self
            .pending
            .lock()
            .remove(&token)
            .expect("ack for unknown request token");
        comp();
    }
}
