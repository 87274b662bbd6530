use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::channel::{XferDesOps, XferDesVariant};
use crate::network::{Network, NetworkOps, Payload, WireMessage};
use crate::sequence::SequenceAssembler;
use crate::{guid_owner_node, NodeId, XferDesId};

/// Updates that arrived before the XD they name was registered locally.
#[derive(Default)]
struct XferDesWithUpdates {
    xd: Option<Arc<XferDesVariant>>,
    seq_pre_write: HashMap<usize, SequenceAssembler>,
    pre_bytes_total: HashMap<usize, usize>,
}

type FenceNotify = Box<dyn Fn(u64, bool) + Send + Sync>;

/// Process-wide rendezvous of XDs and their asynchronous byte-count updates.
/// Every operation dispatches locally or sends a message based on the GUID's
/// owner bits.
pub(crate) struct XferDesQueue {
    my_node: NodeId,
    guid_to_xd: RwLock<HashMap<XferDesId, XferDesWithUpdates>>,
    network: OnceLock<Arc<Network>>,
    local_fence_notify: OnceLock<FenceNotify>,
}

impl XferDesQueue {
    pub(crate) fn new(my_node: NodeId) -> Arc<XferDesQueue> {
        Arc::new(XferDesQueue {
            my_node,
            guid_to_xd: RwLock::new(HashMap::new()),
            network: OnceLock::new(),
            local_fence_notify: OnceLock::new(),
        })
    }

    pub(crate) fn attach_network(&self, network: Arc<Network>) {
        self.network
            .set(network)
            .unwrap_or_else(|_| panic!("network attached twice"));
    }

    pub(crate) fn attach_fence_notify(&self, f: FenceNotify) {
        self.local_fence_notify
            .set(f)
            .unwrap_or_else(|_| panic!("fence notifier attached twice"));
    }

    pub(crate) fn network(&self) -> Arc<Network> {
        self.network.get().expect("network not attached").clone()
    }

    pub(crate) fn my_node(&self) -> NodeId {
        self.my_node
    }

    /// Registers the XD under its GUID (merging any updates that arrived
    /// early) and hands it to its channel.  An untriggered metadata event
    /// defers the whole enqueue until the event fires.
    pub(crate) fn enqueue_xferdes(self: Arc<Self>, xd: Arc<XferDesVariant>) {
        let metadata = xd.base().request_metadata();
        if !metadata.has_triggered() {
            info!(target: "ferry::dma", guid = xd.base().guid, "xd metadata wait");
            let xdq = self.clone();
            let xd2 = xd.clone();
            metadata.add_waiter(move || {
                info!(target: "ferry::dma", guid = xd2.base().guid, "xd metadata ready");
                xdq.enqueue_xferdes(xd2);
            });
            return;
        }

        let replays: Vec<ReplayUpdate> = {
            let mut map = self.guid_to_xd.write();
            let entry = map.entry(xd.base().guid).or_default();
            assert!(entry.xd.is_none(), "guid registered twice");
            entry.xd = Some(xd.clone());
            let mut replays = Vec::new();
            for (port_idx, total) in entry.pre_bytes_total.drain() {
                replays.push(ReplayUpdate::Total { port_idx, total });
            }
            for (port_idx, mut seq) in entry.seq_pre_write.drain() {
                for (start, size) in seq.drain_spans() {
                    replays.push(ReplayUpdate::Write {
                        port_idx,
                        start,
                        size,
                    });
                }
            }
            replays
        };

        // deliver buffered updates outside the map lock
        for r in replays {
            match r {
                ReplayUpdate::Total { port_idx, total } => {
                    xd.base().update_pre_bytes_total(port_idx, total)
                }
                ReplayUpdate::Write {
                    port_idx,
                    start,
                    size,
                } => xd.base().update_pre_bytes_write(port_idx, start, size),
            }
        }

        xd.base().update_progress();
    }

    pub(crate) fn update_pre_bytes_write(
        &self,
        guid: XferDesId,
        port_idx: usize,
        span_start: usize,
        span_size: usize,
    ) {
        let owner = guid_owner_node(guid);
        if owner == self.my_node {
            let xd = {
                let mut map = self.guid_to_xd.write();
                let entry = map.entry(guid).or_default();
                match &entry.xd {
                    Some(xd) => xd.clone(),
                    None => {
                        entry
                            .seq_pre_write
                            .entry(port_idx)
                            .or_default()
                            .add_span(span_start, span_size);
                        return;
                    }
                }
            };
            xd.base().update_pre_bytes_write(port_idx, span_start, span_size);
        } else {
            self.network().send(
                owner,
                WireMessage::UpdateBytesWrite {
                    guid,
                    port_idx,
                    span_start,
                    span_size,
                },
                Payload::None,
            );
        }
    }

    pub(crate) fn update_pre_bytes_total(
        &self,
        guid: XferDesId,
        port_idx: usize,
        pre_bytes_total: usize,
    ) {
        let owner = guid_owner_node(guid);
        if owner == self.my_node {
            let xd = {
                let mut map = self.guid_to_xd.write();
                let entry = map.entry(guid).or_default();
                match &entry.xd {
                    Some(xd) => xd.clone(),
                    None => {
                        // never more than one total per stream
                        let old = entry.pre_bytes_total.insert(port_idx, pre_bytes_total);
                        assert!(old.is_none());
                        return;
                    }
                }
            };
            xd.base().update_pre_bytes_total(port_idx, pre_bytes_total);
        } else {
            self.network().send(
                owner,
                WireMessage::UpdateBytesTotal {
                    guid,
                    port_idx,
                    pre_bytes_total,
                },
                Payload::None,
            );
        }
    }

    pub(crate) fn update_next_bytes_read(
        &self,
        guid: XferDesId,
        port_idx: usize,
        span_start: usize,
        span_size: usize,
    ) {
        let owner = guid_owner_node(guid);
        if owner == self.my_node {
            let xd = {
                let map = self.guid_to_xd.read();
                match map.get(&guid) {
                    Some(entry) => entry.xd.clone(),
                    // the producer already finished and retired; the space
                    // update has nobody left to unblock
                    None => None,
                }
            };
            if let Some(xd) = xd {
                xd.base().update_next_bytes_read(port_idx, span_start, span_size);
            }
        } else {
            self.network().send(
                owner,
                WireMessage::UpdateBytesRead {
                    guid,
                    port_idx,
                    span_start,
                    span_size,
                },
                Payload::None,
            );
        }
    }

    /// Retires GUID state, routing to the owner if it lives elsewhere.
    pub(crate) fn destroy_xferdes(&self, guid: XferDesId) {
        let owner = guid_owner_node(guid);
        if owner == self.my_node {
            debug!(target: "ferry::dma", guid, "destroy xferdes");
            self.guid_to_xd.write().remove(&guid);
        } else {
            self.network()
                .send(owner, WireMessage::XferDesDestroy { guid }, Payload::None);
        }
    }

    /// Completion notification back to the launching node's fence.
    pub(crate) fn notify_fence(&self, launch_node: NodeId, fence_id: u64, successful: bool) {
        if launch_node == self.my_node {
            (self.local_fence_notify.get().expect("no fence notifier"))(fence_id, successful);
        } else {
            self.network().send(
                launch_node,
                WireMessage::NotifyComplete {
                    fence_id,
                    successful,
                },
                Payload::None,
            );
        }
    }

}

enum ReplayUpdate {
    Total {
        port_idx: usize,
        total: usize,
    },
    Write {
        port_idx: usize,
        start: usize,
        size: usize,
    },
}
