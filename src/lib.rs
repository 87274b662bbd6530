//! Ferry is a data-movement engine for distributed task-based runtimes.
//!
//! Clients submit copy operations that move bytes between memories -- host
//! memory, disk or file backed storage, globally addressable segments, or
//! memory on another node. The engine decomposes each copy into a pipeline of
//! transfer descriptors (XDs) connected by flow-controlled byte streams,
//! schedules them across typed channels (local memcpy, file/disk I/O, global
//! memory access, remote writes), and drives them to completion on a pool of
//! background worker threads.
//!
//! EXAMPLES
//! --------
//!
//! # Starting an engine and performing a local copy
//! ```no_run
//! use ferry::{DmaEngine, PortDesc, IterDesc, XferDesc};
//!
//! let engine = DmaEngine::start(Default::default());
//! let src = engine.register_system_memory(1 << 20);
//! let dst = engine.register_system_memory(1 << 20);
//! let fence = engine.submit(XferDesc::memcpy(
//!     vec![PortDesc::direct(src, IterDesc::span(0, 1 << 20))],
//!     vec![PortDesc::direct(dst, IterDesc::span(0, 1 << 20))],
//! ));
//! fence.wait();
//! engine.shutdown();
//! ```

#[macro_use]
extern crate lazy_static;

mod addr_list;
mod aio;
mod bgwork;
mod channel;
mod engine;
pub mod env_var;
mod event;
mod memory;
mod network;
mod sequence;
mod serdez;
mod transfer;
mod xd_queue;
mod xfer_des;

pub use crate::channel::XferDesKind;
pub use crate::engine::{CopyFence, DmaEngine, EngineOptions, PortDesc, XferDesc};
pub use crate::env_var::config;
pub use crate::event::Event;
pub use crate::memory::{MemoryId, MemoryKind, RemoteAddress};
pub use crate::network::Backend;
pub use crate::serdez::{CustomSerdez, SerdezId};
pub use crate::transfer::IterDesc;

/// Index of a node (process) participating in the engine's network.
pub type NodeId = usize;

/// Globally unique id of a transfer descriptor.
///
/// The top bits name the owning node, the next bits the launching node, and
/// the low bits a per-launcher index.  `NO_GUID` is the reserved "no peer"
/// sentinel: a port with no peer reads from or writes to user memory
/// directly.
pub type XferDesId = u64;

pub(crate) const NODE_BITS: u32 = 16;
pub(crate) const INDEX_BITS: u32 = 32;

pub(crate) const NO_GUID: XferDesId = 0;

#[inline]
pub(crate) fn guid_owner_node(guid: XferDesId) -> NodeId {
    (guid >> (NODE_BITS + INDEX_BITS)) as NodeId
}

#[inline]
pub(crate) fn make_guid(owner: NodeId, launcher: NodeId, index: u64) -> XferDesId {
    debug_assert!(index < (1u64 << INDEX_BITS));
    ((owner as u64) << (NODE_BITS + INDEX_BITS))
        | ((launcher as u64 & ((1 << NODE_BITS) - 1)) << INDEX_BITS)
        | index
}

pub(crate) fn serialize<T: ?Sized>(obj: &T) -> Result<Vec<u8>, anyhow::Error>
where
    T: serde::Serialize,
{
    Ok(bincode::serialize(obj)?)
}

pub(crate) fn deserialize<'a, T>(bytes: &'a [u8]) -> Result<T, anyhow::Error>
where
    T: serde::Deserialize<'a>,
{
    Ok(bincode::deserialize(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guid_round_trip() {
        let guid = make_guid(3, 1, 0x1234);
        assert_eq!(guid_owner_node(guid), 3);
        assert_ne!(guid, NO_GUID);
    }
}
