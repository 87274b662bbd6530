use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::sync::Arc;

use enum_dispatch::enum_dispatch;
use parking_lot::RwLock;

use crate::NodeId;

/// The flavor of a memory, which drives channel path matching.
#[derive(
    serde::Serialize, serde::Deserialize, Debug, PartialEq, Eq, Ord, PartialOrd, Hash, Clone, Copy,
)]
pub enum MemoryKind {
    /// Ordinary host memory
    System,
    /// Host memory registered with the network for RDMA
    Registered,
    /// Host memory visible to accelerators without staging
    ZeroCopy,
    /// Host memory pinned to a particular socket
    Socket,
    /// Disk-backed memory accessed through the AIO context
    Disk,
    /// A user file accessed through the AIO context
    File,
    /// A globally addressable segment reachable from every node
    Global,
}

/// Handle naming a memory: owning node in the top bits, per-node index below.
#[derive(
    serde::Serialize, serde::Deserialize, Debug, PartialEq, Eq, Ord, PartialOrd, Hash, Clone, Copy,
)]
pub struct MemoryId(u64);

const MEM_NODE_BITS: u32 = 16;

impl MemoryId {
    pub(crate) fn new(node: NodeId, index: u64) -> MemoryId {
        MemoryId(((node as u64) << (64 - MEM_NODE_BITS)) | index)
    }

    pub fn owner_node(&self) -> NodeId {
        (self.0 >> (64 - MEM_NODE_BITS)) as NodeId
    }
}

/// A network-resolvable destination address (typically {rkey, va}).
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteAddress {
    pub rkey: u64,
    pub addr: u64,
}

/// Opaque per-network registration blob for a local memory.
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone)]
pub(crate) struct RdmaInfo {
    pub(crate) bytes: Vec<u8>,
}

#[enum_dispatch]
pub(crate) trait MemoryOps {
    fn id(&self) -> MemoryId;
    fn kind(&self) -> MemoryKind;
    fn size(&self) -> usize;
    /// Raw pointer for direct load/store access, or `None` if the memory has
    /// no CPU mapping (disk, file, remote).
    fn get_direct_ptr(&self, offset: usize, len: usize) -> Option<*mut u8>;
    /// Network-resolvable address of `offset`, or `None` if the memory is not
    /// reachable by remote writes.
    fn get_remote_addr(&self, offset: usize) -> Option<RemoteAddress>;
    /// RDMA registration info if this (local) memory is registered.
    fn get_rdma_info(&self) -> Option<RdmaInfo>;
    /// Bulk access for memories without a CPU mapping; storage-backed kinds
    /// report I/O failures to the caller.
    fn get_bytes(&self, offset: usize, dst: &mut [u8]) -> io::Result<()>;
    fn put_bytes(&self, offset: usize, src: &[u8]) -> io::Result<()>;
}

#[enum_dispatch(MemoryOps)]
#[derive(Debug)]
pub(crate) enum Memory {
    System(SystemMemory),
    Disk(DiskMemory),
    FileMem(FileMemory),
    Global(GlobalMemory),
    Remote(RemoteMemory),
}

impl Memory {
    pub(crate) fn owner_node(&self) -> NodeId {
        self.id().owner_node()
    }
}

/// Host memory owned by this process.  `Registered` memories additionally
/// advertise an RDMA mapping, which in the in-process mesh is just the
/// virtual address itself.
pub(crate) struct SystemMemory {
    id: MemoryId,
    kind: MemoryKind,
    base: *mut u8,
    size: usize,
    layout: std::alloc::Layout,
}

// raw base pointer is only dereferenced through offset-checked accessors
unsafe impl Send for SystemMemory {}
unsafe impl Sync for SystemMemory {}

impl SystemMemory {
    pub(crate) fn new(id: MemoryId, kind: MemoryKind, size: usize) -> SystemMemory {
        assert!(matches!(
            kind,
            MemoryKind::System | MemoryKind::Registered | MemoryKind::ZeroCopy | MemoryKind::Socket
        ));
        let layout = std::alloc::Layout::from_size_align(size.max(1), 64).unwrap();
        let base = unsafe { std::alloc::alloc_zeroed(layout) };
        assert!(!base.is_null());
        SystemMemory {
            id,
            kind,
            base,
            size,
            layout,
        }
    }
}

impl Drop for SystemMemory {
    fn drop(&mut self) {
        unsafe { std::alloc::dealloc(self.base, self.layout) };
    }
}

impl std::fmt::Debug for SystemMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "SystemMemory {{ id: {:?} kind: {:?} size: {} }}",
            self.id, self.kind, self.size
        )
    }
}

impl MemoryOps for SystemMemory {
    fn id(&self) -> MemoryId {
        self.id
    }
    fn kind(&self) -> MemoryKind {
        self.kind
    }
    fn size(&self) -> usize {
        self.size
    }
    fn get_direct_ptr(&self, offset: usize, len: usize) -> Option<*mut u8> {
        if offset + len > self.size {
            return None;
        }
        Some(unsafe { self.base.add(offset) })
    }
    fn get_remote_addr(&self, offset: usize) -> Option<RemoteAddress> {
        if self.kind != MemoryKind::Registered {
            return None;
        }
        Some(RemoteAddress {
            rkey: self.id.0,
            addr: self.base as u64 + offset as u64,
        })
    }
    fn get_rdma_info(&self) -> Option<RdmaInfo> {
        if self.kind != MemoryKind::Registered {
            return None;
        }
        Some(RdmaInfo {
            bytes: (self.base as u64).to_le_bytes().to_vec(),
        })
    }
    fn get_bytes(&self, offset: usize, dst: &mut [u8]) -> io::Result<()> {
        assert!(offset + dst.len() <= self.size);
        unsafe {
            std::ptr::copy_nonoverlapping(self.base.add(offset), dst.as_mut_ptr(), dst.len())
        };
        Ok(())
    }
    fn put_bytes(&self, offset: usize, src: &[u8]) -> io::Result<()> {
        assert!(offset + src.len() <= self.size);
        unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), self.base.add(offset), src.len()) };
        Ok(())
    }
}

/// Disk-backed memory: a file treated as a flat byte range with no CPU
/// mapping, reachable only through the disk channel.
#[derive(Debug)]
pub(crate) struct DiskMemory {
    id: MemoryId,
    file: File,
    size: usize,
}

impl DiskMemory {
    pub(crate) fn new(id: MemoryId, file: File, size: usize) -> DiskMemory {
        DiskMemory { id, file, size }
    }
}

impl MemoryOps for DiskMemory {
    fn id(&self) -> MemoryId {
        self.id
    }
    fn kind(&self) -> MemoryKind {
        MemoryKind::Disk
    }
    fn size(&self) -> usize {
        self.size
    }
    fn get_direct_ptr(&self, _offset: usize, _len: usize) -> Option<*mut u8> {
        None
    }
    fn get_remote_addr(&self, _offset: usize) -> Option<RemoteAddress> {
        None
    }
    fn get_rdma_info(&self) -> Option<RdmaInfo> {
        None
    }
    fn get_bytes(&self, offset: usize, dst: &mut [u8]) -> io::Result<()> {
        self.file.read_exact_at(dst, offset as u64)
    }
    fn put_bytes(&self, offset: usize, src: &[u8]) -> io::Result<()> {
        self.file.write_all_at(src, offset as u64)
    }
}

/// A user-provided file exposed as a memory, for attach-style copies.
#[derive(Debug)]
pub(crate) struct FileMemory {
    id: MemoryId,
    file: File,
    size: usize,
}

impl FileMemory {
    pub(crate) fn new(id: MemoryId, file: File, size: usize) -> FileMemory {
        FileMemory { id, file, size }
    }
}

impl MemoryOps for FileMemory {
    fn id(&self) -> MemoryId {
        self.id
    }
    fn kind(&self) -> MemoryKind {
        MemoryKind::File
    }
    fn size(&self) -> usize {
        self.size
    }
    fn get_direct_ptr(&self, _offset: usize, _len: usize) -> Option<*mut u8> {
        None
    }
    fn get_remote_addr(&self, _offset: usize) -> Option<RemoteAddress> {
        None
    }
    fn get_rdma_info(&self) -> Option<RdmaInfo> {
        None
    }
    fn get_bytes(&self, offset: usize, dst: &mut [u8]) -> io::Result<()> {
        self.file.read_exact_at(dst, offset as u64)
    }
    fn put_bytes(&self, offset: usize, src: &[u8]) -> io::Result<()> {
        self.file.write_all_at(src, offset as u64)
    }
}

/// A globally addressable segment: every node can `get_bytes`/`put_bytes`,
/// nobody gets a direct pointer, so all access flows through the global
/// channel.
pub(crate) struct GlobalMemory {
    id: MemoryId,
    base: *mut u8,
    size: usize,
    layout: std::alloc::Layout,
}

unsafe impl Send for GlobalMemory {}
unsafe impl Sync for GlobalMemory {}

impl GlobalMemory {
    pub(crate) fn new(id: MemoryId, size: usize) -> GlobalMemory {
        let layout = std::alloc::Layout::from_size_align(size.max(1), 64).unwrap();
        let base = unsafe { std::alloc::alloc_zeroed(layout) };
        assert!(!base.is_null());
        GlobalMemory {
            id,
            base,
            size,
            layout,
        }
    }
}

impl Drop for GlobalMemory {
    fn drop(&mut self) {
        unsafe { std::alloc::dealloc(self.base, self.layout) };
    }
}

impl std::fmt::Debug for GlobalMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "GlobalMemory {{ id: {:?} size: {} }}",
            self.id, self.size
        )
    }
}

impl MemoryOps for GlobalMemory {
    fn id(&self) -> MemoryId {
        self.id
    }
    fn kind(&self) -> MemoryKind {
        MemoryKind::Global
    }
    fn size(&self) -> usize {
        self.size
    }
    fn get_direct_ptr(&self, _offset: usize, _len: usize) -> Option<*mut u8> {
        None
    }
    fn get_remote_addr(&self, _offset: usize) -> Option<RemoteAddress> {
        None
    }
    fn get_rdma_info(&self) -> Option<RdmaInfo> {
        None
    }
    fn get_bytes(&self, offset: usize, dst: &mut [u8]) -> io::Result<()> {
        assert!(offset + dst.len() <= self.size);
        unsafe {
            std::ptr::copy_nonoverlapping(self.base.add(offset), dst.as_mut_ptr(), dst.len())
        };
        Ok(())
    }
    fn put_bytes(&self, offset: usize, src: &[u8]) -> io::Result<()> {
        assert!(offset + src.len() <= self.size);
        unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), self.base.add(offset), src.len()) };
        Ok(())
    }
}

/// Proxy for a memory owned by another node.  Carries just enough to answer
/// path queries and resolve remote addresses; data never moves through it
/// directly.
#[derive(Debug)]
pub(crate) struct RemoteMemory {
    id: MemoryId,
    kind: MemoryKind,
    remote_base: u64,
    size: usize,
    rdma: bool,
}

impl RemoteMemory {
    pub(crate) fn new(
        id: MemoryId,
        kind: MemoryKind,
        remote_base: u64,
        size: usize,
        rdma: bool,
    ) -> RemoteMemory {
        RemoteMemory {
            id,
            kind,
            remote_base,
            size,
            rdma,
        }
    }
}

impl MemoryOps for RemoteMemory {
    fn id(&self) -> MemoryId {
        self.id
    }
    fn kind(&self) -> MemoryKind {
        self.kind
    }
    fn size(&self) -> usize {
        self.size
    }
    fn get_direct_ptr(&self, _offset: usize, _len: usize) -> Option<*mut u8> {
        None
    }
    fn get_remote_addr(&self, offset: usize) -> Option<RemoteAddress> {
        if !self.rdma {
            return None;
        }
        Some(RemoteAddress {
            rkey: self.id.0,
            addr: self.remote_base + offset as u64,
        })
    }
    fn get_rdma_info(&self) -> Option<RdmaInfo> {
        None
    }
    fn get_bytes(&self, _offset: usize, _dst: &mut [u8]) -> io::Result<()> {
        panic!("remote memory has no local access path");
    }
    fn put_bytes(&self, _offset: usize, _src: &[u8]) -> io::Result<()> {
        panic!("remote memory has no local access path");
    }
}

/// Per-engine registry of memories this node knows about.
pub(crate) struct MemoryTable {
    mems: RwLock<HashMap<MemoryId, Arc<Memory>>>,
}

impl MemoryTable {
    pub(crate) fn new() -> MemoryTable {
        MemoryTable {
            mems: RwLock::new(HashMap::new()),
        }
    }

    pub(crate) fn insert(&self, mem: Arc<Memory>) -> MemoryId {
        let id = mem.id();
        let old = self.mems.write().insert(id, mem);
        assert!(old.is_none(), "memory {:?} registered twice", id);
        id
    }

    pub(crate) fn lookup(&self, id: MemoryId) -> Arc<Memory> {
        self.mems
            .read()
            .get(&id)
            .unwrap_or_else(|| panic!("unknown memory {:?}", id))
            .clone()
    }
}
