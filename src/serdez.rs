use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

/// Identifies a registered serdez operator; 0 means "no serdez".
pub type SerdezId = u32;

pub(crate) const NO_SERDEZ: SerdezId = 0;

/// User-defined element-wise serialization for a transfer port.
///
/// `max_serialized_size` bounds the encoded size of any single element; the
/// engine sizes flow-control reservations against it and refunds the
/// difference once actual sizes are known.
pub trait CustomSerdez: Send + Sync {
    /// In-memory size of one element.
    fn sizeof_field_type(&self) -> usize;

    /// Worst-case encoded size of one element.
    fn max_serialized_size(&self) -> usize;

    /// Serialize `count` elements of `field_size` bytes each from `src` into
    /// `dst`; returns the number of bytes written.
    ///
    /// # Safety
    /// `src` must reference `count * field_size` readable bytes and `dst`
    /// must have room for `count * max_serialized_size()` bytes.
    unsafe fn serialize(&self, src: *const u8, field_size: usize, count: usize, dst: *mut u8)
        -> usize;

    /// Serialize exactly one element; returns bytes written (at most
    /// `max_serialized_size()`).
    ///
    /// # Safety
    /// As `serialize`, with `count == 1`.
    unsafe fn serialize_one(&self, src: *const u8, dst: *mut u8) -> usize;

    /// Deserialize `count` elements into `dst` from the encoded stream at
    /// `src`; returns the number of encoded bytes consumed.
    ///
    /// # Safety
    /// `dst` must have room for `count * field_size` bytes and `src` must
    /// hold complete encodings of `count` elements.
    unsafe fn deserialize(&self, dst: *mut u8, field_size: usize, count: usize, src: *const u8)
        -> usize;

    /// Deserialize exactly one element; returns encoded bytes consumed.
    ///
    /// # Safety
    /// As `deserialize`, with `count == 1`; `src` must hold at least
    /// `max_serialized_size()` readable bytes.
    unsafe fn deserialize_one(&self, dst: *mut u8, src: *const u8) -> usize;
}

/// Process-wide registry of serdez operators, keyed by id.
pub(crate) struct SerdezTable {
    ops: RwLock<HashMap<SerdezId, Arc<dyn CustomSerdez>>>,
}

impl SerdezTable {
    pub(crate) fn new() -> SerdezTable {
        SerdezTable {
            ops: RwLock::new(HashMap::new()),
        }
    }

    pub(crate) fn register(&self, id: SerdezId, op: Arc<dyn CustomSerdez>) {
        assert_ne!(id, NO_SERDEZ);
        let old = self.ops.write().insert(id, op);
        assert!(old.is_none(), "serdez id {} registered twice", id);
    }

    pub(crate) fn get(&self, id: SerdezId) -> Option<Arc<dyn CustomSerdez>> {
        if id == NO_SERDEZ {
            return None;
        }
        Some(
            self.ops
                .read()
                .get(&id)
                .unwrap_or_else(|| panic!("unknown serdez id {}", id))
                .clone(),
        )
    }
}
