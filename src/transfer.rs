use enum_dispatch::enum_dispatch;

use crate::addr_list::{AddressList, MAX_DIM};
use crate::event::Event;

/// One step's worth of addresses: a regular rectangle of up to three
/// dimensions.  `bytes_per_chunk * num_lines * num_planes` is the total byte
/// count of the step; `num_lines == 1` implies `num_planes == 1`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct AddressInfo {
    pub(crate) base_offset: usize,
    pub(crate) bytes_per_chunk: usize,
    pub(crate) num_lines: usize,
    pub(crate) line_stride: usize,
    pub(crate) num_planes: usize,
    pub(crate) plane_stride: usize,
}

impl AddressInfo {
    pub(crate) fn contig(base_offset: usize, bytes: usize) -> AddressInfo {
        AddressInfo {
            base_offset,
            bytes_per_chunk: bytes,
            num_lines: 1,
            line_stride: 0,
            num_planes: 1,
            plane_stride: 0,
        }
    }

    pub(crate) fn total_bytes(&self) -> usize {
        self.bytes_per_chunk * self.num_lines * self.num_planes
    }
}

/// Which dimensionalities the caller can accept from a step.
#[derive(Debug, Clone, Copy)]
pub(crate) struct StepFlags {
    pub(crate) lines_ok: bool,
    pub(crate) planes_ok: bool,
}

impl StepFlags {
    pub(crate) const CONTIG_ONLY: StepFlags = StepFlags {
        lines_ok: false,
        planes_ok: false,
    };
    pub(crate) const ANY_DIM: StepFlags = StepFlags {
        lines_ok: true,
        planes_ok: true,
    };
    pub(crate) const LINES_ONLY: StepFlags = StepFlags {
        lines_ok: true,
        planes_ok: false,
    };
}

/// Stateful producer of the addresses of one port's subregion.
///
/// Two consumption modes exist and must not be mixed on one iterator:
/// stepwise (`step`/`confirm_step`/`cancel_step`, used by request-at-a-time
/// channels and the serdez paths) and bulk (`get_addresses`, which drains
/// rectangles into an `AddressList` for the cursor-driven channels).
#[enum_dispatch]
pub(crate) trait TransferIterator {
    /// Readiness of the metadata this iterator depends on; the engine defers
    /// an XD's enqueue until every port's event has triggered.  Iterators
    /// with no backing instance are always ready.
    fn request_metadata(&self) -> Event {
        Event::NO_EVENT
    }

    /// True once every address has been produced.
    fn done(&self) -> bool;

    /// Takes up to `max_bytes` of addresses.  A tentative step may be
    /// confirmed or cancelled exactly once; stepping again while a tentative
    /// step is outstanding is a caller bug.  Returns `None` when no forward
    /// progress is possible.
    fn step(&mut self, max_bytes: usize, flags: StepFlags, tentative: bool)
        -> Option<(usize, AddressInfo)>;

    fn confirm_step(&mut self);

    fn cancel_step(&mut self);

    /// Bulk-produce rectangles into `addrlist` until the iterator or the ring
    /// is exhausted.  Returns true if the caller should flush what it has
    /// even below its preferred minimum transfer size.
    fn get_addresses(&mut self, addrlist: &mut AddressList) -> bool;
}

#[enum_dispatch(TransferIterator)]
#[derive(Debug, Clone)]
pub(crate) enum TransferIter {
    Span(SpanIter),
    Affine(AffineIter),
    WrappingFifo(WrappingFifoIter),
}

/// Serializable description of a port's iterator, instantiated at XD
/// construction time (possibly on another node).
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone)]
pub enum IterDesc {
    Span {
        offset: usize,
        bytes: usize,
    },
    Affine {
        base: usize,
        /// `(count, stride)` per dimension, innermost first; the innermost
        /// count is in bytes and its stride is ignored.
        dims: Vec<(usize, usize)>,
    },
    Fifo {
        offset: usize,
        bytes: usize,
    },
}

impl IterDesc {
    /// A single contiguous byte range.
    pub fn span(offset: usize, bytes: usize) -> IterDesc {
        IterDesc::Span { offset, bytes }
    }

    /// A strided rectangle; see [`IterDesc::Affine`] for the dim layout.
    pub fn affine(base: usize, dims: Vec<(usize, usize)>) -> IterDesc {
        assert!(!dims.is_empty() && dims.len() <= MAX_DIM);
        IterDesc::Affine { base, dims }
    }

    pub(crate) fn fifo(offset: usize, bytes: usize) -> IterDesc {
        IterDesc::Fifo { offset, bytes }
    }

    pub(crate) fn instantiate(&self) -> TransferIter {
        match self {
            IterDesc::Span { offset, bytes } => TransferIter::Span(SpanIter::new(*offset, *bytes)),
            IterDesc::Affine { base, dims } => {
                TransferIter::Affine(AffineIter::new(*base, dims))
            }
            IterDesc::Fifo { offset, bytes } => {
                TransferIter::WrappingFifo(WrappingFifoIter::new(*offset, *bytes))
            }
        }
    }

    /// Total bytes this iterator will produce, or `None` for the unbounded
    /// FIFO case.
    pub(crate) fn total_bytes(&self) -> Option<usize> {
        match self {
            IterDesc::Span { bytes, .. } => Some(*bytes),
            IterDesc::Affine { dims, .. } => Some(dims.iter().map(|&(c, _)| c).product()),
            IterDesc::Fifo { .. } => None,
        }
    }
}

/// Iterates a single contiguous byte range.
#[derive(Debug, Clone)]
pub(crate) struct SpanIter {
    base: usize,
    size: usize,
    pos: usize,
    saved: Option<usize>,
}

impl SpanIter {
    pub(crate) fn new(base: usize, size: usize) -> SpanIter {
        SpanIter {
            base,
            size,
            pos: 0,
            saved: None,
        }
    }
}

impl TransferIterator for SpanIter {
    fn done(&self) -> bool {
        self.pos >= self.size
    }

    fn step(
        &mut self,
        max_bytes: usize,
        _flags: StepFlags,
        tentative: bool,
    ) -> Option<(usize, AddressInfo)> {
        assert!(self.saved.is_none());
        let avail = self.size - self.pos;
        let bytes = avail.min(max_bytes);
        if bytes == 0 {
            return None;
        }
        let info = AddressInfo::contig(self.base + self.pos, bytes);
        if tentative {
            self.saved = Some(self.pos);
        }
        self.pos += bytes;
        Some((bytes, info))
    }

    fn confirm_step(&mut self) {
        assert!(self.saved.take().is_some());
    }

    fn cancel_step(&mut self) {
        self.pos = self.saved.take().expect("no tentative step to cancel");
    }

    fn get_addresses(&mut self, addrlist: &mut AddressList) -> bool {
        assert!(self.saved.is_none());
        if !self.done() {
            let bytes = self.size - self.pos;
            if let Some(slot) = addrlist.begin_nd_entry(1) {
                slot[0] = (bytes << 4) | 1;
                slot[1] = self.base + self.pos;
                addrlist.commit_nd_entry(1, bytes);
                self.pos = self.size;
            }
        }
        self.done()
    }
}

/// Iterates an N-D strided rectangle in row-major order, producing the
/// largest regular sub-rectangles the current position allows.
#[derive(Debug, Clone)]
pub(crate) struct AffineIter {
    base: usize,
    ndims: usize,
    count: [usize; MAX_DIM],
    stride: [usize; MAX_DIM],
    pos: [usize; MAX_DIM],
    done: bool,
    saved: Option<([usize; MAX_DIM], bool)>,
}

impl AffineIter {
    pub(crate) fn new(base: usize, dims: &[(usize, usize)]) -> AffineIter {
        assert!(!dims.is_empty() && dims.len() <= MAX_DIM);
        let mut count = [1; MAX_DIM];
        let mut stride = [0; MAX_DIM];
        for (i, &(c, s)) in dims.iter().enumerate() {
            assert!(c > 0);
            count[i] = c;
            stride[i] = s;
        }
        AffineIter {
            base,
            ndims: dims.len(),
            count,
            stride,
            pos: [0; MAX_DIM],
            done: false,
            saved: None,
        }
    }

    fn cur_offset(&self) -> usize {
        let mut ofs = self.base + self.pos[0];
        for d in 1..self.ndims {
            ofs += self.pos[d] * self.stride[d];
        }
        ofs
    }

    // carry `units` of dimension `dim` into the position, setting done at the end
    fn advance(&mut self, dim: usize, units: usize) {
        self.pos[dim] += units;
        for d in dim..self.ndims {
            if self.pos[d] < self.count[d] {
                return;
            }
            assert_eq!(self.pos[d], self.count[d]);
            if d + 1 < self.ndims {
                self.pos[d] = 0;
                self.pos[d + 1] += 1;
            } else {
                self.done = true;
            }
        }
    }
}

impl TransferIterator for AffineIter {
    fn done(&self) -> bool {
        self.done
    }

    fn step(
        &mut self,
        max_bytes: usize,
        flags: StepFlags,
        tentative: bool,
    ) -> Option<(usize, AddressInfo)> {
        assert!(self.saved.is_none());
        if self.done {
            return None;
        }
        let chunk_avail = self.count[0] - self.pos[0];
        let chunk = chunk_avail.min(max_bytes);
        if chunk == 0 {
            return None;
        }
        let mut info = AddressInfo::contig(self.cur_offset(), chunk);

        if tentative {
            self.saved = Some((self.pos, self.done));
        }

        if chunk == self.count[0]
            && self.pos[0] == 0
            && flags.lines_ok
            && self.ndims > 1
        {
            let lines_avail = self.count[1] - self.pos[1];
            let lines = lines_avail.min(max_bytes / self.count[0]);
            if lines > 1 {
                info.num_lines = lines;
                info.line_stride = self.stride[1];
                if lines == self.count[1]
                    && self.pos[1] == 0
                    && flags.planes_ok
                    && self.ndims > 2
                {
                    let planes_avail = self.count[2] - self.pos[2];
                    let planes =
                        planes_avail.min(max_bytes / (self.count[0] * self.count[1]));
                    if planes > 1 {
                        info.num_planes = planes;
                        info.plane_stride = self.stride[2];
                        self.advance(2, planes);
                        return Some((info.total_bytes(), info));
                    }
                }
                self.advance(1, lines);
                return Some((info.total_bytes(), info));
            }
        }
        self.advance(0, chunk);
        Some((chunk, info))
    }

    fn confirm_step(&mut self) {
        assert!(self.saved.take().is_some());
    }

    fn cancel_step(&mut self) {
        let (pos, done) = self.saved.take().expect("no tentative step to cancel");
        self.pos = pos;
        self.done = done;
    }

    fn get_addresses(&mut self, addrlist: &mut AddressList) -> bool {
        assert!(self.saved.is_none());
        while !self.done {
            let slot = match addrlist.begin_nd_entry(self.ndims) {
                Some(slot) => slot,
                None => return false,
            };
            let ofs = {
                let mut ofs = self.base + self.pos[0];
                for d in 1..self.ndims {
                    ofs += self.pos[d] * self.stride[d];
                }
                ofs
            };
            // greedily take the largest regular rectangle at the current
            // position: the rest of a partial line, else the rest of the
            // current plane, else all remaining planes
            let dim;
            let units;
            let act_dim;
            let entry_bytes;
            if self.pos[0] != 0 || self.ndims == 1 {
                let chunk = self.count[0] - self.pos[0];
                slot[0] = (chunk << 4) | 1;
                slot[1] = ofs;
                act_dim = 1;
                entry_bytes = chunk;
                dim = 0;
                units = chunk;
            } else if (self.ndims == 2) || (self.pos[1] != 0) {
                let lines = self.count[1] - self.pos[1];
                if lines == 1 {
                    slot[0] = (self.count[0] << 4) | 1;
                    slot[1] = ofs;
                    act_dim = 1;
                } else {
                    slot[0] = (self.count[0] << 4) | 2;
                    slot[1] = ofs;
                    slot[2] = lines;
                    slot[3] = self.stride[1];
                    act_dim = 2;
                }
                entry_bytes = self.count[0] * lines;
                dim = 1;
                units = lines;
            } else {
                let planes = self.count[2] - self.pos[2];
                if planes == 1 {
                    slot[0] = (self.count[0] << 4) | 2;
                    slot[1] = ofs;
                    slot[2] = self.count[1];
                    slot[3] = self.stride[1];
                    act_dim = 2;
                } else {
                    slot[0] = (self.count[0] << 4) | 3;
                    slot[1] = ofs;
                    slot[2] = self.count[1];
                    slot[3] = self.stride[1];
                    slot[4] = planes;
                    slot[5] = self.stride[2];
                    act_dim = 3;
                }
                entry_bytes = self.count[0] * self.count[1] * planes;
                dim = 2;
                units = planes;
            }
            addrlist.commit_nd_entry(act_dim, entry_bytes);
            self.advance(dim, units);
        }
        true
    }
}

/// Endless iterator over a circular intermediate buffer.  Offsets are
/// absolute bytes in the stream; the physical window is `[offset,
/// offset + size)` addressed modulo `size`.  The stream ends only when the
/// peer's final byte total arrives, so `done` never fires here.
#[derive(Debug, Clone)]
pub(crate) struct WrappingFifoIter {
    offset: usize,
    size: usize,
    pos: usize,
    saved: Option<usize>,
}

impl WrappingFifoIter {
    pub(crate) fn new(offset: usize, size: usize) -> WrappingFifoIter {
        assert!(size > 0);
        WrappingFifoIter {
            offset,
            size,
            pos: 0,
            saved: None,
        }
    }
}

impl TransferIterator for WrappingFifoIter {
    fn done(&self) -> bool {
        false
    }

    fn step(
        &mut self,
        max_bytes: usize,
        _flags: StepFlags,
        tentative: bool,
    ) -> Option<(usize, AddressInfo)> {
        assert!(self.saved.is_none());
        if max_bytes == 0 {
            return None;
        }
        let ring_off = self.pos % self.size;
        let bytes = max_bytes.min(self.size - ring_off);
        let info = AddressInfo::contig(self.offset + ring_off, bytes);
        if tentative {
            self.saved = Some(self.pos);
        }
        self.pos += bytes;
        Some((bytes, info))
    }

    fn confirm_step(&mut self) {
        assert!(self.saved.take().is_some());
    }

    fn cancel_step(&mut self) {
        self.pos = self.saved.take().expect("no tentative step to cancel");
    }

    fn get_addresses(&mut self, addrlist: &mut AddressList) -> bool {
        assert!(self.saved.is_none());
        // queue at most one lap ahead of the cursor; flow control keeps the
        // consumer inside the window
        let mut produced = 0;
        while produced < self.size {
            let ring_off = self.pos % self.size;
            let bytes = (self.size - ring_off).min(self.size - produced);
            let slot = match addrlist.begin_nd_entry(1) {
                Some(slot) => slot,
                None => break,
            };
            slot[0] = (bytes << 4) | 1;
            slot[1] = self.offset + ring_off;
            addrlist.commit_nd_entry(1, bytes);
            self.pos += bytes;
            produced += bytes;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr_list::AddressListCursor;

    #[test]
    fn span_steps_and_finishes() {
        let mut it = SpanIter::new(0x100, 1000);
        let (b, info) = it.step(600, StepFlags::CONTIG_ONLY, false).unwrap();
        assert_eq!((b, info.base_offset), (600, 0x100));
        let (b, info) = it.step(600, StepFlags::CONTIG_ONLY, false).unwrap();
        assert_eq!((b, info.base_offset), (400, 0x100 + 600));
        assert!(it.done());
        assert!(it.step(1, StepFlags::CONTIG_ONLY, false).is_none());
    }

    #[test]
    fn tentative_cancel_rewinds() {
        let mut it = SpanIter::new(0, 100);
        let (b, _) = it.step(60, StepFlags::CONTIG_ONLY, true).unwrap();
        assert_eq!(b, 60);
        it.cancel_step();
        let (b, info) = it.step(30, StepFlags::CONTIG_ONLY, true).unwrap();
        assert_eq!((b, info.base_offset), (30, 0));
        it.confirm_step();
        assert_eq!(it.step(100, StepFlags::CONTIG_ONLY, false).unwrap().0, 70);
    }

    #[test]
    fn affine_promotes_to_lines_and_planes() {
        // 2 planes of 4 lines of 32 bytes
        let mut it = AffineIter::new(0, &[(32, 0), (4, 100), (2, 1000)]);
        let (b, info) = it.step(usize::MAX, StepFlags::ANY_DIM, false).unwrap();
        assert_eq!(b, 32 * 4 * 2);
        assert_eq!(info.num_lines, 4);
        assert_eq!(info.line_stride, 100);
        assert_eq!(info.num_planes, 2);
        assert_eq!(info.plane_stride, 1000);
        assert!(it.done());
    }

    #[test]
    fn affine_respects_contig_only() {
        let mut it = AffineIter::new(0, &[(32, 0), (4, 100)]);
        let mut offsets = vec![];
        while let Some((b, info)) = it.step(usize::MAX, StepFlags::CONTIG_ONLY, false) {
            assert_eq!(b, 32);
            offsets.push(info.base_offset);
        }
        assert_eq!(offsets, vec![0, 100, 200, 300]);
    }

    #[test]
    fn affine_partial_line_steps() {
        let mut it = AffineIter::new(0, &[(100, 0), (2, 4096)]);
        let (b, _) = it.step(60, StepFlags::ANY_DIM, false).unwrap();
        assert_eq!(b, 60);
        // mid-line: only the line remainder is available
        let (b, info) = it.step(4096, StepFlags::ANY_DIM, false).unwrap();
        assert_eq!(b, 40);
        assert_eq!(info.base_offset, 60);
        // back at a line start: whole second line in one go
        let (b, info) = it.step(4096, StepFlags::ANY_DIM, false).unwrap();
        assert_eq!(b, 100);
        assert_eq!(info.base_offset, 4096);
        assert!(it.done());
    }

    #[test]
    fn affine_bulk_addresses_round_trip() {
        let mut it = AffineIter::new(0x1000, &[(16, 0), (3, 64), (2, 1024)]);
        let mut list = AddressList::new();
        assert!(it.get_addresses(&mut list));
        assert_eq!(list.bytes_pending(), 16 * 3 * 2);

        let mut cursor = AddressListCursor::new();
        let mut seen = vec![];
        while list.bytes_pending() > 0 {
            let ofs = cursor.get_offset(&mut list);
            let chunk = cursor.remaining(&mut list, 0);
            seen.push((ofs, chunk));
            cursor.advance(&mut list, 0, chunk);
        }
        // every line surfaces exactly once, in order
        assert_eq!(
            seen,
            vec![
                (0x1000, 16),
                (0x1040, 16),
                (0x1080, 16),
                (0x1400, 16),
                (0x1440, 16),
                (0x1480, 16),
            ]
        );
    }

    #[test]
    fn fifo_wraps_modulo_window() {
        let mut it = WrappingFifoIter::new(0x2000, 256);
        let (b, info) = it.step(200, StepFlags::CONTIG_ONLY, false).unwrap();
        assert_eq!((b, info.base_offset), (200, 0x2000));
        // hits the end of the window first
        let (b, info) = it.step(200, StepFlags::CONTIG_ONLY, false).unwrap();
        assert_eq!((b, info.base_offset), (56, 0x2000 + 200));
        // then wraps to the front
        let (b, info) = it.step(200, StepFlags::CONTIG_ONLY, false).unwrap();
        assert_eq!((b, info.base_offset), (200, 0x2000));
        assert!(!it.done());
    }
}
