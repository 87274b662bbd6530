/// Highest dimensionality carried by a single address entry.
pub(crate) const MAX_DIM: usize = 3;

const MAX_ENTRIES: usize = 256;

/// A bounded single-producer single-consumer ring of N-D address rectangles.
///
/// Each entry occupies `2 * dim` words:
/// `{ count0 << 4 | dim, offset, count1, stride1, count2, stride2, ... }`.
/// The low 4 bits of the first word encode the dimensionality; the higher
/// bits carry the byte length of the innermost contiguous extent.  A zero
/// word where an entry would start is a wrap sentinel the reader skips.
///
/// Iterators produce entries with `begin_nd_entry`/`commit_nd_entry`; the
/// channel emit loop consumes them through an `AddressListCursor`.  Only the
/// cursor moves `read_pointer`, only the producer moves `write_pointer`, and
/// `total_bytes` is the authoritative count of bytes still enqueued.
pub(crate) struct AddressList {
    data: [usize; MAX_ENTRIES],
    total_bytes: usize,
    write_pointer: usize,
    read_pointer: usize,
}

impl AddressList {
    pub(crate) fn new() -> AddressList {
        AddressList {
            data: [0; MAX_ENTRIES],
            total_bytes: 0,
            write_pointer: 0,
            read_pointer: 0,
        }
    }

    /// Reserves space for an entry of up to `max_dim` dimensions, returning
    /// the writable slot or `None` if the ring is too full right now.
    pub(crate) fn begin_nd_entry(&mut self, max_dim: usize) -> Option<&mut [usize]> {
        let entries_needed = max_dim * 2;

        let new_wp = self.write_pointer + entries_needed;
        if new_wp > MAX_ENTRIES {
            // have to wrap around
            if self.read_pointer <= entries_needed {
                return None;
            }
            // fill remaining entries with 0's so the reader skips over them
            while self.write_pointer < MAX_ENTRIES {
                self.data[self.write_pointer] = 0;
                self.write_pointer += 1;
            }
            self.write_pointer = 0;
        } else {
            // if the write pointer would cross over the read pointer, we have
            // to wait
            if (self.write_pointer < self.read_pointer) && (new_wp >= self.read_pointer) {
                return None;
            }
            // special case: a write that ends exactly at the wrap point
            // collides with a reader sitting at 0
            if (new_wp == MAX_ENTRIES) && (self.read_pointer == 0) {
                return None;
            }
        }

        let wp = self.write_pointer;
        Some(&mut self.data[wp..wp + entries_needed])
    }

    pub(crate) fn commit_nd_entry(&mut self, act_dim: usize, bytes: usize) {
        let entries_used = act_dim * 2;

        self.write_pointer += entries_used;
        if self.write_pointer >= MAX_ENTRIES {
            assert_eq!(self.write_pointer, MAX_ENTRIES);
            self.write_pointer = 0;
        }

        self.total_bytes += bytes;
    }

    pub(crate) fn bytes_pending(&self) -> usize {
        self.total_bytes
    }

    // index of the current read entry, skipping a wrap sentinel
    fn read_entry(&mut self) -> usize {
        assert!(self.total_bytes > 0);
        if self.read_pointer >= MAX_ENTRIES {
            assert_eq!(self.read_pointer, MAX_ENTRIES);
            self.read_pointer = 0;
        }
        // skip trailing 0's
        if self.data[self.read_pointer] == 0 {
            self.read_pointer = 0;
        }
        self.read_pointer
    }
}

/// Walks one `AddressList` entry at a time with partial-consumption
/// bookkeeping across up to `MAX_DIM` axes.
///
/// The cursor does not hold a reference to its list; every accessor takes
/// the list as an argument so the two can live side by side in a port.
pub(crate) struct AddressListCursor {
    partial: bool,
    partial_dim: usize,
    pos: [usize; MAX_DIM],
}

impl AddressListCursor {
    pub(crate) fn new() -> AddressListCursor {
        AddressListCursor {
            partial: false,
            partial_dim: 0,
            pos: [0; MAX_DIM],
        }
    }

    /// Dimensionality of what remains of the current entry.  With partial
    /// progress we restrict ourselves to the rest of the partial dim.
    pub(crate) fn get_dim(&self, list: &mut AddressList) -> usize {
        if self.partial {
            self.partial_dim + 1
        } else {
            let e = list.read_entry();
            list.data[e] & 15
        }
    }

    pub(crate) fn get_offset(&self, list: &mut AddressList) -> usize {
        let e = list.read_entry();
        let act_dim = list.data[e] & 15;
        let mut ofs = list.data[e + 1];
        if self.partial {
            for i in self.partial_dim..act_dim {
                if i == 0 {
                    // dim 0 is counted in bytes
                    ofs += self.pos[0];
                } else {
                    // the rest use the strides from the address list
                    ofs += self.pos[i] * list.data[e + 1 + 2 * i];
                }
            }
        }
        ofs
    }

    pub(crate) fn get_stride(&self, list: &mut AddressList, dim: usize) -> usize {
        let e = list.read_entry();
        let act_dim = list.data[e] & 15;
        assert!((dim > 0) && (dim < act_dim));
        list.data[e + 2 * dim + 1]
    }

    pub(crate) fn remaining(&self, list: &mut AddressList, dim: usize) -> usize {
        let e = list.read_entry();
        let act_dim = list.data[e] & 15;
        assert!(dim < act_dim);
        let mut r = list.data[e + 2 * dim];
        if dim == 0 {
            r >>= 4;
        }
        if self.partial {
            if dim > self.partial_dim {
                r = 1;
            }
            if dim == self.partial_dim {
                assert!(r > self.pos[dim]);
                r -= self.pos[dim];
            }
        }
        r
    }

    /// Consumes `amount` units of dimension `dim`.  Consuming the remainder
    /// of the outermost dimension retires the entry and releases its slots.
    pub(crate) fn advance(&mut self, list: &mut AddressList, dim: usize, amount: usize) {
        let e = list.read_entry();
        let act_dim = list.data[e] & 15;
        assert!(dim < act_dim);
        let mut r = list.data[e + 2 * dim];
        if dim == 0 {
            r >>= 4;
        }

        let mut bytes = amount;
        if dim > 0 {
            debug_assert!(self.pos[..dim].iter().all(|p| *p == 0));
            bytes *= list.data[e] >> 4;
            for i in 1..dim {
                bytes *= list.data[e + 2 * i];
            }
        }
        debug_assert!(list.total_bytes >= bytes);
        list.total_bytes -= bytes;

        if !self.partial {
            if (dim == (act_dim - 1)) && (amount == r) {
                // simple case - we consumed the whole thing
                list.read_pointer += 2 * act_dim;
                return;
            }
            // record partial consumption
            self.partial = true;
            self.partial_dim = dim;
            self.pos[self.partial_dim] = amount;
        } else {
            // update a partial consumption in progress
            assert!(dim <= self.partial_dim);
            self.partial_dim = dim;
            self.pos[self.partial_dim] += amount;
        }

        while self.pos[self.partial_dim] == r {
            self.pos[self.partial_dim] = 0;
            self.partial_dim += 1;
            if self.partial_dim == act_dim {
                // all done
                self.partial = false;
                list.read_pointer += 2 * act_dim;
                break;
            } else {
                self.pos[self.partial_dim] += 1; // carry into next dimension
                r = list.data[e + 2 * self.partial_dim]; // no shift: partial_dim > 0
            }
        }
    }

    /// Consumes exactly `bytes` bytes worth of entries without reading them.
    pub(crate) fn skip_bytes(&mut self, list: &mut AddressList, mut bytes: usize) {
        while bytes > 0 {
            let act_dim = self.get_dim(list);
            assert!(act_dim > 0);

            let chunk = self.remaining(list, 0);
            if chunk <= bytes {
                let mut dim = 0;
                let mut count = chunk;
                let mut chunk = chunk;
                while (dim + 1) < act_dim {
                    dim += 1;
                    count = bytes / chunk;
                    assert!(count > 0);
                    let r = self.remaining(list, dim);
                    if count < r {
                        chunk *= count;
                        break;
                    } else {
                        count = r;
                        chunk *= count;
                    }
                }
                self.advance(list, dim, count);
                bytes -= chunk;
            } else {
                self.advance(list, 0, bytes);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::prelude::*;

    fn push_entry(list: &mut AddressList, offset: usize, extents: &[(usize, usize)]) -> bool {
        let dim = extents.len();
        let slot = match list.begin_nd_entry(dim) {
            Some(slot) => slot,
            None => return false,
        };
        slot[0] = (extents[0].0 << 4) | dim;
        slot[1] = offset;
        let mut bytes = extents[0].0;
        for (i, &(count, stride)) in extents.iter().enumerate().skip(1) {
            slot[2 * i] = count;
            slot[2 * i + 1] = stride;
            bytes *= count;
        }
        list.commit_nd_entry(dim, bytes);
        true
    }

    #[test]
    fn one_d_round_trip() {
        let mut list = AddressList::new();
        let mut cursor = AddressListCursor::new();
        assert!(push_entry(&mut list, 0x1000, &[(256, 0)]));
        assert_eq!(list.bytes_pending(), 256);
        assert_eq!(cursor.get_dim(&mut list), 1);
        assert_eq!(cursor.get_offset(&mut list), 0x1000);
        assert_eq!(cursor.remaining(&mut list, 0), 256);
        cursor.advance(&mut list, 0, 256);
        assert_eq!(list.bytes_pending(), 0);
    }

    #[test]
    fn partial_consumption_walks_lines() {
        let mut list = AddressList::new();
        let mut cursor = AddressListCursor::new();
        // 4 lines of 64 bytes, stride 256
        assert!(push_entry(&mut list, 0, &[(64, 0), (4, 256)]));
        assert_eq!(list.bytes_pending(), 256);

        // consume half a line, then the rest of it
        cursor.advance(&mut list, 0, 32);
        assert_eq!(cursor.get_dim(&mut list), 1);
        assert_eq!(cursor.get_offset(&mut list), 32);
        assert_eq!(cursor.remaining(&mut list, 0), 32);
        cursor.advance(&mut list, 0, 32);

        // now at the start of line 1
        assert_eq!(cursor.get_offset(&mut list), 256);
        assert_eq!(cursor.remaining(&mut list, 0), 64);

        // three full lines remain
        assert_eq!(cursor.get_dim(&mut list), 2);
        assert_eq!(cursor.remaining(&mut list, 1), 3);
        cursor.advance(&mut list, 1, 3);
        assert_eq!(list.bytes_pending(), 0);
    }

    #[test]
    fn skip_bytes_consumes_exactly() {
        let mut list = AddressList::new();
        let mut cursor = AddressListCursor::new();
        assert!(push_entry(&mut list, 0, &[(16, 0), (4, 64), (2, 512)]));
        assert!(push_entry(&mut list, 0x8000, &[(100, 0)]));
        let total = 16 * 4 * 2 + 100;
        assert_eq!(list.bytes_pending(), total);
        cursor.skip_bytes(&mut list, 40);
        assert_eq!(list.bytes_pending(), total - 40);
        cursor.skip_bytes(&mut list, total - 40);
        assert_eq!(list.bytes_pending(), 0);
    }

    #[test]
    fn wrap_preserves_fifo_order() {
        let mut rng = StdRng::seed_from_u64(17);
        let mut list = AddressList::new();
        let mut cursor = AddressListCursor::new();
        let mut produced = std::collections::VecDeque::new();
        let mut next_ofs = 0usize;
        let mut total_in = 0usize;
        let mut total_out = 0usize;

        for _ in 0..10_000 {
            // produce a random mix of 1-D/2-D/3-D entries until the ring
            // pushes back
            let dim = rng.gen_range(1..=3);
            let chunk = 8 * rng.gen_range(1..=8);
            let mut extents = vec![(chunk, 0)];
            let mut bytes = chunk;
            for _ in 1..dim {
                let count = rng.gen_range(2..=4);
                extents.push((count, 4096));
                bytes *= count;
            }
            if push_entry(&mut list, next_ofs, &extents) {
                produced.push_back((next_ofs, bytes));
                next_ofs += bytes;
                total_in += bytes;
            } else {
                // drain the oldest entry and check it comes back in order
                let (ofs, bytes) = produced.pop_front().unwrap();
                assert_eq!(cursor.get_offset(&mut list), ofs);
                cursor.skip_bytes(&mut list, bytes);
                total_out += bytes;
            }
        }
        while let Some((ofs, bytes)) = produced.pop_front() {
            assert_eq!(cursor.get_offset(&mut list), ofs);
            cursor.skip_bytes(&mut list, bytes);
            total_out += bytes;
        }
        assert_eq!(total_in, total_out);
        assert_eq!(list.bytes_pending(), 0);
    }
}
