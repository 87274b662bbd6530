use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

const NO_NONCONTIG: usize = usize::MAX;

/// Tracks which byte ranges of an ordered stream have been produced or
/// consumed, given out-of-order span insertions, while reporting a monotonic
/// contiguous prefix.
///
/// The common case -- the next span lands exactly at the current end of the
/// prefix -- is a single compare-exchange with no lock and no allocation.
/// Out-of-order spans park in an ordered map until the prefix catches up.
///
/// `contig_amount_x2` packs the prefix length shifted left by one with the
/// low bit set whenever the noncontiguous map is non-empty, so the fast path
/// CAS fails exactly when locked bookkeeping is required.
pub(crate) struct SequenceAssembler {
    contig_amount_x2: AtomicUsize,
    first_noncontig: AtomicUsize,
    spans: Mutex<BTreeMap<usize, usize>>,
}

impl Default for SequenceAssembler {
    fn default() -> SequenceAssembler {
        SequenceAssembler {
            contig_amount_x2: AtomicUsize::new(0),
            first_noncontig: AtomicUsize::new(NO_NONCONTIG),
            spans: Mutex::new(BTreeMap::new()),
        }
    }
}

impl std::fmt::Debug for SequenceAssembler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let x2 = self.contig_amount_x2.load(Ordering::Relaxed);
        write!(
            f,
            "SequenceAssembler {{ contig: {}, noncontig: {} }}",
            x2 >> 1,
            (x2 & 1) != 0
        )
    }
}

impl SequenceAssembler {
    pub(crate) fn new() -> SequenceAssembler {
        Default::default()
    }

    /// Exchanges the full state with `other`.  Only valid outside the
    /// concurrent lifetime of both assemblers (no other thread may touch
    /// either side).
    pub(crate) fn swap(&mut self, other: &mut SequenceAssembler) {
        std::mem::swap(
            self.contig_amount_x2.get_mut(),
            other.contig_amount_x2.get_mut(),
        );
        std::mem::swap(
            self.first_noncontig.get_mut(),
            other.first_noncontig.get_mut(),
        );
        std::mem::swap(&mut *self.spans.lock(), &mut *other.spans.lock());
    }

    /// Removes and returns every recorded span (the contiguous prefix first).
    /// Only valid outside the concurrent lifetime, like `swap`.
    pub(crate) fn drain_spans(&mut self) -> Vec<(usize, usize)> {
        let mut out = Vec::new();
        let contig = *self.contig_amount_x2.get_mut() >> 1;
        if contig > 0 {
            out.push((0, contig));
        }
        *self.contig_amount_x2.get_mut() = 0;
        *self.first_noncontig.get_mut() = NO_NONCONTIG;
        out.extend(std::mem::take(&mut *self.spans.lock()));
        out
    }

    /// Returns the number of contiguous bytes available starting at `start`,
    /// capped at `count`.
    pub(crate) fn span_exists(&self, start: usize, count: usize) -> usize {
        // lock-free case 1: start below the contiguous prefix
        let contig_sample_x2 = self.contig_amount_x2.load(Ordering::Acquire);
        if start < (contig_sample_x2 >> 1) {
            let max_avail = (contig_sample_x2 >> 1) - start;
            return count.min(max_avail);
        }

        // lock-free case 2a: no noncontiguous spans known
        if (contig_sample_x2 & 1) == 0 {
            return 0;
        }

        // lock-free case 2b: contig end <= start < first noncontiguous span
        let noncontig_sample = self.first_noncontig.load(Ordering::Acquire);
        if start < noncontig_sample {
            return 0;
        }

        // general case 3: walk the span map under the lock
        let spans = self.spans.lock();

        // recheck the prefix first, in case it and the noncontig marker were
        // both bumped between the two samples above
        let contig_sample = self.contig_amount_x2.load(Ordering::Acquire) >> 1;
        if start < contig_sample {
            let max_avail = contig_sample - start;
            return count.min(max_avail);
        }
        if start < self.first_noncontig.load(Ordering::Acquire) {
            return 0;
        }

        // find the last span starting at or before `start`
        let (&span_start, &span_size) = match spans.range(..=start).next_back() {
            Some(entry) => entry,
            None => return 0,
        };
        if span_start + span_size <= start {
            return 0;
        }
        let mut max_avail = span_start + span_size - start;
        let mut iter = spans.range((span_start + 1)..);
        while max_avail < count {
            match iter.next() {
                Some((&next_start, &next_size)) if next_start == start + max_avail => {
                    max_avail += next_size;
                }
                _ => return max_avail,
            }
        }
        count
    }

    /// Records `[pos, pos + count)` as complete and returns the amount by
    /// which the contiguous prefix grew (possibly zero).
    pub(crate) fn add_span(&self, pos: usize, count: usize) -> usize {
        // fastest case: bump the prefix with a single CAS, assuming no
        // noncontiguous spans are parked
        let prev_x2 = pos << 1;
        let next_x2 = (pos + count) << 1;
        let actual = match self.contig_amount_x2.compare_exchange(
            prev_x2,
            next_x2,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => return count,
            Err(actual) => actual,
        };

        // second best case: the CAS failed only because noncontiguous spans
        // exist -- take the lock and pick up any spans we connect with
        if (actual >> 1) == pos {
            let mut spans = self.spans.lock();
            let mut span_end = pos + count;
            let mut new_noncontig = NO_NONCONTIG;
            while let Some((&first, &size)) = spans.iter().next() {
                if first == span_end {
                    span_end += size;
                    spans.remove(&first);
                } else {
                    new_noncontig = first;
                    break;
                }
            }

            // update the prefix before first_noncontig so span_exists never
            // sees a false negative
            let next_x2 = (span_end << 1) | usize::from(!spans.is_empty());
            let ok = self
                .contig_amount_x2
                .compare_exchange(actual, next_x2, Ordering::AcqRel, Ordering::Acquire)
                .is_ok();
            assert!(ok);
            self.first_noncontig.store(new_noncontig, Ordering::Release);
            return span_end - pos;
        }

        // worst case: we're out of order -- park the span, and re-check the
        // prefix in case it caught up with us while we took the lock
        let mut spans = self.spans.lock();
        spans.insert(pos, count);

        if pos < self.first_noncontig.load(Ordering::Acquire) {
            self.first_noncontig.store(pos, Ordering::Release);
        }

        let prev = self.contig_amount_x2.fetch_or(1, Ordering::AcqRel);
        if (prev >> 1) == pos {
            // we were caught, so gather up spans and do another bump
            let mut span_end = pos;
            let mut new_noncontig = NO_NONCONTIG;
            while let Some((&first, &size)) = spans.iter().next() {
                if first == span_end {
                    span_end += size;
                    spans.remove(&first);
                } else {
                    new_noncontig = first;
                    break;
                }
            }
            assert!(span_end > pos);

            let next_x2 = (span_end << 1) | usize::from(!spans.is_empty());
            let ok = self
                .contig_amount_x2
                .compare_exchange(prev | 1, next_x2, Ordering::AcqRel, Ordering::Acquire)
                .is_ok();
            assert!(ok);
            self.first_noncontig.store(new_noncontig, Ordering::Release);
            span_end - pos
        } else {
            // not caught, so no forward progress to report
            0
        }
    }

    #[cfg(test)]
    pub(crate) fn contig_amount(&self) -> usize {
        self.contig_amount_x2.load(Ordering::Acquire) >> 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::prelude::*;
    use std::sync::Arc;

    fn random_partition(rng: &mut StdRng, total: usize, pieces: usize) -> Vec<(usize, usize)> {
        let mut cuts: Vec<usize> = (0..(pieces - 1)).map(|_| rng.gen_range(1..total)).collect();
        cuts.push(0);
        cuts.push(total);
        cuts.sort_unstable();
        cuts.dedup();
        cuts.windows(2).map(|w| (w[0], w[1] - w[0])).collect()
    }

    #[test]
    fn in_order_spans() {
        let seq = SequenceAssembler::new();
        assert_eq!(seq.add_span(0, 10), 10);
        assert_eq!(seq.add_span(10, 5), 5);
        assert_eq!(seq.span_exists(0, 15), 15);
        assert_eq!(seq.span_exists(5, 100), 10);
        assert_eq!(seq.span_exists(15, 1), 0);
    }

    #[test]
    fn out_of_order_spans() {
        let seq = SequenceAssembler::new();
        assert_eq!(seq.add_span(10, 5), 0);
        assert_eq!(seq.span_exists(0, 1), 0);
        assert_eq!(seq.span_exists(10, 10), 5);
        assert_eq!(seq.add_span(0, 10), 15);
        assert_eq!(seq.span_exists(0, 15), 15);
    }

    #[test]
    fn prefix_is_order_independent() {
        let mut rng = StdRng::seed_from_u64(0x5e9a55e3);
        for _ in 0..100 {
            let mut pieces = random_partition(&mut rng, 1 << 16, 17);
            pieces.shuffle(&mut rng);
            let seq = SequenceAssembler::new();
            let mut last = 0;
            for (start, size) in pieces {
                seq.add_span(start, size);
                let contig = seq.contig_amount();
                assert!(contig >= last);
                last = contig;
            }
            assert_eq!(seq.span_exists(0, 1 << 16), 1 << 16);
        }
    }

    #[test]
    fn span_exists_is_local() {
        let seq = SequenceAssembler::new();
        seq.add_span(0, 100);
        seq.add_span(200, 50);
        for (start, count, expect) in [
            (0, 100, 100),
            (50, 50, 50),
            (50, 100, 50),
            (100, 1, 0),
            (200, 50, 50),
            (200, 100, 50),
            (210, 10, 10),
            (250, 1, 0),
        ] {
            assert_eq!(seq.span_exists(start, count), expect, "[{start}+{count})");
        }
    }

    #[test]
    fn concurrent_disjoint_spans() {
        const THREADS: usize = 8;
        const PER_THREAD: usize = 1000;
        const SPAN: usize = 64;
        let seq = Arc::new(SequenceAssembler::new());
        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let seq = seq.clone();
                std::thread::spawn(move || {
                    let mut rng = StdRng::seed_from_u64(t as u64);
                    let mut offsets: Vec<usize> = (0..PER_THREAD)
                        .map(|i| (i * THREADS + t) * SPAN)
                        .collect();
                    offsets.shuffle(&mut rng);
                    for off in offsets {
                        seq.add_span(off, SPAN);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let total = THREADS * PER_THREAD * SPAN;
        assert_eq!(seq.contig_amount(), total);
        assert_eq!(seq.span_exists(0, total + 1), total);
    }
}
