use tracing::info;

use crate::bgwork::TimeLimit;
use crate::channel::{
    supports_path_common, ChannelOps, ChannelXdQueue, PathEndpoint, PathMatch, SupportedPath,
    XferDesKind, XferDesOps, CPU_MEM_KINDS,
};
use crate::env_var::config;
use crate::memory::{Memory, MemoryOps};
use crate::serdez::{SerdezId, NO_SERDEZ};
use crate::transfer::{StepFlags, TransferIterator};
use crate::xfer_des::{IoRequest, ReqDim, SequenceCache, XdState, XferDes};
use crate::NodeId;

// fast memcpy stuff - typed element copies communicate alignment guarantees
// to the compiler

#[repr(C, align(16))]
#[derive(Clone, Copy)]
struct Aligned16b([u64; 2]);

#[repr(C, align(32))]
#[derive(Clone, Copy)]
struct Aligned32b([u64; 4]);

unsafe fn memcpy_1d_typed<T: Copy>(dst_base: usize, src_base: usize, bytes: usize) {
    std::ptr::copy_nonoverlapping(
        src_base as *const T,
        dst_base as *mut T,
        bytes / std::mem::size_of::<T>(),
    );
}

unsafe fn memcpy_2d_typed<T: Copy>(
    mut dst_base: usize,
    dst_lstride: usize,
    mut src_base: usize,
    src_lstride: usize,
    bytes: usize,
    lines: usize,
) {
    for _ in 0..lines {
        memcpy_1d_typed::<T>(dst_base, src_base, bytes);
        src_base += src_lstride;
        dst_base += dst_lstride;
    }
}

unsafe fn memcpy_3d_typed<T: Copy>(
    mut dst_base: usize,
    dst_lstride: usize,
    dst_pstride: usize,
    mut src_base: usize,
    src_lstride: usize,
    src_pstride: usize,
    bytes: usize,
    lines: usize,
    planes: usize,
) {
    // fold the line strides into the plane strides so the inner loop doesn't
    // have to subtract them back out
    let dst_pstride_adj = dst_pstride - (lines * dst_lstride);
    let src_pstride_adj = src_pstride - (lines * src_lstride);

    for _ in 0..planes {
        for _ in 0..lines {
            memcpy_1d_typed::<T>(dst_base, src_base, bytes);
            src_base += src_lstride;
            dst_base += dst_lstride;
        }
        src_base += src_pstride_adj;
        dst_base += dst_pstride_adj;
    }
}

// subtracting 1 from bases, strides, and lengths sets LSBs according to the
// common alignment of every parameter in the copy
pub(crate) fn memcpy_1d(dst_base: usize, src_base: usize, bytes: usize) {
    let alignment = (dst_base.wrapping_sub(1)) & (src_base.wrapping_sub(1)) & (bytes.wrapping_sub(1));
    unsafe {
        if (alignment & 31) == 31 {
            memcpy_1d_typed::<Aligned32b>(dst_base, src_base, bytes)
        } else if (alignment & 15) == 15 {
            memcpy_1d_typed::<Aligned16b>(dst_base, src_base, bytes)
        } else if (alignment & 7) == 7 {
            memcpy_1d_typed::<u64>(dst_base, src_base, bytes)
        } else if (alignment & 3) == 3 {
            memcpy_1d_typed::<u32>(dst_base, src_base, bytes)
        } else if (alignment & 1) == 1 {
            memcpy_1d_typed::<u16>(dst_base, src_base, bytes)
        } else {
            memcpy_1d_typed::<u8>(dst_base, src_base, bytes)
        }
    }
}

pub(crate) fn memcpy_2d(
    dst_base: usize,
    dst_lstride: usize,
    src_base: usize,
    src_lstride: usize,
    bytes: usize,
    lines: usize,
) {
    let alignment = (dst_base.wrapping_sub(1))
        & (dst_lstride.wrapping_sub(1))
        & (src_base.wrapping_sub(1))
        & (src_lstride.wrapping_sub(1))
        & (bytes.wrapping_sub(1));
    unsafe {
        if (alignment & 31) == 31 {
            memcpy_2d_typed::<Aligned32b>(dst_base, dst_lstride, src_base, src_lstride, bytes, lines)
        } else if (alignment & 15) == 15 {
            memcpy_2d_typed::<Aligned16b>(dst_base, dst_lstride, src_base, src_lstride, bytes, lines)
        } else if (alignment & 7) == 7 {
            memcpy_2d_typed::<u64>(dst_base, dst_lstride, src_base, src_lstride, bytes, lines)
        } else if (alignment & 3) == 3 {
            memcpy_2d_typed::<u32>(dst_base, dst_lstride, src_base, src_lstride, bytes, lines)
        } else if (alignment & 1) == 1 {
            memcpy_2d_typed::<u16>(dst_base, dst_lstride, src_base, src_lstride, bytes, lines)
        } else {
            memcpy_2d_typed::<u8>(dst_base, dst_lstride, src_base, src_lstride, bytes, lines)
        }
    }
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn memcpy_3d(
    dst_base: usize,
    mut dst_lstride: usize,
    mut dst_pstride: usize,
    src_base: usize,
    mut src_lstride: usize,
    mut src_pstride: usize,
    bytes: usize,
    mut lines: usize,
    mut planes: usize,
) {
    let alignment = (dst_base.wrapping_sub(1))
        & (dst_lstride.wrapping_sub(1))
        & (dst_pstride.wrapping_sub(1))
        & (src_base.wrapping_sub(1))
        & (src_lstride.wrapping_sub(1))
        & (src_pstride.wrapping_sub(1))
        & (bytes.wrapping_sub(1));
    // walk destination addresses as linearly as possible, even if that
    // scrambles the source pattern (writebacks cost more than fills)
    if dst_pstride < dst_lstride {
        std::mem::swap(&mut dst_pstride, &mut dst_lstride);
        std::mem::swap(&mut src_pstride, &mut src_lstride);
        std::mem::swap(&mut planes, &mut lines);
    }
    unsafe {
        if (alignment & 31) == 31 {
            memcpy_3d_typed::<Aligned32b>(
                dst_base, dst_lstride, dst_pstride, src_base, src_lstride, src_pstride, bytes,
                lines, planes,
            )
        } else if (alignment & 15) == 15 {
            memcpy_3d_typed::<Aligned16b>(
                dst_base, dst_lstride, dst_pstride, src_base, src_lstride, src_pstride, bytes,
                lines, planes,
            )
        } else if (alignment & 7) == 7 {
            memcpy_3d_typed::<u64>(
                dst_base, dst_lstride, dst_pstride, src_base, src_lstride, src_pstride, bytes,
                lines, planes,
            )
        } else if (alignment & 3) == 3 {
            memcpy_3d_typed::<u32>(
                dst_base, dst_lstride, dst_pstride, src_base, src_lstride, src_pstride, bytes,
                lines, planes,
            )
        } else if (alignment & 1) == 1 {
            memcpy_3d_typed::<u16>(
                dst_base, dst_lstride, dst_pstride, src_base, src_lstride, src_pstride, bytes,
                lines, planes,
            )
        } else {
            memcpy_3d_typed::<u8>(
                dst_base, dst_lstride, dst_pstride, src_base, src_lstride, src_pstride, bytes,
                lines, planes,
            )
        }
    }
}

/// Local memory-to-memory transfers, including the serdez paths.
pub(crate) struct MemcpyXferDes {
    pub(crate) xd: XferDes,
    has_serdez: bool,
}

impl MemcpyXferDes {
    pub(crate) fn new(xd: XferDes) -> MemcpyXferDes {
        let has_serdez = xd.input_ports.iter().any(|p| p.serdez_op.is_some())
            || xd.output_ports.iter().any(|p| p.serdez_op.is_some());
        MemcpyXferDes { xd, has_serdez }
    }

    // request-at-a-time fallback used whenever serdez is in play
    fn progress_serdez(&self, work_until: TimeLimit) -> bool {
        let mut did_work = false;
        let state = &mut *self.xd.state.lock();
        loop {
            let req = self.xd.get_one_request(state, StepFlags::ANY_DIM);
            let mut req = match req {
                Some(req) => req,
                None => break,
            };
            submit_serdez_request(&self.xd, state, &mut req);
            did_work = true;
            if work_until.is_expired() {
                break;
            }
        }
        did_work
    }

    fn progress_fast(&self, work_until: TimeLimit) -> bool {
        let mut did_work = false;
        let mut rcache = SequenceCache::reads(config().seq_cache_flush);
        let mut wcache = SequenceCache::writes(config().seq_cache_flush);
        let state = &mut *self.xd.state.lock();

        loop {
            let min_xfer_size = config().min_xfer_size;
            let max_bytes = self.xd.get_addresses(state, min_xfer_size, &mut rcache);
            if max_bytes == 0 {
                break;
            }

            let in_idx = state.input_control.current_io_port;
            let out_idx = state.output_control.current_io_port;
            let in_span_start = in_idx.map_or(0, |i| state.inputs[i].local_bytes_total);
            let out_span_start = out_idx.map_or(0, |o| state.outputs[o].local_bytes_total);

            let mut total_bytes = 0usize;
            match (in_idx, out_idx) {
                (Some(i), Some(o)) => {
                    // input and output both exist - move what we can
                    info!(target: "ferry::xd",
                          min = min_xfer_size, max = max_bytes, "memcpy chunk");
                    let in_base = self.xd.input_ports[i]
                        .mem
                        .get_direct_ptr(0, 0)
                        .expect("memcpy source must be CPU-visible")
                        as usize;
                    let out_base = self.xd.output_ports[o]
                        .mem
                        .get_direct_ptr(0, 0)
                        .expect("memcpy destination must be CPU-visible")
                        as usize;

                    while total_bytes < max_bytes {
                        let in_state = &mut state.inputs[i];
                        let out_state = &mut state.outputs[o];

                        let in_offset = in_state.addrcursor.get_offset(&mut in_state.addrlist);
                        let out_offset = out_state.addrcursor.get_offset(&mut out_state.addrlist);

                        // partially consumed entries report a reduced dim, so
                        // whatever we see here is regular
                        let mut in_dim = in_state.addrcursor.get_dim(&mut in_state.addrlist);
                        let mut out_dim = out_state.addrcursor.get_dim(&mut out_state.addrlist);
                        assert!(in_dim > 0 && out_dim > 0);

                        let bytes;
                        // memcpys hit peak efficiency early; trim each call to
                        // tens of microseconds so the time limit stays honest
                        let bytes_left = (max_bytes - total_bytes).min(256 << 10);

                        let mut icount =
                            in_state.addrcursor.remaining(&mut in_state.addrlist, 0);
                        let mut ocount =
                            out_state.addrcursor.remaining(&mut out_state.addrlist, 0);

                        // contig bytes is always the min of the first dims
                        let contig_bytes = icount.min(ocount).min(bytes_left);

                        // catch the simple 1D case first
                        if (contig_bytes == bytes_left)
                            || ((contig_bytes == icount) && (in_dim == 1))
                            || ((contig_bytes == ocount) && (out_dim == 1))
                        {
                            bytes = contig_bytes;
                            memcpy_1d(out_base + out_offset, in_base + in_offset, bytes);
                            in_state
                                .addrcursor
                                .advance(&mut in_state.addrlist, 0, bytes);
                            out_state
                                .addrcursor
                                .advance(&mut out_state.addrlist, 0, bytes);
                        } else {
                            // grow to a 2D copy
                            let id;
                            let iscale;
                            let in_lstride;
                            if contig_bytes < icount {
                                // second input dim comes from splitting the first
                                id = 0;
                                in_lstride = contig_bytes;
                                let ilines = icount / contig_bytes;
                                if ilines * contig_bytes != icount {
                                    in_dim = 1; // leftover stops us here
                                }
                                icount = ilines;
                                iscale = contig_bytes;
                            } else {
                                assert!(in_dim > 1);
                                id = 1;
                                icount = in_state.addrcursor.remaining(&mut in_state.addrlist, 1);
                                in_lstride =
                                    in_state.addrcursor.get_stride(&mut in_state.addrlist, 1);
                                iscale = 1;
                            }

                            let od;
                            let oscale;
                            let out_lstride;
                            if contig_bytes < ocount {
                                od = 0;
                                out_lstride = contig_bytes;
                                let olines = ocount / contig_bytes;
                                if olines * contig_bytes != ocount {
                                    out_dim = 1;
                                }
                                ocount = olines;
                                oscale = contig_bytes;
                            } else {
                                assert!(out_dim > 1);
                                od = 1;
                                ocount =
                                    out_state.addrcursor.remaining(&mut out_state.addrlist, 1);
                                out_lstride =
                                    out_state.addrcursor.get_stride(&mut out_state.addrlist, 1);
                                oscale = 1;
                            }

                            let lines = icount.min(ocount).min(bytes_left / contig_bytes);

                            // see if we have to stop at 2D
                            if ((contig_bytes * lines) == bytes_left)
                                || ((lines == icount) && (id == in_dim - 1))
                                || ((lines == ocount) && (od == out_dim - 1))
                            {
                                bytes = contig_bytes * lines;
                                memcpy_2d(
                                    out_base + out_offset,
                                    out_lstride,
                                    in_base + in_offset,
                                    in_lstride,
                                    contig_bytes,
                                    lines,
                                );
                                in_state.addrcursor.advance(
                                    &mut in_state.addrlist,
                                    id,
                                    lines * iscale,
                                );
                                out_state.addrcursor.advance(
                                    &mut out_state.addrlist,
                                    od,
                                    lines * oscale,
                                );
                            } else {
                                let mut id = id;
                                let mut od = od;
                                let mut iscale = iscale;
                                let mut oscale = oscale;

                                let in_pstride;
                                if lines < icount {
                                    // third input dim splits the current one
                                    in_pstride = in_lstride * lines;
                                    let iplanes = icount / lines;
                                    // leftovers would matter beyond 3D
                                    icount = iplanes;
                                    iscale *= lines;
                                } else {
                                    id += 1;
                                    assert!(in_dim > id);
                                    icount =
                                        in_state.addrcursor.remaining(&mut in_state.addrlist, id);
                                    in_pstride =
                                        in_state.addrcursor.get_stride(&mut in_state.addrlist, id);
                                    iscale = 1;
                                }

                                let out_pstride;
                                if lines < ocount {
                                    out_pstride = out_lstride * lines;
                                    let oplanes = ocount / lines;
                                    ocount = oplanes;
                                    oscale *= lines;
                                } else {
                                    od += 1;
                                    assert!(out_dim > od);
                                    ocount = out_state
                                        .addrcursor
                                        .remaining(&mut out_state.addrlist, od);
                                    out_pstride = out_state
                                        .addrcursor
                                        .get_stride(&mut out_state.addrlist, od);
                                    oscale = 1;
                                }

                                let planes = icount
                                    .min(ocount)
                                    .min(bytes_left / (contig_bytes * lines));

                                bytes = contig_bytes * lines * planes;
                                memcpy_3d(
                                    out_base + out_offset,
                                    out_lstride,
                                    out_pstride,
                                    in_base + in_offset,
                                    in_lstride,
                                    in_pstride,
                                    contig_bytes,
                                    lines,
                                    planes,
                                );
                                in_state.addrcursor.advance(
                                    &mut in_state.addrlist,
                                    id,
                                    planes * iscale,
                                );
                                out_state.addrcursor.advance(
                                    &mut out_state.addrlist,
                                    od,
                                    planes * oscale,
                                );
                            }
                        }

                        debug_assert!(bytes <= bytes_left);
                        total_bytes += bytes;

                        // stop when the slice expires, but never below the
                        // minimum chunk
                        if (total_bytes >= min_xfer_size) && work_until.is_expired() {
                            break;
                        }
                    }
                }
                (Some(i), None) => {
                    // input but no output: discard input bytes
                    total_bytes = max_bytes;
                    let in_state = &mut state.inputs[i];
                    in_state
                        .addrcursor
                        .skip_bytes(&mut in_state.addrlist, total_bytes);
                }
                (None, Some(o)) => {
                    // output but no input: skip output bytes
                    total_bytes = max_bytes;
                    let out_state = &mut state.outputs[o];
                    out_state
                        .addrcursor
                        .skip_bytes(&mut out_state.addrlist, total_bytes);
                }
                (None, None) => {
                    // simultaneous gather+scatter can skip both sides
                    total_bytes = max_bytes;
                }
            }

            // memcpy completes immediately, so the skip and copy cases share
            // the same accounting
            rcache.add_span(&self.xd, in_idx, in_span_start, total_bytes);
            wcache.add_span(&self.xd, out_idx, out_span_start, total_bytes);

            let done = self.xd.record_address_consumption(state, total_bytes);

            did_work = true;

            if done || work_until.is_expired() {
                break;
            }
        }

        rcache.flush(&self.xd);
        wcache.flush(&self.xd);

        did_work
    }
}

impl XferDesOps for MemcpyXferDes {
    fn base(&self) -> &XferDes {
        &self.xd
    }

    fn progress(&self, work_until: TimeLimit) -> bool {
        if self.has_serdez {
            self.progress_serdez(work_until)
        } else {
            self.progress_fast(work_until)
        }
    }
}

/// Executes one serdez-bearing request in-line, stepping the elastic side's
/// iterator as encoded sizes become known.
fn submit_serdez_request(xd: &XferDes, state: &mut XdState, req: &mut IoRequest) {
    let in_port = &xd.input_ports[req.src_port_idx];
    let out_port = &xd.output_ports[req.dst_port_idx];
    let src_serdez = in_port.serdez_op.clone();
    let dst_serdez = out_port.serdez_op.clone();

    match req.dim {
        ReqDim::D1 => assert!(req.nplanes == 1 && req.nlines == 1),
        ReqDim::D2 => assert!(req.nplanes == 1),
        ReqDim::D3 => {}
    }

    let mut rewind_src = 0usize;
    let mut rewind_dst = 0usize;

    if src_serdez.is_some() && dst_serdez.is_none() {
        // we manage the write side's totals
        req.write_seq_pos = state.outputs[req.dst_port_idx].local_bytes_total;
    }
    if src_serdez.is_none() && dst_serdez.is_some() {
        req.read_seq_pos = state.inputs[req.src_port_idx].local_bytes_total;
    }

    // source pointer is only meaningful when the source geometry is fixed
    let src_base: *const u8 = if src_serdez.is_none() && dst_serdez.is_some() {
        std::ptr::null()
    } else {
        in_port
            .mem
            .get_direct_ptr(req.src_off, req.nbytes)
            .expect("serdez source must be CPU-visible")
    };
    let dst_base: *mut u8 = if src_serdez.is_some() && dst_serdez.is_none() {
        std::ptr::null_mut()
    } else {
        out_port
            .mem
            .get_direct_ptr(req.dst_off, req.nbytes)
            .expect("serdez destination must be CPU-visible")
    };

    let mut wrap_buffer: Option<Vec<u8>> = None;

    let mut src_p = src_base;
    let mut dst_p = dst_base;
    'planes: for _ in 0..req.nplanes {
        let mut src = src_p;
        let mut dst = dst_p;
        for _ in 0..req.nlines {
            if let Some(serdez) = &src_serdez {
                assert!(dst_serdez.is_none());
                // serialization
                let field_size = serdez.sizeof_field_type();
                let num_elems = req.nbytes / field_size;
                assert_eq!(num_elems * field_size, req.nbytes);
                let maxser = serdez.max_serialized_size();
                let max_bytes = num_elems * maxser;

                let out_state = &mut state.outputs[req.dst_port_idx];
                // ask the wrapping FIFO for worst-case space
                let (bytes_avail, dst_info) = out_state
                    .iter
                    .step(max_bytes, StepFlags::CONTIG_ONLY, true)
                    .expect("flow control already reserved this space");
                let mut bytes_used;
                if bytes_avail == max_bytes {
                    // enough room to go in one shot
                    let dptr = out_port
                        .mem
                        .get_direct_ptr(dst_info.base_offset, bytes_avail)
                        .unwrap();
                    bytes_used =
                        unsafe { serdez.serialize(src, field_size, num_elems, dptr) };
                    if bytes_used == max_bytes {
                        out_state.iter.confirm_step();
                    } else {
                        out_state.iter.cancel_step();
                        let (amt, _) = out_state
                            .iter
                            .step(bytes_used, StepFlags::CONTIG_ONLY, false)
                            .unwrap();
                        assert_eq!(amt, bytes_used);
                    }
                } else {
                    // short of the worst case, but it may still be enough
                    let mut dptr = out_port
                        .mem
                        .get_direct_ptr(dst_info.base_offset, bytes_avail)
                        .unwrap();
                    let mut elems_done = 0usize;
                    let mut bytes_left = bytes_avail;
                    bytes_used = 0;
                    while (elems_done < num_elems) && (bytes_left >= maxser) {
                        let todo = (num_elems - elems_done).min(bytes_left / maxser);
                        let amt = unsafe {
                            serdez.serialize(
                                src.add(elems_done * field_size),
                                field_size,
                                todo,
                                dptr,
                            )
                        };
                        assert!(amt <= bytes_left);
                        elems_done += todo;
                        bytes_left -= amt;
                        dptr = unsafe { dptr.add(amt) };
                        bytes_used += amt;
                    }
                    if elems_done == num_elems {
                        // got everything without wrapping
                        if bytes_used == bytes_avail {
                            out_state.iter.confirm_step();
                        } else {
                            out_state.iter.cancel_step();
                            let (amt, _) = out_state
                                .iter
                                .step(bytes_used, StepFlags::CONTIG_ONLY, false)
                                .unwrap();
                            assert_eq!(amt, bytes_used);
                        }
                    } else {
                        // lucky finish exactly on the wrap boundary?
                        if bytes_left == 0 {
                            out_state.iter.confirm_step();
                        } else {
                            let wrap =
                                wrap_buffer.get_or_insert_with(|| vec![0u8; maxser]);
                            while (elems_done < num_elems) && (bytes_left > 0) {
                                // serialize one element into the bounce buffer
                                let amt = unsafe {
                                    serdez.serialize_one(
                                        src.add(elems_done * field_size),
                                        wrap.as_mut_ptr(),
                                    )
                                };
                                if amt < bytes_left {
                                    unsafe {
                                        std::ptr::copy_nonoverlapping(
                                            wrap.as_ptr(),
                                            dptr,
                                            amt,
                                        );
                                        dptr = dptr.add(amt);
                                    }
                                    bytes_left -= amt;
                                } else {
                                    unsafe {
                                        std::ptr::copy_nonoverlapping(
                                            wrap.as_ptr(),
                                            dptr,
                                            bytes_left,
                                        );
                                    }
                                    out_state.iter.confirm_step();
                                    if amt > bytes_left {
                                        let (amt2, dst_info2) = out_state
                                            .iter
                                            .step(
                                                amt - bytes_left,
                                                StepFlags::CONTIG_ONLY,
                                                false,
                                            )
                                            .unwrap();
                                        assert_eq!(amt2, amt - bytes_left);
                                        let d2 = out_port
                                            .mem
                                            .get_direct_ptr(dst_info2.base_offset, amt2)
                                            .unwrap();
                                        unsafe {
                                            std::ptr::copy_nonoverlapping(
                                                wrap.as_ptr().add(bytes_left),
                                                d2,
                                                amt2,
                                            );
                                        }
                                    }
                                    bytes_left = 0;
                                }
                                elems_done += 1;
                                bytes_used += amt;
                            }
                            // leftover space goes back to the iterator
                            if bytes_left > 0 {
                                assert_eq!(elems_done, num_elems);
                                out_state.iter.cancel_step();
                                let (amt, _) = out_state
                                    .iter
                                    .step(bytes_used, StepFlags::CONTIG_ONLY, false)
                                    .unwrap();
                                assert_eq!(amt, bytes_used);
                            }
                        }

                        // past the wraparound, the remaining elements are easy
                        if elems_done < num_elems {
                            let max_remain = (num_elems - elems_done) * maxser;
                            let (amt, dst_info3) = out_state
                                .iter
                                .step(max_remain, StepFlags::CONTIG_ONLY, true)
                                .unwrap();
                            assert_eq!(amt, max_remain); // no double wrap
                            let d3 = out_port
                                .mem
                                .get_direct_ptr(dst_info3.base_offset, amt)
                                .unwrap();
                            let amt2 = unsafe {
                                serdez.serialize(
                                    src.add(elems_done * field_size),
                                    field_size,
                                    num_elems - elems_done,
                                    d3,
                                )
                            };
                            bytes_used += amt2;
                            if amt2 == max_remain {
                                out_state.iter.confirm_step();
                            } else {
                                out_state.iter.cancel_step();
                                let (amt3, _) = out_state
                                    .iter
                                    .step(amt2, StepFlags::CONTIG_ONLY, false)
                                    .unwrap();
                                assert_eq!(amt3, amt2);
                            }
                        }
                    }
                }
                assert!(bytes_used <= max_bytes);
                if bytes_used < max_bytes {
                    rewind_dst += max_bytes - bytes_used;
                }
                out_port.bump_local_total(out_state, bytes_used);
            } else if let Some(serdez) = &dst_serdez {
                // deserialization
                let field_size = serdez.sizeof_field_type();
                let num_elems = req.nbytes / field_size;
                assert_eq!(num_elems * field_size, req.nbytes);
                let maxser = serdez.max_serialized_size();
                let max_bytes = num_elems * maxser;

                let in_state = &mut state.inputs[req.src_port_idx];
                let (bytes_avail, src_info) = in_state
                    .iter
                    .step(max_bytes, StepFlags::CONTIG_ONLY, true)
                    .expect("flow control already promised this data");
                let mut bytes_used;
                if bytes_avail == max_bytes {
                    let sptr = in_port
                        .mem
                        .get_direct_ptr(src_info.base_offset, bytes_avail)
                        .unwrap();
                    bytes_used =
                        unsafe { serdez.deserialize(dst, field_size, num_elems, sptr) };
                    if bytes_used == max_bytes {
                        in_state.iter.confirm_step();
                    } else {
                        in_state.iter.cancel_step();
                        let (amt, _) = in_state
                            .iter
                            .step(bytes_used, StepFlags::CONTIG_ONLY, false)
                            .unwrap();
                        assert_eq!(amt, bytes_used);
                    }
                } else {
                    let mut sptr = in_port
                        .mem
                        .get_direct_ptr(src_info.base_offset, bytes_avail)
                        .unwrap() as *const u8;
                    let mut elems_done = 0usize;
                    let mut bytes_left = bytes_avail;
                    bytes_used = 0;
                    while (elems_done < num_elems) && (bytes_left >= maxser) {
                        let todo = (num_elems - elems_done).min(bytes_left / maxser);
                        let amt = unsafe {
                            serdez.deserialize(
                                dst.add(elems_done * field_size),
                                field_size,
                                todo,
                                sptr,
                            )
                        };
                        assert!(amt <= bytes_left);
                        elems_done += todo;
                        bytes_left -= amt;
                        sptr = unsafe { sptr.add(amt) };
                        bytes_used += amt;
                    }
                    if elems_done == num_elems {
                        if bytes_used == bytes_avail {
                            in_state.iter.confirm_step();
                        } else {
                            in_state.iter.cancel_step();
                            let (amt, _) = in_state
                                .iter
                                .step(bytes_used, StepFlags::CONTIG_ONLY, false)
                                .unwrap();
                            assert_eq!(amt, bytes_used);
                        }
                    } else if bytes_left == 0 {
                        in_state.iter.confirm_step();
                    } else {
                        // the last element straddles the IB wrap; bounce it
                        // through a temp buffer, with an iterator snapshot in
                        // case it turns out not to be fully available
                        let wrap = wrap_buffer.get_or_insert_with(|| vec![0u8; maxser]);
                        let snapshot = in_state.iter.clone();
                        unsafe {
                            std::ptr::copy_nonoverlapping(sptr, wrap.as_mut_ptr(), bytes_left)
                        };
                        in_state.iter.confirm_step();
                        let (amt_wrap, src_info2) = in_state
                            .iter
                            .step(max_bytes - bytes_avail, StepFlags::CONTIG_ONLY, true)
                            .unwrap();
                        // flow control keeps us from truly wrapping past
                        // unread data, so a short step here is fine
                        let mut s2 = in_port
                            .mem
                            .get_direct_ptr(src_info2.base_offset, amt_wrap)
                            .unwrap() as *const u8;
                        unsafe {
                            std::ptr::copy_nonoverlapping(
                                s2,
                                wrap.as_mut_ptr().add(bytes_left),
                                maxser - bytes_left,
                            );
                            s2 = s2.add(maxser - bytes_left);
                        }

                        while (elems_done < num_elems) && (bytes_left > 0) {
                            let amt = unsafe {
                                serdez.deserialize_one(
                                    dst.add(elems_done * field_size),
                                    wrap.as_ptr(),
                                )
                            };
                            if amt < bytes_left {
                                // slide the window and pull a few more bytes
                                unsafe {
                                    std::ptr::copy(
                                        wrap.as_ptr().add(amt),
                                        wrap.as_mut_ptr(),
                                        maxser - amt,
                                    );
                                    std::ptr::copy_nonoverlapping(
                                        s2,
                                        wrap.as_mut_ptr().add(maxser - amt),
                                        amt,
                                    );
                                    s2 = s2.add(amt);
                                }
                                bytes_left -= amt;
                            } else {
                                // record how much wrapped data was truly used
                                in_state.iter.cancel_step();
                                if amt > bytes_left {
                                    let (amt2, _) = in_state
                                        .iter
                                        .step(amt - bytes_left, StepFlags::CONTIG_ONLY, false)
                                        .unwrap();
                                    assert_eq!(amt2, amt - bytes_left);
                                }
                                bytes_left = 0;
                            }
                            elems_done += 1;
                            bytes_used += amt;
                        }
                        // finished with pre-wrap bytes left: restore the
                        // iterator (we can't double-cancel) and consume the
                        // exact amount
                        if bytes_left > 0 {
                            assert_eq!(elems_done, num_elems);
                            in_state.iter = snapshot;
                            in_state.iter.cancel_step();
                            let (amt2, _) = in_state
                                .iter
                                .step(bytes_used, StepFlags::CONTIG_ONLY, false)
                                .unwrap();
                            assert_eq!(amt2, bytes_used);
                        }
                    }

                    if elems_done < num_elems {
                        let max_remain = (num_elems - elems_done) * maxser;
                        let (amt, src_info3) = in_state
                            .iter
                            .step(max_remain, StepFlags::CONTIG_ONLY, true)
                            .unwrap();
                        assert_eq!(amt, max_remain); // no double wrap
                        let s3 = in_port
                            .mem
                            .get_direct_ptr(src_info3.base_offset, amt)
                            .unwrap();
                        let amt2 = unsafe {
                            serdez.deserialize(
                                dst.add(elems_done * field_size),
                                field_size,
                                num_elems - elems_done,
                                s3,
                            )
                        };
                        bytes_used += amt2;
                        if amt2 == max_remain {
                            in_state.iter.confirm_step();
                        } else {
                            in_state.iter.cancel_step();
                            let (amt3, _) = in_state
                                .iter
                                .step(amt2, StepFlags::CONTIG_ONLY, false)
                                .unwrap();
                            assert_eq!(amt3, amt2);
                        }
                    }
                }
                assert!(bytes_used <= max_bytes);
                if bytes_used < max_bytes {
                    rewind_src += max_bytes - bytes_used;
                }
                in_port.bump_local_total(in_state, bytes_used);
            } else {
                // plain copy
                unsafe { std::ptr::copy_nonoverlapping(src, dst, req.nbytes) };
            }
            if req.dim == ReqDim::D1 {
                break 'planes;
            }
            // serdez sides move on their own; this looks backwards but a
            // source serdez means the destination moves unpredictably
            if dst_serdez.is_none() {
                src = unsafe { src.add(req.src_str) };
            }
            if src_serdez.is_none() {
                dst = unsafe { dst.add(req.dst_str) };
            }
        }
        if req.dim == ReqDim::D2 {
            break 'planes;
        }
        src_p = if dst_serdez.is_some() {
            src_p
        } else {
            unsafe { src_p.add(req.src_pstr) }
        };
        dst_p = if src_serdez.is_some() {
            dst_p
        } else {
            unsafe { dst_p.add(req.dst_pstr) }
        };
    }

    if src_serdez.is_some() && dst_serdez.is_none() {
        req.write_seq_count =
            state.outputs[req.dst_port_idx].local_bytes_total - req.write_seq_pos;
        if rewind_dst > 0 {
            out_port
                .local_bytes_cons
                .fetch_sub(rewind_dst, std::sync::atomic::Ordering::AcqRel);
        }
    } else {
        assert_eq!(rewind_dst, 0);
    }
    if src_serdez.is_none() && dst_serdez.is_some() {
        req.read_seq_count =
            state.inputs[req.src_port_idx].local_bytes_total - req.read_seq_pos;
        if rewind_src > 0 {
            in_port
                .local_bytes_cons
                .fetch_sub(rewind_src, std::sync::atomic::Ordering::AcqRel);
        }
    } else {
        assert_eq!(rewind_src, 0);
    }

    xd.notify_request_read_done(req);
    xd.notify_request_write_done(req);
}

/// Host-to-host copies between any combination of the CPU memory kinds.
pub(crate) struct MemcpyChannel {
    node: NodeId,
    paths: Vec<SupportedPath>,
    xdq: ChannelXdQueue,
}

impl MemcpyChannel {
    pub(crate) fn new(node: NodeId) -> MemcpyChannel {
        let mut paths = Vec::new();
        for src in CPU_MEM_KINDS {
            for dst in CPU_MEM_KINDS {
                paths.push(SupportedPath {
                    src: PathEndpoint::LocalKind(src),
                    dst: PathEndpoint::LocalKind(dst),
                    bandwidth: 8192,
                    latency: 0,
                    redops_allowed: true,
                    serdez_allowed: true,
                    xd_kind: XferDesKind::MemCpy,
                });
            }
        }
        MemcpyChannel {
            node,
            paths,
            xdq: ChannelXdQueue::new(),
        }
    }
}

impl ChannelOps for MemcpyChannel {
    fn kind(&self) -> XferDesKind {
        XferDesKind::MemCpy
    }
    fn node(&self) -> NodeId {
        self.node
    }
    fn paths(&self) -> &[SupportedPath] {
        &self.paths
    }
    fn xd_queue(&self) -> &ChannelXdQueue {
        &self.xdq
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
