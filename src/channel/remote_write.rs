use std::sync::atomic::Ordering;

use tracing::info;

use crate::bgwork::TimeLimit;
use crate::channel::memcpy::{memcpy_1d, memcpy_2d, memcpy_3d};
use crate::channel::{
    ChannelOps, ChannelXdQueue, PathEndpoint, SupportedPath, XferDesKind, XferDesOps,
};
use crate::env_var::config;
use crate::memory::MemoryOps;
use crate::network::{NetworkOps, Payload, WireMessage};
use crate::xfer_des::{SequenceCache, XferDes};
use crate::{NodeId, NO_GUID};

/// Pushes local bytes into RDMA-reachable memory on another node.  Payload
/// messages carry the downstream flow-control update with them; the sender
/// learns read completion from the transport and write completion from the
/// target.
pub(crate) struct RemoteWriteXferDes {
    pub(crate) xd: XferDes,
}

impl RemoteWriteXferDes {
    pub(crate) fn new(mut xd: XferDes) -> RemoteWriteXferDes {
        // pre-write updates ride the payload messages
        xd.set_skip_pre_write_forward();
        RemoteWriteXferDes { xd }
    }
}

impl XferDesOps for RemoteWriteXferDes {
    fn base(&self) -> &XferDes {
        &self.xd
    }

    fn progress(&self, work_until: TimeLimit) -> bool {
        let mut did_work = false;
        // immediate acks for reads happen when we assemble or skip input;
        // immediate acks for writes only when we skip output
        let mut rcache = SequenceCache::reads(config().seq_cache_flush);
        let mut wcache = SequenceCache::writes(config().seq_cache_flush);
        let max_assembly_size = config().max_assembly_size;

        let network = self.xd.xdq.network();
        let state = &mut *self.xd.state.lock();

        loop {
            let min_xfer_size = config().min_xfer_size;
            let max_bytes = self.xd.get_addresses(state, min_xfer_size, &mut rcache);
            if max_bytes == 0 {
                break;
            }

            let in_idx = state.input_control.current_io_port;
            let out_idx = state.output_control.current_io_port;
            let mut in_span_start = in_idx.map_or(0, |i| state.inputs[i].local_bytes_total);
            let mut out_span_start = out_idx.map_or(0, |o| state.outputs[o].local_bytes_total);

            let mut total_bytes = 0usize;
            match (in_idx, out_idx) {
                (Some(i), Some(o)) => {
                    info!(target: "ferry::xd",
                          min = min_xfer_size, max = max_bytes, "remote write chunk");
                    let in_port = &self.xd.input_ports[i];
                    let out_port = &self.xd.output_ports[o];
                    let dst_node = out_port.mem.owner_node();

                    while total_bytes < max_bytes {
                        let (in_state, out_state) =
                            (&mut state.inputs[i], &mut state.outputs[o]);
                        let mut in_dim =
                            in_state.addrcursor.get_dim(&mut in_state.addrlist);
                        let out_dim =
                            out_state.addrcursor.get_dim(&mut out_state.addrlist);
                        let mut icount =
                            in_state.addrcursor.remaining(&mut in_state.addrlist, 0);
                        let ocount =
                            out_state.addrcursor.remaining(&mut out_state.addrlist, 0);

                        let bytes;
                        let bytes_left = max_bytes - total_bytes;

                        // the output controls the message shape; a 1-D target
                        // beats everything we currently implement (2-D and
                        // scatter targets fall back to shorter 1-D messages)
                        assert!(out_dim > 0);
                        let dst_1d_maxbytes = bytes_left.min(ocount);

                        let dst_buf = out_port
                            .mem
                            .get_remote_addr(
                                out_state.addrcursor.get_offset(&mut out_state.addrlist),
                            )
                            .expect("remote write target must be RDMA-reachable");

                        // now look at the input
                        let src_ptr = in_port
                            .mem
                            .get_direct_ptr(
                                in_state.addrcursor.get_offset(&mut in_state.addrlist),
                                icount,
                            )
                            .expect("remote write source must be CPU-visible");
                        let rec_bytes = network.recommended_max_payload(dst_node);

                        let src_1d_maxbytes = if in_dim > 0 {
                            dst_1d_maxbytes.min(icount).min(rec_bytes)
                        } else {
                            0
                        };
                        let src_2d_maxbytes = if in_dim > 1 {
                            let lines =
                                in_state.addrcursor.remaining(&mut in_state.addrlist, 1);
                            // round the recommendation down to whole lines
                            let rec = rec_bytes - (rec_bytes % icount);
                            dst_1d_maxbytes.min(icount * lines).min(rec)
                        } else {
                            0
                        };
                        // gathers assemble into a transport-provided buffer;
                        // estimate pessimistically
                        let src_ga_maxbytes = dst_1d_maxbytes
                            .min(bytes_left)
                            .min(max_assembly_size);

                        // favor 1d >> 2d >> gather
                        if (src_1d_maxbytes >= src_2d_maxbytes)
                            && (src_1d_maxbytes >= src_ga_maxbytes)
                        {
                            // 1-D source
                            bytes = src_1d_maxbytes;
                            let msg = WireMessage::Write1D {
                                dst: dst_buf,
                                next_xd_guid: out_port.peer_guid,
                                next_port_idx: out_port.peer_port_idx,
                                span_start: out_span_start,
                            };
                            // reads are consumed at local completion, but only
                            // a previous xd would care
                            let local = if in_port.peer_guid != NO_GUID {
                                let me = self.xd.self_arc();
                                let (port, start) = (i, in_span_start);
                                Some(Box::new(move || {
                                    me.base().update_bytes_read(port, start, bytes);
                                }) as crate::network::Completion)
                            } else {
                                None
                            };
                            in_span_start += bytes;
                            // the write isn't complete until the target acks
                            let me = self.xd.self_arc();
                            let (port, start) = (o, out_span_start);
                            let remote = Some(Box::new(move || {
                                me.base().update_bytes_write(port, start, bytes);
                            })
                                as crate::network::Completion);
                            out_span_start += bytes;

                            network.send_with_completions(
                                dst_node,
                                msg,
                                Payload::Contig {
                                    base: src_ptr,
                                    bytes,
                                },
                                local,
                                remote,
                            );
                            in_state.addrcursor.advance(&mut in_state.addrlist, 0, bytes);
                            out_state
                                .addrcursor
                                .advance(&mut out_state.addrlist, 0, bytes);
                        } else if src_2d_maxbytes >= src_ga_maxbytes {
                            // 2-D source, still a contiguous destination
                            let bytes_per_line = icount;
                            let lines = src_2d_maxbytes / icount;
                            bytes = bytes_per_line * lines;
                            assert_eq!(bytes, src_2d_maxbytes);
                            let src_stride =
                                in_state.addrcursor.get_stride(&mut in_state.addrlist, 1);
                            let msg = WireMessage::Write1D {
                                dst: dst_buf,
                                next_xd_guid: out_port.peer_guid,
                                next_port_idx: out_port.peer_port_idx,
                                span_start: out_span_start,
                            };
                            let local = if in_port.peer_guid != NO_GUID {
                                let me = self.xd.self_arc();
                                let (port, start) = (i, in_span_start);
                                Some(Box::new(move || {
                                    me.base().update_bytes_read(port, start, bytes);
                                }) as crate::network::Completion)
                            } else {
                                None
                            };
                            in_span_start += bytes;
                            let me = self.xd.self_arc();
                            let (port, start) = (o, out_span_start);
                            let remote = Some(Box::new(move || {
                                me.base().update_bytes_write(port, start, bytes);
                            })
                                as crate::network::Completion);
                            out_span_start += bytes;

                            network.send_with_completions(
                                dst_node,
                                msg,
                                Payload::Lines {
                                    base: src_ptr,
                                    bytes_per_line,
                                    lines,
                                    stride: src_stride,
                                },
                                local,
                                remote,
                            );
                            in_state.addrcursor.advance(&mut in_state.addrlist, 1, lines);
                            out_state
                                .addrcursor
                                .advance(&mut out_state.addrlist, 0, bytes);
                        } else {
                            // gather: assemble scattered source data into one
                            // payload
                            bytes = src_ga_maxbytes;
                            let mut assembly = vec![0u8; bytes];
                            let mut todo = bytes;
                            loop {
                                assert!(in_dim > 0);
                                let dst =
                                    assembly.as_mut_ptr() as usize + (bytes - todo);
                                if (icount >= todo / 2) || (in_dim == 1) {
                                    let chunk = todo.min(icount);
                                    let src = in_port
                                        .mem
                                        .get_direct_ptr(
                                            in_state
                                                .addrcursor
                                                .get_offset(&mut in_state.addrlist),
                                            chunk,
                                        )
                                        .unwrap() as usize;
                                    memcpy_1d(dst, src, chunk);
                                    in_state.addrcursor.advance(
                                        &mut in_state.addrlist,
                                        0,
                                        chunk,
                                    );
                                    todo -= chunk;
                                } else {
                                    let lines = (todo / icount).min(
                                        in_state
                                            .addrcursor
                                            .remaining(&mut in_state.addrlist, 1),
                                    );
                                    if ((icount * lines) >= todo / 2) || (in_dim == 2) {
                                        let src = in_port
                                            .mem
                                            .get_direct_ptr(
                                                in_state
                                                    .addrcursor
                                                    .get_offset(&mut in_state.addrlist),
                                                icount,
                                            )
                                            .unwrap()
                                            as usize;
                                        memcpy_2d(
                                            dst,
                                            icount,
                                            src,
                                            in_state
                                                .addrcursor
                                                .get_stride(&mut in_state.addrlist, 1),
                                            icount,
                                            lines,
                                        );
                                        in_state.addrcursor.advance(
                                            &mut in_state.addrlist,
                                            1,
                                            lines,
                                        );
                                        todo -= icount * lines;
                                    } else {
                                        let planes = (todo / (icount * lines)).min(
                                            in_state
                                                .addrcursor
                                                .remaining(&mut in_state.addrlist, 2),
                                        );
                                        let src = in_port
                                            .mem
                                            .get_direct_ptr(
                                                in_state
                                                    .addrcursor
                                                    .get_offset(&mut in_state.addrlist),
                                                icount,
                                            )
                                            .unwrap()
                                            as usize;
                                        memcpy_3d(
                                            dst,
                                            icount,
                                            icount * lines,
                                            src,
                                            in_state
                                                .addrcursor
                                                .get_stride(&mut in_state.addrlist, 1),
                                            in_state
                                                .addrcursor
                                                .get_stride(&mut in_state.addrlist, 2),
                                            icount,
                                            lines,
                                            planes,
                                        );
                                        in_state.addrcursor.advance(
                                            &mut in_state.addrlist,
                                            2,
                                            planes,
                                        );
                                        todo -= icount * lines * planes;
                                    }
                                }

                                if todo == 0 {
                                    break;
                                }

                                // read the next entry
                                in_dim = in_state.addrcursor.get_dim(&mut in_state.addrlist);
                                icount =
                                    in_state.addrcursor.remaining(&mut in_state.addrlist, 0);
                            }

                            // piggyback the final byte total when it's already
                            // known and still unsent
                            let pre_bytes_total = if out_port
                                .needs_pbt_update
                                .load(Ordering::Acquire)
                                && self.xd.iteration_completed.load(Ordering::Acquire)
                                && out_port.needs_pbt_update.swap(false, Ordering::AcqRel)
                            {
                                out_port.local_bytes_mirror()
                            } else {
                                usize::MAX
                            };

                            // write completion arrives with the target's ack
                            let me = self.xd.self_arc();
                            let (port, start) = (o, out_span_start);
                            let req_token = network.register_pending(Box::new(move || {
                                me.base().update_bytes_write(port, start, bytes);
                            }));
                            let msg = WireMessage::RemoteWrite {
                                dst: dst_buf,
                                next_xd_guid: out_port.peer_guid,
                                next_port_idx: out_port.peer_port_idx,
                                span_start: out_span_start,
                                span_size: bytes,
                                pre_bytes_total,
                                req_token,
                            };
                            out_span_start += bytes;

                            network.send(dst_node, msg, Payload::Owned(assembly));

                            // we copied the input, so the read is complete now
                            rcache.add_span(&self.xd, Some(i), in_span_start, bytes);
                            in_span_start += bytes;

                            out_state
                                .addrcursor
                                .advance(&mut out_state.addrlist, 0, bytes);
                        }

                        debug_assert!(bytes > 0 && bytes <= bytes_left);
                        total_bytes += bytes;

                        if (total_bytes >= min_xfer_size) && work_until.is_expired() {
                            break;
                        }
                    }
                }
                (Some(i), None) => {
                    // input but no output: skip input bytes
                    total_bytes = max_bytes;
                    let in_state = &mut state.inputs[i];
                    in_state
                        .addrcursor
                        .skip_bytes(&mut in_state.addrlist, total_bytes);
                    rcache.add_span(&self.xd, Some(i), in_span_start, total_bytes);
                }
                (None, Some(o)) => {
                    // output but no input: skip output bytes
                    total_bytes = max_bytes;
                    let out_state = &mut state.outputs[o];
                    out_state
                        .addrcursor
                        .skip_bytes(&mut out_state.addrlist, total_bytes);
                    wcache.add_span(&self.xd, Some(o), out_span_start, total_bytes);
                }
                (None, None) => {
                    // simultaneous gather+scatter can skip both sides
                    total_bytes = max_bytes;
                }
            }

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

/// Carrier of payload writes into remote RDMA-reachable memory.
pub(crate) struct RemoteWriteChannel {
    node: NodeId,
    paths: Vec<SupportedPath>,
    xdq: ChannelXdQueue,
}

impl RemoteWriteChannel {
    pub(crate) fn new(node: NodeId) -> RemoteWriteChannel {
        let paths = vec![SupportedPath {
            src: PathEndpoint::LocalRdma,
            dst: PathEndpoint::RemoteRdma,
            bandwidth: 2048,
            latency: 1000,
            redops_allowed: false,
            serdez_allowed: false,
            xd_kind: XferDesKind::RemoteWrite,
        }];
        RemoteWriteChannel {
            node,
            paths,
            xdq: ChannelXdQueue::new(),
        }
    }
}

impl ChannelOps for RemoteWriteChannel {
    fn kind(&self) -> XferDesKind {
        XferDesKind::RemoteWrite
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
}
