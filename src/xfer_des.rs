use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, info, trace};

use crate::addr_list::{AddressList, AddressListCursor};
use crate::channel::{Channel, XferDesKind, XferDesVariant};
use crate::event::Event;
use crate::memory::{Memory, MemoryOps};
use crate::sequence::SequenceAssembler;
use crate::serdez::CustomSerdez;
use crate::transfer::{AddressInfo, StepFlags, TransferIter, TransferIterator};
use crate::xd_queue::XferDesQueue;
use crate::{NodeId, XferDesId, NO_GUID};

pub(crate) const CONTROL_WORD_BYTES: usize = 4;

/// Role of a port within its XD.
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortKind {
    Data,
    /// Input port whose byte stream multiplexes the remaining inputs.
    GatherControl,
    /// Input port whose byte stream multiplexes the outputs.
    ScatterControl,
    /// Input port supplying indirection addresses to the port at the index.
    Indirect(usize),
}

/// Shared (cross-thread) half of one input or output endpoint.
///
/// For an output port `seq_local` tracks bytes we have written and
/// `seq_remote` tracks IB space the consumer has freed; for an input port
/// `seq_local` tracks bytes we have read and `seq_remote` tracks bytes the
/// upstream has produced.
pub(crate) struct XferPort {
    pub(crate) mem: Arc<Memory>,
    pub(crate) peer_guid: XferDesId,
    pub(crate) peer_port_idx: usize,
    pub(crate) indirect_port_idx: Option<usize>,
    pub(crate) is_indirect_port: bool,
    pub(crate) ib_offset: usize,
    pub(crate) ib_size: usize,
    pub(crate) serdez_op: Option<Arc<dyn CustomSerdez>>,
    /// One-shot flag (outputs only): the final byte total has not yet been
    /// sent to the peer.  Consumed by atomic exchange.
    pub(crate) needs_pbt_update: AtomicBool,
    /// Conservative byte count used for flow control under serdez; always
    /// >= the exact total, refunded when actual sizes are known.
    pub(crate) local_bytes_cons: AtomicUsize,
    /// Mirror of the single-writer exact total, readable off-thread.
    local_bytes_mirror: AtomicUsize,
    /// Final byte count promised by the peer; `usize::MAX` until it arrives.
    pub(crate) remote_bytes_total: AtomicUsize,
    pub(crate) seq_local: SequenceAssembler,
    pub(crate) seq_remote: SequenceAssembler,
}

impl XferPort {
    /// Advances the exact local byte total.  Caller owns the port's
    /// iteration state (the XD state lock).
    pub(crate) fn bump_local_total(&self, st: &mut PortState, bytes: usize) {
        st.local_bytes_total += bytes;
        self.local_bytes_mirror
            .store(st.local_bytes_total, Ordering::Release);
    }

    pub(crate) fn local_bytes_mirror(&self) -> usize {
        self.local_bytes_mirror.load(Ordering::Acquire)
    }
}

/// Single-writer (progress-thread) half of one endpoint.
pub(crate) struct PortState {
    pub(crate) iter: TransferIter,
    pub(crate) addrlist: AddressList,
    pub(crate) addrcursor: AddressListCursor,
    pub(crate) local_bytes_total: usize,
}

/// Gather/scatter multiplexing state for one direction.
///
/// With no control port, `remaining_count` sits at `usize::MAX` and
/// `current_io_port` stays at port 0.
#[derive(Debug)]
pub(crate) struct ControlState {
    pub(crate) control_port_idx: Option<usize>,
    pub(crate) current_io_port: Option<usize>,
    pub(crate) remaining_count: usize,
    pub(crate) eos_received: bool,
}

impl ControlState {
    fn new(control_port_idx: Option<usize>) -> ControlState {
        ControlState {
            control_port_idx,
            current_io_port: Some(0),
            remaining_count: if control_port_idx.is_some() {
                0
            } else {
                usize::MAX
            },
            eos_received: false,
        }
    }
}

pub(crate) struct XdState {
    pub(crate) inputs: Vec<PortState>,
    pub(crate) outputs: Vec<PortState>,
    pub(crate) input_control: ControlState,
    pub(crate) output_control: ControlState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReqDim {
    D1,
    D2,
    D3,
}

/// One concrete transfer request handed to a channel backend.
#[derive(Debug, Clone)]
pub(crate) struct IoRequest {
    pub(crate) src_port_idx: usize,
    pub(crate) dst_port_idx: usize,
    pub(crate) read_seq_pos: usize,
    pub(crate) read_seq_count: usize,
    pub(crate) write_seq_pos: usize,
    pub(crate) write_seq_count: usize,
    pub(crate) dim: ReqDim,
    pub(crate) src_off: usize,
    pub(crate) dst_off: usize,
    pub(crate) nbytes: usize,
    pub(crate) nlines: usize,
    pub(crate) src_str: usize,
    pub(crate) dst_str: usize,
    pub(crate) nplanes: usize,
    pub(crate) src_pstr: usize,
    pub(crate) dst_pstr: usize,
}

// scheduling states for the per-XD wakeup protocol
const SCHED_IDLE: u8 = 0;
const SCHED_QUEUED: u8 = 1;
const SCHED_RUNNING: u8 = 2;
const SCHED_DIRTY: u8 = 3;
const SCHED_DONE: u8 = 4;

/// One node of the copy pipeline: a set of input and output ports plus the
/// state machine that drains addresses into channel requests under
/// byte-level flow control.
pub(crate) struct XferDes {
    pub(crate) guid: XferDesId,
    pub(crate) launch_node: NodeId,
    pub(crate) kind: XferDesKind,
    pub(crate) priority: i32,
    pub(crate) max_req_size: usize,
    pub(crate) channel: Arc<Channel>,
    pub(crate) xdq: Arc<XferDesQueue>,
    pub(crate) fence_id: u64,
    pub(crate) input_ports: Vec<XferPort>,
    pub(crate) output_ports: Vec<XferPort>,
    pub(crate) state: Mutex<XdState>,
    pub(crate) iteration_completed: AtomicBool,
    transfer_completed: AtomicBool,
    completion_notified: AtomicBool,
    /// Set when a channel request fails; the fence completes unsuccessful.
    failed: AtomicBool,
    sched_state: AtomicU8,
    /// Remote writes suppress the peer pre-write forwarding; the payload
    /// message already delivered it on the receiving node.
    pub(crate) skip_pre_write_forward: bool,
    pub(crate) metadata_event: Event,
    self_ref: Mutex<Weak<XferDesVariant>>,
}

/// Everything needed to build one port, with handles already resolved.
pub(crate) struct PortInit {
    pub(crate) mem: Arc<Memory>,
    pub(crate) iter: TransferIter,
    pub(crate) serdez_op: Option<Arc<dyn CustomSerdez>>,
    pub(crate) peer_guid: XferDesId,
    pub(crate) peer_port_idx: usize,
    pub(crate) ib_offset: usize,
    pub(crate) ib_size: usize,
    pub(crate) port_kind: PortKind,
}

impl XferDes {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        guid: XferDesId,
        launch_node: NodeId,
        kind: XferDesKind,
        priority: i32,
        max_req_size: usize,
        channel: Arc<Channel>,
        xdq: Arc<XferDesQueue>,
        fence_id: u64,
        inputs: Vec<PortInit>,
        outputs: Vec<PortInit>,
        metadata_event: Event,
    ) -> XferDes {
        let mut gather_control_port = None;
        let mut scatter_control_port = None;

        let mut input_ports = Vec::with_capacity(inputs.len());
        let mut input_states = Vec::with_capacity(inputs.len());
        let mut indirect_targets = Vec::new();
        for (i, pi) in inputs.into_iter().enumerate() {
            match pi.port_kind {
                PortKind::GatherControl => gather_control_port = Some(i),
                PortKind::ScatterControl => scatter_control_port = Some(i),
                PortKind::Indirect(target) => indirect_targets.push(target),
                PortKind::Data => {}
            }
            input_ports.push(XferPort {
                mem: pi.mem,
                peer_guid: pi.peer_guid,
                peer_port_idx: pi.peer_port_idx,
                indirect_port_idx: None,
                is_indirect_port: false,
                ib_offset: pi.ib_offset,
                ib_size: pi.ib_size,
                serdez_op: pi.serdez_op,
                needs_pbt_update: AtomicBool::new(false),
                local_bytes_cons: AtomicUsize::new(0),
                local_bytes_mirror: AtomicUsize::new(0),
                remote_bytes_total: AtomicUsize::new(usize::MAX),
                seq_local: SequenceAssembler::new(),
                seq_remote: SequenceAssembler::new(),
            });
            input_states.push(PortState {
                iter: pi.iter,
                addrlist: AddressList::new(),
                addrcursor: AddressListCursor::new(),
                local_bytes_total: 0,
            });
        }
        for t in indirect_targets {
            input_ports[t].is_indirect_port = true;
        }

        let mut output_ports = Vec::with_capacity(outputs.len());
        let mut output_states = Vec::with_capacity(outputs.len());
        for po in outputs {
            let port = XferPort {
                mem: po.mem,
                peer_guid: po.peer_guid,
                peer_port_idx: po.peer_port_idx,
                indirect_port_idx: None,
                is_indirect_port: false,
                ib_offset: po.ib_offset,
                ib_size: po.ib_size,
                serdez_op: po.serdez_op,
                needs_pbt_update: AtomicBool::new(po.peer_guid != NO_GUID),
                local_bytes_cons: AtomicUsize::new(0),
                local_bytes_mirror: AtomicUsize::new(0),
                remote_bytes_total: AtomicUsize::new(usize::MAX),
                seq_local: SequenceAssembler::new(),
                seq_remote: SequenceAssembler::new(),
            };
            // when writing into an IB, the whole window is free to start with
            if port.ib_size > 0 {
                port.seq_remote.add_span(0, port.ib_size);
            }
            output_ports.push(port);
            output_states.push(PortState {
                iter: po.iter,
                addrlist: AddressList::new(),
                addrcursor: AddressListCursor::new(),
                local_bytes_total: 0,
            });
        }

        XferDes {
            guid,
            launch_node,
            kind,
            priority,
            max_req_size,
            channel,
            xdq,
            fence_id,
            input_ports,
            output_ports,
            state: Mutex::new(XdState {
                inputs: input_states,
                outputs: output_states,
                input_control: ControlState::new(gather_control_port),
                output_control: ControlState::new(scatter_control_port),
            }),
            iteration_completed: AtomicBool::new(false),
            transfer_completed: AtomicBool::new(false),
            completion_notified: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            sched_state: AtomicU8::new(SCHED_IDLE),
            skip_pre_write_forward: false,
            metadata_event,
            self_ref: Mutex::new(Weak::new()),
        }
    }

    pub(crate) fn set_skip_pre_write_forward(&mut self) {
        self.skip_pre_write_forward = true;
    }

    pub(crate) fn set_self_ref(&self, me: &Arc<XferDesVariant>) {
        *self.self_ref.lock() = Arc::downgrade(me);
    }

    /// Strong reference to the containing variant, for completion closures
    /// that must keep the XD alive.
    pub(crate) fn self_arc(&self) -> Arc<XferDesVariant> {
        self.self_ref
            .lock()
            .upgrade()
            .expect("xd used before registration")
    }

    /// Merged readiness of every port's iterator metadata plus any
    /// graph-level precondition supplied at submit time.
    pub(crate) fn request_metadata(&self) -> Event {
        let state = self.state.lock();
        let mut preconditions = Vec::new();
        for pst in state.inputs.iter().chain(state.outputs.iter()) {
            let e = pst.iter.request_metadata();
            if !e.has_triggered() {
                preconditions.push(e);
            }
        }
        if !self.metadata_event.has_triggered() {
            preconditions.push(self.metadata_event.clone());
        }
        Event::merge(preconditions)
    }

    /// Re-queues this XD with its channel; called whenever an asynchronous
    /// update may have unblocked forward progress.
    pub(crate) fn update_progress(&self) {
        loop {
            match self.sched_state.load(Ordering::Acquire) {
                SCHED_IDLE => {
                    if self
                        .sched_state
                        .compare_exchange(
                            SCHED_IDLE,
                            SCHED_QUEUED,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        if let Some(me) = self.self_ref.lock().upgrade() {
                            self.channel.enqueue_ready_xd(me);
                        }
                        return;
                    }
                }
                SCHED_RUNNING => {
                    if self
                        .sched_state
                        .compare_exchange(
                            SCHED_RUNNING,
                            SCHED_DIRTY,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        return;
                    }
                }
                _ => return,
            }
        }
    }

    pub(crate) fn begin_progress(&self) {
        self.sched_state.store(SCHED_RUNNING, Ordering::Release);
    }

    /// Returns true if the XD must be re-queued right away (an update raced
    /// with the progress call).
    pub(crate) fn end_progress(&self) -> bool {
        if self
            .sched_state
            .compare_exchange(
                SCHED_RUNNING,
                SCHED_IDLE,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            false
        } else {
            self.sched_state.store(SCHED_QUEUED, Ordering::Release);
            true
        }
    }

    pub(crate) fn mark_done_scheduling(&self) {
        self.sched_state.store(SCHED_DONE, Ordering::Release);
    }

    /// Records a failed channel request; completion proceeds so the
    /// pipeline drains, but the fence reports the failure.
    pub(crate) fn mark_failed(&self) {
        self.failed.store(true, Ordering::Release);
    }

    /// Fires the completion notification exactly once.
    pub(crate) fn notify_completion_once(&self) {
        if !self.completion_notified.swap(true, Ordering::AcqRel) {
            let successful = !self.failed.load(Ordering::Acquire);
            info!(target: "ferry::xd", guid = self.guid, successful, "xd complete");
            self.xdq
                .notify_fence(self.launch_node, self.fence_id, successful);
        }
    }

    // ------------------------------------------------------------------
    // control-word handling

    /// Pulls one 4-byte control word for the given direction.  Returns false
    /// if no word is available (or the stream just ended).
    fn refill_control(
        &self,
        state: &mut XdState,
        output: bool,
        rcache: Option<&mut SequenceCache>,
    ) -> bool {
        // note: the port that controls the output is an input port too --
        // scatter control is carried in-band from the producer
        let cp = if output {
            state.output_control.control_port_idx.unwrap()
        } else {
            state.input_control.control_port_idx.unwrap()
        };
        let port = &self.input_ports[cp];
        let pst = &mut state.inputs[cp];

        let avail = port
            .seq_remote
            .span_exists(pst.local_bytes_total, CONTROL_WORD_BYTES);
        if avail < CONTROL_WORD_BYTES {
            return false; // no data right now
        }
        let (amt, c_info) = pst
            .iter
            .step(CONTROL_WORD_BYTES, StepFlags::CONTIG_ONLY, false)
            .expect("control stream iterator stalled");
        assert_eq!(amt, CONTROL_WORD_BYTES);
        let srcptr = port
            .mem
            .get_direct_ptr(c_info.base_offset, CONTROL_WORD_BYTES)
            .expect("control port memory must be CPU-visible");
        let mut raw = [0u8; CONTROL_WORD_BYTES];
        unsafe { std::ptr::copy_nonoverlapping(srcptr, raw.as_mut_ptr(), CONTROL_WORD_BYTES) };
        let cword = u32::from_le_bytes(raw);

        let read_pos = pst.local_bytes_total;
        match rcache {
            Some(cache) => cache.add_span(self, Some(cp), read_pos, CONTROL_WORD_BYTES),
            None => self.update_bytes_read(cp, read_pos, CONTROL_WORD_BYTES),
        }
        port.bump_local_total(pst, CONTROL_WORD_BYTES);

        let ctl = if output {
            assert_ne!(cword, 0);
            &mut state.output_control
        } else {
            &mut state.input_control
        };
        ctl.remaining_count = (cword >> 8) as usize;
        ctl.current_io_port = ((cword & 0x7f) as usize).checked_sub(1);
        ctl.eos_received = (cword & 0x80) != 0;
        info!(target: "ferry::xd",
              guid = self.guid,
              output,
              port = ?ctl.current_io_port,
              count = ctl.remaining_count,
              done = ctl.eos_received,
              "control word");

        if ctl.remaining_count == 0 {
            // a zero count is only legal as the end of the stream
            assert!(ctl.eos_received);
            self.iteration_completed.store(true, Ordering::Release);
            if output {
                // give all output channels a chance to indicate completion
                self.poke_outputs(state, None);
            }
            return false;
        }
        true
    }

    /// Refills whichever control stream has run dry and reports how many
    /// bytes/elements the controls currently permit (`usize::MAX` without
    /// control ports).  Zero means "stalled or finished".
    pub(crate) fn update_control_info(
        &self,
        state: &mut XdState,
        mut rcache: Option<&mut SequenceCache>,
    ) -> usize {
        if state.input_control.remaining_count == 0
            && state.input_control.control_port_idx.is_some()
            && !self.refill_control(state, false, rcache.as_deref_mut())
        {
            return 0;
        }
        if state.output_control.remaining_count == 0
            && state.output_control.control_port_idx.is_some()
            && !self.refill_control(state, true, rcache.as_deref_mut())
        {
            return 0;
        }
        state
            .input_control
            .remaining_count
            .min(state.output_control.remaining_count)
    }

    // ------------------------------------------------------------------
    // bulk-address (cursor) mode

    /// Ensures both live ports have addresses queued and returns the number
    /// of bytes that may move right now, bounded by flow control on both
    /// sides.  Zero means no forward progress is currently possible.
    pub(crate) fn get_addresses(
        &self,
        state: &mut XdState,
        mut min_xfer_size: usize,
        rcache: &mut SequenceCache,
    ) -> usize {
        let control_count = self.update_control_info(state, Some(rcache));
        if control_count == 0 {
            return 0;
        }
        min_xfer_size = min_xfer_size.min(control_count);
        let mut max_bytes = control_count;

        if let Some(i) = state.input_control.current_io_port {
            let in_port = &self.input_ports[i];
            let in_state = &mut state.inputs[i];

            let mut read_bytes_avail = in_state.addrlist.bytes_pending();
            if read_bytes_avail < min_xfer_size {
                if in_state.iter.get_addresses(&mut in_state.addrlist) {
                    // iterator asked for an early flush
                    min_xfer_size = min_xfer_size.min(in_state.addrlist.bytes_pending());
                }
                read_bytes_avail = in_state.addrlist.bytes_pending();
            }

            // if we're not the first in the chain, respect flow control too
            if in_port.peer_guid != NO_GUID {
                read_bytes_avail = in_port
                    .seq_remote
                    .span_exists(in_state.local_bytes_total, read_bytes_avail);
                let pbt_limit = in_port
                    .remote_bytes_total
                    .load(Ordering::Acquire)
                    .wrapping_sub(in_state.local_bytes_total);
                min_xfer_size = min_xfer_size.min(pbt_limit);
            }

            // gather copies with fork-joins can't always supply
            // min_xfer_size at once -- move what we've got and rely on the
            // producer to chunk as large as it can
            if (read_bytes_avail > 0) && (read_bytes_avail < min_xfer_size) {
                min_xfer_size = read_bytes_avail;
            }

            max_bytes = max_bytes.min(read_bytes_avail);
        }

        if let Some(o) = state.output_control.current_io_port {
            let out_port = &self.output_ports[o];
            let out_state = &mut state.outputs[o];

            let mut write_bytes_avail = out_state.addrlist.bytes_pending();
            if write_bytes_avail < min_xfer_size {
                if out_state.iter.get_addresses(&mut out_state.addrlist) {
                    min_xfer_size = min_xfer_size.min(out_state.addrlist.bytes_pending());
                }
                write_bytes_avail = out_state.addrlist.bytes_pending();
            }

            // if we're not the last in the chain, don't overwrite unread IB
            if out_port.peer_guid != NO_GUID {
                write_bytes_avail = out_port
                    .seq_remote
                    .span_exists(out_state.local_bytes_total, write_bytes_avail);
            }

            max_bytes = max_bytes.min(write_bytes_avail);
        }

        if min_xfer_size == 0 {
            // only reachable without control ports: an empty iterator
            assert!(
                state.input_control.control_port_idx.is_none()
                    && state.output_control.control_port_idx.is_none()
            );
            self.iteration_completed.store(true, Ordering::Release);
            return 0;
        }

        // wait for a big enough chunk to show up
        if max_bytes < min_xfer_size {
            return 0;
        }

        max_bytes
    }

    /// Accounts `total_bytes` against both live ports and the control
    /// counts; returns true when this consumption completed the iteration.
    pub(crate) fn record_address_consumption(
        &self,
        state: &mut XdState,
        total_bytes: usize,
    ) -> bool {
        let mut in_done = false;
        if let Some(i) = state.input_control.current_io_port {
            let in_port = &self.input_ports[i];
            let in_state = &mut state.inputs[i];

            in_port.bump_local_total(in_state, total_bytes);
            in_port.local_bytes_cons.fetch_add(total_bytes, Ordering::AcqRel);

            in_done = if in_port.peer_guid == NO_GUID {
                (in_state.addrlist.bytes_pending() == 0) && in_state.iter.done()
            } else {
                in_state.local_bytes_total == in_port.remote_bytes_total.load(Ordering::Acquire)
            };
        }

        let mut out_done = false;
        if let Some(o) = state.output_control.current_io_port {
            let out_port = &self.output_ports[o];
            let out_state = &mut state.outputs[o];

            out_port.bump_local_total(out_state, total_bytes);
            out_port.local_bytes_cons.fetch_add(total_bytes, Ordering::AcqRel);

            if out_port.peer_guid == NO_GUID {
                out_done = (out_state.addrlist.bytes_pending() == 0) && out_state.iter.done();
            }
        }

        state.input_control.remaining_count =
            state.input_control.remaining_count.saturating_sub(total_bytes);
        state.output_control.remaining_count =
            state.output_control.remaining_count.saturating_sub(total_bytes);

        // control streams override the iterators' notion of done-ness
        if state.input_control.control_port_idx.is_some() {
            in_done =
                (state.input_control.remaining_count == 0) && state.input_control.eos_received;
        }
        if state.output_control.control_port_idx.is_some() {
            out_done =
                (state.output_control.remaining_count == 0) && state.output_control.eos_received;
        }

        if in_done || out_done {
            self.iteration_completed.store(true, Ordering::Release);
            true
        } else {
            false
        }
    }

    /// Zero-length write updates on the outputs so multi-hop successors
    /// notice end-of-stream (and pick up the final byte totals).
    pub(crate) fn poke_outputs(&self, state: &XdState, except: Option<usize>) {
        for i in 0..self.output_ports.len() {
            if Some(i) == except {
                continue;
            }
            self.update_bytes_write(i, state.outputs[i].local_bytes_total, 0);
        }
    }

    // ------------------------------------------------------------------
    // completion

    /// To be complete we must have finished iterating (possibly learned via
    /// a byte-total update) and have every write locally acknowledged; the
    /// conservative write count guards against early completion while
    /// serializing.
    pub(crate) fn is_completed(&self) -> bool {
        // the check below has some cost, so don't do it more than once
        if self.transfer_completed.load(Ordering::Acquire) {
            return true;
        }
        if !self.iteration_completed.load(Ordering::Acquire) {
            return false;
        }
        for port in &self.output_ports {
            // see if we still need to send the total bytes
            if port.needs_pbt_update.load(Ordering::Acquire) {
                debug_assert_ne!(port.peer_guid, NO_GUID);
                if port.needs_pbt_update.swap(false, Ordering::AcqRel) {
                    self.xdq.update_pre_bytes_total(
                        port.peer_guid,
                        port.peer_port_idx,
                        port.local_bytes_mirror(),
                    );
                }
            }
            let lbc_snapshot = port.local_bytes_cons.load(Ordering::Acquire);
            if port.seq_local.span_exists(0, lbc_snapshot) != lbc_snapshot {
                return false;
            }
        }
        self.transfer_completed.store(true, Ordering::Release);
        true
    }

    // ------------------------------------------------------------------
    // local request completion + cross-XD updates

    pub(crate) fn update_bytes_read(&self, port_idx: usize, offset: usize, size: usize) {
        let in_port = &self.input_ports[port_idx];
        let inc_amt = in_port.seq_local.add_span(offset, size);
        trace!(target: "ferry::xd",
               guid = self.guid, port = port_idx, offset, size, inc_amt, "bytes_read");
        if in_port.peer_guid != NO_GUID && inc_amt > 0 {
            // we're really telling the previous XD which offsets are ok to
            // overwrite, so adjust our offset by our (circular) IB size
            self.xdq.update_next_bytes_read(
                in_port.peer_guid,
                in_port.peer_port_idx,
                offset + in_port.ib_size,
                inc_amt,
            );
        }
    }

    pub(crate) fn update_bytes_write(&self, port_idx: usize, offset: usize, size: usize) {
        let out_port = &self.output_ports[port_idx];
        let inc_amt = out_port.seq_local.add_span(offset, size);
        trace!(target: "ferry::xd",
               guid = self.guid, port = port_idx, offset, size, inc_amt, "bytes_write");
        // if our oldest write was ack'd, the xd may just be waiting for all
        // writes to complete
        if inc_amt > 0 {
            self.update_progress();
        }
        if out_port.peer_guid != NO_GUID {
            // send the byte total first if it's ready and still unsent
            if out_port.needs_pbt_update.load(Ordering::Acquire)
                && self.iteration_completed.load(Ordering::Acquire)
                && out_port.needs_pbt_update.swap(false, Ordering::AcqRel)
            {
                self.xdq.update_pre_bytes_total(
                    out_port.peer_guid,
                    out_port.peer_port_idx,
                    out_port.local_bytes_mirror(),
                );
            }
            if inc_amt > 0 && !self.skip_pre_write_forward {
                self.xdq.update_pre_bytes_write(
                    out_port.peer_guid,
                    out_port.peer_port_idx,
                    offset,
                    inc_amt,
                );
            }
        }
    }

    /// New data from the producer feeding input `port_idx`.
    pub(crate) fn update_pre_bytes_write(&self, port_idx: usize, offset: usize, size: usize) {
        let in_port = &self.input_ports[port_idx];
        let inc_amt = in_port.seq_remote.add_span(offset, size);
        trace!(target: "ferry::xd",
               guid = self.guid, port = port_idx, offset, size, inc_amt, "pre_write");
        if inc_amt > 0 {
            self.update_progress();
        }
    }

    /// The producer's final byte count for input `port_idx`.
    pub(crate) fn update_pre_bytes_total(&self, port_idx: usize, pre_bytes_total: usize) {
        let in_port = &self.input_ports[port_idx];
        let oldval = in_port
            .remote_bytes_total
            .swap(pre_bytes_total, Ordering::AcqRel);
        assert!(oldval == usize::MAX && pre_bytes_total != usize::MAX);
        debug!(target: "ferry::xd",
               guid = self.guid, port = port_idx, pre_bytes_total, "pre_total");
        // this may unblock an xd that consumed all input but didn't realize
        // there was no more
        self.update_progress();
    }

    /// IB space freed by the consumer attached to output `port_idx`.
    pub(crate) fn update_next_bytes_read(&self, port_idx: usize, offset: usize, size: usize) {
        let out_port = &self.output_ports[port_idx];
        let inc_amt = out_port.seq_remote.add_span(offset, size);
        trace!(target: "ferry::xd",
               guid = self.guid, port = port_idx, offset, size, inc_amt, "next_read");
        if inc_amt > 0 {
            self.update_progress();
        }
    }

    pub(crate) fn notify_request_read_done(&self, req: &IoRequest) {
        self.update_bytes_read(req.src_port_idx, req.read_seq_pos, req.read_seq_count);
    }

    pub(crate) fn notify_request_write_done(&self, req: &IoRequest) {
        self.update_bytes_write(req.dst_port_idx, req.write_seq_pos, req.write_seq_count);
    }

    // ------------------------------------------------------------------
    // request-at-a-time mode

    /// Produces the next concrete request, stepping iterators, applying
    /// serdez worst-case clamps, and reconciling dimensions between the two
    /// sides.  `None` means no forward progress right now (or iteration just
    /// completed).
    pub(crate) fn get_one_request(
        &self,
        state: &mut XdState,
        flags: StepFlags,
    ) -> Option<IoRequest> {
        loop {
            if self.iteration_completed.load(Ordering::Acquire) {
                return None;
            }

            if self.update_control_info(state, None) == 0 {
                return None;
            }

            let in_idx = state.input_control.current_io_port;
            let out_idx = state.output_control.current_io_port;

            let (i, o) = match (in_idx, out_idx) {
                (None, None) => panic!("request with neither input nor output port"),
                (None, Some(o)) => {
                    // no valid input, so nothing lands in the destination --
                    // just step the output iterator past the skipped range
                    let out_port = &self.output_ports[o];
                    let out_state = &mut state.outputs[o];
                    assert!(out_port.peer_guid == NO_GUID && out_port.serdez_op.is_none());
                    let todo = state
                        .input_control
                        .remaining_count
                        .min(state.output_control.remaining_count);
                    let (skip_bytes, _) = out_state.iter.step(todo, flags, false)?;
                    debug!(target: "ferry::xd", guid = self.guid, skip_bytes, "skipping output");
                    assert!(skip_bytes > 0);
                    state.input_control.remaining_count -= skip_bytes;
                    state.output_control.remaining_count -= skip_bytes;
                    if self.check_control_completion(state) {
                        return None;
                    }
                    continue;
                }
                (Some(i), None) => {
                    // valid input that we throw away; we still wait until the
                    // bytes exist to avoid write-after-write races with the
                    // producer
                    let in_port = &self.input_ports[i];
                    let in_state = &mut state.inputs[i];
                    assert!(in_port.serdez_op.is_none());
                    let mut skip_bytes = state
                        .input_control
                        .remaining_count
                        .min(state.output_control.remaining_count);
                    if in_port.peer_guid != NO_GUID {
                        skip_bytes = in_port
                            .seq_remote
                            .span_exists(in_state.local_bytes_total, skip_bytes);
                        if skip_bytes == 0 {
                            return None;
                        }
                    }
                    let (skip_bytes, _) = in_state.iter.step(skip_bytes, flags, false)?;
                    debug!(target: "ferry::xd", guid = self.guid, skip_bytes, "skipping input");
                    assert!(skip_bytes > 0);
                    self.update_bytes_read(i, in_state.local_bytes_total, skip_bytes);
                    in_port.bump_local_total(in_state, skip_bytes);
                    state.input_control.remaining_count -= skip_bytes;
                    state.output_control.remaining_count -= skip_bytes;
                    if self.check_control_completion(state) {
                        return None;
                    }
                    continue;
                }
                (Some(i), Some(o)) => (i, o),
            };

            let in_port = &self.input_ports[i];
            let out_port = &self.output_ports[o];

            // several counters change asynchronously to the logic below:
            // sample them once and stick with the snapshots (adjusting for
            // our own atomic increments)
            let mut pbt_snapshot = in_port.remote_bytes_total.load(Ordering::Acquire);
            let mut rbc_snapshot = in_port.local_bytes_cons.load(Ordering::Acquire);
            let wbc_snapshot = out_port.local_bytes_cons.load(Ordering::Acquire);

            // empty iterators and filtered streams can finish a transfer
            // before any request notices, so check here as well
            let in_finished = if in_port.peer_guid == NO_GUID {
                state.inputs[i].iter.done()
            } else {
                state.inputs[i].local_bytes_total == pbt_snapshot
            };
            if in_finished {
                if state.inputs[i].local_bytes_total == 0 {
                    info!(target: "ferry::request", guid = self.guid, "empty xferdes");
                }
                self.iteration_completed.store(true, Ordering::Release);
                self.poke_outputs(state, None);
                return None;
            }

            let src_info: AddressInfo;
            let dst_info: AddressInfo;
            let read_seq;
            let write_seq;
            let read_bytes;
            let write_bytes;
            let mut read_pad_bytes = 0usize;
            let mut write_pad_bytes = 0usize;

            let in_serdez = in_port.serdez_op.clone();
            let out_serdez = out_port.serdez_op.clone();

            if let (Some(serdez), None) = (&in_serdez, &out_serdez) {
                // serialization only - must be into an IB
                assert_eq!(in_port.peer_guid, NO_GUID);
                assert_ne!(out_port.peer_guid, NO_GUID);

                // we don't know yet how much output a source step will
                // produce, so don't step the dst iterator; instead take what
                // the source offers and clamp by worst-case destination space
                let maxser = serdez.max_serialized_size();
                let field_size = serdez.sizeof_field_type();
                if out_port.seq_remote.span_exists(wbc_snapshot, maxser) < maxser {
                    return None; // no room for even one worst-case element
                }

                let in_state = &mut state.inputs[i];
                let (mut src_bytes, mut info) =
                    in_state.iter.step(self.max_req_size, flags, true)?;
                let mut num_elems = src_bytes / field_size;
                if num_elems == 0 {
                    in_state.iter.cancel_step();
                    return None;
                }
                assert_eq!(num_elems * field_size, src_bytes);
                let max_dst_bytes = num_elems * maxser;

                // an output control restricts the element count
                if state.output_control.control_port_idx.is_some()
                    && num_elems > state.output_control.remaining_count
                {
                    info!(target: "ferry::xd",
                          from = num_elems,
                          to = state.output_control.remaining_count,
                          "scatter/serialize clamp");
                    num_elems = state.output_control.remaining_count;
                }

                let clamp_dst_bytes = num_elems * maxser;
                let mut dst_bytes_avail =
                    out_port.seq_remote.span_exists(wbc_snapshot, clamp_dst_bytes);

                if dst_bytes_avail == max_dst_bytes {
                    in_state.iter.confirm_step();
                } else {
                    // figure out how many elements actually fit and retake a
                    // shorter source step
                    let act_elems = dst_bytes_avail / maxser;
                    dst_bytes_avail = act_elems * maxser;
                    if act_elems == 0 {
                        in_state.iter.cancel_step();
                        return None;
                    }
                    let new_src_bytes = act_elems * field_size;
                    in_state.iter.cancel_step();
                    let (sb, si) = in_state.iter.step(new_src_bytes, flags, false)?;
                    src_bytes = sb;
                    info = si;
                    // a 2-D/3-D source may come up short; re-adjust the
                    // destination budget to match
                    if src_bytes < new_src_bytes {
                        if src_bytes == 0 {
                            return None;
                        }
                        num_elems = src_bytes / field_size;
                        assert_eq!(num_elems * field_size, src_bytes);
                        dst_bytes_avail = num_elems * maxser;
                    }
                }

                // the dst iterator steps during execution; give it matching
                // geometry so lines/planes line up
                src_info = info;
                dst_info = info;

                read_seq = state.inputs[i].local_bytes_total;
                read_bytes = src_bytes;
                in_port.bump_local_total(&mut state.inputs[i], src_bytes);

                write_seq = 0; // filled in during execution
                write_bytes = dst_bytes_avail;
                out_port
                    .local_bytes_cons
                    .fetch_add(dst_bytes_avail, Ordering::AcqRel);
            } else if let (None, Some(serdez)) = (&in_serdez, &out_serdez) {
                // deserialization only - must be from an IB
                assert_ne!(in_port.peer_guid, NO_GUID);
                assert_eq!(out_port.peer_guid, NO_GUID);

                let maxser = serdez.max_serialized_size();
                let field_size = serdez.sizeof_field_type();

                // input is done only if we know the limit AND every byte up
                // to it has arrived
                let mut input_data_done = (pbt_snapshot != usize::MAX)
                    && ((rbc_snapshot >= pbt_snapshot)
                        || (in_port
                            .seq_remote
                            .span_exists(rbc_snapshot, pbt_snapshot - rbc_snapshot)
                            == pbt_snapshot - rbc_snapshot));
                // a mid-stream input control makes the above imprecise
                if state.input_control.control_port_idx.is_some()
                    && !state.input_control.eos_received
                {
                    input_data_done = false;
                }

                if !input_data_done
                    && in_port.seq_remote.span_exists(rbc_snapshot, maxser) < maxser
                {
                    return None; // not even one worst-case element available
                }

                let out_state = &mut state.outputs[o];
                let (mut dst_bytes, mut info) =
                    out_state.iter.step(self.max_req_size, flags, !input_data_done)?;
                let mut num_elems = dst_bytes / field_size;
                if num_elems == 0 {
                    if !input_data_done {
                        out_state.iter.cancel_step();
                    }
                    return None;
                }
                assert_eq!(num_elems * field_size, dst_bytes);
                let max_src_bytes = num_elems * maxser;

                if state.input_control.control_port_idx.is_some()
                    && num_elems > state.input_control.remaining_count
                {
                    info!(target: "ferry::xd",
                          from = num_elems,
                          to = state.input_control.remaining_count,
                          "gather/deserialize clamp");
                    num_elems = state.input_control.remaining_count;
                }

                let clamp_src_bytes = num_elems * maxser;
                let mut src_bytes_avail;
                if input_data_done {
                    // we certainly have all remaining data; we won't overshoot
                    // unless the serialized stream is corrupt
                    src_bytes_avail = max_src_bytes;
                } else {
                    src_bytes_avail =
                        in_port.seq_remote.span_exists(rbc_snapshot, clamp_src_bytes);
                    if src_bytes_avail == max_src_bytes {
                        out_state.iter.confirm_step();
                    } else {
                        info!(target: "ferry::request",
                              from = max_src_bytes, to = src_bytes_avail,
                              "pred limits deserialize");
                        let act_elems = src_bytes_avail / maxser;
                        src_bytes_avail = act_elems * maxser;
                        if act_elems == 0 {
                            out_state.iter.cancel_step();
                            return None;
                        }
                        let new_dst_bytes = act_elems * field_size;
                        out_state.iter.cancel_step();
                        let (db, di) = out_state.iter.step(new_dst_bytes, flags, false)?;
                        dst_bytes = db;
                        info = di;
                        if dst_bytes < new_dst_bytes {
                            if dst_bytes == 0 {
                                return None;
                            }
                            num_elems = dst_bytes / field_size;
                            assert_eq!(num_elems * field_size, dst_bytes);
                            src_bytes_avail = num_elems * maxser;
                        }
                    }
                }

                // the src iterator steps during execution
                dst_info = info;
                src_info = info;

                read_seq = 0; // filled in during execution
                read_bytes = src_bytes_avail;
                in_port
                    .local_bytes_cons
                    .fetch_add(src_bytes_avail, Ordering::AcqRel);
                rbc_snapshot += src_bytes_avail;

                write_seq = state.outputs[o].local_bytes_total;
                write_bytes = dst_bytes;
                out_port.bump_local_total(&mut state.outputs[o], dst_bytes);
                // completion detection uses the conservative count
                out_port
                    .local_bytes_cons
                    .store(state.outputs[o].local_bytes_total, Ordering::Release);
            } else {
                assert!(
                    in_serdez.is_none() || out_serdez.is_none(),
                    "simultaneous serialization and deserialization is not supported"
                );

                // direct mode: limit by request size and the control counts
                let mut max_bytes = self.max_req_size.min(
                    state
                        .input_control
                        .remaining_count
                        .min(state.output_control.remaining_count),
                );

                if in_port.peer_guid != NO_GUID {
                    let pre_max = pbt_snapshot - state.inputs[i].local_bytes_total;
                    assert!(pre_max > 0, "stream end missed by the check above");
                    if pre_max < max_bytes {
                        info!(target: "ferry::request",
                              from = max_bytes, to = pre_max, "pred limits xfer");
                        max_bytes = pre_max;
                    }

                    max_bytes = in_port
                        .seq_remote
                        .span_exists(state.inputs[i].local_bytes_total, max_bytes);
                    if max_bytes == 0 {
                        return None;
                    }
                }

                if out_port.peer_guid != NO_GUID {
                    // don't overwrite IB data that hasn't been read yet
                    max_bytes = out_port
                        .seq_remote
                        .span_exists(state.outputs[o].local_bytes_total, max_bytes);
                    if max_bytes == 0 {
                        return None;
                    }
                }

                // tentatively take as much as the source offers
                let (sb, si) = match state.inputs[i].iter.step(max_bytes, flags, true) {
                    Some(r) => r,
                    None => return None,
                };
                let mut src_bytes = sb;
                let mut sinfo = si;

                // a non-IB source or target may collapse dimensions
                // differently, so the destination step must stay tentative
                let mut dimension_mismatch_possible = ((in_port.peer_guid == NO_GUID)
                    || (out_port.peer_guid == NO_GUID))
                    && flags.lines_ok;

                let dst_step = state.outputs[o]
                    .iter
                    .step(src_bytes, flags, dimension_mismatch_possible);
                let (mut dst_bytes, mut dinfo) = match dst_step {
                    Some(r) => r,
                    None => {
                        // input is an IB, output is not, and the input wasn't
                        // limited by max_bytes: this is the padding case on
                        // the input side
                        if (in_port.peer_guid != NO_GUID)
                            && (out_port.peer_guid == NO_GUID)
                            && (src_bytes < max_bytes)
                        {
                            info!(target: "ferry::xd", bytes = src_bytes, "padding input buffer");
                            read_pad_bytes = src_bytes;
                            state.inputs[i].iter.confirm_step();
                            let sinfo = AddressInfo::contig(0, 0);
                            let dinfo = AddressInfo::contig(0, 0);
                            return Some(self.finish_direct_request(
                                state, i, o, sinfo, dinfo, 0, read_pad_bytes, 0, pbt_snapshot,
                                rbc_snapshot, wbc_snapshot, flags,
                            ));
                        } else {
                            state.inputs[i].iter.cancel_step();
                            return None;
                        }
                    }
                };

                // does the source now need to be shrunk?
                if dst_bytes < src_bytes {
                    state.inputs[i].iter.cancel_step();
                    let retry = state.inputs[i].iter.step(
                        dst_bytes,
                        flags,
                        dimension_mismatch_possible,
                    );
                    match retry {
                        None => {
                            // corner case: pad the destination IB to its
                            // boundary as long as max_bytes isn't the limiter
                            assert!(
                                (in_port.peer_guid == NO_GUID)
                                    && (out_port.peer_guid != NO_GUID)
                            );
                            if dst_bytes < max_bytes {
                                info!(target: "ferry::xd", bytes = dst_bytes, "padding output buffer");
                                write_pad_bytes = dst_bytes;
                                state.outputs[o].iter.confirm_step();
                                let sinfo = AddressInfo::contig(0, 0);
                                let dinfo = AddressInfo::contig(0, 0);
                                return Some(self.finish_direct_request(
                                    state, i, o, sinfo, dinfo, 0, 0, write_pad_bytes,
                                    pbt_snapshot, rbc_snapshot, wbc_snapshot, flags,
                                ));
                            } else {
                                state.outputs[o].iter.cancel_step();
                                return None;
                            }
                        }
                        Some((sb2, si2)) => {
                            src_bytes = sb2;
                            sinfo = si2;
                            // the source may still stop mid-span of a 2+D
                            // destination
                            if src_bytes < dst_bytes {
                                assert!(dimension_mismatch_possible);
                                state.outputs[o].iter.cancel_step();
                                let (db2, di2) =
                                    state.outputs[o].iter.step(src_bytes, flags, true).unwrap();
                                dst_bytes = db2;
                                dinfo = di2;
                            }
                            assert_eq!(src_bytes, dst_bytes);
                        }
                    }
                } else if !dimension_mismatch_possible {
                    // no mismatch possible: safe to confirm the source now
                    state.inputs[i].iter.confirm_step();
                }

                if !dimension_mismatch_possible {
                    assert_eq!(sinfo.bytes_per_chunk, dinfo.bytes_per_chunk);
                    assert!(sinfo.num_lines == 1 && sinfo.num_planes == 1);
                    assert!(dinfo.num_lines == 1 && dinfo.num_planes == 1);
                } else {
                    // grow an extra dimension where chunk sizes disagree and
                    // split lines/planes until both sides describe the same
                    // shape; anything pushed past 3-D is tracked by factor
                    let mut src_4d_factor = 1usize;
                    let mut dst_4d_factor = 1usize;
                    if sinfo.bytes_per_chunk < dinfo.bytes_per_chunk {
                        let ratio = dinfo.bytes_per_chunk / sinfo.bytes_per_chunk;
                        assert_eq!(sinfo.bytes_per_chunk * ratio, dinfo.bytes_per_chunk);
                        dst_4d_factor *= dinfo.num_planes; // existing planes lost
                        dinfo.num_planes = dinfo.num_lines;
                        dinfo.plane_stride = dinfo.line_stride;
                        dinfo.num_lines = ratio;
                        dinfo.line_stride = sinfo.bytes_per_chunk;
                        dinfo.bytes_per_chunk = sinfo.bytes_per_chunk;
                    }
                    if dinfo.bytes_per_chunk < sinfo.bytes_per_chunk {
                        let ratio = sinfo.bytes_per_chunk / dinfo.bytes_per_chunk;
                        assert_eq!(dinfo.bytes_per_chunk * ratio, sinfo.bytes_per_chunk);
                        src_4d_factor *= sinfo.num_planes;
                        sinfo.num_planes = sinfo.num_lines;
                        sinfo.plane_stride = sinfo.line_stride;
                        sinfo.num_lines = ratio;
                        sinfo.line_stride = dinfo.bytes_per_chunk;
                        sinfo.bytes_per_chunk = dinfo.bytes_per_chunk;
                    }

                    if sinfo.num_lines < dinfo.num_lines {
                        let ratio = dinfo.num_lines / sinfo.num_lines;
                        assert_eq!(sinfo.num_lines * ratio, dinfo.num_lines);
                        dst_4d_factor *= dinfo.num_planes;
                        dinfo.num_planes = ratio;
                        dinfo.plane_stride = dinfo.line_stride * sinfo.num_lines;
                        dinfo.num_lines = sinfo.num_lines;
                    }
                    if dinfo.num_lines < sinfo.num_lines {
                        let ratio = sinfo.num_lines / dinfo.num_lines;
                        assert_eq!(dinfo.num_lines * ratio, sinfo.num_lines);
                        src_4d_factor *= sinfo.num_planes;
                        sinfo.num_planes = ratio;
                        sinfo.plane_stride = sinfo.line_stride * dinfo.num_lines;
                        sinfo.num_lines = dinfo.num_lines;
                    }

                    assert_eq!(sinfo.num_lines, dinfo.num_lines);
                    assert_eq!(
                        sinfo.num_planes * src_4d_factor,
                        dinfo.num_planes * dst_4d_factor
                    );
                    assert!(sinfo.num_lines > 1 || sinfo.num_planes == 1);
                    assert!(dinfo.num_lines > 1 || dinfo.num_planes == 1);

                    // only as many planes as both sides can manage
                    if sinfo.num_planes > dinfo.num_planes {
                        sinfo.num_planes = dinfo.num_planes;
                    } else {
                        dinfo.num_planes = sinfo.num_planes;
                    }

                    if !flags.planes_ok {
                        sinfo.num_planes = 1;
                        dinfo.num_planes = 1;
                    }

                    let act_bytes = sinfo.total_bytes();
                    if act_bytes == src_bytes {
                        state.inputs[i].iter.confirm_step();
                        state.outputs[o].iter.confirm_step();
                    } else {
                        // reconciliation shrank the transfer: re-step both
                        // sides to exactly the agreed size
                        state.inputs[i].iter.cancel_step();
                        let (sb3, _) = state.inputs[i].iter.step(act_bytes, flags, false).unwrap();
                        assert_eq!(sb3, act_bytes);
                        state.outputs[o].iter.cancel_step();
                        let (db3, _) = state.outputs[o].iter.step(act_bytes, flags, false).unwrap();
                        assert_eq!(db3, act_bytes);
                    }
                }

                let act_bytes = sinfo.total_bytes();
                return Some(self.finish_direct_request(
                    state,
                    i,
                    o,
                    sinfo,
                    dinfo,
                    act_bytes,
                    read_pad_bytes,
                    write_pad_bytes,
                    pbt_snapshot,
                    rbc_snapshot,
                    wbc_snapshot,
                    flags,
                ));
            }

            // serdez paths land here with their bookkeeping already done
            let req = self.build_request(
                state, i, o, &src_info, &dst_info, read_seq, read_bytes, write_seq, write_bytes,
            );
            self.post_request_accounting(
                state,
                i,
                o,
                &req,
                read_pad_bytes,
                write_pad_bytes,
                &mut pbt_snapshot,
                rbc_snapshot,
            );
            return Some(req);
        }
    }

    /// Direct-mode epilogue: advance totals, build the request, and run the
    /// completion checks.
    #[allow(clippy::too_many_arguments)]
    fn finish_direct_request(
        &self,
        state: &mut XdState,
        i: usize,
        o: usize,
        src_info: AddressInfo,
        dst_info: AddressInfo,
        act_bytes: usize,
        read_pad_bytes: usize,
        write_pad_bytes: usize,
        mut pbt_snapshot: usize,
        rbc_snapshot: usize,
        _wbc_snapshot: usize,
        _flags: StepFlags,
    ) -> IoRequest {
        let in_port = &self.input_ports[i];
        let out_port = &self.output_ports[o];

        let read_seq = state.inputs[i].local_bytes_total;
        let read_bytes = act_bytes + read_pad_bytes;
        // bytes read don't advance when the port is driven by indirection
        if in_port.indirect_port_idx.is_none() {
            in_port.bump_local_total(&mut state.inputs[i], read_bytes);
        }

        let write_seq = state.outputs[o].local_bytes_total;
        let write_bytes = act_bytes + write_pad_bytes;
        out_port.bump_local_total(&mut state.outputs[o], write_bytes);
        out_port
            .local_bytes_cons
            .store(state.outputs[o].local_bytes_total, Ordering::Release);

        let req = self.build_request(
            state, i, o, &src_info, &dst_info, read_seq, read_bytes, write_seq, write_bytes,
        );
        self.post_request_accounting(
            state,
            i,
            o,
            &req,
            read_pad_bytes,
            write_pad_bytes,
            &mut pbt_snapshot,
            rbc_snapshot,
        );
        req
    }

    #[allow(clippy::too_many_arguments)]
    fn build_request(
        &self,
        _state: &XdState,
        i: usize,
        o: usize,
        src_info: &AddressInfo,
        dst_info: &AddressInfo,
        read_seq: usize,
        read_bytes: usize,
        write_seq: usize,
        write_bytes: usize,
    ) -> IoRequest {
        let dim = if src_info.num_planes == 1 {
            if src_info.num_lines == 1 {
                ReqDim::D1
            } else {
                ReqDim::D2
            }
        } else {
            ReqDim::D3
        };
        let req = IoRequest {
            src_port_idx: i,
            dst_port_idx: o,
            read_seq_pos: read_seq,
            read_seq_count: read_bytes,
            write_seq_pos: write_seq,
            write_seq_count: write_bytes,
            dim,
            src_off: src_info.base_offset,
            dst_off: dst_info.base_offset,
            nbytes: src_info.bytes_per_chunk,
            nlines: src_info.num_lines,
            src_str: src_info.line_stride,
            dst_str: dst_info.line_stride,
            nplanes: src_info.num_planes,
            src_pstr: src_info.plane_stride,
            dst_pstr: dst_info.plane_stride,
        };
        info!(target: "ferry::request",
              guid = self.guid,
              src = req.src_off, dst = req.dst_off,
              len = req.nbytes, lines = req.nlines, planes = req.nplanes,
              "request");
        req
    }

    /// Post-request control accounting and completion checks shared by the
    /// request-at-a-time paths.
    #[allow(clippy::too_many_arguments)]
    fn post_request_accounting(
        &self,
        state: &mut XdState,
        i: usize,
        o: usize,
        req: &IoRequest,
        read_pad_bytes: usize,
        write_pad_bytes: usize,
        pbt_snapshot: &mut usize,
        rbc_snapshot: usize,
    ) {
        let in_port = &self.input_ports[i];
        let out_port = &self.output_ports[o];

        // the asynchronously-updated seq_remote can take us to the end of an
        // IB input even while our initial total snapshot was unset, so
        // resample before the done checks
        if (in_port.peer_guid != NO_GUID) && (*pbt_snapshot == usize::MAX) {
            *pbt_snapshot = in_port.remote_bytes_total.load(Ordering::Acquire);
        }

        let has_controls = state.input_control.control_port_idx.is_some()
            || state.output_control.control_port_idx.is_some();
        if has_controls {
            let mut input_count = req.read_seq_count - read_pad_bytes;
            let mut output_count = req.write_seq_count - write_pad_bytes;
            // serdez ports are counted in elements, not bytes
            if let Some(serdez) = &in_port.serdez_op {
                // serializing impacts the output size
                assert_eq!(output_count % serdez.max_serialized_size(), 0);
                output_count /= serdez.max_serialized_size();
            }
            if let Some(serdez) = &out_port.serdez_op {
                // and deserializing impacts the input size
                assert_eq!(input_count % serdez.max_serialized_size(), 0);
                input_count /= serdez.max_serialized_size();
            }
            assert!(state.input_control.remaining_count >= input_count);
            assert!(state.output_control.remaining_count >= output_count);
            state.input_control.remaining_count -= input_count;
            state.output_control.remaining_count -= output_count;
            if ((state.input_control.remaining_count == 0) && state.input_control.eos_received)
                || ((state.output_control.remaining_count == 0)
                    && state.output_control.eos_received)
            {
                info!(target: "ferry::xd", guid = self.guid, "iteration completed via control port");
                self.iteration_completed.store(true, Ordering::Release);
                self.poke_outputs(state, state.output_control.current_io_port);
            }
        } else {
            let in_done = if in_port.peer_guid == NO_GUID {
                state.inputs[i].iter.done()
            } else {
                state.inputs[i].local_bytes_total == *pbt_snapshot
            };
            let out_done = (out_port.peer_guid == NO_GUID) && state.outputs[o].iter.done();
            if in_done || out_done {
                assert!(!self.iteration_completed.load(Ordering::Acquire));
                self.iteration_completed.store(true, Ordering::Release);
                self.poke_outputs(state, state.output_control.current_io_port);

                if in_port.serdez_op.is_none() && out_port.serdez_op.is_some() {
                    // deserialization reads conservatively, so being past the
                    // promised total is fine
                    assert!(rbc_snapshot >= *pbt_snapshot || *pbt_snapshot == usize::MAX);
                }
            }
        }
    }

    /// Shared epilogue for the skip paths.
    fn check_control_completion(&self, state: &XdState) -> bool {
        if ((state.input_control.remaining_count == 0) && state.input_control.eos_received)
            || ((state.output_control.remaining_count == 0) && state.output_control.eos_received)
        {
            info!(target: "ferry::xd", guid = self.guid, "iteration completed via control port");
            self.iteration_completed.store(true, Ordering::Release);
            self.poke_outputs(state, None);
            true
        } else {
            false
        }
    }
}

/// Batches byte-count updates per port and flushes them when the accumulated
/// span exceeds the threshold, when a non-adjacent span shows up, or when the
/// owner finishes its progress pass.
pub(crate) struct SequenceCache {
    read: bool,
    max_bytes: usize,
    entries: [Option<(usize, usize, usize)>; SequenceCache::MAX_ENTRIES], // (port, start, size)
}

impl SequenceCache {
    const MAX_ENTRIES: usize = 4;

    pub(crate) fn reads(max_bytes: usize) -> SequenceCache {
        SequenceCache {
            read: true,
            max_bytes,
            entries: [None; Self::MAX_ENTRIES],
        }
    }

    pub(crate) fn writes(max_bytes: usize) -> SequenceCache {
        SequenceCache {
            read: false,
            max_bytes,
            entries: [None; Self::MAX_ENTRIES],
        }
    }

    pub(crate) fn add_span(
        &mut self,
        xd: &XferDes,
        port_idx: Option<usize>,
        start: usize,
        size: usize,
    ) {
        let port_idx = match port_idx {
            Some(p) => p,
            None => return,
        };
        if size == 0 {
            return;
        }
        let mut free_slot = None;
        for slot in 0..Self::MAX_ENTRIES {
            match self.entries[slot] {
                Some((p, s, n)) if p == port_idx => {
                    if s + n == start {
                        if n + size >= self.max_bytes {
                            self.entries[slot] = None;
                            self.flush_one(xd, p, s, n + size);
                        } else {
                            self.entries[slot] = Some((p, s, n + size));
                        }
                    } else {
                        // non-adjacent: push out the old span
                        self.entries[slot] = Some((port_idx, start, size));
                        self.flush_one(xd, p, s, n);
                    }
                    return;
                }
                Some(_) => {}
                None => free_slot = Some(slot),
            }
        }
        match free_slot {
            Some(slot) => self.entries[slot] = Some((port_idx, start, size)),
            None => self.flush_one(xd, port_idx, start, size),
        }
    }

    fn flush_one(&self, xd: &XferDes, port: usize, start: usize, size: usize) {
        if self.read {
            xd.update_bytes_read(port, start, size);
        } else {
            xd.update_bytes_write(port, start, size);
        }
    }

    pub(crate) fn flush(&mut self, xd: &XferDes) {
        for slot in 0..Self::MAX_ENTRIES {
            if let Some((p, s, n)) = self.entries[slot].take() {
                self.flush_one(xd, p, s, n);
            }
        }
    }
}
