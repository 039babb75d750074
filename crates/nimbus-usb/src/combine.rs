use tracing::trace;

use crate::device::{Completion, CompletionSink, HandlerResult, UsbDevice};
use crate::packet::{CombinedRef, PacketState, UsbError, UsbPid};

/// Tuning knobs for the input combiner.
#[derive(Clone, Copy, Debug)]
pub struct CombinerConfig {
    /// An aggregate that reaches exactly this many bytes is flushed early
    /// when the closing packet requests a completion interrupt. Works around
    /// guest drivers that split large interrupt-completed reads at this
    /// boundary and stall if the pieces are merged past it.
    pub boundary_flush_size: usize,
}

impl Default for CombinerConfig {
    fn default() -> Self {
        Self {
            boundary_flush_size: 16348,
        }
    }
}

/// An ephemeral aggregate of queued bulk-IN packets submitted to the device
/// as one oversized read. Destroyed once its last member is removed.
#[derive(Debug)]
pub(crate) struct CombinedTransfer {
    pub(crate) id: u64,
    /// The member dispatched to the device; cancel notifications go through
    /// it alone.
    pub(crate) first: u64,
    /// Surviving member packet ids, in submission order.
    pub(crate) members: Vec<u64>,
    pub(crate) total: usize,
}

impl UsbDevice {
    /// Walks a pipelined bulk-IN endpoint's queue, merging consecutive
    /// queued packets into aggregates and flushing each aggregate to the
    /// device model as a single deferred read.
    ///
    /// A packet ends its aggregate (and forces a flush) when its size is not
    /// a whole number of max-size packets, when a short result would be an
    /// error for it, when nothing is queued behind it, or at the configured
    /// boundary size for interrupt-flagged packets. No packet is submitted
    /// past a flushed packet that must not end short: a transfer boundary
    /// there cannot be crossed speculatively.
    pub(crate) fn combine_input(&mut self, nr: u8, sink: &mut dyn CompletionSink) {
        let mut agg_ids: Vec<u64> = Vec::new();
        let mut agg_total = 0usize;
        let mut prev_short_not_ok: Option<bool> = None;
        let mut i = 0;
        loop {
            let ep = self.endpoints.get(UsbPid::In, nr);
            debug_assert!(ep.pipeline(), "combiner on non-pipelined endpoint");
            if i >= ep.queue_len() {
                break;
            }
            let state = ep.queue[i].state();
            if ep.halted() {
                // Fail everything still waiting; deferred work finishes on
                // its own.
                if state == PacketState::Queued {
                    let mut packet = self
                        .endpoints
                        .get_mut(UsbPid::In, nr)
                        .queue
                        .remove(i)
                        .expect("index in bounds");
                    packet.finish(Err(UsbError::Dropped));
                    sink.completed(packet);
                    continue;
                }
                i += 1;
                continue;
            }
            if state == PacketState::Async {
                prev_short_not_ok = Some(ep.queue[i].short_not_ok());
                i += 1;
                continue;
            }
            assert_eq!(state, PacketState::Queued, "corrupt endpoint queue");
            if prev_short_not_ok == Some(true) {
                break;
            }

            let packet = &ep.queue[i];
            let mps = ep.max_packet_size();
            assert!(mps > 0, "pipelined endpoint without max packet size");
            let short_not_ok = packet.short_not_ok();
            agg_ids.push(packet.id());
            agg_total += packet.size();

            let flush = packet.size() % mps != 0
                || !short_not_ok
                || i + 1 == ep.queue_len()
                || (agg_total == self.combiner_config().boundary_flush_size && packet.int_req());

            // The barrier applies only to a flushed transfer's closing
            // packet, never mid-aggregate.
            if flush {
                self.flush_aggregate(nr, &agg_ids, agg_total);
                agg_ids.clear();
                agg_total = 0;
                prev_short_not_ok = Some(short_not_ok);
            }
            i += 1;
        }
        debug_assert!(agg_ids.is_empty(), "aggregate left unflushed");
    }

    /// Submits one aggregate (or lone packet) to the device model as a
    /// single read and marks every member in flight. Pipelined dispatch must
    /// defer, or completions could reorder.
    fn flush_aggregate(&mut self, nr: u8, ids: &[u64], total: usize) {
        if ids.len() > 1 {
            let agg_id = self.next_combined_id;
            self.next_combined_id += 1;
            self.combined.push(CombinedTransfer {
                id: agg_id,
                first: ids[0],
                members: ids.to_vec(),
                total,
            });
            let ep = self.endpoints.get_mut(UsbPid::In, nr);
            for &member in ids {
                let idx = ep
                    .queue
                    .iter()
                    .position(|p| p.id() == member)
                    .expect("member queued");
                ep.queue[idx].combined = Some(CombinedRef { id: agg_id, total });
            }
            trace!(id = agg_id, members = ids.len(), total, "combined input packets");
        }

        let ep = self.endpoints.get_mut(UsbPid::In, nr);
        let idx = ep
            .queue
            .iter()
            .position(|p| p.id() == ids[0])
            .expect("representative queued");
        let mut rep = ep.queue.remove(idx).expect("index in bounds");
        let outcome = self.dispatch_data(&mut rep);
        assert!(
            matches!(outcome, HandlerResult::Pending),
            "pipelined dispatch must defer completion"
        );
        rep.set_state(PacketState::Async);
        self.endpoints.get_mut(UsbPid::In, nr).queue.insert(idx, rep);

        for &member in &ids[1..] {
            let ep = self.endpoints.get_mut(UsbPid::In, nr);
            let j = ep
                .queue
                .iter()
                .position(|p| p.id() == member)
                .expect("member queued");
            ep.queue[j].set_state(PacketState::Async);
        }
    }

    /// Distributes the result of a combined read across its members in
    /// submission order: each gets up to its requested size; the first short
    /// member carries the aggregate's terminal status, and anything after it
    /// is dropped from the queue untouched.
    pub(crate) fn complete_combined(
        &mut self,
        nr: u8,
        agg_id: u64,
        completing_id: u64,
        completion: Completion,
        sink: &mut dyn CompletionSink,
    ) {
        let pos = self
            .combined
            .iter()
            .position(|c| c.id == agg_id)
            .expect("live combined transfer");
        let agg = self.combined.remove(pos);
        assert_eq!(
            agg.first, completing_id,
            "combined completion must come from the representative member"
        );

        let (mut data, mut status): (Vec<u8>, Result<(), UsbError>) = match completion {
            Completion::In(d) => (d, Ok(())),
            Completion::Error(e) => {
                assert_ne!(e, UsbError::Nak, "deferred completion may not NAK");
                (Vec::new(), Err(e))
            }
            Completion::Out(_) => panic!("combined transfers are IN only"),
        };
        if data.len() > agg.total {
            status = Err(UsbError::Babble);
            data.truncate(agg.total);
        }

        // The aggregate's boundary semantics are those of its last member.
        let short_not_ok = {
            let ep = self.endpoints.get(UsbPid::In, nr);
            let last = *agg.members.last().expect("aggregate has members");
            ep.queue
                .iter()
                .find(|p| p.id() == last)
                .expect("member queued")
                .short_not_ok()
        };

        let count = agg.members.len();
        let mut offset = 0usize;
        let mut done = false;
        for (k, &member) in agg.members.iter().enumerate() {
            let ep = self.endpoints.get_mut(UsbPid::In, nr);
            let idx = ep
                .queue
                .iter()
                .position(|p| p.id() == member)
                .expect("member queued");
            let mut packet = ep.queue.remove(idx).expect("index in bounds");
            packet.combined = None;
            assert_eq!(packet.state(), PacketState::Async, "corrupt combined member");

            if done {
                packet.finish(Err(UsbError::Dropped));
                sink.completed(packet);
                continue;
            }

            let take = (data.len() - offset).min(packet.size());
            packet
                .copy_in(&data[offset..offset + take])
                .expect("take clamped to packet size");
            offset += take;
            let short = take < packet.size();
            if short {
                done = true;
            }
            let res = if short || k + 1 == count {
                status.map(|_| take)
            } else {
                Ok(take)
            };
            packet.set_short_not_ok(short_not_ok);
            packet.finish(res);
            self.complete_one(packet, sink);
        }

        // More reads may have queued up behind the aggregate.
        self.combine_input(nr, sink);
    }

    /// Unlinks a canceled packet from its aggregate, destroying the
    /// aggregate once empty. Returns whether the packet was the
    /// representative (whose cancellation must reach the device model).
    pub(crate) fn remove_combined_member(&mut self, agg_id: u64, packet_id: u64) -> bool {
        let pos = self
            .combined
            .iter()
            .position(|c| c.id == agg_id)
            .expect("live combined transfer");
        let agg = &mut self.combined[pos];
        let was_representative = agg.first == packet_id;
        agg.members.retain(|&m| m != packet_id);
        if agg.members.is_empty() {
            self.combined.remove(pos);
        }
        was_representative
    }
}
