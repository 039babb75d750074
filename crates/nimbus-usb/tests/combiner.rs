mod util;

use nimbus_usb::{Completion, CombinerConfig, UsbDevice, UsbError, UsbPacket, UsbPid};
use util::*;

fn pipelined_device() -> UsbDevice {
    let mut dev = attached_device();
    configure_bulk(&mut dev, UsbPid::In, 1, 64, true);
    dev
}

fn bulk_in(id: u64, len: usize) -> UsbPacket {
    in_packet(id, 1, len).with_short_not_ok(true)
}

/// Puts one read in flight and parks `sizes` behind it, so that completing
/// the head lets the combiner see them all at once. The last parked packet
/// tolerates a short read, like the trailing packet of a guest transfer, so
/// it closes the aggregate. Returns the head's id.
fn queue_behind_head(
    dev: &mut UsbDevice,
    sink: &mut Vec<UsbPacket>,
    sizes: &[usize],
) -> u64 {
    model_mut(dev).data_actions.push_back(DataAction::Defer);
    let head = expect_pending(dev.submit(bulk_in(1, 64), sink));
    for (i, &len) in sizes.iter().enumerate() {
        let id = 2 + i as u64;
        let packet = if i + 1 == sizes.len() {
            in_packet(id, 1, len)
        } else {
            bulk_in(id, len)
        };
        let _ = expect_pending(dev.submit(packet, sink));
    }
    // Nothing past the head's short-read boundary was dispatched.
    assert_eq!(model(dev).dispatched, vec![64]);
    head
}

#[test]
fn queued_reads_combine_into_one_dispatch() {
    let mut dev = pipelined_device();
    let mut sink: Vec<UsbPacket> = Vec::new();
    let head = queue_behind_head(&mut dev, &mut sink, &[128, 128, 64]);

    model_mut(&mut dev).data_actions.push_back(DataAction::Defer);
    dev.complete(head, Completion::In(vec![0; 64]), &mut sink);

    // The three queued reads went out as a single 320-byte request.
    assert_eq!(model(&dev).dispatched, vec![64, 320]);
    assert_eq!(sink.len(), 1);
    assert_eq!(sink[0].id(), head);

    dev.complete(2, Completion::In((0..255).cycle().take(320).map(|b| b as u8).collect()), &mut sink);
    assert_eq!(sink.len(), 4);
    assert_eq!(sink[1].id(), 2);
    assert_eq!(sink[1].result(), Some(Ok(128)));
    assert_eq!(sink[2].id(), 3);
    assert_eq!(sink[2].result(), Some(Ok(128)));
    assert_eq!(sink[3].id(), 4);
    assert_eq!(sink[3].result(), Some(Ok(64)));
    assert_eq!(dev.ep(UsbPid::In, 1).queue_len(), 0);
    assert!(!dev.ep(UsbPid::In, 1).halted());
}

#[test]
fn aggregate_spans_consecutive_short_not_ok_members() {
    let mut dev = pipelined_device();
    let mut sink: Vec<UsbPacket> = Vec::new();

    model_mut(&mut dev).data_actions.push_back(DataAction::Defer);
    let head = expect_pending(dev.submit(bulk_in(1, 64), &mut sink));
    for id in 2..=4 {
        let _ = expect_pending(dev.submit(bulk_in(id, 128), &mut sink));
    }

    // Every queued read tolerates no short result; merging must still walk
    // through all of them, with the queue end closing the aggregate.
    model_mut(&mut dev).data_actions.push_back(DataAction::Defer);
    dev.complete(head, Completion::In(vec![0; 64]), &mut sink);
    assert_eq!(model(&dev).dispatched, vec![64, 384]);
    assert_eq!(dev.ep(UsbPid::In, 1).queue_len(), 3);
}

#[test]
fn combined_data_distributes_in_submission_order() {
    let mut dev = pipelined_device();
    let mut sink: Vec<UsbPacket> = Vec::new();
    let head = queue_behind_head(&mut dev, &mut sink, &[128, 64]);

    model_mut(&mut dev).data_actions.push_back(DataAction::Defer);
    dev.complete(head, Completion::In(vec![0; 64]), &mut sink);

    let data: Vec<u8> = (0..192u32).map(|b| b as u8).collect();
    dev.complete(2, Completion::In(data.clone()), &mut sink);
    assert_eq!(sink[1].payload(), &data[..128]);
    assert_eq!(sink[2].payload(), &data[128..]);
}

#[test]
fn short_combined_result_drops_trailing_members() {
    let mut dev = pipelined_device();
    let mut sink: Vec<UsbPacket> = Vec::new();
    let head = queue_behind_head(&mut dev, &mut sink, &[128, 128, 64]);

    model_mut(&mut dev).data_actions.push_back(DataAction::Defer);
    dev.complete(head, Completion::In(vec![0; 64]), &mut sink);

    // 150 of 320 bytes: full first member, short second, dropped third.
    dev.complete(2, Completion::In(vec![9; 150]), &mut sink);
    assert_eq!(sink.len(), 4);
    assert_eq!(sink[1].result(), Some(Ok(128)));
    assert_eq!(sink[2].result(), Some(Ok(22)));
    assert_eq!(sink[3].result(), Some(Err(UsbError::Dropped)));
    // The last member tolerated short reads, so the short does not halt.
    assert!(!dev.ep(UsbPid::In, 1).halted());
}

#[test]
fn combined_error_fails_first_member_and_halts() {
    let mut dev = pipelined_device();
    let mut sink: Vec<UsbPacket> = Vec::new();
    let head = queue_behind_head(&mut dev, &mut sink, &[128, 64]);

    model_mut(&mut dev).data_actions.push_back(DataAction::Defer);
    dev.complete(head, Completion::In(vec![0; 64]), &mut sink);

    dev.complete(2, Completion::Error(UsbError::Stall), &mut sink);
    assert_eq!(sink.len(), 3);
    assert_eq!(sink[1].result(), Some(Err(UsbError::Stall)));
    assert_eq!(sink[2].result(), Some(Err(UsbError::Dropped)));
    assert!(dev.ep(UsbPid::In, 1).halted());
}

#[test]
fn odd_sized_read_flushes_alone() {
    let mut dev = pipelined_device();
    let mut sink: Vec<UsbPacket> = Vec::new();

    model_mut(&mut dev).data_actions.push_back(DataAction::Defer);
    let head = expect_pending(dev.submit(bulk_in(1, 64), &mut sink));
    // 100 is not a multiple of the 64-byte max packet size, so it can never
    // be merged with whatever comes after it.
    let _ = expect_pending(dev.submit(in_packet(2, 1, 100), &mut sink));
    let _ = expect_pending(dev.submit(in_packet(3, 1, 128), &mut sink));

    model_mut(&mut dev).data_actions.push_back(DataAction::Defer);
    model_mut(&mut dev).data_actions.push_back(DataAction::Defer);
    dev.complete(head, Completion::In(vec![0; 64]), &mut sink);
    assert_eq!(model(&dev).dispatched, vec![64, 100, 128]);
}

#[test]
fn boundary_flush_splits_interrupt_flagged_aggregate() {
    let mut dev = attached_device().with_combiner_config(CombinerConfig {
        boundary_flush_size: 256,
    });
    configure_bulk(&mut dev, UsbPid::In, 1, 64, true);
    let mut sink: Vec<UsbPacket> = Vec::new();

    model_mut(&mut dev).data_actions.push_back(DataAction::Defer);
    let head = expect_pending(dev.submit(bulk_in(1, 64), &mut sink));
    let _ = expect_pending(dev.submit(bulk_in(2, 128), &mut sink));
    let _ = expect_pending(dev.submit(bulk_in(3, 128).with_int_req(true), &mut sink));
    let _ = expect_pending(dev.submit(bulk_in(4, 64), &mut sink));

    model_mut(&mut dev).data_actions.push_back(DataAction::Defer);
    dev.complete(head, Completion::In(vec![0; 64]), &mut sink);

    // The aggregate closed at the 256-byte boundary; the packet behind the
    // boundary stays queued behind its short-read barrier.
    assert_eq!(model(&dev).dispatched, vec![64, 256]);
    assert_eq!(dev.ep(UsbPid::In, 1).queue_len(), 3);
}

#[test]
fn default_boundary_matches_known_guest_quirk() {
    assert_eq!(CombinerConfig::default().boundary_flush_size, 16348);
}

#[test]
fn canceling_nonrepresentative_member_skips_device_model() {
    let mut dev = pipelined_device();
    let mut sink: Vec<UsbPacket> = Vec::new();
    let head = queue_behind_head(&mut dev, &mut sink, &[128, 128]);

    model_mut(&mut dev).data_actions.push_back(DataAction::Defer);
    dev.complete(head, Completion::In(vec![0; 64]), &mut sink);

    let p = dev.cancel(3);
    assert_eq!(p.id(), 3);
    assert!(model(&dev).canceled.is_empty());
}

#[test]
fn canceling_representative_member_notifies_device_model() {
    let mut dev = pipelined_device();
    let mut sink: Vec<UsbPacket> = Vec::new();
    let head = queue_behind_head(&mut dev, &mut sink, &[128, 128]);

    model_mut(&mut dev).data_actions.push_back(DataAction::Defer);
    dev.complete(head, Completion::In(vec![0; 64]), &mut sink);

    let p = dev.cancel(2);
    assert_eq!(p.id(), 2);
    assert_eq!(model(&dev).canceled, vec![2]);
}
