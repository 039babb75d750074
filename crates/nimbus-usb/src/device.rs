use std::any::Any;

use tracing::{debug, trace};

use crate::combine::{CombinedTransfer, CombinerConfig};
use crate::control::ControlTransfer;
use crate::endpoint::{Endpoint, EndpointTable, EndpointType};
use crate::packet::{PacketState, UsbError, UsbPacket, UsbPid, UsbResult};

pub const MAX_INTERFACES: usize = 16;

/// Parsed 8-byte control setup header.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SetupPacket {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl SetupPacket {
    pub fn parse(bytes: [u8; 8]) -> Self {
        Self {
            request_type: bytes[0],
            request: bytes[1],
            value: u16::from_le_bytes([bytes[2], bytes[3]]),
            index: u16::from_le_bytes([bytes[4], bytes[5]]),
            length: u16::from_le_bytes([bytes[6], bytes[7]]),
        }
    }

    pub fn to_bytes(self) -> [u8; 8] {
        let value = self.value.to_le_bytes();
        let index = self.index.to_le_bytes();
        let length = self.length.to_le_bytes();
        [
            self.request_type,
            self.request,
            value[0],
            value[1],
            index[0],
            index[1],
            length[0],
            length[1],
        ]
    }

    /// Direction bit of the request: set means device-to-host.
    pub fn is_device_to_host(&self) -> bool {
        self.request_type & 0x80 != 0
    }
}

/// Attachment/lifecycle state of a device.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DeviceState {
    NotAttached,
    Attached,
    Default,
    Suspended,
}

/// Two-phase result of a device-model dispatch: finished now, or the model
/// will call `UsbDevice::complete` later from the event loop.
#[must_use]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HandlerResult {
    Done(UsbResult),
    Pending,
}

/// What a deferred operation produced, reported through
/// `UsbDevice::complete`.
#[derive(Debug)]
pub enum Completion {
    /// Device-to-host payload of the deferred transfer.
    In(Vec<u8>),
    /// Bytes the device accepted for a host-to-device transfer.
    Out(usize),
    /// The deferred transfer failed terminally. NAK is not a valid deferred
    /// outcome.
    Error(UsbError),
}

/// Capability set every concrete device model implements. The engine knows
/// nothing else about the device.
pub trait UsbDeviceModel {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;

    /// Processes one control request on endpoint 0. `data` is the data-stage
    /// scratch: for device-to-host requests the model writes its response
    /// there and returns the length; for host-to-device requests it holds
    /// the received payload.
    fn handle_control(
        &mut self,
        packet: &mut UsbPacket,
        req: SetupPacket,
        data: &mut [u8],
    ) -> HandlerResult;

    /// Processes one transfer on a non-zero endpoint. The model moves bytes
    /// through the packet's copy helpers.
    fn handle_data(&mut self, packet: &mut UsbPacket) -> HandlerResult;

    /// Aborts an operation the model previously deferred.
    fn cancel_packet(&mut self, packet: &mut UsbPacket) {
        let _ = packet;
    }

    fn attached(&mut self) {}
    fn detached(&mut self) {}
    fn reset(&mut self) {}
}

/// Receives packets that finish outside the submit call: deferred
/// completions and packets dropped while queued.
pub trait CompletionSink {
    fn completed(&mut self, packet: UsbPacket);
}

impl CompletionSink for Vec<UsbPacket> {
    fn completed(&mut self, packet: UsbPacket) {
        self.push(packet);
    }
}

/// Outcome of a submission.
#[must_use]
#[derive(Debug)]
pub enum Submitted {
    /// The packet finished synchronously; its result is inside. A NAK comes
    /// back this way with the packet still in `Setup` state, ready to retry.
    Complete(UsbPacket),
    /// The packet is queued or in flight under this id; it will come back
    /// through the completion sink, or via `cancel`.
    Pending(u64),
}

/// An emulated USB device: a concrete device model plus the
/// device-independent transaction state the engine drives: lifecycle,
/// endpoint queues, the control-transfer scratch and any live combined
/// transfers.
pub struct UsbDevice {
    model: Box<dyn UsbDeviceModel>,
    state: DeviceState,
    address: u8,
    configuration: u8,
    altsetting: [u8; MAX_INTERFACES],
    pub(crate) control: ControlTransfer,
    pub(crate) endpoints: EndpointTable,
    pub(crate) combined: Vec<CombinedTransfer>,
    pub(crate) next_combined_id: u64,
    combiner_config: CombinerConfig,
}

impl UsbDevice {
    pub fn new(model: Box<dyn UsbDeviceModel>) -> Self {
        Self {
            model,
            state: DeviceState::NotAttached,
            address: 0,
            configuration: 0,
            altsetting: [0; MAX_INTERFACES],
            control: ControlTransfer::new(),
            endpoints: EndpointTable::new(),
            combined: Vec::new(),
            next_combined_id: 1,
            combiner_config: CombinerConfig::default(),
        }
    }

    pub fn with_combiner_config(mut self, config: CombinerConfig) -> Self {
        self.combiner_config = config;
        self
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn set_address(&mut self, address: u8) {
        self.address = address & 0x7f;
    }

    pub fn configuration(&self) -> u8 {
        self.configuration
    }

    pub fn set_configuration(&mut self, configuration: u8) {
        self.configuration = configuration;
    }

    pub fn altsetting(&self, ifnum: usize) -> u8 {
        self.altsetting[ifnum]
    }

    pub fn set_altsetting(&mut self, ifnum: usize, alt: u8) {
        self.altsetting[ifnum] = alt;
    }

    pub fn combiner_config(&self) -> CombinerConfig {
        self.combiner_config
    }

    pub fn ep(&self, pid: UsbPid, nr: u8) -> &Endpoint {
        self.endpoints.get(pid, nr)
    }

    pub fn ep_mut(&mut self, pid: UsbPid, nr: u8) -> &mut Endpoint {
        self.endpoints.get_mut(pid, nr)
    }

    pub fn model(&self) -> &dyn UsbDeviceModel {
        self.model.as_ref()
    }

    pub fn model_mut(&mut self) -> &mut dyn UsbDeviceModel {
        self.model.as_mut()
    }

    // ---- Lifecycle -------------------------------------------------------

    pub fn attach(&mut self) {
        assert_eq!(
            self.state,
            DeviceState::NotAttached,
            "attach of already-attached device"
        );
        self.state = DeviceState::Attached;
        self.model.attached();
        trace!("device attached");
    }

    /// Unplugs the device, unwinding every outstanding packet. The canceled
    /// packets come back so the controller can retire them.
    pub fn detach(&mut self) -> Vec<UsbPacket> {
        assert_ne!(
            self.state,
            DeviceState::NotAttached,
            "detach of unattached device"
        );
        let canceled = self.cancel_all();
        self.model.detached();
        self.state = DeviceState::NotAttached;
        self.address = 0;
        self.configuration = 0;
        self.altsetting = [0; MAX_INTERFACES];
        self.control.reset();
        self.endpoints.reset();
        trace!(canceled = canceled.len(), "device detached");
        canceled
    }

    /// Bus reset: unwinds outstanding packets, clears the address and the
    /// control state, rebuilds the endpoint table and notifies the model.
    pub fn reset(&mut self) -> Vec<UsbPacket> {
        assert_ne!(
            self.state,
            DeviceState::NotAttached,
            "reset of unattached device"
        );
        let canceled = self.cancel_all();
        self.address = 0;
        self.state = DeviceState::Default;
        self.control.reset();
        self.endpoints.reset();
        self.model.reset();
        canceled
    }

    pub fn suspend(&mut self) {
        assert_eq!(self.state, DeviceState::Default, "suspend outside DEFAULT");
        self.state = DeviceState::Suspended;
    }

    pub fn wakeup(&mut self) {
        assert_eq!(
            self.state,
            DeviceState::Suspended,
            "wakeup of device that is not suspended"
        );
        self.state = DeviceState::Default;
    }

    // ---- Packet entry points ---------------------------------------------

    /// Submits one packet to its target endpoint.
    ///
    /// An empty queue (or a pipelined endpoint) dispatches immediately;
    /// otherwise the packet waits its turn behind the work already queued.
    /// Pipelined bulk-IN endpoints route through the input combiner instead
    /// of dispatching packets one at a time.
    pub fn submit(&mut self, mut packet: UsbPacket, sink: &mut dyn CompletionSink) -> Submitted {
        packet.begin();

        if self.state == DeviceState::NotAttached {
            packet.finish(Err(UsbError::NoDevice));
            return Submitted::Complete(packet);
        }

        let pid = packet.pid();
        let nr = packet.ep_nr();
        let id = packet.id();

        if pid == UsbPid::In && nr != 0 {
            let ep = self.endpoints.get(UsbPid::In, nr);
            if ep.pipeline() && ep.ty() == EndpointType::Bulk {
                packet.set_state(PacketState::Queued);
                self.endpoints.get_mut(UsbPid::In, nr).queue.push_back(packet);
                self.combine_input(nr, sink);
                return Submitted::Pending(id);
            }
        }

        let ep = self.endpoints.get(pid, nr);
        if ep.queue.is_empty() || ep.pipeline() {
            match self.process_one(&mut packet) {
                HandlerResult::Pending => {
                    packet.set_state(PacketState::Async);
                    self.endpoints.get_mut(pid, nr).queue.push_back(packet);
                    Submitted::Pending(id)
                }
                HandlerResult::Done(res) => {
                    // A pipelined endpoint with packets in flight must defer,
                    // or completions could reorder.
                    let ep = self.endpoints.get(pid, nr);
                    assert!(
                        !ep.pipeline() || ep.queue.is_empty(),
                        "pipelined endpoint completed synchronously with packets in flight"
                    );
                    if res == Err(UsbError::Nak) {
                        packet.nak();
                    } else {
                        packet.finish(res);
                        self.apply_halt_rule(&packet);
                    }
                    Submitted::Complete(packet)
                }
            }
        } else {
            packet.set_state(PacketState::Queued);
            self.endpoints.get_mut(pid, nr).queue.push_back(packet);
            Submitted::Pending(id)
        }
    }

    /// Reports the result of a deferred packet. Called exactly once per
    /// packet the device model answered with `Pending`.
    ///
    /// After handing the finished packet to the sink, queued work behind it
    /// is dispatched until something defers again or the queue empties.
    pub fn complete(&mut self, id: u64, completion: Completion, sink: &mut dyn CompletionSink) {
        let (pid, nr, idx) = self
            .find_packet(id)
            .unwrap_or_else(|| panic!("completion for unknown packet {id}"));

        if let Some(combined) = self.endpoints.get(pid, nr).queue[idx].combined {
            self.complete_combined(nr, combined.id, id, completion, sink);
            return;
        }

        let ep = self.endpoints.get_mut(pid, nr);
        if !ep.pipeline() {
            assert_eq!(idx, 0, "deferred completion out of submission order");
        }
        let mut packet = ep.queue.remove(idx).expect("packet located above");
        assert_eq!(
            packet.state(),
            PacketState::Async,
            "completing packet {id} that was not deferred"
        );

        if packet.ep_nr() == 0 {
            self.control_async_complete(&mut packet, completion);
        } else {
            Self::apply_data_completion(&mut packet, completion);
        }

        self.complete_one(packet, sink);
        self.drain_queue(pid, nr, sink);
    }

    /// Withdraws an in-flight packet. Queued packets are unlinked; deferred
    /// ones additionally have the device model's cancel capability invoked
    /// (for a combined transfer, only on its representative member).
    pub fn cancel(&mut self, id: u64) -> UsbPacket {
        let (pid, nr, idx) = self
            .find_packet(id)
            .unwrap_or_else(|| panic!("cancel of packet {id} that is not in flight"));

        let ep = self.endpoints.get_mut(pid, nr);
        let mut packet = ep.queue.remove(idx).expect("packet located above");
        let was_async = packet.state() == PacketState::Async;
        packet.set_state(PacketState::Canceled);

        let notify_model = match packet.combined.take() {
            Some(combined) => self.remove_combined_member(combined.id, id) && was_async,
            None => was_async,
        };
        if notify_model {
            self.model.cancel_packet(&mut packet);
        }
        packet
    }

    // ---- Dispatch machinery ----------------------------------------------

    /// Runs one packet against the device model: the control-transfer driver
    /// for endpoint 0, the model's data handler otherwise.
    pub(crate) fn process_one(&mut self, packet: &mut UsbPacket) -> HandlerResult {
        if packet.ep_nr() == 0 {
            self.process_control(packet)
        } else {
            let res = self.model.handle_data(packet);
            if let HandlerResult::Done(Ok(n)) = res {
                if packet.pid() == UsbPid::In && n > packet.size() {
                    debug!(
                        id = packet.id(),
                        n,
                        size = packet.size(),
                        "device overran IN transfer"
                    );
                    return HandlerResult::Done(Err(UsbError::Babble));
                }
            }
            res
        }
    }

    /// Applies a deferred result to a non-control packet.
    pub(crate) fn apply_data_completion(packet: &mut UsbPacket, completion: Completion) {
        match completion {
            Completion::In(data) => {
                if data.len() > packet.size() {
                    packet.finish(Err(UsbError::Babble));
                } else {
                    packet.copy_in(&data).expect("length checked above");
                    packet.finish(Ok(data.len()));
                }
            }
            Completion::Out(n) => packet.finish(Ok(n)),
            Completion::Error(e) => {
                assert_ne!(e, UsbError::Nak, "deferred completion may not NAK");
                packet.finish(Err(e));
            }
        }
    }

    /// A transfer that failed, or ended short when short is an error for it,
    /// halts its endpoint.
    fn apply_halt_rule(&mut self, packet: &UsbPacket) {
        let short = packet
            .result()
            .is_some_and(|r| matches!(r, Ok(n) if n < packet.size()));
        let failed = packet.result().is_some_and(|r| r.is_err());
        if failed || (packet.short_not_ok() && short) {
            self.endpoints
                .get_mut(packet.pid(), packet.ep_nr())
                .set_halted(true);
        }
    }

    /// Retires one finished packet: applies the halt rule and hands it to
    /// the sink.
    pub(crate) fn complete_one(&mut self, packet: UsbPacket, sink: &mut dyn CompletionSink) {
        debug_assert_eq!(packet.state(), PacketState::Complete);
        self.apply_halt_rule(&packet);
        sink.completed(packet);
    }

    /// Dispatches queued packets in order until one defers, one is NAKed,
    /// or the queue empties. A NAKed packet stays queued at the head for the
    /// next drain pass. A halted endpoint drains instead: still-queued
    /// packets are failed with the dropped status so the controller can
    /// retire them.
    pub(crate) fn drain_queue(&mut self, pid: UsbPid, nr: u8, sink: &mut dyn CompletionSink) {
        if nr != 0 {
            let ep = self.endpoints.get(pid, nr);
            if ep.pipeline() && ep.ty() == EndpointType::Bulk && pid == UsbPid::In {
                self.combine_input(nr, sink);
                return;
            }
        }
        loop {
            let ep = self.endpoints.get_mut(pid, nr);
            let Some(head) = ep.queue.front() else {
                break;
            };
            if ep.halted() {
                let mut packet = ep.queue.pop_front().expect("head exists");
                packet.finish(Err(UsbError::Dropped));
                sink.completed(packet);
                continue;
            }
            if head.state() == PacketState::Async {
                break;
            }
            assert_eq!(head.state(), PacketState::Queued, "corrupt endpoint queue");
            let mut packet = ep.queue.pop_front().expect("head exists");
            match self.process_one(&mut packet) {
                HandlerResult::Pending => {
                    packet.set_state(PacketState::Async);
                    self.endpoints.get_mut(pid, nr).queue.push_front(packet);
                    break;
                }
                HandlerResult::Done(res) => {
                    if res == Err(UsbError::Nak) {
                        // Endpoint not ready; retry on the next drain pass.
                        self.endpoints.get_mut(pid, nr).queue.push_front(packet);
                        break;
                    }
                    packet.finish(res);
                    self.complete_one(packet, sink);
                }
            }
        }
    }

    /// Locates an in-flight packet by id across all endpoint queues.
    fn find_packet(&self, id: u64) -> Option<(UsbPid, u8, usize)> {
        for nr in 0..=crate::endpoint::MAX_ENDPOINT_NR {
            let pids: &[UsbPid] = if nr == 0 {
                &[UsbPid::Setup]
            } else {
                &[UsbPid::In, UsbPid::Out]
            };
            for &pid in pids {
                let ep = self.endpoints.get(pid, nr);
                if let Some(idx) = ep.queue.iter().position(|p| p.id() == id) {
                    return Some((pid, nr, idx));
                }
            }
        }
        None
    }

    fn cancel_all(&mut self) -> Vec<UsbPacket> {
        let mut ids = Vec::new();
        for nr in 0..=crate::endpoint::MAX_ENDPOINT_NR {
            let pids: &[UsbPid] = if nr == 0 {
                &[UsbPid::Setup]
            } else {
                &[UsbPid::In, UsbPid::Out]
            };
            for &pid in pids {
                ids.extend(self.endpoints.get(pid, nr).queue.iter().map(|p| p.id()));
            }
        }
        ids.into_iter().map(|id| self.cancel(id)).collect()
    }

    /// Dispatches `handle_control` with the scratch buffer split out of
    /// `self`, so the model can see both the packet and the data stage.
    pub(crate) fn dispatch_control(
        &mut self,
        packet: &mut UsbPacket,
        req: SetupPacket,
    ) -> HandlerResult {
        let len = self.control.len;
        self.model
            .handle_control(packet, req, &mut self.control.data[..len])
    }

    /// Dispatches `handle_data` for the combiner, which manages queue
    /// membership itself.
    pub(crate) fn dispatch_data(&mut self, packet: &mut UsbPacket) -> HandlerResult {
        self.model.handle_data(packet)
    }
}
