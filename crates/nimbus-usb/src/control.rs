use tracing::debug;

use crate::device::{Completion, HandlerResult, SetupPacket, UsbDevice};
use crate::packet::{UsbError, UsbPacket, UsbPid};

/// Size of the per-device data-stage scratch buffer. A declared control
/// length beyond this stalls the request.
pub const CONTROL_BUFFER_SIZE: usize = 4096;

/// Stage of the control-transfer state machine on endpoint 0.
///
/// `Setup` marks a device-to-host request whose handler deferred at the
/// SETUP token; `Param` is the single-packet shortcut where the 8-byte
/// header arrives out-of-band with the packet.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ControlStage {
    Idle,
    Setup,
    Data,
    Ack,
    Param,
}

/// Per-device control-transfer scratch: the only state that survives across
/// the packets of one logical control request.
#[derive(Debug)]
pub(crate) struct ControlTransfer {
    pub(crate) stage: ControlStage,
    pub(crate) setup: SetupPacket,
    /// Negotiated data-stage length; clamped to what the device actually
    /// produced.
    pub(crate) len: usize,
    /// Running index into the data-stage buffer.
    pub(crate) index: usize,
    /// Whether the device handler already ran for the current
    /// host-to-device request.
    pub(crate) dispatched: bool,
    pub(crate) data: Vec<u8>,
}

impl ControlTransfer {
    pub(crate) fn new() -> Self {
        Self {
            stage: ControlStage::Idle,
            setup: SetupPacket::default(),
            len: 0,
            index: 0,
            dispatched: false,
            data: vec![0u8; CONTROL_BUFFER_SIZE],
        }
    }

    pub(crate) fn reset(&mut self) {
        self.stage = ControlStage::Idle;
        self.setup = SetupPacket::default();
        self.len = 0;
        self.index = 0;
        self.dispatched = false;
    }
}

impl UsbDevice {
    /// Current stage of the endpoint-0 state machine.
    pub fn control_stage(&self) -> ControlStage {
        self.control.stage
    }

    /// Endpoint-0 dispatch: routes a packet through the three-stage state
    /// machine, or the single-packet parameter shortcut when the header
    /// rides along with the packet.
    pub(crate) fn process_control(&mut self, packet: &mut UsbPacket) -> HandlerResult {
        if let Some(raw) = packet.parameter() {
            return self.do_parameter(packet, raw);
        }
        match packet.pid() {
            UsbPid::Setup => self.do_token_setup(packet),
            UsbPid::In => self.do_token_in(packet),
            UsbPid::Out => self.do_token_out(packet),
        }
    }

    fn do_token_setup(&mut self, packet: &mut UsbPacket) -> HandlerResult {
        if packet.size() != 8 {
            debug!(size = packet.size(), "SETUP packet is not 8 bytes");
            return HandlerResult::Done(Err(UsbError::Stall));
        }
        let mut raw = [0u8; 8];
        packet
            .copy_out(&mut raw)
            .expect("size checked above");
        let setup = SetupPacket::parse(raw);

        self.control.setup = setup;
        self.control.len = setup.length as usize;
        self.control.index = 0;
        self.control.dispatched = false;

        if self.control.len > CONTROL_BUFFER_SIZE {
            debug!(len = self.control.len, "control data stage exceeds scratch");
            return HandlerResult::Done(Err(UsbError::Stall));
        }

        if setup.is_device_to_host() {
            match self.dispatch_control(packet, setup) {
                HandlerResult::Pending => {
                    self.control.stage = ControlStage::Setup;
                    HandlerResult::Pending
                }
                HandlerResult::Done(Err(e)) => HandlerResult::Done(Err(e)),
                HandlerResult::Done(Ok(n)) => {
                    if n < self.control.len {
                        self.control.len = n;
                    }
                    self.control.stage = if self.control.len == 0 {
                        ControlStage::Ack
                    } else {
                        ControlStage::Data
                    };
                    HandlerResult::Done(Ok(8))
                }
            }
        } else {
            self.control.stage = if self.control.len == 0 {
                ControlStage::Ack
            } else {
                ControlStage::Data
            };
            HandlerResult::Done(Ok(8))
        }
    }

    fn do_token_in(&mut self, packet: &mut UsbPacket) -> HandlerResult {
        let setup = self.control.setup;
        match self.control.stage {
            ControlStage::Ack => {
                if !setup.is_device_to_host() && !self.control.dispatched {
                    // Zero-length host-to-device request: the handler runs
                    // at the status stage.
                    self.control.dispatched = true;
                    match self.dispatch_control(packet, setup) {
                        HandlerResult::Pending => return HandlerResult::Pending,
                        HandlerResult::Done(res) => {
                            self.control.stage = ControlStage::Idle;
                            return HandlerResult::Done(res.map(|_| 0));
                        }
                    }
                }
                if !setup.is_device_to_host() {
                    self.control.stage = ControlStage::Idle;
                }
                HandlerResult::Done(Ok(0))
            }
            ControlStage::Data => {
                if setup.is_device_to_host() {
                    let len = (self.control.len - self.control.index).min(packet.size());
                    packet
                        .copy_in(&self.control.data[self.control.index..self.control.index + len])
                        .expect("len clamped to packet size");
                    self.control.index += len;
                    if self.control.index >= self.control.len {
                        self.control.stage = ControlStage::Ack;
                    }
                    HandlerResult::Done(Ok(len))
                } else {
                    debug!("IN token during host-to-device data stage");
                    self.control.stage = ControlStage::Idle;
                    HandlerResult::Done(Err(UsbError::Stall))
                }
            }
            stage => {
                debug!(?stage, "unexpected IN token on endpoint 0");
                HandlerResult::Done(Err(UsbError::Stall))
            }
        }
    }

    fn do_token_out(&mut self, packet: &mut UsbPacket) -> HandlerResult {
        let setup = self.control.setup;
        match self.control.stage {
            ControlStage::Ack => {
                if setup.is_device_to_host() {
                    // Status stage of a device-to-host transfer.
                    self.control.stage = ControlStage::Idle;
                }
                // Otherwise ignore additional output.
                HandlerResult::Done(Ok(0))
            }
            ControlStage::Data => {
                if !setup.is_device_to_host() {
                    let len = (self.control.len - self.control.index).min(packet.size());
                    let index = self.control.index;
                    packet
                        .copy_out(&mut self.control.data[index..index + len])
                        .expect("len clamped to packet size");
                    self.control.index += len;
                    if self.control.index >= self.control.len {
                        // All payload bytes arrived; run the handler now.
                        self.control.dispatched = true;
                        match self.dispatch_control(packet, setup) {
                            HandlerResult::Pending => return HandlerResult::Pending,
                            HandlerResult::Done(Err(e)) => {
                                self.control.stage = ControlStage::Idle;
                                return HandlerResult::Done(Err(e));
                            }
                            HandlerResult::Done(Ok(_)) => {
                                self.control.stage = ControlStage::Ack;
                            }
                        }
                    }
                    HandlerResult::Done(Ok(len))
                } else {
                    debug!("OUT token during device-to-host data stage");
                    self.control.stage = ControlStage::Idle;
                    HandlerResult::Done(Err(UsbError::Stall))
                }
            }
            stage => {
                debug!(?stage, "unexpected OUT token on endpoint 0");
                HandlerResult::Done(Err(UsbError::Stall))
            }
        }
    }

    /// Single-packet control shortcut: the 8-byte header arrives out-of-band
    /// with the packet, and for a device-to-host request the response is
    /// copied straight into it.
    fn do_parameter(&mut self, packet: &mut UsbPacket, raw: [u8; 8]) -> HandlerResult {
        let setup = SetupPacket::parse(raw);
        self.control.setup = setup;
        self.control.stage = ControlStage::Param;
        self.control.len = setup.length as usize;
        self.control.index = 0;
        self.control.dispatched = false;

        if self.control.len > CONTROL_BUFFER_SIZE {
            debug!(len = self.control.len, "control data stage exceeds scratch");
            return HandlerResult::Done(Err(UsbError::Stall));
        }
        // The packet is the whole data stage here.
        if self.control.len > packet.size() {
            self.control.len = packet.size();
        }

        if packet.pid() == UsbPid::Out {
            let len = self.control.len;
            packet
                .copy_out(&mut self.control.data[..len])
                .expect("len clamped to packet size");
        }

        match self.dispatch_control(packet, setup) {
            HandlerResult::Pending => HandlerResult::Pending,
            HandlerResult::Done(Err(e)) => HandlerResult::Done(Err(e)),
            HandlerResult::Done(Ok(n)) => {
                if n < self.control.len {
                    self.control.len = n;
                }
                let len = self.control.len;
                if packet.pid() == UsbPid::In {
                    packet
                        .copy_in(&self.control.data[..len])
                        .expect("len clamped to packet size");
                }
                HandlerResult::Done(Ok(len))
            }
        }
    }

    /// Deferred-completion re-entry for endpoint-0 packets: applies the
    /// result the model reported and advances the state machine the same way
    /// the synchronous paths above would have.
    pub(crate) fn control_async_complete(
        &mut self,
        packet: &mut UsbPacket,
        completion: Completion,
    ) {
        match completion {
            Completion::Error(e) => {
                assert_ne!(e, UsbError::Nak, "deferred completion may not NAK");
                packet.finish(Err(e));
            }
            Completion::In(data) => match self.control.stage {
                ControlStage::Setup => {
                    // Device-to-host request deferred at the SETUP token.
                    let len = data.len().min(self.control.len);
                    self.control.data[..len].copy_from_slice(&data[..len]);
                    self.control.len = len;
                    self.control.stage = if len == 0 {
                        ControlStage::Ack
                    } else {
                        ControlStage::Data
                    };
                    packet.finish(Ok(8));
                }
                ControlStage::Param => {
                    let len = data.len().min(self.control.len);
                    self.control.data[..len].copy_from_slice(&data[..len]);
                    self.control.len = len;
                    if packet.pid() == UsbPid::In {
                        packet
                            .copy_in(&self.control.data[..len])
                            .expect("len clamped to packet size");
                    }
                    packet.finish(Ok(len));
                }
                stage => panic!("control IN completion in stage {stage:?}"),
            },
            Completion::Out(n) => match self.control.stage {
                ControlStage::Ack => {
                    // Handler for a zero-length host-to-device request
                    // deferred at the status stage.
                    self.control.stage = ControlStage::Idle;
                    packet.finish(Ok(0));
                }
                ControlStage::Data => {
                    // Handler deferred after the last data-stage OUT packet.
                    self.control.stage = ControlStage::Ack;
                    packet.finish(Ok(packet.actual_length()));
                }
                ControlStage::Param => {
                    if n < self.control.len {
                        self.control.len = n;
                    }
                    packet.finish(Ok(self.control.len));
                }
                stage => panic!("control OUT completion in stage {stage:?}"),
            },
        }
    }
}
