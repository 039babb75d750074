//! Shared scripted device model for the engine tests.
#![allow(dead_code)]

use std::any::Any;
use std::collections::VecDeque;

use nimbus_usb::{
    EndpointType, HandlerResult, SetupPacket, SgBuffer, Submitted, UsbDevice, UsbDeviceModel,
    UsbError, UsbPacket, UsbPid,
};

/// What the scripted model does with its next data-stage dispatch.
pub enum DataAction {
    Defer,
    /// IN: supply these bytes. OUT: accept the whole packet.
    Reply(Vec<u8>),
    /// IN only: claim this many bytes without copying them (overrun probe).
    ClaimLength(usize),
    Nak,
    Error(UsbError),
}

/// Device model driven entirely by a script of [`DataAction`]s, recording
/// everything the engine asks of it.
#[derive(Default)]
pub struct ScriptedModel {
    pub setups: Vec<SetupPacket>,
    /// Response payload for device-to-host control requests.
    pub control_reply: Vec<u8>,
    pub defer_control: bool,
    pub data_actions: VecDeque<DataAction>,
    /// `transfer_size` of every data dispatch, in order.
    pub dispatched: Vec<usize>,
    pub out_received: Vec<Vec<u8>>,
    pub control_received: Vec<Vec<u8>>,
    pub canceled: Vec<u64>,
}

impl UsbDeviceModel for ScriptedModel {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn handle_control(
        &mut self,
        _packet: &mut UsbPacket,
        req: SetupPacket,
        data: &mut [u8],
    ) -> HandlerResult {
        self.setups.push(req);
        if self.defer_control {
            return HandlerResult::Pending;
        }
        if req.is_device_to_host() {
            let n = self.control_reply.len().min(data.len());
            data[..n].copy_from_slice(&self.control_reply[..n]);
            HandlerResult::Done(Ok(n))
        } else {
            self.control_received.push(data.to_vec());
            HandlerResult::Done(Ok(data.len()))
        }
    }

    fn handle_data(&mut self, packet: &mut UsbPacket) -> HandlerResult {
        self.dispatched.push(packet.transfer_size());
        match self
            .data_actions
            .pop_front()
            .expect("unexpected data dispatch")
        {
            DataAction::Defer => HandlerResult::Pending,
            DataAction::Nak => HandlerResult::Done(Err(UsbError::Nak)),
            DataAction::Error(e) => HandlerResult::Done(Err(e)),
            DataAction::ClaimLength(n) => HandlerResult::Done(Ok(n)),
            DataAction::Reply(bytes) => {
                if packet.pid() == UsbPid::In {
                    packet.copy_in(&bytes).expect("reply fits the packet");
                    HandlerResult::Done(Ok(bytes.len()))
                } else {
                    let mut data = vec![0u8; packet.size()];
                    packet.copy_out(&mut data).expect("whole packet");
                    self.out_received.push(data);
                    HandlerResult::Done(Ok(packet.size()))
                }
            }
        }
    }

    fn cancel_packet(&mut self, packet: &mut UsbPacket) {
        self.canceled.push(packet.id());
    }
}

pub fn attached_device() -> UsbDevice {
    let mut dev = UsbDevice::new(Box::new(ScriptedModel::default()));
    dev.attach();
    dev
}

pub fn model(dev: &UsbDevice) -> &ScriptedModel {
    dev.model().as_any().downcast_ref().expect("scripted model")
}

pub fn model_mut(dev: &mut UsbDevice) -> &mut ScriptedModel {
    dev.model_mut()
        .as_any_mut()
        .downcast_mut()
        .expect("scripted model")
}

pub fn configure_bulk(dev: &mut UsbDevice, pid: UsbPid, nr: u8, mps: usize, pipeline: bool) {
    let ep = dev.ep_mut(pid, nr);
    ep.set_type(EndpointType::Bulk);
    ep.set_max_packet_size(mps);
    ep.set_pipeline(pipeline);
}

pub fn setup_packet(id: u64, setup: SetupPacket) -> UsbPacket {
    let buf = SgBuffer::from_segments(vec![setup.to_bytes().to_vec()]);
    UsbPacket::new(id, UsbPid::Setup, 0, buf)
}

pub fn in_packet(id: u64, nr: u8, len: usize) -> UsbPacket {
    UsbPacket::new(id, UsbPid::In, nr, SgBuffer::contiguous(len))
}

pub fn out_packet(id: u64, nr: u8, data: &[u8]) -> UsbPacket {
    let buf = SgBuffer::from_segments(vec![data.to_vec()]);
    UsbPacket::new(id, UsbPid::Out, nr, buf)
}

pub fn expect_complete(sub: Submitted) -> UsbPacket {
    match sub {
        Submitted::Complete(packet) => packet,
        Submitted::Pending(id) => panic!("packet {id} deferred unexpectedly"),
    }
}

pub fn expect_pending(sub: Submitted) -> u64 {
    match sub {
        Submitted::Pending(id) => id,
        Submitted::Complete(packet) => {
            panic!("packet {} completed unexpectedly: {:?}", packet.id(), packet.result())
        }
    }
}

pub const GET_DESCRIPTOR: u8 = 0x06;
pub const SET_CONFIGURATION: u8 = 0x09;

pub fn get_descriptor(length: u16) -> SetupPacket {
    SetupPacket {
        request_type: 0x80,
        request: GET_DESCRIPTOR,
        value: 0x0100,
        index: 0,
        length,
    }
}
