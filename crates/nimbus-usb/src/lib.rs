//! Device-independent USB transaction engine.
//!
//! Host-controller models build [`UsbPacket`]s and submit them to a
//! [`UsbDevice`]; the engine drives the packet lifecycle, per-endpoint
//! ordering, the endpoint-0 control-transfer state machine and the bulk-IN
//! input combiner, and calls into the attached [`UsbDeviceModel`] for the
//! device-specific behavior. Deferred results come back through
//! [`UsbDevice::complete`] and a [`CompletionSink`].
//!
//! Everything here is single-threaded: the engine is plain data driven by
//! `&mut` calls from the emulator's device thread.

mod combine;
mod control;
mod device;
mod endpoint;
mod packet;

pub use combine::CombinerConfig;
pub use control::{ControlStage, CONTROL_BUFFER_SIZE};
pub use device::{
    Completion, CompletionSink, DeviceState, HandlerResult, SetupPacket, Submitted, UsbDevice,
    UsbDeviceModel, MAX_INTERFACES,
};
pub use endpoint::{Endpoint, EndpointTable, EndpointType, EP0_MAX_PACKET_SIZE, MAX_ENDPOINT_NR};
pub use packet::{
    BufferOverrun, PacketState, SgBuffer, UsbError, UsbPacket, UsbPid, UsbResult,
};
