use std::collections::VecDeque;

use tracing::debug;

use crate::packet::{UsbPacket, UsbPid};

/// Transfer type of an endpoint.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EndpointType {
    /// Not configured yet; only the shared control endpoint has a type out
    /// of reset.
    Invalid,
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

pub const MAX_ENDPOINT_NR: u8 = 15;

/// Default max packet size of the control endpoint out of reset.
pub const EP0_MAX_PACKET_SIZE: usize = 64;

/// One logical channel on a device: attributes plus the ordered queue of
/// packets waiting or in flight on it.
///
/// Within one endpoint, packets complete in submission order unless
/// pipelining is enabled.
#[derive(Debug)]
pub struct Endpoint {
    nr: u8,
    pid: UsbPid,
    ty: EndpointType,
    ifnum: u8,
    max_packet_size: usize,
    pipeline: bool,
    halted: bool,
    pub(crate) queue: VecDeque<UsbPacket>,
}

impl Endpoint {
    fn new(pid: UsbPid, nr: u8) -> Self {
        Self {
            nr,
            pid,
            ty: if nr == 0 {
                EndpointType::Control
            } else {
                EndpointType::Invalid
            },
            ifnum: 0,
            max_packet_size: if nr == 0 { EP0_MAX_PACKET_SIZE } else { 0 },
            pipeline: false,
            halted: false,
            queue: VecDeque::new(),
        }
    }

    pub fn nr(&self) -> u8 {
        self.nr
    }

    pub fn pid(&self) -> UsbPid {
        self.pid
    }

    pub fn ty(&self) -> EndpointType {
        self.ty
    }

    pub fn set_type(&mut self, ty: EndpointType) {
        self.ty = ty;
    }

    pub fn ifnum(&self) -> u8 {
        self.ifnum
    }

    pub fn set_ifnum(&mut self, ifnum: u8) {
        self.ifnum = ifnum;
    }

    pub fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    pub fn set_max_packet_size(&mut self, size: usize) {
        self.max_packet_size = size;
    }

    pub fn pipeline(&self) -> bool {
        self.pipeline
    }

    pub fn set_pipeline(&mut self, pipeline: bool) {
        self.pipeline = pipeline;
    }

    pub fn halted(&self) -> bool {
        self.halted
    }

    pub fn set_halted(&mut self, halted: bool) {
        if halted && !self.halted {
            debug!(nr = self.nr, pid = ?self.pid, "endpoint halted");
        }
        self.halted = halted;
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Resets attributes to their out-of-reset defaults. The queue must have
    /// been unwound first.
    fn reset(&mut self) {
        debug_assert!(self.queue.is_empty(), "endpoint reset with queued packets");
        *self = Self::new(self.pid, self.nr);
    }
}

/// Endpoint table of one device: the shared control endpoint plus 15 IN and
/// 15 OUT endpoints, mirroring the layout the hardware addresses.
///
/// Endpoints live exactly as long as the device's current configuration;
/// `reset` rebuilds the table when the configuration or an alternate setting
/// changes, or on bus reset.
#[derive(Debug)]
pub struct EndpointTable {
    ctl: Endpoint,
    input: [Endpoint; MAX_ENDPOINT_NR as usize],
    output: [Endpoint; MAX_ENDPOINT_NR as usize],
}

impl EndpointTable {
    pub(crate) fn new() -> Self {
        Self {
            ctl: Endpoint::new(UsbPid::Setup, 0),
            input: std::array::from_fn(|i| Endpoint::new(UsbPid::In, i as u8 + 1)),
            output: std::array::from_fn(|i| Endpoint::new(UsbPid::Out, i as u8 + 1)),
        }
    }

    /// Looks up the endpoint a token addresses. Endpoint 0 is shared between
    /// directions; any pid routes there.
    pub fn get(&self, pid: UsbPid, nr: u8) -> &Endpoint {
        assert!(nr <= MAX_ENDPOINT_NR, "endpoint number out of range: {nr}");
        if nr == 0 {
            return &self.ctl;
        }
        match pid {
            UsbPid::In => &self.input[nr as usize - 1],
            UsbPid::Out => &self.output[nr as usize - 1],
            UsbPid::Setup => &self.ctl,
        }
    }

    pub fn get_mut(&mut self, pid: UsbPid, nr: u8) -> &mut Endpoint {
        assert!(nr <= MAX_ENDPOINT_NR, "endpoint number out of range: {nr}");
        if nr == 0 {
            return &mut self.ctl;
        }
        match pid {
            UsbPid::In => &mut self.input[nr as usize - 1],
            UsbPid::Out => &mut self.output[nr as usize - 1],
            UsbPid::Setup => &mut self.ctl,
        }
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut Endpoint> {
        std::iter::once(&mut self.ctl)
            .chain(self.input.iter_mut())
            .chain(self.output.iter_mut())
    }

    /// Rebuilds every endpoint to its defaults. Queues must be empty.
    pub(crate) fn reset(&mut self) {
        for ep in self.iter_mut() {
            ep.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_zero_is_shared_between_directions() {
        let table = EndpointTable::new();
        assert_eq!(table.get(UsbPid::In, 0).nr(), 0);
        assert_eq!(table.get(UsbPid::Out, 0).ty(), EndpointType::Control);
        assert_eq!(table.get(UsbPid::Setup, 0).max_packet_size(), 64);
    }

    #[test]
    fn directions_are_distinct_for_nonzero_endpoints() {
        let mut table = EndpointTable::new();
        table.get_mut(UsbPid::In, 2).set_type(EndpointType::Bulk);
        assert_eq!(table.get(UsbPid::In, 2).ty(), EndpointType::Bulk);
        assert_eq!(table.get(UsbPid::Out, 2).ty(), EndpointType::Invalid);
    }

    #[test]
    fn reset_restores_defaults() {
        let mut table = EndpointTable::new();
        let ep = table.get_mut(UsbPid::In, 1);
        ep.set_type(EndpointType::Interrupt);
        ep.set_max_packet_size(8);
        ep.set_halted(true);
        table.reset();
        let ep = table.get(UsbPid::In, 1);
        assert_eq!(ep.ty(), EndpointType::Invalid);
        assert_eq!(ep.max_packet_size(), 0);
        assert!(!ep.halted());
    }
}
