use thiserror::Error;
use tracing::trace;

/// Token pid of one bus transaction.
///
/// The raw values are the USB token pids as they appear in UHCI transfer
/// descriptors; controller models usually decode them straight from guest
/// memory.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum UsbPid {
    Setup,
    Out,
    In,
}

impl UsbPid {
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0x2d => Some(UsbPid::Setup),
            0xe1 => Some(UsbPid::Out),
            0x69 => Some(UsbPid::In),
            _ => None,
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            UsbPid::Setup => 0x2d,
            UsbPid::Out => 0xe1,
            UsbPid::In => 0x69,
        }
    }
}

/// Lifecycle state of a packet.
///
/// A packet starts out in `Setup` when built, moves to `Queued` when it has
/// to wait behind other work on its endpoint, to `Async` once the device
/// model has accepted it with a deferred result, and ends in `Complete` or
/// `Canceled`. A synchronous NAK leaves the packet in `Setup` so the
/// controller can retry it without rebuilding.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PacketState {
    Setup,
    Queued,
    Async,
    Complete,
    Canceled,
}

/// Terminal failure status of a transfer, as seen by the submitting
/// controller model. These are ordinary return values, not faults: the guest
/// decides what to make of them.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Error)]
pub enum UsbError {
    /// Endpoint has nothing to offer right now; retry later.
    #[error("endpoint not ready (NAK)")]
    Nak,
    /// Unsupported request, or a packet arrived in a control state that does
    /// not expect it.
    #[error("request stalled")]
    Stall,
    /// The device produced more data than the transfer requested.
    #[error("babble: device returned more data than requested")]
    Babble,
    /// The target device has been detached.
    #[error("no device at target address")]
    NoDevice,
    /// The packet was removed from its endpoint queue without being
    /// processed (endpoint halt, or trailing member of a short combined
    /// transfer). The controller may requeue it once the condition clears.
    #[error("removed from queue without being processed")]
    Dropped,
}

/// Result of a finished transfer: bytes moved, or a terminal error.
pub type UsbResult = Result<usize, UsbError>;

/// A buffer copy would have run past the packet's declared transfer size.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Error)]
#[error("copy of {len} bytes at offset {offset} exceeds declared transfer size {size}")]
pub struct BufferOverrun {
    pub offset: usize,
    pub len: usize,
    pub size: usize,
}

/// A gather/scatter data buffer: an ordered list of owned byte segments.
///
/// Controller models hand transfers to the engine in whatever fragmentation
/// the guest used (UHCI TDs, EHCI qTD page crossings, ...); the copy helpers
/// below hide the segment boundaries.
#[derive(Debug, Default)]
pub struct SgBuffer {
    segments: Vec<Vec<u8>>,
    len: usize,
}

impl SgBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Single-segment buffer of `len` zero bytes.
    pub fn contiguous(len: usize) -> Self {
        Self::from_segments(vec![vec![0u8; len]])
    }

    pub fn from_segments(segments: Vec<Vec<u8>>) -> Self {
        let len = segments.iter().map(Vec::len).sum();
        Self { segments, len }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn into_segments(self) -> Vec<Vec<u8>> {
        self.segments
    }

    /// Copies `data` into the buffer starting at `offset`.
    pub fn write_at(&mut self, offset: usize, data: &[u8]) -> Result<(), BufferOverrun> {
        if offset + data.len() > self.len {
            return Err(BufferOverrun {
                offset,
                len: data.len(),
                size: self.len,
            });
        }
        let mut skip = offset;
        let mut src = data;
        for seg in &mut self.segments {
            if skip >= seg.len() {
                skip -= seg.len();
                continue;
            }
            let n = (seg.len() - skip).min(src.len());
            seg[skip..skip + n].copy_from_slice(&src[..n]);
            src = &src[n..];
            skip = 0;
            if src.is_empty() {
                break;
            }
        }
        Ok(())
    }

    /// Copies bytes starting at `offset` out of the buffer into `out`.
    pub fn read_at(&self, offset: usize, out: &mut [u8]) -> Result<(), BufferOverrun> {
        if offset + out.len() > self.len {
            return Err(BufferOverrun {
                offset,
                len: out.len(),
                size: self.len,
            });
        }
        let mut skip = offset;
        let mut dst = &mut out[..];
        for seg in &self.segments {
            if skip >= seg.len() {
                skip -= seg.len();
                continue;
            }
            let n = (seg.len() - skip).min(dst.len());
            dst[..n].copy_from_slice(&seg[skip..skip + n]);
            dst = &mut dst[n..];
            skip = 0;
            if dst.is_empty() {
                break;
            }
        }
        Ok(())
    }

    /// Flattens the whole buffer into one `Vec`.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len);
        for seg in &self.segments {
            out.extend_from_slice(seg);
        }
        out
    }
}

/// Back-reference from a packet to the combined transfer it is currently a
/// member of. Navigation only; the aggregate itself lives on the device.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CombinedRef {
    pub(crate) id: u64,
    /// Total size of the aggregate at the time it was flushed to the device.
    pub(crate) total: usize,
}

/// One bus transaction.
///
/// The submitting controller owns the packet: it is moved into the engine on
/// submit and moved back out on completion or cancellation. While queued or
/// in flight the engine holds it inside the target endpoint's queue.
#[derive(Debug)]
pub struct UsbPacket {
    id: u64,
    pid: UsbPid,
    ep_nr: u8,
    state: PacketState,
    buf: SgBuffer,
    /// Bytes transferred so far; doubles as the running cursor for the copy
    /// helpers while the packet is being processed.
    actual_length: usize,
    status: Option<UsbResult>,
    /// Out-of-band 8-byte setup header for the single-packet control
    /// shortcut used by xHCI-style controllers.
    parameter: Option<[u8; 8]>,
    /// A transfer ending short of the requested size is an error for this
    /// packet (and halts the endpoint) rather than the usual end-of-transfer
    /// signal.
    short_not_ok: bool,
    /// The guest asked for an interrupt on completion of this packet.
    int_req: bool,
    pub(crate) combined: Option<CombinedRef>,
}

impl UsbPacket {
    /// Builds a fresh packet in `Setup` state. `id` is chosen by the caller
    /// and is the key for `complete` and `cancel`.
    pub fn new(id: u64, pid: UsbPid, ep_nr: u8, buf: SgBuffer) -> Self {
        assert!(ep_nr <= 15, "endpoint number out of range: {ep_nr}");
        Self {
            id,
            pid,
            ep_nr,
            state: PacketState::Setup,
            buf,
            actual_length: 0,
            status: None,
            parameter: None,
            short_not_ok: false,
            int_req: false,
            combined: None,
        }
    }

    pub fn with_parameter(mut self, header: [u8; 8]) -> Self {
        self.parameter = Some(header);
        self
    }

    pub fn with_short_not_ok(mut self, short_not_ok: bool) -> Self {
        self.short_not_ok = short_not_ok;
        self
    }

    pub fn with_int_req(mut self, int_req: bool) -> Self {
        self.int_req = int_req;
        self
    }

    /// Re-arms a finished packet for another submission with a new buffer.
    /// Panics if the packet has not reached a terminal state.
    pub fn reinit(&mut self, buf: SgBuffer) {
        assert!(
            matches!(self.state, PacketState::Complete | PacketState::Canceled),
            "packet {} re-initialized in state {:?}",
            self.id,
            self.state
        );
        self.state = PacketState::Setup;
        self.buf = buf;
        self.actual_length = 0;
        self.status = None;
        self.combined = None;
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn pid(&self) -> UsbPid {
        self.pid
    }

    pub fn ep_nr(&self) -> u8 {
        self.ep_nr
    }

    pub fn state(&self) -> PacketState {
        self.state
    }

    pub fn is_inflight(&self) -> bool {
        matches!(self.state, PacketState::Queued | PacketState::Async)
    }

    /// Declared transfer size of this packet alone.
    pub fn size(&self) -> usize {
        self.buf.len()
    }

    /// Size of the request as dispatched to the device: the combined
    /// aggregate's total when this packet fronts one, its own size otherwise.
    pub fn transfer_size(&self) -> usize {
        self.combined.map(|c| c.total).unwrap_or(self.buf.len())
    }

    pub fn actual_length(&self) -> usize {
        self.actual_length
    }

    /// Terminal result, once the packet is complete.
    pub fn result(&self) -> Option<UsbResult> {
        self.status
    }

    pub fn parameter(&self) -> Option<[u8; 8]> {
        self.parameter
    }

    pub fn short_not_ok(&self) -> bool {
        self.short_not_ok
    }

    pub fn int_req(&self) -> bool {
        self.int_req
    }

    pub(crate) fn set_short_not_ok(&mut self, short_not_ok: bool) {
        self.short_not_ok = short_not_ok;
    }

    pub fn buffer(&self) -> &SgBuffer {
        &self.buf
    }

    pub fn into_buffer(self) -> SgBuffer {
        self.buf
    }

    /// The transferred bytes of a finished IN packet, flattened.
    pub fn payload(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.actual_length];
        self.buf
            .read_at(0, &mut out)
            .expect("actual length within buffer");
        out
    }

    /// Device-to-host: copies `data` into the packet buffer at the running
    /// cursor.
    pub fn copy_in(&mut self, data: &[u8]) -> Result<(), BufferOverrun> {
        self.buf.write_at(self.actual_length, data)?;
        self.actual_length += data.len();
        Ok(())
    }

    /// Host-to-device: copies bytes at the running cursor out of the packet
    /// buffer into `out`.
    pub fn copy_out(&mut self, out: &mut [u8]) -> Result<(), BufferOverrun> {
        self.buf.read_at(self.actual_length, out)?;
        self.actual_length += out.len();
        Ok(())
    }

    /// Advances the cursor without moving data.
    pub fn skip(&mut self, len: usize) -> Result<(), BufferOverrun> {
        if self.actual_length + len > self.buf.len() {
            return Err(BufferOverrun {
                offset: self.actual_length,
                len,
                size: self.buf.len(),
            });
        }
        self.actual_length += len;
        Ok(())
    }

    pub(crate) fn set_state(&mut self, next: PacketState) {
        trace!(
            id = self.id,
            from = ?self.state,
            to = ?next,
            "usb packet state"
        );
        self.state = next;
    }

    /// Clears per-submission results so a packet in `Setup` state starts
    /// clean (a NAKed packet may be resubmitted as-is).
    pub(crate) fn begin(&mut self) {
        assert_eq!(
            self.state,
            PacketState::Setup,
            "packet {} submitted in state {:?}",
            self.id,
            self.state
        );
        self.actual_length = 0;
        self.status = None;
        self.combined = None;
    }

    /// Records the terminal result and marks the packet complete.
    pub(crate) fn finish(&mut self, res: UsbResult) {
        if let Ok(n) = res {
            self.actual_length = n;
        }
        self.status = Some(res);
        self.set_state(PacketState::Complete);
    }

    /// Records a NAK without leaving `Setup`, so the packet can be retried.
    pub(crate) fn nak(&mut self) {
        self.actual_length = 0;
        self.status = Some(Err(UsbError::Nak));
    }
}
