//! The ring buffer coordination protocol (§4.2): lazy initialization,
//! slot reservation, newest-value selection, and blocking wait.

use std::ptr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use crate::clock::now_micros;
use crate::error::RingBufferError;
use crate::segment::Segment;
use crate::sync::{SharedCondvar, SharedMutex};

const UNINIT: u32 = 0;
const IN_PROGRESS: u32 = 1;
const READY: u32 = 2;

const INIT_SPIN_INTERVAL: Duration = Duration::from_millis(1);
const INIT_DEADLINE: Duration = Duration::from_millis(500);

const ALLOC_MAX_ATTEMPTS: u32 = 10;
const ALLOC_RETRY_INTERVAL: Duration = Duration::from_millis(1);

/// Largest `buf_num` this implementation supports. Per-slot storage is
/// `timestamp (8 bytes) + element_size bytes`; the writer side
/// additionally needs to tell "genuinely never published" apart from
/// "another writer has this slot reserved right now" without a second
/// per-slot field (see `reserved_mask` below and DESIGN.md). We track
/// in-flight reservations with a single `u64` bitmask, which caps
/// supported slot counts at 64 — comfortably above the recommended
/// minimum of 3.
pub const MAX_SLOTS: u32 = 64;

/// Fixed part of the ring buffer header, placed at offset 0 of the
/// segment. `timestamps` and `slots` follow immediately after, computed
/// purely from `element_size`/`buf_num` per §3 — never stored as
/// pointers, so any attacher rebuilds identical offsets.
#[repr(C)]
pub struct RingBufferHeader {
    initialized: AtomicU32,
    buf_num: AtomicU32,
    element_size: AtomicU32,
    _pad: u32,
    /// Bit `i` set means slot `i` is currently reserved by a writer
    /// between the timestamp-zeroing reservation and the final stamp
    /// (§4.2.3 step 2→3). Disambiguates "never published" from
    /// "another writer is mid-copy", both of which read as timestamp
    /// `0`.
    reserved_mask: AtomicU64,
    mutex: SharedMutex,
    cond: SharedCondvar,
}

impl RingBufferHeader {
    /// Bytes occupied by the fixed header part, at the natural
    /// alignment both writer and reader compute identically.
    pub const fn size() -> usize {
        std::mem::size_of::<RingBufferHeader>()
    }
}

/// Number of bytes required for a ring buffer segment with the given
/// dimensions (§4.2.1) — a pure function of `element_size`/`buf_num`.
pub fn required_size(element_size: u32, buf_num: u32) -> u64 {
    RingBufferHeader::size() as u64 + (buf_num as u64) * (8 + element_size as u64)
}

/// A lock-protected, timestamped, multi-slot ring buffer overlaid on a
/// mapped [`Segment`].
pub struct RingBuffer {
    segment: Segment,
    header: *mut RingBufferHeader,
    timestamps: *mut AtomicU64,
    slots: *mut u8,
    element_size: u32,
    buf_num: u32,
}

// SAFETY: all mutable access to shared bytes goes through atomics or
// the process-shared mutex; `RingBuffer` only ever hands out owned
// copies of slot payloads.
unsafe impl Send for RingBuffer {}
unsafe impl Sync for RingBuffer {}

impl RingBuffer {
    /// Create or attach to the ring buffer protocol over `segment`,
    /// run by a publisher that knows the intended dimensions. Any
    /// other publisher racing to create the same topic converges on
    /// whichever dimensions the CAS winner wrote (§4.2.2, invariant 5).
    pub fn create(
        segment: Segment,
        element_size: u32,
        buf_num: u32,
    ) -> Result<Self, RingBufferError> {
        if buf_num == 0 || buf_num > MAX_SLOTS {
            return Err(RingBufferError::DimensionMismatch {
                expected_element_size: element_size,
                expected_buf_num: buf_num,
                found_element_size: element_size,
                found_buf_num: buf_num,
            });
        }

        let header = segment.base() as *mut RingBufferHeader;

        // SAFETY: the segment is sized for at least one `RingBufferHeader`
        // by construction of `required_size`; alignment is guaranteed by
        // `mmap` returning page-aligned memory.
        let state = unsafe { (*header).initialized.load(Ordering::Acquire) };

        if state == UNINIT {
            // SAFETY: only reached by a party that is about to attempt
            // the CAS below; no one else may have touched the mutex/cond
            // bytes yet.
            let won = unsafe {
                (*header)
                    .initialized
                    .compare_exchange(UNINIT, IN_PROGRESS, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            };

            if won {
                tracing::debug!(
                    name = segment.name(),
                    element_size,
                    buf_num,
                    "won lazy-init race, initializing ring buffer header"
                );
                // SAFETY: we hold the sole `IN_PROGRESS` token; no other
                // party will touch the mutex/cond/dimension fields until
                // we publish READY.
                unsafe {
                    SharedMutex::init_in_place(ptr::addr_of_mut!((*header).mutex))
                        .map_err(|_| RingBufferError::InitTimeout)?;
                    SharedCondvar::init_in_place(ptr::addr_of_mut!((*header).cond))
                        .map_err(|_| RingBufferError::InitTimeout)?;
                    (*header).element_size.store(element_size, Ordering::Relaxed);
                    (*header).buf_num.store(buf_num, Ordering::Relaxed);
                    (*header).reserved_mask.store(0, Ordering::Relaxed);

                    let timestamps = timestamps_ptr(header);
                    for i in 0..buf_num {
                        (*timestamps.add(i as usize)).store(0, Ordering::Relaxed);
                    }

                    (*header).initialized.store(READY, Ordering::Release);
                }
            } else {
                wait_for_ready(header)?;
            }
        } else if state == IN_PROGRESS {
            wait_for_ready(header)?;
        }

        Self::from_ready_header(segment, header)
    }

    /// Attach as a reader (§4.2.6): discovers `element_size`/`buf_num`
    /// from the header rather than asserting them.
    pub fn attach(segment: Segment) -> Result<Self, RingBufferError> {
        let header = segment.base() as *mut RingBufferHeader;
        // SAFETY: `header` points at a mapped segment at least as large
        // as `RingBufferHeader`.
        let state = unsafe { (*header).initialized.load(Ordering::Acquire) };
        if state != READY {
            wait_for_ready(header)?;
        }
        Self::from_ready_header(segment, header)
    }

    fn from_ready_header(
        segment: Segment,
        header: *mut RingBufferHeader,
    ) -> Result<Self, RingBufferError> {
        // SAFETY: header is READY, so element_size/buf_num were written
        // once by the CAS winner and are now read-only.
        let (element_size, buf_num) = unsafe {
            (
                (*header).element_size.load(Ordering::Acquire),
                (*header).buf_num.load(Ordering::Acquire),
            )
        };

        let timestamps = unsafe { timestamps_ptr(header) };
        let slots = unsafe { slots_ptr(header, buf_num) };

        Ok(RingBuffer {
            segment,
            header,
            timestamps,
            slots,
            element_size,
            buf_num,
        })
    }

    /// Size of one slot's payload, in bytes.
    pub fn element_size(&self) -> u32 {
        self.element_size
    }

    /// Number of slots in this ring.
    pub fn buf_num(&self) -> u32 {
        self.buf_num
    }

    /// The name of the underlying segment.
    pub fn name(&self) -> &str {
        self.segment.name()
    }

    /// Whether the mapped segment is still the one named `self.name()`
    /// — false once it has been unlinked, with or without a
    /// replacement created under the same name since (§4.2.6).
    pub fn is_current(&self) -> bool {
        self.segment.is_current()
    }

    fn header(&self) -> &RingBufferHeader {
        // SAFETY: `self.header` is valid for the lifetime of `self`.
        unsafe { &*self.header }
    }

    fn timestamp(&self, index: u32) -> &AtomicU64 {
        // SAFETY: `index < self.buf_num` is an internal invariant of
        // every caller in this file.
        unsafe { &*self.timestamps.add(index as usize) }
    }

    fn slot_bytes(&self, index: u32) -> *mut u8 {
        // SAFETY: `index < self.buf_num` is an internal invariant of
        // every caller in this file.
        unsafe { self.slots.add(index as usize * self.element_size as usize) }
    }

    /// Publish one value, per the writer-side protocol of §4.2.3.
    ///
    /// `bytes.len()` must equal [`RingBuffer::element_size`]; this is a
    /// facade-level contract, not a runtime check, since the facade
    /// already asserts the element type's size at construction.
    pub fn publish(&self, bytes: &[u8]) -> Result<(), RingBufferError> {
        debug_assert_eq!(bytes.len(), self.element_size as usize);

        let mut attempt = 0u32;
        let slot_index = loop {
            attempt += 1;
            let candidate = {
                let _guard = self.header().mutex.lock();
                self.reserve_oldest_unreserved_slot()
            };

            match candidate {
                Some(index) => break index,
                None => {
                    if attempt >= ALLOC_MAX_ATTEMPTS {
                        tracing::debug!(
                            name = self.name(),
                            attempt,
                            "writer exhausted slot allocation budget"
                        );
                        return Err(RingBufferError::AllocationFailed);
                    }
                    tracing::trace!(name = self.name(), attempt, "all slots reserved, retrying");
                    std::thread::sleep(ALLOC_RETRY_INTERVAL);
                }
            }
        };

        // SAFETY: `slot_index` was just exclusively reserved for us via
        // `reserved_mask`; no other writer will touch these bytes until
        // we clear the bit below.
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), self.slot_bytes(slot_index), bytes.len());
        }

        {
            let _guard = self.header().mutex.lock();
            let stamp = now_micros().max(1); // never 0: 0 means empty/reserved
            self.timestamp(slot_index).store(stamp, Ordering::Release);
            self.header()
                .reserved_mask
                .fetch_and(!(1u64 << slot_index), Ordering::AcqRel);
            self.header().cond.notify_all();
        }

        Ok(())
    }

    /// Caller must hold the mutex. Picks the slot with the smallest
    /// timestamp among slots not already reserved by another in-flight
    /// writer, ties broken by lowest index (§4.2.3), marks it reserved
    /// (timestamp zeroed, `reserved_mask` bit set), and returns its
    /// index. Returns `None` if every slot is currently reserved.
    fn reserve_oldest_unreserved_slot(&self) -> Option<u32> {
        let mask = self.header().reserved_mask.load(Ordering::Acquire);

        let mut best: Option<(u32, u64)> = None;
        for i in 0..self.buf_num {
            if mask & (1u64 << i) != 0 {
                continue;
            }
            let ts = self.timestamp(i).load(Ordering::Acquire);
            match best {
                Some((_, best_ts)) if ts >= best_ts => {}
                _ => best = Some((i, ts)),
            }
        }

        let (index, _) = best?;
        self.timestamp(index).store(0, Ordering::Release);
        self.header()
            .reserved_mask
            .fetch_or(1u64 << index, Ordering::AcqRel);
        Some(index)
    }

    /// Read the freshest value within `expiry_micros` of now (§4.2.4).
    /// Never takes the mutex. Returns [`RingBufferError::SegmentVanished`]
    /// if the segment has been unlinked (and possibly recreated) since
    /// this handle attached (§4.2.6); callers are expected to drop this
    /// handle and re-attach.
    pub fn read_latest(&self, expiry_micros: u64) -> Result<Vec<u8>, RingBufferError> {
        if !self.is_current() {
            return Err(RingBufferError::SegmentVanished);
        }

        let now = now_micros();

        let mut best: Option<(u32, u64)> = None;
        for i in 0..self.buf_num {
            let ts = self.timestamp(i).load(Ordering::Acquire);
            if ts == 0 {
                continue;
            }
            match best {
                Some((_, best_ts)) if ts <= best_ts => {}
                _ => best = Some((i, ts)),
            }
        }

        let (index, ts) = best.ok_or(RingBufferError::NoFresh)?;
        if now.saturating_sub(ts) > expiry_micros {
            return Err(RingBufferError::NoFresh);
        }

        let mut out = vec![0u8; self.element_size as usize];
        // SAFETY: `index < buf_num`; the torn-read risk here is the
        // statistical one described in §4.2.4 — mitigated by using
        // `buf_num >= 3`, not eliminated.
        unsafe {
            ptr::copy_nonoverlapping(self.slot_bytes(index), out.as_mut_ptr(), out.len());
        }
        Ok(out)
    }

    /// Block until signalled or `timeout_micros` elapses (§4.2.5).
    /// Returns `true` on signal (including spurious wakeups the caller
    /// must re-check), `false` on timeout.
    pub fn wait_for(&self, timeout_micros: u64) -> bool {
        let guard = self.header().mutex.lock();
        self.header().cond.wait_timeout(&guard, timeout_micros)
    }
}

fn wait_for_ready(header: *mut RingBufferHeader) -> Result<(), RingBufferError> {
    let deadline = std::time::Instant::now() + INIT_DEADLINE;
    loop {
        // SAFETY: `header` is a valid mapping; reading `initialized`
        // never requires the mutex to have been initialized yet.
        let state = unsafe { (*header).initialized.load(Ordering::Acquire) };
        if state == READY {
            return Ok(());
        }
        if std::time::Instant::now() >= deadline {
            return Err(RingBufferError::InitTimeout);
        }
        std::thread::sleep(INIT_SPIN_INTERVAL);
    }
}

/// # Safety
/// `header` must point at a mapped segment at least
/// `RingBufferHeader::size()` bytes long.
unsafe fn timestamps_ptr(header: *mut RingBufferHeader) -> *mut AtomicU64 {
    unsafe { (header as *mut u8).add(RingBufferHeader::size()) as *mut AtomicU64 }
}

/// # Safety
/// `header` must point at a mapped segment sized via [`required_size`]
/// for at least `buf_num` slots.
unsafe fn slots_ptr(header: *mut RingBufferHeader, buf_num: u32) -> *mut u8 {
    unsafe {
        (timestamps_ptr(header) as *mut u8).add(buf_num as usize * std::mem::size_of::<u64>())
    }
}
