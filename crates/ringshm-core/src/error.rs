//! Error taxonomy for `ringshm-core`, per the construction-time /
//! operation-time split described in the design notes.

use std::io;

/// Errors raised while creating, attaching to, resizing, or unlinking
/// a shared-memory [`crate::segment::Segment`].
#[derive(Debug, thiserror::Error)]
pub enum SegmentError {
    #[error("invalid segment name {name:?}")]
    InvalidName { name: String },

    #[error("segment {name:?} exists with size {existing} bytes, expected {requested}")]
    SizeMismatch {
        name: String,
        existing: u64,
        requested: u64,
    },

    #[error("permission denied opening segment {name:?}")]
    PermissionDenied {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("out of memory creating segment {name:?}")]
    OutOfMemory {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("segment {name:?} not found")]
    NotFound { name: String },

    #[error("shared memory unsupported on this platform")]
    Unsupported,

    #[error("OS error on segment {name:?}: {source}")]
    Os {
        name: String,
        #[source]
        source: io::Error,
    },
}

impl SegmentError {
    /// Classify a raw `errno` from `shm_open`/`ftruncate`/`mmap` into the
    /// taxonomy callers expect, per §4.1.
    pub(crate) fn from_os_error(name: &str, source: io::Error) -> Self {
        match source.kind() {
            io::ErrorKind::PermissionDenied => SegmentError::PermissionDenied {
                name: name.to_string(),
                source,
            },
            io::ErrorKind::NotFound => SegmentError::NotFound {
                name: name.to_string(),
            },
            io::ErrorKind::OutOfMemory => SegmentError::OutOfMemory {
                name: name.to_string(),
                source,
            },
            _ => {
                if source.raw_os_error() == Some(libc::ENOSPC)
                    || source.raw_os_error() == Some(libc::ENOMEM)
                {
                    SegmentError::OutOfMemory {
                        name: name.to_string(),
                        source,
                    }
                } else {
                    SegmentError::Os {
                        name: name.to_string(),
                        source,
                    }
                }
            }
        }
    }
}

/// Errors raised by the ring buffer coordination protocol (§4.2, §7).
#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum RingBufferError {
    /// The lazy-init CAS gate never reached `READY` within the 500ms
    /// deadline (§4.2.2).
    #[error("timed out waiting for ring buffer initialization")]
    InitTimeout,

    /// A writer exhausted its 10-try reservation budget (§4.2.3).
    #[error("writer exhausted its slot allocation budget")]
    AllocationFailed,

    /// `wait_for` hit its deadline without a signal (§4.2.5).
    #[error("wait_for timed out")]
    Timeout,

    /// No slot held a value within the caller's expiry horizon (§4.2.4).
    #[error("no fresh value within the expiry horizon")]
    NoFresh,

    /// The segment was unlinked (by an administrator, or by a publisher
    /// resizing for a vector element) and has not been recreated.
    #[error("segment vanished; recreate the handle to reattach")]
    SegmentVanished,

    /// The header's `element_size`/`buf_num` do not match what the
    /// caller expected — only possible for a caller that is pinned to a
    /// fixed layout rather than discovering it from the header.
    #[error("ring dimensions mismatch: expected element_size={expected_element_size} buf_num={expected_buf_num}, found element_size={found_element_size} buf_num={found_buf_num}")]
    DimensionMismatch {
        expected_element_size: u32,
        expected_buf_num: u32,
        found_element_size: u32,
        found_buf_num: u32,
    },
}
