//! Facade-level error taxonomy layered over `ringshm_core`'s.

use ringshm_core::{RingBufferError, SegmentError};

/// Errors raised by the typed publisher/subscriber facade (§4.3, §7).
#[derive(Debug, thiserror::Error)]
pub enum FacadeError {
    #[error("segment error: {0}")]
    Segment(#[from] SegmentError),

    #[error("ring buffer error: {0}")]
    Ring(#[from] RingBufferError),

    /// The element type is not a valid fixed-size POD payload, or its
    /// alignment exceeds what the segment guarantees.
    #[error("type constraint violated: {reason}")]
    TypeConstraintViolated { reason: String },
}

/// Errors raised by [`crate::service::ServiceClient::call`] and
/// [`crate::service::ServiceServer::serve_one`].
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Facade(#[from] FacadeError),

    /// The client's configured timeout elapsed with no matching
    /// response observed.
    #[error("service call timed out waiting for a response")]
    Timeout,
}

/// Errors raised by the goal/feedback/result action pattern.
#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    #[error(transparent)]
    Facade(#[from] FacadeError),

    /// The caller's configured timeout elapsed with no result observed.
    #[error("action timed out waiting for a result")]
    Timeout,
}
