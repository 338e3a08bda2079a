//! Typed publish/subscribe facade (§4.3) over [`ringshm_core::RingBuffer`].

use std::marker::PhantomData;
use std::mem::{align_of, size_of};

use bytemuck::{Pod, Zeroable};
use ringshm_core::{required_size, Permissions, RingBuffer, Segment};

use crate::error::FacadeError;

/// Segments map pages; no POD element we construct a facade over
/// should need alignment stricter than this. Violating it is a
/// program error caught at construction, per §4.3.
const MAX_NATURAL_ALIGNMENT: usize = 16;

const DEFAULT_BUF_NUM: u32 = 3;
const DEFAULT_EXPIRY_MICROS: u64 = 2_000_000;

/// Configuration shared by [`PublisherBuilder`] and [`SubscriberBuilder`].
#[derive(Debug, Clone)]
pub struct ShmSessionConfig {
    pub topic: String,
    pub buf_num: u32,
    pub permissions: Permissions,
    pub expiry_micros: u64,
}

impl ShmSessionConfig {
    pub fn new(topic: impl Into<String>) -> Self {
        ShmSessionConfig {
            topic: topic.into(),
            buf_num: DEFAULT_BUF_NUM,
            permissions: Permissions::default(),
            expiry_micros: DEFAULT_EXPIRY_MICROS,
        }
    }
}

fn assert_pod_shape<T: Pod>() -> Result<(), FacadeError> {
    if align_of::<T>() > MAX_NATURAL_ALIGNMENT {
        return Err(FacadeError::TypeConstraintViolated {
            reason: format!(
                "alignment {} exceeds maximum supported alignment {}",
                align_of::<T>(),
                MAX_NATURAL_ALIGNMENT
            ),
        });
    }
    Ok(())
}

/// Builder for a [`Publisher`]. Publishers establish the segment
/// eagerly at construction (§4.2.6).
pub struct PublisherBuilder {
    config: ShmSessionConfig,
}

impl PublisherBuilder {
    pub fn new(topic: impl Into<String>) -> Self {
        PublisherBuilder {
            config: ShmSessionConfig::new(topic),
        }
    }

    pub fn buf_num(mut self, buf_num: u32) -> Self {
        self.config.buf_num = buf_num;
        self
    }

    pub fn permissions(mut self, permissions: Permissions) -> Self {
        self.config.permissions = permissions;
        self
    }

    pub fn build<T: Pod + Zeroable>(self) -> Result<Publisher<T>, FacadeError> {
        assert_pod_shape::<T>()?;
        let element_size = size_of::<T>() as u32;
        let size = required_size(element_size, self.config.buf_num);
        let segment = Segment::open_or_create(&self.config.topic, size, self.config.permissions)?;
        let ring = RingBuffer::create(segment, element_size, self.config.buf_num)?;
        Ok(Publisher {
            ring,
            _marker: PhantomData,
        })
    }
}

/// Publishes values of a fixed, trivially-copyable type `T` onto a
/// shared-memory topic.
pub struct Publisher<T> {
    ring: RingBuffer,
    _marker: PhantomData<fn(T)>,
}

impl<T: Pod> Publisher<T> {
    /// Copy `value`'s bytes into the oldest slot and stamp it (§4.2.3).
    /// Drops the publish silently (after logging) if the writer
    /// exhausts its allocation budget, matching §7's propagation
    /// policy for this class of error.
    pub fn publish(&self, value: &T) -> Result<(), FacadeError> {
        let bytes = bytemuck::bytes_of(value);
        match self.ring.publish(bytes) {
            Ok(()) => Ok(()),
            Err(err @ ringshm_core::RingBufferError::AllocationFailed) => {
                tracing::warn!(topic = self.ring.name(), "publish dropped: {err}");
                Err(err.into())
            }
            Err(err) => Err(err.into()),
        }
    }

    pub fn topic(&self) -> &str {
        self.ring.name()
    }
}

/// Builder for a [`Subscriber`]. Subscribers begin detached and attach
/// lazily on first read (§4.2.6).
pub struct SubscriberBuilder {
    config: ShmSessionConfig,
}

impl SubscriberBuilder {
    pub fn new(topic: impl Into<String>) -> Self {
        SubscriberBuilder {
            config: ShmSessionConfig::new(topic),
        }
    }

    pub fn expiry_micros(mut self, expiry_micros: u64) -> Self {
        self.config.expiry_micros = expiry_micros;
        self
    }

    pub fn build<T: Pod + Zeroable>(self) -> Result<Subscriber<T>, FacadeError> {
        assert_pod_shape::<T>()?;
        Ok(Subscriber {
            topic: self.config.topic,
            expiry_micros: self.config.expiry_micros,
            ring: None,
            _marker: PhantomData,
        })
    }
}

/// Reads values of a fixed, trivially-copyable type `T` from a
/// shared-memory topic, always returning the freshest value within the
/// configured expiry horizon.
pub struct Subscriber<T> {
    topic: String,
    expiry_micros: u64,
    ring: Option<RingBuffer>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Pod + Zeroable> Subscriber<T> {
    fn ensure_attached(&mut self) -> Result<(), FacadeError> {
        if self.ring.is_none() {
            let segment = Segment::open_read_write(&self.topic)?;
            let ring = RingBuffer::attach(segment)?;
            if ring.element_size() as usize != size_of::<T>() {
                return Err(FacadeError::TypeConstraintViolated {
                    reason: format!(
                        "segment element size {} does not match {}",
                        ring.element_size(),
                        size_of::<T>()
                    ),
                });
            }
            self.ring = Some(ring);
        }
        Ok(())
    }

    /// Read the freshest value within the configured expiry horizon.
    /// Returns `Ok(None)` (mapped from `NoFresh`) if no publisher has
    /// written a fresh value yet, including when no publisher has ever
    /// attached (§4.2.6).
    pub fn read(&mut self) -> Result<Option<T>, FacadeError> {
        match self.ensure_attached() {
            // No segment yet: a slow publisher must not block a
            // subscriber that started first.
            Err(FacadeError::Segment(ringshm_core::SegmentError::NotFound { .. })) => {
                return Ok(None)
            }
            Err(err) => return Err(err),
            Ok(()) => {}
        }

        let ring = self.ring.as_ref().expect("attached above");
        match ring.read_latest(self.expiry_micros) {
            Ok(bytes) => {
                let mut value = T::zeroed();
                bytemuck::bytes_of_mut(&mut value).copy_from_slice(&bytes);
                Ok(Some(value))
            }
            Err(ringshm_core::RingBufferError::NoFresh) => Ok(None),
            Err(ringshm_core::RingBufferError::SegmentVanished) => {
                // The publisher unlinked (and possibly recreated) the
                // segment since we attached; drop the stale mapping and
                // re-attach before trying again (§4.2.6).
                self.ring = None;
                self.read()
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Block until a new value is published or `timeout_micros`
    /// elapses, then attempt a read (§4.2.5).
    pub fn wait_for(&mut self, timeout_micros: u64) -> Result<Option<T>, FacadeError> {
        match self.ensure_attached() {
            Err(FacadeError::Segment(ringshm_core::SegmentError::NotFound { .. })) => {
                return Ok(None)
            }
            Err(err) => return Err(err),
            Ok(()) => {}
        }
        let ring = self.ring.as_ref().expect("attached above");
        ring.wait_for(timeout_micros);
        self.read()
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

pub mod vector;

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, Pod, Zeroable)]
    #[repr(C)]
    struct Sample {
        seq: u32,
        value: i32,
    }

    fn unique_topic(tag: &str) -> String {
        format!(
            "/ringshm-pubsub-test-{}-{}-{}",
            tag,
            std::process::id(),
            ringshm_core::now_micros()
        )
    }

    #[test]
    fn publish_then_read() {
        let topic = unique_topic("publish-read");
        let publisher = PublisherBuilder::new(&topic).build::<Sample>().unwrap();
        publisher
            .publish(&Sample { seq: 1, value: 42 })
            .unwrap();

        let mut subscriber = SubscriberBuilder::new(&topic).build::<Sample>().unwrap();
        let value = subscriber.read().unwrap().unwrap();
        assert_eq!(value.value, 42);

        drop(publisher);
        ringshm_core::Segment::unlink(&topic).unwrap();
    }

    #[test]
    fn subscriber_before_publisher_is_no_fresh() {
        let topic = unique_topic("no-publisher");
        let mut subscriber = SubscriberBuilder::new(&topic).build::<Sample>().unwrap();
        assert!(subscriber.read().unwrap().is_none());
    }

    #[test]
    fn overaligned_type_is_rejected() {
        #[derive(Clone, Copy, Pod, Zeroable)]
        #[repr(C, align(4096))]
        struct PageAligned {
            value: u8,
        }

        let topic = unique_topic("overaligned");
        let err = PublisherBuilder::new(&topic).build::<PageAligned>().unwrap_err();
        assert!(matches!(err, FacadeError::TypeConstraintViolated { .. }));
    }
}
