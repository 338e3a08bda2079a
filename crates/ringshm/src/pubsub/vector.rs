//! Variable-length specialization (§4.3, §9): a ring buffer whose
//! element size is renegotiated per-publish by unlinking and
//! recreating the segment whenever the outgoing length changes.

use bytemuck::Pod;
use ringshm_core::{required_size, Permissions, RingBuffer, Segment};

use crate::error::FacadeError;
use crate::pubsub::ShmSessionConfig;

/// Publishes variable-length sequences of `T`. Unlike [`crate::pubsub::Publisher`],
/// which has a fixed `element_size` for its lifetime, this is the only
/// facade that deliberately destroys and recreates a segment as part
/// of normal operation (§4.3).
pub struct VectorPublisher<T> {
    config: ShmSessionConfig,
    ring: Option<RingBuffer>,
    element_count: usize,
    _marker: std::marker::PhantomData<T>,
}

impl<T: Pod> VectorPublisher<T> {
    pub fn new(config: ShmSessionConfig) -> Self {
        VectorPublisher {
            config,
            ring: None,
            element_count: 0,
            _marker: std::marker::PhantomData,
        }
    }

    /// Publish `values`, resizing the backing segment if its length
    /// differs from the currently configured element size.
    pub fn publish(&mut self, values: &[T]) -> Result<(), FacadeError> {
        if self.ring.is_none() || values.len() != self.element_count {
            self.recreate(values.len())?;
        }

        let ring = self.ring.as_ref().expect("recreated above");
        let bytes = bytemuck::cast_slice(values);
        Ok(ring.publish(bytes)?)
    }

    fn recreate(&mut self, element_count: usize) -> Result<(), FacadeError> {
        if self.ring.is_some() {
            // Drop the old mapping before unlinking so the old handle
            // doesn't outlive the name it was opened under.
            self.ring = None;
            // Best-effort: another process may have already unlinked
            // this name (e.g. a racing publisher also resizing).
            let _ = Segment::unlink(&self.config.topic);
        }

        let element_size = (element_count * std::mem::size_of::<T>()) as u32;
        let size = required_size(element_size, self.config.buf_num);
        let segment = Segment::open_or_create(&self.config.topic, size, self.config.permissions)?;
        let ring = RingBuffer::create(segment, element_size, self.config.buf_num)?;
        self.ring = Some(ring);
        self.element_count = element_count;
        Ok(())
    }

    pub fn topic(&self) -> &str {
        &self.config.topic
    }
}

/// Reads variable-length sequences of `T`, reattaching whenever the
/// publisher has resized the segment (§4.2.6).
pub struct VectorSubscriber<T> {
    topic: String,
    expiry_micros: u64,
    ring: Option<RingBuffer>,
    _marker: std::marker::PhantomData<T>,
}

impl<T: Pod> VectorSubscriber<T> {
    pub fn new(topic: impl Into<String>, expiry_micros: u64) -> Self {
        VectorSubscriber {
            topic: topic.into(),
            expiry_micros,
            ring: None,
            _marker: std::marker::PhantomData,
        }
    }

    fn ensure_attached(&mut self) -> Result<(), FacadeError> {
        if self.ring.is_none() {
            let segment = Segment::open_read_write(&self.topic)?;
            self.ring = Some(RingBuffer::attach(segment)?);
        }
        Ok(())
    }

    /// Read the freshest sequence. Returns `Ok(None)` when nothing
    /// fresh is available, including before the first publish.
    pub fn read(&mut self) -> Result<Option<Vec<T>>, FacadeError> {
        match self.ensure_attached() {
            Err(FacadeError::Segment(ringshm_core::SegmentError::NotFound { .. })) => {
                return Ok(None)
            }
            Err(err) => return Err(err),
            Ok(()) => {}
        }

        let element_size = self.ring.as_ref().expect("attached above").element_size();
        match self.ring.as_ref().expect("attached above").read_latest(self.expiry_micros) {
            Ok(bytes) => {
                debug_assert_eq!(bytes.len(), element_size as usize);
                Ok(Some(bytemuck::cast_slice(&bytes).to_vec()))
            }
            Err(ringshm_core::RingBufferError::NoFresh) => Ok(None),
            Err(ringshm_core::RingBufferError::SegmentVanished) => {
                self.ring = None;
                self.ensure_attached()?;
                self.read()
            }
            Err(err) => Err(err.into()),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pubsub::ShmSessionConfig;

    fn unique_topic(tag: &str) -> String {
        format!(
            "/ringshm-vector-test-{}-{}-{}",
            tag,
            std::process::id(),
            ringshm_core::now_micros()
        )
    }

    #[test]
    fn publish_then_read_fixed_length() {
        let topic = unique_topic("fixed");
        let mut publisher = VectorPublisher::<i32>::new(ShmSessionConfig::new(&topic));
        publisher.publish(&[1, 2, 3]).unwrap();

        let mut subscriber = VectorSubscriber::<i32>::new(&topic, 2_000_000);
        let values = subscriber.read().unwrap().unwrap();
        assert_eq!(values, vec![1, 2, 3]);

        drop(publisher);
        Segment::unlink(&topic).ok();
    }

    #[test]
    fn resize_recreates_segment() {
        let topic = unique_topic("resize");
        let mut publisher = VectorPublisher::<i32>::new(ShmSessionConfig::new(&topic));
        publisher.publish(&[1, 2, 3]).unwrap();
        publisher.publish(&[1, 2, 3, 4, 5]).unwrap();

        let mut subscriber = VectorSubscriber::<i32>::new(&topic, 2_000_000);
        let values = subscriber.read().unwrap().unwrap();
        assert_eq!(values, vec![1, 2, 3, 4, 5]);

        drop(publisher);
        Segment::unlink(&topic).ok();
    }

    #[test]
    fn subscriber_attached_before_resize_reattaches() {
        let topic = unique_topic("reattach");
        let mut publisher = VectorPublisher::<i32>::new(ShmSessionConfig::new(&topic));
        publisher.publish(&[1, 2, 3]).unwrap();

        // Attach and read while the segment still has its original
        // dimensions, unlike `resize_recreates_segment` above.
        let mut subscriber = VectorSubscriber::<i32>::new(&topic, 2_000_000);
        let values = subscriber.read().unwrap().unwrap();
        assert_eq!(values, vec![1, 2, 3]);

        // Publisher resizes, which unlinks and recreates the segment
        // under the same name.
        publisher.publish(&[4, 5, 6, 7]).unwrap();

        // The already-attached subscriber must detect the stale
        // mapping and reattach rather than keep reading the orphaned
        // segment (or erroring out).
        let values = subscriber.read().unwrap().unwrap();
        assert_eq!(values, vec![4, 5, 6, 7]);

        drop(publisher);
        Segment::unlink(&topic).ok();
    }
}
