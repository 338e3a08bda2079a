//! Request/response pattern (§1): two ring buffers composed, no new
//! concurrency primitive. Grounded directly on spec §1's framing of
//! "service" as an external collaborator specified only by contract.

use bytemuck::{Pod, Zeroable};
use ringshm_core::{required_size, Permissions, RingBuffer, Segment};

use crate::error::{FacadeError, ServiceError};

/// A value carrying a client-assigned request id. The id doubles as
/// the per-request response topic suffix (see [`ServiceConfig`]), so
/// responses from many concurrent clients never share a ring.
pub trait WithRequestId {
    fn request_id(&self) -> u64;
}

/// Configuration for a [`ServiceServer`]/[`ServiceClient`] pair.
///
/// `response_topic` is a prefix, not a ring name by itself: every call
/// gets its own response ring named `{response_topic}-{request_id}`, so
/// one client's response can never be reserved over or evicted by
/// another client's traffic on the same service.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub request_topic: String,
    pub response_topic: String,
    pub buf_num: u32,
    pub permissions: Permissions,
}

impl ServiceConfig {
    pub fn new(service_name: impl AsRef<str>) -> Self {
        let name = service_name.as_ref();
        ServiceConfig {
            request_topic: format!("{name}-req"),
            response_topic: format!("{name}-resp"),
            buf_num: 3,
            permissions: Permissions::default(),
        }
    }
}

fn open_ring(topic: &str, element_size: u32, buf_num: u32, perm: Permissions) -> Result<RingBuffer, FacadeError> {
    let size = required_size(element_size, buf_num);
    let segment = Segment::open_or_create(topic, size, perm)?;
    Ok(RingBuffer::create(segment, element_size, buf_num)?)
}

/// Server side: accepts requests and publishes each response onto the
/// topic named by that request's id.
pub struct ServiceServer<Req, Resp> {
    request_ring: RingBuffer,
    response_topic: String,
    buf_num: u32,
    permissions: Permissions,
    _marker: std::marker::PhantomData<(Req, Resp)>,
}

impl<Req: Pod + Zeroable + WithRequestId, Resp: Pod + Zeroable> ServiceServer<Req, Resp> {
    pub fn bind(config: &ServiceConfig) -> Result<Self, FacadeError> {
        let request_ring = open_ring(
            &config.request_topic,
            std::mem::size_of::<Req>() as u32,
            config.buf_num,
            config.permissions,
        )?;
        Ok(ServiceServer {
            request_ring,
            response_topic: config.response_topic.clone(),
            buf_num: config.buf_num,
            permissions: config.permissions,
            _marker: std::marker::PhantomData,
        })
    }

    /// Block up to `timeout_micros` for a request, then hand back the
    /// request together with a handle bound to that request's own
    /// response topic.
    pub fn serve_one(&self, timeout_micros: u64) -> Result<Option<(Req, ResponseHandle<Resp>)>, FacadeError> {
        self.request_ring.wait_for(timeout_micros);
        match self.request_ring.read_latest(timeout_micros) {
            Ok(bytes) => {
                let mut req = Req::zeroed();
                bytemuck::bytes_of_mut(&mut req).copy_from_slice(&bytes);

                let response_topic = format!("{}-{}", self.response_topic, req.request_id());
                let response_ring = open_ring(
                    &response_topic,
                    std::mem::size_of::<Resp>() as u32,
                    self.buf_num,
                    self.permissions,
                )?;
                Ok(Some((
                    req,
                    ResponseHandle {
                        response_ring,
                        _marker: std::marker::PhantomData,
                    },
                )))
            }
            Err(ringshm_core::RingBufferError::NoFresh) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

/// Publishes exactly one response, onto the topic dedicated to the
/// request it was handed out alongside.
pub struct ResponseHandle<Resp> {
    response_ring: RingBuffer,
    #[allow(dead_code)]
    _marker: std::marker::PhantomData<Resp>,
}

impl<Resp: Pod> ResponseHandle<Resp> {
    pub fn respond(self, resp: &Resp) -> Result<(), FacadeError> {
        Ok(self.response_ring.publish(bytemuck::bytes_of(resp))?)
    }
}

/// Client side: sends a request and waits for the matching response on
/// its own per-request topic.
pub struct ServiceClient<Req, Resp> {
    request_ring: RingBuffer,
    response_topic: String,
    buf_num: u32,
    permissions: Permissions,
    _marker: std::marker::PhantomData<(Req, Resp)>,
}

impl<Req: Pod + Zeroable, Resp: Pod + Zeroable + WithRequestId> ServiceClient<Req, Resp> {
    pub fn connect(config: &ServiceConfig) -> Result<Self, FacadeError> {
        let request_ring = open_ring(
            &config.request_topic,
            std::mem::size_of::<Req>() as u32,
            config.buf_num,
            config.permissions,
        )?;
        Ok(ServiceClient {
            request_ring,
            response_topic: config.response_topic.clone(),
            buf_num: config.buf_num,
            permissions: config.permissions,
            _marker: std::marker::PhantomData,
        })
    }

    /// Publish `req`, then poll/wait `expected_request_id`'s dedicated
    /// response topic until a response arrives or `timeout_micros`
    /// elapses. `expected_request_id` must match the id embedded in
    /// `req` (callers constructing `Req` are responsible for that).
    pub fn call(&self, req: &Req, expected_request_id: u64, timeout_micros: u64) -> Result<Resp, ServiceError> {
        let response_topic = format!("{}-{}", self.response_topic, expected_request_id);
        let response_ring = open_ring(
            &response_topic,
            std::mem::size_of::<Resp>() as u32,
            self.buf_num,
            self.permissions,
        )?;

        self.request_ring.publish(bytemuck::bytes_of(req))?;
        let result = self.await_response(&response_ring, expected_request_id, timeout_micros);

        // This topic exists only for this one call; drop it once
        // answered (or abandoned) so repeated calls don't each leave a
        // permanent shm object behind.
        let _ = Segment::unlink(&response_topic);
        result
    }

    fn await_response(
        &self,
        response_ring: &RingBuffer,
        expected_request_id: u64,
        timeout_micros: u64,
    ) -> Result<Resp, ServiceError> {
        let deadline = std::time::Instant::now() + std::time::Duration::from_micros(timeout_micros);
        loop {
            if let Ok(bytes) = response_ring.read_latest(timeout_micros) {
                let mut resp = Resp::zeroed();
                bytemuck::bytes_of_mut(&mut resp).copy_from_slice(&bytes);
                // The per-request topic already guarantees this response
                // is ours; the id check stays as a sanity assertion.
                if resp.request_id() == expected_request_id {
                    return Ok(resp);
                }
            }
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                return Err(ServiceError::Timeout);
            }
            response_ring
                .wait_for(remaining.as_micros().min(u64::MAX as u128) as u64);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, Pod, Zeroable)]
    #[repr(C)]
    struct Req {
        id: u64,
        payload: i32,
    }

    impl WithRequestId for Req {
        fn request_id(&self) -> u64 {
            self.id
        }
    }

    #[derive(Debug, Clone, Copy, Pod, Zeroable)]
    #[repr(C)]
    struct Resp {
        id: u64,
        payload: i32,
    }

    impl WithRequestId for Resp {
        fn request_id(&self) -> u64 {
            self.id
        }
    }

    fn unique_service_name(tag: &str) -> String {
        format!(
            "/ringshm-service-test-{}-{}-{}",
            tag,
            std::process::id(),
            ringshm_core::now_micros()
        )
    }

    #[test]
    fn single_request_round_trip() {
        let name = unique_service_name("basic");
        let config = ServiceConfig::new(&name);

        let server: ServiceServer<Req, Resp> = ServiceServer::bind(&config).unwrap();
        let client: ServiceClient<Req, Resp> = ServiceClient::connect(&config).unwrap();

        let server_thread = std::thread::spawn(move || {
            let (req, handle) = server.serve_one(2_000_000).unwrap().unwrap();
            handle
                .respond(&Resp {
                    id: req.id,
                    payload: req.payload * 2,
                })
                .unwrap();
        });

        let req = Req { id: 1, payload: 42 };
        let resp = client.call(&req, 1, 2_000_000).unwrap();
        assert_eq!(resp.payload, 84);

        server_thread.join().unwrap();
        Segment::unlink(&config.request_topic).ok();
    }

    #[test]
    fn timeout_with_no_server_returns_timeout_error() {
        let name = unique_service_name("timeout");
        let config = ServiceConfig::new(&name);
        let client: ServiceClient<Req, Resp> = ServiceClient::connect(&config).unwrap();

        let req = Req { id: 7, payload: 1 };
        let err = client.call(&req, 7, 50_000).unwrap_err();
        assert!(matches!(err, ServiceError::Timeout));

        Segment::unlink(&config.request_topic).ok();
    }

    /// Several clients call the same service concurrently. Each must
    /// receive exactly its own response, never another client's —
    /// the scenario the shared-response-ring design used to lose.
    #[test]
    fn concurrent_clients_each_get_their_own_response() {
        let name = unique_service_name("concurrent");
        let config = ServiceConfig::new(&name);

        let server: ServiceServer<Req, Resp> = ServiceServer::bind(&config).unwrap();
        let request_topic = config.request_topic.clone();

        let client_count = 8usize;
        let server_thread = std::thread::spawn(move || {
            for _ in 0..client_count {
                let (req, handle) = server.serve_one(5_000_000).unwrap().unwrap();
                handle
                    .respond(&Resp {
                        id: req.id,
                        payload: req.payload * 2,
                    })
                    .unwrap();
            }
        });

        let client_threads: Vec<_> = (0..client_count)
            .map(|i| {
                let config = config.clone();
                std::thread::spawn(move || {
                    let client: ServiceClient<Req, Resp> = ServiceClient::connect(&config).unwrap();
                    let id = 1000 + i as u64;
                    let req = Req {
                        id,
                        payload: i as i32,
                    };
                    let resp = client.call(&req, id, 5_000_000).unwrap();
                    assert_eq!(resp.id, id);
                    assert_eq!(resp.payload, i as i32 * 2);
                })
            })
            .collect();

        for t in client_threads {
            t.join().unwrap();
        }
        server_thread.join().unwrap();

        Segment::unlink(&request_topic).ok();
    }
}
