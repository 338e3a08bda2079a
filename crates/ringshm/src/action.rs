//! Goal/feedback/result pattern (§1): three ring buffers composed, no
//! new concurrency primitive.

use bytemuck::{Pod, Zeroable};
use ringshm_core::{required_size, Permissions, RingBuffer, Segment};

use crate::error::{ActionError, FacadeError};
use crate::service::WithRequestId;

const DEFAULT_FEEDBACK_EXPIRY_MICROS: u64 = 2_000_000;

/// Configuration for an [`ActionServer`]/[`ActionClient`] pair.
///
/// `feedback_topic` and `result_topic` are prefixes: each goal gets
/// its own feedback/result rings named `{topic}-{goal.request_id()}`,
/// so two goals in flight at once never share a ring and can never be
/// cross-wired.
#[derive(Debug, Clone)]
pub struct ActionConfig {
    pub goal_topic: String,
    pub feedback_topic: String,
    pub result_topic: String,
    pub buf_num: u32,
    pub permissions: Permissions,
}

impl ActionConfig {
    pub fn new(action_name: impl AsRef<str>) -> Self {
        let name = action_name.as_ref();
        ActionConfig {
            goal_topic: format!("{name}-goal"),
            feedback_topic: format!("{name}-feedback"),
            result_topic: format!("{name}-result"),
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

/// Server side: accepts goals and publishes feedback/result for each
/// onto that goal's own topics.
pub struct ActionServer<Goal, Feedback, Outcome> {
    goal_ring: RingBuffer,
    feedback_topic: String,
    result_topic: String,
    buf_num: u32,
    permissions: Permissions,
    _marker: std::marker::PhantomData<(Goal, Feedback, Outcome)>,
}

impl<Goal, Feedback, Outcome> ActionServer<Goal, Feedback, Outcome>
where
    Goal: Pod + Zeroable + WithRequestId,
    Feedback: Pod,
    Outcome: Pod,
{
    pub fn bind(config: &ActionConfig) -> Result<Self, FacadeError> {
        let goal_ring = open_ring(
            &config.goal_topic,
            std::mem::size_of::<Goal>() as u32,
            config.buf_num,
            config.permissions,
        )?;
        Ok(ActionServer {
            goal_ring,
            feedback_topic: config.feedback_topic.clone(),
            result_topic: config.result_topic.clone(),
            buf_num: config.buf_num,
            permissions: config.permissions,
            _marker: std::marker::PhantomData,
        })
    }

    /// Block up to `timeout_micros` for a new goal, then hand it back
    /// together with a handle bound to that goal's own feedback/result
    /// topics.
    pub fn accept_goal(
        &self,
        timeout_micros: u64,
    ) -> Result<Option<(Goal, GoalHandle<Feedback, Outcome>)>, FacadeError> {
        self.goal_ring.wait_for(timeout_micros);
        match self.goal_ring.read_latest(timeout_micros) {
            Ok(bytes) => {
                let mut goal = Goal::zeroed();
                bytemuck::bytes_of_mut(&mut goal).copy_from_slice(&bytes);

                let feedback_topic = format!("{}-{}", self.feedback_topic, goal.request_id());
                let result_topic = format!("{}-{}", self.result_topic, goal.request_id());
                let feedback_ring = open_ring(
                    &feedback_topic,
                    std::mem::size_of::<Feedback>() as u32,
                    self.buf_num,
                    self.permissions,
                )?;
                let result_ring = open_ring(
                    &result_topic,
                    std::mem::size_of::<Outcome>() as u32,
                    self.buf_num,
                    self.permissions,
                )?;

                Ok(Some((
                    goal,
                    GoalHandle {
                        feedback_ring,
                        result_ring,
                        _marker: std::marker::PhantomData,
                    },
                )))
            }
            Err(ringshm_core::RingBufferError::NoFresh) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

/// Publishes feedback and the final result for exactly one goal, onto
/// the topics dedicated to it.
pub struct GoalHandle<Feedback, Outcome> {
    feedback_ring: RingBuffer,
    result_ring: RingBuffer,
    #[allow(dead_code)]
    _marker: std::marker::PhantomData<(Feedback, Outcome)>,
}

impl<Feedback: Pod, Outcome: Pod> GoalHandle<Feedback, Outcome> {
    pub fn publish_feedback(&self, feedback: &Feedback) -> Result<(), FacadeError> {
        Ok(self.feedback_ring.publish(bytemuck::bytes_of(feedback))?)
    }

    pub fn publish_result(&self, outcome: &Outcome) -> Result<(), FacadeError> {
        Ok(self.result_ring.publish(bytemuck::bytes_of(outcome))?)
    }
}

/// Client side: sends goals and tracks each one's progress
/// independently.
pub struct ActionClient<Goal, Feedback, Outcome> {
    goal_ring: RingBuffer,
    _marker: std::marker::PhantomData<(Goal, Feedback, Outcome)>,
}

impl<Goal, Feedback, Outcome> ActionClient<Goal, Feedback, Outcome>
where
    Goal: Pod + Zeroable + WithRequestId,
    Feedback: Pod + Zeroable,
    Outcome: Pod + Zeroable,
{
    pub fn connect(config: &ActionConfig) -> Result<Self, FacadeError> {
        Ok(ActionClient {
            goal_ring: open_ring(
                &config.goal_topic,
                std::mem::size_of::<Goal>() as u32,
                config.buf_num,
                config.permissions,
            )?,
            _marker: std::marker::PhantomData,
        })
    }

    /// Publish `goal` and return a handle for tracking its progress on
    /// its own feedback/result topics, keyed by `goal.request_id()` so
    /// concurrent goals on the same client (or different clients) never
    /// cross-wire.
    pub fn send_goal(
        &self,
        goal: &Goal,
        config: &ActionConfig,
    ) -> Result<ActionHandle<Feedback, Outcome>, FacadeError> {
        let feedback_topic = format!("{}-{}", config.feedback_topic, goal.request_id());
        let result_topic = format!("{}-{}", config.result_topic, goal.request_id());

        let feedback_ring = open_ring(
            &feedback_topic,
            std::mem::size_of::<Feedback>() as u32,
            config.buf_num,
            config.permissions,
        )?;
        let result_ring = open_ring(
            &result_topic,
            std::mem::size_of::<Outcome>() as u32,
            config.buf_num,
            config.permissions,
        )?;

        self.goal_ring.publish(bytemuck::bytes_of(goal))?;

        Ok(ActionHandle {
            feedback_topic,
            result_topic,
            feedback_ring,
            result_ring,
            expiry_micros: DEFAULT_FEEDBACK_EXPIRY_MICROS,
            _marker: std::marker::PhantomData,
        })
    }
}

/// Tracks the progress of one in-flight goal. Each handle owns a
/// dedicated feedback/result topic pair and unlinks both when dropped.
pub struct ActionHandle<Feedback, Outcome> {
    feedback_topic: String,
    result_topic: String,
    feedback_ring: RingBuffer,
    result_ring: RingBuffer,
    expiry_micros: u64,
    _marker: std::marker::PhantomData<(Feedback, Outcome)>,
}

impl<Feedback: Pod + Zeroable, Outcome: Pod + Zeroable> ActionHandle<Feedback, Outcome> {
    /// Non-blocking read of the freshest feedback within the expiry
    /// horizon (§4.2.4).
    pub fn poll_feedback(&self) -> Result<Option<Feedback>, FacadeError> {
        match self.feedback_ring.read_latest(self.expiry_micros) {
            Ok(bytes) => {
                let mut feedback = Feedback::zeroed();
                bytemuck::bytes_of_mut(&mut feedback).copy_from_slice(&bytes);
                Ok(Some(feedback))
            }
            Err(ringshm_core::RingBufferError::NoFresh) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Block on this goal's result ring until it completes or
    /// `timeout_micros` elapses.
    pub fn wait_result(&self, timeout_micros: u64) -> Result<Outcome, ActionError> {
        let deadline = std::time::Instant::now() + std::time::Duration::from_micros(timeout_micros);
        loop {
            if let Ok(bytes) = self.result_ring.read_latest(timeout_micros) {
                let mut outcome = Outcome::zeroed();
                bytemuck::bytes_of_mut(&mut outcome).copy_from_slice(&bytes);
                return Ok(outcome);
            }
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                return Err(ActionError::Timeout);
            }
            self.result_ring
                .wait_for(remaining.as_micros().min(u64::MAX as u128) as u64);
        }
    }
}

impl<Feedback, Outcome> Drop for ActionHandle<Feedback, Outcome> {
    fn drop(&mut self) {
        let _ = Segment::unlink(&self.feedback_topic);
        let _ = Segment::unlink(&self.result_topic);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, Pod, Zeroable)]
    #[repr(C)]
    struct Goal {
        id: u64,
        target: i32,
    }

    impl WithRequestId for Goal {
        fn request_id(&self) -> u64 {
            self.id
        }
    }

    #[derive(Debug, Clone, Copy, Pod, Zeroable)]
    #[repr(C)]
    struct Feedback {
        progress: i32,
    }

    #[derive(Debug, Clone, Copy, Pod, Zeroable)]
    #[repr(C)]
    struct Outcome {
        total: i32,
    }

    fn unique_action_name(tag: &str) -> String {
        format!(
            "/ringshm-action-test-{}-{}-{}",
            tag,
            std::process::id(),
            ringshm_core::now_micros()
        )
    }

    #[test]
    fn single_goal_feedback_then_result() {
        let name = unique_action_name("basic");
        let config = ActionConfig::new(&name);

        let server: ActionServer<Goal, Feedback, Outcome> = ActionServer::bind(&config).unwrap();
        let client: ActionClient<Goal, Feedback, Outcome> = ActionClient::connect(&config).unwrap();

        let goal = Goal { id: 1, target: 10 };
        let handle = client.send_goal(&goal, &config).unwrap();

        let server_thread = std::thread::spawn(move || {
            let (goal, goal_handle) = server.accept_goal(2_000_000).unwrap().unwrap();
            goal_handle.publish_feedback(&Feedback { progress: 5 }).unwrap();
            goal_handle
                .publish_result(&Outcome {
                    total: goal.target * 2,
                })
                .unwrap();
        });

        let outcome = handle.wait_result(2_000_000).unwrap();
        assert_eq!(outcome.total, 20);

        server_thread.join().unwrap();
        Segment::unlink(&config.goal_topic).ok();
    }

    /// Two goals in flight at once on the same action must never see
    /// each other's feedback or result.
    #[test]
    fn concurrent_goals_do_not_cross_wire() {
        let name = unique_action_name("concurrent");
        let config = ActionConfig::new(&name);

        let server: ActionServer<Goal, Feedback, Outcome> = ActionServer::bind(&config).unwrap();

        let goal_a = Goal { id: 11, target: 3 };
        let goal_b = Goal { id: 22, target: 9 };

        let client_a: ActionClient<Goal, Feedback, Outcome> = ActionClient::connect(&config).unwrap();
        let client_b: ActionClient<Goal, Feedback, Outcome> = ActionClient::connect(&config).unwrap();
        let handle_a = client_a.send_goal(&goal_a, &config).unwrap();
        let handle_b = client_b.send_goal(&goal_b, &config).unwrap();

        let server_thread = std::thread::spawn(move || {
            for _ in 0..2 {
                let (goal, goal_handle) = server.accept_goal(3_000_000).unwrap().unwrap();
                goal_handle
                    .publish_result(&Outcome {
                        total: goal.target * 2,
                    })
                    .unwrap();
            }
        });

        let outcome_a = handle_a.wait_result(3_000_000).unwrap();
        let outcome_b = handle_b.wait_result(3_000_000).unwrap();
        assert_eq!(outcome_a.total, 6);
        assert_eq!(outcome_b.total, 18);

        server_thread.join().unwrap();
        Segment::unlink(&config.goal_topic).ok();
    }
}
