#![doc = include_str!("../README.md")]

pub mod action;
pub mod diagnostics;
pub mod error;
pub mod pubsub;
pub mod service;

pub use error::{ActionError, FacadeError, ServiceError};
pub use pubsub::{Publisher, PublisherBuilder, ShmSessionConfig, Subscriber, SubscriberBuilder};
pub use service::WithRequestId;
