//! socialmesh - event-driven consistency core
//!
//! Shared runtime for the social media services: a resilient broker
//! connection, domain event publishing and consumption over a topic
//! exchange, a read-through cache, and coordination that keeps caches and
//! peer services consistent with committed writes.

pub mod bus;
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod dlq;
pub mod effects;
pub mod events;
pub mod facade;
pub mod store;
pub mod utils;

pub use facade::{CoreError, ServiceCore, ServiceCoreBuilder};
