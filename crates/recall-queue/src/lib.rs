//! Ready-queue and job-queue backends.
//!
//! `memory` serves a single scheduler process; `redis_queue` lets several
//! instances share one index and one worker queue.

pub mod memory;
pub mod redis_queue;

pub use memory::{ChannelJobQueue, InMemoryReadyQueue};
pub use redis_queue::{RedisConnector, RedisJobQueue, RedisReadyQueue};
