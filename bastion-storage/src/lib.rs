//! BASTION Storage - Remote Store, Circuit Breaker and Tiered Cache
//!
//! The resilience layer between request handlers and a slow, sometimes
//! unreachable remote store:
//!
//! - [`RemoteStore`] - the narrow interface a remote key-value store must offer
//! - [`CircuitBreaker`] - fails fast while the remote store is unhealthy
//! - [`RequestCoalescer`] - one in-flight operation per key
//! - [`LocalCache`] - bounded LRU + TTL map used as L1
//! - [`TieredCache`] - L1 in front of a coalesced, breaker-guarded L2
//!
//! [`InMemoryRemoteStore`] stands in for a real server in tests;
//! [`RedisRemoteStore`] is the production backend.

pub mod breaker;
pub mod coalesce;
pub mod local;
pub mod memory;
pub mod redis_store;
pub mod remote;
pub mod sweeper;
pub mod tiered;

pub use breaker::{
    transition, BreakerEvent, BreakerState, CircuitBreaker, CircuitState, FallbackReason,
};
pub use coalesce::RequestCoalescer;
pub use local::LocalCache;
pub use memory::InMemoryRemoteStore;
pub use redis_store::RedisRemoteStore;
pub use remote::{KeyTtl, RemoteStore};
pub use sweeper::{spawn_sweeper, sweeper_task, Sweep, SweepStats};
pub use tiered::TieredCache;
