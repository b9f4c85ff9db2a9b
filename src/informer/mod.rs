//! Watch-backed caches and the coordinator that starts them.
//!
//! Each [`InformerFactory`] hands out shared [`Store`]s. Every store is fed by
//! a [`Reflector`] which is registered with the client set's
//! [`LifecycleCoordinator`] and launched on [`LifecycleCoordinator::start`].

mod coordinator;
mod factory;
mod reflector;
mod source;
mod store;

pub use coordinator::{
    wait_for_cache_sync, Launch, LifecycleCoordinator, LifecycleState, DEFAULT_POLL_INTERVAL,
    FAST_POLL_INTERVAL, MIN_POLL_INTERVAL,
};
pub use factory::InformerFactory;
pub use reflector::Reflector;
pub use source::{ApiSource, Event, EventStream, ListerWatcher, Listing, MetadataSource, Selectors};
pub use store::{HasSynced, ObjectKey, Store};
