//! Client-side state sync for perpetuals trading views.
//!
//! - `engine`: the injectable [`SyncEngine`] owning caches, single flights
//!   and snapshot builders
//! - `resource`: the scopes that can be cached and refreshed
//! - `orchestrator`: one driver task per open scope (poll, invalidate,
//!   suspend, cancel)
//! - `events`: push invalidation
//! - `writes`: write forwarding with post-confirmation invalidation
//!
//! ```ignore
//! let engine = SyncEngine::builder(EngineConfig::default(), reader).build()?;
//! let orchestrator = SyncOrchestrator::new(engine);
//! let mut positions = orchestrator.open(Positions::new(user));
//! let view = positions.wait_for(|v| v.is_loaded()).await?;
//! ```

pub mod config;
pub mod engine;
pub mod events;
pub mod orchestrator;
pub mod resource;
pub mod writes;

pub use config::{EngineConfig, ScopeOptions};
pub use engine::{RefreshMode, ResourceStore, SyncEngine, SyncEngineBuilder};
pub use events::{InvalidationBus, InvalidationEvent, InvalidationReason, InvalidationTarget};
pub use orchestrator::{LoadState, ScopeHandle, ScopePhase, ScopeView, SyncOrchestrator};
pub use resource::{Margin, MarketPrice, OrderBook, Orders, Positions, Resource};
pub use writes::WriteForwarder;
