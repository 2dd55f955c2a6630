//! nanlink Runtime
//!
//! The engine of nanlink:
//! - `SessionOrchestrator`: the single-writer loop driving one role
//! - `RadioSession`, `Advertiser`/`Discoverer`: discovery-layer components
//! - `LinkNegotiator`: the one ephemeral data-path request
//! - `StreamChannel`: the line-oriented TCP chat channel
//!
//! `nanlink-core` provides the stable types these components exchange.

pub mod builder;
pub mod link;
pub mod orchestrator;
pub mod roles;
pub mod session;
pub mod stream;

pub use builder::{create_test_runtime, RuntimeBuilder, RuntimeHandle};
pub use link::LinkNegotiator;
pub use orchestrator::SessionOrchestrator;
pub use roles::{Advertiser, Discoverer, RoleSession};
pub use session::{AttachStatus, RadioSession};
pub use stream::StreamChannel;

// Re-export core types for convenience
pub use nanlink_core::{
    AppEvent, AppEventReceiver, Command, CommandSender, Event, NanConfig, NanError, NanResult,
    OrchestratorState, Role, ServiceDescriptor,
};
