//! Control plane that provisions, pools, and dispatches containerised AI
//! agent sandboxes.
//!
//! The crate is organised around three concerns: the [`pool`] keeps warm
//! sandboxes ready and bounds total container usage, the [`session`] pipeline
//! turns a create request into a ready sandbox, and the [`dispatch`] layer
//! bridges agent gRPC streams onto per-session pub/sub topics.

pub mod api;
pub mod config;
pub mod dispatch;
pub mod events;
pub mod monitor;
pub mod pool;
pub mod proto;
pub mod queue;
pub mod sandbox;
pub mod server;
pub mod service;
pub mod session;
