//! kp-core: Core abstractions and configuration for kubeplex
//!
//! This crate provides the expiring cache, kubeconfig parsing, the context
//! store and configuration structures used by the gateway.

pub mod cache;
pub mod config;
pub mod error;
pub mod kubeconfig;
pub mod time;

pub use cache::ExpiringCache;
pub use error::KpError;
pub use kubeconfig::{Context, ContextSource, ContextStore};
