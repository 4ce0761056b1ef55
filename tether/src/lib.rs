//! Tether keeps a service instance advertised in an etcd-compatible
//! coordination store under a lease, resolves logical service names into live
//! address sets through prefix watches, and hands RPC callers load-balanced,
//! pooled transport connections.
//!
//! The crate is organized around three seams:
//!
//! - [`registry::Registrar`] owns one lease and one key per running instance
//!   and keeps them alive across transient outages.
//! - [`discovery::Discover`] turns a [`discovery::Target`] into a live
//!   [`discovery::Instance`] set and broadcasts changes to its consumer.
//! - [`pool::ServicePool`] and the [`loadbalance`] pickers decide which local
//!   transport and which remote instance serve a call.
//!
//! [`client::ClientFactory`] wires the three together for a target service.

pub mod client;
pub mod discovery;
pub mod loadbalance;
pub mod net;
pub mod pool;
pub mod registry;
pub mod store;

pub use faststr::FastStr;
pub use metainfo::METAINFO;

/// Boxed error used at trait boundaries.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;
