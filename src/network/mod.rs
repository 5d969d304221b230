//! Network Module
//!
//! Connection listener and the client half of the staging protocol.
//!
//! ## Architecture
//! - Single acceptor loop polling a shutdown flag
//! - One clerk thread per connection
//! - Every clerk shares the same `Engine`

mod server;
mod client;

pub use server::Server;
pub use client::StagingClient;
