//! Tether: the control plane side of a proxy-node fleet.
//!
//! Issues the deployment's certificates, authenticates nodes by bearer
//! token, and keeps one supervised connection per enabled node, pushing
//! user changes down to it.

pub mod auth;
pub mod clock;
pub mod commands;
pub mod config;
pub mod events;
pub mod mtls;
pub mod node;
pub mod pki;
pub mod resources;
pub mod server;
pub mod store;
