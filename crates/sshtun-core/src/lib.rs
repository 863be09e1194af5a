//! sshtun-core: tunnel engine for point-to-point layer-3 VPNs over SSH.
//!
//! This crate provides:
//! - Tunnel configuration model with JSON persistence
//! - Linux TUN device driver (create, address, netmask, MTU, link up)
//! - Scoped effective-UID privilege gate for setuid-root deployments
//! - SSH client transport (key file and agent authentication)
//! - Helper binary transfer over the scp sink protocol
//! - Bidirectional byte pump between TUN and SSH session stdio
//! - Application-layer keepalive with failure accounting
//! - Tunnel lifecycle composition and the multi-tunnel supervisor

pub mod config;
pub mod constants;
pub mod crand;
pub mod error;
pub mod keepalive;
pub mod logging;
pub mod privilege;
pub mod pump;
pub mod ssh;
pub mod transfer;
pub mod tun;
pub mod tunnel;

pub use config::{Tunnel, Tunnels};
pub use error::{Error, Result};
pub use logging::{init_logging, LogFormat};
pub use tunnel::OpenContext;
