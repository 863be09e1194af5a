//! sshtun-test-utils: test doubles for the tunnel engine.
//!
//! Provides an SSH honey-pot server that accepts any credentials, an
//! in-memory fake TUN device, and unencrypted test key files, so the
//! engine's transport and pump paths are testable without real devices
//! or remote hosts.

pub mod fake_tun;
pub mod honeypot;
pub mod test_keys;

pub use fake_tun::FakeTun;
pub use honeypot::HoneyPot;
pub use test_keys::write_test_key;
