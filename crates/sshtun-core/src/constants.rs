//! Shared constants.

/// The uid the privilege gate escalates to for device configuration.
pub const ROOT: u32 = 0;

/// Default location of the tunnel configuration file.
pub const DEFAULT_CONFIG_FILE: &str = "~/.config/sshtun/config.json";

/// Environment variable naming the SSH agent socket.
pub const SSH_AUTH_SOCK: &str = "SSH_AUTH_SOCK";

/// The TUN clone device.
pub const DEV_NET_TUN: &str = "/dev/net/tun";

/// Default remote copy program used for helper upload.
pub const USR_BIN_SCP: &str = "/usr/bin/scp";

/// Timeout applied to the TCP dial and to the SSH handshake.
pub const DIAL_TIMEOUT_SECS: u64 = 30;

/// Delay between supervisor restarts of a failed tunnel.
pub const RESTART_DELAY_SECS: u64 = 5;
