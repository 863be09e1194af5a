//! Tunnel configuration model and JSON persistence.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration as StdDuration;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::constants::USR_BIN_SCP;
use crate::error::{Error, Result};

/// Transport protocol token for the SSH dial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// IPv4 only.
    #[default]
    Tcp4,
    /// IPv6 only.
    Tcp6,
    /// First resolved address of either family.
    Tcp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp4 => write!(f, "tcp4"),
            Protocol::Tcp6 => write!(f, "tcp6"),
            Protocol::Tcp => write!(f, "tcp"),
        }
    }
}

/// A duration that serializes as a human-readable string (`"2m"`) and
/// deserializes from either such a string or a raw nanosecond integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Duration(pub StdDuration);

impl Duration {
    pub fn from_secs(secs: u64) -> Self {
        Duration(StdDuration::from_secs(secs))
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    pub fn as_std(&self) -> StdDuration {
        self.0
    }
}

impl From<StdDuration> for Duration {
    fn from(d: StdDuration) -> Self {
        Duration(d)
    }
}

impl fmt::Display for Duration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        humantime::format_duration(self.0).fmt(f)
    }
}

impl Serialize for Duration {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(self.0).to_string())
    }
}

impl<'de> Deserialize<'de> for Duration {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct DurationVisitor;

        impl<'de> Visitor<'de> for DurationVisitor {
            type Value = Duration;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a duration string or a nanosecond count")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<Duration, E> {
                Ok(Duration(StdDuration::from_nanos(v)))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<Duration, E> {
                if v < 0 {
                    return Err(E::custom("negative duration"));
                }
                Ok(Duration(StdDuration::from_nanos(v as u64)))
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> std::result::Result<Duration, E> {
                if v < 0.0 {
                    return Err(E::custom("negative duration"));
                }
                Ok(Duration(StdDuration::from_nanos(v as u64)))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<Duration, E> {
                humantime::parse_duration(v)
                    .map(Duration)
                    .map_err(|e| E::custom(format!("invalid duration {:?}: {}", v, e)))
            }
        }

        deserializer.deserialize_any(DurationVisitor)
    }
}

/// Configuration of a single tunnel.
///
/// Field names and accepted value shapes are the on-disk contract; see the
/// repository README for the full key reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tunnel {
    /// Display name used in logs.
    #[serde(default)]
    pub name: String,
    /// Free-form operator note.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub comment: String,
    /// Transport protocol token.
    #[serde(default)]
    pub protocol: Protocol,
    /// Local interface address as `A.B.C.D/N`.
    #[serde(default)]
    pub local_network: String,
    /// Requested local TUN device name; the kernel may assign another.
    #[serde(default)]
    pub local_tun_device: String,
    /// Local MTU; 0 keeps the kernel default.
    #[serde(default)]
    pub local_mtu: i32,
    /// Remote endpoint as `host:port`.
    #[serde(default)]
    pub remote: String,
    /// Remote interface address as `A.B.C.D/N`.
    #[serde(default)]
    pub remote_network: String,
    /// Remote TUN device name created by the helper.
    #[serde(default)]
    pub remote_tun_device: String,
    /// Remote MTU; 0 keeps the kernel default.
    #[serde(default)]
    pub remote_mtu: i32,
    /// Login user on the remote host.
    #[serde(default)]
    pub remote_user: String,
    /// Authenticate via the running SSH agent instead of key files.
    #[serde(default)]
    pub use_ssh_agent: bool,
    /// Ordered private key files tried for publickey authentication.
    #[serde(default)]
    pub private_key_files: Vec<String>,
    /// Remote directory the helper is uploaded to; empty means `/tmp`.
    #[serde(default)]
    pub remote_upload_directory: String,
    /// Path of the remote copy program; empty means `/usr/bin/scp`.
    #[serde(default)]
    pub remote_scp: String,
    /// Whether the supervisor runs this tunnel.
    #[serde(default)]
    pub enable: bool,
    /// Interval between keepalive probes; zero disables keepalive.
    #[serde(default)]
    pub keepalive_interval: Duration,
    /// Consecutive keepalive failures tolerated before force-closing.
    #[serde(default)]
    pub keepalive_max_error_count: u32,
}

impl Default for Tunnel {
    fn default() -> Self {
        Tunnel {
            name: "example".into(),
            comment: String::new(),
            protocol: Protocol::Tcp4,
            local_network: "172.18.0.1/24".into(),
            local_tun_device: "tun0".into(),
            local_mtu: 0,
            remote: "localhost:22".into(),
            remote_network: "172.18.0.2/24".into(),
            remote_tun_device: "tun0".into(),
            remote_mtu: 0,
            remote_user: invoking_user(),
            use_ssh_agent: false,
            private_key_files: vec!["~/.ssh/id_rsa".into()],
            remote_upload_directory: String::new(),
            remote_scp: USR_BIN_SCP.into(),
            enable: false,
            keepalive_interval: Duration::from_secs(120),
            keepalive_max_error_count: 5,
        }
    }
}

impl Tunnel {
    /// Remote copy program, defaulted when the configuration left it empty.
    pub fn remote_scp_or_default(&self) -> &str {
        if self.remote_scp.is_empty() {
            USR_BIN_SCP
        } else {
            &self.remote_scp
        }
    }

    /// Remote upload directory, defaulted when the configuration left it
    /// empty.
    pub fn remote_upload_directory_or_default(&self) -> &str {
        if self.remote_upload_directory.is_empty() {
            "/tmp"
        } else {
            &self.remote_upload_directory
        }
    }
}

/// The ordered set of configured tunnels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Tunnels {
    #[serde(default)]
    pub tunnels: Vec<Tunnel>,
}

impl Tunnels {
    /// One disabled example tunnel with the documented defaults.
    pub fn default_config() -> Tunnels {
        Tunnels {
            tunnels: vec![Tunnel::default()],
        }
    }

    /// Total number of configured tunnels.
    pub fn total(&self) -> usize {
        self.tunnels.len()
    }

    /// Number of tunnels marked enabled.
    pub fn enabled(&self) -> usize {
        self.tunnels.iter().filter(|t| t.enable).count()
    }

    /// Load a configuration file, normalizing defaults for empty fields.
    pub fn load(path: &str) -> Result<Tunnels> {
        let file = fs::File::open(resolve_tilde(path))?;
        let mut config: Tunnels =
            serde_json::from_reader(std::io::BufReader::new(file)).map_err(|e| Error::Config {
                message: format!("{}: {}", path, e),
            })?;
        for tunnel in &mut config.tunnels {
            if tunnel.remote_scp.is_empty() {
                tunnel.remote_scp = USR_BIN_SCP.into();
            }
        }
        Ok(config)
    }

    /// Load a configuration file, falling back to the default configuration
    /// when the file is missing or unreadable.
    pub fn load_or_default(path: &str) -> Tunnels {
        Tunnels::load(path).unwrap_or_else(|_| Tunnels::default_config())
    }

    /// Load (or default) and immediately persist, materializing defaults on
    /// first run.
    pub fn load_and_save(path: &str) -> Result<Tunnels> {
        let config = Tunnels::load_or_default(path);
        config.save(path)?;
        Ok(config)
    }

    /// Persist as pretty-printed JSON, creating parent directories.
    pub fn save(&self, path: &str) -> Result<()> {
        let full = resolve_tilde(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut buf = serde_json::to_vec_pretty(self).map_err(|e| Error::Config {
            message: format!("failed to encode configuration: {}", e),
        })?;
        buf.push(b'\n');
        fs::write(&full, buf)?;
        Ok(())
    }
}

/// Resolve a leading `~/` against the invoking user's home directory.
pub fn resolve_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    Path::new(path).to_path_buf()
}

fn invoking_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn temp_config_path() -> String {
        static COUNTER: AtomicU32 = AtomicU32::new(0);
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        std::env::temp_dir()
            .join(format!("sshtun-config-test-{}-{}.json", std::process::id(), n))
            .to_string_lossy()
            .into_owned()
    }

    #[test]
    fn default_config_has_one_disabled_example() {
        let config = Tunnels::default_config();
        assert_eq!(config.total(), 1);
        assert_eq!(config.enabled(), 0);
        let tunnel = &config.tunnels[0];
        assert_eq!(tunnel.name, "example");
        assert_eq!(tunnel.protocol, Protocol::Tcp4);
        assert_eq!(tunnel.local_network, "172.18.0.1/24");
        assert_eq!(tunnel.remote, "localhost:22");
        assert_eq!(tunnel.remote_scp, USR_BIN_SCP);
        assert_eq!(tunnel.keepalive_interval, Duration::from_secs(120));
        assert_eq!(tunnel.keepalive_max_error_count, 5);
    }

    #[test]
    fn save_and_reload_round_trips_all_fields() {
        let path = temp_config_path();
        let mut config = Tunnels::default_config();
        config.tunnels[0].comment = "lab uplink".into();
        config.tunnels[0].local_mtu = 1500;
        config.tunnels[0].use_ssh_agent = true;
        config.save(&path).expect("save");

        let reloaded = Tunnels::load(&path).expect("load");
        assert_eq!(config, reloaded);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn load_and_save_materializes_defaults() {
        let path = temp_config_path();
        let config = Tunnels::load_and_save(&path).expect("load_and_save");
        assert_eq!(config.total(), 1);
        let reloaded = Tunnels::load(&path).expect("reload");
        assert_eq!(config, reloaded);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn load_missing_file_fails_but_or_default_does_not() {
        let path = temp_config_path();
        assert!(Tunnels::load(&path).is_err());
        let config = Tunnels::load_or_default(&path);
        assert_eq!(config.total(), 1);
    }

    #[test]
    fn load_normalizes_empty_remote_scp() {
        let path = temp_config_path();
        let json = r#"{"tunnels":[{"name":"t","remote_scp":""}]}"#;
        std::fs::write(&path, json).expect("write");
        let config = Tunnels::load(&path).expect("load");
        assert_eq!(config.tunnels[0].remote_scp, USR_BIN_SCP);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn duration_decodes_from_human_string() {
        let d: Duration = serde_json::from_str(r#""2m0s""#).expect("decode");
        assert_eq!(d, Duration::from_secs(120));
    }

    #[test]
    fn duration_decodes_from_raw_nanoseconds() {
        let d: Duration = serde_json::from_str("60000000000").expect("decode");
        assert_eq!(d, Duration::from_secs(60));
    }

    #[test]
    fn duration_rejects_nonsense() {
        assert!(serde_json::from_str::<Duration>(r#""nonsense""#).is_err());
    }

    #[test]
    fn duration_encodes_as_human_string() {
        let encoded = serde_json::to_string(&Duration::from_secs(120)).expect("encode");
        assert_eq!(encoded, r#""2m""#);
        let encoded = serde_json::to_string(&Duration::from_secs(30)).expect("encode");
        assert_eq!(encoded, r#""30s""#);
    }

    #[test]
    fn duration_round_trips_through_json() {
        for secs in [1u64, 30, 60, 120, 3600] {
            let d = Duration::from_secs(secs);
            let json = serde_json::to_string(&d).expect("encode");
            let back: Duration = serde_json::from_str(&json).expect("decode");
            assert_eq!(d, back);
        }
    }

    #[test]
    fn protocol_tokens_round_trip() {
        for (proto, token) in [
            (Protocol::Tcp4, r#""tcp4""#),
            (Protocol::Tcp6, r#""tcp6""#),
            (Protocol::Tcp, r#""tcp""#),
        ] {
            assert_eq!(serde_json::to_string(&proto).expect("encode"), token);
            let back: Protocol = serde_json::from_str(token).expect("decode");
            assert_eq!(back, proto);
        }
        assert!(serde_json::from_str::<Protocol>(r#""udp""#).is_err());
    }

    #[test]
    fn enabled_counts_enabled_tunnels_only() {
        let mut config = Tunnels::default_config();
        config.tunnels.push(Tunnel {
            name: "second".into(),
            enable: true,
            ..Tunnel::default()
        });
        assert_eq!(config.total(), 2);
        assert_eq!(config.enabled(), 1);
    }

    #[test]
    fn resolve_tilde_expands_home_prefix() {
        if let Some(home) = dirs::home_dir() {
            assert_eq!(resolve_tilde("~/.ssh/id_rsa"), home.join(".ssh/id_rsa"));
        }
        assert_eq!(resolve_tilde("/etc/sshtun.json"), PathBuf::from("/etc/sshtun.json"));
        assert_eq!(resolve_tilde("relative.json"), PathBuf::from("relative.json"));
    }

    #[test]
    fn defaulted_accessors_fall_back() {
        let tunnel = Tunnel {
            remote_scp: String::new(),
            remote_upload_directory: String::new(),
            ..Tunnel::default()
        };
        assert_eq!(tunnel.remote_scp_or_default(), USR_BIN_SCP);
        assert_eq!(tunnel.remote_upload_directory_or_default(), "/tmp");

        let tunnel = Tunnel {
            remote_scp: "/usr/local/bin/scp".into(),
            remote_upload_directory: "/var/tmp".into(),
            ..Tunnel::default()
        };
        assert_eq!(tunnel.remote_scp_or_default(), "/usr/local/bin/scp");
        assert_eq!(tunnel.remote_upload_directory_or_default(), "/var/tmp");
    }
}
