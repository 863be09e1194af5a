//! SSH client transport.
//!
//! Dials the remote endpoint with a cancellation-aware TCP connect,
//! authenticates with key files or the running SSH agent, and exposes the
//! session-channel surface the tunnel engine needs.

use std::borrow::Cow;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Handle, Msg};
use russh::{Channel, ChannelMsg, Disconnect};
use russh_keys::key;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{resolve_tilde, Protocol, Tunnel};
use crate::constants::{DIAL_TIMEOUT_SECS, SSH_AUTH_SOCK};
use crate::error::{Error, Result};
use crate::keepalive::AliveTransport;

/// An authenticated SSH connection to a tunnel's remote endpoint.
pub struct SshClient {
    handle: Handle<InsecureHandler>,
    remote: String,
}

/// Host identities are intentionally not verified: the transport trusts
/// the operator's endpoint configuration, and every connect logs the
/// compromise.
struct InsecureHandler;

#[async_trait]
impl client::Handler for InsecureHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        warn!("Skipping SSH host key verification (insecure)");
        Ok(true)
    }
}

impl SshClient {
    /// Dial and authenticate per the tunnel configuration.
    ///
    /// Authentication material (key files or agent identities) is
    /// collected before any network activity so configuration problems
    /// surface without touching the remote. The TCP connect honors the
    /// protocol token (`tcp4`/`tcp6`/`tcp`), a 30 second timeout, and
    /// cancellation of `cancel`. The caller must `close` the returned
    /// client.
    pub async fn dial(cfg: &Tunnel, cancel: &CancellationToken) -> Result<SshClient> {
        let material = collect_auth_material(cfg).await?;

        let timeout = Duration::from_secs(DIAL_TIMEOUT_SECS);
        let addr = resolve_endpoint(cfg.protocol, &cfg.remote).await?;
        debug!(remote = %cfg.remote, addr = %addr, proto = %cfg.protocol, "Dialing");

        let stream = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(Error::Transport {
                    message: format!("dial {} canceled", cfg.remote),
                });
            }
            result = tokio::time::timeout(timeout, TcpStream::connect(addr)) => {
                result
                    .map_err(|_| Error::Timeout)?
                    .map_err(|e| Error::Transport {
                        message: format!("dial {}: {}", cfg.remote, e),
                    })?
            }
        };

        let config = Arc::new(client::Config::default());
        let mut handle = tokio::time::timeout(
            timeout,
            client::connect_stream(config, stream, InsecureHandler),
        )
        .await
        .map_err(|_| Error::Timeout)?
        .map_err(|e| Error::Transport {
            message: format!("SSH handshake with {} failed: {}", cfg.remote, e),
        })?;

        let authenticated = authenticate(&mut handle, &cfg.remote_user, material).await?;
        if !authenticated {
            return Err(Error::AuthenticationFailed);
        }

        Ok(SshClient {
            handle,
            remote: cfg.remote.clone(),
        })
    }

    /// The configured remote endpoint.
    pub fn remote(&self) -> &str {
        &self.remote
    }

    /// Open a session channel for exec or subsystem use.
    pub async fn open_session(&self) -> Result<Channel<Msg>> {
        self.handle
            .channel_open_session()
            .await
            .map_err(|e| Error::Transport {
                message: format!("failed to open session on {}: {}", self.remote, e),
            })
    }

    /// Run `cmd` to completion and return its stdout.
    ///
    /// A non-zero exit status is an error carrying the combined output.
    pub async fn run(&self, cmd: &str) -> Result<String> {
        let mut channel = self.open_session().await?;
        channel.exec(true, cmd).await.map_err(|e| Error::Transport {
            message: format!("failed to execute {:?}: {}", cmd, e),
        })?;

        let mut stdout: Vec<u8> = Vec::new();
        let mut stderr: Vec<u8> = Vec::new();
        let mut exit_status: Option<u32> = None;
        loop {
            match channel.wait().await {
                Some(ChannelMsg::Data { data }) => stdout.extend_from_slice(&data),
                Some(ChannelMsg::ExtendedData { data, ext: 1 }) => {
                    stderr.extend_from_slice(&data);
                }
                Some(ChannelMsg::ExitStatus { exit_status: code }) => exit_status = Some(code),
                Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => break,
                _ => {}
            }
        }

        match exit_status {
            Some(code) if code != 0 => Err(Error::Protocol {
                message: format!(
                    "{:?} exited with status {}: {}",
                    cmd,
                    code,
                    combined_output(&stdout, &stderr)
                ),
            }),
            _ => Ok(String::from_utf8_lossy(&stdout).into_owned()),
        }
    }

    /// Disconnect the underlying connection, unblocking all sessions.
    pub async fn close(&self) {
        let _ = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "")
            .await;
    }

    /// Whether the connection is already gone.
    pub fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }
}

#[async_trait]
impl AliveTransport for SshClient {
    /// The OpenSSH client's server-alive probe: a `keepalive@openssh.com`
    /// global request with want-reply set and no payload.
    async fn alive_check(&self) -> Result<()> {
        self.handle
            .send_keepalive(true)
            .await
            .map_err(|e| Error::Transport {
                message: format!("keepalive to {} failed: {}", self.remote, e),
            })
    }

    async fn force_close(&self) {
        self.close().await;
    }
}

/// Resolve `host:port`, honoring the address-family restriction of the
/// protocol token.
async fn resolve_endpoint(protocol: Protocol, remote: &str) -> Result<SocketAddr> {
    let addrs = tokio::net::lookup_host(remote)
        .await
        .map_err(|e| Error::Transport {
            message: format!("resolve {}: {}", remote, e),
        })?;
    let selected = addrs.into_iter().find(|addr| match protocol {
        Protocol::Tcp4 => addr.is_ipv4(),
        Protocol::Tcp6 => addr.is_ipv6(),
        Protocol::Tcp => true,
    });
    selected.ok_or_else(|| Error::Transport {
        message: format!("no {} address found for {}", protocol, remote),
    })
}

/// Collected signers, gathered before any connection is attempted.
enum AuthMaterial {
    /// Key pairs decoded from the configured key files.
    Keys(Vec<Arc<key::KeyPair>>),
    /// A connected agent and the identities it offered.
    Agent {
        client: russh_keys::agent::client::AgentClient<tokio::net::UnixStream>,
        identities: Vec<key::PublicKey>,
    },
}

async fn collect_auth_material(cfg: &Tunnel) -> Result<AuthMaterial> {
    if cfg.use_ssh_agent {
        let sock = std::env::var(SSH_AUTH_SOCK).unwrap_or_default();
        if sock.is_empty() {
            return Err(Error::EmptyAgentSocket);
        }
        let mut client = russh_keys::agent::client::AgentClient::connect_uds(&sock)
            .await
            .map_err(|e| Error::Transport {
                message: format!("failed to connect to SSH agent: {}", e),
            })?;
        let identities = client
            .request_identities()
            .await
            .map_err(|e| Error::Transport {
                message: format!("failed to list identities from SSH agent: {}", e),
            })?;
        debug!(keys = identities.len(), "SSH agent identities collected");
        return Ok(AuthMaterial::Agent { client, identities });
    }

    let mut signers = Vec::new();
    for path in &cfg.private_key_files {
        let resolved = resolve_tilde(path);
        let pem = tokio::fs::read_to_string(&resolved)
            .await
            .map_err(|e| Error::Config {
                message: format!("key file {}: {}", resolved.display(), e),
            })?;
        // Encrypted keys are not supported; decode failures (including
        // passphrase-protected keys) are reported per file.
        let signer = russh_keys::decode_secret_key(&pem, None).map_err(|e| Error::Config {
            message: format!("key file {}: {}", resolved.display(), e),
        })?;
        signers.push(Arc::new(signer));
    }
    Ok(AuthMaterial::Keys(signers))
}

async fn authenticate(
    handle: &mut Handle<InsecureHandler>,
    user: &str,
    material: AuthMaterial,
) -> Result<bool> {
    match material {
        AuthMaterial::Keys(signers) => {
            for signer in signers {
                let accepted = handle
                    .authenticate_publickey(user, signer)
                    .await
                    .map_err(|e| Error::Transport {
                        message: format!("public key auth failed: {}", e),
                    })?;
                if accepted {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        AuthMaterial::Agent {
            mut client,
            identities,
        } => {
            for identity in identities {
                let (returned, result) = handle.authenticate_future(user, identity, client).await;
                client = returned;
                match result {
                    Ok(true) => return Ok(true),
                    Ok(false) => continue,
                    Err(e) => {
                        return Err(Error::Transport {
                            message: format!("agent auth failed: {}", e),
                        });
                    }
                }
            }
            Ok(false)
        }
    }
}

/// Join stdout and stderr for diagnostics, falling back to a fixed marker
/// when the command produced nothing.
pub(crate) fn combined_output(stdout: &[u8], stderr: &[u8]) -> String {
    let out = String::from_utf8_lossy(stdout);
    let err = String::from_utf8_lossy(stderr);
    let out = out.trim();
    let err = err.trim();
    let combined = match (out.is_empty(), err.is_empty()) {
        (false, false) => format!("{} {}", out, err),
        (false, true) => out.to_string(),
        (true, false) => err.to_string(),
        (true, true) => "no output from command".to_string(),
    };
    combined
}

/// Single-quote a value so it survives the remote shell.
pub(crate) fn shell_quote(s: &str) -> String {
    shell_escape::escape(Cow::Borrowed(s)).into_owned()
}
