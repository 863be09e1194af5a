//! Tunnel lifecycle composition and the multi-tunnel supervisor.
//!
//! `Tunnel::open` is the single place where privilege boundaries,
//! cancellation and cleanup are coordinated. Effective-UID brackets are
//! process-wide state, so every step that touches them runs under the
//! context's serialization lock; the lock is released before the
//! long-lived byte pump starts.

use std::sync::Arc;
use std::time::Duration;

use nix::unistd::geteuid;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::{Tunnel, Tunnels};
use crate::constants::{RESTART_DELAY_SECS, ROOT};
use crate::error::{Error, Result};
use crate::keepalive::start_keepalive;
use crate::privilege::PrivilegeGuard;
use crate::pump::pump;
use crate::ssh::{shell_quote, SshClient};
use crate::transfer::upload_helper;
use crate::tun::{TunDevice, TunIo};

/// Shared state every concurrent `open` needs: the cancellation signal
/// and the process-wide lock serializing effective-UID brackets.
///
/// A default-constructed context carries no lock and makes `open` fail;
/// build one with [`OpenContext::new`] and hand clones to every tunnel.
#[derive(Clone, Default)]
pub struct OpenContext {
    pub(crate) cancel: CancellationToken,
    gate: Option<Arc<Mutex<()>>>,
}

impl OpenContext {
    /// An armed context carrying a fresh serialization lock.
    pub fn new(cancel: CancellationToken) -> OpenContext {
        OpenContext {
            cancel,
            gate: Some(Arc::new(Mutex::new(()))),
        }
    }

    /// The cancellation token observed by every blocking step.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    async fn acquire(&self, name: &str) -> Result<OwnedMutexGuard<()>> {
        let gate = self.gate.as_ref().ok_or(Error::MissingContext)?;
        let guard = gate.clone().lock_owned().await;
        debug!(name, "Acquired serialization lock");
        Ok(guard)
    }
}

impl Tunnel {
    /// Bring this tunnel up and pump frames until the session ends or the
    /// context is canceled. Blocks for the tunnel's lifetime.
    ///
    /// Device, privilege and local-configuration failures are wrapped
    /// with the unrecoverable sentinel; transport and protocol failures
    /// are left recoverable for the supervisor to retry.
    pub async fn open(&self, ctx: &OpenContext) -> Result<()> {
        let lock = ctx.acquire(&self.name).await?;

        // Create and address the local TUN as root, then drop back.
        if geteuid().as_raw() != ROOT {
            info!(
                sudo = "configure_interface",
                uid_to = ROOT,
                uid_from = geteuid().as_raw(),
                name = %self.name,
                "Switching to uid {}",
                ROOT
            );
        }
        let mut became =
            PrivilegeGuard::become_uid(&self.name, ROOT).map_err(Error::unrecoverable)?;

        info!(tun = %self.local_tun_device, name = %self.name, "Creating local TUN device");
        let mut tun = TunDevice::create(&self.local_tun_device, self.local_mtu, 0, 0)
            .map_err(Error::unrecoverable)?;
        let device = tun.name().to_string();

        info!(
            name = %self.name,
            net = %self.local_network,
            mtu = self.local_mtu,
            proto = %self.protocol,
            "Configuring interface {} with address {} and MTU {}",
            device,
            self.local_network,
            self.local_mtu
        );
        if let Err(e) = tun.configure_interface(&self.local_network) {
            return Err(Error::unrecoverable(e));
        }

        if geteuid().as_raw() != became.original_uid() {
            info!(
                uid_to = became.original_uid(),
                uid_from = geteuid().as_raw(),
                name = %self.name,
                "Switching back to original uid"
            );
        }
        became.unbecome().map_err(Error::unrecoverable)?;

        // Dial out unprivileged; a watcher force-closes the client when
        // the context is canceled or this call returns.
        info!(remote = %self.remote, name = %self.name, "Connecting to ssh://{}", self.remote);
        let client = Arc::new(SshClient::dial(self, ctx.cancel_token()).await?);
        let open_done = CancellationToken::new();
        let _open_done_guard = open_done.clone().drop_guard();
        {
            let client = client.clone();
            let cancel = ctx.cancel.clone();
            let open_done = open_done.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = open_done.cancelled() => {}
                }
                client.close().await;
            });
        }

        let helper_path = upload_helper(&client, self).await?;

        // Link up needs root again.
        if geteuid().as_raw() != ROOT {
            info!(
                sudo = "link_up",
                uid_to = ROOT,
                uid_from = geteuid().as_raw(),
                name = %self.name,
                "Switching to uid {}",
                ROOT
            );
        }
        became.become_again(ROOT).map_err(Error::unrecoverable)?;

        info!(local_tun = %device, local_net = %self.local_network, name = %self.name, "Link up");
        if let Err(e) = tun.link_up() {
            return Err(Error::unrecoverable(e));
        }

        if geteuid().as_raw() != became.original_uid() {
            info!(
                uid_to = became.original_uid(),
                uid_from = geteuid().as_raw(),
                name = %self.name,
                "Switching back to original uid"
            );
        }
        became.unbecome().map_err(Error::unrecoverable)?;

        let keepalive_done = CancellationToken::new();
        let _keepalive_guard = keepalive_done.clone().drop_guard();
        if !self.keepalive_interval.is_zero() {
            info!(
                keepalive_interval = %self.keepalive_interval,
                keepalive_max_error_count = self.keepalive_max_error_count,
                name = %self.name,
                remote = %self.remote,
                "Enabling ssh keep-alive"
            );
            tokio::spawn(start_keepalive(
                client.clone(),
                self.keepalive_interval.as_std(),
                self.keepalive_max_error_count,
                keepalive_done.clone(),
            ));
        }

        debug!(name = %self.name, "Releasing serialization lock");
        drop(lock);

        info!(
            name = %self.name,
            remote = %self.remote,
            local_net = %self.local_network,
            remote_net = %self.remote_network,
            local_tun = %device,
            remote_tun = %self.remote_tun_device,
            local_mtu = self.local_mtu,
            remote_mtu = self.remote_mtu,
            "Starting tunnel"
        );

        let outcome = self
            .start_tunneling(&client, &tun, Some(helper_path.as_str()))
            .await;
        let _ = tun.close();
        match outcome {
            // A failure after cancellation is the watcher tearing the
            // connection down; report clean shutdown.
            Err(_) if ctx.cancel.is_cancelled() => {}
            Err(e) => return Err(e),
            Ok(()) => {}
        }

        info!(
            name = %self.name,
            remote = %self.remote,
            local_net = %self.local_network,
            remote_net = %self.remote_network,
            local_tun = %device,
            remote_tun = %self.remote_tun_device,
            "Tunnel closed"
        );
        Ok(())
    }

    /// Launch the remote helper and pump frames until the session ends.
    async fn start_tunneling(
        &self,
        client: &SshClient,
        tun: &TunDevice,
        helper_path: Option<&str>,
    ) -> Result<()> {
        let command = helper_command(
            helper_path,
            &self.remote_tun_device,
            &self.remote_network,
            self.remote_mtu,
        )?;
        let tun_io: TunIo = tun.packet_io()?;

        let mut channel = client.open_session().await?;
        info!(
            remote = %self.remote,
            remote_command = %command,
            name = %self.name,
            "Starting remote tunreadwriter on ssh://{}",
            self.remote
        );
        channel
            .exec(true, command.as_str())
            .await
            .map_err(|e| Error::Protocol {
                message: format!("failed to start remote helper: {}", e),
            })?;

        pump(tun_io, channel).await
    }
}

/// Build the remote command line, shell-quoting every field.
///
/// `-delete` makes the helper remove its own executable on exit.
fn helper_command(
    helper_path: Option<&str>,
    device: &str,
    network: &str,
    mtu: i32,
) -> Result<String> {
    let helper = match helper_path {
        Some(path) if !path.is_empty() => path,
        _ => return Err(Error::MissingHelperPath),
    };
    Ok(format!(
        "sudo {} -delete -dev {} -net {} -mtu {}",
        shell_quote(helper),
        shell_quote(device),
        shell_quote(network),
        shell_quote(&mtu.to_string()),
    ))
}

impl Tunnels {
    /// Run every enabled tunnel until cancellation.
    ///
    /// Each enabled tunnel gets a worker that reopens it 5 seconds after
    /// a recoverable failure (or clean closure) and stops on an
    /// unrecoverable one. Fails immediately when nothing is enabled.
    pub async fn open_all(&self, cancel: CancellationToken) -> Result<()> {
        let ctx = OpenContext::new(cancel);
        let mut workers = JoinSet::new();
        let mut spawned = 0usize;

        for tunnel in &self.tunnels {
            if !tunnel.enable {
                info!(
                    name = %tunnel.name,
                    remote = %tunnel.remote,
                    remote_net = %tunnel.remote_network,
                    local_net = %tunnel.local_network,
                    "Tunnel not enabled, skipping"
                );
                continue;
            }
            info!(
                name = %tunnel.name,
                remote = %tunnel.remote,
                remote_net = %tunnel.remote_network,
                local_net = %tunnel.local_network,
                "Connecting tunnel {}",
                tunnel.name
            );
            spawned += 1;

            let tunnel = tunnel.clone();
            let ctx = ctx.clone();
            workers.spawn(async move {
                loop {
                    if let Err(e) = tunnel.open(&ctx).await {
                        error!(name = %tunnel.name, error = %e, "Tunnel failed");
                        if e.is_unrecoverable() {
                            return;
                        }
                    }
                    tokio::select! {
                        _ = ctx.cancel.cancelled() => return,
                        _ = tokio::time::sleep(Duration::from_secs(RESTART_DELAY_SECS)) => {}
                    }
                }
            });
        }

        if spawned == 0 {
            return Err(Error::NoTunnelsEnabled {
                total: self.total(),
            });
        }

        while workers.join_next().await.is_some() {}
        Ok(())
    }
}
