//! Bidirectional byte pump between a TUN device and a remote SSH session.

use std::io;

use async_trait::async_trait;
use russh::client::Msg;
use russh::{Channel, ChannelMsg};
use tokio::io::AsyncWriteExt;
use tracing::{debug, error};

use crate::error::{Error, Result};

/// Frame-oriented I/O endpoint.
///
/// Implemented by the real TUN handle and by in-memory test devices.
#[async_trait]
pub trait PacketIo: Send + Sync {
    /// Read one frame; returns 0 at end of stream.
    async fn read_packet(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write one frame.
    async fn write_packet(&self, buf: &[u8]) -> io::Result<()>;
}

const COPY_BUFFER: usize = 64 * 1024;

/// Pump frames between `tun` and the started remote command on `channel`
/// until the session ends.
///
/// Remote stdout flows into the TUN; TUN frames flow into remote stdin;
/// remote stderr is retained for the exit diagnostic. Returns an error
/// carrying the remote exit status and stderr when the command failed.
pub async fn pump<T>(tun: T, mut channel: Channel<Msg>) -> Result<()>
where
    T: PacketIo + Clone + Send + Sync + 'static,
{
    let mut writer = channel.make_writer();
    let to_remote = tokio::spawn({
        let tun = tun.clone();
        async move {
            let mut buf = vec![0u8; COPY_BUFFER];
            loop {
                match tun.read_packet(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        if let Err(e) = writer.write_all(&buf[..n]).await {
                            debug!(error = %e, "Remote stdin closed");
                            break;
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "io error in local to remote task");
                        break;
                    }
                }
            }
        }
    });

    let mut stderr: Vec<u8> = Vec::new();
    let mut exit_status: Option<u32> = None;
    loop {
        match channel.wait().await {
            Some(ChannelMsg::Data { data }) => {
                if let Err(e) = tun.write_packet(&data).await {
                    error!(error = %e, "io error in remote to local task");
                }
            }
            Some(ChannelMsg::ExtendedData { data, ext: 1 }) => {
                stderr.extend_from_slice(&data);
            }
            Some(ChannelMsg::ExitStatus { exit_status: code }) => {
                exit_status = Some(code);
            }
            Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => break,
            _ => {}
        }
    }
    to_remote.abort();

    match exit_status {
        Some(code) if code != 0 => Err(Error::Protocol {
            message: format!(
                "remote command exited with status {}: {}",
                code,
                stderr_diagnostic(&stderr)
            ),
        }),
        _ => Ok(()),
    }
}

/// The trimmed stderr capture, or a fixed marker when nothing was written.
pub(crate) fn stderr_diagnostic(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        "no output on stderr".to_string()
    } else {
        trimmed.to_string()
    }
}
