//! Helper binary transfer over the scp sink protocol.
//!
//! The orchestrator ships a self-contained `tunreadwriter` executable to
//! every remote host by driving the remote copy program in sink mode
//! (`scp -t <dir>`): one header line `C0755 <size> <name>\n`, the payload
//! bytes, and a terminating NUL.

use russh::ChannelMsg;
use tracing::info;

use crate::config::Tunnel;
use crate::crand;
use crate::error::{Error, Result};
use crate::ssh::{combined_output, SshClient};

/// The helper executable embedded at build time.
///
/// Empty when the build ran without `SSHTUN_HELPER_BIN`; uploading then
/// fails with instructions instead of shipping a zero-byte file.
static HELPER_BYTES: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/tunreadwriter.bin"));

/// The embedded helper payload.
pub fn helper_bytes() -> &'static [u8] {
    HELPER_BYTES
}

/// Upload the embedded helper, returning its absolute remote path.
pub async fn upload_helper(client: &SshClient, tunnel: &Tunnel) -> Result<String> {
    upload_payload(client, tunnel, helper_bytes()).await
}

/// Upload `payload` as a fresh helper executable on the remote host.
pub async fn upload_payload(client: &SshClient, tunnel: &Tunnel, payload: &[u8]) -> Result<String> {
    if payload.is_empty() {
        return Err(Error::Protocol {
            message: "embedded tunreadwriter payload is empty; rebuild with SSHTUN_HELPER_BIN \
                      pointing at a compiled tunreadwriter binary"
                .into(),
        });
    }

    let directory = tunnel.remote_upload_directory_or_default();
    let name = upload_name();
    let remote_path = format!("{}/{}", directory.trim_end_matches('/'), name);
    info!(
        name = %tunnel.name,
        tunreadwriter = %remote_path,
        size = payload.len(),
        "Uploading tunreadwriter as {} to ssh://{}",
        remote_path,
        tunnel.remote
    );

    let scp_command = format!("{} -t {}", tunnel.remote_scp_or_default(), directory);
    let mut channel = client.open_session().await?;
    channel
        .exec(true, scp_command.as_str())
        .await
        .map_err(|e| Error::Protocol {
            message: format!("failed to start {:?}: {}", scp_command, e),
        })?;

    let header = sink_header(payload.len(), &name);
    channel
        .data(header.as_bytes())
        .await
        .map_err(|e| Error::Protocol {
            message: format!("failed to send sink header: {}", e),
        })?;
    channel.data(payload).await.map_err(|e| Error::Protocol {
        message: format!("failed to send helper payload: {}", e),
    })?;
    channel.data(&b"\x00"[..]).await.map_err(|e| Error::Protocol {
        message: format!("failed to send sink terminator: {}", e),
    })?;
    channel.eof().await.map_err(|e| Error::Protocol {
        message: format!("failed to close sink stream: {}", e),
    })?;

    let mut stdout: Vec<u8> = Vec::new();
    let mut stderr: Vec<u8> = Vec::new();
    let mut exit_status: Option<u32> = None;
    loop {
        match channel.wait().await {
            Some(ChannelMsg::Data { data }) => stdout.extend_from_slice(&data),
            Some(ChannelMsg::ExtendedData { data, ext: 1 }) => stderr.extend_from_slice(&data),
            Some(ChannelMsg::ExitStatus { exit_status: code }) => exit_status = Some(code),
            Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => break,
            _ => {}
        }
    }

    match exit_status {
        Some(code) if code != 0 => Err(Error::Protocol {
            message: format!(
                "{:?} exited with status {}: {}",
                scp_command,
                code,
                combined_output(&stdout, &stderr)
            ),
        }),
        _ => Ok(remote_path),
    }
}

/// A collision-free remote file name: UTC timestamp plus 63 bits from the
/// shared random source.
pub fn upload_name() -> String {
    format!(
        "tunreadwriter-{}-{}",
        chrono::Utc::now().format("%Y%m%dT%H%M%S"),
        crand::next_u63()
    )
}

/// The sink-mode header line: mode 0755, size, name.
fn sink_header(size: usize, name: &str) -> String {
    format!("C0755 {} {}\n", size, name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn sink_header_layout() {
        assert_eq!(sink_header(1234, "tunreadwriter-x"), "C0755 1234 tunreadwriter-x\n");
    }

    #[test]
    fn upload_names_are_unique_and_well_formed() {
        let mut seen = HashSet::new();
        for _ in 0..1000 {
            let name = upload_name();
            assert!(name.starts_with("tunreadwriter-"), "bad name {}", name);
            let mut parts = name.splitn(3, '-');
            parts.next();
            let stamp = parts.next().expect("timestamp part");
            let random = parts.next().expect("random part");
            assert_eq!(stamp.len(), 15, "timestamp {} not YYYYMMDDTHHMMSS", stamp);
            assert!(stamp.as_bytes()[8] == b'T');
            random.parse::<u64>().expect("random part must be numeric");
            assert!(seen.insert(name), "duplicate upload name");
        }
    }
}
