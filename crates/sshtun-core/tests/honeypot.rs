//! Transport integration tests against a loopback SSH honey pot.

use tokio_util::sync::CancellationToken;

use sshtun_core::config::{Protocol, Tunnel};
use sshtun_core::ssh::SshClient;
use sshtun_core::transfer;
use sshtun_test_utils::{FakeTun, HoneyPot};

async fn dial_honeypot(honeypot: &HoneyPot) -> (SshClient, std::path::PathBuf) {
    let (_key, key_path) = sshtun_test_utils::write_test_key("sshtun-honeypot-key");
    let cfg = Tunnel {
        name: "honeypot".into(),
        protocol: Protocol::Tcp4,
        remote: honeypot.addr().to_string(),
        remote_user: "test".into(),
        use_ssh_agent: false,
        private_key_files: vec![key_path.to_string_lossy().into_owned()],
        ..Tunnel::default()
    };
    let client = SshClient::dial(&cfg, &CancellationToken::new())
        .await
        .expect("dial honey pot");
    (client, key_path)
}

#[tokio::test]
async fn dial_and_run_against_honeypot() {
    let honeypot = HoneyPot::spawn().await.expect("spawn honey pot");
    let (client, key_path) = dial_honeypot(&honeypot).await;

    let output = client.run("echo hi").await.expect("run");
    assert_eq!(output, "Honey pot");

    honeypot.set_response("something else");
    let output = client.run("echo hi").await.expect("run");
    assert_eq!(output, "something else");

    client.close().await;
    let _ = std::fs::remove_file(key_path);
}

#[tokio::test]
async fn upload_helper_places_payload_in_remote_directory() {
    let honeypot = HoneyPot::spawn().await.expect("spawn honey pot");
    let (client, key_path) = dial_honeypot(&honeypot).await;

    let cfg = Tunnel {
        name: "honeypot".into(),
        remote: honeypot.addr().to_string(),
        ..Tunnel::default()
    };
    let payload = b"#!/bin/sh\nexit 0\n";
    let remote_path = transfer::upload_payload(&client, &cfg, payload)
        .await
        .expect("upload");
    assert!(remote_path.starts_with("/tmp/tunreadwriter-"), "{}", remote_path);

    client.close().await;
    let _ = std::fs::remove_file(key_path);
}

#[tokio::test]
async fn upload_rejects_empty_embedded_payload() {
    let honeypot = HoneyPot::spawn().await.expect("spawn honey pot");
    let (client, key_path) = dial_honeypot(&honeypot).await;

    let cfg = Tunnel::default();
    let err = transfer::upload_payload(&client, &cfg, b"")
        .await
        .expect_err("empty payload must be rejected");
    assert!(err.to_string().contains("SSHTUN_HELPER_BIN"), "{}", err);

    client.close().await;
    let _ = std::fs::remove_file(key_path);
}

#[tokio::test]
async fn upload_honors_configured_directory() {
    let honeypot = HoneyPot::spawn().await.expect("spawn honey pot");
    let (client, key_path) = dial_honeypot(&honeypot).await;

    let cfg = Tunnel {
        remote_upload_directory: "/var/tmp/".into(),
        ..Tunnel::default()
    };
    let remote_path = transfer::upload_payload(&client, &cfg, b"payload")
        .await
        .expect("upload");
    assert!(remote_path.starts_with("/var/tmp/tunreadwriter-"), "{}", remote_path);

    client.close().await;
    let _ = std::fs::remove_file(key_path);
}

#[tokio::test]
async fn pump_copies_remote_output_into_the_tun() {
    let honeypot = HoneyPot::spawn().await.expect("spawn honey pot");
    let (client, key_path) = dial_honeypot(&honeypot).await;

    let tun = FakeTun::new("faketun0");
    let mut channel = client.open_session().await.expect("session");
    channel.exec(true, "tunreadwriter").await.expect("exec");

    sshtun_core::pump::pump(tun.clone(), channel)
        .await
        .expect("pump runs to clean exit");

    let frames = tun.take_outgoing();
    let received: Vec<u8> = frames.into_iter().flatten().collect();
    assert_eq!(received, b"Honey pot");

    client.close().await;
    let _ = std::fs::remove_file(key_path);
}
