//! SSH honey pot for tests.
//!
//! Accepts any password or public key, answers every exec request with a
//! configurable fixed string and exit status 0, and swallows whatever is
//! streamed to it (sink-mode uploads included).

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use russh::server::{self, Auth, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec};
use russh_keys::key;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// A loopback SSH server accepting anything.
pub struct HoneyPot {
    addr: SocketAddr,
    response: Arc<Mutex<String>>,
    task: JoinHandle<()>,
}

impl HoneyPot {
    /// Bind an ephemeral loopback port and start serving.
    pub async fn spawn() -> std::io::Result<HoneyPot> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let response = Arc::new(Mutex::new("Honey pot".to_string()));

        let config = Arc::new(server::Config {
            keys: vec![key::KeyPair::generate_ed25519().expect("ed25519 host key")],
            ..Default::default()
        });
        let mut server = HoneyPotServer {
            response: response.clone(),
        };
        let task = tokio::spawn(async move {
            let _ = server.run_on_socket(config, &listener).await;
        });

        Ok(HoneyPot {
            addr,
            response,
            task,
        })
    }

    /// The bound address, as a `host:port` dial target.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Change the string returned for subsequent exec requests.
    pub fn set_response(&self, response: &str) {
        *self.response.lock().unwrap() = response.to_string();
    }

    /// Stop serving. Dropping the honey pot does the same.
    pub fn close(&self) {
        self.task.abort();
    }
}

impl Drop for HoneyPot {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct HoneyPotServer {
    response: Arc<Mutex<String>>,
}

impl server::Server for HoneyPotServer {
    type Handler = HoneyPotHandler;

    fn new_client(&mut self, _peer: Option<SocketAddr>) -> HoneyPotHandler {
        HoneyPotHandler {
            response: self.response.clone(),
        }
    }
}

struct HoneyPotHandler {
    response: Arc<Mutex<String>>,
}

#[async_trait]
impl server::Handler for HoneyPotHandler {
    type Error = russh::Error;

    async fn auth_password(
        &mut self,
        _user: &str,
        _password: &str,
    ) -> Result<Auth, Self::Error> {
        Ok(Auth::Accept)
    }

    async fn auth_publickey(
        &mut self,
        _user: &str,
        _public_key: &key::PublicKey,
    ) -> Result<Auth, Self::Error> {
        Ok(Auth::Accept)
    }

    async fn channel_open_session(
        &mut self,
        _channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        _data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let response = self.response.lock().unwrap().clone();
        session.data(channel, CryptoVec::from_slice(response.as_bytes()));
        session.exit_status_request(channel, 0);
        session.eof(channel);
        session.close(channel);
        Ok(())
    }

    async fn data(
        &mut self,
        _channel: ChannelId,
        _data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        // Sink-mode uploads stream file bytes here; swallow them.
        Ok(())
    }
}
