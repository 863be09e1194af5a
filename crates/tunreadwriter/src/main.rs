//! tunreadwriter: the remote end of an sshtun tunnel.
//!
//! Creates and configures a TUN device, then bridges it to the process
//! stdio: frames read from stdin go to the TUN, frames read from the TUN
//! go to stdout. The orchestrator launches it over an SSH session and
//! pumps the other side of those streams into its local TUN.
//!
//! The single-dash flag syntax (`-dev`, `-net`, ...) is a wire contract
//! with the orchestrator's generated command line and is parsed by hand.

use std::process::ExitCode;

use nix::unistd::{Group, User};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::signal::unix::{signal, SignalKind};

use sshtun_core::error::{Error, Result};
use sshtun_core::pump::PacketIo;
use sshtun_core::tun::TunDevice;

const USAGE: &str = "\
Usage of tunreadwriter:
  -delete
        Delete myself when exiting
  -dev TUN
        TUN device to read from and write to stdout, write to and read from stdin (default \"tun0\")
  -group groupname
        Set group of created tun device to groupname
  -mtu MTU
        MTU of created tun device, 0 means the kernel default, usually 1500 (default 0)
  -net CIDR
        Network address with CIDR to assign to the tun device (default \"172.16.0.3/24\")
  -user username
        Set owner of created tun device to username";

#[derive(Debug, Clone, PartialEq)]
struct Options {
    mtu: i32,
    device: String,
    network: String,
    username: String,
    groupname: String,
    delete_self: bool,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            mtu: 0,
            device: "tun0".into(),
            network: "172.16.0.3/24".into(),
            username: String::new(),
            groupname: String::new(),
            delete_self: false,
        }
    }
}

fn parse_args<I: Iterator<Item = String>>(mut args: I) -> std::result::Result<Options, String> {
    let mut opts = Options::default();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-delete" => opts.delete_self = true,
            "-dev" => opts.device = flag_value(&arg, args.next())?,
            "-net" => opts.network = flag_value(&arg, args.next())?,
            "-user" => opts.username = flag_value(&arg, args.next())?,
            "-group" => opts.groupname = flag_value(&arg, args.next())?,
            "-mtu" => {
                let value = flag_value(&arg, args.next())?;
                opts.mtu = value
                    .parse()
                    .map_err(|_| format!("invalid value {:?} for flag -mtu", value))?;
            }
            "-h" | "-help" | "--help" => return Err(String::new()),
            other => return Err(format!("flag provided but not defined: {}", other)),
        }
    }
    Ok(opts)
}

fn flag_value(flag: &str, value: Option<String>) -> std::result::Result<String, String> {
    value.ok_or_else(|| format!("flag needs an argument: {}", flag))
}

/// Removes the helper's own executable when dropped, so the file is gone
/// on every exit path once `-delete` was given.
struct DeleteOnExit(Option<String>);

impl Drop for DeleteOnExit {
    fn drop(&mut self) {
        if let Some(path) = self.0.take() {
            let _ = std::fs::remove_file(path);
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let mut args = std::env::args();
    let argv0 = args.next().unwrap_or_else(|| "tunreadwriter".into());
    let opts = match parse_args(args) {
        Ok(opts) => opts,
        Err(message) => {
            if !message.is_empty() {
                eprintln!("{}", message);
            }
            eprintln!("{}", USAGE);
            return ExitCode::from(2);
        }
    };

    match run(&argv0, opts).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(argv0: &str, opts: Options) -> Result<()> {
    let _delete = DeleteOnExit(opts.delete_self.then(|| argv0.to_string()));

    let device = opts.device.trim().to_string();
    if device.is_empty() {
        return Err(Error::Config {
            message: "missing device name".into(),
        });
    }
    let network = opts.network.trim().to_string();
    if network.is_empty() {
        return Err(Error::Config {
            message: "missing network address".into(),
        });
    }

    let (mut uid, mut gid) = (0u32, 0u32);
    if !opts.username.is_empty() {
        let user = User::from_name(&opts.username)
            .map_err(|e| Error::Config {
                message: format!("user lookup {}: {}", opts.username, e),
            })?
            .ok_or_else(|| Error::Config {
                message: format!("unknown user {}", opts.username),
            })?;
        uid = user.uid.as_raw();
        gid = user.gid.as_raw();
    }
    if !opts.groupname.is_empty() {
        let group = Group::from_name(&opts.groupname)
            .map_err(|e| Error::Config {
                message: format!("group lookup {}: {}", opts.groupname, e),
            })?
            .ok_or_else(|| Error::Config {
                message: format!("unknown group {}", opts.groupname),
            })?;
        gid = group.gid.as_raw();
    }

    let mut tun = TunDevice::create(&device, opts.mtu, uid, gid)?;
    tun.configure_interface(&network)?;
    tun.link_up()?;
    let io = tun.packet_io()?;
    let name = tun.name().to_string();

    let from_tun = {
        let io = io.clone();
        let name = name.clone();
        async move {
            let mut stdout = tokio::io::stdout();
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                match io.read_packet(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        if stdout.write_all(&buf[..n]).await.is_err()
                            || stdout.flush().await.is_err()
                        {
                            break;
                        }
                    }
                    Err(e) => {
                        eprintln!("io error from {} to stdout: {}", name, e);
                        break;
                    }
                }
            }
        }
    };

    let from_stdin = {
        let io = io.clone();
        let name = name.clone();
        async move {
            let mut stdin = tokio::io::stdin();
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                match stdin.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        if let Err(e) = io.write_packet(&buf[..n]).await {
                            eprintln!("io error from stdin to {}: {}", name, e);
                            break;
                        }
                    }
                    Err(e) => {
                        eprintln!("io error reading stdin: {}", e);
                        break;
                    }
                }
            }
        }
    };

    let mut sigint = signal(SignalKind::interrupt()).map_err(Error::Io)?;
    let mut sigterm = signal(SignalKind::terminate()).map_err(Error::Io)?;

    tokio::select! {
        _ = from_tun => {}
        _ = from_stdin => {}
        _ = sigint.recv() => eprintln!("Caught signal interrupt"),
        _ = sigterm.recv() => eprintln!("Caught signal terminated"),
    }

    tun.close()?;
    Ok(())
}
