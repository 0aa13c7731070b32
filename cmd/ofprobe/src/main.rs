//! Device endpoint probe
//!
//! Connects to a device-control endpoint through the reconnecting wrapper,
//! prints the negotiated protocol version and then the type of every
//! message received.
//!
//! ```text
//! ofprobe tcp:127.0.0.1:6633      # active connect
//! ofprobe ptcp:6633               # wait for the device to connect to us
//! ofprobe tcp:10.0.0.1 20         # stop after 20 messages
//! ```
//!
//! `COT_BACKOFF_UNIT_MS`, `COT_BACKOFF_LIMIT` and `COT_PROBE_INTERVAL_MS`
//! tune reconnects and liveness; `COT_LOG=cothread_net=debug` shows the
//! handshake.

use std::process::ExitCode;

use cothread::Runtime;
use cothread_net::device::{self, wire, DeviceConnection};
use cothread_net::{Connection, NetConfig, ReliableConnection};
use tracing::{error, info};

fn usage() -> ExitCode {
    eprintln!("usage: ofprobe tcp:HOST[:PORT] | ptcp:[PORT] [COUNT]");
    ExitCode::from(2)
}

fn main() -> ExitCode {
    cothread::init_logging();

    let mut args = std::env::args().skip(1);
    let Some(target) = args.next() else {
        return usage();
    };
    let count = match args.next().map(|s| s.parse::<u64>()) {
        None => None,
        Some(Ok(n)) => Some(n),
        Some(Err(_)) => return usage(),
    };

    let config = NetConfig::from_env();
    if let Err(e) = config.validate() {
        error!(error = %e, "bad configuration");
        return ExitCode::FAILURE;
    }
    let factory = match device::parse(&target, &config) {
        Ok(f) => f,
        Err(e) => {
            error!(endpoint = %target, error = %e, "cannot use target");
            return ExitCode::FAILURE;
        }
    };

    let runtime = match Runtime::from_env() {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "runtime startup failed");
            return ExitCode::FAILURE;
        }
    };
    let group = runtime.default_group();
    let mut conn = match ReliableConnection::new(factory, &group, &config) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "cannot start connection driver");
            return ExitCode::FAILURE;
        }
    };

    println!("probing {}", conn);
    runtime.block_on(&group, || {
        let mut seen = 0u64;
        let mut reported = None;
        while count.map_or(true, |n| seen < n) {
            let msg = match conn.recv(true) {
                Ok(msg) => msg,
                Err(e) => {
                    error!(error = %e, "receive failed");
                    break;
                }
            };
            let version = conn.inspect(DeviceConnection::version).flatten();
            if let Some(v) = version.filter(|v| Some(*v) != reported) {
                reported = Some(v);
                println!("negotiated version {:#04x} (reconnects so far: {})", v, conn.reconnects());
            }
            seen += 1;
            println!(
                "{:>6}  {:<12} type={:<3} xid={:#010x} len={}",
                seen,
                wire::type_name(msg.msg_type()),
                msg.msg_type(),
                msg.xid(),
                msg.len()
            );
        }
        info!(messages = seen, reconnects = conn.reconnects(), "probe finished");
    });
    conn.close();
    ExitCode::SUCCESS
}
