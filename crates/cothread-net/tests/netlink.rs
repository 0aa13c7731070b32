//! Blocking transactions against an in-memory "kernel" task

use std::sync::Arc;
use std::time::Duration;

use cothread_net::netlink::{AttrSpec, AttrWriter, NlMessage, NlSocket, Policy, NLM_F_ACK, NLM_F_REQUEST};
use cothread_net::{AsyncDatagram, LoopbackDatagram};
use cothread_runtime::{Runtime, RuntimeConfig};

const CMD_GET: u16 = 0x20;
const ATTR_VALUE: u16 = 1;

fn runtime() -> Runtime {
    Runtime::new(RuntimeConfig::new().max_poll_wait(Duration::from_millis(10))).unwrap()
}

/// Answer `n` requests with `seq * 10`, losing the first reply
fn lossy_kernel(mut kernel: LoopbackDatagram, n: usize) -> Vec<u32> {
    let mut seen = Vec::new();
    let mut lost = false;
    while seen.len() < n {
        let req = NlMessage::from_bytes(kernel.recv(true).unwrap()).unwrap();
        assert_ne!(req.flags() & NLM_F_ACK, 0);
        let mut reply = NlMessage::new(CMD_GET, 0, req.seq(), req.pid());
        reply.put_u32(ATTR_VALUE, req.seq().wrapping_mul(10));
        kernel.send(reply.as_bytes(), true).unwrap();
        if !lost {
            // Drop it from the socket's receive buffer.
            kernel.overrun_peer();
            lost = true;
            continue;
        }
        seen.push(req.seq());
    }
    seen
}

#[test]
fn test_blocking_transactions_survive_loss() {
    let rt = runtime();
    let g = rt.default_group();
    let (ours, kernel) = LoopbackDatagram::pair();
    let sock = Arc::new(NlSocket::new(ours, 9000));
    let policy = Policy::new([AttrSpec::u32(ATTR_VALUE).required()]);

    let kernel = g.spawn(move |_| lossy_kernel(kernel, 3)).unwrap();
    let client = {
        let sock = Arc::clone(&sock);
        g.spawn(move |_| {
            (0..3)
                .map(|_| {
                    let req = sock.message(CMD_GET, NLM_F_REQUEST);
                    let seq = req.seq();
                    let reply = sock.transact_request(req).unwrap();
                    let value = policy.parse(reply.payload()).unwrap().u32(ATTR_VALUE);
                    (seq, value)
                })
                .collect::<Vec<_>>()
        })
        .unwrap()
    };

    let results = client.join();
    let answered = kernel.join();
    assert_eq!(answered, results.iter().map(|(seq, _)| *seq).collect::<Vec<_>>());
    for (seq, value) in results {
        assert_eq!(value, Some(seq.wrapping_mul(10)));
    }
    assert_eq!(sock.outstanding(), 0);
}
