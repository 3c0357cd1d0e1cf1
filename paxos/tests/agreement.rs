use std::sync::Arc;
use std::time::{Duration, Instant};

use lazyrpc::{Server, ServerOptions, ServiceRegistry};
use paxos::{Paxos, PaxosOptions, PaxosStatus};
use paxos_pb::PaxosServer;

struct TestPeer {
    paxos: Paxos,
    server: Arc<Server>,
    serve: Option<std::thread::JoinHandle<()>>,
}

impl TestPeer {
    fn start(tag: &str, peers: &[String], me: usize) -> TestPeer {
        let options = PaxosOptions {
            data_dir: data_dir(tag, me),
            ..PaxosOptions::default()
        };
        let paxos = Paxos::new(options, peers.to_vec(), me).unwrap();
        let mut registry = ServiceRegistry::new();
        registry.register("PaxosService", PaxosServer::bind(paxos.clone()));
        let deadline = Instant::now() + Duration::from_secs(5);
        let server = loop {
            match Server::new(ServerOptions::new(&peers[me]), registry) {
                Ok(server) => break Arc::new(server),
                Err(_) if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(50));
                    registry = ServiceRegistry::new();
                    registry.register("PaxosService", PaxosServer::bind(paxos.clone()));
                }
                Err(err) => panic!("could not bind {}: {:?}", peers[me], err),
            }
        };
        let server_p = Arc::clone(&server);
        let serve = std::thread::spawn(move || server_p.serve());
        TestPeer {
            paxos,
            server,
            serve: Some(serve),
        }
    }

    fn kill(mut self) {
        self.paxos.kill();
        self.server.shutdown();
        if let Some(serve) = self.serve.take() {
            serve.join().unwrap();
        }
    }
}

fn data_dir(tag: &str, me: usize) -> String {
    std::env::temp_dir()
        .join(format!("paxos-{}-{}-{}", tag, std::process::id(), me))
        .to_string_lossy()
        .to_string()
}

fn fresh_dirs(tag: &str, count: usize) {
    for me in 0..count {
        let _ = std::fs::remove_dir_all(data_dir(tag, me));
    }
}

fn free_ports(count: usize) -> Vec<String> {
    let listeners: Vec<std::net::TcpListener> = (0..count)
        .map(|_| std::net::TcpListener::bind("127.0.0.1:0").unwrap())
        .collect();
    listeners
        .iter()
        .map(|l| l.local_addr().unwrap().to_string())
        .collect()
}

fn num_decided(peers: &[Option<TestPeer>], seq: i64) -> (usize, Option<Vec<u8>>) {
    let mut count = 0;
    let mut value: Option<Vec<u8>> = None;
    for peer in peers.iter().flatten() {
        if let PaxosStatus::Decided(v) = peer.paxos.status(seq) {
            if let Some(value) = &value {
                assert_eq!(value, &v, "peers decided different values for seq={}", seq);
            } else {
                value = Some(v);
            }
            count += 1;
        }
    }
    (count, value)
}

fn wait_decided(peers: &[Option<TestPeer>], seq: i64, want: usize) -> Vec<u8> {
    let deadline = Instant::now() + Duration::from_secs(30);
    loop {
        let (count, value) = num_decided(peers, seq);
        if count >= want {
            return value.unwrap();
        }
        assert!(
            Instant::now() < deadline,
            "too few decided for seq={}: {} < {}",
            seq,
            count,
            want
        );
        std::thread::sleep(Duration::from_millis(25));
    }
}

fn boot(tag: &str, count: usize) -> (Vec<String>, Vec<Option<TestPeer>>) {
    fresh_dirs(tag, count);
    let ports = free_ports(count);
    let peers = (0..count)
        .map(|me| Some(TestPeer::start(tag, &ports, me)))
        .collect();
    (ports, peers)
}

fn shutdown(peers: Vec<Option<TestPeer>>) {
    for peer in peers.into_iter().flatten() {
        peer.kill();
    }
}

#[test]
fn basic_agreement() {
    let (_ports, peers) = boot("basic", 3);
    peers[0].as_ref().unwrap().paxos.start(0, b"v0".to_vec());
    let value = wait_decided(&peers, 0, 3);
    assert_eq!(b"v0".to_vec(), value);
    shutdown(peers);
}

#[test]
fn concurrent_proposers_agree() {
    let (_ports, peers) = boot("concurrent", 3);
    for (index, peer) in peers.iter().flatten().enumerate() {
        peer.paxos.start(0, format!("value-{}", index).into_bytes());
    }
    let value = wait_decided(&peers, 0, 3);
    assert!(
        (0..3).any(|index| value == format!("value-{}", index).into_bytes()),
        "decided value was never proposed"
    );
    shutdown(peers);
}

#[test]
fn many_slots_in_parallel() {
    let (_ports, peers) = boot("slots", 3);
    for seq in 0..5i64 {
        let proposer = peers[(seq as usize) % 3].as_ref().unwrap();
        proposer.paxos.start(seq, format!("slot-{}", seq).into_bytes());
    }
    for seq in 0..5i64 {
        wait_decided(&peers, seq, 3);
    }
    assert!(peers[0].as_ref().unwrap().paxos.max() >= 4);
    shutdown(peers);
}

#[test]
fn done_advances_min_and_forgets() {
    let (_ports, peers) = boot("gc", 3);
    for seq in 0..3i64 {
        peers[0].as_ref().unwrap().paxos.start(seq, vec![seq as u8]);
        wait_decided(&peers, seq, 3);
    }
    for peer in peers.iter().flatten() {
        peer.paxos.done(1);
    }
    // Floors piggyback on traffic, and only the pairs that talk exchange them, so every peer
    // proposes until the whole ensemble agrees on the floor.
    let deadline = Instant::now() + Duration::from_secs(10);
    let mut next_slot = 3i64;
    loop {
        if peers.iter().flatten().all(|p| p.paxos.min() == 2) {
            break;
        }
        assert!(Instant::now() < deadline, "min never advanced");
        for peer in peers.iter().flatten() {
            peer.paxos.start(next_slot, b"push".to_vec());
        }
        wait_decided(&peers, next_slot, 3);
        next_slot += 1;
    }
    for peer in peers.iter().flatten() {
        assert_eq!(PaxosStatus::Forgotten, peer.paxos.status(0));
        assert_eq!(PaxosStatus::Forgotten, peer.paxos.status(1));
        assert!(matches!(peer.paxos.status(2), PaxosStatus::Decided(_)));
    }
    shutdown(peers);
}

#[test]
fn decisions_survive_restart() {
    let tag = "restart";
    let (ports, mut peers) = boot(tag, 3);
    peers[0].as_ref().unwrap().paxos.start(0, b"alpha".to_vec());
    wait_decided(&peers, 0, 3);
    peers[2].take().unwrap().kill();
    peers[0].as_ref().unwrap().paxos.start(1, b"beta".to_vec());
    wait_decided(&peers, 1, 2);
    peers[2] = Some(TestPeer::start(tag, &ports, 2));
    // The restarted peer rereads its durable state.
    assert_eq!(
        PaxosStatus::Decided(b"alpha".to_vec()),
        peers[2].as_ref().unwrap().paxos.status(0)
    );
    // Poking the missed slot surfaces the earlier decision, not the dummy.
    peers[2].as_ref().unwrap().paxos.start(1, b"dummy".to_vec());
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if let PaxosStatus::Decided(value) = peers[2].as_ref().unwrap().paxos.status(1) {
            assert_eq!(b"beta".to_vec(), value);
            break;
        }
        assert!(Instant::now() < deadline, "restarted peer never caught up");
        std::thread::sleep(Duration::from_millis(25));
    }
    shutdown(peers);
}

#[test]
fn minority_cannot_decide_and_heals_to_majority_value() {
    let tag = "minority";
    let (ports, mut peers) = boot(tag, 5);
    // Majority {0, 1, 2} decides slot 0 while 3 and 4 are down.
    peers[3].take().unwrap().kill();
    peers[4].take().unwrap().kill();
    peers[0].as_ref().unwrap().paxos.start(0, b"majority".to_vec());
    wait_decided(&peers, 0, 3);
    // Now flip the partition: only {3, 4} are up.
    for index in 0..3 {
        peers[index].take().unwrap().kill();
    }
    peers[3] = Some(TestPeer::start(tag, &ports, 3));
    peers[4] = Some(TestPeer::start(tag, &ports, 4));
    peers[3]
        .as_ref()
        .unwrap()
        .paxos
        .start(0, b"minority".to_vec());
    std::thread::sleep(Duration::from_secs(2));
    let (count, _) = num_decided(&peers, 0);
    assert_eq!(0, count, "a minority of two must not decide");
    // Heal.  The earlier decision stands everywhere.
    for index in 0..3 {
        peers[index] = Some(TestPeer::start(tag, &ports, index));
    }
    let value = wait_decided(&peers, 0, 5);
    assert_eq!(b"majority".to_vec(), value);
    shutdown(peers);
}
