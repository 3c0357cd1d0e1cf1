use std::time::{Duration, Instant};

use lazyrpc::ClientOptions;
use shardmaster::{MasterClerk, ShardMaster, ShardMasterOptions};
use shardmaster_pb::{GID_NONE, NUM_SHARDS};

fn data_dir(tag: &str, me: usize) -> String {
    std::env::temp_dir()
        .join(format!("shardmaster-{}-{}-{}", tag, std::process::id(), me))
        .to_string_lossy()
        .to_string()
}

fn boot(tag: &str, count: usize) -> (Vec<String>, Vec<ShardMaster>) {
    for me in 0..count {
        let _ = std::fs::remove_dir_all(data_dir(tag, me));
    }
    let listeners: Vec<std::net::TcpListener> = (0..count)
        .map(|_| std::net::TcpListener::bind("127.0.0.1:0").unwrap())
        .collect();
    let ports: Vec<String> = listeners
        .iter()
        .map(|l| l.local_addr().unwrap().to_string())
        .collect();
    drop(listeners);
    let masters = (0..count)
        .map(|me| {
            let options = ShardMasterOptions {
                data_dir: data_dir(tag, me),
                ..ShardMasterOptions::default()
            };
            ShardMaster::start(options, ports.clone(), me).unwrap()
        })
        .collect();
    (ports, masters)
}

fn restart(tag: &str, ports: &[String], me: usize) -> ShardMaster {
    let options = ShardMasterOptions {
        data_dir: data_dir(tag, me),
        ..ShardMasterOptions::default()
    };
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match ShardMaster::start(options.clone(), ports.to_vec(), me) {
            Ok(master) => return master,
            Err(err) => {
                assert!(
                    Instant::now() < deadline,
                    "replica never restarted: {:?}",
                    err.to_string()
                );
                std::thread::sleep(Duration::from_millis(50));
            }
        }
    }
}

fn clerk(ports: &[String]) -> MasterClerk {
    MasterClerk::new(ClientOptions::default(), ports.to_vec())
}

fn count_owned(shards: &[u64], gid: u64) -> usize {
    shards.iter().filter(|g| **g == gid).count()
}

#[test]
fn first_join_assigns_every_shard() {
    let (ports, masters) = boot("first-join", 3);
    let clerk = clerk(&ports);
    let servers = vec![
        "10.0.0.1:4000".to_string(),
        "10.0.0.2:4000".to_string(),
        "10.0.0.3:4000".to_string(),
    ];
    clerk.join(1, servers.clone()).unwrap();
    let config = clerk.query(1).unwrap();
    assert_eq!(1, config.num);
    assert_eq!(vec![1u64; NUM_SHARDS], config.shards);
    assert_eq!(Some(&servers[..]), config.servers(1));
    for master in masters.iter() {
        master.kill();
    }
}

#[test]
fn join_join_balances() {
    let (ports, masters) = boot("join-join", 3);
    let clerk = clerk(&ports);
    clerk.join(1, vec!["10.0.0.1:4000".to_string()]).unwrap();
    clerk.join(2, vec!["10.0.0.4:4000".to_string()]).unwrap();
    let config = clerk.query(2).unwrap();
    assert_eq!(2, config.num);
    assert_eq!(5, count_owned(&config.shards, 1));
    assert_eq!(5, count_owned(&config.shards, 2));
    for master in masters.iter() {
        master.kill();
    }
}

#[test]
fn leave_hands_everything_to_the_survivor() {
    let (ports, masters) = boot("leave", 3);
    let clerk = clerk(&ports);
    clerk.join(1, vec!["10.0.0.1:4000".to_string()]).unwrap();
    clerk.join(2, vec!["10.0.0.4:4000".to_string()]).unwrap();
    clerk.leave(1).unwrap();
    let config = clerk.query(3).unwrap();
    assert_eq!(3, config.num);
    assert_eq!(vec![2u64; NUM_SHARDS], config.shards);
    assert!(!config.has_group(1));
    for master in masters.iter() {
        master.kill();
    }
}

#[test]
fn query_resolves_old_new_and_latest() {
    let (ports, masters) = boot("query", 3);
    let clerk = clerk(&ports);
    clerk.join(1, vec!["10.0.0.1:4000".to_string()]).unwrap();
    clerk.join(2, vec!["10.0.0.4:4000".to_string()]).unwrap();
    assert_eq!(0, clerk.query(0).unwrap().num);
    assert_eq!(1, clerk.query(1).unwrap().num);
    // -1 and any number past the end resolve to the newest.
    assert_eq!(2, clerk.query(-1).unwrap().num);
    assert_eq!(2, clerk.query(100).unwrap().num);
    assert_eq!(
        vec![GID_NONE; NUM_SHARDS],
        clerk.query(0).unwrap().shards
    );
    for master in masters.iter() {
        master.kill();
    }
}

#[test]
fn move_pins_a_shard() {
    let (ports, masters) = boot("move", 3);
    let clerk = clerk(&ports);
    clerk.join(1, vec!["10.0.0.1:4000".to_string()]).unwrap();
    clerk.join(2, vec!["10.0.0.4:4000".to_string()]).unwrap();
    let before = clerk.query(-1).unwrap();
    let victim = before
        .shards
        .iter()
        .position(|g| *g == 1)
        .expect("group 1 should own something") as u64;
    clerk.mv(victim, 2).unwrap();
    let after = clerk.query(-1).unwrap();
    assert_eq!(2, after.owner(victim as usize));
    assert_eq!(before.num + 1, after.num);
    for master in masters.iter() {
        master.kill();
    }
}

#[test]
fn replicas_agree_on_configs() {
    let (ports, masters) = boot("agree", 3);
    let clerk = clerk(&ports);
    for gid in [4u64, 2, 9] {
        clerk
            .join(gid, vec![format!("10.0.0.{}:4000", gid)])
            .unwrap();
    }
    // Ask each replica directly for the same config; they must be byte-identical.
    let mut seen = None;
    for port in ports.iter() {
        let one = MasterClerk::new(ClientOptions::default(), vec![port.clone()]);
        let config = one.query(3).unwrap();
        if let Some(seen) = &seen {
            assert_eq!(seen, &config);
        } else {
            seen = Some(config);
        }
    }
    for master in masters.iter() {
        master.kill();
    }
}

#[test]
fn configs_survive_restart() {
    let tag = "restart";
    let (ports, mut masters) = boot(tag, 3);
    let clerk = clerk(&ports);
    clerk.join(1, vec!["10.0.0.1:4000".to_string()]).unwrap();
    clerk.join(2, vec!["10.0.0.4:4000".to_string()]).unwrap();
    masters[2].kill();
    masters[2] = restart(tag, &ports, 2);
    // The restarted replica serves historical configs from its own durable state.
    let one = MasterClerk::new(ClientOptions::default(), vec![ports[2].clone()]);
    let config = one.query(2).unwrap();
    assert_eq!(2, config.num);
    assert_eq!(5, count_owned(&config.shards, 1));
    assert_eq!(5, count_owned(&config.shards, 2));
    for master in masters.iter() {
        master.kill();
    }
}
