use std::time::{Duration, Instant};

use lazyrpc::ClientOptions;
use rpc_pb::Context;
use shardkv::{KvClerk, ShardKv, ShardKvOptions};
use shardkv_pb::{
    fnv1a64, shard_for_key, ClerkId, GetRequest, KvError, OpId, PutRequest, ShardKvClient,
    ShardKvService,
};
use shardmaster::{MasterClerk, ShardMaster, ShardMasterOptions};

///////////////////////////////////////////// harness //////////////////////////////////////////////

fn data_dir(tag: &str, role: &str, me: usize) -> String {
    std::env::temp_dir()
        .join(format!(
            "shardkv-{}-{}-{}-{}",
            tag,
            role,
            std::process::id(),
            me
        ))
        .to_string_lossy()
        .to_string()
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

struct Cluster {
    tag: String,
    master_ports: Vec<String>,
    masters: Vec<ShardMaster>,
}

impl Cluster {
    fn boot(tag: &str) -> Self {
        for me in 0..3 {
            let _ = std::fs::remove_dir_all(data_dir(tag, "master", me));
        }
        let master_ports = free_ports(3);
        let masters = (0..3)
            .map(|me| {
                let options = ShardMasterOptions {
                    data_dir: data_dir(tag, "master", me),
                    ..ShardMasterOptions::default()
                };
                ShardMaster::start(options, master_ports.clone(), me).unwrap()
            })
            .collect();
        Self {
            tag: tag.to_string(),
            master_ports,
            masters,
        }
    }

    fn master_clerk(&self) -> MasterClerk {
        MasterClerk::new(ClientOptions::default(), self.master_ports.clone())
    }

    fn kv_clerk(&self) -> KvClerk {
        KvClerk::new(ClientOptions::default(), self.master_ports.clone())
    }

    fn shutdown(self, groups: Vec<Group>) {
        for group in groups.into_iter() {
            for replica in group.replicas.into_iter().flatten() {
                replica.kill();
            }
        }
        for master in self.masters.iter() {
            master.kill();
        }
    }
}

struct Group {
    gid: u64,
    ports: Vec<String>,
    replicas: Vec<Option<ShardKv>>,
}

impl Group {
    fn boot(cluster: &Cluster, gid: u64, count: usize) -> Self {
        Self::boot_with_budget(cluster, gid, count, 100 * 1_000_000)
    }

    fn boot_with_budget(cluster: &Cluster, gid: u64, count: usize, budget: u64) -> Self {
        for me in 0..count {
            let _ = std::fs::remove_dir_all(data_dir(&cluster.tag, &format!("g{}", gid), me));
        }
        let ports = free_ports(count);
        let replicas = (0..count)
            .map(|me| {
                Some(Self::boot_replica(cluster, gid, &ports, me, budget))
            })
            .collect();
        Self {
            gid,
            ports,
            replicas,
        }
    }

    fn boot_replica(
        cluster: &Cluster,
        gid: u64,
        ports: &[String],
        me: usize,
        budget: u64,
    ) -> ShardKv {
        let options = ShardKvOptions {
            data_dir: data_dir(&cluster.tag, &format!("g{}", gid), me),
            memory_budget_bytes: budget,
            ..ShardKvOptions::default()
        };
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            match ShardKv::start(
                options.clone(),
                gid,
                cluster.master_ports.clone(),
                ports.to_vec(),
                me,
            ) {
                Ok(kv) => return kv,
                Err(err) => {
                    assert!(
                        Instant::now() < deadline,
                        "replica never started: {:?}",
                        err.to_string()
                    );
                    std::thread::sleep(Duration::from_millis(50));
                }
            }
        }
    }

    fn join(&self, cluster: &Cluster) {
        cluster
            .master_clerk()
            .join(self.gid, self.ports.clone())
            .unwrap();
    }
}

// A key that routes to the given shard; the fnv hash is stable so these are reproducible.
fn key_for_shard(shard: usize) -> String {
    for i in 0.. {
        let key = format!("key-{}", i);
        if shard_for_key(&key) == shard {
            return key;
        }
    }
    unreachable!();
}

fn direct_client(port: &str) -> ShardKvClient {
    ShardKvClient::new(lazyrpc::new_client(ClientOptions::default(), port.to_string()))
}

fn hash_chain(values: &[&str]) -> String {
    let mut current = String::new();
    for value in values {
        current = format!("{}", fnv1a64(format!("{}{}", current, value).as_bytes()));
    }
    current
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

#[test]
fn put_then_get() {
    let cluster = Cluster::boot("put-get");
    let group = Group::boot(&cluster, 1, 3);
    group.join(&cluster);
    let clerk = cluster.kv_clerk();
    clerk.put("x", "hello");
    assert_eq!(Some("hello".to_string()), clerk.get("x"));
    assert_eq!(None, clerk.get("never-written"));
    clerk.put("x", "goodbye");
    assert_eq!(Some("goodbye".to_string()), clerk.get("x"));
    cluster.shutdown(vec![group]);
}

#[test]
fn put_hash_chains() {
    let cluster = Cluster::boot("put-hash");
    let group = Group::boot(&cluster, 1, 3);
    group.join(&cluster);
    let clerk = cluster.kv_clerk();
    assert_eq!("", clerk.put_hash("h", "a"));
    assert_eq!(hash_chain(&["a"]), clerk.put_hash("h", "b"));
    assert_eq!(hash_chain(&["a", "b"]), clerk.put_hash("h", "c"));
    assert_eq!(Some(hash_chain(&["a", "b", "c"])), clerk.get("h"));
    cluster.shutdown(vec![group]);
}

#[test]
fn duplicate_op_ids_do_not_reapply() {
    let cluster = Cluster::boot("dedup");
    let group = Group::boot(&cluster, 1, 3);
    group.join(&cluster);
    let clerk_id = ClerkId::generate().unwrap();
    let op_id = OpId::generate().unwrap();
    let client = direct_client(&group.ports[0]);
    let req = PutRequest {
        key: "d".to_string(),
        value: "once".to_string(),
        do_hash: true,
        clerk: clerk_id,
        op_id,
    };
    let deadline = Instant::now() + Duration::from_secs(30);
    let first = loop {
        match client.put(&Context::default(), req.clone()) {
            Ok(resp) if resp.err == KvError::Ok => break resp,
            _ => {
                assert!(Instant::now() < deadline, "group never served the put");
                std::thread::sleep(Duration::from_millis(100));
            }
        }
    };
    // Resending the identical op returns the identical reply without rehashing.
    let second = client.put(&Context::default(), req).unwrap();
    assert_eq!(first.value, second.value);
    let clerk = cluster.kv_clerk();
    assert_eq!(Some(hash_chain(&["once"])), clerk.get("d"));
    cluster.shutdown(vec![group]);
}

#[test]
fn revived_replica_serves_latest_writes() {
    let cluster = Cluster::boot("revive");
    let mut group = Group::boot(&cluster, 1, 3);
    group.join(&cluster);
    let clerk = cluster.kv_clerk();
    clerk.put("x", "hello");
    group.replicas[2].take().unwrap().kill();
    clerk.put("x", "world");
    // The revived replica recovers from a live peer and then serves the newest value.
    let ports = group.ports.clone();
    group.replicas[2] = Some(Group::boot_replica(&cluster, 1, &ports, 2, 100 * 1_000_000));
    let client = direct_client(&group.ports[2]);
    let clerk_id = ClerkId::generate().unwrap();
    let deadline = Instant::now() + Duration::from_secs(30);
    loop {
        let req = GetRequest {
            key: "x".to_string(),
            clerk: clerk_id,
            op_id: OpId::generate().unwrap(),
        };
        if let Ok(resp) = client.get(&Context::default(), req) {
            if resp.err == KvError::Ok {
                assert_eq!("world", resp.value);
                break;
            }
        }
        assert!(
            Instant::now() < deadline,
            "revived replica never served the key"
        );
        std::thread::sleep(Duration::from_millis(100));
    }
    cluster.shutdown(vec![group]);
}

#[test]
fn reconfiguration_migrates_shards() {
    let cluster = Cluster::boot("migrate");
    let g1 = Group::boot(&cluster, 1, 3);
    g1.join(&cluster);
    let clerk = cluster.kv_clerk();
    // Write one key per shard so the migration moves real data.
    let keys: Vec<String> = (0..shardmaster_pb::NUM_SHARDS).map(key_for_shard).collect();
    for (index, key) in keys.iter().enumerate() {
        clerk.put(key, &format!("value-{}", index));
    }
    let g2 = Group::boot(&cluster, 2, 3);
    g2.join(&cluster);
    // Every key keeps its value across the migration, wherever it landed.
    for (index, key) in keys.iter().enumerate() {
        let deadline = Instant::now() + Duration::from_secs(60);
        loop {
            if clerk.get(key) == Some(format!("value-{}", index)) {
                break;
            }
            assert!(Instant::now() < deadline, "key {} lost in migration", key);
            std::thread::sleep(Duration::from_millis(100));
        }
    }
    // And at least one shard moved: some key is now served by group 2.
    let config = cluster.master_clerk().query(-1).unwrap();
    assert!(config.shards.iter().any(|gid| *gid == 2));
    cluster.shutdown(vec![g1, g2]);
}

#[test]
fn chunked_transfers_move_whole_shards() {
    let cluster = Cluster::boot("chunked");
    // A tiny memory budget forces every fetch reply to carry only a few keys.
    let g1 = Group::boot_with_budget(&cluster, 1, 3, 512);
    g1.join(&cluster);
    let clerk = cluster.kv_clerk();
    // Values big enough that each shard's contents dwarf the budget and need several chunks.
    let mut pairs = Vec::new();
    for i in 0..40 {
        let key = format!("fill-{}", i);
        let value = format!("payload-{}-{}", i, "x".repeat(100));
        clerk.put(&key, &value);
        pairs.push((key, value));
    }
    let g2 = Group::boot_with_budget(&cluster, 2, 3, 512);
    g2.join(&cluster);
    for (key, value) in pairs.iter() {
        let deadline = Instant::now() + Duration::from_secs(60);
        loop {
            if clerk.get(key).as_deref() == Some(value.as_str()) {
                break;
            }
            assert!(Instant::now() < deadline, "key {} lost in chunked transfer", key);
            std::thread::sleep(Duration::from_millis(100));
        }
    }
    cluster.shutdown(vec![g1, g2]);
}

#[test]
fn wrong_group_is_surfaced_to_direct_callers() {
    let cluster = Cluster::boot("wrong-group");
    let g1 = Group::boot(&cluster, 1, 3);
    g1.join(&cluster);
    let g2 = Group::boot(&cluster, 2, 3);
    g2.join(&cluster);
    let clerk = cluster.kv_clerk();
    // Find a key served by group 2 and ask group 1 for it directly.
    let config = loop {
        let config = cluster.master_clerk().query(-1).unwrap();
        if config.shards.iter().any(|gid| *gid == 2) {
            break config;
        }
        std::thread::sleep(Duration::from_millis(100));
    };
    let shard = config.shards.iter().position(|gid| *gid == 2).unwrap();
    let key = key_for_shard(shard);
    clerk.put(&key, "somewhere");
    // Group 1 answers WrongGroup once its own configuration catches up to the reassignment.
    let client = direct_client(&g1.ports[0]);
    let deadline = Instant::now() + Duration::from_secs(30);
    loop {
        let req = GetRequest {
            key: key.clone(),
            clerk: ClerkId::generate().unwrap(),
            op_id: OpId::generate().unwrap(),
        };
        if let Ok(resp) = client.get(&Context::default(), req) {
            if resp.err == KvError::WrongGroup {
                break;
            }
        }
        assert!(
            Instant::now() < deadline,
            "group 1 never disowned the shard"
        );
        std::thread::sleep(Duration::from_millis(100));
    }
    cluster.shutdown(vec![g1, g2]);
}
