use std::sync::Mutex;
use std::time::Duration;

use indicio::{clue, DEBUG};
use rpc_pb::Context;

use lazyrpc::ClientOptions;
use shardkv_pb::{
    shard_for_key, ClerkId, GetRequest, KvError, OpId, PutRequest, ShardKvClient, ShardKvService,
};
use shardmaster::MasterClerk;
use shardmaster_pb::Config;

use super::COLLECTOR;

const RETRY: Duration = Duration::from_millis(100);

/// A client of the sharded key-value service.  The clerk routes each key to the group that owns
/// its shard, refreshes the configuration on ErrWrongGroup, and retries with a stable op id so a
/// reply lost in the network is deduplicated rather than reapplied.
pub struct KvClerk {
    masters: MasterClerk,
    options: ClientOptions,
    clerk_id: ClerkId,
    config: Mutex<Config>,
}

impl KvClerk {
    /// A clerk addressing the cluster through the provided shardmaster replicas.
    pub fn new(options: ClientOptions, master_servers: Vec<String>) -> Self {
        Self {
            masters: MasterClerk::new(options.clone(), master_servers),
            options,
            clerk_id: ClerkId::generate().expect("urandom should be available"),
            config: Mutex::new(Config::empty()),
        }
    }

    /// The value at `key`, or None when the key is absent.
    pub fn get(&self, key: &str) -> Option<String> {
        let op_id = OpId::generate().expect("urandom should be available");
        let resp = self.each_owner(key, |client| {
            client.get(
                &Context::default(),
                GetRequest {
                    key: key.to_string(),
                    clerk: self.clerk_id,
                    op_id,
                },
            )
        });
        match resp.1 {
            KvError::NoKey => None,
            _ => Some(resp.0),
        }
    }

    /// Durably associate `value` with `key`.
    pub fn put(&self, key: &str, value: &str) {
        let op_id = OpId::generate().expect("urandom should be available");
        self.each_owner(key, |client| {
            client.put(
                &Context::default(),
                PutRequest {
                    key: key.to_string(),
                    value: value.to_string(),
                    do_hash: false,
                    clerk: self.clerk_id,
                    op_id,
                },
            )
        });
    }

    /// Fold `value` into the hash chain at `key`, returning the prior value.
    pub fn put_hash(&self, key: &str, value: &str) -> String {
        let op_id = OpId::generate().expect("urandom should be available");
        self.each_owner(key, |client| {
            client.put(
                &Context::default(),
                PutRequest {
                    key: key.to_string(),
                    value: value.to_string(),
                    do_hash: true,
                    clerk: self.clerk_id,
                    op_id,
                },
            )
        })
        .0
    }

    // Try every replica of the owning group until one answers; re-query the configuration and go
    // around on ErrWrongGroup.  The op id inside `f` stays fixed across retries.
    fn each_owner<F: Fn(&ShardKvClient) -> Result<shardkv_pb::KvResponse, shardkv_pb::Error>>(
        &self,
        key: &str,
        f: F,
    ) -> (String, KvError) {
        loop {
            let config = self.config.lock().unwrap().clone();
            let gid = config.owner(shard_for_key(key));
            if gid != 0 {
                if let Some(servers) = config.servers(gid) {
                    for server in servers.iter() {
                        let client = ShardKvClient::new(lazyrpc::new_client(
                            self.options.clone(),
                            server.clone(),
                        ));
                        match f(&client) {
                            Ok(resp) if resp.err != KvError::WrongGroup => {
                                return (resp.value, resp.err);
                            }
                            Ok(_) => {
                                clue!(COLLECTOR, DEBUG, {
                                    clerk_wrong_group: server.clone(),
                                });
                                break;
                            }
                            Err(_) => {}
                        }
                    }
                }
            }
            if let Ok(config) = self.masters.query(-1) {
                *self.config.lock().unwrap() = config;
            }
            std::thread::sleep(RETRY);
        }
    }
}
