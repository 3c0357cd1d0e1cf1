#![doc = include_str!("../README.md")]

use std::collections::{HashMap, HashSet};
use std::io::{BufWriter, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use arrrg_derive::CommandLine;
use biometrics::{Collector, Counter};
use buffertk::{stack_pack, v64, Unpackable};
use indicio::{clue, DEBUG, ERROR, INFO};
use rpc_pb::Context;
use sync42::background::BackgroundThread;
use zerror::Z;
use zerror_core::ErrorCore;

use lazyrpc::{ClientOptions, Server, ServerOptions, ServiceRegistry};
use paxos::{Paxos, PaxosOptions, PaxosStatus};
use paxos_pb::PaxosServer;
use shardkv_pb::{
    fnv1a64, shard_for_key, ClerkId, ClientResponse, Error, FetchCompleteRequest,
    FetchCompleteResponse, FetchRequest, FetchResponse, GetRequest, KvError, KvOp, KvPair,
    KvResponse, OpId, PutRequest, RecoverDoneRequest, RecoverDoneResponse, RecoverRequest,
    RecoverResponse, ShardKvClient, ShardKvServer, ShardKvService, STREAM_END, STREAM_KV,
};
use shardmaster::MasterClerk;
use shardmaster_pb::Config;
use stowage::{Stowage, StowageOptions};

mod clerk;

pub use clerk::KvClerk;

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static PROCESS_KV: Counter = Counter::new("shardkv.process_kv");
static PROCESS_KV_RETRY: Counter = Counter::new("shardkv.process_kv.retry");
static APPLY_OP: Counter = Counter::new("shardkv.apply");
static APPLY_DUPLICATE: Counter = Counter::new("shardkv.apply.duplicate");
static RECONFIGURE: Counter = Counter::new("shardkv.reconfigure");
static RECONFIGURE_STALE: Counter = Counter::new("shardkv.reconfigure.stale");
static FETCH_SERVED: Counter = Counter::new("shardkv.fetch");
static FETCH_REFUSED: Counter = Counter::new("shardkv.fetch.refused");
static FETCH_PULLED: Counter = Counter::new("shardkv.fetch.pulled");
static RECOVER_STREAMED: Counter = Counter::new("shardkv.recover.streamed");
static RECOVER_RESUMED: Counter = Counter::new("shardkv.recover.resumed");
static TICKS: Counter = Counter::new("shardkv.ticks");

/// Register the biometrics for this crate.
pub fn register_biometrics(collector: &Collector) {
    collector.register_counter(&PROCESS_KV);
    collector.register_counter(&PROCESS_KV_RETRY);
    collector.register_counter(&APPLY_OP);
    collector.register_counter(&APPLY_DUPLICATE);
    collector.register_counter(&RECONFIGURE);
    collector.register_counter(&RECONFIGURE_STALE);
    collector.register_counter(&FETCH_SERVED);
    collector.register_counter(&FETCH_REFUSED);
    collector.register_counter(&FETCH_PULLED);
    collector.register_counter(&RECOVER_STREAMED);
    collector.register_counter(&RECOVER_RESUMED);
    collector.register_counter(&TICKS);
}

////////////////////////////////////////////// indicio /////////////////////////////////////////////

pub static COLLECTOR: indicio::Collector = indicio::Collector::new();

///////////////////////////////////////////// Constants ////////////////////////////////////////////

const KV_PREFIX: &str = "KVkey_";
const SEEN_PREFIX: &str = "seen_";
const RESPONSE_PREFIX: &str = "response_";
const MIN_SEQ_KEY: &[u8] = b"minSeq";
const CONFIG_NUM_KEY: &[u8] = b"configNum";

const GATE_POLL: Duration = Duration::from_millis(10);
const FETCH_RETRY: Duration = Duration::from_millis(100);
const FETCH_ROTATE: Duration = Duration::from_millis(250);
const ACK_RETRY: Duration = Duration::from_millis(500);

fn kv_key(key: &str) -> Vec<u8> {
    format!("{}{}", KV_PREFIX, key).into_bytes()
}

fn seen_key(op_id: OpId) -> Vec<u8> {
    format!("{}{}", SEEN_PREFIX, op_id.human_readable()).into_bytes()
}

fn response_key(clerk: ClerkId) -> Vec<u8> {
    format!("{}{}", RESPONSE_PREFIX, clerk.human_readable()).into_bytes()
}

/////////////////////////////////////////// ShardKvOptions /////////////////////////////////////////

/// Options for one shardkv replica.
#[derive(Clone, CommandLine, Debug, Eq, PartialEq)]
pub struct ShardKvOptions {
    /// Directory for this replica's durable state.
    #[arrrg(required, "Directory for this replica's durable state.")]
    pub data_dir: String,
    /// Memory budget, in bytes, for shard transfers and recovery streams.
    #[arrrg(optional, "Memory budget, in bytes, for shard transfers and recovery streams.")]
    pub memory_budget_bytes: u64,
    /// Milliseconds between configuration polls.
    #[arrrg(optional, "Milliseconds between configuration polls.")]
    pub tick_interval_ms: u64,
    /// Client options for peer-to-peer calls.
    #[arrrg(nested)]
    pub client: ClientOptions,
}

impl Default for ShardKvOptions {
    fn default() -> Self {
        Self {
            data_dir: "shardkv".to_string(),
            memory_budget_bytes: 100 * 1_000_000,
            tick_interval_ms: 250,
            client: ClientOptions::default(),
        }
    }
}

////////////////////////////////////////////// KvState /////////////////////////////////////////////

struct KvState {
    config: Config,
    min_seq: i64,
    recovering: bool,
    serving_recovery: bool,
    sending: bool,
    sending_to: String,
    config_cache: HashMap<u64, Config>,
}

/////////////////////////////////////////////// Inner //////////////////////////////////////////////

struct Inner {
    me: usize,
    gid: u64,
    servers: Vec<String>,
    masters: MasterClerk,
    paxos: Paxos,
    stowage: Stowage,
    state: Mutex<KvState>,
    applied: Condvar,
    memory_budget: u64,
    client_options: ClientOptions,
    dead: Arc<AtomicBool>,
}

////////////////////////////////////////////// ShardKv /////////////////////////////////////////////

/// One replica of one shardkv group.  Clone handles freely; they share the replica.
#[derive(Clone)]
pub struct ShardKv {
    inner: Arc<Inner>,
    server: Arc<Server>,
    threads: Arc<Mutex<Vec<BackgroundThread>>>,
    serve: Arc<Mutex<Option<std::thread::JoinHandle<()>>>>,
}

impl ShardKv {
    /// Start a replica of group `gid`.  `servers[me]` is the address this replica binds; the list
    /// forms the group's Paxos ensemble.  `masters` addresses the shardmaster ensemble.  Durable
    /// state is reloaded, and if any group peer is reachable the replica tops itself up from a
    /// peer snapshot before serving.
    pub fn start(
        options: ShardKvOptions,
        gid: u64,
        masters: Vec<String>,
        servers: Vec<String>,
        me: usize,
    ) -> Result<Self, Error> {
        let data_dir = std::path::PathBuf::from(&options.data_dir);
        let paxos_options = PaxosOptions {
            data_dir: data_dir.join("paxos").to_string_lossy().to_string(),
            client: options.client.clone(),
            ..PaxosOptions::default()
        };
        let paxos =
            Paxos::new(paxos_options, servers.clone(), me).map_err(|err| Error::StorageError {
                core: ErrorCore::default(),
                what: err.to_string(),
            })?;
        let stowage =
            Stowage::open(StowageOptions::new(data_dir.join("kv"))).map_err(storage_error)?;
        let masters = MasterClerk::new(options.client.clone(), masters);
        let inner = Arc::new(Inner {
            me,
            gid,
            servers: servers.clone(),
            masters,
            paxos: paxos.clone(),
            stowage,
            state: Mutex::new(KvState {
                config: Config::empty(),
                min_seq: -1,
                recovering: false,
                serving_recovery: false,
                sending: false,
                sending_to: String::new(),
                config_cache: HashMap::new(),
            }),
            applied: Condvar::new(),
            memory_budget: options.memory_budget_bytes,
            client_options: options.client.clone(),
            dead: Arc::new(AtomicBool::new(false)),
        });
        inner.load_durable_state()?;
        inner.maybe_recover();
        let mut registry = ServiceRegistry::new();
        registry.register("PaxosService", PaxosServer::bind(paxos));
        registry.register(
            "ShardKvService",
            ShardKvServer::bind(ShardKvHandle {
                inner: Arc::clone(&inner),
            }),
        );
        let kv = Self {
            inner: Arc::clone(&inner),
            server: Arc::new(Server::new(ServerOptions::new(&servers[me]), registry)?),
            threads: Arc::new(Mutex::new(Vec::new())),
            serve: Arc::new(Mutex::new(None)),
        };
        let server = Arc::clone(&kv.server);
        *kv.serve.lock().unwrap() = Some(std::thread::spawn(move || server.serve()));
        let applier_inner = Arc::clone(&inner);
        let tick_inner = Arc::clone(&inner);
        let tick_interval = Duration::from_millis(options.tick_interval_ms);
        let mut threads = kv.threads.lock().unwrap();
        threads.push(BackgroundThread::spawn(move |done| {
            applier_inner.applier(done);
        }));
        threads.push(BackgroundThread::spawn(move |done| {
            while !done.load(Ordering::Relaxed) && !tick_inner.dead.load(Ordering::Relaxed) {
                tick_inner.tick();
                std::thread::sleep(tick_interval);
            }
        }));
        drop(threads);
        Ok(kv)
    }

    /// The address this replica serves on.
    pub fn local_addr(&self) -> Result<String, Error> {
        Ok(self.server.local_addr()?)
    }

    /// Stop the replica: threads exit, handlers unwind, and the listener closes.
    pub fn kill(&self) {
        self.inner.dead.store(true, Ordering::Relaxed);
        self.inner.applied.notify_all();
        self.inner.paxos.kill();
        self.server.shutdown();
        self.threads.lock().unwrap().clear();
        if let Some(serve) = self.serve.lock().unwrap().take() {
            let _ = serve.join();
        }
    }
}

////////////////////////////////////////////// handle //////////////////////////////////////////////

struct ShardKvHandle {
    inner: Arc<Inner>,
}

impl ShardKvService for ShardKvHandle {
    fn get(&self, _: &Context, req: GetRequest) -> Result<KvResponse, Error> {
        let op = KvOp::Get {
            op_id: req.op_id,
            clerk: req.clerk,
            key: req.key.clone(),
        };
        self.inner.process_kv(op, &req.key, req.op_id, req.clerk)
    }

    fn put(&self, _: &Context, req: PutRequest) -> Result<KvResponse, Error> {
        let op = if req.do_hash {
            KvOp::PutHash {
                op_id: req.op_id,
                clerk: req.clerk,
                key: req.key.clone(),
                value: req.value,
            }
        } else {
            KvOp::Put {
                op_id: req.op_id,
                clerk: req.clerk,
                key: req.key.clone(),
                value: req.value,
            }
        };
        let mut resp = self.inner.process_kv(op, &req.key, req.op_id, req.clerk)?;
        // A put that created the key reads back the empty prior value; that is success.
        if resp.err == KvError::NoKey {
            resp.err = KvError::Ok;
        }
        Ok(resp)
    }

    fn fetch(&self, _: &Context, req: FetchRequest) -> Result<FetchResponse, Error> {
        self.inner.fetch(req)
    }

    fn fetch_complete(
        &self,
        _: &Context,
        req: FetchCompleteRequest,
    ) -> Result<FetchCompleteResponse, Error> {
        let mut state = self.inner.state.lock().unwrap();
        clue!(COLLECTOR, DEBUG, {
            fetch_complete: req.sender.clone(),
        });
        state.sending = false;
        state.sending_to = String::new();
        self.inner.applied.notify_all();
        Ok(FetchCompleteResponse { complete: true })
    }

    fn fetch_recovery(&self, _: &Context, req: RecoverRequest) -> Result<RecoverResponse, Error> {
        let resp = self.inner.begin_recovery(&req)?;
        if req.resume {
            RECOVER_RESUMED.click();
        } else {
            RECOVER_STREAMED.click();
        }
        let inner = Arc::clone(&self.inner);
        std::thread::spawn(move || {
            inner.stream_snapshot(req);
        });
        Ok(resp)
    }

    fn recover_done(
        &self,
        _: &Context,
        _: RecoverDoneRequest,
    ) -> Result<RecoverDoneResponse, Error> {
        let mut state = self.inner.state.lock().unwrap();
        state.serving_recovery = false;
        self.inner.applied.notify_all();
        Ok(RecoverDoneResponse {})
    }
}

////////////////////////////////////////// durable state ///////////////////////////////////////////

impl Inner {
    fn put_value(&self, key: &str, value: &str) {
        self.try_storage(self.stowage.put(&kv_key(key), value.as_bytes()));
    }

    fn get_value(&self, key: &str) -> Option<String> {
        match self.stowage.get(&kv_key(key)) {
            Ok(value) => value.map(|v| String::from_utf8_lossy(&v).to_string()),
            Err(_) => None,
        }
    }

    fn put_seen(&self, op_id: OpId) {
        self.try_storage(self.stowage.put(&seen_key(op_id), b"1"));
    }

    fn get_seen(&self, op_id: OpId) -> bool {
        matches!(self.stowage.get(&seen_key(op_id)), Ok(Some(_)))
    }

    fn put_response(&self, clerk: ClerkId, value: &str) {
        self.try_storage(self.stowage.put(&response_key(clerk), value.as_bytes()));
    }

    // The reply to return for a retry of `op_id`, if the op already applied.
    fn get_response(&self, op_id: OpId, clerk: ClerkId) -> Option<String> {
        if !self.get_seen(op_id) {
            return None;
        }
        match self.stowage.get(&response_key(clerk)) {
            Ok(Some(value)) => Some(String::from_utf8_lossy(&value).to_string()),
            _ => Some(String::new()),
        }
    }

    fn load_durable_state(&self) -> Result<(), Error> {
        let min_seq = match self.stowage.get(MIN_SEQ_KEY).map_err(storage_error)? {
            Some(buf) => <i64 as Unpackable>::unpack(&buf)?.0,
            None => -1,
        };
        let config_num = match self.stowage.get(CONFIG_NUM_KEY).map_err(storage_error)? {
            Some(buf) => <u64 as Unpackable>::unpack(&buf)?.0,
            None => 0,
        };
        let mut state = self.state.lock().unwrap();
        state.min_seq = min_seq;
        drop(state);
        if config_num > 0 {
            let config = self.config_for(config_num);
            let mut state = self.state.lock().unwrap();
            if let Some(config) = config {
                state.config = config;
            }
        }
        Ok(())
    }

    fn persist_min_seq(&self, min_seq: i64) {
        self.try_storage(self.stowage.put(MIN_SEQ_KEY, &stack_pack(min_seq).to_vec()));
    }

    fn persist_config_num(&self, num: u64) {
        self.try_storage(self.stowage.put(CONFIG_NUM_KEY, &stack_pack(num).to_vec()));
    }

    fn try_storage(&self, result: Result<(), stowage::Error>) {
        if let Err(err) = result {
            clue!(COLLECTOR, ERROR, {
                storage_fatal: err.to_string(),
            });
            self.dead.store(true, Ordering::Relaxed);
        }
    }
}

/////////////////////////////////////////////// apply //////////////////////////////////////////////

impl Inner {
    fn applier(&self, done: Arc<AtomicBool>) {
        let mut seq = self.state.lock().unwrap().min_seq + 1;
        let mut nopped = false;
        while !done.load(Ordering::Relaxed) && !self.dead.load(Ordering::Relaxed) {
            {
                let mut state = self.state.lock().unwrap();
                while (state.recovering || state.serving_recovery)
                    && !self.dead.load(Ordering::Relaxed)
                {
                    let (guard, _) = self.applied.wait_timeout(state, GATE_POLL).unwrap();
                    state = guard;
                }
                // A recovery may have advanced the applied floor underneath us.
                if state.min_seq + 1 > seq {
                    seq = state.min_seq + 1;
                    nopped = false;
                }
            }
            match self.paxos.status(seq) {
                PaxosStatus::Decided(buf) => {
                    let op = match KvOp::unpack(&buf) {
                        Ok((op, _)) => op,
                        Err(err) => {
                            // An undecodable decided op means replicas would diverge; dying is
                            // the safe move.
                            let err = Error::from(err);
                            clue!(COLLECTOR, ERROR, {
                                undecodable_op: {
                                    seq: seq,
                                    err: err.to_string(),
                                },
                            });
                            panic!("{}", err.long_form());
                        }
                    };
                    self.apply_op(op);
                    if self.dead.load(Ordering::Relaxed) {
                        // The op did not fully apply; leave the floor so a restart replays it.
                        return;
                    }
                    {
                        let mut state = self.state.lock().unwrap();
                        state.min_seq = seq;
                    }
                    self.persist_min_seq(seq);
                    self.paxos.done(seq);
                    self.applied.notify_all();
                    seq += 1;
                    nopped = false;
                }
                PaxosStatus::Forgotten => {
                    seq += 1;
                    nopped = false;
                }
                PaxosStatus::Pending => {
                    if seq <= self.paxos.max() && !nopped {
                        // A gap below the high-water mark: force it so the log keeps moving.
                        self.paxos.start(seq, stack_pack(&KvOp::Nop).to_vec());
                        nopped = true;
                    }
                    std::thread::sleep(GATE_POLL);
                }
            }
        }
    }

    fn apply_op(&self, op: KvOp) {
        APPLY_OP.click();
        match op {
            KvOp::Nop => {}
            KvOp::Get { op_id, clerk, key } => {
                if self.get_seen(op_id) {
                    APPLY_DUPLICATE.click();
                    return;
                }
                let value = self.get_value(&key).unwrap_or_default();
                self.put_response(clerk, &value);
                self.put_seen(op_id);
            }
            KvOp::Put {
                op_id,
                clerk,
                key,
                value,
            } => {
                if self.get_seen(op_id) {
                    APPLY_DUPLICATE.click();
                    return;
                }
                let old = self.get_value(&key).unwrap_or_default();
                self.put_response(clerk, &old);
                self.put_value(&key, &value);
                self.put_seen(op_id);
            }
            KvOp::PutHash {
                op_id,
                clerk,
                key,
                value,
            } => {
                if self.get_seen(op_id) {
                    APPLY_DUPLICATE.click();
                    return;
                }
                let old = self.get_value(&key).unwrap_or_default();
                self.put_response(clerk, &old);
                let hashed = format!("{}", fnv1a64(format!("{}{}", old, value).as_bytes()));
                self.put_value(&key, &hashed);
                self.put_seen(op_id);
            }
            KvOp::Reconfigure {
                config_num,
                store,
                responses,
                seen,
            } => {
                {
                    let state = self.state.lock().unwrap();
                    if state.config.num >= config_num {
                        RECONFIGURE_STALE.click();
                        return;
                    }
                }
                RECONFIGURE.click();
                let Some(config) = self.config_for(config_num) else {
                    // Only reachable at shutdown; the op will reapply on restart.
                    return;
                };
                for pair in store.iter() {
                    self.put_value(&pair.key, &pair.value);
                }
                for response in responses.iter() {
                    self.put_response(response.clerk, &response.value);
                }
                for op_id in seen.iter() {
                    self.put_seen(*op_id);
                }
                clue!(COLLECTOR, INFO, {
                    reconfigure: {
                        gid: self.gid,
                        num: config_num,
                        keys: store.len() as u64,
                    },
                });
                let mut state = self.state.lock().unwrap();
                state.config = config;
                state.config_cache.retain(|num, _| num + 8 > config_num);
                drop(state);
                self.persist_config_num(config_num);
            }
        }
    }

    // The full Config for `num`, from the tick's cache or the shardmaster.  Blocks until the
    // masters answer; None only at shutdown.
    fn config_for(&self, num: u64) -> Option<Config> {
        {
            let state = self.state.lock().unwrap();
            if let Some(config) = state.config_cache.get(&num) {
                return Some(config.clone());
            }
        }
        while !self.dead.load(Ordering::Relaxed) {
            if let Ok(config) = self.masters.query(num as i64) {
                if config.num == num {
                    let mut state = self.state.lock().unwrap();
                    state.config_cache.insert(num, config.clone());
                    return Some(config);
                }
            }
            std::thread::sleep(FETCH_RETRY);
        }
        None
    }
}

///////////////////////////////////////////// serving //////////////////////////////////////////////

impl Inner {
    // Block while the replica is mid-recovery or mid-transfer, like the original servers do, so
    // client ops cannot interleave with a snapshot.
    fn wait_not_busy(&self) {
        let mut state = self.state.lock().unwrap();
        while (state.recovering || state.serving_recovery || state.sending)
            && !self.dead.load(Ordering::Relaxed)
        {
            let (guard, _) = self.applied.wait_timeout(state, GATE_POLL).unwrap();
            state = guard;
        }
    }

    // Wait until the applier has applied everything at or below `target`.
    fn catch_up_to(&self, target: i64) -> bool {
        let mut state = self.state.lock().unwrap();
        while state.min_seq < target {
            if self.dead.load(Ordering::Relaxed) {
                return false;
            }
            let (guard, _) = self.applied.wait_timeout(state, GATE_POLL).unwrap();
            state = guard;
        }
        true
    }

    fn owns_key(state: &MutexGuard<'_, KvState>, gid: u64, key: &str) -> bool {
        state.config.owner(shard_for_key(key)) == gid
    }

    fn process_kv(
        &self,
        op: KvOp,
        key: &str,
        op_id: OpId,
        clerk: ClerkId,
    ) -> Result<KvResponse, Error> {
        PROCESS_KV.click();
        self.wait_not_busy();
        let buf = stack_pack(&op).to_vec();
        while !self.dead.load(Ordering::Relaxed) {
            if !self.catch_up_to(self.paxos.max()) {
                break;
            }
            {
                let state = self.state.lock().unwrap();
                if !Self::owns_key(&state, self.gid, key) {
                    return Ok(wrong_group());
                }
            }
            if let Some(value) = self.get_response(op_id, clerk) {
                return Ok(ok_or_no_key(value));
            }
            let seq = self.paxos.max() + 1;
            self.paxos.start(seq, buf.clone());
            if !self.catch_up_to(seq) {
                break;
            }
            if let Some(value) = self.get_response(op_id, clerk) {
                return Ok(ok_or_no_key(value));
            }
            {
                let state = self.state.lock().unwrap();
                if !Self::owns_key(&state, self.gid, key) {
                    return Ok(wrong_group());
                }
            }
            // Some other op took the slot; go around again.
            PROCESS_KV_RETRY.click();
        }
        Err(Error::ShuttingDown {
            core: ErrorCore::default(),
        })
    }
}

//////////////////////////////////////////// shard pulls ///////////////////////////////////////////

#[derive(Default)]
struct Deltas {
    store: Vec<KvPair>,
    responses: HashMap<ClerkId, String>,
    seen: HashSet<OpId>,
}

impl Inner {
    fn tick(&self) {
        TICKS.click();
        self.wait_not_busy();
        if self.dead.load(Ordering::Relaxed) {
            return;
        }
        if !self.catch_up_to(self.paxos.max()) {
            return;
        }
        let current = self.state.lock().unwrap().config.clone();
        let Ok(next) = self.masters.query(current.num as i64 + 1) else {
            return;
        };
        if next.num == current.num {
            return;
        }
        clue!(COLLECTOR, INFO, {
            new_config: {
                gid: self.gid,
                from: current.num,
                to: next.num,
            },
        });
        let mut remote_gained = Vec::new();
        for shard in 0..next.shards.len() {
            if next.owner(shard) == self.gid
                && current.owner(shard) != self.gid
                && current.owner(shard) != 0
            {
                remote_gained.push(shard);
            }
        }
        let mut deltas = Deltas::default();
        for shard in remote_gained.into_iter() {
            if !self.pull_shard(&current, &next, shard, &mut deltas) {
                return;
            }
        }
        {
            let mut state = self.state.lock().unwrap();
            state.config_cache.insert(next.num, next.clone());
        }
        let op = KvOp::Reconfigure {
            config_num: next.num,
            store: deltas.store,
            responses: deltas
                .responses
                .into_iter()
                .map(|(clerk, value)| ClientResponse { clerk, value })
                .collect(),
            seen: deltas.seen.into_iter().collect(),
        };
        let buf = stack_pack(&op).to_vec();
        while !self.dead.load(Ordering::Relaxed) {
            {
                let state = self.state.lock().unwrap();
                if state.config.num >= next.num {
                    return;
                }
            }
            let seq = self.paxos.max() + 1;
            self.paxos.start(seq, buf.clone());
            if !self.catch_up_to(seq) {
                return;
            }
        }
    }

    // Pull one shard from its previous owner, chunk by chunk, and ack the transfer.  Returns
    // false only at shutdown.
    fn pull_shard(&self, current: &Config, next: &Config, shard: usize, deltas: &mut Deltas) -> bool {
        let prev_gid = current.owner(shard);
        let Some(servers) = current.servers(prev_gid) else {
            return true;
        };
        let servers = servers.to_vec();
        let sender = format!("{}-{}", self.gid, self.me);
        // Keys survive server rotation: the next replica is told what already arrived.
        let mut keys_received: HashSet<String> = HashSet::new();
        while !self.dead.load(Ordering::Relaxed) {
            for server in servers.iter() {
                let client = ShardKvClient::new(lazyrpc::new_client(
                    self.client_options.clone(),
                    server.clone(),
                ));
                let mut tries = 0usize;
                loop {
                    if self.dead.load(Ordering::Relaxed) {
                        return false;
                    }
                    let mut keys_already_have: Vec<String> =
                        keys_received.iter().cloned().collect();
                    keys_already_have.sort();
                    let req = FetchRequest {
                        config_num: next.num,
                        shard: shard as u64,
                        keys_already_have,
                        sender: sender.clone(),
                    };
                    match client.fetch(&Context::default(), req) {
                        Ok(resp) if resp.err == KvError::Ok => {
                            FETCH_PULLED.click();
                            for pair in resp.store.into_iter() {
                                if keys_received.insert(pair.key.clone()) {
                                    deltas.store.push(pair);
                                }
                            }
                            for response in resp.responses.into_iter() {
                                deltas.responses.insert(response.clerk, response.value);
                            }
                            for op_id in resp.seen.into_iter() {
                                deltas.seen.insert(op_id);
                            }
                            if resp.complete {
                                clue!(COLLECTOR, INFO, {
                                    pulled_shard: {
                                        gid: self.gid,
                                        shard: shard as u64,
                                        from: prev_gid,
                                    },
                                });
                                return self.ack_fetch(&client);
                            }
                        }
                        Ok(_) => {
                            // The owner is not ready to serve this transfer yet.
                            if keys_received.is_empty() {
                                break;
                            }
                            std::thread::sleep(FETCH_RETRY);
                        }
                        Err(_) => {
                            tries += 1;
                            if tries > 5 {
                                // Presume the peer dead but keep acking in the background in
                                // case it wakes holding the send slot.
                                self.spawn_background_ack(server.clone());
                                break;
                            }
                            std::thread::sleep(FETCH_RETRY);
                        }
                    }
                }
            }
            std::thread::sleep(FETCH_ROTATE);
        }
        false
    }

    // The server refuses other peers until this ack lands, so retry it until confirmed.
    fn ack_fetch(&self, client: &ShardKvClient) -> bool {
        let sender = format!("{}-{}", self.gid, self.me);
        while !self.dead.load(Ordering::Relaxed) {
            let req = FetchCompleteRequest {
                sender: sender.clone(),
            };
            if let Ok(resp) = client.fetch_complete(&Context::default(), req) {
                if resp.complete {
                    return true;
                }
            }
            std::thread::sleep(ACK_RETRY);
        }
        false
    }

    fn spawn_background_ack(&self, server: String) {
        let sender = format!("{}-{}", self.gid, self.me);
        let options = self.client_options.clone();
        let dead = Arc::clone(&self.dead);
        std::thread::spawn(move || {
            let client = ShardKvClient::new(lazyrpc::new_client(options, server));
            while !dead.load(Ordering::Relaxed) {
                let req = FetchCompleteRequest {
                    sender: sender.clone(),
                };
                if let Ok(resp) = client.fetch_complete(&Context::default(), req) {
                    if resp.complete {
                        return;
                    }
                }
                std::thread::sleep(ACK_RETRY);
            }
        });
    }

    fn fetch(&self, req: FetchRequest) -> Result<FetchResponse, Error> {
        FETCH_SERVED.click();
        {
            // Claim the send slot in the same critical section that checks it, so two fetchers
            // cannot both slip past the gate.
            let mut state = self.state.lock().unwrap();
            while (state.recovering
                || state.serving_recovery
                || (state.sending && state.sending_to != req.sender))
                && !self.dead.load(Ordering::Relaxed)
            {
                let (guard, _) = self.applied.wait_timeout(state, GATE_POLL).unwrap();
                state = guard;
            }
            if self.dead.load(Ordering::Relaxed) {
                return Err(Error::ShuttingDown {
                    core: ErrorCore::default(),
                });
            }
            state.sending = true;
            state.sending_to = req.sender.clone();
        }
        if !self.catch_up_to(self.paxos.max()) {
            self.release_sending();
            return Err(Error::ShuttingDown {
                core: ErrorCore::default(),
            });
        }
        {
            let state = self.state.lock().unwrap();
            if req.config_num > state.config.num + 1 {
                // We have not seen the configuration driving this transfer; the fetcher retries.
                drop(state);
                self.release_sending();
                FETCH_REFUSED.click();
                return Ok(FetchResponse {
                    err: KvError::WrongGroup,
                    ..FetchResponse::default()
                });
            }
        }
        let have: HashSet<&String> = req.keys_already_have.iter().collect();
        let budget = (self.memory_budget * 3 / 4) as usize;
        let mut bytes = 0usize;
        let mut store = Vec::new();
        let mut complete = true;
        for (key, value) in self.stowage.prefix_scan(KV_PREFIX.as_bytes()) {
            let user_key = String::from_utf8_lossy(&key[KV_PREFIX.len()..]).to_string();
            if shard_for_key(&user_key) != req.shard as usize {
                continue;
            }
            if have.contains(&user_key) {
                continue;
            }
            if bytes >= budget {
                complete = false;
                break;
            }
            bytes += key.len() + value.len();
            store.push(KvPair {
                key: user_key,
                value: String::from_utf8_lossy(&value).to_string(),
            });
        }
        let mut responses = Vec::new();
        for (key, value) in self.stowage.prefix_scan(RESPONSE_PREFIX.as_bytes()) {
            let readable = String::from_utf8_lossy(&key[RESPONSE_PREFIX.len()..]).to_string();
            if let Some(clerk) = ClerkId::from_human_readable(&readable) {
                responses.push(ClientResponse {
                    clerk,
                    value: String::from_utf8_lossy(&value).to_string(),
                });
            }
        }
        let mut seen = Vec::new();
        for (key, _) in self.stowage.prefix_scan(SEEN_PREFIX.as_bytes()) {
            let readable = String::from_utf8_lossy(&key[SEEN_PREFIX.len()..]).to_string();
            if let Some(op_id) = OpId::from_human_readable(&readable) {
                seen.push(op_id);
            }
        }
        Ok(FetchResponse {
            store,
            responses,
            seen,
            complete,
            err: KvError::Ok,
        })
    }
}

///////////////////////////////////////////// recovery /////////////////////////////////////////////

enum RecoverOutcome {
    Done,
    Unreachable,
    Dead,
}

impl Inner {
    fn begin_recovery(&self, req: &RecoverRequest) -> Result<RecoverResponse, Error> {
        let mut state = self.state.lock().unwrap();
        while state.serving_recovery && !req.resume && !self.dead.load(Ordering::Relaxed) {
            let (guard, _) = self.applied.wait_timeout(state, GATE_POLL).unwrap();
            state = guard;
        }
        if self.dead.load(Ordering::Relaxed) {
            return Err(Error::ShuttingDown {
                core: ErrorCore::default(),
            });
        }
        // Freeze the applier for the duration of the stream so the snapshot is consistent with
        // the min_seq in this reply.  recover_done releases it.
        state.serving_recovery = true;
        Ok(RecoverResponse {
            config: state.config.clone(),
            min_seq: state.min_seq,
            err: false,
        })
    }

    fn stream_snapshot(&self, req: RecoverRequest) {
        let conn = std::net::TcpStream::connect_timeout(
            &match req.address.parse() {
                Ok(addr) => addr,
                Err(_) => {
                    self.release_recovery();
                    return;
                }
            },
            Duration::from_millis(1_000),
        );
        let conn = match conn {
            Ok(conn) => conn,
            Err(_) => {
                // Nothing was ever streamed on this round; a fresh request starts over.
                if !req.resume {
                    self.release_recovery();
                }
                return;
            }
        };
        let mut writer = BufWriter::new(conn);
        let budget = (self.memory_budget * 3 / 4) as usize;
        let (pairs, more) = self.stowage.scan_after(req.last_key.as_bytes(), budget);
        for (key, value) in pairs.into_iter() {
            if req.shard >= 0 {
                let Some(user_key) = key.strip_prefix(KV_PREFIX.as_bytes()) else {
                    continue;
                };
                let user_key = String::from_utf8_lossy(user_key).to_string();
                if shard_for_key(&user_key) != req.shard as usize {
                    continue;
                }
            }
            if write_stream_record(&mut writer, &key, &value).is_err() {
                // The recoverer resumes from its last good key.
                return;
            }
        }
        if !more {
            let _ = writer.write_all(&[STREAM_END]);
        }
        let _ = writer.flush();
    }

    fn release_recovery(&self) {
        let mut state = self.state.lock().unwrap();
        state.serving_recovery = false;
        self.applied.notify_all();
    }

    fn release_sending(&self) {
        let mut state = self.state.lock().unwrap();
        state.sending = false;
        state.sending_to = String::new();
        self.applied.notify_all();
    }

    // On startup, top up from a peer's snapshot.  A fresh boot where no peer answers skips
    // recovery; a restart into a live group streams the authoritative superset.
    fn maybe_recover(&self) {
        if self.servers.len() == 1 {
            return;
        }
        {
            let mut state = self.state.lock().unwrap();
            state.recovering = true;
        }
        let host = self.servers[self.me]
            .rsplit_once(':')
            .map(|(host, _)| host.to_string())
            .unwrap_or_else(|| "127.0.0.1".to_string());
        if let Ok(listener) = TcpListener::bind((host.as_str(), 0)) {
            let _ = listener.set_nonblocking(true);
            for offset in 1..self.servers.len() {
                let peer = (self.me + offset) % self.servers.len();
                match self.recover_from(&listener, &self.servers[peer]) {
                    RecoverOutcome::Done | RecoverOutcome::Dead => {
                        break;
                    }
                    RecoverOutcome::Unreachable => {}
                }
            }
        }
        let mut state = self.state.lock().unwrap();
        state.recovering = false;
        drop(state);
        self.applied.notify_all();
    }

    fn recover_from(&self, listener: &TcpListener, server: &str) -> RecoverOutcome {
        let Ok(address) = listener.local_addr() else {
            return RecoverOutcome::Dead;
        };
        let client = ShardKvClient::new(lazyrpc::new_client(
            self.client_options.clone(),
            server.to_string(),
        ));
        let mut req = RecoverRequest {
            address: address.to_string(),
            shard: -1,
            resume: false,
            last_key: String::new(),
        };
        loop {
            if self.dead.load(Ordering::Relaxed) {
                return RecoverOutcome::Dead;
            }
            let resp = match client.fetch_recovery(&Context::default(), req.clone()) {
                Ok(resp) if !resp.err => resp,
                _ => {
                    if req.resume {
                        let _ = client.recover_done(&Context::default(), RecoverDoneRequest {});
                    }
                    return RecoverOutcome::Unreachable;
                }
            };
            {
                let mut state = self.state.lock().unwrap();
                state.min_seq = resp.min_seq;
                state.config = resp.config.clone();
            }
            self.persist_min_seq(resp.min_seq);
            self.persist_config_num(resp.config.num);
            let conn = match accept_with_deadline(listener, Duration::from_secs(2), &self.dead) {
                Some(conn) => conn,
                None => {
                    let _ = client.recover_done(&Context::default(), RecoverDoneRequest {});
                    return RecoverOutcome::Unreachable;
                }
            };
            match self.read_snapshot(conn, &mut req.last_key) {
                SnapshotRead::Finished => {
                    let _ = client.recover_done(&Context::default(), RecoverDoneRequest {});
                    clue!(COLLECTOR, INFO, {
                        recovered: {
                            gid: self.gid,
                            from: server,
                            min_seq: self.state.lock().unwrap().min_seq,
                        },
                    });
                    return RecoverOutcome::Done;
                }
                SnapshotRead::Truncated => {
                    req.resume = true;
                }
            }
        }
    }

    fn read_snapshot(&self, conn: TcpStream, last_key: &mut String) -> SnapshotRead {
        let _ = conn.set_read_timeout(Some(Duration::from_secs(2)));
        let mut reader = std::io::BufReader::new(conn);
        loop {
            let mut tag = [0u8; 1];
            if reader.read_exact(&mut tag).is_err() {
                return SnapshotRead::Truncated;
            }
            match tag[0] {
                STREAM_END => {
                    return SnapshotRead::Finished;
                }
                STREAM_KV => {
                    let Some(key) = read_stream_field(&mut reader) else {
                        return SnapshotRead::Truncated;
                    };
                    let Some(value) = read_stream_field(&mut reader) else {
                        return SnapshotRead::Truncated;
                    };
                    // The stream carries raw store records; install them through the same
                    // write-through store the applier uses.
                    self.try_storage(self.stowage.put(&key, &value));
                    *last_key = String::from_utf8_lossy(&key).to_string();
                }
                _ => {
                    return SnapshotRead::Truncated;
                }
            }
        }
    }
}

enum SnapshotRead {
    Finished,
    Truncated,
}

///////////////////////////////////////// stream plumbing //////////////////////////////////////////

fn write_stream_record<W: Write>(writer: &mut W, key: &[u8], value: &[u8]) -> Result<(), std::io::Error> {
    writer.write_all(&[STREAM_KV])?;
    let key_len: v64 = key.len().into();
    writer.write_all(&stack_pack(key_len).to_vec())?;
    writer.write_all(key)?;
    let value_len: v64 = value.len().into();
    writer.write_all(&stack_pack(value_len).to_vec())?;
    writer.write_all(value)
}

fn read_stream_field<R: Read>(reader: &mut R) -> Option<Vec<u8>> {
    let mut len: u64 = 0;
    let mut shift = 0u32;
    loop {
        let mut byte = [0u8; 1];
        reader.read_exact(&mut byte).ok()?;
        len |= ((byte[0] & 0x7f) as u64) << shift;
        shift += 7;
        if byte[0] & 0x80 == 0 {
            break;
        }
        if shift >= 64 {
            return None;
        }
    }
    if len > stowage::MAX_KEY_LEN.max(stowage::MAX_VALUE_LEN) as u64 {
        return None;
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).ok()?;
    Some(buf)
}

fn accept_with_deadline(
    listener: &TcpListener,
    deadline: Duration,
    dead: &AtomicBool,
) -> Option<TcpStream> {
    let until = Instant::now() + deadline;
    while Instant::now() < until && !dead.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((conn, _)) => {
                return Some(conn);
            }
            Err(err)
                if err.kind() == std::io::ErrorKind::WouldBlock
                    || err.kind() == std::io::ErrorKind::TimedOut =>
            {
                std::thread::sleep(GATE_POLL);
            }
            Err(_) => {
                return None;
            }
        }
    }
    None
}

/////////////////////////////////////////////// utils //////////////////////////////////////////////

fn wrong_group() -> KvResponse {
    KvResponse {
        value: String::new(),
        err: KvError::WrongGroup,
    }
}

fn ok_or_no_key(value: String) -> KvResponse {
    let err = if value.is_empty() {
        KvError::NoKey
    } else {
        KvError::Ok
    };
    KvResponse { value, err }
}

fn storage_error(err: stowage::Error) -> Error {
    Error::StorageError {
        core: ErrorCore::default(),
        what: err.to_string(),
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn responses_distinguish_empty_from_missing() {
        assert_eq!(KvError::NoKey, ok_or_no_key(String::new()).err);
        assert_eq!(KvError::Ok, ok_or_no_key("x".to_string()).err);
    }

    #[test]
    fn key_schema_prefixes_are_disjoint() {
        let op_id = OpId::BOTTOM;
        let clerk = ClerkId::BOTTOM;
        assert!(kv_key("a").starts_with(KV_PREFIX.as_bytes()));
        assert!(seen_key(op_id).starts_with(SEEN_PREFIX.as_bytes()));
        assert!(response_key(clerk).starts_with(RESPONSE_PREFIX.as_bytes()));
    }
}
