#![doc = include_str!("../README.md")]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, SystemTime};

use arrrg_derive::CommandLine;
use biometrics::{Collector, Counter};
use buffertk::{stack_pack, Unpackable};
use indicio::{clue, DEBUG, ERROR, INFO};
use rpc_pb::Context;
use sync42::background::BackgroundThread;
use zerror::Z;
use zerror_core::ErrorCore;

use lazyrpc::{ClientOptions, Server, ServerOptions, ServiceRegistry};
use paxos::{Paxos, PaxosOptions, PaxosStatus};
use paxos_pb::PaxosServer;
use shardmaster_pb::{
    Config, Error, Group, JoinRequest, JoinResponse, LeaveRequest, LeaveResponse, MasterOp,
    MoveRequest, MoveResponse, OpId, QueryRequest, QueryResponse, ShardMasterClient,
    ShardMasterServer, ShardMasterService, GID_NONE, NUM_SHARDS,
};
use stowage::{Stowage, StowageOptions};

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static SUBMIT: Counter = Counter::new("shardmaster.submit");
static SUBMIT_RETRY: Counter = Counter::new("shardmaster.submit.retry");
static APPLY: Counter = Counter::new("shardmaster.apply");
static APPLY_NOOP: Counter = Counter::new("shardmaster.apply.noop");
static NOP_PROPOSED: Counter = Counter::new("shardmaster.nop_proposed");
static CONFIGS_APPENDED: Counter = Counter::new("shardmaster.configs.appended");

/// Register the biometrics for this crate.
pub fn register_biometrics(collector: &Collector) {
    collector.register_counter(&SUBMIT);
    collector.register_counter(&SUBMIT_RETRY);
    collector.register_counter(&APPLY);
    collector.register_counter(&APPLY_NOOP);
    collector.register_counter(&NOP_PROPOSED);
    collector.register_counter(&CONFIGS_APPENDED);
}

////////////////////////////////////////////// indicio /////////////////////////////////////////////

pub static COLLECTOR: indicio::Collector = indicio::Collector::new();

///////////////////////////////////////////// Constants ////////////////////////////////////////////

const CONFIG_PREFIX: &str = "config:";
const APPLIED_KEY: &[u8] = b"applied";

// The applier waits this long for a slot to decide before forcing it with a Nop.
const APPLIER_WAIT_FLOOR: Duration = Duration::from_millis(10);
const APPLIER_WAIT_CEILING: Duration = Duration::from_millis(25);

fn config_key(num: u64) -> Vec<u8> {
    format!("{}{:020}", CONFIG_PREFIX, num).into_bytes()
}

////////////////////////////////////////////// rebalance ///////////////////////////////////////////

// Deterministic rebalancing: every replica applies the same op to the same config and must
// produce byte-identical shards.  Group ids are visited in sorted order and ties break toward
// the lowest gid; the shard moved is the lowest-numbered shard the donor owns.
fn rebalance(shards: &mut [u64], gids: &[u64]) {
    if gids.is_empty() {
        return;
    }
    loop {
        let mut counts: HashMap<u64, usize> = gids.iter().map(|g| (*g, 0)).collect();
        for gid in shards.iter() {
            if let Some(count) = counts.get_mut(gid) {
                *count += 1;
            }
        }
        let mut most = gids[0];
        let mut least = gids[0];
        for gid in gids.iter() {
            if counts[gid] > counts[&most] {
                most = *gid;
            }
            if counts[gid] < counts[&least] {
                least = *gid;
            }
        }
        if counts[&most] <= counts[&least] + 1 {
            return;
        }
        for shard in shards.iter_mut() {
            if *shard == most {
                *shard = least;
                break;
            }
        }
    }
}

////////////////////////////////////////////// Waiter //////////////////////////////////////////////

// A one-shot rendezvous between the handler that proposed into a slot and the applier that
// decides what actually landed there.
struct Waiter {
    decided: Mutex<Option<MasterOp>>,
    cnd: Condvar,
}

impl Waiter {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            decided: Mutex::new(None),
            cnd: Condvar::new(),
        })
    }

    fn deliver(&self, op: MasterOp) {
        let mut decided = self.decided.lock().unwrap();
        *decided = Some(op);
        self.cnd.notify_all();
    }

    fn wait(&self, dead: &AtomicBool) -> Option<MasterOp> {
        let mut decided = self.decided.lock().unwrap();
        loop {
            if let Some(op) = decided.take() {
                return Some(op);
            }
            if dead.load(Ordering::Relaxed) {
                return None;
            }
            let (guard, _) = self
                .cnd
                .wait_timeout(decided, Duration::from_millis(100))
                .unwrap();
            decided = guard;
        }
    }
}

/////////////////////////////////////// ShardMasterOptions /////////////////////////////////////////

/// Options for one shardmaster replica.
#[derive(Clone, CommandLine, Debug, Default, Eq, PartialEq)]
pub struct ShardMasterOptions {
    /// Directory for this replica's durable state.
    #[arrrg(required, "Directory for this replica's durable state.")]
    pub data_dir: String,
    /// Client options for peer-to-peer calls.
    #[arrrg(nested)]
    pub client: ClientOptions,
}

/////////////////////////////////////////// MasterState ////////////////////////////////////////////

struct MasterState {
    configs: Vec<Config>,
    highest_applied: i64,
    waiters: HashMap<i64, Arc<Waiter>>,
}

/////////////////////////////////////////////// Inner //////////////////////////////////////////////

struct Inner {
    me: usize,
    paxos: Paxos,
    stowage: Stowage,
    state: Mutex<MasterState>,
    op_counter: AtomicU64,
    dead: AtomicBool,
}

//////////////////////////////////////////// ShardMaster ///////////////////////////////////////////

/// One replica of the shard configuration service.  Clone handles freely; they share the replica.
#[derive(Clone)]
pub struct ShardMaster {
    inner: Arc<Inner>,
    server: Arc<Server>,
    threads: Arc<Mutex<Vec<BackgroundThread>>>,
    serve: Arc<Mutex<Option<std::thread::JoinHandle<()>>>>,
}

impl ShardMaster {
    /// Start a replica.  `peers[me]` is the address this replica binds; the whole list forms the
    /// Paxos ensemble.  Durable state under `options.data_dir` is reloaded on restart.
    pub fn start(
        options: ShardMasterOptions,
        peers: Vec<String>,
        me: usize,
    ) -> Result<Self, Error> {
        let data_dir = std::path::PathBuf::from(&options.data_dir);
        let paxos_options = PaxosOptions {
            data_dir: data_dir.join("paxos").to_string_lossy().to_string(),
            client: options.client.clone(),
            ..PaxosOptions::default()
        };
        let paxos =
            Paxos::new(paxos_options, peers.clone(), me).map_err(|err| Error::StorageError {
                core: ErrorCore::default(),
                what: err.to_string(),
            })?;
        let stowage = Stowage::open(StowageOptions::new(data_dir.join("master")))
            .map_err(storage_error)?;
        let mut configs = Vec::new();
        for (_, value) in stowage.prefix_scan(CONFIG_PREFIX.as_bytes()) {
            configs.push(Config::unpack(&value)?.0);
        }
        if configs.is_empty() {
            let empty = Config::empty();
            stowage
                .put(&config_key(0), &stack_pack(&empty).to_vec())
                .map_err(storage_error)?;
            configs.push(empty);
        }
        let mut highest_applied = -1i64;
        if let Some(applied) = stowage.get(APPLIED_KEY).map_err(storage_error)? {
            highest_applied = <i64 as Unpackable>::unpack(&applied)?.0;
        }
        let inner = Arc::new(Inner {
            me,
            paxos: paxos.clone(),
            stowage,
            state: Mutex::new(MasterState {
                configs,
                highest_applied,
                waiters: HashMap::new(),
            }),
            op_counter: AtomicU64::new(unix_nanos()),
            dead: AtomicBool::new(false),
        });
        let master = Self {
            inner: Arc::clone(&inner),
            server: Arc::new(Server::new(
                ServerOptions::new(&peers[me]),
                Self::registry(&inner, paxos),
            )?),
            threads: Arc::new(Mutex::new(Vec::new())),
            serve: Arc::new(Mutex::new(None)),
        };
        let server = Arc::clone(&master.server);
        *master.serve.lock().unwrap() = Some(std::thread::spawn(move || server.serve()));
        let applier_inner = Arc::clone(&inner);
        master
            .threads
            .lock()
            .unwrap()
            .push(BackgroundThread::spawn(move |done| {
                applier_inner.applier(done);
            }));
        Ok(master)
    }

    fn registry(inner: &Arc<Inner>, paxos: Paxos) -> ServiceRegistry {
        let mut registry = ServiceRegistry::new();
        registry.register("PaxosService", PaxosServer::bind(paxos));
        registry.register(
            "ShardMasterService",
            ShardMasterServer::bind(ShardMaster::handle(inner)),
        );
        registry
    }

    fn handle(inner: &Arc<Inner>) -> ShardMasterHandle {
        ShardMasterHandle {
            inner: Arc::clone(inner),
        }
    }

    /// The address this replica serves on.
    pub fn local_addr(&self) -> Result<String, Error> {
        Ok(self.server.local_addr()?)
    }

    /// Stop the replica: the applier exits, handlers unwind, and the listener closes.
    pub fn kill(&self) {
        self.inner.dead.store(true, Ordering::Relaxed);
        self.inner.paxos.kill();
        self.server.shutdown();
        self.threads.lock().unwrap().clear();
        if let Some(serve) = self.serve.lock().unwrap().take() {
            let _ = serve.join();
        }
    }
}

////////////////////////////////////////////// handle //////////////////////////////////////////////

// The service-facing face of a replica.  Split from ShardMaster so the registry can own one
// without keeping the whole replica alive.
struct ShardMasterHandle {
    inner: Arc<Inner>,
}

impl ShardMasterService for ShardMasterHandle {
    fn join(&self, _: &Context, req: JoinRequest) -> Result<JoinResponse, Error> {
        let op = MasterOp::Join {
            op_id: self.inner.mint_op_id(),
            gid: req.gid,
            servers: req.servers,
        };
        self.inner.submit(op)?;
        Ok(JoinResponse {})
    }

    fn leave(&self, _: &Context, req: LeaveRequest) -> Result<LeaveResponse, Error> {
        let op = MasterOp::Leave {
            op_id: self.inner.mint_op_id(),
            gid: req.gid,
        };
        self.inner.submit(op)?;
        Ok(LeaveResponse {})
    }

    fn mv(&self, _: &Context, req: MoveRequest) -> Result<MoveResponse, Error> {
        let op = MasterOp::Move {
            op_id: self.inner.mint_op_id(),
            shard: req.shard,
            gid: req.gid,
        };
        self.inner.submit(op)?;
        Ok(MoveResponse {})
    }

    fn query(&self, _: &Context, req: QueryRequest) -> Result<QueryResponse, Error> {
        let op = MasterOp::Query {
            op_id: self.inner.mint_op_id(),
        };
        self.inner.submit(op)?;
        let state = self.inner.state.lock().unwrap();
        let config = if req.num >= 0 && (req.num as usize) < state.configs.len() {
            state.configs[req.num as usize].clone()
        } else {
            state.configs[state.configs.len() - 1].clone()
        };
        Ok(QueryResponse { config })
    }
}

/////////////////////////////////////////////// Inner //////////////////////////////////////////////

impl Inner {
    // Op ids only need to be unique across live proposals; index by replica and a counter seeded
    // off the clock so a restarted replica does not reuse its pre-crash ids.
    fn mint_op_id(&self) -> OpId {
        let count = self.op_counter.fetch_add(1, Ordering::Relaxed);
        let mut id = [0u8; one_two_eight::BYTES];
        id[..8].copy_from_slice(&(self.me as u64).to_be_bytes());
        id[8..].copy_from_slice(&count.to_be_bytes());
        OpId::new(id)
    }

    // Propose `op` until it lands in the log.  Acceptance is detected by comparing the decided
    // op's id against our own.
    fn submit(&self, op: MasterOp) -> Result<(), Error> {
        SUBMIT.click();
        let op_id = op.op_id();
        let buf = stack_pack(&op).to_vec();
        while !self.dead.load(Ordering::Relaxed) {
            let (seq, waiter) = self.claim_slot();
            self.paxos.start(seq, buf.clone());
            let decided = waiter.wait(&self.dead);
            {
                let mut state = self.state.lock().unwrap();
                state.waiters.remove(&seq);
            }
            match decided {
                Some(decided) if decided.op_id() == op_id => {
                    return Ok(());
                }
                Some(_) => {
                    SUBMIT_RETRY.click();
                }
                None => {
                    break;
                }
            }
        }
        Err(Error::ShuttingDown {
            core: ErrorCore::default(),
        })
    }

    fn claim_slot(&self) -> (i64, Arc<Waiter>) {
        let mut state = self.state.lock().unwrap();
        let mut seq = std::cmp::max(self.paxos.max() + 1, state.highest_applied + 1);
        while state.waiters.contains_key(&seq) {
            seq += 1;
        }
        let waiter = Waiter::new();
        state.waiters.insert(seq, Arc::clone(&waiter));
        (seq, waiter)
    }

    fn applier(&self, done: Arc<AtomicBool>) {
        let mut seq = self.state.lock().unwrap().highest_applied + 1;
        let mut wait = APPLIER_WAIT_FLOOR;
        let mut nopped = false;
        while !done.load(Ordering::Relaxed) && !self.dead.load(Ordering::Relaxed) {
            match self.paxos.status(seq) {
                PaxosStatus::Decided(buf) => {
                    let op = match MasterOp::unpack(&buf) {
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
                    self.apply(seq, op);
                    if self.dead.load(Ordering::Relaxed) {
                        // The op did not durably apply; leave the floor so a restart replays it.
                        return;
                    }
                    self.paxos.done(seq);
                    seq += 1;
                    wait = APPLIER_WAIT_FLOOR;
                    nopped = false;
                }
                PaxosStatus::Forgotten => {
                    // Below every peer's floor, so it was applied here before it was forgotten.
                    seq += 1;
                }
                PaxosStatus::Pending => {
                    std::thread::sleep(wait);
                    if wait < APPLIER_WAIT_CEILING {
                        wait *= 2;
                    } else if !nopped {
                        NOP_PROPOSED.click();
                        self.paxos.start(seq, stack_pack(&MasterOp::Nop).to_vec());
                        nopped = true;
                        wait = APPLIER_WAIT_FLOOR;
                    }
                }
            }
        }
    }

    fn apply(&self, seq: i64, op: MasterOp) {
        APPLY.click();
        let mut state = self.state.lock().unwrap();
        if let Some(config) = next_config(state.configs.last().unwrap(), &op) {
            clue!(COLLECTOR, DEBUG, {
                append_config: {
                    num: config.num,
                    shards: format!("{:?}", config.shards),
                },
            });
            CONFIGS_APPENDED.click();
            self.try_storage(
                self.stowage
                    .put(&config_key(config.num), &stack_pack(&config).to_vec()),
            );
            state.configs.push(config);
        } else {
            APPLY_NOOP.click();
        }
        state.highest_applied = seq;
        self.try_storage(self.stowage.put(APPLIED_KEY, &stack_pack(seq).to_vec()));
        if let Some(waiter) = state.waiters.remove(&seq) {
            waiter.deliver(op);
        }
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

//////////////////////////////////////////// next_config ///////////////////////////////////////////

// The new configuration `op` produces from `current`, or None when the op changes nothing.
// Deterministic: every replica computes the same config for the same (current, op).
fn next_config(current: &Config, op: &MasterOp) -> Option<Config> {
    match op {
        MasterOp::Nop | MasterOp::Query { .. } => None,
        MasterOp::Join { gid, servers, .. } => {
            if current.has_group(*gid) || *gid == GID_NONE {
                return None;
            }
            let mut config = Config {
                num: current.num + 1,
                shards: padded_shards(current),
                groups: current.groups.clone(),
            };
            let index = config
                .groups
                .binary_search_by_key(gid, |g| g.gid)
                .unwrap_err();
            config.groups.insert(
                index,
                Group {
                    gid: *gid,
                    servers: servers.clone(),
                },
            );
            for shard in config.shards.iter_mut() {
                if *shard == GID_NONE {
                    *shard = *gid;
                }
            }
            let gids: Vec<u64> = config.groups.iter().map(|g| g.gid).collect();
            rebalance(&mut config.shards, &gids);
            Some(config)
        }
        MasterOp::Leave { gid, .. } => {
            if !current.has_group(*gid) {
                return None;
            }
            let mut config = Config {
                num: current.num + 1,
                shards: padded_shards(current),
                groups: current
                    .groups
                    .iter()
                    .filter(|g| g.gid != *gid)
                    .cloned()
                    .collect(),
            };
            let gids: Vec<u64> = config.groups.iter().map(|g| g.gid).collect();
            for shard in config.shards.iter_mut() {
                if *shard == *gid {
                    *shard = gids.first().copied().unwrap_or(GID_NONE);
                }
            }
            rebalance(&mut config.shards, &gids);
            Some(config)
        }
        MasterOp::Move { shard, gid, .. } => {
            let mut config = Config {
                num: current.num + 1,
                shards: padded_shards(current),
                groups: current.groups.clone(),
            };
            if (*shard as usize) < config.shards.len() {
                config.shards[*shard as usize] = *gid;
            }
            Some(config)
        }
    }
}

fn padded_shards(config: &Config) -> Vec<u64> {
    let mut shards = config.shards.clone();
    shards.resize(NUM_SHARDS, GID_NONE);
    shards
}

//////////////////////////////////////////// MasterClerk ///////////////////////////////////////////

/// A client of the shardmaster ensemble.  Calls rotate through the replicas, retrying transient
/// failures a bounded number of rounds.
pub struct MasterClerk {
    clients: Vec<ShardMasterClient>,
    rounds: usize,
}

impl MasterClerk {
    /// A clerk for the provided replicas.
    pub fn new(options: ClientOptions, servers: Vec<String>) -> Self {
        let clients = servers
            .iter()
            .map(|s| ShardMasterClient::new(lazyrpc::new_client(options.clone(), s.clone())))
            .collect();
        Self {
            clients,
            rounds: 10,
        }
    }

    /// Add a replica group.
    pub fn join(&self, gid: u64, servers: Vec<String>) -> Result<(), Error> {
        self.each_replica(|client| {
            client
                .join(
                    &Context::default(),
                    JoinRequest {
                        gid,
                        servers: servers.clone(),
                    },
                )
                .map(|_| ())
        })
    }

    /// Remove a replica group.
    pub fn leave(&self, gid: u64) -> Result<(), Error> {
        self.each_replica(|client| {
            client
                .leave(&Context::default(), LeaveRequest { gid })
                .map(|_| ())
        })
    }

    /// Assign one shard to one group.
    pub fn mv(&self, shard: u64, gid: u64) -> Result<(), Error> {
        self.each_replica(|client| {
            client
                .mv(&Context::default(), MoveRequest { shard, gid })
                .map(|_| ())
        })
    }

    /// Fetch a configuration.  -1 fetches the newest.
    pub fn query(&self, num: i64) -> Result<Config, Error> {
        let mut config = None;
        self.each_replica(|client| {
            config = Some(
                client
                    .query(&Context::default(), QueryRequest { num })?
                    .config,
            );
            Ok(())
        })?;
        Ok(config.unwrap())
    }

    fn each_replica<F: FnMut(&ShardMasterClient) -> Result<(), Error>>(
        &self,
        mut f: F,
    ) -> Result<(), Error> {
        let mut last = Error::ShuttingDown {
            core: ErrorCore::default(),
        };
        for _ in 0..self.rounds {
            for client in self.clients.iter() {
                match f(client) {
                    Ok(()) => {
                        return Ok(());
                    }
                    Err(err) => {
                        clue!(COLLECTOR, INFO, {
                            clerk_retry: err.to_string(),
                        });
                        last = err;
                    }
                }
            }
            std::thread::sleep(Duration::from_millis(100));
        }
        Err(last)
    }
}

/////////////////////////////////////////////// utils //////////////////////////////////////////////

fn storage_error(err: stowage::Error) -> Error {
    Error::StorageError {
        core: ErrorCore::default(),
        what: err.to_string(),
    }
}

fn unix_nanos() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    fn join_op(gid: u64, servers: &[&str]) -> MasterOp {
        MasterOp::Join {
            op_id: OpId::BOTTOM,
            gid,
            servers: servers.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn first_join_takes_every_shard() {
        let config = next_config(&Config::empty(), &join_op(1, &["a", "b", "c"])).unwrap();
        assert_eq!(1, config.num);
        assert_eq!(vec![1u64; NUM_SHARDS], config.shards);
        assert_eq!(Some(&["a".to_string(), "b".to_string(), "c".to_string()][..]),
                   config.servers(1));
    }

    #[test]
    fn second_join_balances_five_five() {
        let first = next_config(&Config::empty(), &join_op(1, &["a"])).unwrap();
        let second = next_config(&first, &join_op(2, &["d"])).unwrap();
        let ones = second.shards.iter().filter(|g| **g == 1).count();
        let twos = second.shards.iter().filter(|g| **g == 2).count();
        assert_eq!(5, ones);
        assert_eq!(5, twos);
    }

    #[test]
    fn duplicate_join_is_a_noop() {
        let first = next_config(&Config::empty(), &join_op(1, &["a"])).unwrap();
        assert!(next_config(&first, &join_op(1, &["a"])).is_none());
    }

    #[test]
    fn leave_returns_shards_to_survivors() {
        let first = next_config(&Config::empty(), &join_op(1, &["a"])).unwrap();
        let second = next_config(&first, &join_op(2, &["d"])).unwrap();
        let third = next_config(
            &second,
            &MasterOp::Leave {
                op_id: OpId::BOTTOM,
                gid: 1,
            },
        )
        .unwrap();
        assert_eq!(vec![2u64; NUM_SHARDS], third.shards);
        assert!(!third.has_group(1));
        // Leaving the last group strands every shard.
        let fourth = next_config(
            &third,
            &MasterOp::Leave {
                op_id: OpId::BOTTOM,
                gid: 2,
            },
        )
        .unwrap();
        assert_eq!(vec![GID_NONE; NUM_SHARDS], fourth.shards);
    }

    #[test]
    fn leave_of_absent_group_is_a_noop() {
        let first = next_config(&Config::empty(), &join_op(1, &["a"])).unwrap();
        assert!(next_config(
            &first,
            &MasterOp::Leave {
                op_id: OpId::BOTTOM,
                gid: 9,
            },
        )
        .is_none());
    }

    #[test]
    fn move_bypasses_rebalance() {
        let first = next_config(&Config::empty(), &join_op(1, &["a"])).unwrap();
        let second = next_config(&first, &join_op(2, &["d"])).unwrap();
        let moved = next_config(
            &second,
            &MasterOp::Move {
                op_id: OpId::BOTTOM,
                shard: 0,
                gid: 2,
            },
        )
        .unwrap();
        assert_eq!(2, moved.owner(0));
        // Everything else is untouched, even if the distribution is now lopsided.
        assert_eq!(&second.shards[1..], &moved.shards[1..]);
    }

    #[test]
    fn rebalance_is_deterministic() {
        // Two replicas applying the same joins must produce identical shard vectors.
        let mut a = Config::empty();
        let mut b = Config::empty();
        for gid in [5u64, 3, 8, 1] {
            a = next_config(&a, &join_op(gid, &["x"])).unwrap();
            b = next_config(&b, &join_op(gid, &["x"])).unwrap();
            assert_eq!(a.shards, b.shards);
        }
        let counts: Vec<usize> = [1u64, 3, 5, 8]
            .iter()
            .map(|gid| a.shards.iter().filter(|g| **g == *gid).count())
            .collect();
        let max = counts.iter().max().unwrap();
        let min = counts.iter().min().unwrap();
        assert!(max - min <= 1);
    }

    #[test]
    fn rebalance_moves_minimally() {
        let mut shards = vec![1, 1, 1, 1, 1, 1, 1, 2, 2, 2];
        rebalance(&mut shards, &[1, 2]);
        let ones = shards.iter().filter(|g| **g == 1).count();
        assert_eq!(5, ones);
        // The donor gives up its lowest-numbered shards first.
        assert_eq!(vec![2, 2, 1, 1, 1, 1, 1, 2, 2, 2], shards);
    }
}
