#![doc = include_str!("../README.md")]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arrrg_derive::CommandLine;
use biometrics::{Collector, Counter};
use buffertk::{stack_pack, Unpackable};
use guacamole::Guacamole;
use indicio::{clue, DEBUG, ERROR, TRACING};
use rpc_pb::Context;
use zerror_core::ErrorCore;

use lazyrpc::ClientOptions;
use paxos_pb::{
    AcceptRequest, AcceptResponse, DecidedRequest, DecidedResponse, DoneStamp, Error,
    PaxosClient, PaxosService, PrepareRequest, PrepareResponse,
};
use prototk_derive::Message;
use stowage::{Stowage, StowageOptions};

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static START: Counter = Counter::new("paxos.start");
static PROPOSE_ROUND: Counter = Counter::new("paxos.propose.round");
static PROPOSE_WIN: Counter = Counter::new("paxos.propose.win");
static PROPOSE_LOSE: Counter = Counter::new("paxos.propose.lose");
static PREPARE_SERVED: Counter = Counter::new("paxos.prepare");
static ACCEPT_SERVED: Counter = Counter::new("paxos.accept");
static DECIDED_SERVED: Counter = Counter::new("paxos.decided");
static FORGOTTEN: Counter = Counter::new("paxos.forgotten");
static STORAGE_FATAL: Counter = Counter::new("paxos.storage.fatal");

/// Register the biometrics for this crate.
pub fn register_biometrics(collector: &Collector) {
    collector.register_counter(&START);
    collector.register_counter(&PROPOSE_ROUND);
    collector.register_counter(&PROPOSE_WIN);
    collector.register_counter(&PROPOSE_LOSE);
    collector.register_counter(&PREPARE_SERVED);
    collector.register_counter(&ACCEPT_SERVED);
    collector.register_counter(&DECIDED_SERVED);
    collector.register_counter(&FORGOTTEN);
    collector.register_counter(&STORAGE_FATAL);
}

////////////////////////////////////////////// indicio /////////////////////////////////////////////

pub static COLLECTOR: indicio::Collector = indicio::Collector::new();

///////////////////////////////////////////// Constants ////////////////////////////////////////////

const ACC_PREFIX: &str = "acc:";
const DEC_PREFIX: &str = "dec:";
const DONE_KEY: &[u8] = b"done";
const MAX_KEY: &[u8] = b"max";

fn acc_key(seq: i64) -> Vec<u8> {
    format!("{}{:020}", ACC_PREFIX, seq).into_bytes()
}

fn dec_key(seq: i64) -> Vec<u8> {
    format!("{}{:020}", DEC_PREFIX, seq).into_bytes()
}

fn seq_of_key(key: &[u8], prefix: &str) -> Option<i64> {
    let key = std::str::from_utf8(key).ok()?;
    key.strip_prefix(prefix)?.parse::<i64>().ok()
}

//////////////////////////////////////////// PaxosStatus ///////////////////////////////////////////

/// What a peer knows about one slot.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PaxosStatus {
    /// The slot has decided on this value.
    Decided(Vec<u8>),
    /// The slot has not decided, as far as this peer knows.
    Pending,
    /// The slot is below this peer's garbage-collection floor.
    Forgotten,
}

/////////////////////////////////////////// AcceptorRecord /////////////////////////////////////////

#[derive(Clone, Debug, Default, Message)]
struct AcceptorRecord {
    #[prototk(1, uint64)]
    n_p: u64,
    #[prototk(2, uint64)]
    n_a: u64,
    #[prototk(3, bytes)]
    v_a: Vec<u8>,
}

//////////////////////////////////////////// PaxosOptions //////////////////////////////////////////

/// Options for one Paxos peer.
#[derive(Clone, CommandLine, Debug, Eq, PartialEq)]
pub struct PaxosOptions {
    /// Directory for this peer's durable log state.
    #[arrrg(required, "Directory for this peer's durable log state.")]
    pub data_dir: String,
    /// Cap, in milliseconds, on the randomized proposer backoff.
    #[arrrg(optional, "Cap, in milliseconds, on the randomized proposer backoff.")]
    pub backoff_cap_ms: u64,
    /// Client options for peer-to-peer calls.
    #[arrrg(nested)]
    pub client: ClientOptions,
}

impl Default for PaxosOptions {
    fn default() -> Self {
        Self {
            data_dir: "paxos".to_string(),
            backoff_cap_ms: 1_000,
            client: ClientOptions::default(),
        }
    }
}

////////////////////////////////////////////// Instance ////////////////////////////////////////////

#[derive(Clone, Debug, Default)]
struct Instance {
    n_p: u64,
    n_a: u64,
    v_a: Vec<u8>,
    decided: Option<Vec<u8>>,
}

/////////////////////////////////////////////// State //////////////////////////////////////////////

struct State {
    instances: HashMap<i64, Instance>,
    dones: Vec<i64>,
    max_seen: i64,
    proposing: HashSet<i64>,
    gc_floor: i64,
}

impl State {
    fn min(&self) -> i64 {
        1 + self.dones.iter().copied().min().unwrap_or(-1)
    }
}

/////////////////////////////////////////////// Inner //////////////////////////////////////////////

struct Inner {
    me: usize,
    clients: Vec<Option<PaxosClient>>,
    stowage: Stowage,
    state: Mutex<State>,
    backoff_cap_ms: u64,
    dead: AtomicBool,
}

/////////////////////////////////////////////// Paxos //////////////////////////////////////////////

/// One peer of a multi-decree Paxos ensemble.  Clone handles freely; they share the peer.
#[derive(Clone)]
pub struct Paxos {
    inner: Arc<Inner>,
}

impl Paxos {
    /// Create a peer.  `peers[me]` is this peer; calls to it bypass the transport.  Durable state
    /// under `options.data_dir` is reloaded, so a restarted peer resumes where it stopped.
    pub fn new(options: PaxosOptions, peers: Vec<String>, me: usize) -> Result<Self, Error> {
        assert!(me < peers.len());
        let stowage =
            Stowage::open(StowageOptions::new(&options.data_dir)).map_err(storage_error)?;
        let mut instances: HashMap<i64, Instance> = HashMap::new();
        for (key, value) in stowage.prefix_scan(ACC_PREFIX.as_bytes()) {
            let Some(seq) = seq_of_key(&key, ACC_PREFIX) else {
                continue;
            };
            let record = AcceptorRecord::unpack(&value)?.0;
            let inst = instances.entry(seq).or_default();
            inst.n_p = record.n_p;
            inst.n_a = record.n_a;
            inst.v_a = record.v_a;
        }
        for (key, value) in stowage.prefix_scan(DEC_PREFIX.as_bytes()) {
            let Some(seq) = seq_of_key(&key, DEC_PREFIX) else {
                continue;
            };
            instances.entry(seq).or_default().decided = Some(value);
        }
        let mut dones = vec![-1i64; peers.len()];
        if let Some(done) = stowage.get(DONE_KEY).map_err(storage_error)? {
            dones[me] = <i64 as Unpackable>::unpack(&done)?.0;
        }
        let mut max_seen = -1i64;
        if let Some(max) = stowage.get(MAX_KEY).map_err(storage_error)? {
            max_seen = <i64 as Unpackable>::unpack(&max)?.0;
        }
        let mut clients = Vec::with_capacity(peers.len());
        for (index, peer) in peers.iter().enumerate() {
            if index == me {
                clients.push(None);
            } else {
                clients.push(Some(PaxosClient::new(lazyrpc::new_client(
                    options.client.clone(),
                    peer.clone(),
                ))));
            }
        }
        Ok(Self {
            inner: Arc::new(Inner {
                me,
                clients,
                stowage,
                state: Mutex::new(State {
                    instances,
                    dones,
                    max_seen,
                    proposing: HashSet::new(),
                    gc_floor: 0,
                }),
                backoff_cap_ms: options.backoff_cap_ms,
                dead: AtomicBool::new(false),
            }),
        })
    }

    /// Propose `value` at `seq`.  Non-blocking and idempotent: a decided or forgotten slot, or one
    /// this peer is already proposing, is left alone.  The synod rules guarantee that if `seq`
    /// already decided elsewhere, that decision is what spreads.
    pub fn start(&self, seq: i64, value: Vec<u8>) {
        START.click();
        if self.inner.dead.load(Ordering::Relaxed) {
            return;
        }
        {
            let mut state = self.inner.state.lock().unwrap();
            if seq < state.min() {
                return;
            }
            if let Some(inst) = state.instances.get(&seq) {
                if inst.decided.is_some() {
                    return;
                }
            }
            if !state.proposing.insert(seq) {
                return;
            }
            if seq > state.max_seen {
                state.max_seen = seq;
                self.inner.persist_max(seq);
            }
        }
        let inner = Arc::clone(&self.inner);
        std::thread::spawn(move || {
            inner.propose(seq, value);
            inner.state.lock().unwrap().proposing.remove(&seq);
        });
    }

    /// What this peer knows about `seq`.
    pub fn status(&self, seq: i64) -> PaxosStatus {
        let state = self.inner.state.lock().unwrap();
        if seq < state.min() {
            return PaxosStatus::Forgotten;
        }
        match state.instances.get(&seq).and_then(|i| i.decided.clone()) {
            Some(value) => PaxosStatus::Decided(value),
            None => PaxosStatus::Pending,
        }
    }

    /// Declare that this peer no longer needs slots at or below `seq`.  Monotonic.
    pub fn done(&self, seq: i64) {
        let mut state = self.inner.state.lock().unwrap();
        if seq > state.dones[self.inner.me] {
            state.dones[self.inner.me] = seq;
            self.inner.persist_done(seq);
            self.inner.collect_garbage(&mut state);
        }
    }

    /// One above the lowest done floor across all peers, as known here.  Slots below this are
    /// garbage-collected.
    pub fn min(&self) -> i64 {
        self.inner.state.lock().unwrap().min()
    }

    /// The highest slot this peer has seen proposed or learned.
    pub fn max(&self) -> i64 {
        self.inner.state.lock().unwrap().max_seen
    }

    /// Stop proposing and serving.  In-flight work observes the flag and unwinds.
    pub fn kill(&self) {
        self.inner.dead.store(true, Ordering::Relaxed);
    }
}

/////////////////////////////////////////////// Inner //////////////////////////////////////////////

impl Inner {
    fn my_stamp(&self, state: &State) -> DoneStamp {
        DoneStamp {
            peer: self.me as u64,
            done: state.dones[self.me],
        }
    }

    fn note_done(&self, state: &mut State, stamp: DoneStamp) {
        let peer = stamp.peer as usize;
        if peer < state.dones.len() && stamp.done > state.dones[peer] {
            state.dones[peer] = stamp.done;
            self.collect_garbage(state);
        }
    }

    // Drop memory and durable records for slots below the cluster-wide floor.
    fn collect_garbage(&self, state: &mut State) {
        let min = state.min();
        if min <= state.gc_floor {
            return;
        }
        state.gc_floor = min;
        let before = state.instances.len();
        state.instances.retain(|seq, _| *seq >= min);
        if state.instances.len() != before {
            FORGOTTEN.click();
        }
        for (key, _) in self.stowage.prefix_scan(ACC_PREFIX.as_bytes()) {
            if seq_of_key(&key, ACC_PREFIX).map_or(false, |seq| seq < min) {
                self.try_storage(self.stowage.del(&key));
            }
        }
        for (key, _) in self.stowage.prefix_scan(DEC_PREFIX.as_bytes()) {
            if seq_of_key(&key, DEC_PREFIX).map_or(false, |seq| seq < min) {
                self.try_storage(self.stowage.del(&key));
            }
        }
    }

    fn note_max(&self, state: &mut State, seq: i64) {
        if seq > state.max_seen {
            state.max_seen = seq;
            self.persist_max(seq);
        }
    }

    fn persist_done(&self, done: i64) {
        self.try_storage(self.stowage.put(DONE_KEY, &stack_pack(done).to_vec()));
    }

    fn persist_max(&self, max: i64) {
        self.try_storage(self.stowage.put(MAX_KEY, &stack_pack(max).to_vec()));
    }

    fn persist_acceptor(&self, seq: i64, inst: &Instance) {
        let record = AcceptorRecord {
            n_p: inst.n_p,
            n_a: inst.n_a,
            v_a: inst.v_a.clone(),
        };
        self.try_storage(self.stowage.put(&acc_key(seq), &stack_pack(record).to_vec()));
    }

    // A storage failure is fatal: mark the peer dead so it stops making promises it cannot keep.
    fn try_storage(&self, result: Result<(), stowage::Error>) {
        if let Err(err) = result {
            STORAGE_FATAL.click();
            clue!(COLLECTOR, ERROR, {
                storage_fatal: err.to_string(),
            });
            self.dead.store(true, Ordering::Relaxed);
        }
    }

    // The next proposal number for this peer above `above`.
    fn next_number(&self, above: u64) -> u64 {
        let n = self.clients.len() as u64;
        (above / n + 1) * n + self.me as u64
    }

    fn propose(&self, seq: i64, value: Vec<u8>) {
        let mut backoff_ms = 10u64;
        let mut guac = Guacamole::new((seq as u64) << 16 | self.me as u64);
        let mut n = 0u64;
        while !self.dead.load(Ordering::Relaxed) {
            PROPOSE_ROUND.click();
            {
                let state = self.state.lock().unwrap();
                if seq < state.min() {
                    return;
                }
                if let Some(inst) = state.instances.get(&seq) {
                    if inst.decided.is_some() {
                        return;
                    }
                    n = std::cmp::max(n, inst.n_p);
                }
            }
            n = self.next_number(n);
            if let Some(chosen) = self.phase1(seq, n, &value) {
                if self.phase2(seq, n, &chosen) {
                    PROPOSE_WIN.click();
                    clue!(COLLECTOR, DEBUG, {
                        decided: {
                            seq: seq,
                            n: n,
                        },
                    });
                    self.broadcast_decision(seq, chosen);
                    return;
                }
            }
            PROPOSE_LOSE.click();
            let mut jitter = [0u8; 8];
            guac.generate(&mut jitter);
            let sleep_ms = u64::from_le_bytes(jitter) % std::cmp::max(backoff_ms, 1);
            std::thread::sleep(Duration::from_millis(sleep_ms));
            backoff_ms = std::cmp::min(backoff_ms * 2, self.backoff_cap_ms);
        }
    }

    // Returns the value to push in phase 2, or None if the ballot failed to rally a majority.
    fn phase1(&self, seq: i64, n: u64, value: &[u8]) -> Option<Vec<u8>> {
        let mut promises = 0usize;
        let mut n_a_max = 0u64;
        let mut chosen = value.to_vec();
        for peer in 0..self.clients.len() {
            let resp = if peer == self.me {
                Ok(self.prepare_local(seq, n))
            } else {
                let stamp = self.my_stamp(&self.state.lock().unwrap());
                let req = PrepareRequest {
                    seq,
                    n,
                    done: stamp,
                };
                self.clients[peer]
                    .as_ref()
                    .unwrap()
                    .prepare(&Context::default(), req)
            };
            match resp {
                Ok(resp) => {
                    let mut state = self.state.lock().unwrap();
                    self.note_done(&mut state, resp.done);
                    drop(state);
                    if resp.ok {
                        promises += 1;
                        if resp.n_a > n_a_max {
                            n_a_max = resp.n_a;
                            chosen = resp.v_a;
                        }
                    }
                }
                Err(_) => {
                    // Transient transport errors mean the peer does not count toward the
                    // majority this round.
                }
            }
        }
        if 2 * promises > self.clients.len() {
            Some(chosen)
        } else {
            None
        }
    }

    fn phase2(&self, seq: i64, n: u64, value: &[u8]) -> bool {
        let mut accepts = 0usize;
        for peer in 0..self.clients.len() {
            let ok = if peer == self.me {
                self.accept_local(seq, n, value.to_vec()).ok
            } else {
                let stamp = self.my_stamp(&self.state.lock().unwrap());
                let req = AcceptRequest {
                    seq,
                    n,
                    value: value.to_vec(),
                    done: stamp,
                };
                match self.clients[peer]
                    .as_ref()
                    .unwrap()
                    .accept(&Context::default(), req)
                {
                    Ok(resp) => {
                        let mut state = self.state.lock().unwrap();
                        self.note_done(&mut state, resp.done);
                        drop(state);
                        resp.ok
                    }
                    Err(_) => false,
                }
            };
            if ok {
                accepts += 1;
            }
        }
        2 * accepts > self.clients.len()
    }

    fn broadcast_decision(&self, seq: i64, value: Vec<u8>) {
        self.decided_local(seq, value.clone());
        for peer in 0..self.clients.len() {
            if peer == self.me {
                continue;
            }
            let stamp = self.my_stamp(&self.state.lock().unwrap());
            let req = DecidedRequest {
                seq,
                value: value.clone(),
                done: stamp,
            };
            if let Ok(resp) = self.clients[peer]
                .as_ref()
                .unwrap()
                .decided(&Context::default(), req)
            {
                let mut state = self.state.lock().unwrap();
                self.note_done(&mut state, resp.done);
            }
            // A peer that misses this learns the decision when it next proposes into the slot.
        }
    }

    fn prepare_local(&self, seq: i64, n: u64) -> PrepareResponse {
        PREPARE_SERVED.click();
        let mut state = self.state.lock().unwrap();
        self.note_max(&mut state, seq);
        let min = state.min();
        let stamp = self.my_stamp(&state);
        if seq < min {
            return PrepareResponse {
                ok: false,
                n_a: 0,
                v_a: Vec::new(),
                done: stamp,
            };
        }
        let inst = state.instances.entry(seq).or_default();
        if n > inst.n_p {
            inst.n_p = n;
            let resp = PrepareResponse {
                ok: true,
                n_a: inst.n_a,
                v_a: inst.v_a.clone(),
                done: stamp,
            };
            let inst = inst.clone();
            self.persist_acceptor(seq, &inst);
            resp
        } else {
            PrepareResponse {
                ok: false,
                n_a: 0,
                v_a: Vec::new(),
                done: stamp,
            }
        }
    }

    fn accept_local(&self, seq: i64, n: u64, value: Vec<u8>) -> AcceptResponse {
        ACCEPT_SERVED.click();
        let mut state = self.state.lock().unwrap();
        self.note_max(&mut state, seq);
        let min = state.min();
        let stamp = self.my_stamp(&state);
        if seq < min {
            return AcceptResponse {
                ok: false,
                done: stamp,
            };
        }
        let inst = state.instances.entry(seq).or_default();
        if n >= inst.n_p {
            inst.n_p = n;
            inst.n_a = n;
            inst.v_a = value;
            let inst = inst.clone();
            self.persist_acceptor(seq, &inst);
            AcceptResponse {
                ok: true,
                done: stamp,
            }
        } else {
            AcceptResponse {
                ok: false,
                done: stamp,
            }
        }
    }

    fn decided_local(&self, seq: i64, value: Vec<u8>) -> DecidedResponse {
        DECIDED_SERVED.click();
        let mut state = self.state.lock().unwrap();
        self.note_max(&mut state, seq);
        let stamp = self.my_stamp(&state);
        if seq >= state.min() {
            let inst = state.instances.entry(seq).or_default();
            if inst.decided.is_none() {
                inst.decided = Some(value.clone());
                self.try_storage(self.stowage.put(&dec_key(seq), &value));
                clue!(COLLECTOR, TRACING, {
                    learned: {
                        seq: seq,
                    },
                });
            }
        }
        DecidedResponse { done: stamp }
    }
}

////////////////////////////////////////////// service /////////////////////////////////////////////

impl PaxosService for Paxos {
    fn prepare(&self, _: &Context, req: PrepareRequest) -> Result<PrepareResponse, Error> {
        if self.inner.dead.load(Ordering::Relaxed) {
            return Err(Error::LogicError {
                core: ErrorCore::default(),
                what: "peer is shut down".to_string(),
            });
        }
        {
            let mut state = self.inner.state.lock().unwrap();
            self.inner.note_done(&mut state, req.done);
        }
        Ok(self.inner.prepare_local(req.seq, req.n))
    }

    fn accept(&self, _: &Context, req: AcceptRequest) -> Result<AcceptResponse, Error> {
        if self.inner.dead.load(Ordering::Relaxed) {
            return Err(Error::LogicError {
                core: ErrorCore::default(),
                what: "peer is shut down".to_string(),
            });
        }
        {
            let mut state = self.inner.state.lock().unwrap();
            self.inner.note_done(&mut state, req.done);
        }
        Ok(self.inner.accept_local(req.seq, req.n, req.value))
    }

    fn decided(&self, _: &Context, req: DecidedRequest) -> Result<DecidedResponse, Error> {
        if self.inner.dead.load(Ordering::Relaxed) {
            return Err(Error::LogicError {
                core: ErrorCore::default(),
                what: "peer is shut down".to_string(),
            });
        }
        {
            let mut state = self.inner.state.lock().unwrap();
            self.inner.note_done(&mut state, req.done);
        }
        Ok(self.inner.decided_local(req.seq, req.value))
    }
}

/////////////////////////////////////////////// utils //////////////////////////////////////////////

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
    fn proposal_numbers_unique_and_monotone() {
        // Five peers: numbers are round * 5 + me, so they are unique per peer and totally ordered.
        let inner_me = |me: usize| Inner {
            me,
            clients: (0..5).map(|_| None).collect(),
            stowage: Stowage::open(StowageOptions::new(
                std::env::temp_dir().join(format!(
                    "paxos-numbers-{}-{}",
                    me,
                    std::process::id()
                )),
            ))
            .unwrap(),
            state: Mutex::new(State {
                instances: HashMap::new(),
                dones: vec![-1; 5],
                max_seen: -1,
                proposing: HashSet::new(),
                gc_floor: 0,
            }),
            backoff_cap_ms: 1_000,
            dead: AtomicBool::new(false),
        };
        let a = inner_me(0);
        let b = inner_me(3);
        let n1 = a.next_number(0);
        let n2 = a.next_number(n1);
        let n3 = b.next_number(n2);
        assert!(n1 > 0);
        assert!(n2 > n1);
        assert!(n3 > n2);
        assert_eq!(0, n1 % 5);
        assert_eq!(0, n2 % 5);
        assert_eq!(3, n3 % 5);
    }

    #[test]
    fn keys_sort_numerically() {
        assert!(acc_key(9) < acc_key(10));
        assert!(acc_key(99) < acc_key(100));
        assert_eq!(Some(42), seq_of_key(&acc_key(42), ACC_PREFIX));
        assert_eq!(Some(7), seq_of_key(&dec_key(7), DEC_PREFIX));
        assert_eq!(None, seq_of_key(b"done", ACC_PREFIX));
    }
}
