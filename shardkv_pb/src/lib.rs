#![doc = include_str!("../README.md")]

use one_two_eight::{generate_id, generate_id_prototk};
use prototk_derive::Message;
use rpc_pb::service;
use zerror::{iotoz, Z};
use zerror_core::ErrorCore;

use shardmaster_pb::{Config, NUM_SHARDS};

///////////////////////////////////////////// Constants ////////////////////////////////////////////

/// Recovery-stream tag for one key-value record.
pub const STREAM_KV: u8 = 0x01;
/// Recovery-stream tag for end of stream.  A stream that closes without this tag was truncated
/// and must be resumed.
pub const STREAM_END: u8 = 0x00;

//////////////////////////////////////////////// IDs ///////////////////////////////////////////////

generate_id! {ClerkId, "clerk:"}
generate_id_prototk! {ClerkId}

generate_id! {OpId, "op:"}
generate_id_prototk! {OpId}

/////////////////////////////////////////////// hash ///////////////////////////////////////////////

/// The stable 64-bit FNV-1a hash.  Routing and put-and-hash both depend on this function never
/// changing across platforms or releases.
pub fn fnv1a64(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in bytes {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

/// The shard that owns `key`.
pub fn shard_for_key(key: &str) -> usize {
    (fnv1a64(key.as_bytes()) % NUM_SHARDS as u64) as usize
}

/////////////////////////////////////////////// Error //////////////////////////////////////////////

/// The error type for the shardkv service.
#[derive(Clone, Message, zerror_derive::Z)]
pub enum Error {
    /// The default error type.  Necessary to support protobuf, but should otherwise not be
    /// constructed.
    #[prototk(630784, message)]
    Success {
        /// The error core.
        #[prototk(1, message)]
        core: ErrorCore,
    },
    /// An error was encountered while serializing or deserializing data.
    #[prototk(630785, message)]
    SerializationError {
        /// The error core.
        #[prototk(1, message)]
        core: ErrorCore,
        /// The error that was encountered.
        #[prototk(2, message)]
        err: prototk::Error,
        /// Additional context for what was happening.
        #[prototk(3, string)]
        context: String,
    },
    /// There was an error at the RPC layer.
    #[prototk(630786, message)]
    RpcError {
        /// The error core.
        #[prototk(1, message)]
        core: ErrorCore,
        /// The error that was encountered.
        #[prototk(2, message)]
        what: rpc_pb::Error,
    },
    /// The durable store failed.  This is fatal for the replica.
    #[prototk(630787, message)]
    StorageError {
        /// The error core.
        #[prototk(1, message)]
        core: ErrorCore,
        /// The string representation of the error.
        #[prototk(2, string)]
        what: String,
    },
    /// The replica is shutting down.
    #[prototk(630788, message)]
    ShuttingDown {
        /// The error core.
        #[prototk(1, message)]
        core: ErrorCore,
    },
}

impl Default for Error {
    fn default() -> Self {
        Self::Success {
            core: ErrorCore::default(),
        }
    }
}

impl From<prototk::Error> for Error {
    fn from(err: prototk::Error) -> Self {
        Self::SerializationError {
            core: ErrorCore::default(),
            err,
            context: "prototk unpack error".to_string(),
        }
    }
}

impl From<buffertk::Error> for Error {
    fn from(err: buffertk::Error) -> Self {
        Self::SerializationError {
            core: ErrorCore::default(),
            err: err.into(),
            context: "buffertk unpack error".to_string(),
        }
    }
}

impl From<rpc_pb::Error> for Error {
    fn from(what: rpc_pb::Error) -> Self {
        Self::RpcError {
            core: ErrorCore::default(),
            what,
        }
    }
}

iotoz! {Error}

////////////////////////////////////////////// KvError /////////////////////////////////////////////

/// The client-visible outcome of a get or put.  Transport errors never surface here; clerks retry
/// them away.
#[derive(Clone, Copy, Debug, Default, Eq, Message, PartialEq)]
pub enum KvError {
    /// The operation applied.
    #[prototk(1, message)]
    #[default]
    Ok,
    /// A get found no value for the key.
    #[prototk(2, message)]
    NoKey,
    /// The replica does not own the key's shard in its current configuration.
    #[prototk(3, message)]
    WrongGroup,
}

////////////////////////////////////////////// KvPair //////////////////////////////////////////////

/// One key-value pair of a shard transfer.
#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub struct KvPair {
    /// The user key.
    #[prototk(1, string)]
    pub key: String,
    /// The value.
    #[prototk(2, string)]
    pub value: String,
}

////////////////////////////////////////// ClientResponse //////////////////////////////////////////

/// The last reply recorded for one clerk, transferred so the new owner answers retries the same
/// way the old owner would have.
#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub struct ClientResponse {
    /// The clerk the reply belongs to.
    #[prototk(1, message)]
    pub clerk: ClerkId,
    /// The reply value.
    #[prototk(2, string)]
    pub value: String,
}

//////////////////////////////////////////////// KvOp //////////////////////////////////////////////

/// The op a shardkv replica appends to its group's Paxos log.
#[derive(Clone, Debug, Default, Message)]
pub enum KvOp {
    /// Forces log progress; changes nothing.
    #[prototk(1, message)]
    #[default]
    Nop,
    /// Read a key.
    #[prototk(2, message)]
    Get {
        /// This op's unique id.
        #[prototk(1, message)]
        op_id: OpId,
        /// The clerk issuing the op.
        #[prototk(2, message)]
        clerk: ClerkId,
        /// The key to read.
        #[prototk(3, string)]
        key: String,
    },
    /// Write a key.
    #[prototk(3, message)]
    Put {
        /// This op's unique id.
        #[prototk(1, message)]
        op_id: OpId,
        /// The clerk issuing the op.
        #[prototk(2, message)]
        clerk: ClerkId,
        /// The key to write.
        #[prototk(3, string)]
        key: String,
        /// The value to write.
        #[prototk(4, string)]
        value: String,
    },
    /// Replace a key with the hash of its old value concatenated with the argument, returning the
    /// old value.
    #[prototk(4, message)]
    PutHash {
        /// This op's unique id.
        #[prototk(1, message)]
        op_id: OpId,
        /// The clerk issuing the op.
        #[prototk(2, message)]
        clerk: ClerkId,
        /// The key to write.
        #[prototk(3, string)]
        key: String,
        /// The value to fold into the hash.
        #[prototk(4, string)]
        value: String,
    },
    /// Install a new configuration along with the shard contents pulled from previous owners.
    /// The decided slot of this op is the linearization point of ownership transfer.
    #[prototk(5, message)]
    Reconfigure {
        /// The configuration number being installed.
        #[prototk(1, uint64)]
        config_num: u64,
        /// Key-value pairs pulled from previous owners.
        #[prototk(2, message)]
        store: Vec<KvPair>,
        /// Client responses pulled from previous owners.
        #[prototk(3, message)]
        responses: Vec<ClientResponse>,
        /// Op ids already applied by previous owners.
        #[prototk(4, message)]
        seen: Vec<OpId>,
    },
}

////////////////////////////////////////////// requests ////////////////////////////////////////////

/// Read a key.
#[derive(Clone, Debug, Default, Message)]
pub struct GetRequest {
    /// The key to read.
    #[prototk(1, string)]
    pub key: String,
    /// The clerk issuing the op.
    #[prototk(2, message)]
    pub clerk: ClerkId,
    /// This op's unique id.  Identical ids return identical replies.
    #[prototk(3, message)]
    pub op_id: OpId,
}

/// Write a key, or fold a value into its hash when `do_hash` is set.
#[derive(Clone, Debug, Default, Message)]
pub struct PutRequest {
    /// The key to write.
    #[prototk(1, string)]
    pub key: String,
    /// The value to write or fold.
    #[prototk(2, string)]
    pub value: String,
    /// When true, apply put-and-hash and return the prior value.
    #[prototk(3, Bool)]
    pub do_hash: bool,
    /// The clerk issuing the op.
    #[prototk(4, message)]
    pub clerk: ClerkId,
    /// This op's unique id.  Identical ids return identical replies.
    #[prototk(5, message)]
    pub op_id: OpId,
}

/// The reply to a get or put.
#[derive(Clone, Debug, Default, Message)]
pub struct KvResponse {
    /// The value read, or the prior value for put-and-hash.
    #[prototk(1, string)]
    pub value: String,
    /// The client-visible outcome.
    #[prototk(2, message)]
    pub err: KvError,
}

/// Pull one shard's contents from its previous owner.  `keys_already_have` carries the keys
/// received by earlier chunks so the server streams only the remainder.
#[derive(Clone, Debug, Default, Message)]
pub struct FetchRequest {
    /// The configuration number driving the transfer.
    #[prototk(1, uint64)]
    pub config_num: u64,
    /// The shard being pulled.
    #[prototk(2, uint64)]
    pub shard: u64,
    /// Keys the fetcher already holds.
    #[prototk(3, string)]
    pub keys_already_have: Vec<String>,
    /// The fetcher's identity, for the server's single-peer send discipline.
    #[prototk(4, string)]
    pub sender: String,
}

/// One chunk of a shard transfer.
#[derive(Clone, Debug, Default, Message)]
pub struct FetchResponse {
    /// Key-value pairs in this chunk.
    #[prototk(1, message)]
    pub store: Vec<KvPair>,
    /// All client responses known to the server.
    #[prototk(2, message)]
    pub responses: Vec<ClientResponse>,
    /// All op ids applied by the server.
    #[prototk(3, message)]
    pub seen: Vec<OpId>,
    /// True iff no keys remain beyond this chunk.
    #[prototk(4, Bool)]
    pub complete: bool,
    /// Ok, or WrongGroup when the server cannot serve this transfer yet.
    #[prototk(5, message)]
    pub err: KvError,
}

/// Acknowledge that a shard transfer completed, releasing the server to serve other peers.
#[derive(Clone, Debug, Default, Message)]
pub struct FetchCompleteRequest {
    /// The fetcher's identity.
    #[prototk(1, string)]
    pub sender: String,
}

/// The reply to a FetchComplete.
#[derive(Clone, Debug, Default, Message)]
pub struct FetchCompleteResponse {
    /// True once the server has released its send discipline.
    #[prototk(1, Bool)]
    pub complete: bool,
}

/// Ask a peer to stream its durable state to `address`.  The server opens a TCP connection back
/// to the recoverer and writes the framed record stream.
#[derive(Clone, Debug, Default, Message)]
pub struct RecoverRequest {
    /// host:port the server should stream records to.
    #[prototk(1, string)]
    pub address: String,
    /// The shard to restrict the stream to, or -1 for all state.
    #[prototk(2, int64)]
    pub shard: i64,
    /// True when resuming a truncated stream.
    #[prototk(3, Bool)]
    pub resume: bool,
    /// The last record key received; the server resumes strictly past it in sorted order.
    #[prototk(4, string)]
    pub last_key: String,
}

/// The handshake reply preceding a recovery stream.
#[derive(Clone, Debug, Default, Message)]
pub struct RecoverResponse {
    /// The server's current configuration.
    #[prototk(1, message)]
    pub config: Config,
    /// The server's applied floor.
    #[prototk(2, int64)]
    pub min_seq: i64,
    /// True iff the server cannot serve recovery right now.
    #[prototk(3, Bool)]
    pub err: bool,
}

/// Release the server after a recovery stream finishes or is abandoned.
#[derive(Clone, Debug, Default, Message)]
pub struct RecoverDoneRequest {}

/// The (empty) reply to RecoverDone.
#[derive(Clone, Debug, Default, Message)]
pub struct RecoverDoneResponse {}

///////////////////////////////////////////// the service //////////////////////////////////////////

service! {
    name = ShardKvService;
    server = ShardKvServer;
    client = ShardKvClient;
    error = Error;

    rpc get(GetRequest) -> KvResponse;
    rpc put(PutRequest) -> KvResponse;
    rpc fetch(FetchRequest) -> FetchResponse;
    rpc fetch_complete(FetchCompleteRequest) -> FetchCompleteResponse;
    rpc fetch_recovery(RecoverRequest) -> RecoverResponse;
    rpc recover_done(RecoverDoneRequest) -> RecoverDoneResponse;
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////
