#![doc = include_str!("../README.md")]

use one_two_eight::{generate_id, generate_id_prototk};
use prototk_derive::Message;
use rpc_pb::service;
use zerror::{iotoz, Z};
use zerror_core::ErrorCore;

///////////////////////////////////////////// Constants ////////////////////////////////////////////

/// The number of shards the key space is partitioned into.  Fixed for the lifetime of a cluster.
pub const NUM_SHARDS: usize = 10;

/// The group id that marks a shard as unassigned.
pub const GID_NONE: u64 = 0;

//////////////////////////////////////////////// IDs ///////////////////////////////////////////////

generate_id! {OpId, "op:"}
generate_id_prototk! {OpId}

/////////////////////////////////////////////// Error //////////////////////////////////////////////

/// The error type for the shardmaster.
#[derive(Clone, Message, zerror_derive::Z)]
pub enum Error {
    /// The default error type.  Necessary to support protobuf, but should otherwise not be
    /// constructed.
    #[prototk(622592, message)]
    Success {
        /// The error core.
        #[prototk(1, message)]
        core: ErrorCore,
    },
    /// An error was encountered while serializing or deserializing data.
    #[prototk(622593, message)]
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
    #[prototk(622594, message)]
    RpcError {
        /// The error core.
        #[prototk(1, message)]
        core: ErrorCore,
        /// The error that was encountered.
        #[prototk(2, message)]
        what: rpc_pb::Error,
    },
    /// The durable store failed.  This is fatal for the replica.
    #[prototk(622595, message)]
    StorageError {
        /// The error core.
        #[prototk(1, message)]
        core: ErrorCore,
        /// The string representation of the error.
        #[prototk(2, string)]
        what: String,
    },
    /// The replica is shutting down.
    #[prototk(622596, message)]
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

/////////////////////////////////////////////// Group //////////////////////////////////////////////

/// One replica group: a non-zero group id and the ordered servers that form it.
#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub struct Group {
    /// The group id.
    #[prototk(1, uint64)]
    pub gid: u64,
    /// host:port connection strings for the group's replicas, in a fixed order.
    #[prototk(2, string)]
    pub servers: Vec<String>,
}

////////////////////////////////////////////// Config //////////////////////////////////////////////

/// A Config is a snapshot of the shard-to-group assignment, identified by a monotonic number.
/// Configs are immutable once produced; config 0 is the empty config with nothing assigned.
#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub struct Config {
    /// The configuration number.
    #[prototk(1, uint64)]
    pub num: u64,
    /// Shard index to group id, NUM_SHARDS entries.  GID_NONE marks unassigned.
    #[prototk(2, uint64)]
    pub shards: Vec<u64>,
    /// The replica groups, ordered by gid so the encoding is canonical.
    #[prototk(3, message)]
    pub groups: Vec<Group>,
}

impl Config {
    /// The empty configuration: number 0, every shard unassigned, no groups.
    pub fn empty() -> Self {
        Self {
            num: 0,
            shards: vec![GID_NONE; NUM_SHARDS],
            groups: Vec::new(),
        }
    }

    /// The group that owns `shard`, or GID_NONE.
    pub fn owner(&self, shard: usize) -> u64 {
        self.shards.get(shard).copied().unwrap_or(GID_NONE)
    }

    /// Whether `gid` appears in this configuration.
    pub fn has_group(&self, gid: u64) -> bool {
        self.groups.iter().any(|g| g.gid == gid)
    }

    /// The servers for `gid`, if the group is present.
    pub fn servers(&self, gid: u64) -> Option<&[String]> {
        self.groups
            .iter()
            .find(|g| g.gid == gid)
            .map(|g| g.servers.as_slice())
    }
}

///////////////////////////////////////////// MasterOp /////////////////////////////////////////////

/// The op the shardmaster appends to its Paxos log.  Paxos treats it as opaque bytes; every
/// replica decodes and applies it in slot order.
#[derive(Clone, Debug, Default, Message)]
pub enum MasterOp {
    /// Forces log progress; changes nothing.
    #[prototk(1, message)]
    #[default]
    Nop,
    /// Add a replica group.  Joining a gid that is already present applies as a no-op.
    #[prototk(2, message)]
    Join {
        /// This op's unique id.
        #[prototk(1, message)]
        op_id: OpId,
        /// The group to add.
        #[prototk(2, uint64)]
        gid: u64,
        /// The group's servers.
        #[prototk(3, string)]
        servers: Vec<String>,
    },
    /// Remove a replica group.  Leaving an absent gid applies as a no-op.
    #[prototk(3, message)]
    Leave {
        /// This op's unique id.
        #[prototk(1, message)]
        op_id: OpId,
        /// The group to remove.
        #[prototk(2, uint64)]
        gid: u64,
    },
    /// Assign one shard to one group, bypassing rebalancing.
    #[prototk(4, message)]
    Move {
        /// This op's unique id.
        #[prototk(1, message)]
        op_id: OpId,
        /// The shard to move.
        #[prototk(2, uint64)]
        shard: u64,
        /// The group that receives it.
        #[prototk(3, uint64)]
        gid: u64,
    },
    /// A linearized read of the config list.
    #[prototk(5, message)]
    Query {
        /// This op's unique id.
        #[prototk(1, message)]
        op_id: OpId,
    },
}

impl MasterOp {
    /// This op's id.  Nop has no identity and returns the bottom id.
    pub fn op_id(&self) -> OpId {
        match self {
            MasterOp::Nop => OpId::BOTTOM,
            MasterOp::Join { op_id, .. } => *op_id,
            MasterOp::Leave { op_id, .. } => *op_id,
            MasterOp::Move { op_id, .. } => *op_id,
            MasterOp::Query { op_id, .. } => *op_id,
        }
    }
}

////////////////////////////////////////////// requests ////////////////////////////////////////////

/// Add a replica group.
#[derive(Clone, Debug, Default, Message)]
pub struct JoinRequest {
    /// The group to add.
    #[prototk(1, uint64)]
    pub gid: u64,
    /// The group's servers.
    #[prototk(2, string)]
    pub servers: Vec<String>,
}

/// The (empty) response to a Join.
#[derive(Clone, Debug, Default, Message)]
pub struct JoinResponse {}

/// Remove a replica group.
#[derive(Clone, Debug, Default, Message)]
pub struct LeaveRequest {
    /// The group to remove.
    #[prototk(1, uint64)]
    pub gid: u64,
}

/// The (empty) response to a Leave.
#[derive(Clone, Debug, Default, Message)]
pub struct LeaveResponse {}

/// Assign one shard to one group.
#[derive(Clone, Debug, Default, Message)]
pub struct MoveRequest {
    /// The shard to move.
    #[prototk(1, uint64)]
    pub shard: u64,
    /// The group that receives it.
    #[prototk(2, uint64)]
    pub gid: u64,
}

/// The (empty) response to a Move.
#[derive(Clone, Debug, Default, Message)]
pub struct MoveResponse {}

/// Fetch a configuration by number.  -1, or any number at or past the newest, fetches the newest.
#[derive(Clone, Debug, Default, Message)]
pub struct QueryRequest {
    /// The configuration number sought.
    #[prototk(1, int64)]
    pub num: i64,
}

/// The configuration a Query resolved to.
#[derive(Clone, Debug, Default, Message)]
pub struct QueryResponse {
    /// The configuration.
    #[prototk(1, message)]
    pub config: Config,
}

///////////////////////////////////////////// the service //////////////////////////////////////////

service! {
    name = ShardMasterService;
    server = ShardMasterServer;
    client = ShardMasterClient;
    error = Error;

    rpc join(JoinRequest) -> JoinResponse;
    rpc leave(LeaveRequest) -> LeaveResponse;
    rpc mv(MoveRequest) -> MoveResponse;
    rpc query(QueryRequest) -> QueryResponse;
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////
