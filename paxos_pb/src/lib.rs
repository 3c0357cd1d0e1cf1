#![doc = include_str!("../README.md")]

use prototk_derive::Message;
use rpc_pb::service;
use zerror::{iotoz, Z};
use zerror_core::ErrorCore;

/////////////////////////////////////////////// Error //////////////////////////////////////////////

/// The error type for the Paxos log.
#[derive(Clone, Message, zerror_derive::Z)]
pub enum Error {
    /// The default error type.  Necessary to support protobuf, but should otherwise not be
    /// constructed.
    #[prototk(614400, message)]
    Success {
        /// The error core.
        #[prototk(1, message)]
        core: ErrorCore,
    },
    /// An error was encountered while serializing or deserializing data.
    #[prototk(614401, message)]
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
    #[prototk(614402, message)]
    RpcError {
        /// The error core.
        #[prototk(1, message)]
        core: ErrorCore,
        /// The error that was encountered.
        #[prototk(2, message)]
        what: rpc_pb::Error,
    },
    /// The durable store failed.  This is fatal for the peer.
    #[prototk(614403, message)]
    StorageError {
        /// The error core.
        #[prototk(1, message)]
        core: ErrorCore,
        /// The string representation of the error.
        #[prototk(2, string)]
        what: String,
    },
    /// A logic error in the Paxos implementation.
    #[prototk(614404, message)]
    LogicError {
        /// The error core.
        #[prototk(1, message)]
        core: ErrorCore,
        /// A hint as to what went wrong.
        #[prototk(2, string)]
        what: String,
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

//////////////////////////////////////////// DoneStamp /////////////////////////////////////////////

/// A DoneStamp piggybacks one peer's garbage-collection floor on a Paxos message.  Every request
/// carries the sender's stamp and every response the receiver's, so the cluster-wide floor
/// propagates without dedicated traffic.
#[derive(Clone, Copy, Debug, Default, Eq, Message, PartialEq)]
pub struct DoneStamp {
    /// The index of the peer this stamp describes.
    #[prototk(1, uint64)]
    pub peer: u64,
    /// The highest slot the peer no longer needs.  -1 when the peer needs everything.
    #[prototk(2, int64)]
    pub done: i64,
}

////////////////////////////////////////// PrepareRequest //////////////////////////////////////////

/// Phase 1a: rally support for proposal number `n` at `seq`.
#[derive(Clone, Debug, Default, Message)]
pub struct PrepareRequest {
    /// The slot being proposed for.
    #[prototk(1, int64)]
    pub seq: i64,
    /// The proposal number.
    #[prototk(2, uint64)]
    pub n: u64,
    /// The sender's garbage-collection stamp.
    #[prototk(3, message)]
    pub done: DoneStamp,
}

///////////////////////////////////////// PrepareResponse //////////////////////////////////////////

/// Phase 1b: whether the acceptor promised, and what it last accepted.
#[derive(Clone, Debug, Default, Message)]
pub struct PrepareResponse {
    /// True iff the acceptor promised `n`.
    #[prototk(1, Bool)]
    pub ok: bool,
    /// The highest proposal number the acceptor has accepted, 0 for none.
    #[prototk(2, uint64)]
    pub n_a: u64,
    /// The value accepted under `n_a`.  Meaningless when `n_a` is 0.
    #[prototk(3, bytes)]
    pub v_a: Vec<u8>,
    /// The receiver's garbage-collection stamp.
    #[prototk(4, message)]
    pub done: DoneStamp,
}

/////////////////////////////////////////// AcceptRequest //////////////////////////////////////////

/// Phase 2a: ask the acceptor to accept `value` under `n` at `seq`.
#[derive(Clone, Debug, Default, Message)]
pub struct AcceptRequest {
    /// The slot being proposed for.
    #[prototk(1, int64)]
    pub seq: i64,
    /// The proposal number.
    #[prototk(2, uint64)]
    pub n: u64,
    /// The value to accept.
    #[prototk(3, bytes)]
    pub value: Vec<u8>,
    /// The sender's garbage-collection stamp.
    #[prototk(4, message)]
    pub done: DoneStamp,
}

/////////////////////////////////////////// AcceptResponse /////////////////////////////////////////

/// Phase 2b: whether the acceptor accepted.
#[derive(Clone, Debug, Default, Message)]
pub struct AcceptResponse {
    /// True iff the acceptor accepted `n`.
    #[prototk(1, Bool)]
    pub ok: bool,
    /// The receiver's garbage-collection stamp.
    #[prototk(2, message)]
    pub done: DoneStamp,
}

/////////////////////////////////////////// DecidedRequest /////////////////////////////////////////

/// Teach a learner that `seq` decided on `value`.
#[derive(Clone, Debug, Default, Message)]
pub struct DecidedRequest {
    /// The slot that decided.
    #[prototk(1, int64)]
    pub seq: i64,
    /// The decided value.
    #[prototk(2, bytes)]
    pub value: Vec<u8>,
    /// The sender's garbage-collection stamp.
    #[prototk(3, message)]
    pub done: DoneStamp,
}

////////////////////////////////////////// DecidedResponse /////////////////////////////////////////

/// Acknowledge a decided value.
#[derive(Clone, Debug, Default, Message)]
pub struct DecidedResponse {
    /// The receiver's garbage-collection stamp.
    #[prototk(1, message)]
    pub done: DoneStamp,
}

///////////////////////////////////////////// Acceptor /////////////////////////////////////////////

// The acceptor service is the mutable memory of the log.  Proposers and learners drive it; it
// never initiates.
service! {
    name = PaxosService;
    server = PaxosServer;
    client = PaxosClient;
    error = Error;

    rpc prepare(PrepareRequest) -> PrepareResponse;
    rpc accept(AcceptRequest) -> AcceptResponse;
    rpc decided(DecidedRequest) -> DecidedResponse;
}
