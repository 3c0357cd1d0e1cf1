#![doc = include_str!("../README.md")]

use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arrrg_derive::CommandLine;
use biometrics::{Collector, Counter};
use buffertk::{stack_pack, v64, Packable, Unpackable};
use indicio::{clue, INFO, WARNING};
use rpc_pb::{Context, Error, Frame, Request, Response, Status};
use zerror_core::ErrorCore;

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static DIAL: Counter = Counter::new("lazyrpc.client.dial");
static DIAL_ERROR: Counter = Counter::new("lazyrpc.client.dial.error");
static CALL: Counter = Counter::new("lazyrpc.client.call");
static CALL_ERROR: Counter = Counter::new("lazyrpc.client.call.error");
static ACCEPT: Counter = Counter::new("lazyrpc.server.accept");
static ACCEPT_ERROR: Counter = Counter::new("lazyrpc.server.accept.error");
static HANDLE_RPC: Counter = Counter::new("lazyrpc.server.handle_rpc");
static UNKNOWN_SERVER_NAME: Counter = Counter::new("lazyrpc.server.unknown_server");
static CONNECTION_ERROR: Counter = Counter::new("lazyrpc.server.connection.error");

/// Register the biometrics for this crate.
pub fn register_biometrics(collector: &Collector) {
    collector.register_counter(&DIAL);
    collector.register_counter(&DIAL_ERROR);
    collector.register_counter(&CALL);
    collector.register_counter(&CALL_ERROR);
    collector.register_counter(&ACCEPT);
    collector.register_counter(&ACCEPT_ERROR);
    collector.register_counter(&HANDLE_RPC);
    collector.register_counter(&UNKNOWN_SERVER_NAME);
    collector.register_counter(&CONNECTION_ERROR);
}

////////////////////////////////////////////// indicio /////////////////////////////////////////////

pub static COLLECTOR: indicio::Collector = indicio::Collector::new();

///////////////////////////////////////////// Constants ////////////////////////////////////////////

/// The largest message this transport will frame or accept.  Shard transfers move whole shards,
/// so this is far looser than the rpc_pb request limit.
pub const MAX_FRAME_BYTES: u64 = 1u64 << 30;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/////////////////////////////////////////////// wire ///////////////////////////////////////////////

fn transport_failure(what: &str) -> Error {
    Error::TransportFailure {
        core: ErrorCore::default(),
        what: what.to_string(),
    }
}

fn send_msg(stream: &mut TcpStream, msg: &[u8]) -> Result<(), Error> {
    if msg.len() as u64 > MAX_FRAME_BYTES {
        return Err(Error::RequestTooLarge {
            core: ErrorCore::default(),
            size: msg.len() as u64,
        });
    }
    let frame = Frame::from_buffer(msg);
    let frame_sz: v64 = frame.pack_sz().into();
    let mut buf = stack_pack(frame_sz).pack(frame).to_vec();
    buf.extend_from_slice(msg);
    stream.write_all(&buf)?;
    Ok(())
}

// Fill buf, retrying timeouts while `dead` says to keep serving.  Returns 0 iff the peer closed
// the connection before the first byte.
fn read_full(
    stream: &mut TcpStream,
    buf: &mut [u8],
    dead: Option<&AtomicBool>,
) -> Result<usize, Error> {
    let mut amt = 0;
    while amt < buf.len() {
        if let Some(dead) = dead {
            if dead.load(Ordering::Relaxed) {
                return Err(transport_failure("server shutdown"));
            }
        }
        match stream.read(&mut buf[amt..]) {
            Ok(0) => {
                if amt == 0 {
                    return Ok(0);
                }
                return Err(transport_failure("socket closed"));
            }
            Ok(sz) => {
                amt += sz;
            }
            Err(err)
                if dead.is_some()
                    && (err.kind() == ErrorKind::WouldBlock
                        || err.kind() == ErrorKind::TimedOut) =>
            {
                continue;
            }
            Err(err) if err.kind() == ErrorKind::Interrupted => {
                continue;
            }
            Err(err) => {
                return Err(err.into());
            }
        }
    }
    Ok(amt)
}

// Receive one framed message.  Ok(None) means the peer closed cleanly between messages.
fn recv_msg(stream: &mut TcpStream, dead: Option<&AtomicBool>) -> Result<Option<Vec<u8>>, Error> {
    let mut header_sz: u64 = 0;
    let mut shift = 0u32;
    let mut first = true;
    loop {
        let mut byte = [0u8; 1];
        if read_full(stream, &mut byte, dead)? == 0 {
            if first {
                return Ok(None);
            }
            return Err(transport_failure("socket closed"));
        }
        first = false;
        header_sz |= ((byte[0] & 0x7f) as u64) << shift;
        shift += 7;
        if byte[0] & 0x80 == 0 {
            break;
        }
        if shift >= 64 {
            return Err(transport_failure("invalid frame varint"));
        }
    }
    if header_sz > 64 {
        return Err(transport_failure("oversized frame header"));
    }
    let mut header_buf = vec![0u8; header_sz as usize];
    if read_full(stream, &mut header_buf, dead)? == 0 {
        return Err(transport_failure("socket closed"));
    }
    let frame = <Frame as Unpackable>::unpack(&header_buf)?.0;
    if frame.size > MAX_FRAME_BYTES {
        return Err(Error::RequestTooLarge {
            core: ErrorCore::default(),
            size: frame.size,
        });
    }
    let mut body = vec![0u8; frame.size as usize];
    if read_full(stream, &mut body, dead)? == 0 && frame.size > 0 {
        return Err(transport_failure("socket closed"));
    }
    if crc32c::crc32c(&body) != frame.crc32c {
        return Err(transport_failure("frame crc mismatch"));
    }
    Ok(Some(body))
}

/////////////////////////////////////////// ClientOptions //////////////////////////////////////////

/// Options for a lazyrpc client.
#[derive(Clone, CommandLine, Debug, Eq, PartialEq)]
pub struct ClientOptions {
    /// Milliseconds to wait for a connection to establish.
    #[arrrg(optional, "Milliseconds to wait for a connection to establish.")]
    pub connect_timeout_ms: u64,
    /// Milliseconds to wait for a call to complete.
    #[arrrg(optional, "Milliseconds to wait for a call to complete.")]
    pub call_timeout_ms: u64,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 250,
            call_timeout_ms: 1_000,
        }
    }
}

////////////////////////////////////////////// Client //////////////////////////////////////////////

struct LazyClient {
    options: ClientOptions,
    connect: String,
    seq_no: AtomicU64,
}

impl LazyClient {
    fn dial(&self) -> Result<TcpStream, Error> {
        DIAL.click();
        let addr = self
            .connect
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| Error::resolve_failure("connect string resolved to no addresses"))?;
        let stream =
            TcpStream::connect_timeout(&addr, Duration::from_millis(self.options.connect_timeout_ms))?;
        stream.set_nodelay(true)?;
        let timeout = Some(Duration::from_millis(self.options.call_timeout_ms));
        stream.set_read_timeout(timeout)?;
        stream.set_write_timeout(timeout)?;
        Ok(stream)
    }
}

impl rpc_pb::Client for LazyClient {
    fn call(&self, ctx: &Context, server: &str, method: &str, req: &[u8]) -> Status {
        CALL.click();
        let mut stream = match self.dial() {
            Ok(stream) => stream,
            Err(err) => {
                DIAL_ERROR.click();
                return Err(err);
            }
        };
        let seq_no = self.seq_no.fetch_add(1, Ordering::Relaxed);
        let request = Request {
            service: server,
            method,
            seq_no,
            body: req,
            caller: ctx.clients(),
            trace: ctx.trace_id(),
        };
        let msg = stack_pack(request).to_vec();
        let answer = (|| {
            send_msg(&mut stream, &msg)?;
            let buf =
                recv_msg(&mut stream, None)?.ok_or_else(|| transport_failure("socket closed"))?;
            let resp = <Response as Unpackable>::unpack(&buf)?.0;
            if resp.seq_no != seq_no {
                return Err(transport_failure("response sequence number mismatch"));
            }
            if let Some(rpc_error) = resp.rpc_error {
                return Err(<Error as Unpackable>::unpack(rpc_error)?.0);
            }
            if let Some(service_error) = resp.service_error {
                return Ok(Err(service_error.to_vec()));
            }
            Ok(Ok(resp.body.unwrap_or(&[]).to_vec()))
        })();
        if answer.is_err() {
            CALL_ERROR.click();
        }
        answer
    }
}

/// Create a new client that dials `connect` once per call.
pub fn new_client(
    options: ClientOptions,
    connect: String,
) -> Arc<dyn rpc_pb::Client + Send + Sync + 'static> {
    Arc::new(LazyClient {
        options,
        connect,
        seq_no: AtomicU64::new(1),
    })
}

////////////////////////////////////////// ServiceRegistry /////////////////////////////////////////

/// A ServiceRegistry multiplexes rpc_pb servers by service name.
#[derive(Default)]
pub struct ServiceRegistry {
    registry: HashMap<&'static str, Box<dyn rpc_pb::Server + Send + Sync + 'static>>,
}

impl ServiceRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the provided server under `name`.  Panics on duplicate registration.
    pub fn register<S: rpc_pb::Server + Send + Sync + 'static>(&mut self, name: &'static str, server: S) {
        assert!(!self.registry.contains_key(name));
        self.registry.insert(name, Box::new(server));
    }

    fn get_server(&self, name: &str) -> Option<&(dyn rpc_pb::Server + Send + Sync + 'static)> {
        self.registry.get(name).map(|s| s.as_ref())
    }
}

/////////////////////////////////////////// ServerOptions //////////////////////////////////////////

/// Options for a lazyrpc server.
#[derive(Clone, CommandLine, Debug, Default, Eq, PartialEq)]
pub struct ServerOptions {
    /// host:port to bind to.
    #[arrrg(required, "host:port to bind to.")]
    pub bind_to: String,
}

impl ServerOptions {
    /// Options that bind to the provided address.
    pub fn new(bind_to: &str) -> Self {
        Self {
            bind_to: bind_to.to_string(),
        }
    }
}

////////////////////////////////////////////// Server //////////////////////////////////////////////

/// A lazyrpc server.  One thread accepts; one thread per connection dispatches.
pub struct Server {
    listener: TcpListener,
    registry: ServiceRegistry,
    dead: AtomicBool,
}

impl Server {
    /// Bind the server.  Serving begins with [Server::serve].
    pub fn new(options: ServerOptions, registry: ServiceRegistry) -> Result<Self, Error> {
        let listener = TcpListener::bind(&options.bind_to)?;
        listener.set_nonblocking(true)?;
        Ok(Self {
            listener,
            registry,
            dead: AtomicBool::new(false),
        })
    }

    /// The address the server bound, in host:port form.
    pub fn local_addr(&self) -> Result<String, Error> {
        Ok(self.listener.local_addr()?.to_string())
    }

    /// Accept and dispatch connections until [Server::shutdown].
    pub fn serve(self: Arc<Self>) {
        while !self.dead.load(Ordering::Relaxed) {
            match self.listener.accept() {
                Ok((stream, _)) => {
                    ACCEPT.click();
                    let server = Arc::clone(&self);
                    std::thread::spawn(move || {
                        server.serve_connection(stream);
                    });
                }
                Err(err)
                    if err.kind() == ErrorKind::WouldBlock
                        || err.kind() == ErrorKind::TimedOut =>
                {
                    std::thread::sleep(POLL_INTERVAL);
                }
                Err(err) => {
                    ACCEPT_ERROR.click();
                    clue!(COLLECTOR, WARNING, {
                        accept_error: err.to_string(),
                    });
                    std::thread::sleep(POLL_INTERVAL);
                }
            }
        }
    }

    /// Stop accepting and wind down connection handlers.
    pub fn shutdown(&self) {
        self.dead.store(true, Ordering::Relaxed);
    }

    fn serve_connection(&self, mut stream: TcpStream) {
        if stream.set_nonblocking(false).is_err()
            || stream.set_nodelay(true).is_err()
            || stream
                .set_read_timeout(Some(POLL_INTERVAL))
                .is_err()
        {
            CONNECTION_ERROR.click();
            return;
        }
        loop {
            let buf = match recv_msg(&mut stream, Some(&self.dead)) {
                Ok(Some(buf)) => buf,
                Ok(None) => {
                    return;
                }
                Err(err) => {
                    CONNECTION_ERROR.click();
                    clue!(COLLECTOR, INFO, {
                        connection_error: err.to_string(),
                    });
                    return;
                }
            };
            if let Err(err) = self.handle_rpc(&mut stream, &buf) {
                CONNECTION_ERROR.click();
                clue!(COLLECTOR, INFO, {
                    rpc_error: err.to_string(),
                });
                return;
            }
        }
    }

    fn handle_rpc(&self, stream: &mut TcpStream, msg: &[u8]) -> Result<(), Error> {
        HANDLE_RPC.click();
        let req = <Request as Unpackable>::unpack(msg)?.0;
        let ctx = Context::from(&req);
        let status: Status = match self.registry.get_server(req.service) {
            Some(server) => server.call(&ctx, req.method, req.body),
            None => {
                UNKNOWN_SERVER_NAME.click();
                Err(Error::UnknownServerName {
                    core: ErrorCore::default(),
                    name: req.service.to_string(),
                })
            }
        };
        let (body, service_error, rpc_error) = match &status {
            Ok(Ok(body)) => (Some(body.as_slice()), None, None),
            Ok(Err(service_error)) => (None, Some(service_error.as_slice()), None),
            Err(err) => (None, None, Some(stack_pack(err).to_vec())),
        };
        let resp = Response {
            seq_no: req.seq_no,
            trace: req.trace,
            body,
            service_error,
            rpc_error: rpc_error.as_deref(),
        };
        send_msg(stream, &stack_pack(resp).to_vec())
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use prototk_derive::Message;
    use rpc_pb::service;

    use super::*;

    #[derive(Clone, Message, zerror_derive::Z)]
    pub enum EchoError {
        #[prototk(737280, message)]
        Success {
            #[prototk(1, message)]
            core: ErrorCore,
        },
        #[prototk(737281, message)]
        RpcError {
            #[prototk(1, message)]
            core: ErrorCore,
            #[prototk(2, message)]
            what: rpc_pb::Error,
        },
        #[prototk(737282, message)]
        SerializationError {
            #[prototk(1, message)]
            core: ErrorCore,
            #[prototk(2, message)]
            err: prototk::Error,
        },
    }

    impl Default for EchoError {
        fn default() -> Self {
            Self::Success {
                core: ErrorCore::default(),
            }
        }
    }

    impl From<rpc_pb::Error> for EchoError {
        fn from(what: rpc_pb::Error) -> Self {
            Self::RpcError {
                core: ErrorCore::default(),
                what,
            }
        }
    }

    impl From<prototk::Error> for EchoError {
        fn from(err: prototk::Error) -> Self {
            Self::SerializationError {
                core: ErrorCore::default(),
                err,
            }
        }
    }

    #[derive(Clone, Debug, Default, Message)]
    pub struct EchoRequest {
        #[prototk(1, string)]
        message: String,
    }

    #[derive(Clone, Debug, Default, Message)]
    pub struct EchoResponse {
        #[prototk(1, string)]
        message: String,
    }

    service! {
        name = EchoService;
        server = EchoServer;
        client = EchoClient;
        error = EchoError;

        rpc echo(EchoRequest) -> EchoResponse;
    }

    struct Echo;

    impl EchoService for Echo {
        fn echo(&self, _: &Context, req: EchoRequest) -> Result<EchoResponse, EchoError> {
            Ok(EchoResponse {
                message: req.message,
            })
        }
    }

    #[test]
    fn round_trip() {
        let mut registry = ServiceRegistry::new();
        registry.register("EchoService", EchoServer::bind(Echo));
        let server = Arc::new(
            Server::new(ServerOptions::new("127.0.0.1:0"), registry).unwrap(),
        );
        let server_p = Arc::clone(&server);
        let serve = std::thread::spawn(move || server_p.serve());
        let connect = server.local_addr().unwrap();
        let client = EchoClient::new(new_client(ClientOptions::default(), connect));
        let resp = client
            .echo(
                &Context::default(),
                EchoRequest {
                    message: "hello".to_string(),
                },
            )
            .unwrap();
        assert_eq!("hello", resp.message);
        server.shutdown();
        serve.join().unwrap();
    }

    #[test]
    fn unknown_service() {
        let server = Arc::new(
            Server::new(ServerOptions::new("127.0.0.1:0"), ServiceRegistry::new()).unwrap(),
        );
        let server_p = Arc::clone(&server);
        let serve = std::thread::spawn(move || server_p.serve());
        let connect = server.local_addr().unwrap();
        let client = new_client(ClientOptions::default(), connect);
        let status = client.call(&Context::default(), "NoSuchService", "nop", &[]);
        assert!(matches!(
            status,
            Err(Error::UnknownServerName { .. })
        ));
        server.shutdown();
        serve.join().unwrap();
    }
}
