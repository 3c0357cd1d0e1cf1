#![doc = include_str!("../README.md")]

use std::collections::BTreeMap;
use std::fs::{create_dir_all, rename, File, OpenOptions};
use std::io::{Read, Write};
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use arrrg_derive::CommandLine;
use biometrics::{Collector, Counter};
use buffertk::{stack_pack, v64, Packable, Unpackable, Unpacker};
use prototk_derive::Message;
use zerror::{iotoz, Z};
use zerror_core::ErrorCore;

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static OPEN: Counter = Counter::new("stowage.open");
static REPLAY: Counter = Counter::new("stowage.replay");
static TORN_TAIL: Counter = Counter::new("stowage.torn_tail");
static PUT: Counter = Counter::new("stowage.put");
static DEL: Counter = Counter::new("stowage.del");
static GET: Counter = Counter::new("stowage.get");
static SCAN: Counter = Counter::new("stowage.scan");
static SWEEP: Counter = Counter::new("stowage.sweep");
static FSYNC: Counter = Counter::new("stowage.fsync");

/// Register the biometrics for this crate.
pub fn register_biometrics(collector: &Collector) {
    collector.register_counter(&OPEN);
    collector.register_counter(&REPLAY);
    collector.register_counter(&TORN_TAIL);
    collector.register_counter(&PUT);
    collector.register_counter(&DEL);
    collector.register_counter(&GET);
    collector.register_counter(&SCAN);
    collector.register_counter(&SWEEP);
    collector.register_counter(&FSYNC);
}

///////////////////////////////////////////// Constants ////////////////////////////////////////////

/// The maximum length of a key.
pub const MAX_KEY_LEN: usize = 1usize << 14; /* 16KiB */
/// The maximum length of a value.  Replicated log entries carry whole shard transfers, so this is
/// a backstop against runaway records rather than a tight bound.
pub const MAX_VALUE_LEN: usize = 1usize << 30; /* 1GiB */

const LOG_FILE: &str = "log";
const SWEEP_FILE: &str = "log.new";

// A sweep rewrites the log once dead bytes exceed live bytes by this margin.
const SWEEP_SLOP: u64 = 1 << 20;

/////////////////////////////////////////////// Error //////////////////////////////////////////////

/// The error type for stowage operations.
#[derive(Clone, Message, zerror_derive::Z)]
pub enum Error {
    /// The default error type.  Necessary to support protobuf, but should otherwise not be
    /// constructed.
    #[prototk(655360, message)]
    Success {
        /// The error core.
        #[prototk(1, message)]
        core: ErrorCore,
    },
    /// An I/O error from the underlying log.
    #[prototk(655361, message)]
    IoError {
        /// The error core.
        #[prototk(1, message)]
        core: ErrorCore,
        /// The string representation of the error.
        #[prototk(2, string)]
        what: String,
    },
    /// A record in the interior of the log failed its checksum or framing.
    #[prototk(655362, message)]
    Corruption {
        /// The error core.
        #[prototk(1, message)]
        core: ErrorCore,
        /// A hint as to what went wrong.
        #[prototk(2, string)]
        what: String,
        /// The log offset of the bad record.
        #[prototk(3, uint64)]
        offset: u64,
    },
    /// An error was encountered while serializing or deserializing a record.
    #[prototk(655363, message)]
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
    /// The key exceeds MAX_KEY_LEN.
    #[prototk(655364, message)]
    KeyTooLarge {
        /// The error core.
        #[prototk(1, message)]
        core: ErrorCore,
        /// The size requested.
        #[prototk(2, uint64)]
        size: u64,
    },
    /// The value exceeds MAX_VALUE_LEN.
    #[prototk(655365, message)]
    ValueTooLarge {
        /// The error core.
        #[prototk(1, message)]
        core: ErrorCore,
        /// The size requested.
        #[prototk(2, uint64)]
        size: u64,
    },
}

impl Default for Error {
    fn default() -> Self {
        Self::Success {
            core: ErrorCore::default(),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::IoError {
            core: ErrorCore::default(),
            what: err.to_string(),
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

iotoz! {Error}

/////////////////////////////////////////////// wire ///////////////////////////////////////////////

#[derive(Clone, Debug, Default, Message)]
struct RecordHeader {
    #[prototk(1, uint64)]
    size: u64,
    #[prototk(2, fixed32)]
    crc32c: u32,
}

#[derive(Clone, Debug, Default, Message)]
enum Record {
    #[prototk(1, message)]
    #[default]
    Nop,
    #[prototk(2, message)]
    Put {
        #[prototk(1, bytes)]
        key: Vec<u8>,
        #[prototk(2, bytes)]
        value: Vec<u8>,
    },
    #[prototk(3, message)]
    Del {
        #[prototk(1, bytes)]
        key: Vec<u8>,
    },
}

fn frame(record: &Record) -> Vec<u8> {
    let body = stack_pack(record).to_vec();
    let header = RecordHeader {
        size: body.len() as u64,
        crc32c: crc32c::crc32c(&body),
    };
    let header_sz: v64 = header.pack_sz().into();
    let mut buf = stack_pack(header_sz).pack(header).to_vec();
    buf.extend_from_slice(&body);
    buf
}

////////////////////////////////////////// StowageOptions //////////////////////////////////////////

/// Options for opening a [Stowage].
#[derive(Clone, CommandLine, Debug, Default, Eq, PartialEq)]
pub struct StowageOptions {
    /// Directory in which to keep the record log.
    #[arrrg(required, "Directory in which to keep the record log.")]
    pub path: String,
}

impl StowageOptions {
    /// Options rooted at the provided path.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_string_lossy().to_string(),
        }
    }
}

////////////////////////////////////////////// Inner ///////////////////////////////////////////////

struct Inner {
    file: File,
    index: BTreeMap<Vec<u8>, Vec<u8>>,
    live_bytes: u64,
    total_bytes: u64,
}

impl Inner {
    fn append(&mut self, record: &Record) -> Result<(), Error> {
        let buf = frame(record);
        self.file.write_all(&buf)?;
        self.file.sync_data()?;
        FSYNC.click();
        self.total_bytes += buf.len() as u64;
        Ok(())
    }
}

////////////////////////////////////////////// Stowage /////////////////////////////////////////////

/// A durable, write-through, sorted-keys record store.  Every put or del appends a crc-framed
/// record to the log and fsyncs before returning.  Reads and scans are answered from an in-memory
/// sorted index that open rebuilds by replaying the log.
pub struct Stowage {
    options: StowageOptions,
    inner: Mutex<Inner>,
}

impl Stowage {
    /// Open the store rooted at `options.path`, creating it if necessary.  A torn record at the
    /// tail of the log is truncated; a bad record anywhere else is [Error::Corruption].
    pub fn open(options: StowageOptions) -> Result<Self, Error> {
        OPEN.click();
        create_dir_all(&options.path)?;
        let log_path = PathBuf::from(&options.path).join(LOG_FILE);
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&log_path)?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;
        let mut index = BTreeMap::new();
        let mut offset = 0usize;
        while offset < bytes.len() {
            match Self::replay_one(&bytes[offset..], offset as u64, &mut index) {
                Ok(Replay::Consumed(consumed)) => {
                    REPLAY.click();
                    offset += consumed;
                }
                Ok(Replay::Truncated) => {
                    // The log ended mid-record: the write in flight at crash.  Drop it.
                    TORN_TAIL.click();
                    file.set_len(offset as u64)?;
                    file.sync_data()?;
                    break;
                }
                Err(err) => {
                    return Err(err).with_info("log", log_path.to_string_lossy().to_string());
                }
            }
        }
        let live_bytes = index
            .iter()
            .map(|(k, v)| (k.len() + v.len()) as u64)
            .sum::<u64>();
        let total_bytes = offset as u64;
        Ok(Self {
            options,
            inner: Mutex::new(Inner {
                file,
                index,
                live_bytes,
                total_bytes,
            }),
        })
    }

    /// The path this store was opened at.
    pub fn path(&self) -> &str {
        &self.options.path
    }

    /// Durably associate `value` with `key`.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<(), Error> {
        PUT.click();
        check_key(key)?;
        check_value(value)?;
        let mut inner = self.inner.lock().unwrap();
        inner.append(&Record::Put {
            key: key.to_vec(),
            value: value.to_vec(),
        })?;
        if let Some(prev) = inner.index.insert(key.to_vec(), value.to_vec()) {
            inner.live_bytes -= prev.len() as u64;
            inner.live_bytes += value.len() as u64;
        } else {
            inner.live_bytes += (key.len() + value.len()) as u64;
        }
        self.maybe_sweep(inner)
    }

    /// Durably remove `key`.
    pub fn del(&self, key: &[u8]) -> Result<(), Error> {
        DEL.click();
        check_key(key)?;
        let mut inner = self.inner.lock().unwrap();
        if inner.index.contains_key(key) {
            inner.append(&Record::Del { key: key.to_vec() })?;
            if let Some(prev) = inner.index.remove(key) {
                inner.live_bytes -= (key.len() + prev.len()) as u64;
            }
        }
        self.maybe_sweep(inner)
    }

    /// The value associated with `key`, if any.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        GET.click();
        let inner = self.inner.lock().unwrap();
        Ok(inner.index.get(key).cloned())
    }

    /// Every key-value pair whose key starts with `prefix`, in ascending key order.
    pub fn prefix_scan(&self, prefix: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
        SCAN.click();
        let inner = self.inner.lock().unwrap();
        inner
            .index
            .range::<[u8], _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Key-value pairs with keys strictly greater than `after` in ascending order, stopping once
    /// `budget` bytes of keys and values have accumulated.  The second return is true iff more
    /// pairs remain past the ones returned.
    pub fn scan_after(&self, after: &[u8], budget: usize) -> (Vec<(Vec<u8>, Vec<u8>)>, bool) {
        SCAN.click();
        let inner = self.inner.lock().unwrap();
        let mut pairs = Vec::new();
        let mut bytes = 0usize;
        let mut more = false;
        for (k, v) in inner
            .index
            .range::<[u8], _>((Bound::Excluded(after), Bound::Unbounded))
        {
            if bytes >= budget {
                more = true;
                break;
            }
            bytes += k.len() + v.len();
            pairs.push((k.clone(), v.clone()));
        }
        (pairs, more)
    }

    /// Rewrite the log so it holds exactly the live pairs.
    pub fn sweep(&self) -> Result<(), Error> {
        let inner = self.inner.lock().unwrap();
        self.sweep_locked(inner)
    }

    fn maybe_sweep(
        &self,
        inner: std::sync::MutexGuard<'_, Inner>,
    ) -> Result<(), Error> {
        if inner.total_bytes > 2 * inner.live_bytes + SWEEP_SLOP {
            self.sweep_locked(inner)
        } else {
            Ok(())
        }
    }

    fn sweep_locked(
        &self,
        mut inner: std::sync::MutexGuard<'_, Inner>,
    ) -> Result<(), Error> {
        SWEEP.click();
        let sweep_path = PathBuf::from(&self.options.path).join(SWEEP_FILE);
        let log_path = PathBuf::from(&self.options.path).join(LOG_FILE);
        let mut out = File::create(&sweep_path)?;
        let mut total_bytes = 0u64;
        for (key, value) in inner.index.iter() {
            let buf = frame(&Record::Put {
                key: key.clone(),
                value: value.clone(),
            });
            out.write_all(&buf)?;
            total_bytes += buf.len() as u64;
        }
        out.sync_data()?;
        FSYNC.click();
        rename(&sweep_path, &log_path)?;
        inner.file = OpenOptions::new().read(true).append(true).open(&log_path)?;
        inner.total_bytes = total_bytes;
        Ok(())
    }

    // One record off the front of `buf`.  Short reads can only happen at the tail of the log,
    // because appends are ordered behind the fsync of everything before them; they report
    // Truncated.  A record whose full span is present but fails its checksum or parse is real
    // corruption.
    fn replay_one(
        buf: &[u8],
        offset: u64,
        index: &mut BTreeMap<Vec<u8>, Vec<u8>>,
    ) -> Result<Replay, Error> {
        let corrupt = |what: &str| Error::Corruption {
            core: ErrorCore::default(),
            what: what.to_string(),
            offset,
        };
        let mut up = Unpacker::new(buf);
        let header_sz: v64 = match up.unpack() {
            Ok(header_sz) => header_sz,
            Err(_) => {
                return Ok(Replay::Truncated);
            }
        };
        let header_sz: usize = header_sz.into();
        if up.remain().len() < header_sz {
            return Ok(Replay::Truncated);
        }
        let header = RecordHeader::unpack(&up.remain()[..header_sz])
            .map_err(|_| corrupt("header"))?
            .0;
        up.advance(header_sz);
        let body_sz = header.size as usize;
        if up.remain().len() < body_sz {
            return Ok(Replay::Truncated);
        }
        let body = &up.remain()[..body_sz];
        if crc32c::crc32c(body) != header.crc32c {
            return Err(corrupt("crc mismatch"));
        }
        let record = Record::unpack(body).map_err(|_| corrupt("record"))?.0;
        match record {
            Record::Nop => {}
            Record::Put { key, value } => {
                index.insert(key, value);
            }
            Record::Del { key } => {
                index.remove(&key);
            }
        }
        up.advance(body_sz);
        Ok(Replay::Consumed(buf.len() - up.remain().len()))
    }
}

enum Replay {
    Consumed(usize),
    Truncated,
}

/////////////////////////////////////////////// utils //////////////////////////////////////////////

fn check_key(key: &[u8]) -> Result<(), Error> {
    if key.len() > MAX_KEY_LEN {
        Err(Error::KeyTooLarge {
            core: ErrorCore::default(),
            size: key.len() as u64,
        })
    } else {
        Ok(())
    }
}

fn check_value(value: &[u8]) -> Result<(), Error> {
    if value.len() > MAX_VALUE_LEN {
        Err(Error::ValueTooLarge {
            core: ErrorCore::default(),
            size: value.len() as u64,
        })
    } else {
        Ok(())
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////
