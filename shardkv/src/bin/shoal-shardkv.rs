use std::fs::File;
use std::time::Duration;

use arrrg::CommandLine;
use arrrg_derive::CommandLine;
use biometrics::{Collector, PlainTextEmitter};
use indicio::stdio::StdioEmitter;
use indicio::INFO;

use shardkv::{ShardKv, ShardKvOptions};
use shardkv_pb::IoToZ;

#[derive(CommandLine, Debug, Default, Eq, PartialEq)]
struct Options {
    #[arrrg(required, "This replica's group id.")]
    gid: u64,
    #[arrrg(required, "Comma-separated host:port list of the shardmaster ensemble.")]
    masters: String,
    #[arrrg(required, "Comma-separated host:port list of every replica in this group.")]
    peers: String,
    #[arrrg(required, "Index of this replica within --peers.")]
    me: usize,
    #[arrrg(nested)]
    shardkv: ShardKvOptions,
}

fn main() {
    let (options, free) = Options::from_command_line(
        "USAGE: shoal-shardkv [OPTIONS] --gid G --masters x,y,z --peers a,b,c --me N",
    );
    if !free.is_empty() {
        eprintln!("command takes no positional arguments");
        std::process::exit(1);
    }
    let masters: Vec<String> = options.masters.split(',').map(String::from).collect();
    let peers: Vec<String> = options.peers.split(',').map(String::from).collect();
    if options.me >= peers.len() {
        eprintln!("--me must index into --peers");
        std::process::exit(1);
    }
    if options.gid == 0 {
        eprintln!("--gid must be non-zero");
        std::process::exit(1);
    }
    shardkv::COLLECTOR.register(StdioEmitter);
    shardkv::COLLECTOR.set_verbosity(INFO);
    shardmaster::COLLECTOR.register(StdioEmitter);
    shardmaster::COLLECTOR.set_verbosity(INFO);
    paxos::COLLECTOR.register(StdioEmitter);
    paxos::COLLECTOR.set_verbosity(INFO);
    lazyrpc::COLLECTOR.register(StdioEmitter);
    lazyrpc::COLLECTOR.set_verbosity(INFO);
    std::thread::spawn(|| {
        let collector = Collector::new();
        shardkv::register_biometrics(&collector);
        shardmaster::register_biometrics(&collector);
        paxos::register_biometrics(&collector);
        lazyrpc::register_biometrics(&collector);
        stowage::register_biometrics(&collector);
        let fout = File::create("/dev/stdout").unwrap();
        let mut emit = PlainTextEmitter::new(fout);
        loop {
            let now = std::time::SystemTime::now()
                .duration_since(std::time::SystemTime::UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0);
            if let Err(err) = collector.emit(&mut emit, now) {
                eprintln!("collector error: {:?}", err);
            }
            std::thread::sleep(Duration::from_millis(2_500));
        }
    });
    let kv = ShardKv::start(options.shardkv, options.gid, masters, peers, options.me)
        .as_z()
        .pretty_unwrap();
    eprintln!(
        "shoal-shardkv group {} serving on {}",
        options.gid,
        kv.local_addr().as_z().pretty_unwrap()
    );
    loop {
        std::thread::sleep(Duration::from_secs(60));
    }
}
