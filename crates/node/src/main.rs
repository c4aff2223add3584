//! rookd: a headers-first block-relay node built on the peer message
//! processor. It dials the configured peers, serves inbound connections,
//! and keeps an in-memory header tree and block store in sync with the
//! network.

mod connman;
mod engine;
mod relay;
mod transport;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rookd_consensus::constants::{NODE_BLOOM, NODE_NETWORK, NODE_WITNESS};
use rookd_consensus::{chain_params, ChainParams, Network};
use rookd_log::{log_debug, log_info, log_warn};
use rookd_net::collab::{ChainEngine, ConnMan, TickScheduler};
use rookd_net::peer::{PeerFlags, PeerId};
use rookd_net::{NetConfig, NetProcessor, SystemClock};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use crate::connman::{Connections, Outgoing};
use crate::engine::{EngineEvent, HeaderChain};
use crate::relay::PassiveTxPool;

/// Headers served per getheaders response.
pub const MAX_HEADERS_REPLY: usize = 2000;

const DEFAULT_OUTBOUND_TARGET: usize = 8;
const SEND_TICK_MILLIS: u64 = 100;
const DISCONNECT_POLL_MILLIS: u64 = 250;
const RECONNECT_DELAY_SECS: u64 = 30;
const STATUS_INTERVAL_SECS: u64 = 30;

type Processor = NetProcessor<HeaderChain, PassiveTxPool, Connections>;

struct Config {
    network: Network,
    connect: Vec<SocketAddr>,
    listen: Option<SocketAddr>,
    ban_threshold: i32,
    fee_filter: bool,
    whitelist_relay: bool,
    whitelist_force_relay: bool,
    max_mempool_mb: u64,
    drop_messages_test: u64,
    log_level: u8,
}

impl Default for Config {
    fn default() -> Self {
        let defaults = NetConfig::default();
        Self {
            network: Network::Mainnet,
            connect: Vec::new(),
            listen: None,
            ban_threshold: defaults.ban_threshold,
            fee_filter: defaults.fee_filter,
            whitelist_relay: defaults.whitelist_relay,
            whitelist_force_relay: defaults.whitelist_force_relay,
            max_mempool_mb: defaults.max_mempool_mb,
            drop_messages_test: 0,
            log_level: rookd_log::LEVEL_INFO,
        }
    }
}

struct TokioScheduler {
    handle: tokio::runtime::Handle,
}

impl TickScheduler for TokioScheduler {
    fn schedule_every(&self, period: Duration, mut task: Box<dyn FnMut() + Send + 'static>) {
        self.handle.spawn(async move {
            let mut interval = tokio::time::interval(period);
            // The first tick fires immediately; skip it so the cadence
            // starts one period out.
            interval.tick().await;
            loop {
                interval.tick().await;
                task();
            }
        });
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("{err}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), String> {
    let config = parse_args()?;
    rookd_log::set_max_level(config.log_level);
    let params = chain_params(config.network);

    let (event_tx, event_rx) = crossbeam_channel::unbounded();
    let chain = Arc::new(HeaderChain::new(&params, event_tx));
    let pool = Arc::new(PassiveTxPool);
    let conns = Arc::new(Connections::new(DEFAULT_OUTBOUND_TARGET));

    let net_config = NetConfig {
        ban_threshold: config.ban_threshold,
        fee_filter: config.fee_filter,
        whitelist_relay: config.whitelist_relay,
        whitelist_force_relay: config.whitelist_force_relay,
        max_mempool_mb: config.max_mempool_mb,
        drop_messages_test: config.drop_messages_test,
        relay_txes: false,
        listening: config.listen.is_some(),
        local_services: NODE_NETWORK | NODE_WITNESS | NODE_BLOOM,
        ..NetConfig::default()
    };
    let processor = Arc::new(NetProcessor::new(
        net_config,
        params.clone(),
        Arc::clone(&chain),
        pool,
        Arc::clone(&conns),
        Arc::new(SystemClock),
    ));

    spawn_event_pump(Arc::clone(&processor), event_rx);
    processor.start(&TokioScheduler {
        handle: tokio::runtime::Handle::current(),
    });

    let interrupt = Arc::new(AtomicBool::new(false));
    let next_peer_id = Arc::new(AtomicU64::new(0));

    if let Some(listen) = config.listen {
        let listener = TcpListener::bind(listen)
            .await
            .map_err(|err| format!("failed to bind p2p listener {listen}: {err}"))?;
        log_info!("p2p listening on {listen}");
        tokio::spawn(accept_loop(
            listener,
            params.message_start,
            Arc::clone(&processor),
            Arc::clone(&conns),
            Arc::clone(&interrupt),
            Arc::clone(&next_peer_id),
        ));
    }

    if config.connect.is_empty() && config.listen.is_none() {
        return Err(usage());
    }
    for addr in &config.connect {
        tokio::spawn(dial_loop(
            *addr,
            params.message_start,
            Arc::clone(&processor),
            Arc::clone(&conns),
            Arc::clone(&interrupt),
            Arc::clone(&next_peer_id),
        ));
    }

    status_loop(chain, conns, params).await;
    Ok(())
}

fn spawn_event_pump(
    processor: Arc<Processor>,
    events: crossbeam_channel::Receiver<EngineEvent>,
) {
    std::thread::spawn(move || {
        while let Ok(event) = events.recv() {
            match event {
                EngineEvent::BlockChecked { hash, verdict } => {
                    processor.block_checked(hash, &verdict);
                }
                EngineEvent::BlockConnected { block } => {
                    processor.block_connected(&block);
                }
                EngineEvent::UpdatedTip {
                    new_tip,
                    fork,
                    initial_download,
                } => {
                    processor.updated_block_tip(new_tip, fork, initial_download);
                }
            }
        }
    });
}

async fn status_loop(chain: Arc<HeaderChain>, conns: Arc<Connections>, params: ChainParams) {
    let mut interval = tokio::time::interval(Duration::from_secs(STATUS_INTERVAL_SECS));
    loop {
        interval.tick().await;
        let tip = chain.tip();
        println!(
            "{}: height {} (headers {}), {} peer(s)",
            params.network.as_str(),
            chain.height(tip),
            chain.height(chain.best_header()),
            conns.count()
        );
    }
}

async fn accept_loop(
    listener: TcpListener,
    magic: [u8; 4],
    processor: Arc<Processor>,
    conns: Arc<Connections>,
    interrupt: Arc<AtomicBool>,
    next_peer_id: Arc<AtomicU64>,
) {
    loop {
        let (stream, remote) = match listener.accept().await {
            Ok(pair) => pair,
            Err(err) => {
                log_warn!("p2p accept failed: {err}");
                continue;
            }
        };
        if conns.is_banned(remote) {
            log_debug!("dropping banned peer {remote}");
            continue;
        }
        let processor = Arc::clone(&processor);
        let conns = Arc::clone(&conns);
        let interrupt = Arc::clone(&interrupt);
        let next_peer_id = Arc::clone(&next_peer_id);
        tokio::spawn(async move {
            if let Err(err) = run_peer(
                stream,
                remote,
                false,
                magic,
                processor,
                conns,
                interrupt,
                next_peer_id,
            )
            .await
            {
                log_debug!("inbound peer {remote} closed: {err}");
            }
        });
    }
}

async fn dial_loop(
    addr: SocketAddr,
    magic: [u8; 4],
    processor: Arc<Processor>,
    conns: Arc<Connections>,
    interrupt: Arc<AtomicBool>,
    next_peer_id: Arc<AtomicU64>,
) {
    loop {
        if conns.is_banned(addr) {
            tokio::time::sleep(Duration::from_secs(RECONNECT_DELAY_SECS)).await;
            continue;
        }
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                log_info!("connected to {addr}");
                if let Err(err) = run_peer(
                    stream,
                    addr,
                    true,
                    magic,
                    Arc::clone(&processor),
                    Arc::clone(&conns),
                    Arc::clone(&interrupt),
                    Arc::clone(&next_peer_id),
                )
                .await
                {
                    log_debug!("peer {addr} closed: {err}");
                }
            }
            Err(err) => {
                log_debug!("connect to {addr} failed: {err}");
            }
        }
        tokio::time::sleep(Duration::from_secs(RECONNECT_DELAY_SECS)).await;
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_peer(
    stream: TcpStream,
    addr: SocketAddr,
    outbound: bool,
    magic: [u8; 4],
    processor: Arc<Processor>,
    conns: Arc<Connections>,
    interrupt: Arc<AtomicBool>,
    next_peer_id: Arc<AtomicU64>,
) -> Result<(), String> {
    let id = PeerId(next_peer_id.fetch_add(1, Ordering::Relaxed));
    let (mut read_half, write_half) = stream.into_split();
    let (sender, receiver) = mpsc::unbounded_channel::<Outgoing>();
    conns.register(id, addr, outbound, sender);

    let writer = tokio::spawn(write_loop(write_half, receiver, magic));

    processor.initialize_node(
        id,
        addr,
        addr.to_string(),
        PeerFlags {
            inbound: !outbound,
            ..PeerFlags::default()
        },
    );

    let reader = {
        let processor = Arc::clone(&processor);
        let interrupt = Arc::clone(&interrupt);
        tokio::spawn(async move {
            loop {
                match transport::read_raw_message(&mut read_half).await {
                    Ok(raw) => {
                        processor.enqueue_message(id, raw);
                        while processor.process_messages(id, &interrupt) {}
                        if processor.peer_marked_for_disconnect(id) {
                            break;
                        }
                    }
                    Err(err) => {
                        log_debug!("peer={id} read ended: {err}");
                        break;
                    }
                }
            }
        })
    };

    let ticker = {
        let processor = Arc::clone(&processor);
        let interrupt = Arc::clone(&interrupt);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_millis(SEND_TICK_MILLIS));
            loop {
                tick.tick().await;
                processor.send_messages(id, &interrupt);
            }
        })
    };

    // Wait for the socket to drain or for the processor to give up on the
    // peer, whichever happens first.
    let mut reader = reader;
    let mut poll = tokio::time::interval(Duration::from_millis(DISCONNECT_POLL_MILLIS));
    loop {
        tokio::select! {
            _ = &mut reader => break,
            _ = poll.tick() => {
                if processor.peer_marked_for_disconnect(id) {
                    reader.abort();
                    break;
                }
            }
        }
    }
    ticker.abort();

    let healthy = processor.finalize_node(id);
    if healthy {
        conns.mark_address_good(addr);
    }
    conns.unregister(id);
    let _ = writer.await;
    Ok(())
}

async fn write_loop(
    mut write_half: tokio::net::tcp::OwnedWriteHalf,
    mut receiver: mpsc::UnboundedReceiver<Outgoing>,
    magic: [u8; 4],
) {
    use tokio::io::AsyncWriteExt;
    while let Some(outgoing) = receiver.recv().await {
        match outgoing {
            Outgoing::Message(message) => {
                if transport::write_message(&mut write_half, &magic, &message)
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Outgoing::Close => break,
        }
    }
    let _ = write_half.shutdown().await;
}

fn parse_args() -> Result<Config, String> {
    let mut config = Config::default();
    let mut default_port = chain_params(config.network).default_port;
    let mut pending_connect: Vec<String> = Vec::new();
    let mut listen_requested: Option<Option<String>> = None;

    for arg in std::env::args().skip(1) {
        let (key, value) = match arg.split_once('=') {
            Some((key, value)) => (key.to_string(), Some(value.to_string())),
            None => (arg.clone(), None),
        };
        match key.as_str() {
            "-help" | "--help" | "-h" => return Err(usage()),
            "-network" => {
                let value = value.ok_or_else(|| "-network requires a value".to_string())?;
                config.network = Network::parse(&value)
                    .ok_or_else(|| format!("unknown network \"{value}\""))?;
                default_port = chain_params(config.network).default_port;
            }
            "-connect" => {
                let value = value.ok_or_else(|| "-connect requires a value".to_string())?;
                pending_connect.push(value);
            }
            "-listen" => {
                listen_requested = Some(value);
            }
            "-banscore" => {
                let value = value.ok_or_else(|| "-banscore requires a value".to_string())?;
                config.ban_threshold = value
                    .parse()
                    .map_err(|_| format!("invalid -banscore value \"{value}\""))?;
            }
            "-feefilter" => {
                config.fee_filter = parse_bool_flag(value.as_deref())?;
            }
            "-whitelistrelay" => {
                config.whitelist_relay = parse_bool_flag(value.as_deref())?;
            }
            "-whitelistforcerelay" => {
                config.whitelist_force_relay = parse_bool_flag(value.as_deref())?;
            }
            "-maxmempool" => {
                let value = value.ok_or_else(|| "-maxmempool requires a value".to_string())?;
                config.max_mempool_mb = value
                    .parse()
                    .map_err(|_| format!("invalid -maxmempool value \"{value}\""))?;
            }
            "-dropmessagestest" => {
                let value =
                    value.ok_or_else(|| "-dropmessagestest requires a value".to_string())?;
                config.drop_messages_test = value
                    .parse()
                    .map_err(|_| format!("invalid -dropmessagestest value \"{value}\""))?;
            }
            "-loglevel" => {
                let value = value.ok_or_else(|| "-loglevel requires a value".to_string())?;
                config.log_level = rookd_log::parse_level(&value)
                    .ok_or_else(|| format!("unknown log level \"{value}\""))?;
            }
            other => return Err(format!("unknown argument \"{other}\"\n{}", usage())),
        }
    }

    for value in pending_connect {
        let addr = parse_socket_addr_with_default_port(&value, default_port)
            .ok_or_else(|| format!("invalid -connect address \"{value}\""))?;
        config.connect.push(addr);
    }
    if let Some(value) = listen_requested {
        let addr = match value {
            Some(value) => parse_socket_addr_with_default_port(&value, default_port)
                .ok_or_else(|| format!("invalid -listen address \"{value}\""))?,
            None => SocketAddr::from(([0, 0, 0, 0], default_port)),
        };
        config.listen = Some(addr);
    }
    Ok(config)
}

fn parse_bool_flag(value: Option<&str>) -> Result<bool, String> {
    match value {
        None | Some("1") | Some("true") => Ok(true),
        Some("0") | Some("false") => Ok(false),
        Some(other) => Err(format!("invalid boolean flag value \"{other}\"")),
    }
}

fn parse_socket_addr_with_default_port(value: &str, default_port: u16) -> Option<SocketAddr> {
    if let Ok(addr) = value.parse::<SocketAddr>() {
        return Some(addr);
    }
    if let Ok(ip) = value.parse::<std::net::IpAddr>() {
        return Some(SocketAddr::new(ip, default_port));
    }
    None
}

fn usage() -> String {
    [
        "usage: rookd [options]",
        "  -network=<main|test|regtest>  chain to follow (default: main)",
        "  -connect=<addr[:port]>        dial this peer (repeatable)",
        "  -listen[=<addr[:port]>]       accept inbound connections",
        "  -banscore=<n>                 misbehavior threshold (default: 100)",
        "  -feefilter=<0|1>              announce a fee filter (default: 1)",
        "  -whitelistrelay=<0|1>         relay from whitelisted peers (default: 1)",
        "  -whitelistforcerelay=<0|1>    force relay from whitelisted peers (default: 1)",
        "  -maxmempool=<mb>              mempool ceiling for the fee filter (default: 300)",
        "  -dropmessagestest=<n>         drop one in n received messages (testing)",
        "  -loglevel=<error|warn|info|debug>",
    ]
    .join("\n")
}
