use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::anyhow;
use clap::Parser;
use tracing::{error, info, Level};

use rustonika::codec::frame::FrameCodec;
use rustonika::gateway::config::GatewayConfig;
use rustonika::gateway::engine::ProtocolEngine;
use rustonika::metrics::GatewayMetrics;
use rustonika::sink::{FanOutSink, JsonLinesSink, RecordSink};

#[derive(Parser)]
#[clap(name = "rustonika", about = "UDP ingress gateway for Teltonika GPS trackers")]
struct Args {
    /// listening IP address for tracker traffic (IPv4 or IPv6)
    #[clap(long, default_value = "0.0.0.0")]
    listen_ip: IpAddr,

    /// listening UDP port for tracker traffic
    #[clap(long, default_value_t = 9160)]
    listen_port: u16,

    /// IMEI allowed to create server-side state, can be repeated
    #[clap(long = "imei")]
    imeis: Vec<String>,

    /// directory for the per-device command sockets
    #[clap(long, default_value = "/tmp/rustonika")]
    socket_dir: PathBuf,

    /// file the metrics snapshot is persisted to
    #[clap(long, default_value = "rustonika.met")]
    metrics_file: PathBuf,

    /// file decoded records are appended to, one JSON object per record
    #[clap(long, default_value = "rustonika-records.jsonl")]
    records_file: PathBuf,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    if args.imeis.is_empty() {
        return Err(anyhow!("at least one --imei is required"));
    }

    let mut config = GatewayConfig::new(SocketAddr::new(args.listen_ip, args.listen_port));
    for imei in &args.imeis {
        config.allow_list.insert(imei.parse()?);
    }
    config.base_path = args.socket_dir;
    tokio::fs::create_dir_all(&config.base_path).await?;

    let metrics = Arc::new(GatewayMetrics::load(&args.metrics_file).await);
    let json_sink: Arc<dyn RecordSink> = Arc::new(JsonLinesSink::create(&args.records_file).await?);
    let records: Arc<dyn RecordSink> = Arc::new(FanOutSink::new(vec![json_sink]));

    let engine = Arc::new(ProtocolEngine::bind(Arc::new(config), Arc::new(FrameCodec), records, metrics.clone()).await?);

    {
        let metrics = metrics.clone();
        let metrics_file = args.metrics_file.clone();
        let cancel = engine.subscribe_cancel();
        tokio::spawn(async move { metrics.run_saver(metrics_file, cancel).await });
    }

    let run_handle = {
        let engine = engine.clone();
        tokio::spawn(engine.run())
    };

    tokio::signal::ctrl_c().await?;
    info!("interrupted, shutting down");
    engine.cancel();

    if let Err(e) = run_handle.await? {
        error!("gateway terminated with an error: {}", e);
        return Err(e);
    }

    Ok(())
}
