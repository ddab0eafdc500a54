//! `cadenza`: render a project headlessly or run it against an audio
//! backend, then print what the engine measured.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use crossbeam_channel::{after, select, tick};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use cadenza_engine::{BackendKind, EngineConfig, HealthReport, Session};

const POLL_INTERVAL: Duration = Duration::from_millis(250);

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .try_init()
        .ok();

    let cli = Cli::parse();
    match cli.command {
        Commands::Render(args) => execute_render(args),
        Commands::Run(args) => execute_run(args),
        Commands::Info(args) => execute_info(args),
    }
}

#[derive(Parser)]
#[command(author, version, about = "Headless driver for the Cadenza engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Render a project on this thread as fast as possible.
    Render(RenderArgs),
    /// Play a project through an audio backend in real time.
    Run(RunArgs),
    /// Print the tracks and processing graph of a project.
    Info(SessionArgs),
}

#[derive(Args)]
struct SessionArgs {
    /// Project document to open. An empty project is used when omitted.
    #[arg(long)]
    project: Option<PathBuf>,
    /// Engine settings file. Defaults to the per-user config.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    sample_rate: Option<u32>,
    #[arg(long)]
    block_size: Option<usize>,
    /// Graph worker threads; 0 runs every node on the calling thread.
    #[arg(long)]
    workers: Option<usize>,
}

#[derive(Args)]
struct RenderArgs {
    #[command(flatten)]
    session: SessionArgs,
    /// Number of blocks to render.
    #[arg(long, conflicts_with = "seconds")]
    blocks: Option<u64>,
    /// Length to render in seconds.
    #[arg(long)]
    seconds: Option<f64>,
    /// Start position in samples.
    #[arg(long, default_value_t = 0)]
    from: u64,
    /// Save the project here after rendering.
    #[arg(long)]
    save: Option<PathBuf>,
}

#[derive(Args)]
struct RunArgs {
    #[command(flatten)]
    session: SessionArgs,
    #[arg(long, value_enum)]
    backend: Option<BackendArg>,
    #[arg(long, default_value_t = 5.0)]
    seconds: f64,
}

#[derive(Clone, Copy, ValueEnum)]
enum BackendArg {
    Jack,
    Cpal,
    Pulse,
    Dummy,
}

impl From<BackendArg> for BackendKind {
    fn from(value: BackendArg) -> Self {
        match value {
            BackendArg::Jack => BackendKind::Jack,
            BackendArg::Cpal => BackendKind::Cpal,
            BackendArg::Pulse => BackendKind::Pulse,
            BackendArg::Dummy => BackendKind::Dummy,
        }
    }
}

#[derive(Serialize)]
struct Summary {
    project: String,
    sample_rate: u32,
    block_size: usize,
    frames: u64,
    playhead: u64,
    cycles: u64,
    xruns: u64,
    node_crashes: u64,
    max_cycle_us: f64,
    peak: f32,
    graph_nodes: usize,
    graph_latency: u32,
    crashed: Vec<String>,
}

impl Summary {
    fn collect(session: &Session, peak: f32, crashed: Vec<String>) -> Self {
        let metrics = session.metrics();
        let graph = session.graph_info();
        Self {
            project: session.project().name.clone(),
            sample_rate: session.config().sample_rate,
            block_size: session.config().block_size,
            frames: metrics.frames_processed,
            playhead: session.transport().playhead,
            cycles: metrics.cycles,
            xruns: metrics.xruns,
            node_crashes: metrics.node_crashes,
            max_cycle_us: metrics.max_cycle_ns as f64 / 1_000.0,
            peak,
            graph_nodes: graph.as_ref().map_or(0, |info| info.nodes.len()),
            graph_latency: graph.as_ref().map_or(0, |info| info.total_latency),
            crashed,
        }
    }
}

fn load_config(args: &SessionArgs) -> Result<EngineConfig> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("failed to read engine config {}", path.display()))?,
        None => EngineConfig::load_or_default(),
    };
    if let Some(sample_rate) = args.sample_rate {
        config = config.with_sample_rate(sample_rate);
    }
    if let Some(block_size) = args.block_size {
        config = config.with_block_size(block_size);
    }
    if let Some(workers) = args.workers {
        config = config.with_worker_threads(Some(workers));
    }
    config
        .validate()
        .context("engine config is invalid")?;
    Ok(config)
}

fn open_session(args: &SessionArgs, config: EngineConfig) -> Result<Session> {
    match &args.project {
        Some(path) => Session::open_project(config, path)
            .with_context(|| format!("failed to open project {}", path.display())),
        None => Session::open(config).context("failed to create an empty session"),
    }
}

fn print_json(value: &impl Serialize) -> Result<()> {
    let text = serde_json::to_string_pretty(value).context("failed to encode output")?;
    println!("{text}");
    Ok(())
}

fn execute_render(args: RenderArgs) -> Result<()> {
    let config = load_config(&args.session)?;
    let block = config.block_size;
    let channels = config.output_channels;
    let blocks = match (args.blocks, args.seconds) {
        (Some(blocks), _) => blocks,
        (None, Some(seconds)) if seconds > 0.0 => {
            (seconds * f64::from(config.sample_rate) / block as f64).ceil() as u64
        }
        (None, Some(seconds)) => bail!("--seconds must be positive, got {seconds}"),
        (None, None) => 100,
    };

    let mut session = open_session(&args.session, config)?;
    session.locate(args.from);
    session.play().context("transport refused to start")?;
    info!(blocks, block, "rendering");

    let mut output = vec![0.0f32; block * channels];
    let mut peak = 0.0f32;
    let mut crashed = Vec::new();
    let poll_every = (POLL_INTERVAL.as_secs_f64() * f64::from(session.config().sample_rate) / block as f64)
        .max(1.0) as u64;
    for index in 0..blocks {
        session.render(&mut output, block)?;
        peak = output.iter().fold(peak, |peak, sample| peak.max(sample.abs()));
        if (index + 1) % poll_every == 0 {
            crashed.extend(session.poll_health()?.crashed);
        }
    }
    crashed.extend(session.poll_health()?.crashed);
    session.stop()?;

    if let Some(path) = &args.save {
        save(&mut session, path)?;
    }
    print_json(&Summary::collect(&session, peak, crashed))?;
    session.close().context("failed to shut the session down")
}

fn execute_run(args: RunArgs) -> Result<()> {
    let mut config = load_config(&args.session)?;
    if let Some(backend) = args.backend {
        config = config.with_backend(backend.into());
    }
    if !(args.seconds.is_finite() && args.seconds > 0.0) {
        bail!("--seconds must be positive, got {}", args.seconds);
    }

    let mut session = open_session(&args.session, config)?;
    session.start_backend().context("failed to start the audio backend")?;
    session.play().context("transport refused to start")?;

    let ticker = tick(POLL_INTERVAL);
    let deadline = after(Duration::from_secs_f64(args.seconds));
    let mut crashed = Vec::new();
    loop {
        select! {
            recv(ticker) -> _ => {
                let report: HealthReport = session.poll_health()?;
                crashed.extend(report.crashed);
            }
            recv(deadline) -> _ => break,
        }
    }

    session.stop()?;
    session.stop_backend().context("failed to stop the audio backend")?;
    crashed.extend(session.poll_health()?.crashed);
    print_json(&Summary::collect(&session, 0.0, crashed))?;
    session.close().context("failed to shut the session down")
}

#[derive(Serialize)]
struct TrackLine {
    id: String,
    name: String,
    kind: String,
    regions: usize,
    plugins: usize,
}

#[derive(Serialize)]
struct NodeLine {
    name: String,
    latency: u32,
    path_latency: u32,
}

#[derive(Serialize)]
struct InfoOutput {
    project: String,
    tracks: Vec<TrackLine>,
    nodes: Vec<NodeLine>,
    connections: usize,
    total_latency: u32,
}

fn execute_info(args: SessionArgs) -> Result<()> {
    let config = load_config(&args)?;
    let session = open_session(&args, config)?;
    let tracks = session
        .tracks()
        .iter()
        .map(|track| TrackLine {
            id: track.id.to_string(),
            name: track.name.clone(),
            kind: format!("{:?}", track.kind),
            regions: track.regions().count(),
            plugins: track.channel().map_or(0, |channel| channel.plugins().count()),
        })
        .collect();
    let graph = session
        .graph_info()
        .context("the session has no processing graph")?;
    let output = InfoOutput {
        project: session.project().name.clone(),
        tracks,
        nodes: graph
            .nodes
            .iter()
            .map(|node| NodeLine {
                name: node.name.clone(),
                latency: node.latency,
                path_latency: node.path_latency,
            })
            .collect(),
        connections: graph.connections,
        total_latency: graph.total_latency,
    };
    print_json(&output)?;
    session.close().context("failed to shut the session down")
}

fn save(session: &mut Session, path: &Path) -> Result<()> {
    session
        .save(path)
        .with_context(|| format!("failed to save project to {}", path.display()))
}
