use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use scroll_genius::config::AppConfig;
use scroll_genius::container;
use scroll_genius::ids::IdAllocator;
use scroll_genius::listener::ScrollTracker;
use scroll_genius::page::{self, PageSnapshot};
use scroll_genius::server::{self, AppState};
use scroll_genius::settings::{DEFAULT_THRESHOLDS, GenerateRequest, ListenerParams};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "scroll-genius", version, about = "Scroll-depth tag-manager container generator")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve `POST /api/generate`.
    Serve,
    /// Print a container for the given settings.
    Generate(GenerateArgs),
    /// Replay scroll offsets against a static page and print the data-layer events.
    Simulate(SimulateArgs),
}

#[derive(Debug, Args)]
struct GenerateArgs {
    /// Settings file (`.toml` or `.json`); flags override its values.
    #[arg(long)]
    settings: Option<PathBuf>,
    #[arg(long)]
    measurement_id: Option<String>,
    #[arg(long)]
    event_name: Option<String>,
    #[arg(long)]
    thresholds: Option<String>,
    #[arg(long)]
    selectors: Option<String>,
    #[arg(long)]
    no_spa_fix: bool,
    #[arg(long)]
    ajax_forms: bool,
    #[arg(long)]
    premium: bool,
    /// Fixed identifier base instead of the clock.
    #[arg(long)]
    id_base: Option<u64>,
}

#[derive(Debug, Args)]
struct SimulateArgs {
    /// HTML snapshot carrying `data-*` heights.
    #[arg(long)]
    page: PathBuf,
    #[arg(long, default_value = DEFAULT_THRESHOLDS)]
    thresholds: String,
    #[arg(long, default_value = "")]
    selectors: String,
    #[arg(long)]
    no_spa_fix: bool,
    /// Overrides the snapshot's viewport height.
    #[arg(long)]
    viewport: Option<f64>,
    /// Comma-separated scroll offsets in pixels, or `nav` for a route change.
    #[arg(long)]
    steps: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    match cli.command {
        Command::Serve => serve().await,
        Command::Generate(args) => generate(args),
        Command::Simulate(args) => simulate(args),
    }
}

async fn serve() -> anyhow::Result<()> {
    let config = AppConfig::from_env()?;
    let addr = config.bind_addr;
    tracing::info!(%addr, cors = config.enable_cors, "starting scroll-genius server");
    server::run(addr, AppState::new(config)).await
}

fn generate(args: GenerateArgs) -> anyhow::Result<()> {
    let mut request = match &args.settings {
        Some(path) => GenerateRequest::from_file(path)?,
        None => GenerateRequest::default(),
    };
    if args.measurement_id.is_some() {
        request.measurement_id = args.measurement_id;
    }
    if args.event_name.is_some() {
        request.event_name = args.event_name;
    }
    if args.thresholds.is_some() {
        request.thresholds = args.thresholds;
    }
    if args.selectors.is_some() {
        request.selectors = args.selectors;
    }
    if args.no_spa_fix {
        request.spa_fix = Some(false);
    }
    if args.ajax_forms {
        request.ajax_forms = Some(true);
    }
    if args.premium {
        request.premium = Some(true);
    }

    let settings = request.into_settings()?;
    let ids = match args.id_base {
        Some(base) => IdAllocator::with_base(base).context("invalid --id-base")?,
        None => IdAllocator::from_clock(),
    };
    let export = container::build(&settings, &ids);
    export.verify().context("generated container is inconsistent")?;
    println!("{}", serde_json::to_string_pretty(&export)?);
    Ok(())
}

fn simulate(args: SimulateArgs) -> anyhow::Result<()> {
    let html = std::fs::read_to_string(&args.page)
        .with_context(|| format!("reading page {}", args.page.display()))?;
    let mut snapshot = PageSnapshot::parse(&html)?;
    if let Some(viewport) = args.viewport {
        snapshot = snapshot.with_viewport(viewport);
    }
    let steps = page::parse_steps(&args.steps)?;
    let mut tracker = ScrollTracker::new(&ListenerParams {
        thresholds: args.thresholds,
        exclusions: args.selectors,
        nav_fix: !args.no_spa_fix,
    });
    tracing::debug!(thresholds = ?tracker.thresholds(), exclusions = ?tracker.exclusions(), "simulating");
    for event in page::simulate(&mut tracker, &mut snapshot, &steps) {
        println!("{}", serde_json::to_string(&event)?);
    }
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .try_init();
}
