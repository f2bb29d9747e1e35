use anyhow::anyhow;
use anyhow::Result;
use clap::Parser;
use gpu_arbiter::app::ApplicationBuilder;
use gpu_arbiter::classifier::ProcessPatterns;
use gpu_arbiter::config::Cli;
use gpu_arbiter::config::Commands;
use gpu_arbiter::config::DaemonArgs;
use gpu_arbiter::config::ProbeArgs;
use gpu_arbiter::logging;
use gpu_arbiter::probe::ProbeReport;
use gpu_arbiter::telemetry;
use gpu_arbiter::unit::CommandUnit;
use utils::version;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let cli = Cli::parse();

    match cli.command {
        Commands::Daemon(daemon_args) => run_daemon(*daemon_args).await,
        Commands::Probe(probe_args) => run_probe(probe_args).await,
    }
}

async fn run_daemon(daemon_args: DaemonArgs) -> Result<()> {
    let _guard = logging::init(&daemon_args.log_file);

    tracing::info!(
        "Starting gpu-arbiter daemon {} (branch {})",
        &**version::VERSION,
        version::branch()
    );

    let app = ApplicationBuilder::new(daemon_args).build().await?;

    app.run().await?;
    app.shutdown().await;

    Ok(())
}

async fn run_probe(probe_args: ProbeArgs) -> Result<()> {
    utils::logging::init();

    let unit = CommandUnit::new(
        probe_args.unit.unit_backend,
        probe_args.unit.transition_timeout(),
    );
    let telemetry = telemetry::connect(probe_args.gpu.telemetry)
        .map_err(|e| anyhow!("Failed to initialize GPU telemetry: {e:?}"))?;
    let patterns = ProcessPatterns::from(&probe_args.gpu);

    let report = ProbeReport::collect(
        &unit,
        probe_args.unit.unit_id.trim(),
        telemetry.as_ref(),
        &patterns,
    )
    .await;
    print!("{report}");

    Ok(())
}
