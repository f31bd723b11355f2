use std::panic::PanicHookInfo;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use kubelet::app::ApplicationBuilder;
use kubelet::config::Cli;
use kubelet::config::Commands;
use kubelet::config::DaemonArgs;
use kubelet::config::DecodeNameArgs;
use kubelet::container::naming::ContainerName;
use utils::logging;
use utils::version;

type PanicHook = Box<dyn Fn(&PanicHookInfo<'_>) + Sync + Send + 'static>;

/// Logs the panic through tracing before handing it to `default_hook`.
fn logging_panic_hook(default_hook: PanicHook) -> PanicHook {
    Box::new(move |panic_info| {
        tracing::error!("Thread panicked: {}", panic_info);
        default_hook(panic_info);
    })
}

/// Sets up global panic hooks.
fn setup_global_hooks() {
    std::panic::set_hook(logging_panic_hook(std::panic::take_hook()));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let cli = Cli::parse();

    match cli.command {
        Commands::Daemon(daemon_args) => run_daemon(daemon_args).await,
        Commands::DecodeName(decode_args) => run_decode_name(decode_args),
    }
}

async fn run_daemon(daemon_args: DaemonArgs) -> Result<()> {
    let _guard = logging::init(daemon_args.log_path.as_deref())?;

    tracing::info!("Starting kubelet daemon {}", &**version::VERSION);

    let app = ApplicationBuilder::new(daemon_args).build()?;

    app.run().await?;
    app.shutdown().await?;

    Ok(())
}

fn run_decode_name(decode_args: DecodeNameArgs) -> Result<()> {
    let name = ContainerName::parse(&decode_args.name)
        .with_context(|| format!("{} is not a container managed by this agent", decode_args.name))?;

    println!("container: {}", name.container_name);
    println!("hash:      {:x}", name.hash);
    println!("pod:       {}", name.pod_full_name());
    println!("uid:       {}", name.pod_uid);
    println!("suffix:    {}", name.suffix);
    Ok(())
}
