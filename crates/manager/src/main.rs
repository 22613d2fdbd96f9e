use anyhow::Result;
use clap::Parser;

use vgpu_manager::app;
use vgpu_manager::config::Cli;
use vgpu_manager::config::Commands;
use vgpu_manager::config::Config;
use vgpu_manager::config::ShowTopologyArgs;
use vgpu_manager::driver::Driver;
use vgpu_manager::driver::DummyDriver;
use vgpu_manager::driver::NvidiaDriver;
use vgpu_manager::logging;
use vgpu_manager::topology::GpuTree;

fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("thread panicked: {panic_info}");
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();
    setup_global_hooks();

    let cli = Cli::parse();
    match cli.command {
        Commands::Daemon(args) => run_daemon(*args).await,
        Commands::ShowTopology(args) => run_show_topology(args),
    }
}

async fn run_daemon(args: vgpu_manager::config::DaemonArgs) -> Result<()> {
    let config = Config::from_daemon_args(args)?;
    tracing::info!(node = %config.node_name, "starting vgpu-manager");

    let app = app::App::build(config).await?;
    app.run().await
}

fn run_show_topology(args: ShowTopologyArgs) -> Result<()> {
    let driver = match &args.device_topology_file {
        Some(path) => {
            let input = std::fs::read_to_string(path)?;
            Driver::Dummy(DummyDriver::from_matrix(&input, 1 << 30)?)
        }
        None => Driver::Nvidia(NvidiaDriver::init()?),
    };

    let tree = GpuTree::from_snapshot(&driver.snapshot()?)?;
    print!("{}", tree.print_graph());
    Ok(())
}
