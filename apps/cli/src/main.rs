use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;
use usbshare_client_script::{render_batch, write_batch};
use usbshare_core::{HostConfig, HostProbe, MemoryStore};
use usbshare_host_linux::{DryRunHost, LinuxHost};
use usbshare_report::{create_report_bundle, file_digest};
use usbshare_workflow_engine::{Orchestrator, RunReport, Stores};

#[derive(Parser, Debug)]
#[command(name = "usbshare")]
#[command(about = "Mount USB drives, share them over SMB and advertise the host")]
struct Cli {
    /// JSON configuration overriding the compiled-in defaults
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(flatten)]
    setup: SetupArgs,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the full setup (the default)
    Setup(SetupArgs),
    /// List block devices as JSON
    Devices {
        #[arg(long)]
        pretty: bool,
    },
    /// Resolve one device to its UUID and filesystem
    Resolve { device: PathBuf },
    /// Render the Windows drive-mapping script
    ClientScript {
        /// Write to this file instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Print the effective configuration
    Config,
}

#[derive(Args, Debug, Clone, Default)]
struct SetupArgs {
    /// Probe the host but change nothing
    #[arg(long)]
    dry_run: bool,

    /// Write a report bundle under this directory
    #[arg(long)]
    report_base: Option<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = HostConfig::load_or_default(cli.config.as_deref())?;
    match cli.command {
        None => setup(config, &cli.setup),
        Some(Command::Setup(args)) => setup(config, &args),
        Some(Command::Devices { pretty }) => {
            let devices = LinuxHost::new().list_block_devices()?;
            if pretty {
                println!("{}", serde_json::to_string_pretty(&devices)?);
            } else {
                println!("{}", serde_json::to_string(&devices)?);
            }
            Ok(())
        }
        Some(Command::Resolve { device }) => {
            let resolved = LinuxHost::new().resolve_device(&device)?;
            println!("{}", serde_json::to_string_pretty(&resolved)?);
            Ok(())
        }
        Some(Command::ClientScript { output }) => match output {
            Some(path) => {
                write_batch(&config, &path)?;
                println!("client script: {}", path.display());
                Ok(())
            }
            None => {
                print!("{}", render_batch(&config)?);
                Ok(())
            }
        },
        Some(Command::Config) => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn init_logging(verbose: bool) {
    let directives = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    tracing_subscriber::fmt()
        .with_env_filter(log_filter(verbose, directives.as_deref()))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// `RUST_LOG` directives win; the `-v` level applies only when there are none.
fn log_filter(verbose: bool, directives: Option<&str>) -> EnvFilter {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    EnvFilter::builder()
        .with_default_directive(level.into())
        .parse_lossy(directives.unwrap_or(""))
}

fn setup(config: HostConfig, args: &SetupArgs) -> Result<()> {
    let digests_before = digests(&config);

    let report = if args.dry_run {
        dry_run(&config)?
    } else {
        let mut host = LinuxHost::new();
        let mut orch = Orchestrator::new(config.clone(), &mut host, Stores::from_config(&config));
        orch.run()
    };

    print!("{}", report.summary_text());

    if let Some(base) = &args.report_base {
        let mut meta = report.to_meta();
        meta["digests"] = serde_json::json!({
            "before": digests_before,
            "after": digests(&config),
        });
        let paths = create_report_bundle(base, &report.devices, Some(meta), Some(&report.logs.join("\n")))?;
        info!(root = %paths.root.display(), "report written");
        println!("report_root: {}", paths.root.display());
    }

    match report.error() {
        None => Ok(()),
        Some(err) => Err(anyhow!("setup failed ({}): {}", err.kind(), err)),
    }
}

fn dry_run(config: &HostConfig) -> Result<RunReport> {
    let stores = Stores::snapshot(config).context("snapshot host files")?;
    let fstab_len = stored_len(stores.mount_table.store());
    let smb_len = stored_len(stores.share_table.store());

    let mut host = DryRunHost::new(LinuxHost::new());
    let mut orch = Orchestrator::new(config.clone(), &mut host, stores).dry_run(true);
    let report = orch.run();
    let stores = orch.into_stores();

    for action in host.planned() {
        println!("would run: {}", action);
    }
    print_appended(&config.fstab_path, stores.mount_table.store(), fstab_len);
    print_appended(&config.smb_conf_path, stores.share_table.store(), smb_len);
    Ok(report)
}

fn stored_len(store: &MemoryStore) -> usize {
    store.contents().map(str::len).unwrap_or(0)
}

fn print_appended(path: &Path, store: &MemoryStore, from: usize) {
    let appended = store.contents().and_then(|text| text.get(from..)).unwrap_or("");
    if !appended.is_empty() {
        println!("would append to {}:", path.display());
        for line in appended.lines() {
            println!("  | {}", line);
        }
    }
}

fn digests(config: &HostConfig) -> serde_json::Value {
    serde_json::json!({
        "fstab": file_digest(&config.fstab_path),
        "smb_conf": file_digest(&config.smb_conf_path),
    })
}
