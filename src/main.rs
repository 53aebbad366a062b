//! ncloud-imager - Main entry point

use std::io::{self, BufRead, Write};
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use serde_json::{Value, json};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use ncloud_imager::cli::{Cli, Commands, overrides_layer};
use ncloud_imager::runner::BoundaryHook;
use ncloud_imager::{
    AssumeReachable, Builder, Config, NoopHook, ProcessGuard, ProvisionHook, ShellHook,
    SimulatedApi, StateBag, TcpProbeConnector, TracingUi, VERSION, process_guard,
};

/// Poll interval used against the simulator, which settles instantly.
const REHEARSAL_POLL_INTERVAL_MS: u64 = 50;

/// Initialize tracing; `RUST_LOG` overrides the default level
fn init_tracing(debug: bool) {
    let default = if debug { "info" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse_args();
    init_tracing(cli.debug);
    info!("ncloud-imager {} starting up", VERSION);

    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("✗ {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    match cli.command {
        Commands::Validate { config, overrides } => {
            let raws = load_layers(&config, &overrides, cli.debug, &[])?;
            match Config::from_raws(&raws) {
                Ok((config, warnings)) => {
                    print_warnings(&warnings);
                    println!(
                        "✓ Configuration is valid (os_type {}, image {})",
                        config.os_type,
                        config.image_name()
                    );
                    Ok(ExitCode::SUCCESS)
                }
                Err(err) => {
                    print_warnings(&err.warnings);
                    eprintln!("✗ Configuration is invalid:");
                    for problem in &err.problems {
                        eprintln!("  - {}", problem);
                    }
                    Ok(ExitCode::FAILURE)
                }
            }
        }
        Commands::Plan { config, overrides } => {
            let raws = load_layers(&config, &overrides, cli.debug, &[])?;
            let mut builder = Builder::with_api(
                Arc::new(SimulatedApi::new()),
                Arc::new(TcpProbeConnector::default()),
            );
            let warnings = builder.prepare(&raws)?;
            print_warnings(&warnings);
            let steps = builder.plan()?;
            if steps.is_empty() {
                println!("No steps: the build would produce no image.");
            }
            for (i, name) in steps.iter().enumerate() {
                println!("{:>2}. {}", i + 1, name);
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Rehearse {
            config,
            overrides,
            fail_at,
            exec,
        } => {
            let extra = [json!({ "poll_interval_ms": REHEARSAL_POLL_INTERVAL_MS })];
            let raws = load_layers(&config, &overrides, cli.debug, &extra)?;

            let api = Arc::new(SimulatedApi::new());
            if let Some(operation) = fail_at {
                info!("Injecting failure at {}", operation);
                api.fail_on(operation, "injected failure");
            }

            let mut builder = Builder::with_api(api.clone(), Arc::new(AssumeReachable))
                .with_boundary_hook(stdin_pause_hook());
            let warnings = builder.prepare(&raws)?;
            print_warnings(&warnings);

            if let Err(e) = process_guard::init_signal_handlers(builder.cancel_handle()) {
                warn!("Failed to initialize signal handlers: {}", e);
            }
            let _guard = ProcessGuard::new();
            debug!("Signal handlers initialized");

            let hook: Arc<dyn ProvisionHook> = if exec.is_empty() {
                Arc::new(NoopHook)
            } else {
                Arc::new(ShellHook::new(exec))
            };

            let result = builder.run(Arc::new(TracingUi), hook);

            if let Some(report) = builder.last_report() {
                println!();
                println!("Outcome:    {}", report.outcome);
                println!("Started:    {}", report.started.join(", "));
                if !report.cleaned_up.is_empty() {
                    println!("Rolled back: {}", report.cleaned_up.join(", "));
                }
                for failure in &report.cleanup_failures {
                    println!("Cleanup failure: {}", failure);
                }
            }
            let live = api.live_resources();
            if live.transient_count() > 0 {
                println!("⚠ Resources still allocated: {:?}", live);
            }

            match result {
                Ok(artifact) => {
                    println!("✓ {}", artifact);
                    Ok(ExitCode::SUCCESS)
                }
                Err(e) => {
                    eprintln!("✗ Build failed: {}", e);
                    Ok(ExitCode::FAILURE)
                }
            }
        }
    }
}

/// Configuration file, then caller layers, then `--set` overrides, then `--debug`.
fn load_layers(
    path: &Path,
    overrides: &[String],
    debug: bool,
    extra: &[Value],
) -> anyhow::Result<Vec<Value>> {
    let mut raws = vec![Config::load_raw(path)?];
    raws.extend_from_slice(extra);
    raws.push(overrides_layer(overrides).context("Invalid --set override")?);
    if debug {
        raws.push(json!({ "debug": true }));
    }
    Ok(raws)
}

fn print_warnings(warnings: &[String]) {
    for warning in warnings {
        eprintln!("⚠ {}", warning);
    }
}

/// Pause after each step until the operator presses Enter; `cancel` rolls the
/// build back.
fn stdin_pause_hook() -> BoundaryHook {
    Box::new(|step: &'static str, state: &StateBag| {
        print!("Step {} finished. Press Enter to continue or type 'cancel': ", step);
        let _ = io::stdout().flush();
        let mut line = String::new();
        match io::stdin().lock().read_line(&mut line) {
            Ok(0) | Err(_) => {}
            Ok(_) if line.trim().eq_ignore_ascii_case("cancel") => {
                state.cancel_token().cancel();
            }
            Ok(_) => {}
        }
    })
}
