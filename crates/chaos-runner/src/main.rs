use anyhow::{Context, Result};
use chaos_core::{AbortSignal, ChaosInterval, ChaosResult, Sequence};
use chaos_runner::settings::{self, Overrides};
use chaos_runner::{abort_after, prepare, LaunchOptions, Mode, SimulatorConfig};
use clap::parser::ValueSource;
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

fn cli() -> Command {
    Command::new("chaos-runner")
        .version(chaos_core::VERSION)
        .about("Chaos injection orchestrator over a simulated cluster")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .global(true)
                .default_value("info")
                .help("Log filter used when RUST_LOG is not set"),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .global(true)
                .default_value("text")
                .value_parser(["text", "json"])
                .help("Log line format"),
        )
        .subcommand(
            Command::new("run")
                .about("Run one experiment")
                .arg(
                    Arg::new("config")
                        .long("config")
                        .value_parser(value_parser!(PathBuf))
                        .help("Experiment config file (.toml, .yaml or .json)"),
                )
                .arg(
                    Arg::new("mode")
                        .long("mode")
                        .default_value("instance")
                        .value_parser(["instance", "helper"])
                        .help("Stop instances, or run helper workers against pods"),
                )
                .arg(
                    Arg::new("targets")
                        .long("targets")
                        .default_value("3")
                        .value_parser(value_parser!(usize))
                        .help("Instances or pods in the simulated cluster"),
                )
                .arg(
                    Arg::new("nodes")
                        .long("nodes")
                        .default_value("2")
                        .value_parser(value_parser!(usize))
                        .help("Nodes the pods are spread over"),
                )
                .arg(
                    Arg::new("fail-ready")
                        .long("fail-ready")
                        .value_parser(value_parser!(usize))
                        .help("Index of a helper worker that never becomes ready"),
                )
                .arg(
                    Arg::new("abort-after")
                        .long("abort-after")
                        .value_parser(value_parser!(u64))
                        .help("Abort the run after this many seconds"),
                )
                .arg(
                    Arg::new("seed")
                        .long("seed")
                        .value_parser(value_parser!(u64))
                        .help("Fixed target selection seed"),
                )
                .arg(Arg::new("name").long("name").help("Experiment name"))
                .arg(
                    Arg::new("duration")
                        .long("duration")
                        .value_parser(value_parser!(u64))
                        .help("Total chaos duration in seconds"),
                )
                .arg(
                    Arg::new("interval")
                        .long("interval")
                        .help("Chaos interval in seconds, fixed (10) or a range (5-15)"),
                )
                .arg(
                    Arg::new("ramp-time")
                        .long("ramp-time")
                        .value_parser(value_parser!(u64))
                        .help("Ramp time before and after chaos, in seconds"),
                )
                .arg(
                    Arg::new("sequence")
                        .long("sequence")
                        .value_parser(["serial", "parallel", "random"])
                        .help("Injection sequence"),
                )
                .arg(
                    Arg::new("percentage")
                        .long("percentage")
                        .value_parser(value_parser!(u8))
                        .help("Percentage of targets to affect (0 means one, above 100 means all)"),
                )
                .arg(
                    Arg::new("json")
                        .long("json")
                        .action(ArgAction::SetTrue)
                        .help("Print the result as JSON"),
                ),
        )
        .subcommand(
            Command::new("simulate")
                .about("Run seeded random experiments and check invariants")
                .arg(
                    Arg::new("runs")
                        .long("runs")
                        .default_value("200")
                        .value_parser(value_parser!(u64))
                        .help("Number of experiments to run"),
                )
                .arg(
                    Arg::new("seed")
                        .long("seed")
                        .default_value("42")
                        .value_parser(value_parser!(u64))
                        .help("Random seed for reproducibility"),
                )
                .arg(
                    Arg::new("stop-on-violation")
                        .long("stop-on-violation")
                        .action(ArgAction::SetTrue)
                        .help("Stop at the first violating run"),
                )
                .arg(
                    Arg::new("json")
                        .long("json")
                        .action(ArgAction::SetTrue)
                        .help("Print the report as JSON"),
                ),
        )
}

fn main() {
    let matches = cli().get_matches();

    let code = match matches.subcommand() {
        Some(("run", args)) => {
            init_tracing(args, "info");
            run(args)
        }
        Some(("simulate", args)) => {
            // one line per run drowns the report; opt in with --log-level
            init_tracing(args, "off");
            simulate(args)
        }
        _ => Ok(0),
    };

    std::process::exit(code.unwrap_or_else(|e| {
        eprintln!("error: {e:#}");
        1
    }));
}

fn init_tracing(args: &ArgMatches, default_level: &str) {
    let level = match args.value_source("log-level") {
        Some(ValueSource::DefaultValue) | None => default_level,
        Some(_) => args.get_one::<String>("log-level").map_or(default_level, String::as_str),
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    if args.get_one::<String>("log-format").map(String::as_str) == Some("json") {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn run(args: &ArgMatches) -> Result<i32> {
    let overrides = Overrides {
        name: args.get_one::<String>("name").cloned(),
        duration: args.get_one::<u64>("duration").copied(),
        interval: args
            .get_one::<String>("interval")
            .map(|s| s.parse::<ChaosInterval>())
            .transpose()?,
        ramp_time: args.get_one::<u64>("ramp-time").copied(),
        sequence: args
            .get_one::<String>("sequence")
            .map(|s| s.parse::<Sequence>())
            .transpose()?,
        percentage: args.get_one::<u8>("percentage").copied(),
    };

    let path = args.get_one::<PathBuf>("config").map(PathBuf::as_path);
    let config = settings::load(path, &overrides).context("failed to load experiment settings")?;
    config.validate().context("invalid experiment settings")?;

    let options = LaunchOptions {
        mode: args
            .get_one::<String>("mode")
            .map(|s| s.parse::<Mode>())
            .transpose()?
            .unwrap_or_default(),
        targets: args.get_one::<usize>("targets").copied().unwrap_or(3),
        nodes: args.get_one::<usize>("nodes").copied().unwrap_or(2),
        fail_ready: args.get_one::<usize>("fail-ready").copied(),
        seed: args.get_one::<u64>("seed").copied(),
        ..LaunchOptions::default()
    };
    let abort_secs = args.get_one::<u64>("abort-after").copied();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start the async runtime")?;

    let result = runtime.block_on(async {
        let abort = AbortSignal::new();
        let launch = prepare(config, &options, &abort)?;

        let signals = tokio::spawn(forward_shutdown(abort.clone()));
        let timer = abort_secs.map(|secs| abort_after(&abort, Duration::from_secs(secs)));

        let result = launch.experiment.run(&abort).await;

        signals.abort();
        if let Some(timer) = timer {
            timer.abort();
        }
        anyhow::Ok(result)
    })?;

    if args.get_flag("json") {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_result(&result);
    }
    Ok(result.exit_code())
}

fn print_result(result: &ChaosResult) {
    println!("Experiment: {}", result.experiment);
    println!("Verdict: {}", result.verdict);
    println!("Phase: {}", result.phase);
    println!("Rounds: {}", result.rounds);
    if let Some(step) = &result.fail_step {
        println!("Fail step: {step}");
    }
    if let Some(code) = &result.error_code {
        println!("Error code: {code}");
    }
    if let Some(report) = &result.abort {
        println!(
            "Abort: {} reverted, {} failed",
            report.reverted.len(),
            report.failed.len()
        );
    }
    println!("Targets:");
    for target in &result.targets {
        println!("  {} ({}): {}", target.id, target.kind, target.status);
    }
}

fn simulate(args: &ArgMatches) -> Result<i32> {
    let config = SimulatorConfig {
        seed: args.get_one::<u64>("seed").copied().unwrap_or(42),
        runs: args.get_one::<u64>("runs").copied().unwrap_or(200),
        stop_on_first_violation: args.get_flag("stop-on-violation"),
    };

    println!("Running chaos simulator...");
    println!("Runs: {}", config.runs);
    println!("Seed: {}", config.seed);
    println!();

    let report = chaos_runner::simulate(config).context("failed to start the simulator runtime")?;

    if args.get_flag("json") {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", report.generate_text());
    }
    Ok(if report.passed() { 0 } else { 1 })
}

/// Trigger `abort` on SIGINT or SIGTERM
async fn forward_shutdown(abort: AbortSignal) {
    wait_for_shutdown_signal().await;
    if abort.trigger() {
        tracing::warn!("[Abort]: Shutdown signal received, reverting chaos");
    }
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => {}
                    _ = sigint.recv() => {}
                }
                return;
            }
            (Err(e), _) | (_, Err(e)) => {
                tracing::warn!(error = %e, "[Abort]: Could not register signal handlers, using Ctrl+C");
            }
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "[Abort]: Failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
}
