//! rpc-server binary.

use clap::Parser;
use server::config::Config;
use server::{Summary, logging, metrics, signal};
use std::path::PathBuf;
use std::time::Instant;

#[derive(Parser)]
#[command(name = "rpc-server")]
#[command(about = "Completion-queue RPC server with an in-process load client")]
struct Args {
    /// Path to configuration file
    config: Option<PathBuf>,

    /// Print default configuration and exit
    #[arg(long)]
    print_config: bool,
}

fn main() {
    let args = Args::parse();

    if args.print_config {
        print_default_config();
        return;
    }

    let config = match &args.config {
        Some(path) => match Config::load(path) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("Failed to load config: {}", e);
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };

    logging::init(&config.logging);

    if let Err(e) = run(config) {
        tracing::error!(error = %e, "run failed");
        std::process::exit(1);
    }
}

fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let shutdown = signal::install_signal_handler()?;

    let start = Instant::now();
    let summary = server::run(&config, shutdown)?;
    let elapsed = start.elapsed();

    log_summary(&config, &summary);
    tracing::info!(elapsed_ms = elapsed.as_millis() as u64, "run complete");

    if let Some(cap) = config.server.max_concurrent_streams
        && summary.peak_active > cap
    {
        return Err(format!(
            "peak active calls {} exceeded max_concurrent_streams {}",
            summary.peak_active, cap
        )
        .into());
    }
    Ok(())
}

fn log_summary(config: &Config, summary: &Summary) {
    tracing::info!(
        issued = summary.issued,
        handled = summary.handled,
        finished = summary.finished_total(),
        peak_active = summary.peak_active,
        max_concurrent_streams = ?config.server.max_concurrent_streams,
        interrupted = summary.interrupted,
        "summary"
    );
    for (code, count) in summary.by_code() {
        tracing::info!(code = code.as_str(), count, "calls finished");
    }
    for (name, reading) in metrics::snapshot("grpc_") {
        tracing::info!(metric = %name, value = %reading, "engine metric");
    }
}

fn print_default_config() {
    let config = r#"# rpc-server configuration

[server]
# Maximum simultaneously active calls. Invocations beyond the cap wait
# in arrival order. Omit for unbounded.
max_concurrent_streams = 1

[workers]
# Handler threads looping on request_call
threads = 2

[load]
# Total calls issued by the in-process client
calls = 1000
# Client threads, each with one call in flight
threads = 4
# Methods called round-robin
methods = ["/alpha", "/beta"]
authority = "localhost"
# Per-call deadline in milliseconds
deadline_ms = 5000
# Status handlers answer with, e.g. "OK", "UNIMPLEMENTED"
response_code = "OK"
response_message = ""

[logging]
# Log level: "error", "warn", "info", "debug", "trace"
# Can be overridden with RUST_LOG environment variable
level = "info"
# Log format: "pretty" (human-readable), "json", or "compact"
format = "pretty"
# Include timestamps
timestamps = true
# Include thread names
thread_names = false
# Include module target
target = true
"#;
    print!("{}", config);
}
