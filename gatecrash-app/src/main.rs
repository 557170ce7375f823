use anyhow::Context;
use clap::Parser;
use gatecrash_common::observability::{init_logging, LogConfig};
use gatecrash_engine::{spawn_serializer, ScanInputs, Scanner};
use gatecrash_modules::TableSet;
use gatecrash_runtime::ScanRuntime;
use std::process::ExitCode;
use std::sync::Arc;

mod cli;
mod progress;
mod sinks;

use cli::Cli;

const EXIT_INPUT: u8 = 1;
const EXIT_RUNTIME: u8 = 2;

fn main() -> ExitCode {
    // Invalid flags are input errors, not clap's usage-error code.
    let args = match Cli::try_parse() {
        Ok(args) => args,
        Err(err) => {
            let _ = err.print();
            return ExitCode::from(EXIT_INPUT);
        }
    };

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(RunError::Input(err)) => {
            eprintln!("error: {err:#}");
            ExitCode::from(EXIT_INPUT)
        }
        Err(RunError::Runtime(err)) => {
            eprintln!("error: {err:#}");
            ExitCode::from(EXIT_RUNTIME)
        }
    }
}

enum RunError {
    Input(anyhow::Error),
    Runtime(anyhow::Error),
}

fn run(args: Cli) -> Result<(), RunError> {
    init_logging(LogConfig {
        emit_stderr: args.verbose,
        ..Default::default()
    })
    .map_err(RunError::Runtime)?;

    if args.update_payloads {
        let dir = args
            .payload_dir
            .clone()
            .unwrap_or_else(|| std::path::PathBuf::from("payloads"));
        TableSet::write_defaults(&dir)
            .context("updating payload tables")
            .map_err(RunError::Runtime)?;
        println!("payload tables written to {}", dir.display());
        if args.url.is_none() && args.url_list.is_none() && args.resend.is_none() {
            return Ok(());
        }
    }

    // Everything the user could have typed wrong resolves before the
    // runtime spins up.
    let cfg = args.scan_config().map_err(RunError::Input)?;
    let modules = args.selected_modules().map_err(RunError::Input)?;
    let inputs = ScanInputs {
        extra_hosts: args.substitute_hosts().map_err(RunError::Input)?,
        spoof_headers: args.spoof_headers.clone(),
        spoof_ips: args.spoof_ips.clone(),
    };
    let resend = args.resend.clone();
    if let Some(token) = &resend {
        // A mistyped token is an input error, caught before anything runs.
        gatecrash_payload::PayloadToken::decode(token)
            .context("invalid --resend token")
            .map_err(RunError::Input)?;
    }
    let targets = if resend.is_none() {
        args.targets().map_err(RunError::Input)?
    } else {
        Vec::new()
    };

    let tables = match &args.payload_dir {
        Some(dir) => TableSet::load_dir(dir),
        None => TableSet::embedded(),
    }
    .context("loading payload tables")
    .map_err(RunError::Runtime)?;

    let runtime = ScanRuntime::build(None)
        .context("building runtime")
        .map_err(RunError::Runtime)?;
    let handle = runtime.handle();
    handle.cancel_on_ctrl_c();
    let cancel = handle.cancellation();

    let outcome = runtime.block_on(async {
        let sink = sinks::open_sink(&args.output)
            .await
            .context("opening result sink")?;
        let (sink_handle, sink_task) = spawn_serializer(sink, 256);

        let scanner = Scanner::new(
            cfg,
            inputs,
            Arc::new(tables),
            sink_handle,
            cancel.child_token(),
        )?;
        tracing::info!(scan_id = scanner.scan_id(), "scan.start");

        let progress = progress::spawn(scanner.metrics(), cancel.child_token());

        let summary = match &resend {
            Some(token) => scanner.resend(token, args.resend_count.max(1)).await?,
            None => scanner.run(&targets, &modules).await?,
        };

        let stats = scanner.budgets().stats();
        drop(scanner); // releases the last sink handle
        sink_task.await.ok();
        cancel.cancel();
        progress.await.ok();

        println!(
            "done: {} module runs, {} dispatched, {} findings -> {}",
            summary.module_runs,
            summary.dispatched,
            summary.findings,
            args.output.display()
        );

        // Persisted order is arrival order; sorting happens at read time.
        if summary.findings > 0 && sinks::is_sqlite(&args.output) {
            let reader = sinks::SqliteSink::open(&args.output).await?;
            for f in reader.read_sorted().await? {
                println!(
                    "  {} {} {} {} [{}]",
                    f.status_code, f.method, f.raw_uri, f.module, f.debug_token
                );
            }
        }
        if stats.total > 0 {
            println!("errors: {} total", stats.total);
            for (kind, count) in &stats.per_kind {
                println!("  {kind}: {count}");
            }
            if !stats.blocked_hosts.is_empty() {
                println!("blocked hosts: {}", stats.blocked_hosts.join(", "));
            }
        }
        anyhow::Ok(())
    });

    runtime.shutdown(std::time::Duration::from_secs(2));
    outcome.map_err(RunError::Runtime)
}
