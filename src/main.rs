use std::process::ExitCode;

use rpttail::{InvalidUtf8, Printer, WatchTarget};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    // Diagnostics go to stderr so they never interleave with tailed content.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let mut printer = Printer::new(tokio::io::stdout(), InvalidUtf8::default());

    if let Err(e) = printer.title().await {
        tracing::error!(error = %e, "failed to write to stdout");
        return ExitCode::FAILURE;
    }

    let target = match WatchTarget::from_env() {
        Ok(target) => target,
        Err(e) => {
            let _ = printer.fatal(&e).await;
            return ExitCode::FAILURE;
        }
    };
    tracing::debug!(?target, "resolved watch target");

    let shutdown = CancellationToken::new();
    let on_interrupt = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => on_interrupt.cancel(),
            Err(e) => tracing::error!(error = %e, "failed to listen for Ctrl+C"),
        }
    });

    match rpttail::run(&target, &mut printer, &shutdown).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "failed to write to stdout");
            ExitCode::FAILURE
        }
    }
}
