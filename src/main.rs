use clap::Parser;
use std::panic::{self, PanicHookInfo};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use adm300_ctl::app::{self, Options};
use adm300_ctl::session::{Session, SessionConfig};

/// Exit codes for the application
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_PANIC: i32 = 2;

fn init_tracing(debug: bool) {
    let default = if debug { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    // Set up panic hook to ensure clean exit codes for process managers
    // that monitor exit status
    panic::set_hook(Box::new(move |info: &PanicHookInfo| {
        eprintln!("Panic! {}", info);
        std::process::exit(EXIT_PANIC);
    }));

    let options = Options::parse();
    init_tracing(options.debug);

    // Failure to open the device is the only fatal startup error
    let config = SessionConfig {
        device: options.dev.clone(),
        raw_mode: options.raw_mode(),
    };
    let mut session = match Session::begin(&config) {
        Ok(session) => session,
        Err(why) => {
            eprintln!("error: {}", why);
            std::process::exit(EXIT_ERROR);
        }
    };

    // Ctrl-C flips the shutdown channel; the orchestrator treats it as
    // normal termination and falls through to teardown.
    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        let _ = stop_tx.send(true);
    });

    let result = app::run_with_io(
        &options,
        &mut session,
        stop_rx,
        &mut std::io::stdout(),
        &mut std::io::stderr(),
    )
    .await;

    session.kill();

    match result {
        Ok(()) => std::process::exit(EXIT_SUCCESS),
        Err(why) => {
            eprintln!("error: {}", why);
            std::process::exit(EXIT_ERROR);
        }
    }
}
