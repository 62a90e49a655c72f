use std::{
    net::SocketAddr,
    path::PathBuf,
    sync::{atomic::AtomicBool, Arc},
};

use clap::Parser;
use varserver_cli::DemoConfig;

/// Runs a demo Variable Server: a mock memory manager with a handful of
/// live variables, a ticking executive thread, and the real TCP
/// listener/registry from `varserver-core` and `varserver-net`.
#[derive(Parser, Debug)]
#[command(name = "varserver-demo", version, about)]
struct Args {
    /// Address to bind the client listener to.
    #[arg(long, default_value = "127.0.0.1:7000")]
    bind: SocketAddr,

    /// Executive clock resolution, in tics per second.
    #[arg(long, default_value_t = 1000.0)]
    tic_frequency: f64,

    /// Path to append each session's command log to, when a client turns
    /// logging on. Omit to disable logging entirely for this process.
    #[arg(long)]
    log: Option<PathBuf>,
}

fn main() {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let config = DemoConfig { bind: args.bind, tic_frequency: args.tic_frequency, log_path: args.log };

    let shutdown = Arc::new(AtomicBool::new(false));
    let ctrlc_shutdown = shutdown.clone();
    ctrlc::set_handler(move || {
        tracing::info!("varserver-demo: shutdown requested (SIGINT)");
        ctrlc_shutdown.store(true, std::sync::atomic::Ordering::SeqCst);
    })
    .expect("failed to install Ctrl-C handler");

    // ctrlc only covers SIGINT; SIGTERM (the signal a supervised process
    // actually receives) needs signal-hook directly.
    let sigterm_shutdown = shutdown.clone();
    unsafe {
        signal_hook::low_level::register(signal_hook::consts::SIGTERM, move || {
            sigterm_shutdown.store(true, std::sync::atomic::Ordering::SeqCst);
        })
        .expect("failed to install SIGTERM handler");
    }

    if let Err(err) = varserver_cli::run(config, shutdown) {
        tracing::error!(?err, "varserver-demo: fatal error");
        std::process::exit(1);
    }
}
