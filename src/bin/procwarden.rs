use clap::Parser;
use procwarden::pw::options::{ConfigError, ResourceError};

fn main() {
    let args = procwarden::pw::cli::Args::parse();

    let cfg = match procwarden::pw::options::load(&args) {
        Ok(cfg) => cfg,
        Err(e) => fail(e),
    };

    // Forking after the runtime exists is not safe; detach first.
    if !cfg.nodaemon {
        if let Err(e) = procwarden::pw::supervisor::daemonize(&cfg) {
            fail(e);
        }
    }

    // One thread, one event loop: every handler is cooperative and all
    // process state lives on the loop task.
    let rt = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => fail(anyhow::Error::new(e).context("building the runtime")),
    };

    match rt.block_on(procwarden::pw::supervisor::run_daemon(cfg, args)) {
        Ok(()) => {}
        Err(e) => fail(e),
    }
}

/// Exit codes: 2 for configuration errors, 3 for unmet resource limits,
/// 1 for any other fatal startup condition.
fn fail(e: anyhow::Error) -> ! {
    eprintln!("Error: {e:#}");
    let code = if e.downcast_ref::<ConfigError>().is_some() {
        2
    } else if e.downcast_ref::<ResourceError>().is_some() {
        3
    } else {
        1
    };
    std::process::exit(code);
}
