//! tsnet-bridge CLI.
//!
//! `worker` serves the control protocol on stdin for a spawning parent.
//! `echo` brings a node up and echoes every connection it accepts.

use std::io;
use std::os::unix::io::AsFd;
use std::os::unix::net::UnixStream;
use std::thread;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tsnet_bridge::control::ControlWorker;
use tsnet_bridge::readiness::accept_ready;
use tsnet_bridge::{Bridge, Config, Handle, LocalNet};

#[derive(Parser)]
#[command(name = "tsnet-bridge")]
#[command(version)]
#[command(about = "Hand connected tailnet sockets across process boundaries")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the control protocol on stdin (spawned by a parent process)
    Worker,
    /// Listen on the tailnet and echo every connection back to its sender
    Echo {
        /// Tailnet listen address, e.g. ":8081"
        #[arg(long)]
        listen: String,
        /// Hostname for the node (overrides config)
        #[arg(long)]
        hostname: Option<String>,
        /// Accept through readiness polling instead of blocking accept
        #[arg(long)]
        nonblocking: bool,
    },
}

fn init_logging() -> Result<()> {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    builder.format_timestamp_secs();
    // stdin/stdout may be the control pipe; logs go to stderr or a file.
    if let Ok(path) = std::env::var("TSNET_BRIDGE_LOG_FILE") {
        let log_file = std::fs::File::create(&path)
            .with_context(|| format!("create log file {path}"))?;
        builder.target(env_logger::Target::Pipe(Box::new(log_file)));
    } else {
        builder.target(env_logger::Target::Stderr);
    }
    builder.init();
    Ok(())
}

fn main() -> Result<()> {
    init_logging()?;
    let cli = Cli::parse();

    match cli.command {
        Commands::Worker => run_worker(),
        Commands::Echo {
            listen,
            hostname,
            nonblocking,
        } => run_echo(&listen, hostname.as_deref(), nonblocking),
    }
}

fn run_worker() -> Result<()> {
    let stdin = io::stdin()
        .as_fd()
        .try_clone_to_owned()
        .context("duplicate stdin")?;
    let pipe = UnixStream::from(stdin);
    let worker =
        ControlWorker::new(Bridge::with_runtime(LocalNet::new())).with_config(Config::load()?);
    worker.serve(pipe)
}

fn run_echo(listen: &str, hostname: Option<&str>, nonblocking: bool) -> Result<()> {
    let bridge = Bridge::default();
    let server = bridge.new_server();
    bridge.apply_config(server, &Config::load()?)?;
    if let Some(hostname) = hostname {
        bridge.set_hostname(server, hostname)?;
    }
    bridge.up(server)?;
    let listener = bridge.listen(server, "tcp", listen)?;
    println!("Listening on {} ({listen})", bridge.getips(server, 256)?);

    if nonblocking {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("build tokio runtime")?;
        loop {
            let conn = rt.block_on(accept_ready(&bridge, listener))?;
            spawn_echo(&bridge, listener, conn)?;
        }
    }

    loop {
        let conn = bridge.accept(listener)?;
        spawn_echo(&bridge, listener, conn)?;
    }
}

fn spawn_echo(bridge: &Bridge<LocalNet>, listener: Handle, conn: Handle) -> Result<()> {
    let peer = bridge
        .getremoteaddr(listener, conn, 64)
        .unwrap_or_else(|_| "unknown".to_owned());
    log::info!("[echo] conn {conn} from {peer}");
    let socket = socket2::Socket::from(bridge.take_conn(conn)?);
    thread::Builder::new()
        .name(format!("echo-{conn}"))
        .spawn(move || {
            let copied = socket
                .try_clone()
                .and_then(|mut reader| io::copy(&mut reader, &mut &socket));
            match copied {
                Ok(n) => log::info!("[echo] conn {conn} done after {n} bytes"),
                Err(e) => log::warn!("[echo] conn {conn}: {e}"),
            }
        })
        .context("spawn echo thread")?;
    Ok(())
}
