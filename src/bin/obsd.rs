//! The observation daemon.
//!
//! Listens for one framed trame stream from a running simulation, feeds it
//! into an in-memory storage plugin, and reports the collected matrix on
//! shutdown. Exit code 0 on a clean end-of-stream, non-zero otherwise.

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use veld::observation::net::NetStreamReader;
use veld::observation::StoragePlugin;

/// Receives observation trames from a veld simulation.
#[derive(Parser)]
#[command(name = "obsd", version, about)]
struct Opt {
    /// TCP port to listen on.
    #[arg(long, default_value_t = 8090)]
    port: u16,

    /// Detach and keep running in the background.
    #[arg(long)]
    daemon: bool,

    /// Log level, 0 (errors only) to 3 (trace).
    #[arg(short, long, default_value_t = 1)]
    verbose: u8,

    /// Print build information and exit.
    #[arg(long)]
    info: bool,
}

const DAEMON_MARKER: &str = "OBSD_DAEMONIZED";

fn main() -> ExitCode {
    let opt = Opt::parse();

    let level = match opt.verbose {
        0 => Level::ERROR,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("obsd: failed to install the log subscriber");
        return ExitCode::FAILURE;
    }

    if opt.info {
        println!("obsd - the veld observation daemon");
        println!("version: {}", env!("CARGO_PKG_VERSION"));
        println!("protocol: tag + u32 length + json payload");
        return ExitCode::SUCCESS;
    }

    if opt.daemon && std::env::var_os(DAEMON_MARKER).is_none() {
        return match respawn_detached() {
            Ok(()) => ExitCode::SUCCESS,
            Err(err) => {
                error!(%err, "failed to detach");
                ExitCode::FAILURE
            }
        };
    }

    let reader = match NetStreamReader::bind(opt.port) {
        Ok(reader) => reader,
        Err(err) => {
            error!(port = opt.port, %err, "cannot bind listener");
            return ExitCode::FAILURE;
        }
    };
    info!(port = opt.port, "listening for an observation stream");

    let mut storage = StoragePlugin::new();
    match reader.process(&mut storage) {
        Ok(()) => {
            info!(
                columns = storage.column_count(),
                rows = storage.row_count(),
                last_time = storage.last_time(),
                "stream complete"
            );
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(%err, "stream failed");
            ExitCode::FAILURE
        }
    }
}

/// Re-executes the current binary detached from the terminal.
fn respawn_detached() -> std::io::Result<()> {
    use std::process::{Command, Stdio};

    let exe = std::env::current_exe()?;
    let args: Vec<String> = std::env::args().skip(1).collect();
    let child = Command::new(exe)
        .args(args)
        .env(DAEMON_MARKER, "1")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()?;
    println!("obsd: detached as pid {}", child.id());
    Ok(())
}
