//! Lendset replicated library server process.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use lendset::{logger_init, pf_error, ClusterConfig, LendsetError, LibraryReplica};
use log::{self, LevelFilter};
use tokio::runtime::Builder;
use tokio::sync::watch;

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Port to listen on for clients and peers. Must match one of the
    /// addresses in the cluster file, which fixes this process's ID.
    port: u16,

    /// Cluster configuration file.
    #[arg(long, default_value = ".serverConfig.dat")]
    cluster_file: PathBuf,

    /// Tuning knobs in TOML format, e.g. 'poll_timeout_ms=50+require_acks=false'.
    #[arg(long)]
    config: Option<String>,

    /// Default logging level; `RUST_LOG` takes precedence.
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl CliArgs {
    /// Sanitize command line arguments, return `Ok(())` on success
    /// or `Err(LendsetError)` on any error.
    fn sanitize(&self) -> Result<(), LendsetError> {
        if self.port <= 1024 {
            Err(LendsetError::msg(format!("invalid port {}", self.port)))
        } else if self.log_level.parse::<LevelFilter>().is_err() {
            Err(LendsetError::msg(format!(
                "invalid log level '{}'",
                self.log_level
            )))
        } else {
            Ok(())
        }
    }
}

/// Actual main function of Lendset server process.
fn server_main(args: CliArgs) -> Result<(), LendsetError> {
    args.sanitize()?;

    // read in the cluster configuration; failure here is fatal
    let cluster = ClusterConfig::from_file(&args.cluster_file)?;

    // '+' stands for newline in the TOML config string
    let config_str = args.config.as_ref().map(|s| s.replace('+', "\n"));

    // set up termination signals handler
    let (tx_term, rx_term) = watch::channel(false);
    ctrlc::set_handler(move || {
        if let Err(e) = tx_term.send(true) {
            pf_error!("error sending to term channel: {}", e);
        }
    })?;

    let log_level = log::max_level();
    {
        // everything runs on one thread
        let runtime = Builder::new_current_thread().enable_all().build()?;

        // enter tokio runtime, setup the replica, and start the main event
        // loop logic
        runtime.block_on(async move {
            let mut replica = LibraryReplica::new_and_setup(
                args.port,
                cluster,
                config_str.as_deref(),
                rx_term,
            )
            .await?;

            replica.run().await?;

            // suppress logging before dropping the runtime to avoid spurious
            // error messages
            log::set_max_level(LevelFilter::Off);

            Ok::<(), LendsetError>(()) // give type hint for this async closure
        })?;
    } // drop the runtime here

    log::set_max_level(log_level);
    Ok(())
}

/// Main function of Lendset server process.
fn main() -> ExitCode {
    // a missing port is reported by clap with usage and exit code 2
    let args = CliArgs::parse();
    logger_init(&args.log_level);

    if let Err(ref e) = server_main(args) {
        pf_error!("server_main exited: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
