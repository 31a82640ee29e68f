//! Lendset interactive library client.

use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use color_print::{cprint, cprintln};
use lendset::{logger_init, pf_error, ClientConfig, LendsetError, LibraryClient};
use log::{self, LevelFilter};
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::runtime::Builder;
use tokio::sync::watch;
use tokio::time::Duration;

/// Prompt string at the start of line.
const PROMPT: &str = ">>>>> ";

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Client configuration file listing the servers.
    #[arg(long, default_value = ".clientConfig.dat")]
    config_file: PathBuf,

    /// How long to wait for a reply, in millisecs.
    #[arg(long, default_value_t = 5000)]
    timeout_ms: u64,

    /// Default logging level; `RUST_LOG` takes precedence.
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl CliArgs {
    /// Sanitize command line arguments, return `Ok(())` on success
    /// or `Err(LendsetError)` on any error.
    fn sanitize(&self) -> Result<(), LendsetError> {
        if self.timeout_ms == 0 {
            Err(LendsetError::msg(format!(
                "invalid timeout {} ms",
                self.timeout_ms
            )))
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

/// Recognizable REPL input kinds.
#[derive(Debug, PartialEq, Eq)]
enum ReplCommand {
    /// Line sent verbatim to the server.
    Normal(String),

    /// Reconnect to a (possibly different) server.
    Reconnect,

    /// Print help message.
    PrintHelp,

    /// Client exit.
    Exit,

    /// Nothing read.
    Nothing,
}

impl ReplCommand {
    /// Interprets one line of user input; `None` means end of input.
    fn parse(line: Option<&str>) -> Self {
        let Some(line) = line else {
            return ReplCommand::Exit;
        };
        let line = line.trim();
        match &line.to_lowercase()[..] {
            "" => ReplCommand::Nothing,
            "quit" | "exit" => ReplCommand::Exit,
            "reconnect" => ReplCommand::Reconnect,
            "help" => ReplCommand::PrintHelp,
            _ => ReplCommand::Normal(line.into()),
        }
    }
}

/// Interactive REPL-style client.
struct ClientRepl {
    client: LibraryClient,
    input: Lines<BufReader<Stdin>>,
    rx_term: watch::Receiver<bool>,
}

impl ClientRepl {
    /// Prints the prompt string.
    fn print_prompt() -> Result<(), LendsetError> {
        cprint!("<bright-yellow>{}</>", PROMPT);
        io::stdout().flush()?;
        Ok(())
    }

    /// Prints the help message.
    fn print_help() {
        println!("HELP: Supported commands are:");
        println!("          reserve <clientId> <itemId>");
        println!("          return <clientId> <itemId>");
        println!("          reconnect");
        println!("          help");
        println!("          quit");
        println!("      Any other line is sent to the server as is");
    }

    /// Prints the identity of the current session.
    fn print_session(&self) {
        if let (Some(id), Some(server)) = (self.client.id(), self.client.server())
        {
            cprintln!("<bright-blue>#</> connected to {} as {}", server, id);
        }
    }

    /// Connects, reporting failure without giving up.
    async fn connect(&mut self) {
        match self.client.connect().await {
            Ok(()) => self.print_session(),
            Err(e) => cprintln!("<bright-red>✗</> {}", e),
        }
    }

    /// Waits for the next input line or a termination signal.
    async fn read_command(&mut self) -> Result<ReplCommand, LendsetError> {
        tokio::select! {
            line = self.input.next_line() => {
                Ok(ReplCommand::parse(line?.as_deref()))
            }
            _ = self.rx_term.changed() => {
                println!();
                Ok(ReplCommand::Exit)
            }
        }
    }

    /// One iteration of the REPL loop; returns `false` to exit.
    async fn iter(&mut self) -> Result<bool, LendsetError> {
        Self::print_prompt()?;

        match self.read_command().await? {
            ReplCommand::Exit => {
                println!("Exiting...");
                return Ok(false);
            }
            ReplCommand::Nothing => {}
            ReplCommand::Reconnect => {
                println!("Reconnecting...");
                self.connect().await;
            }
            ReplCommand::PrintHelp => Self::print_help(),
            ReplCommand::Normal(line) => {
                let old_id = self.client.id().map(String::from);
                match self.client.send_cmd(&line).await {
                    Ok(Some(reply)) => println!("{}", reply),
                    Ok(None) => {
                        cprintln!("<bright-red>✗</> no reply within timeout")
                    }
                    Err(e) => cprintln!("<bright-red>✗</> {}", e),
                }
                if self.client.id() != old_id.as_deref() {
                    self.print_session();
                }
            }
        }
        Ok(true)
    }

    /// Runs the REPL loop until exit.
    async fn run(&mut self) -> Result<(), LendsetError> {
        self.connect().await;
        while self.iter().await? {}
        Ok(())
    }
}

/// Actual main function of Lendset client.
fn client_main(args: CliArgs) -> Result<(), LendsetError> {
    args.sanitize()?;

    let config = ClientConfig::from_file(&args.config_file)?;
    let client = LibraryClient::new(
        config.servers,
        Duration::from_millis(args.timeout_ms),
    )?;

    // set up termination signals handler
    let (tx_term, rx_term) = watch::channel(false);
    ctrlc::set_handler(move || {
        if let Err(e) = tx_term.send(true) {
            pf_error!("error sending to term channel: {}", e);
        }
    })?;

    let log_level = log::max_level();
    {
        let runtime = Builder::new_current_thread().enable_all().build()?;

        runtime.block_on(async move {
            let mut repl = ClientRepl {
                client,
                input: BufReader::new(tokio::io::stdin()).lines(),
                rx_term,
            };
            repl.run().await?;

            log::set_max_level(LevelFilter::Off);
            Ok::<(), LendsetError>(())
        })?;
    } // drop the runtime here

    log::set_max_level(log_level);
    Ok(())
}

/// Main function of Lendset client.
fn main() -> ExitCode {
    let args = CliArgs::parse();
    logger_init(&args.log_level);

    if let Err(ref e) = client_main(args) {
        pf_error!("client_main exited: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
