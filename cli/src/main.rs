//! devsync CLI entry point.

use clap::Parser;
use devsync::cli::commands;
use devsync::cli::{Cli, Commands};
use devsync::error::Error;
use std::process::ExitCode;

fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.no_color {
        colored::control::set_override(false);
    }

    // Set up tracing based on verbosity
    init_tracing(cli.verbose, cli.quiet);

    // Resolve effective JSON mode: --json OR non-TTY stdout
    let json = cli.json || !std::io::IsTerminal::is_terminal(&std::io::stdout());

    match run(&cli, json) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if json {
                eprintln!("{}", e.to_structured_json());
            } else if !cli.quiet {
                if let Some(hint) = e.hint() {
                    eprintln!("Error: {e}\n  Hint: {hint}");
                } else {
                    eprintln!("Error: {e}");
                }
            }
            ExitCode::from(e.exit_code())
        }
    }
}

fn init_tracing(verbose: u8, quiet: bool) {
    use tracing_subscriber::EnvFilter;

    if quiet {
        return;
    }

    // Honor RUST_LOG if set, otherwise use verbosity flag
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        match verbose {
            0 => EnvFilter::new("warn"),
            1 => EnvFilter::new("info"),
            2 => EnvFilter::new("debug,notify=info"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

fn run(cli: &Cli, json: bool) -> Result<(), Error> {
    let device = cli.device.as_deref();

    match &cli.command {
        Commands::Init { name } => commands::init::execute(name.as_deref(), json),
        Commands::Version => commands::version::execute(json),
        Commands::Status => commands::status::execute(device, json),

        // Device
        Commands::Sync { folder } => commands::sync::execute(folder.as_deref(), device, json),
        Commands::Upload { path, folder } => {
            commands::upload::execute(path.as_deref(), folder.as_deref(), device, json)
        }
        Commands::Ls { path, recursive } => commands::browse::execute_ls(path, *recursive, device, json),
        Commands::Cat { path } => commands::browse::execute_cat(path, device, json),
        Commands::Run { file } => commands::run::execute(file, device, json),

        // Screens
        Commands::Screen { command } => commands::screen::execute(command, json),

        // Shell completions
        Commands::Completions { shell } => commands::completions::execute(shell),
    }
}
