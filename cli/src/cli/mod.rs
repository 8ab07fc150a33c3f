//! CLI definitions using clap.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

pub mod commands;
pub mod device;

/// devsync - keep a local folder in sync with a device's filesystem
#[derive(Parser, Debug)]
#[command(name = "devsync", author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Device endpoint: `host:port` of a raw-REPL bridge, or `sim`
    #[arg(long, global = true, env = "DEVSYNC_DEVICE")]
    pub device: Option<String>,

    /// Output as JSON (for scripting)
    #[arg(long, global = true)]
    pub json: bool,

    /// Increase logging verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Quiet mode (no output except errors)
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Scaffold the sync folder with a starter script
    Init {
        /// Project name used in the generated files (default: directory name)
        #[arg(long)]
        name: Option<String>,
    },

    /// Mirror the sync folder onto the device until interrupted
    Sync {
        /// Folder to mirror (default: <project>/device-files)
        #[arg(long)]
        folder: Option<PathBuf>,
    },

    /// Upload a directory or file under the sync folder
    Upload {
        /// File or directory to upload (default: the whole sync folder)
        path: Option<PathBuf>,

        /// Sync folder the path lives in (default: <project>/device-files)
        #[arg(long)]
        folder: Option<PathBuf>,
    },

    /// List a directory on the device
    Ls {
        /// Device path (default: the device root)
        #[arg(default_value = "")]
        path: String,

        /// Show the whole tree instead of one directory
        #[arg(short, long)]
        recursive: bool,
    },

    /// Print a file from the device
    Cat {
        /// Device path
        path: String,
    },

    /// Run a local script on the device
    Run {
        /// Script to execute
        file: PathBuf,
    },

    /// Screen layout tools
    Screen {
        #[command(subcommand)]
        command: ScreenCommands,
    },

    /// Show configuration and the active sync session
    Status,

    /// Print version information
    Version,

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand, Debug)]
pub enum ScreenCommands {
    /// Compile a JSON shape list into a display class
    Compile {
        /// Class name
        #[arg(long)]
        name: String,

        /// JSON array of shapes (default: stdin)
        #[arg(long, short)]
        input: Option<PathBuf>,

        /// Generated module, overwritten wholesale
        #[arg(long, short)]
        output: PathBuf,
    },
}

/// Supported shells for completions.
#[derive(ValueEnum, Clone, Debug)]
pub enum Shell {
    Bash,
    Zsh,
    Fish,
    #[value(name = "powershell")]
    PowerShell,
    Elvish,
}
