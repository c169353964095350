use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "stackfs")]
#[command(about = "Inspect and maintain union filesystem branch stacks and their xino files")]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    #[command(about = "Open the configured union and print its branch stack")]
    Check {
        #[arg(long, help = "Config file to use instead of the default")]
        config: Option<PathBuf>,

        #[arg(long, help = "JSON output")]
        json: bool,
    },
    #[command(about = "Inspect or compact xino files")]
    Xino {
        #[command(subcommand)]
        action: XinoAction,
    },
    #[command(about = "Manage configuration")]
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },
}

#[derive(Subcommand, Debug)]
pub enum XinoAction {
    #[command(about = "List every mapping in a xino file")]
    Dump {
        #[arg(help = "Path to the xino file")]
        file: PathBuf,

        #[arg(long, help = "JSON output")]
        json: bool,
    },
    #[command(about = "Show size and entry count of a xino file")]
    Stat {
        #[arg(help = "Path to the xino file")]
        file: PathBuf,
    },
    #[command(about = "Drop mappings for inodes that no longer exist under a branch root")]
    Compact {
        #[arg(help = "Path to the xino file")]
        file: PathBuf,

        #[arg(long, help = "Root directory of the branch the file belongs to")]
        root: PathBuf,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    #[command(about = "Show current configuration values")]
    Show,
    #[command(about = "Show config file path")]
    Path,
}
