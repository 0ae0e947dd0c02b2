//! Code related to CLI things
//!

use clap::*;

#[derive(Parser, Clone)]
pub struct SharedOpts {
    #[clap(short, long, help = "Configuration file")]
    config: Option<String>,
    #[clap(short, long)]
    debug: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the name server
    Server {
        #[clap(flatten)]
        sopt: SharedOpts,
    },
    /// Load the configuration and report what's wrong with it
    ConfigCheck {
        #[clap(flatten)]
        sopt: SharedOpts,
    },
    /// Print the effective configuration as JSON
    ExportConfig {
        #[clap(flatten)]
        sopt: SharedOpts,
    },
}

impl Default for Commands {
    fn default() -> Self {
        Commands::Server {
            sopt: SharedOpts {
                config: None,
                debug: false,
            },
        }
    }
}

#[derive(Parser)]
#[command(arg_required_else_help(false))]
/// An authoritative DNS name server with a SQL zone store and a forwarding resolver.
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

impl Cli {
    pub fn config(&self) -> Option<String> {
        match &self.command {
            Some(Commands::Server { sopt })
            | Some(Commands::ConfigCheck { sopt })
            | Some(Commands::ExportConfig { sopt }) => sopt.config.clone(),
            None => None,
        }
    }

    pub fn debug(&self) -> bool {
        match &self.command {
            Some(Commands::Server { sopt })
            | Some(Commands::ConfigCheck { sopt })
            | Some(Commands::ExportConfig { sopt }) => sopt.debug,
            None => false,
        }
    }
}
