use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;
mod config;

use crate::commands::CommandContext;
use crate::config::FleetgateConfig;
use anyhow::Result;

/// CLI for inspecting Fleetgate access rules and live-data channels
#[derive(Parser, Debug)]
#[command(name = "fleetgate", about = "Fleetgate access control and live-data tooling")]
pub struct Cli {
    /// Path to configuration file (TOML)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Permission policy file (overrides the configured policy)
    #[arg(long)]
    pub policy: Option<PathBuf>,

    /// Print results as JSON
    #[arg(long)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Session state fed to the guards
#[derive(clap::Args, Debug, Clone)]
pub struct SessionArgs {
    /// Raw role value of the signed-in user; omit for an unassigned user
    #[arg(long)]
    pub role: Option<String>,

    /// Evaluate with no signed-in identity
    #[arg(long, conflicts_with = "role")]
    pub signed_out: bool,

    /// Evaluate while the role lookup is still in flight
    #[arg(long)]
    pub loading: bool,
}

/// Subcommands for the permission policy
#[derive(Subcommand, Debug)]
#[command(about = "Show or export the permission policy")]
pub enum PolicyCommands {
    /// Print the role × module matrix
    Show,
    /// Write the effective policy as TOML
    Export {
        /// Output file; stdout when omitted
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Validate a policy file
    Validate { path: PathBuf },
}

/// Top-level commands for fleetgate
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List dashboard modules and their routes
    Modules,

    /// Navigation entries visible to a role
    Nav {
        #[arg(long)]
        role: String,
    },

    /// Access level of a role on a module
    Check {
        #[arg(long)]
        role: String,
        #[arg(long)]
        module: String,
    },

    /// Evaluate a protected route guard
    Guard {
        #[command(flatten)]
        session: SessionArgs,

        /// Module the route requires
        #[arg(long)]
        module: Option<String>,

        /// Roles admitted when no module is required (comma separated)
        #[arg(long, value_delimiter = ',')]
        allow: Vec<String>,

        /// Redirect target for denied access
        #[arg(long)]
        redirect_to: Option<String>,
    },

    /// Evaluate the landing route
    Landing {
        #[command(flatten)]
        session: SessionArgs,
    },

    /// Inspect the permission policy
    Policy {
        #[command(subcommand)]
        command: PolicyCommands,
    },

    /// Run channels against an in-memory change feed
    Simulate {
        /// Resource the channels listen to
        #[arg(long, default_value = "orders")]
        resource: String,

        /// Query keys, one channel each (comma separated, `a/b` for composite keys)
        #[arg(long, value_delimiter = ',', default_value = "orders")]
        keys: Vec<String>,

        /// Number of update events to emit
        #[arg(long, default_value_t = 3)]
        events: usize,

        /// Share one feed subscription between the channels
        #[arg(long)]
        multiplex: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    let cli = Cli::parse();

    // Load configuration
    let mut config = FleetgateConfig::resolve_config(cli.config, cli.policy)?;
    if cli.json {
        config.output.json = true;
    }

    let ctx = CommandContext::new(config)?;

    // Dispatch commands
    match cli.command {
        Commands::Modules => {
            commands::modules::list_modules(&ctx)?;
        }
        Commands::Nav { role } => {
            commands::modules::show_navigation(&ctx, &role)?;
        }
        Commands::Check { role, module } => {
            commands::modules::check_access(&ctx, &role, &module)?;
        }
        Commands::Guard {
            session,
            module,
            allow,
            redirect_to,
        } => {
            commands::guard::evaluate_route(&ctx, &session, module.as_deref(), &allow, redirect_to).await?;
        }
        Commands::Landing { session } => {
            commands::guard::evaluate_landing(&ctx, &session).await?;
        }
        Commands::Policy { command } => {
            commands::policy::handle_policy_command(&ctx, command)?;
        }
        Commands::Simulate {
            resource,
            keys,
            events,
            multiplex,
        } => {
            commands::simulate::run_simulation(&ctx, &resource, &keys, events, multiplex).await?;
        }
    }

    Ok(())
}
