use clap::{Parser, Subcommand};
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "rpa-gateway", version, about = "RPA Orchestration Gateway")]
pub struct CliArgs {
    #[arg(long)]
    pub print_config: bool,
    #[command(subcommand)]
    pub command: Option<CliCommand>,
}

#[derive(Subcommand, Debug)]
pub enum CliCommand {
    /// Issue an API key for an existing tenant, printing its bearer value.
    IssueKey {
        #[arg(long)]
        tenant_id: Uuid,
        #[arg(long, default_value = "viewer")]
        role: String,
        #[arg(long, default_value = "cli-issued")]
        label: String,
    },
    /// Print build & version metadata.
    Version {
        #[arg(long)]
        json: bool,
    },
}
