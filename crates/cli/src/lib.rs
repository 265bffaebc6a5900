pub mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use shutterdesk_core::config::{AppConfig, LoadOptions, LogFormat};

#[derive(Debug, Parser)]
#[command(
    name = "shutterdesk",
    about = "Shutterdesk agent operator CLI",
    long_about = "Apply migrations, inspect configuration and tools, dry-run policy decisions, \
                  review agent proposals, and read the audit log.",
    after_help = "Examples:\n  shutterdesk migrate\n  shutterdesk policy check --studio studio-a --user owner --tool create_lead --args '{\"name\":\"Ana\"}'\n  shutterdesk proposals list --studio studio-a --status pending"
)]
pub struct Cli {
    #[arg(long, global = true, help = "Path to a shutterdesk.toml config file")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config,
    #[command(about = "List the tools offered to the model with their parameter schemas")]
    Tools,
    #[command(subcommand, about = "Inspect guardrail policy decisions")]
    Policy(PolicyCommand),
    #[command(subcommand, about = "Review proposals awaiting human approval")]
    Proposals(ProposalsCommand),
    #[command(subcommand, about = "Read the append-only audit log")]
    Audit(AuditCommand),
}

#[derive(Debug, Subcommand)]
enum PolicyCommand {
    #[command(about = "Dry-run the decision for one tool call without executing it")]
    Check {
        #[arg(long)]
        studio: String,
        #[arg(long)]
        user: String,
        #[arg(long)]
        tool: String,
        #[arg(long = "args", default_value = "{}", help = "Tool arguments as a JSON object")]
        arguments: String,
    },
}

#[derive(Debug, Subcommand)]
enum ProposalsCommand {
    List {
        #[arg(long)]
        studio: String,
        #[arg(long, help = "pending | approved | rejected")]
        status: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: u32,
    },
    Approve {
        #[arg(long)]
        studio: String,
        #[arg(long)]
        reviewer: String,
        id: String,
    },
    Reject {
        #[arg(long)]
        studio: String,
        #[arg(long)]
        reviewer: String,
        id: String,
    },
}

#[derive(Debug, Subcommand)]
enum AuditCommand {
    List {
        #[arg(long)]
        studio: String,
        #[arg(long, help = "Inclusive RFC 3339 lower bound")]
        since: Option<String>,
        #[arg(long, help = "Exclusive RFC 3339 upper bound")]
        until: Option<String>,
        #[arg(long, default_value_t = 100)]
        limit: u32,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();
    let options = commands::load_options(cli.config);
    init_logging(&options);

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(options),
        Command::Config => commands::config::run(options),
        Command::Tools => commands::tools::run(),
        Command::Policy(PolicyCommand::Check { studio, user, tool, arguments }) => {
            commands::policy::check(options, &studio, &user, &tool, &arguments)
        }
        Command::Proposals(ProposalsCommand::List { studio, status, limit }) => {
            commands::proposals::list(options, &studio, status.as_deref(), limit)
        }
        Command::Proposals(ProposalsCommand::Approve { studio, reviewer, id }) => {
            commands::proposals::approve(options, &studio, &id, &reviewer)
        }
        Command::Proposals(ProposalsCommand::Reject { studio, reviewer, id }) => {
            commands::proposals::reject(options, &studio, &id, &reviewer)
        }
        Command::Audit(AuditCommand::List { studio, since, until, limit }) => {
            commands::audit::list(options, &studio, since.as_deref(), until.as_deref(), limit)
        }
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}

/// Logs go to stderr so stdout stays a single JSON document. A config that
/// fails to load is reported by the command itself.
fn init_logging(options: &LoadOptions) {
    let Ok(config) = AppConfig::load(options.clone()) else {
        return;
    };
    let filter = EnvFilter::try_new(&config.logging.level).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    let installed = match config.logging.format {
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    if installed.is_ok() {
        tracing::debug!(
            event_name = "system.bootstrap.logging",
            format = ?config.logging.format,
            "logging initialized"
        );
    }
}
