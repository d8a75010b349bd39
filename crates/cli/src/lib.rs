pub mod commands;

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use signoff_core::config::{LogFormat, LoggingConfig};
use tracing::Level;

use commands::action::{ApproveArgs, DraftArgs, RejectArgs, RequestArgs, StatusArgs, TargetArgs};
use commands::flow::{CreateArgs, ListArgs, UpdateArgs};

#[derive(Debug, Parser)]
#[command(
    name = "signoff",
    about = "Multi-step approval workflows for quotations and purchase orders",
    long_about = "Define approval flows, submit records into them, and approve or reject step by step. \
                  Every command prints one JSON line describing the outcome.",
    after_help = "Examples:\n  signoff seed\n  signoff request --type quotation --id Q-2026-0001 --flow flow-quotation-standard --by owner\n  signoff approve --type quotation --id Q-2026-0001 --actor sam\n  signoff history --type quotation --id Q-2026-0001"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations")]
    Migrate,
    #[command(about = "Load demo approval flows and draft records")]
    Seed,
    #[command(about = "Inspect effective configuration values with source attribution")]
    Config,
    #[command(about = "Validate config, role directory, and database readiness")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(subcommand, about = "Manage approval flow definitions")]
    Flow(FlowCommand),
    #[command(about = "Create a draft quotation or purchase order")]
    Draft(DraftArgs),
    #[command(about = "Submit a record for approval under a flow")]
    Request(RequestArgs),
    #[command(about = "Approve the current step of a pending record")]
    Approve(ApproveArgs),
    #[command(about = "Reject a pending record at its current step")]
    Reject(RejectArgs),
    #[command(about = "Show the approval ledger of a record")]
    History(TargetArgs),
    #[command(about = "Show a record's approval status")]
    Status(StatusArgs),
    #[command(about = "Compare a record's cached status with its ledger")]
    Reconcile(TargetArgs),
}

#[derive(Debug, Subcommand)]
enum FlowCommand {
    #[command(about = "Define a new approval flow")]
    Create(CreateArgs),
    #[command(about = "Edit a flow; changing steps creates a new version")]
    Update(UpdateArgs),
    #[command(about = "Stop a flow from accepting new requests")]
    Deactivate {
        #[arg(long = "flow")]
        flow_id: String,
    },
    #[command(about = "Show one flow")]
    Show {
        #[arg(long = "flow")]
        flow_id: String,
    },
    #[command(about = "List flows")]
    List(ListArgs),
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(),
        Command::Seed => commands::seed::run(),
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run() }
        }
        Command::Doctor { json } => {
            commands::CommandResult { exit_code: 0, output: commands::doctor::run(json) }
        }
        Command::Flow(FlowCommand::Create(args)) => commands::flow::create(args),
        Command::Flow(FlowCommand::Update(args)) => commands::flow::update(args),
        Command::Flow(FlowCommand::Deactivate { flow_id }) => commands::flow::deactivate(&flow_id),
        Command::Flow(FlowCommand::Show { flow_id }) => commands::flow::show(&flow_id),
        Command::Flow(FlowCommand::List(args)) => commands::flow::list(args),
        Command::Draft(args) => commands::action::draft(args),
        Command::Request(args) => commands::action::request(args),
        Command::Approve(args) => commands::action::approve(args),
        Command::Reject(args) => commands::action::reject(args),
        Command::History(args) => commands::action::history(args),
        Command::Status(args) => commands::action::status(args),
        Command::Reconcile(args) => commands::action::reconcile(args),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}

/// Installs the global subscriber on stderr so stdout stays one JSON line.
/// Later calls are no-ops.
pub fn init_logging(config: &LoggingConfig) {
    let log_level = config.level.parse::<Level>().unwrap_or(Level::INFO);
    let builder = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_max_level(log_level);

    let _ = match config.format {
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
}
