//! Command-line surface for Machinist.
//!
//! Every command opens the `SQLite` database given by `--db`, applies the
//! schema, and prints its result as pretty JSON. Inputs go through the same
//! validation as the HTTP service before reaching [`MachineService`].

use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use machinist_core::{CreateMachineRequest, MachineDto, MachineService};
use machinist_store_sqlite::SqliteMachineStore;
use serde::Serialize;

#[derive(Debug, Parser)]
#[command(name = "machinist")]
#[command(about = "Machinist machine records CLI")]
pub struct Cli {
    #[arg(long, default_value = "./machinist.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Machine {
        #[command(subcommand)]
        command: MachineCommand,
    },
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum MachineCommand {
    List,
    Show(IdArgs),
    Create(FieldArgs),
    Update(UpdateArgs),
    Delete(IdArgs),
}

#[derive(Debug, Subcommand)]
pub enum DbCommand {
    SchemaVersion,
}

#[derive(Debug, Args)]
pub struct IdArgs {
    #[arg(long)]
    id: String,
}

#[derive(Debug, Args)]
pub struct FieldArgs {
    #[arg(long)]
    name: String,
    #[arg(long)]
    description: Option<String>,
    #[arg(long)]
    year_of_production: Option<i32>,
}

#[derive(Debug, Args)]
pub struct UpdateArgs {
    #[arg(long)]
    id: String,
    #[command(flatten)]
    fields: FieldArgs,
}

#[derive(Debug, Serialize)]
struct DeleteReceipt {
    id: String,
    deleted: bool,
}

/// Executes the parsed top-level CLI command.
///
/// # Errors
/// Returns an error when the database cannot be opened or migrated, input
/// fails validation, the machine does not exist, or the store fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let store = SqliteMachineStore::open(&cli.db)?;
    store.migrate()?;

    match cli.command {
        Command::Machine { command } => {
            let mut service = MachineService::new(store);
            run_machine(command, &mut service)
        }
        Command::Db { command: DbCommand::SchemaVersion } => {
            print_json(&store.schema_status()?)
        }
    }
}

/// Executes a machine command against an existing service.
///
/// # Errors
/// Returns an error when validation fails, the machine does not exist, or the
/// store fails.
pub fn run_machine(
    command: MachineCommand,
    service: &mut MachineService<SqliteMachineStore>,
) -> Result<()> {
    match command {
        MachineCommand::List => print_json(&service.get_all()?),
        MachineCommand::Show(args) => print_json(&service.get_by_id(&args.id)?),
        MachineCommand::Create(fields) => {
            let request = CreateMachineRequest {
                name: Some(fields.name),
                description: fields.description,
                year_of_production: fields.year_of_production,
            };
            request.validate_for_create()?;
            print_json(&service.create(request)?)
        }
        MachineCommand::Update(args) => {
            let dto = MachineDto {
                id: Some(args.id.clone()),
                name: Some(args.fields.name),
                description: args.fields.description,
                year_of_production: args.fields.year_of_production,
                created_at: None,
                updated_at: None,
            };
            dto.validate_for_update()?;
            service.update(dto)?;
            print_json(&service.get_by_id(&args.id)?)
        }
        MachineCommand::Delete(args) => {
            service.delete_by_id(&args.id)?;
            print_json(&DeleteReceipt { id: args.id, deleted: true })
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
