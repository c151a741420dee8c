//! Command-line tool for entity relationship activation history.
//!
//! Every write goes through the `PostgreSQL` relationship gateway, so the
//! tool records activation events exactly as any other caller would.
//! Results are printed to stdout as one JSON object per line; logs go to
//! stderr.
//!
//! # Startup Sequence
//!
//! 1. Parse arguments
//! 2. Load configuration from `entity-history.yaml` (or `--config`)
//! 3. Initialize structured logging (tracing)
//! 4. Connect to `PostgreSQL`
//! 5. Check the schema (except for `migrate`)
//! 6. Run the subcommand

mod config;
mod error;

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use futures::TryStreamExt;
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use entity_history_db::PostgresPool;
use entity_history_types::{EntityId, EventFilter, RelationshipRow, RowFilter};

use crate::config::{DEFAULT_CONFIG_PATH, HistoryConfig, LogFormat, LoggingConfig};
use crate::error::CliError;

/// Record and query entity relationship activation history.
#[derive(Debug, Parser)]
#[command(name = "entity-history", version, about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create the relationship and event tables if they do not exist.
    Migrate,

    /// Activate a relationship.
    Activate {
        /// Sub-entity reference.
        #[arg(value_name = "SUB")]
        sub_entity: Uuid,
        /// Super-entity reference.
        #[arg(value_name = "SUPER")]
        super_entity: Uuid,
    },

    /// Activate a relationship unless it is already active.
    Save {
        /// Sub-entity reference.
        #[arg(value_name = "SUB")]
        sub_entity: Uuid,
        /// Super-entity reference.
        #[arg(value_name = "SUPER")]
        super_entity: Uuid,
    },

    /// Deactivate a relationship.
    Deactivate {
        /// Sub-entity reference.
        #[arg(value_name = "SUB")]
        sub_entity: Uuid,
        /// Super-entity reference.
        #[arg(value_name = "SUPER")]
        super_entity: Uuid,
    },

    /// Deactivate every relationship matching the given references.
    DeactivateAll {
        /// Only relationships with this sub-entity.
        #[arg(long = "sub")]
        sub_entity: Option<Uuid>,
        /// Only relationships with this super-entity.
        #[arg(long = "super")]
        super_entity: Option<Uuid>,
    },

    /// List active relationships.
    Active {
        /// Only relationships with this sub-entity.
        #[arg(long = "sub")]
        sub_entity: Option<Uuid>,
        /// Only relationships with this super-entity.
        #[arg(long = "super")]
        super_entity: Option<Uuid>,
    },

    /// Print the activation history of one relationship.
    History {
        /// Sub-entity reference.
        #[arg(value_name = "SUB")]
        sub_entity: Uuid,
        /// Super-entity reference.
        #[arg(value_name = "SUPER")]
        super_entity: Uuid,
    },

    /// Print activation events, ordered by time.
    Events {
        /// Only events where this entity appears on either side.
        #[arg(long)]
        entity: Option<Uuid>,
        /// Only events at or after this RFC 3339 timestamp.
        #[arg(long)]
        since: Option<DateTime<Utc>>,
        /// Only events at or before this RFC 3339 timestamp.
        #[arg(long)]
        until: Option<DateTime<Utc>>,
    },
}

/// Application entry point.
///
/// # Errors
///
/// Returns an error if configuration, connection, or the subcommand fails.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = load_config(cli.config.as_deref())?;
    init_tracing(&config.logging);
    info!(
        max_connections = config.database.max_connections,
        "entity-history starting"
    );

    let pool = PostgresPool::connect(&config.database).await?;
    let result = run(cli.command, &pool).await;
    pool.close().await;
    result?;
    Ok(())
}

/// Load configuration from `path`, or from the default file when present.
fn load_config(path: Option<&Path>) -> Result<HistoryConfig, CliError> {
    if let Some(path) = path {
        return Ok(HistoryConfig::from_file(path)?);
    }
    let default_path = Path::new(DEFAULT_CONFIG_PATH);
    if default_path.exists() {
        Ok(HistoryConfig::from_file(default_path)?)
    } else {
        Ok(HistoryConfig::parse("")?)
    }
}

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr);
    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}

async fn run(command: Command, pool: &PostgresPool) -> Result<(), CliError> {
    if matches!(command, Command::Migrate) {
        return Ok(pool.run_migrations().await?);
    }
    pool.ensure_schema().await?;

    let gateway = pool.gateway();
    let mut out = std::io::stdout().lock();

    match command {
        Command::Migrate => {}
        Command::Activate {
            sub_entity,
            super_entity,
        } => {
            let receipt = gateway.create(pair(sub_entity, super_entity)).await?;
            emit_all(&mut out, &receipt.events)?;
        }
        Command::Save {
            sub_entity,
            super_entity,
        } => {
            let receipt = gateway.save(pair(sub_entity, super_entity)).await?;
            emit_all(&mut out, &receipt.events)?;
        }
        Command::Deactivate {
            sub_entity,
            super_entity,
        } => {
            let receipt = gateway.delete(pair(sub_entity, super_entity)).await?;
            emit_all(&mut out, &receipt.events)?;
        }
        Command::DeactivateAll {
            sub_entity,
            super_entity,
        } => {
            let receipt = gateway
                .delete_where(&row_filter(sub_entity, super_entity))
                .await?;
            info!(removed = receipt.deactivations(), "bulk deactivation done");
            emit_all(&mut out, &receipt.events)?;
        }
        Command::Active {
            sub_entity,
            super_entity,
        } => {
            let rows = gateway.rows(&row_filter(sub_entity, super_entity)).await?;
            emit_all(&mut out, &rows)?;
        }
        Command::History {
            sub_entity,
            super_entity,
        } => {
            let events = gateway
                .events()
                .history(&pair(sub_entity, super_entity))
                .await?;
            emit_all(&mut out, &events)?;
        }
        Command::Events {
            entity,
            since,
            until,
        } => {
            let filter = event_filter(entity, since, until);
            let store = gateway.events();
            let mut events = store.stream(filter);
            while let Some(event) = events.try_next().await? {
                emit(&mut out, &event)?;
            }
        }
    }
    Ok(())
}

fn pair(sub_entity: Uuid, super_entity: Uuid) -> RelationshipRow {
    RelationshipRow::new(EntityId::from(sub_entity), EntityId::from(super_entity))
}

fn row_filter(sub_entity: Option<Uuid>, super_entity: Option<Uuid>) -> RowFilter {
    RowFilter {
        sub_entity: sub_entity.map(EntityId::from),
        super_entity: super_entity.map(EntityId::from),
    }
}

fn event_filter(
    entity: Option<Uuid>,
    since: Option<DateTime<Utc>>,
    until: Option<DateTime<Utc>>,
) -> EventFilter {
    EventFilter {
        involving: entity.map(EntityId::from),
        since,
        until,
        ..EventFilter::all()
    }
}

fn emit<T: Serialize>(out: &mut impl Write, value: &T) -> Result<(), CliError> {
    serde_json::to_writer(&mut *out, value)?;
    writeln!(out)?;
    Ok(())
}

fn emit_all<T: Serialize>(out: &mut impl Write, values: &[T]) -> Result<(), CliError> {
    values.iter().try_for_each(|value| emit(&mut *out, value))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn parses_pair_arguments() {
        let sub = Uuid::new_v4();
        let sup = Uuid::new_v4();
        let cli = Cli::try_parse_from([
            "entity-history",
            "activate",
            &sub.to_string(),
            &sup.to_string(),
        ])
        .unwrap();
        assert!(matches!(
            cli.command,
            Command::Activate { sub_entity, super_entity } if sub_entity == sub && super_entity == sup
        ));
    }

    #[test]
    fn parses_event_window() {
        let cli = Cli::try_parse_from([
            "entity-history",
            "--config",
            "custom.yaml",
            "events",
            "--since",
            "2024-01-01T00:00:00Z",
        ])
        .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("custom.yaml")));
        assert!(matches!(
            cli.command,
            Command::Events {
                entity: None,
                since: Some(_),
                until: None,
            }
        ));
    }

    #[test]
    fn rejects_malformed_uuid() {
        assert!(Cli::try_parse_from(["entity-history", "history", "nope", "nope"]).is_err());
    }

    #[test]
    fn filters_map_cli_flags() {
        let sup = Uuid::new_v4();
        let rows = row_filter(None, Some(sup));
        assert_eq!(rows, RowFilter::all().super_entity(EntityId::from(sup)));

        let events = event_filter(Some(sup), None, None);
        assert_eq!(events, EventFilter::all().involving(EntityId::from(sup)));
    }

    #[test]
    fn emits_one_json_object_per_line() {
        let rows = [
            pair(Uuid::new_v4(), Uuid::new_v4()),
            pair(Uuid::new_v4(), Uuid::new_v4()),
        ];
        let mut buffer = Vec::new();
        emit_all(&mut buffer, &rows).unwrap();
        let text = String::from_utf8(buffer).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        for line in lines {
            let value: serde_json::Value = serde_json::from_str(line).unwrap();
            assert!(value.get("sub_entity").is_some());
        }
    }
}
