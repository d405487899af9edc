//! Admin command surface for the segmentation store.
//!
//! `segctl` operates directly on a database file: catalog management,
//! membership mutations, and report extraction, without going through the
//! HTTP service. Output is JSON on stdout; failures exit non-zero.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use segmentation_core::{report_rows, Period, Slug, UserId};
use segmentation_store_sqlite::SegmentStore;
use serde_json::json;

#[derive(Debug, Parser)]
#[command(name = "segctl")]
#[command(about = "Segmentation admin CLI")]
pub struct Cli {
    #[arg(long, default_value = "./segmentation.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Apply the database schema.
    Migrate,
    /// Create a catalog segment.
    CreateSegment(SlugArgs),
    /// Delete a segment and cascade its memberships.
    DeleteSegment(SlugArgs),
    /// Add and remove a user's segments in one atomic request.
    Update(UpdateArgs),
    /// List the segments a user belongs to.
    List(UserArgs),
    /// Render the audit report for a calendar month.
    Report(ReportArgs),
}

#[derive(Debug, Args)]
pub struct SlugArgs {
    #[arg(long)]
    slug: String,
}

#[derive(Debug, Args)]
pub struct UpdateArgs {
    #[arg(long)]
    user: String,
    #[arg(long = "add")]
    add: Vec<String>,
    #[arg(long = "remove")]
    remove: Vec<String>,
}

#[derive(Debug, Args)]
pub struct UserArgs {
    #[arg(long)]
    user: String,
}

#[derive(Debug, Args)]
pub struct ReportArgs {
    #[arg(long)]
    period: String,
    #[arg(long)]
    user: Option<String>,
}

/// Executes a parsed CLI invocation against the database named by `--db`.
///
/// # Errors
/// Propagates validation, domain, and storage errors; the binary maps them
/// to a non-zero exit code.
pub fn run_cli(cli: Cli) -> Result<()> {
    let store = SegmentStore::new(&cli.db);
    store.migrate()?;

    match cli.command {
        Command::Migrate => {
            println!("{}", serde_json::to_string_pretty(&json!({"migrated": true}))?);
            Ok(())
        }
        Command::CreateSegment(args) => {
            let slug = Slug::parse(&args.slug)?;
            let _ = store.create_segment(&slug)?;
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({"created": slug.as_str()}))?
            );
            Ok(())
        }
        Command::DeleteSegment(args) => {
            let slug = Slug::parse(&args.slug)?;
            store.delete_segment(&slug)?;
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({"deleted": slug.as_str()}))?
            );
            Ok(())
        }
        Command::Update(args) => {
            let user = UserId::parse(&args.user)?;
            let to_add = parse_slugs(&args.add)?;
            let to_remove = parse_slugs(&args.remove)?;

            let applied = store.update_user_segments(user, &to_add, &to_remove)?;
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({
                    "user": user.to_string(),
                    "applied": applied,
                }))?
            );
            Ok(())
        }
        Command::List(args) => {
            let user = UserId::parse(&args.user)?;
            let segments: Vec<String> = store
                .user_segments(user)?
                .iter()
                .map(ToString::to_string)
                .collect();
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({
                    "user": user.to_string(),
                    "segments": segments,
                }))?
            );
            Ok(())
        }
        Command::Report(args) => {
            let period = Period::parse(&args.period)?;
            let user = args.user.as_deref().map(UserId::parse).transpose()?;

            let entries = store.audit_entries(period, user)?;
            let rows = report_rows(&entries)?;
            println!("{}", serde_json::to_string_pretty(&rows)?);
            Ok(())
        }
    }
}

fn parse_slugs(raw: &[String]) -> Result<Vec<Slug>> {
    let mut slugs = Vec::with_capacity(raw.len());
    for value in raw {
        slugs.push(Slug::parse(value)?);
    }
    Ok(slugs)
}
