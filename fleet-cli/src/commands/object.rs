//! `fleet object list|show|put`

use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Args, Subcommand};
use tabled::{settings::Style, Table, Tabled};

use fleet_core::{FileStore, ObjectDraft, ObjectId, ObjectStore};

use super::home_dir;
use crate::ObjectClassArg;

/// Inspect and edit configuration objects.
#[derive(Subcommand, Debug)]
pub enum ObjectCommand {
    /// List the newest version of every object.
    List(ListArgs),

    /// Print the newest version of one object as YAML.
    Show {
        /// Object id.
        id: i64,
    },

    /// Store a new object version from a YAML file.
    Put(PutArgs),
}

#[derive(Args, Debug)]
pub struct ListArgs {
    /// Only objects of this class.
    #[arg(long)]
    pub class: Option<ObjectClassArg>,

    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct PutArgs {
    /// YAML file with `name`, optional `catagory`/`comment`, and `content`.
    pub file: PathBuf,

    /// Existing object id to version; omitted creates a new object.
    #[arg(long)]
    pub id: Option<i64>,
}

#[derive(Tabled)]
struct ObjectRow {
    #[tabled(rename = "id")]
    id: i64,
    #[tabled(rename = "class")]
    class: String,
    #[tabled(rename = "name")]
    name: String,
    #[tabled(rename = "version")]
    version: u32,
    #[tabled(rename = "category")]
    catagory: String,
    #[tabled(rename = "saved")]
    saved_at: String,
}

pub fn run(cmd: ObjectCommand) -> Result<()> {
    let home = home_dir()?;
    let store = FileStore::open_at(&home).context("failed to open fleet store")?;
    match cmd {
        ObjectCommand::List(args) => list(&store, args),
        ObjectCommand::Show { id } => show(&store, ObjectId(id)),
        ObjectCommand::Put(args) => put(&store, args),
    }
}

fn list(store: &FileStore, args: ListArgs) -> Result<()> {
    let mut objects = store
        .list_newest_objects()
        .context("failed to list objects; run `fleet init` first")?;
    if let Some(ObjectClassArg(class)) = args.class {
        objects.retain(|object| object.class() == class);
    }

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&objects).context("failed to serialize objects JSON")?
        );
        return Ok(());
    }

    if objects.is_empty() {
        println!("No objects stored.");
        return Ok(());
    }

    let rows: Vec<ObjectRow> = objects
        .into_iter()
        .map(|object| ObjectRow {
            id: object.id.0,
            class: object.class().to_string(),
            name: object.name,
            version: object.version,
            catagory: object.catagory,
            saved_at: object.saved_at.format("%Y-%m-%d %H:%M").to_string(),
        })
        .collect();
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");
    Ok(())
}

fn show(store: &FileStore, id: ObjectId) -> Result<()> {
    let history = store
        .object_history(id)
        .with_context(|| format!("failed to read object {id}"))?;
    let Some(newest) = history.last() else {
        bail!("object {id} not found");
    };
    print!(
        "{}",
        serde_yaml::to_string(newest).context("failed to render object YAML")?
    );
    Ok(())
}

fn put(store: &FileStore, args: PutArgs) -> Result<()> {
    let text = fs::read_to_string(&args.file)
        .with_context(|| format!("cannot read '{}'", args.file.display()))?;
    let draft: ObjectDraft = serde_yaml::from_str(&text)
        .with_context(|| format!("'{}' is not a valid object draft", args.file.display()))?;

    let id = args.id.map(ObjectId).unwrap_or(ObjectId::NEW);
    let saved = store
        .save_version(id, draft)
        .with_context(|| format!("failed to save '{}'", args.file.display()))?;
    println!("✓ Saved object {} version {}", saved.id, saved.version);
    Ok(())
}
