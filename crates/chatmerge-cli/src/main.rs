//! chatmerge CLI - analyze and merge chat history datasets.

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use uuid::Uuid;

use chatmerge_core::dao::ChatHistoryDao;
use chatmerge_core::diff::DatasetDiffAnalyzer;
use chatmerge_core::merge::{
    merge_datasets, ChatMergeOption, ChatMergeRequest, UserMergeOption,
};
use chatmerge_core::models::{ChatWithDetails, Dataset};
use chatmerge_core::{Config, SqliteDao};

mod pretty;

#[derive(Debug, Parser)]
#[command(
    name = "chatmerge",
    author,
    version,
    about = "Normalize and merge chat history datasets",
    propagate_version = true
)]
struct Cli {
    /// Config file path
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Output JSON for programmatic use
    #[arg(long, global = true)]
    json: bool,

    /// Increase verbosity
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List datasets in a database
    Datasets {
        /// Path to the database file
        db: PathBuf,
    },

    /// List chats of a dataset
    Chats {
        /// Path to the database file
        db: PathBuf,

        /// Dataset UUID
        ds: Uuid,
    },

    /// Diff two snapshots of the same history
    Analyze {
        /// Path to the master database file
        master_db: PathBuf,

        /// Master dataset UUID
        master_ds: Uuid,

        /// Path to the slave database file
        slave_db: PathBuf,

        /// Slave dataset UUID
        slave_ds: Uuid,
    },

    /// Merge two snapshots into a target database, applying default
    /// resolutions everywhere
    Merge {
        /// Path to the master database file
        master_db: PathBuf,

        /// Master dataset UUID
        master_ds: Uuid,

        /// Path to the slave database file
        slave_db: PathBuf,

        /// Slave dataset UUID
        slave_ds: Uuid,

        /// Path to the target database file
        target_db: PathBuf,
    },
}

#[derive(Debug, serde::Serialize)]
struct ChatSummary {
    id: i64,
    name: Option<String>,
    r#type: String,
    members: Vec<String>,
    msg_count: i64,
}

impl From<&ChatWithDetails> for ChatSummary {
    fn from(cwd: &ChatWithDetails) -> Self {
        Self {
            id: cwd.chat.id.0,
            name: cwd.chat.name.clone(),
            r#type: cwd.chat.tpe.to_string(),
            members: cwd.members.iter().map(|m| m.pretty_name()).collect(),
            msg_count: cwd.chat.msg_count,
        }
    }
}

#[derive(Debug, serde::Serialize)]
struct AnalyzeSummary {
    chat_id: i64,
    chat_name: Option<String>,
    outcome: String,
    sections: Vec<String>,
}

#[derive(Debug, serde::Serialize)]
struct MergeSummary {
    new_dataset_uuid: Uuid,
    alias: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => tracing::Level::INFO,
        1 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    let config = match &cli.config {
        Some(path) => Config::ensure_at(path)?,
        None => Config::load()?,
    };

    match cli.command {
        Command::Datasets { db } => cmd_datasets(&db, cli.json).await,
        Command::Chats { db, ds } => cmd_chats(&db, ds, cli.json).await,
        Command::Analyze { master_db, master_ds, slave_db, slave_ds } => {
            cmd_analyze(&config, &master_db, master_ds, &slave_db, slave_ds, cli.json).await
        }
        Command::Merge { master_db, master_ds, slave_db, slave_ds, target_db } => {
            cmd_merge(&config, &master_db, master_ds, &slave_db, slave_ds, &target_db, cli.json)
                .await
        }
    }
}

async fn cmd_datasets(db: &PathBuf, json: bool) -> Result<()> {
    let dao = SqliteDao::open(db).await?;
    let datasets = dao.datasets().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&datasets)?);
    } else {
        pretty::print_datasets(&datasets);
    }
    Ok(())
}

async fn cmd_chats(db: &PathBuf, ds: Uuid, json: bool) -> Result<()> {
    let dao = SqliteDao::open(db).await?;
    let chats = dao.chats(&ds).await?;
    let summaries: Vec<ChatSummary> = chats.iter().map(ChatSummary::from).collect();
    if json {
        println!("{}", serde_json::to_string_pretty(&summaries)?);
    } else {
        pretty::print_chats(&summaries);
    }
    Ok(())
}

async fn find_dataset(dao: &SqliteDao, uuid: Uuid) -> Result<Dataset> {
    dao.datasets()
        .await?
        .into_iter()
        .find(|ds| ds.uuid == uuid)
        .with_context(|| format!("dataset {uuid} not found in {}", dao.name()))
}

/// Pairs chats by id: present on both sides means Combine, master-only Keep,
/// slave-only Add.
async fn pair_chats(
    master_dao: &SqliteDao,
    master_ds: &Dataset,
    slave_dao: &SqliteDao,
    slave_ds: &Dataset,
) -> Result<Vec<ChatMergeRequest>> {
    let master_chats = master_dao.chats(&master_ds.uuid).await?;
    let slave_chats = slave_dao.chats(&slave_ds.uuid).await?;

    let mut requests = Vec::new();
    for master in &master_chats {
        let slave = slave_chats.iter().find(|s| s.chat.id == master.chat.id);
        requests.push(match slave {
            Some(slave) => ChatMergeRequest::Combine {
                master_chat: master.chat.clone(),
                slave_chat: slave.chat.clone(),
            },
            None => ChatMergeRequest::Keep { master_chat: master.chat.clone() },
        });
    }
    for slave in &slave_chats {
        if !master_chats.iter().any(|m| m.chat.id == slave.chat.id) {
            requests.push(ChatMergeRequest::Add { slave_chat: slave.chat.clone() });
        }
    }
    Ok(requests)
}

async fn cmd_analyze(
    config: &Config,
    master_db: &PathBuf,
    master_ds: Uuid,
    slave_db: &PathBuf,
    slave_ds: Uuid,
    json: bool,
) -> Result<()> {
    let master_dao = SqliteDao::open(master_db).await?;
    let slave_dao = SqliteDao::open(slave_db).await?;
    let master_ds = find_dataset(&master_dao, master_ds).await?;
    let slave_ds = find_dataset(&slave_dao, slave_ds).await?;

    let requests = pair_chats(&master_dao, &master_ds, &slave_dao, &slave_ds).await?;
    let mut analyzer = DatasetDiffAnalyzer::new(&master_dao, &master_ds, &slave_dao, &slave_ds)
        .await?
        .with_batch_size(config.batch_size);
    let cancel = AtomicBool::new(false);
    let options = analyzer.analyze_chats(requests, &cancel).await?;

    let summaries: Vec<AnalyzeSummary> = options.iter().map(summarize_option).collect();
    if json {
        println!("{}", serde_json::to_string_pretty(&summaries)?);
    } else {
        pretty::print_analysis(&summaries);
    }
    Ok(())
}

fn summarize_option(option: &ChatMergeOption) -> AnalyzeSummary {
    match option {
        ChatMergeOption::Keep { master_chat } => AnalyzeSummary {
            chat_id: master_chat.id.0,
            chat_name: master_chat.name.clone(),
            outcome: "keep (master only)".to_owned(),
            sections: vec![],
        },
        ChatMergeOption::Add { slave_chat } => AnalyzeSummary {
            chat_id: slave_chat.id.0,
            chat_name: slave_chat.name.clone(),
            outcome: "add (slave only)".to_owned(),
            sections: vec![],
        },
        ChatMergeOption::Combine { master_chat, sections, .. } => AnalyzeSummary {
            chat_id: master_chat.id.0,
            chat_name: master_chat.name.clone(),
            outcome: "combine".to_owned(),
            sections: sections.iter().map(pretty::describe_section).collect(),
        },
    }
}

#[allow(clippy::too_many_arguments)]
async fn cmd_merge(
    config: &Config,
    master_db: &PathBuf,
    master_ds: Uuid,
    slave_db: &PathBuf,
    slave_ds: Uuid,
    target_db: &PathBuf,
    json: bool,
) -> Result<()> {
    if target_db == master_db || target_db == slave_db {
        bail!("the merge target must be a separate database file");
    }

    let master_dao = SqliteDao::open(master_db).await?;
    let slave_dao = SqliteDao::open(slave_db).await?;
    let master_ds = find_dataset(&master_dao, master_ds).await?;
    let slave_ds = find_dataset(&slave_dao, slave_ds).await?;

    let requests = pair_chats(&master_dao, &master_ds, &slave_dao, &slave_ds).await?;
    let mut analyzer = DatasetDiffAnalyzer::new(&master_dao, &master_ds, &slave_dao, &slave_ds)
        .await?
        .with_batch_size(config.batch_size);
    let cancel = AtomicBool::new(false);
    let options = analyzer.analyze_chats(requests, &cancel).await?;
    let decisions = options.into_iter().map(ChatMergeOption::into_default_decision).collect();

    // Slave-only users are added by default, so combined chats keep their
    // full member sets.
    let master_users = master_dao.users(&master_ds.uuid).await?;
    let slave_users = slave_dao.users(&slave_ds.uuid).await?;
    let user_options: Vec<UserMergeOption> = slave_users
        .into_iter()
        .filter(|slave_user| !master_users.iter().any(|m| m.id == slave_user.id))
        .map(UserMergeOption::Add)
        .collect();

    let mut target_dao = SqliteDao::open(target_db)
        .await?
        .with_backup_keep(config.backups.keep)
        .with_backups_allowed(config.backups.enabled);
    let new_ds = merge_datasets(
        &master_dao,
        &master_ds,
        &slave_dao,
        &slave_ds,
        user_options,
        decisions,
        &mut target_dao,
        &cancel,
    )
    .await?;

    let summary = MergeSummary { new_dataset_uuid: new_ds.uuid, alias: new_ds.alias.clone() };
    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        pretty::print_merge_result(&summary.new_dataset_uuid, &summary.alias);
    }
    Ok(())
}
