//! Pretty terminal output formatting for the chatmerge CLI.

use console::{style, Style};
use uuid::Uuid;

use chatmerge_core::diff::MessagesMergeDiff;
use chatmerge_core::models::Dataset;

use crate::{AnalyzeSummary, ChatSummary};

pub fn print_datasets(datasets: &[Dataset]) {
    if datasets.is_empty() {
        println!("{}", style("No datasets.").dim());
        return;
    }
    for ds in datasets {
        println!(
            "{}  {}  {}",
            style(&ds.uuid).cyan(),
            style(&ds.alias).bold(),
            style(&ds.source_type).dim()
        );
    }
}

pub fn print_chats(chats: &[ChatSummary]) {
    if chats.is_empty() {
        println!("{}", style("No chats.").dim());
        return;
    }
    for chat in chats {
        println!(
            "#{:<6} {}  {}  {} msgs",
            chat.id,
            style(chat.name.as_deref().unwrap_or("[unnamed]")).bold(),
            style(&chat.r#type).dim(),
            chat.msg_count
        );
        if !chat.members.is_empty() {
            println!("        {}", style(chat.members.join(", ")).dim());
        }
    }
}

pub fn print_analysis(summaries: &[AnalyzeSummary]) {
    for summary in summaries {
        println!(
            "#{:<6} {}  {}",
            summary.chat_id,
            style(summary.chat_name.as_deref().unwrap_or("[unnamed]")).bold(),
            outcome_style(&summary.outcome).apply_to(&summary.outcome)
        );
        for section in &summary.sections {
            println!("        {section}");
        }
    }
}

pub fn print_merge_result(uuid: &Uuid, alias: &str) {
    println!(
        "{} {} ({})",
        style("Merged into dataset").green(),
        style(uuid).cyan(),
        style(alias).bold()
    );
}

fn outcome_style(outcome: &str) -> Style {
    if outcome.starts_with("keep") {
        Style::new().yellow()
    } else if outcome.starts_with("add") {
        Style::new().cyan()
    } else {
        Style::new().green()
    }
}

/// One-line description of a diff section with its id ranges.
pub fn describe_section(section: &MessagesMergeDiff) -> String {
    match section {
        MessagesMergeDiff::Match {
            first_master_id,
            last_master_id,
            first_slave_id,
            last_slave_id,
        } => format!(
            "match    master {}..{} <-> slave {}..{}",
            first_master_id.0, last_master_id.0, first_slave_id.0, last_slave_id.0
        ),
        MessagesMergeDiff::Retain { first_master_id, last_master_id } => {
            format!("retain   master {}..{}", first_master_id.0, last_master_id.0)
        }
        MessagesMergeDiff::Add { first_slave_id, last_slave_id } => {
            format!("add      slave {}..{}", first_slave_id.0, last_slave_id.0)
        }
        MessagesMergeDiff::Replace {
            first_master_id,
            last_master_id,
            first_slave_id,
            last_slave_id,
        } => format!(
            "replace  master {}..{} -> slave {}..{}",
            first_master_id.0, last_master_id.0, first_slave_id.0, last_slave_id.0
        ),
    }
}
