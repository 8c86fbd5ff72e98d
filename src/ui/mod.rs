use colored::*;
use console::{measure_text_width, pad_str, style, Alignment};
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

use crate::deploy::DeployStatus;
use crate::sync::SyncState;

pub fn init() {
    // Enable colored output on Windows
    #[cfg(windows)]
    colored::control::set_virtual_terminal(true).ok();
}

pub fn info(message: &str) {
    println!("{} {}", style("ℹ").blue(), message);
}

pub fn success(message: &str) {
    println!("{} {}", style("✓").green(), message.green());
}

pub fn error(message: &str) {
    eprintln!("{} {}", style("✗").red(), message.red());
}

pub fn warn(message: &str) {
    println!("{} {}", style("⚠").yellow(), message.yellow());
}

pub fn hint(message: &str) {
    println!("{} {}", style("💡").cyan(), message.dimmed());
}

pub fn section(title: &str) {
    println!("\n{}", title.bold().underline());
}

pub fn progress_bar(total: u64, message: &str) -> ProgressBar {
    let pb = ProgressBar::new(total);
    if let Ok(template) =
        ProgressStyle::default_bar().template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
    {
        pb.set_style(template.progress_chars("#>-"));
    }
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

pub fn spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(template) = ProgressStyle::default_spinner().template("{spinner:.green} {msg}") {
        pb.set_style(template);
    }
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

pub fn prompt_confirm(message: &str, default: bool) -> bool {
    dialoguer::Confirm::new()
        .with_prompt(message)
        .default(default)
        .interact()
        .unwrap_or(default)
}

/// Print rows under bold headers. Cells may carry ANSI colors.
pub fn print_table(headers: &[&str], rows: Vec<Vec<String>>) {
    let mut widths = headers.iter().map(|h| h.len()).collect::<Vec<_>>();
    for row in &rows {
        for (i, cell) in row.iter().enumerate() {
            if i < widths.len() {
                widths[i] = widths[i].max(measure_text_width(cell));
            }
        }
    }

    for (i, header) in headers.iter().enumerate() {
        print!("{} ", pad_str(&header.bold().to_string(), widths[i], Alignment::Left, None));
    }
    println!();

    for width in &widths {
        print!("{} ", "-".repeat(*width).dimmed());
    }
    println!();

    for row in rows {
        for (i, cell) in row.iter().enumerate() {
            if i < widths.len() {
                print!("{} ", pad_str(cell, widths[i], Alignment::Left, None));
            }
        }
        println!();
    }
}

pub fn format_bytes(bytes: u64) -> String {
    humansize::format_size(bytes, humansize::BINARY)
}

pub fn deploy_status(status: DeployStatus) -> String {
    let label = status.as_str();
    match status {
        DeployStatus::DeployedClean => label.green().to_string(),
        DeployStatus::DeployedModified => label.yellow().to_string(),
        DeployStatus::NotDeployed => label.dimmed().to_string(),
        DeployStatus::Missing => label.red().to_string(),
    }
}

pub fn sync_state(state: SyncState) -> String {
    let label = state.as_str();
    match state {
        SyncState::Clean => label.green().to_string(),
        SyncState::Dirty | SyncState::Ahead | SyncState::Behind => label.yellow().to_string(),
        SyncState::Diverged => label.red().to_string(),
        SyncState::NotInitialized => label.dimmed().to_string(),
    }
}
