//! Output formatting utilities for the CLI.

use chrono::{DateTime, Utc};
use comfy_table::{presets, Attribute, Cell, Color, ContentArrangement, Table};
use serde::Serialize;

use crate::domain::models::{Machine, MachineStatus, Task, TaskStatus};

pub trait CommandOutput: Serialize {
    fn to_human(&self) -> String;
    fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

pub fn output<T: CommandOutput>(result: &T, json_mode: bool) {
    if json_mode {
        println!("{}", serde_json::to_string_pretty(&result.to_json()).unwrap_or_default());
    } else {
        println!("{}", result.to_human());
    }
}

/// Truncate to at most `max_chars` characters, appending "..." if truncated.
pub fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let kept: String = s.chars().take(max_chars.saturating_sub(3)).collect();
    format!("{kept}...")
}

pub fn format_time(at: &DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

fn base_table() -> Table {
    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table
}

fn header(names: &[&str]) -> Vec<Cell> {
    names
        .iter()
        .map(|name| Cell::new(name).add_attribute(Attribute::Bold))
        .collect()
}

fn status_color(status: TaskStatus) -> Color {
    match status {
        TaskStatus::Queued => Color::Blue,
        TaskStatus::Claimed => Color::Cyan,
        TaskStatus::Running => Color::Yellow,
        TaskStatus::Completed => Color::Green,
        TaskStatus::Failed | TaskStatus::Timeout => Color::Red,
        TaskStatus::Cancelled => Color::DarkGrey,
    }
}

fn machine_color(status: MachineStatus) -> Color {
    match status {
        MachineStatus::Online => Color::Green,
        MachineStatus::Busy => Color::Yellow,
        MachineStatus::Offline => Color::Red,
    }
}

pub fn format_task_table(tasks: &[Task]) -> String {
    let mut table = base_table();
    table.set_header(header(&["ID", "Project", "Status", "Pri", "Machine", "Engine", "Description"]));

    for task in tasks {
        let id = task.id.to_string();
        table.add_row(vec![
            Cell::new(&id[..8]),
            Cell::new(&task.project),
            Cell::new(task.status).fg(status_color(task.status)),
            Cell::new(task.priority),
            Cell::new(task.assigned_machine.as_deref().unwrap_or("-")),
            Cell::new(task.engine.as_deref().unwrap_or("-")),
            Cell::new(truncate(&task.description, 48)),
        ]);
    }
    table.to_string()
}

pub fn format_machine_table(machines: &[Machine], now: DateTime<Utc>) -> String {
    let mut table = base_table();
    table.set_header(header(&["Machine", "Status", "Load", "Last heartbeat", "Engines"]));

    for machine in machines {
        let age = machine.heartbeat_age(now).num_seconds().max(0);
        table.add_row(vec![
            Cell::new(&machine.id),
            Cell::new(machine.status).fg(machine_color(machine.status)),
            Cell::new(format!("{}/{}", machine.active_task_count, machine.max_concurrency)),
            Cell::new(format!("{age}s ago")),
            Cell::new(machine.engine_priority.join(", ")),
        ]);
    }
    table.to_string()
}
