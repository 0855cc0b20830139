use comfy_table::modifiers::UTF8_ROUND_CORNERS;
use comfy_table::presets::UTF8_FULL_CONDENSED;
use comfy_table::{Cell, CellAlignment, ContentArrangement, Table};
use is_terminal::IsTerminal;
use owo_colors::OwoColorize;

use crate::compose::ContainerStatus;
use crate::health::{EntityKind, HealthRecord, HealthState, OverallHealth};
use crate::orchestrator::supervisor::{ProcessRecord, ProcessStatus};
use crate::provision::progress::{ProvisioningStep, StepStatus};

fn new_table() -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL_CONDENSED)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table
}

fn print_indented(table: &Table) {
    for line in table.to_string().lines() {
        println!("  {}", line);
    }
}

fn health_cell(state: HealthState, use_color: bool) -> String {
    if !use_color {
        return format!("\u{25cf} {}", state);
    }
    match state {
        HealthState::Healthy => format!("{} {}", "\u{25cf}".green(), "healthy".green()),
        HealthState::Unhealthy => format!("{} {}", "\u{25cf}".red(), "unhealthy".red()),
        HealthState::Unknown => format!("{} {}", "\u{25cf}".dimmed(), "unknown".dimmed()),
    }
}

fn process_cell(status: ProcessStatus, use_color: bool) -> String {
    if !use_color {
        return status.to_string();
    }
    match status {
        ProcessStatus::Running => status.green().to_string(),
        ProcessStatus::Starting => status.yellow().to_string(),
        ProcessStatus::Crashed => status.red().to_string(),
        ProcessStatus::Stopped => status.dimmed().to_string(),
    }
}

/// Health table, with process state alongside when the caller supervises.
pub fn render_health(health: &OverallHealth, processes: &[ProcessRecord], use_color: bool) -> Table {
    let mut table = new_table();
    let mut header = vec![
        Cell::new("Name"),
        Cell::new("Kind"),
        Cell::new("Port").set_alignment(CellAlignment::Right),
        Cell::new("Health").set_alignment(CellAlignment::Center),
    ];
    if !processes.is_empty() {
        header.push(Cell::new("Process"));
    }
    header.push(Cell::new("Detail"));
    table.set_header(header);

    for rec in &health.records {
        let kind = match (rec.kind, rec.required) {
            (EntityKind::Service, _) => "service",
            (EntityKind::Infrastructure, true) => "infra",
            (EntityKind::Infrastructure, false) => "infra (optional)",
        };
        let mut row = vec![
            Cell::new(&rec.label),
            Cell::new(kind),
            Cell::new(rec.port.map(|p| p.to_string()).unwrap_or_else(|| "-".into()))
                .set_alignment(CellAlignment::Right),
            Cell::new(health_cell(rec.state, use_color)),
        ];
        if !processes.is_empty() {
            let process = processes
                .iter()
                .find(|p| p.service_id == rec.id)
                .map(|p| process_cell(p.status, use_color))
                .unwrap_or_else(|| "-".into());
            row.push(Cell::new(process));
        }
        row.push(Cell::new(detail(rec)));
        table.add_row(row);
    }
    table
}

fn detail(rec: &HealthRecord) -> String {
    match (&rec.message, rec.last_checked_at) {
        (Some(msg), _) => msg.clone(),
        (None, Some(at)) => format!("checked {}", at.format("%H:%M:%S")),
        (None, None) => String::new(),
    }
}

pub fn print_health(project: &str, health: &OverallHealth, processes: &[ProcessRecord]) {
    let use_color = std::io::stdout().is_terminal();
    println!();
    if use_color {
        println!("  {} {}", "stackwarden".bold(), project.cyan());
    } else {
        println!("  stackwarden {}", project);
    }
    println!();
    print_indented(&render_health(health, processes, use_color));
    println!();
    let verdict = if health.all_healthy { "all healthy" } else { "degraded" };
    if use_color {
        let verdict = if health.all_healthy {
            verdict.green().to_string()
        } else {
            verdict.yellow().to_string()
        };
        println!("  Overall: {}", verdict);
    } else {
        println!("  Overall: {}", verdict);
    }
    println!();
}

pub fn render_containers(containers: &[ContainerStatus]) -> Table {
    let mut table = new_table();
    table.set_header(vec!["Container", "State", "Ports"]);
    for c in containers {
        let ports = if c.ports.is_empty() {
            "-".to_string()
        } else {
            c.ports
                .iter()
                .map(|p| p.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        };
        table.add_row(vec![c.name.as_str(), c.state.as_str(), ports.as_str()]);
    }
    table
}

pub fn print_containers(file: &str, containers: &[ContainerStatus]) {
    println!();
    println!("  {}", file);
    if containers.is_empty() {
        println!("    no containers");
        return;
    }
    print_indented(&render_containers(containers));
}

/// One progress line, e.g. `[ 3/13] Runtime dependencies ... done`.
pub fn format_step(step: &ProvisioningStep, use_color: bool) -> String {
    let status = match step.status {
        StepStatus::Running => "...",
        StepStatus::Done => "done",
        StepStatus::Error => "failed",
        StepStatus::Skipped => "skipped",
    };
    let status = if use_color {
        match step.status {
            StepStatus::Running => status.dimmed().to_string(),
            StepStatus::Done => status.green().to_string(),
            StepStatus::Error => status.red().to_string(),
            StepStatus::Skipped => status.yellow().to_string(),
        }
    } else {
        status.to_string()
    };
    let width = step.total_steps.to_string().len();
    let mut line = format!(
        "[{:>width$}/{}] {} {}",
        step.step_index,
        step.total_steps,
        step.label,
        status,
        width = width
    );
    if let Some(message) = &step.message {
        line.push_str(": ");
        line.push_str(message);
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, kind: EntityKind, required: bool, state: HealthState) -> HealthRecord {
        HealthRecord {
            id: id.into(),
            label: id.into(),
            kind,
            required,
            state,
            port: Some(5432),
            last_checked_at: None,
            message: None,
        }
    }

    #[test]
    fn health_table_lists_every_record() {
        let health = OverallHealth {
            records: vec![
                record("api", EntityKind::Service, true, HealthState::Healthy),
                record("cache", EntityKind::Infrastructure, false, HealthState::Unhealthy),
            ],
            all_healthy: true,
        };
        let rendered = render_health(&health, &[], false).to_string();
        assert!(rendered.contains("api"));
        assert!(rendered.contains("infra (optional)"));
        assert!(rendered.contains("unhealthy"));
        assert!(!rendered.contains("Process"));
    }

    #[test]
    fn step_line_pads_index() {
        let step = ProvisioningStep {
            step_index: 3,
            total_steps: 13,
            label: "Runtime dependencies".into(),
            status: StepStatus::Done,
            message: None,
        };
        assert_eq!(format_step(&step, false), "[ 3/13] Runtime dependencies done");

        let skipped = ProvisioningStep {
            status: StepStatus::Skipped,
            message: Some("not configured".into()),
            ..step
        };
        assert_eq!(
            format_step(&skipped, false),
            "[ 3/13] Runtime dependencies skipped: not configured"
        );
    }

    #[test]
    fn container_ports_joined() {
        let rendered = render_containers(&[ContainerStatus {
            name: "stack-db-1".into(),
            state: "running".into(),
            ports: vec![5432, 6432],
        }])
        .to_string();
        assert!(rendered.contains("5432, 6432"));
    }
}
