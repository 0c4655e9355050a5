//! Output formatting for CLI commands.
//!
//! This module provides formatting utilities for displaying
//! information to the user in various formats.

use colored::Colorize;
use std::collections::BTreeMap;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::config::ValidationResult;
use crate::model::ResourceId;
use crate::planner::{ActionKind, ChangePlan, DependencyGraph, Outcome, RunReport};
use crate::provider::{Drift, DriftReport};
use crate::state::{LockInfo, ResourceState, RunHistoryEntry};

use super::commands::OutputFormat;

/// Output formatter for CLI.
#[derive(Debug)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Plan action row for table display.
#[derive(Tabled)]
struct PlanActionRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Reason")]
    reason: String,
}

/// Run outcome row for table display.
#[derive(Tabled)]
struct OutcomeRow {
    #[tabled(rename = "Level")]
    level: usize,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Attempts")]
    attempts: u32,
    #[tabled(rename = "Detail")]
    detail: String,
}

/// Recorded resource row for table display.
#[derive(Tabled)]
struct StateRow {
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Revision")]
    revision: u64,
    #[tabled(rename = "Last applied")]
    last_applied: String,
    #[tabled(rename = "Fingerprint")]
    fingerprint: String,
}

/// Run history row for table display.
#[derive(Tabled)]
struct HistoryRow {
    #[tabled(rename = "Run")]
    run_id: String,
    #[tabled(rename = "Finished")]
    timestamp: String,
    #[tabled(rename = "Result")]
    result: String,
    #[tabled(rename = "Changed")]
    changed: usize,
    #[tabled(rename = "Failed")]
    failed: usize,
    #[tabled(rename = "Skipped")]
    skipped: usize,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Returns true when emitting JSON.
    #[must_use]
    pub const fn is_json(&self) -> bool {
        matches!(self.format, OutputFormat::Json)
    }

    /// Formats a change plan for display.
    #[must_use]
    pub fn format_plan(&self, plan: &ChangePlan, detailed: bool) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(plan).unwrap_or_default(),
            OutputFormat::Text => Self::format_plan_text(plan, detailed),
        }
    }

    /// Formats a plan as text.
    fn format_plan_text(plan: &ChangePlan, detailed: bool) -> String {
        if plan.is_empty() {
            return format!("{} No changes required - infrastructure is up to date.\n", "✓".green());
        }

        let mut output = String::from("\nChange Plan\n\n");

        let rows: Vec<PlanActionRow> = plan
            .changes()
            .enumerate()
            .map(|(i, a)| PlanActionRow {
                index: i + 1,
                action: Self::format_action_kind(a.kind),
                resource: a.id.to_string(),
                reason: Self::truncate(&a.reason, 48),
            })
            .collect();

        output.push_str(&Table::new(rows).to_string());
        output.push('\n');

        if detailed {
            output.push_str("\nAttribute changes:\n");
            for action in plan.changes().filter(|a| !a.changes.is_empty()) {
                let _ = writeln!(output, "   {}", action.id);
                for change in &action.changes {
                    let _ = writeln!(output, "     {change}");
                }
            }
        }

        let _ = write!(
            output,
            "\nPlan: {} to create, {} to update, {} to delete\n",
            plan.count(ActionKind::Create).to_string().green(),
            plan.count(ActionKind::Update).to_string().yellow(),
            plan.count(ActionKind::Delete).to_string().red()
        );

        output
    }

    /// Formats a run report.
    #[must_use]
    pub fn format_report(&self, report: &RunReport) -> String {
        match self.format {
            OutputFormat::Json => {
                let json = serde_json::json!({
                    "run_id": report.run_id,
                    "success": report.is_success(),
                    "cancelled": report.cancelled,
                    "started_at": report.started_at,
                    "finished_at": report.finished_at,
                    "counts": report.counts(),
                    "outcomes": report.outcomes,
                });
                serde_json::to_string_pretty(&json).unwrap_or_default()
            }
            OutputFormat::Text => Self::format_report_text(report),
        }
    }

    fn format_report_text(report: &RunReport) -> String {
        let status = if report.is_success() {
            format!("{} Run {} succeeded", "✓".green(), report.run_id)
        } else if report.cancelled {
            format!("{} Run {} cancelled", "⚠".yellow(), report.run_id)
        } else {
            format!("{} Run {} failed", "✗".red(), report.run_id)
        };

        let mut output = format!("{status}\n\n");

        let rows: Vec<OutcomeRow> = report
            .outcomes
            .iter()
            .filter(|o| o.action != ActionKind::NoOp || !matches!(o.outcome, Outcome::Success))
            .map(|o| {
                let (status, detail) = match &o.outcome {
                    Outcome::Success => ("ok".green().to_string(), String::new()),
                    Outcome::Failed { reason } => ("failed".red().to_string(), Self::truncate(reason, 48)),
                    Outcome::Skipped { reason } => ("skipped".yellow().to_string(), Self::truncate(reason, 48)),
                };
                OutcomeRow {
                    level: o.level,
                    resource: o.id.to_string(),
                    action: Self::format_action_kind(o.action),
                    status,
                    attempts: o.attempts,
                    detail,
                }
            })
            .collect();

        if !rows.is_empty() {
            output.push_str(&Table::new(rows).to_string());
            output.push_str("\n\n");
        }

        let counts = report.counts();
        let _ = writeln!(output, "   Created: {}", counts.created);
        let _ = writeln!(output, "   Updated: {}", counts.updated);
        let _ = writeln!(output, "   Deleted: {}", counts.deleted);
        let _ = writeln!(output, "   Unchanged: {}", counts.unchanged);
        if counts.failed > 0 {
            let _ = writeln!(output, "   Failed: {}", counts.failed.to_string().red());
        }
        if counts.skipped > 0 {
            let _ = writeln!(output, "   Skipped: {}", counts.skipped.to_string().yellow());
        }

        output
    }

    /// Formats a drift report.
    #[must_use]
    pub fn format_drift(&self, report: &DriftReport) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(report).unwrap_or_default(),
            OutputFormat::Text => {
                if report.is_empty() {
                    return format!(
                        "{} No drift detected across {} resources.\n",
                        "✓".green(),
                        report.checked
                    );
                }

                let mut output = format!("{} Drift detected:\n\n", "⚠".yellow());
                for (id, drift) in &report.entries {
                    match drift {
                        Drift::Missing => {
                            let _ = writeln!(output, "   - {id}: missing on target");
                        }
                        Drift::Changed { attributes } => {
                            let _ = writeln!(output, "   - {id}:");
                            for (name, observed) in attributes {
                                let observed = observed.as_ref().map_or_else(|| String::from("(absent)"), ToString::to_string);
                                let _ = writeln!(output, "       {name} is now {observed}");
                            }
                        }
                    }
                }
                let _ = write!(output, "\n{}/{} resources have drifted.\n", report.len(), report.checked);
                output
            }
        }
    }

    /// Formats a validation result.
    #[must_use]
    pub fn format_validation(&self, result: &ValidationResult, resources: usize, show_warnings: bool) -> String {
        match self.format {
            OutputFormat::Json => {
                let json = serde_json::json!({
                    "valid": result.errors.is_empty(),
                    "resources": resources,
                    "errors": result
                        .errors
                        .iter()
                        .map(|e| serde_json::json!({ "field": e.field, "message": e.message }))
                        .collect::<Vec<_>>(),
                    "warnings": result.warnings,
                });
                serde_json::to_string_pretty(&json).unwrap_or_default()
            }
            OutputFormat::Text => {
                let mut output = String::new();
                if result.errors.is_empty() {
                    let _ = writeln!(output, "{} Configuration is valid ({resources} resources).", "✓".green());
                } else {
                    let _ = writeln!(output, "{} Configuration has {} error(s):", "✗".red(), result.errors.len());
                    for error in &result.errors {
                        let _ = writeln!(output, "   - {}: {}", error.field, error.message);
                    }
                }

                if show_warnings && !result.warnings.is_empty() {
                    let _ = writeln!(output, "\n{} Warnings:", "⚠".yellow());
                    for warning in &result.warnings {
                        let _ = writeln!(output, "   - {warning}");
                    }
                }
                output
            }
        }
    }

    /// Formats the dependency graph as levels.
    #[must_use]
    pub fn format_graph(&self, graph: &DependencyGraph) -> String {
        match self.format {
            OutputFormat::Json => {
                let edges: Vec<_> = graph
                    .edges()
                    .into_iter()
                    .map(|(from, to, kind)| serde_json::json!({ "from": from, "to": to, "kind": kind }))
                    .collect();
                let json = serde_json::json!({ "levels": graph.levels(), "edges": edges });
                serde_json::to_string_pretty(&json).unwrap_or_default()
            }
            OutputFormat::Text => {
                let mut output = String::new();
                for (level, ids) in graph.levels().iter().enumerate() {
                    let names: Vec<String> = ids.iter().map(ToString::to_string).collect();
                    let _ = writeln!(output, "Level {level}: {}", names.join(", "));
                }
                if output.is_empty() {
                    output.push_str("No resources declared.\n");
                }
                output
            }
        }
    }

    /// Formats the recorded state of one resource.
    #[must_use]
    pub fn format_resource_state(&self, state: &ResourceState) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(state).unwrap_or_default(),
            OutputFormat::Text => {
                let mut output = format!("\n{}\n\n", state.id.to_string().bold());
                let _ = writeln!(output, "   Revision: {}", state.revision);
                let _ = writeln!(output, "   Last applied: {}", state.last_applied.format("%Y-%m-%d %H:%M:%S"));
                let _ = writeln!(output, "   Fingerprint: {}", Self::truncate(&state.fingerprint, 16));

                if !state.dependencies.is_empty() {
                    let deps: Vec<String> = state.dependencies.iter().map(ToString::to_string).collect();
                    let _ = writeln!(output, "   Depends on: {}", deps.join(", "));
                }

                output.push_str("\n   Attributes:\n");
                for (name, value) in &state.attributes {
                    match state.applied.get(name) {
                        Some(applied) if applied != value => {
                            let _ = writeln!(output, "     {name} = {value} ({applied})");
                        }
                        _ => {
                            let _ = writeln!(output, "     {name} = {value}");
                        }
                    }
                }

                if !state.outputs.is_empty() {
                    output.push_str("\n   Outputs:\n");
                    for (name, value) in &state.outputs {
                        let _ = writeln!(output, "     {name} = {value}");
                    }
                }
                output
            }
        }
    }

    /// Formats the list of recorded resources.
    #[must_use]
    pub fn format_state_list(&self, states: &BTreeMap<ResourceId, ResourceState>, lock: Option<&LockInfo>) -> String {
        match self.format {
            OutputFormat::Json => {
                let json = serde_json::json!({
                    "lock": lock,
                    "resources": states.values().collect::<Vec<_>>(),
                });
                serde_json::to_string_pretty(&json).unwrap_or_default()
            }
            OutputFormat::Text => {
                let mut output = String::new();
                if let Some(lock) = lock {
                    let _ = writeln!(
                        output,
                        "{} Locked by run {} ({}) for another {}s\n",
                        "⚠".yellow(),
                        lock.run_id,
                        lock.holder,
                        lock.remaining_secs()
                    );
                }

                if states.is_empty() {
                    output.push_str("No resources recorded.\n");
                    return output;
                }

                let rows: Vec<StateRow> = states
                    .values()
                    .map(|s| StateRow {
                        resource: s.id.to_string(),
                        revision: s.revision,
                        last_applied: s.last_applied.format("%Y-%m-%d %H:%M").to_string(),
                        fingerprint: Self::truncate(&s.fingerprint, 12),
                    })
                    .collect();

                output.push_str(&Table::new(rows).to_string());
                output.push('\n');
                output
            }
        }
    }

    /// Formats the most recent `limit` history entries, newest first.
    #[must_use]
    pub fn format_history(&self, history: &[RunHistoryEntry], limit: usize) -> String {
        let recent: Vec<&RunHistoryEntry> = history.iter().rev().take(limit).collect();

        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(&recent).unwrap_or_default(),
            OutputFormat::Text => {
                if recent.is_empty() {
                    return String::from("No runs recorded.\n");
                }

                let rows: Vec<HistoryRow> = recent
                    .iter()
                    .map(|e| HistoryRow {
                        run_id: e.run_id.clone(),
                        timestamp: e.timestamp.format("%Y-%m-%d %H:%M").to_string(),
                        result: if e.success {
                            "✓".green().to_string()
                        } else if e.cancelled {
                            "cancelled".yellow().to_string()
                        } else {
                            "✗".red().to_string()
                        },
                        changed: e.changed,
                        failed: e.failed,
                        skipped: e.skipped,
                    })
                    .collect();

                let mut output = Table::new(rows).to_string();
                output.push('\n');
                for entry in recent.iter().filter(|e| e.error.is_some()) {
                    let _ = writeln!(output, "   {}: {}", entry.run_id, entry.error.as_deref().unwrap_or_default());
                }
                output
            }
        }
    }

    /// Formats a one-line status message.
    #[must_use]
    pub fn message(&self, status: MessageKind, message: &str) -> String {
        match self.format {
            OutputFormat::Json => {
                let json = serde_json::json!({ "status": status.label(), "message": message });
                serde_json::to_string_pretty(&json).unwrap_or_default()
            }
            OutputFormat::Text => {
                let marker = match status {
                    MessageKind::Success => "✓".green(),
                    MessageKind::Warning => "⚠".yellow(),
                    MessageKind::Error => "✗".red(),
                };
                format!("{marker} {message}")
            }
        }
    }

    /// Formats an action kind with color.
    fn format_action_kind(kind: ActionKind) -> String {
        match kind {
            ActionKind::Create => "+create".green().to_string(),
            ActionKind::Update => "~update".yellow().to_string(),
            ActionKind::Delete => "-delete".red().to_string(),
            ActionKind::NoOp => "noop".dimmed().to_string(),
        }
    }

    /// Truncates a string to a maximum number of characters.
    fn truncate(s: &str, max_len: usize) -> String {
        if s.chars().count() <= max_len {
            s.to_string()
        } else {
            let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
            format!("{kept}...")
        }
    }
}

/// Severity of a status message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Operation completed.
    Success,
    /// Something needs attention.
    Warning,
    /// Operation failed.
    Error,
}

impl MessageKind {
    const fn label(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}
