use crate::orchestrator::JobResult;
use crate::registry::{ClusterInfo, PlannedStep};
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets, Attribute, Cell, Color, Table};
use cumulus_executor::TaskState;

fn header(labels: &[&str]) -> Vec<Cell> {
    labels
        .iter()
        .map(|l| Cell::new(l).add_attribute(Attribute::Bold).fg(Color::Cyan))
        .collect()
}

fn state_cell(state: TaskState) -> Cell {
    let color = match state {
        TaskState::Succeeded => Color::Green,
        TaskState::Failed => Color::Red,
        TaskState::TimedOut => Color::Magenta,
        TaskState::Pending | TaskState::Submitted | TaskState::Running => Color::Yellow,
    };
    Cell::new(state.to_string()).fg(color)
}

/// One row per step, in the order the steps were released.
pub fn format_step_table(result: &JobResult) -> String {
    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(header(&["Step", "Cluster", "State", "Attempts", "Detail"]));

    for step in &result.steps {
        let detail = match (&step.error_kind, &step.message) {
            (Some(kind), Some(message)) => format!("{}: {}", kind, message),
            _ => step.log_ref.clone().unwrap_or_default(),
        };
        table.add_row(vec![
            Cell::new(&step.step).fg(Color::Yellow),
            Cell::new(&step.cluster),
            state_cell(step.state),
            Cell::new(step.attempts),
            Cell::new(detail),
        ]);
    }
    table.to_string()
}

pub fn format_output_table(result: &JobResult) -> String {
    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(header(&["Output", "Path", "Size", "SHA-256"]));

    for output in &result.outputs {
        table.add_row(vec![
            Cell::new(&output.name).fg(Color::Yellow),
            Cell::new(output.path.to_string_lossy().as_ref()),
            Cell::new(output.size),
            Cell::new(output.sha256.get(..12).unwrap_or(&output.sha256)),
        ]);
    }
    table.to_string()
}

pub fn format_cluster_table(clusters: &[ClusterInfo]) -> String {
    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(header(&["Name", "Endpoint", "Auth", "TLS", "Bound steps"]));

    for cluster in clusters {
        let mut name = cluster.name.clone();
        if cluster.dedicated {
            name.push_str(" (dedicated)");
        }
        table.add_row(vec![
            Cell::new(name).fg(Color::Yellow),
            Cell::new(&cluster.endpoint),
            Cell::new(cluster.auth.to_string()),
            Cell::new(if cluster.verify_tls { "verify" } else { "off" }),
            Cell::new(cluster.steps.join(", ")),
        ]);
    }
    table.to_string()
}

pub fn format_plan_table(plan: &[PlannedStep]) -> String {
    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(header(&["#", "Step", "Cluster", "Placement"]));

    for (i, row) in plan.iter().enumerate() {
        table.add_row(vec![
            Cell::new(i + 1),
            Cell::new(&row.step).fg(Color::Yellow),
            Cell::new(&row.cluster),
            Cell::new(if row.explicit { "bound" } else { "round-robin" }),
        ]);
    }
    table.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use cumulus_core::model::AuthKind;

    #[test]
    fn test_cluster_table_lists_bindings() {
        let table = format_cluster_table(&[ClusterInfo {
            index: 0,
            name: "gpu".into(),
            endpoint: "https://gpu.example.org".into(),
            auth: AuthKind::Basic,
            verify_tls: false,
            dedicated: true,
            steps: vec!["train".into(), "eval".into()],
        }]);
        assert!(table.contains("gpu (dedicated)"));
        assert!(table.contains("train, eval"));
        assert!(table.contains("basic"));
    }
}
