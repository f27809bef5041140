use crate::model::OutputSection;

/// Commands like `kubectl get all` or `kubectl get pods,svc` print one table
/// per resource kind, separated by blank lines.
pub fn is_multi_resource_listing(command: &str) -> bool {
    let mut tokens = command.split_whitespace().skip(1);
    match (tokens.next(), tokens.next()) {
        (Some("get"), Some(resources)) => resources == "all" || resources.contains(','),
        _ => false,
    }
}

/// Partitions table output into one section per header block. Blocks that do
/// not start with a `NAME` header are dropped.
pub fn split_sections(output: &str) -> Vec<OutputSection> {
    let mut sections = Vec::new();
    let mut block = Vec::new();
    for line in output.lines() {
        if line.trim().is_empty() {
            push_block(&mut sections, &mut block);
        } else {
            block.push(line);
        }
    }
    push_block(&mut sections, &mut block);
    sections
}

pub fn render_sections(sections: &[OutputSection]) -> String {
    sections
        .iter()
        .map(|section| format!("=== {} ===\n{}", section.title, section.content))
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn push_block(sections: &mut Vec<OutputSection>, block: &mut Vec<&str>) {
    if block.is_empty() {
        return;
    }
    let lines = std::mem::take(block);
    let Some(name_column) = header_name_column(lines[0]) else {
        return;
    };

    let title = lines
        .get(1)
        .and_then(|row| row.split_whitespace().nth(name_column))
        .and_then(|name| name.split_once('/'))
        .map(|(kind, _)| section_title(kind))
        .unwrap_or_else(|| "Resources".to_string());

    sections.push(OutputSection {
        title,
        content: lines.join("\n"),
    });
}

fn header_name_column(header: &str) -> Option<usize> {
    let mut columns = header.split_whitespace();
    match (columns.next(), columns.next()) {
        (Some("NAME"), _) => Some(0),
        (Some("NAMESPACE"), Some("NAME")) => Some(1),
        _ => None,
    }
}

fn section_title(kind: &str) -> String {
    let kind = kind.split('.').next().unwrap_or(kind);
    let known = match kind {
        "pod" => Some("Pods"),
        "service" => Some("Services"),
        "deployment" => Some("Deployments"),
        "replicaset" => Some("ReplicaSets"),
        "statefulset" => Some("StatefulSets"),
        "daemonset" => Some("DaemonSets"),
        "job" => Some("Jobs"),
        "cronjob" => Some("CronJobs"),
        "horizontalpodautoscaler" => Some("HorizontalPodAutoscalers"),
        "replicationcontroller" => Some("ReplicationControllers"),
        _ => None,
    };
    if let Some(title) = known {
        return title.to_string();
    }

    let mut chars = kind.chars().filter(|c| c.is_alphanumeric() || *c == '_');
    match chars.next() {
        Some(first) => format!("{}{}s", first.to_ascii_uppercase(), chars.collect::<String>()),
        None => "Resources".to_string(),
    }
}
