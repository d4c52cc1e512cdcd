use console::{Emoji, StyledObject, style};

use crate::core::model::{
    DataSourceCheck, E2EReport, EdgeStatus, FlowGraphReport, HistoryReport, PipelineReport,
    RunReport, Status,
};
use crate::core::topology::Topology;

pub static SUCCESS_ICON: Emoji<'_, '_> = Emoji("✅ ", "");
pub static INFO_ICON: Emoji<'_, '_> = Emoji("ℹ️  ", "");
pub static WARN_ICON: Emoji<'_, '_> = Emoji("⚠️  ", "");
pub static ERROR_ICON: Emoji<'_, '_> = Emoji("❌ ", "");
pub static IDLE_ICON: Emoji<'_, '_> = Emoji("💤 ", "");
pub static GLOBE: Emoji<'_, '_> = Emoji("🌐 ", "");
pub static SPARKLE: Emoji<'_, '_> = Emoji("✨ ", "");

pub fn print_info(msg: &str) {
    println!("{} {}", INFO_ICON, style(msg).blue());
}

pub fn print_error(msg: &str) {
    eprintln!("{} {}", ERROR_ICON, style(msg).red().bold());
}

pub fn print_step(step: &str) {
    println!("{} {}", SPARKLE, style(step).bold());
}

pub fn print_link(label: &str, url: &str) {
    println!(
        "  {} {}: {}",
        GLOBE,
        style(label).bold(),
        style(url).underlined().cyan()
    );
}

fn icon(status: Status) -> &'static Emoji<'static, 'static> {
    match status {
        Status::Healthy => &SUCCESS_ICON,
        Status::Warning => &WARN_ICON,
        Status::Error => &ERROR_ICON,
        Status::Idle => &IDLE_ICON,
    }
}

pub fn badge(status: Status) -> StyledObject<&'static str> {
    let s = style(status.as_str());
    match status {
        Status::Healthy => s.green().bold(),
        Status::Warning => s.yellow().bold(),
        Status::Error => s.red().bold(),
        Status::Idle => s.dim(),
    }
}

fn edge_badge(status: EdgeStatus) -> StyledObject<&'static str> {
    match status {
        EdgeStatus::Active => style("active").green(),
        EdgeStatus::Stale => style("stale").yellow(),
        EdgeStatus::Broken => style("broken").red(),
    }
}

fn print_header(title: &str, status: Status) {
    println!(
        "\n{}{} {}",
        icon(status),
        style(title).bold().underlined(),
        badge(status)
    );
}

fn print_table_check(id: &str, check: &DataSourceCheck) {
    let last = check
        .last_sync
        .map(|d| d.to_string())
        .unwrap_or_else(|| "never".to_string());
    println!(
        "  {}{:<24} {:>8} rows  last {}  {}",
        icon(check.status),
        style(id).cyan(),
        check.row_count,
        last,
        badge(check.status)
    );
    for issue in &check.issues {
        println!("      {}", style(issue).dim());
    }
}

pub fn print_pipeline(report: &PipelineReport) {
    print_header("Pipeline check", report.overall_status);

    println!("\n {}", style("Sources").bold());
    for (category, status) in &report.source_categories {
        println!("  {:<12} {}", style(category).magenta(), badge(*status));
    }
    for (id, check) in &report.sources {
        print_table_check(id, check);
    }

    println!("\n {}", style("Master tables").bold());
    for (id, check) in &report.master_tables {
        print_table_check(id, check);
    }

    println!(
        "\n {} {}",
        style("Consistency").bold(),
        badge(report.consistency.status)
    );
    for check in &report.consistency.checks {
        let mark = if check.passed {
            &SUCCESS_ICON
        } else {
            icon(check.severity)
        };
        println!("  {}{}: {}", mark, check.name, style(&check.message).dim());
    }
}

pub fn print_flow(report: &FlowGraphReport) {
    print_header("Pipeline flow", Status::worst(report.nodes.iter().map(|n| n.status)));
    for node in &report.nodes {
        println!(
            "  {}{:<24} {:<13} {:<12} {}",
            icon(node.status),
            style(&node.id).cyan(),
            node.node_type.as_str(),
            node.metadata.freshness_label,
            badge(node.status)
        );
    }
    println!("\n {}", style("Edges").bold());
    for edge in &report.edges {
        println!(
            "  {} -[{}]-> {}  {}",
            edge.from,
            edge.label,
            edge.to,
            edge_badge(edge.status)
        );
    }
}

pub fn print_e2e(report: &E2EReport) {
    print_header("End-to-end checks", report.overall_status);
    for check in &report.checks {
        let timing = check
            .response_time
            .map(|ms| format!("{}ms", ms))
            .unwrap_or_default();
        println!(
            "  {}[{:?}] {:<32} {:>8}  {}",
            icon(check.status),
            check.layer,
            check.name,
            timing,
            style(&check.message).dim()
        );
    }
    let s = &report.summary;
    let avg = s
        .avg_response_time
        .map(|v| format!("{:.0}ms", v))
        .unwrap_or_else(|| "n/a".to_string());
    println!(
        "\n  {} total, {} healthy, {} warning, {} error, avg {}",
        s.total,
        style(s.healthy).green(),
        style(s.warning).yellow(),
        style(s.error).red(),
        avg
    );
}

pub fn print_history(report: &HistoryReport) {
    println!("\n{}", style("Run history").bold().underlined());
    if report.logs.is_empty() {
        print_info("No runs recorded yet.");
        return;
    }
    for log in &report.logs {
        let e = &log.entry;
        println!(
            "  {}{}  {}  score {:>5.1}  revenue(7d) {:>12.2}",
            icon(e.overall_status),
            e.timestamp.format("%Y-%m-%d %H:%M:%S"),
            badge(e.overall_status),
            log.health_score,
            e.revenue_7d
        );
    }
    let s = &report.summary;
    println!(
        "\n  {} runs, {:.1}% healthy, avg revenue(7d) {:.2}",
        s.total_runs, s.health_percentage, s.avg_revenue_7d
    );
}

pub fn print_run(report: &RunReport) {
    print_pipeline(&report.pipeline);
    print_flow(&report.flow);
    print_e2e(&report.e2e);
    print_step(&format!(
        "Run {} finished: {} (health score {:.1})",
        report.run_id,
        report.overall_status,
        report.health_score
    ));
    if let Some(err) = &report.history_error {
        println!("{} {}", WARN_ICON, style(format!("Not recorded to history: {}", err)).yellow());
    }
}

pub fn print_topology(topology: &Topology) {
    println!("\n{}", style("Pipeline topology").bold().underlined());
    for (stage, ids) in topology.stages() {
        println!("  {:<13} {}", style(stage).magenta(), ids.join(", "));
    }
    println!("\n {}", style("Reconciliation rules").bold());
    for rule in &topology.rules {
        println!("  - {}", rule.name);
    }
    println!("\n {}", style("Probed endpoints").bold());
    for endpoint in &topology.e2e.endpoints {
        println!("  - {} ({})", endpoint.path, endpoint.name);
    }
}
