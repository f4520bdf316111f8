use colored::Colorize;

use crate::cloud::NetworkUsage;
use crate::drift::{DriftResult, DriftType};
use crate::server::{ComputeServer, State};
use crate::store::services::Purchase;

/// Print a success message.
pub fn print_success(msg: &str) {
    println!("{} {}", "✓".green().bold(), msg.green());
}

/// Print an error message.
pub fn print_error(msg: &str) {
    println!("{} {}", "✗".red().bold(), msg.red());
}

pub fn state_colored(state: State) -> String {
    match state {
        State::Running => state.as_str().green().to_string(),
        State::Off | State::Deprovisioned => state.as_str().dimmed().to_string(),
        State::Suspended => state.as_str().blue().to_string(),
        State::Unknown => state.as_str().red().to_string(),
        State::Starting | State::Stopping | State::Suspending => {
            state.as_str().yellow().to_string()
        }
    }
}

/// Print the lifecycle state an operation ended in.
pub fn print_state(id: i64, state: State) {
    println!("  {} {}", format!("#{}", id).bold(), state_colored(state));
}

/// Print a table of compute servers.
pub fn print_server_list(servers: &[ComputeServer]) {
    if servers.is_empty() {
        println!("{}", "No compute servers.".dimmed());
        return;
    }

    println!();
    println!("{}", "Compute Servers".bold().cyan());
    println!("{}", "─".repeat(80));
    println!(
        "  {:<6} {:<24} {:<14} {:<15} {}",
        "ID".bold(),
        "TITLE".bold(),
        "CLOUD".bold(),
        "STATE".bold(),
        "$/HOUR".bold()
    );
    println!("{}", "─".repeat(80));

    for server in servers {
        // Pad before coloring; escape codes break width formatting.
        let state = format!("{:<15}", server.state.as_str());
        let state = match server.state {
            State::Running => state.green().to_string(),
            State::Off | State::Deprovisioned => state.dimmed().to_string(),
            State::Unknown => state.red().to_string(),
            _ => state.yellow().to_string(),
        };
        println!(
            "  {:<6} {:<24} {:<14} {} {:.4}",
            server.id,
            truncate(&server.title, 24),
            server.cloud.as_str(),
            state,
            server.cost_per_hour
        );
        if let Some(error) = &server.error {
            println!("         {} {}", "!".red(), error.red());
        }
    }

    println!();
    println!("  {} server(s) total.", servers.len());
    println!();
}

/// Print one compute server in detail.
pub fn print_server_detail(server: &ComputeServer) {
    println!();
    println!(
        "{} {}",
        "Compute server:".bold().cyan(),
        format!("#{} {}", server.id, server.title).bold()
    );
    println!("{}", "─".repeat(60));
    println!("  {:<18} {}", "Account:".bold(), server.account_id);
    println!("  {:<18} {}", "Project:".bold(), server.project_id);
    println!("  {:<18} {}", "Cloud:".bold(), server.cloud);
    println!("  {:<18} {}", "State:".bold(), state_colored(server.state));
    println!(
        "  {:<18} ${:.4}/hour",
        "Cost:".bold(),
        server.cost_per_hour
    );
    if let Some(error) = &server.error {
        println!("  {:<18} {}", "Error:".bold(), error.red());
    }
    println!("  {:<18} {}", "Created:".bold(), server.created_at);
    println!("  {:<18} {}", "Updated:".bold(), server.updated_at);

    if let Ok(map) = server.configuration.to_map() {
        println!();
        println!("  {}:", "Configuration".bold());
        for (key, value) in &map {
            if key == "cloud" {
                continue;
            }
            let display_value = if key == "authToken" {
                "(sensitive)".dimmed().to_string()
            } else {
                format_value_short(value)
            };
            println!("    {:<20} = {}", key, display_value);
        }
    }

    let provisioned = if server.provisioned_configuration.is_some() {
        "recorded".to_string()
    } else {
        "never started".dimmed().to_string()
    };
    println!();
    println!("  {:<18} {}", "Provisioned:".bold(), provisioned);
    println!("{}", "─".repeat(60));
    println!();
}

/// Print configuration drift since the last start.
pub fn print_drift(id: i64, drifts: &[DriftResult]) {
    if drifts.is_empty() {
        print_success(&format!(
            "No drift detected. Compute server {} matches its provisioned configuration.",
            id
        ));
        return;
    }

    println!();
    println!(
        "{}",
        format!("Drift Detected ({} keys)", drifts.len())
            .bold()
            .yellow()
    );
    println!("{}", "─".repeat(60));
    for drift in drifts {
        let icon = match drift.drift_type {
            DriftType::Added => drift.drift_type.symbol().green().to_string(),
            DriftType::Removed => drift.drift_type.symbol().red().to_string(),
            DriftType::Changed => drift.drift_type.symbol().yellow().to_string(),
        };
        let before = drift
            .provisioned
            .as_ref()
            .map(format_value_short)
            .unwrap_or_else(|| "(unset)".to_string());
        let after = drift
            .current
            .as_ref()
            .map(format_value_short)
            .unwrap_or_else(|| "(unset)".to_string());
        println!(
            "  {} {} {} → {}",
            icon,
            drift.key.bold(),
            before.dimmed(),
            after
        );
    }
    println!("{}", "─".repeat(60));
    println!();
}

/// Print the current hourly rate and the purchase history.
pub fn print_cost(server: &ComputeServer, cost_per_hour: f64, purchases: &[Purchase]) {
    println!();
    println!(
        "{} {} ({})",
        format!("${:.4}/hour", cost_per_hour).bold(),
        format!("for #{}", server.id).dimmed(),
        state_colored(server.state)
    );

    if purchases.is_empty() {
        println!("  {}", "No purchases recorded.".dimmed());
        println!();
        return;
    }

    println!("{}", "─".repeat(80));
    for purchase in purchases {
        let end = match &purchase.ended_at {
            Some(end) => end.clone(),
            None => "open".green().to_string(),
        };
        println!(
            "  {:<12} {:>9.4}  {} → {}",
            purchase.state.as_str(),
            purchase.cost_per_hour,
            purchase.started_at.dimmed(),
            end
        );
    }
    println!("{}", "─".repeat(80));
    println!();
}

pub fn print_network_usage(id: i64, hours: u32, usage: &NetworkUsage) {
    println!(
        "  {} {:.3} GiB over the last {} hour(s), ${:.4}",
        format!("#{}", id).bold(),
        usage.amount,
        hours,
        usage.cost
    );
}

fn format_value_short(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => format!("\"{}\"", s),
        serde_json::Value::Null => "null".dimmed().to_string(),
        serde_json::Value::Array(arr) if arr.len() > 3 => format!("[{} items]", arr.len()),
        other => other.to_string(),
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max.saturating_sub(1)).collect();
        format!("{}…", cut)
    }
}
