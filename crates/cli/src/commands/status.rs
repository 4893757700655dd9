//! Service health and metric snapshot commands

use anyhow::Result;
use colored::Colorize;
use tabled::Tabled;

use crate::client::ApiClient;
use crate::output::{
    color_status, format_age, format_timestamp, format_value, print_json, print_success,
    print_warning, OutputFormat,
};

/// Row for the component health table
#[derive(Tabled)]
struct ComponentRow {
    #[tabled(rename = "Component")]
    name: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Message")]
    message: String,
}

/// Row for the metric snapshot table
#[derive(Tabled)]
struct SeriesRow {
    #[tabled(rename = "Series")]
    name: String,
    #[tabled(rename = "Latest")]
    value: String,
}

/// Show service readiness; exits non-zero when the service is not ready
pub async fn show_health(client: &ApiClient, format: OutputFormat) -> Result<bool> {
    let report = client.health().await?;

    match format {
        OutputFormat::Json => print_json(&report)?,
        OutputFormat::Table => {
            println!("{}", "Predictor Health".bold());
            println!("{}", "=".repeat(50));
            println!("Service:        {}", client.base_url().as_str().cyan());
            println!("Status:         {}", color_status(&report.status));
            println!(
                "Model Loaded:   {}",
                if report.model_loaded { "yes".green() } else { "no".red() }
            );
            println!(
                "Last Fetch:     {}",
                report
                    .last_fetch_age
                    .map(|age| format!("{} ago", format_age(age)))
                    .unwrap_or_else(|| "never".to_string())
            );
            println!(
                "Threshold:      {}",
                format_age(report.staleness_threshold_secs as i64)
            );
            if let Some(reason) = &report.reason {
                println!("Reason:         {}", reason.yellow());
            }
            println!();

            let rows: Vec<ComponentRow> = report
                .components
                .iter()
                .map(|(name, health)| ComponentRow {
                    name: name.clone(),
                    status: color_status(&health.status),
                    message: health.message.clone().unwrap_or_default(),
                })
                .collect();

            if rows.is_empty() {
                print_warning("No components registered");
            } else {
                let table = tabled::Table::new(rows)
                    .with(tabled::settings::Style::rounded())
                    .to_string();
                println!("{}", table);
            }

            if report.is_ready() {
                println!();
                print_success("Predictor is ready");
            }
        }
    }

    Ok(report.is_ready())
}

/// Show the latest per-series values from the last successful fetch
pub async fn show_metrics(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let snapshot = client.current_metrics().await?;

    match format {
        OutputFormat::Json => print_json(&snapshot)?,
        OutputFormat::Table => {
            println!("{}", "Current Metrics".bold());
            println!("{}", "=".repeat(50));
            println!("Fetched At: {}", format_timestamp(&snapshot.timestamp));
            println!();

            let rows: Vec<SeriesRow> = snapshot
                .metrics
                .iter()
                .map(|(name, value)| SeriesRow {
                    name: name.clone(),
                    value: format_value(*value),
                })
                .collect();

            let table = tabled::Table::new(rows)
                .with(tabled::settings::Style::rounded())
                .to_string();
            println!("{}", table);

            if !snapshot.missing.is_empty() {
                println!();
                print_warning(&format!("Missing series: {}", snapshot.missing.join(", ")));
            }
        }
    }

    Ok(())
}
