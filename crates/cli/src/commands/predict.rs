//! Prediction and external-metric commands

use anyhow::Result;
use colored::Colorize;
use std::time::Duration;
use tabled::Tabled;

use crate::client::{ApiClient, ClientError, ScalerMetric};
use crate::output::{
    color_confidence, color_status, format_timestamp, format_value, print_error, print_info,
    print_json, print_warning, OutputFormat,
};

/// Row for the features table
#[derive(Tabled)]
struct FeatureRow {
    #[tabled(rename = "Feature")]
    name: String,
    #[tabled(rename = "Value")]
    value: String,
}

/// Show the cached prediction, optionally forcing a refresh first
pub async fn show_prediction(
    client: &ApiClient,
    refresh: bool,
    features: bool,
    format: OutputFormat,
) -> Result<()> {
    let report = match client.prediction(refresh, features).await {
        Ok(report) => report,
        Err(ClientError::Api { code: Some(code), .. }) if code == "not_ready" => {
            print_info("The service has not completed its first refresh cycle");
            print_info("Check `ppctl health` for the reason");
            anyhow::bail!("no prediction available yet");
        }
        Err(e) => return Err(e.into()),
    };

    match format {
        OutputFormat::Json => print_json(&report)?,
        OutputFormat::Table => {
            println!("{}", "Replica Prediction".bold());
            println!("{}", "=".repeat(50));
            println!(
                "Predicted Pods: {}",
                report.predicted_pod_count.to_string().cyan().bold()
            );
            println!("Confidence:     {}", color_confidence(report.confidence));
            println!("Model Version:  {}", report.model_version);
            println!("Generated At:   {}", format_timestamp(&report.timestamp));
            if report.stale {
                print_warning("Prediction is older than one refresh interval");
            }
            if let Some(err) = &report.refresh_error {
                print_warning(&format!("Refresh failed, showing cached prediction: {}", err));
            }

            if !report.metrics_used.is_empty() {
                println!();
                println!("{}", "Metrics Used".bold());
                println!("{}", "-".repeat(50));
                for (name, value) in &report.metrics_used {
                    println!("{:<20} {}", name, format_value(Some(*value)));
                }
            }

            if let Some(vector) = &report.features {
                println!();
                let rows: Vec<FeatureRow> = vector
                    .features
                    .iter()
                    .map(|f| FeatureRow {
                        name: f.name.clone(),
                        value: format_value(Some(f.value)),
                    })
                    .collect();
                let table = tabled::Table::new(rows)
                    .with(tabled::settings::Style::rounded())
                    .to_string();
                println!("{}", table);
                println!("\nTotal: {} features", vector.features.len());
            }
        }
    }

    Ok(())
}

/// Show the value served to the autoscaler
pub async fn show_scaler_metric(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let metric = client.scaler_metric().await?;

    match format {
        OutputFormat::Json => print_json(&metric)?,
        OutputFormat::Table => {
            println!("{}", "External Metric".bold());
            println!("{}", "=".repeat(50));
            println!("Metric Name:  {}", metric.metric_name.cyan());
            println!("Metric Value: {}", metric.metric_value.to_string().bold());
            println!("Timestamp:    {}", format_timestamp(&metric.timestamp));
            println!("Flags:        {}", flags(&metric));
            if metric.fallback {
                print_info("No prediction yet; the service reports its minimum replica count");
            }
        }
    }

    Ok(())
}

/// Poll the external metric every `interval`, one line per poll
pub async fn watch(
    client: &ApiClient,
    interval: Duration,
    count: Option<u64>,
    format: OutputFormat,
) -> Result<()> {
    let mut ticker = tokio::time::interval(interval);
    let mut polls = 0u64;

    if format == OutputFormat::Table {
        println!("{}", format!("{:<20} {:>6}  {}", "TIME", "PODS", "FLAGS").bold());
    }

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => break,
        }

        match client.scaler_metric().await {
            Ok(metric) => match format {
                OutputFormat::Json => println!("{}", serde_json::to_string(&metric)?),
                OutputFormat::Table => println!(
                    "{:<20} {:>6}  {}",
                    format_timestamp(&metric.timestamp),
                    metric.metric_value,
                    flags(&metric)
                ),
            },
            Err(e) => print_error(&e.to_string()),
        }

        polls += 1;
        if count.is_some_and(|limit| polls >= limit) {
            break;
        }
    }

    Ok(())
}

fn flags(metric: &ScalerMetric) -> String {
    let mut flags = Vec::new();
    if metric.stale {
        flags.push(color_status("stale"));
    }
    if metric.fallback {
        flags.push(color_status("fallback"));
    }
    if flags.is_empty() {
        "fresh".green().to_string()
    } else {
        flags.join(",")
    }
}
