//! Learned strategy table

use anyhow::Result;
use chrono::Utc;
use tabled::Tabled;
use warden_lib::{FailureSignature, StrategyStat};

use crate::client::ApiClient;
use crate::output::{color_rate, format_age, print_json, print_rows, OutputFormat};

/// Row for the strategy table
#[derive(Tabled)]
struct StrategyRow {
    #[tabled(rename = "Signature")]
    signature: String,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Attempts")]
    attempts: u64,
    #[tabled(rename = "Successes")]
    successes: u64,
    #[tabled(rename = "Success Rate")]
    rate: String,
    #[tabled(rename = "Last Success")]
    last_success: String,
}

/// Show stats, optionally for one failure signature
pub async fn show_strategies(
    client: &ApiClient,
    signature: Option<FailureSignature>,
    format: OutputFormat,
) -> Result<()> {
    let stats: Vec<StrategyStat> = client.get("api/v1/strategies").await?;
    let stats = filter_by_signature(stats, signature);

    match format {
        OutputFormat::Json => print_json(&stats)?,
        OutputFormat::Table => {
            let now = Utc::now();
            let rows: Vec<StrategyRow> = stats
                .iter()
                .map(|s| StrategyRow {
                    signature: s.failure_signature.to_string(),
                    action: s.action.to_string(),
                    attempts: s.attempt_count,
                    successes: s.success_count,
                    rate: color_rate(s.success_rate),
                    last_success: format_age(s.last_success_at, now),
                })
                .collect();
            print_rows(rows, "No strategy data recorded yet");
        }
    }

    Ok(())
}

fn filter_by_signature(
    stats: Vec<StrategyStat>,
    signature: Option<FailureSignature>,
) -> Vec<StrategyStat> {
    match signature {
        Some(signature) => stats
            .into_iter()
            .filter(|s| s.failure_signature == signature)
            .collect(),
        None => stats,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_lib::RecoveryAction;

    fn stat(signature: FailureSignature, action: RecoveryAction) -> StrategyStat {
        StrategyStat {
            failure_signature: signature,
            action,
            attempt_count: 1,
            success_count: 1,
            success_rate: 1.0,
            last_updated: Utc::now(),
            last_success_at: None,
        }
    }

    #[test]
    fn test_filter_by_signature() {
        let stats = vec![
            stat(FailureSignature::Oom, RecoveryAction::MemoryCleanup),
            stat(FailureSignature::HungProcess, RecoveryAction::Restart),
        ];
        let filtered = filter_by_signature(stats.clone(), Some(FailureSignature::Oom));
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].action, RecoveryAction::MemoryCleanup);
        assert_eq!(filter_by_signature(stats, None).len(), 2);
    }
}
