use std::time::Instant;

use grantbridge_core::{ApiManager, SourceId, SourceOutcome, SourceSelection};

use crate::cli::SearchArgs;
use crate::error::CliError;

use super::{elapsed_ms, notice_for, search_params, CommandResult, Notice};

pub async fn run(args: &SearchArgs, manager: &ApiManager) -> Result<CommandResult, CliError> {
    let params = search_params(&args.query, &args.shared)?;
    let selection = if args.sources.is_empty() {
        SourceSelection::All
    } else {
        SourceSelection::Only(args.sources.clone())
    };

    let started = Instant::now();
    let results = manager.search_opportunities(&params, &selection).await;
    let latency_ms = elapsed_ms(started);

    let mut warnings = Vec::new();
    let mut errors = Vec::new();
    for report in &results.sources {
        match notice_for(&report.source, &report.outcome)? {
            Some(Notice::Warning(warning)) => warnings.push(warning),
            Some(Notice::Error(error)) => errors.push(error),
            None => {}
        }
    }
    if results.is_partial() {
        warnings.push(format!(
            "partial results: {} of {} sources answered",
            results.available_count(),
            results.sources.len()
        ));
    }

    let answered = results
        .sources
        .iter()
        .filter(|report| report.outcome.is_available())
        .collect::<Vec<_>>();
    let cache_hit = !answered.is_empty()
        && answered
            .iter()
            .all(|report| report.outcome == SourceOutcome::Cached);
    let sources = answered
        .iter()
        .filter_map(|report| SourceId::parse(&report.source).ok())
        .collect();

    let mut command_result = CommandResult::ok(serde_json::to_value(&results)?, sources)
        .with_errors(errors)
        .with_latency(latency_ms)
        .with_cache_hit(cache_hit);
    for warning in warnings {
        command_result = command_result.with_warning(warning);
    }
    Ok(command_result)
}
