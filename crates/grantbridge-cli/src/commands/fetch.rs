use std::time::Instant;

use grantbridge_core::{ApiManager, SourceOutcome};

use crate::cli::FetchArgs;
use crate::error::CliError;

use super::{elapsed_ms, notice_for, search_params, CommandResult, Notice};

pub async fn run(args: &FetchArgs, manager: &ApiManager) -> Result<CommandResult, CliError> {
    let params = search_params(&args.query, &args.shared)?;

    let started = Instant::now();
    let result = manager.get_grants_from_source(&args.source, &params).await?;
    let latency_ms = elapsed_ms(started);

    let notice = notice_for(result.source.as_str(), &result.outcome)?;
    let cache_hit = result.outcome == SourceOutcome::Cached;
    let source = result.source.clone();

    let mut command_result = CommandResult::ok(serde_json::to_value(&result)?, vec![source])
        .with_latency(latency_ms)
        .with_cache_hit(cache_hit);
    match notice {
        Some(Notice::Warning(warning)) => command_result = command_result.with_warning(warning),
        Some(Notice::Error(error)) => command_result = command_result.with_errors(vec![error]),
        None => {}
    }
    Ok(command_result)
}
