use grantbridge_core::{ApiManager, SourceOverview};
use serde::Serialize;

use crate::cli::SourcesArgs;
use crate::error::CliError;

use super::CommandResult;

#[derive(Debug, Serialize)]
struct SourcesResponseData {
    sources: Vec<SourceOverview>,
}

pub fn run(args: &SourcesArgs, manager: &ApiManager) -> Result<CommandResult, CliError> {
    if let Some(id) = &args.source {
        manager.is_enabled(id)?;
    }

    let sources = manager
        .source_overview()
        .into_iter()
        .filter(|overview| {
            args.source
                .as_deref()
                .map_or(true, |id| overview.source.as_str() == id.trim())
        })
        .collect::<Vec<_>>();
    let ids = sources.iter().map(|overview| overview.source.clone()).collect();

    let mut result = CommandResult::ok(serde_json::to_value(SourcesResponseData { sources })?, ids);
    for overview in manager.source_overview() {
        if overview.requires_credential && !overview.enabled && overview.credential_lookup.is_none() {
            result = result.with_warning(format!(
                "source '{}' has no credential and will not be queried",
                overview.source
            ));
        }
    }
    Ok(result)
}
