//! Result formatting for the CI step outputs.

use serde::Serialize;

use crate::orchestrator::CancelledRun;

const MARKDOWN_HEADING: &str = "**The following dbt Cloud job runs were cancelled \
to free up the queue for the new CI job on the current PR:**";

/// The three values handed to the output adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportOutput {
    pub any_cancelled: bool,
    pub cancelled_run_ids: Vec<u64>,
    pub markdown_summary: String,
}

impl ReportOutput {
    pub fn from_cancelled(cancelled: &[CancelledRun]) -> Self {
        let cancelled_run_ids: Vec<u64> = cancelled.iter().map(|c| c.run_id).collect();
        Self {
            any_cancelled: !cancelled_run_ids.is_empty(),
            cancelled_run_ids,
            markdown_summary: format_markdown(cancelled),
        }
    }
}

/// One `<br>`-separated bullet per cancelled run, suitable for a PR comment.
/// Empty when nothing was cancelled. Timestamps are shown as dbt Cloud sent them.
pub fn format_markdown(cancelled: &[CancelledRun]) -> String {
    if cancelled.is_empty() {
        return String::new();
    }

    let mut markdown = MARKDOWN_HEADING.to_string();
    for run in cancelled {
        markdown.push_str(&format!(
            "<br>  - Run **{}** was cancelled at **{} UTC**, \
             view this run in dbt Cloud [here]({})",
            run.run_id, run.cancelled_at_text, run.url,
        ));
    }
    markdown
}
