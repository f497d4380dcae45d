//! Hand the report to the CI host: `$GITHUB_OUTPUT`, legacy `::set-output`
//! workflow commands, or JSON.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};

use crate::config::OutputFormat;
use crate::report::ReportOutput;

pub const FLAG_KEY: &str = "cancelled_jobs_flag";
pub const RUNS_KEY: &str = "cancelled_dbt_cloud_job_runs";
pub const MARKDOWN_KEY: &str = "cancelled_dbt_cloud_job_runs_markdown";

/// Output values as `(name, value)` pairs.
pub fn named_values(report: &ReportOutput) -> [(&'static str, String); 3] {
    let flag = if report.any_cancelled { "True" } else { "False" };
    let ids = report
        .cancelled_run_ids
        .iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(", ");
    [
        (FLAG_KEY, flag.to_string()),
        (RUNS_KEY, format!("[{}]", ids)),
        (MARKDOWN_KEY, report.markdown_summary.clone()),
    ]
}

/// Write the report in `format`. GitHub format appends to `github_output`
/// when set, otherwise prints workflow commands to `out`.
pub fn emit(
    format: OutputFormat,
    report: &ReportOutput,
    github_output: Option<&Path>,
    out: &mut dyn Write,
) -> Result<()> {
    match (format, github_output) {
        (OutputFormat::Json, _) => {
            serde_json::to_writer_pretty(&mut *out, report)?;
            writeln!(out)?;
        }
        (OutputFormat::Github, Some(path)) => append_github_output(path, report)?,
        (OutputFormat::Github, None) => {
            for (name, value) in named_values(report) {
                writeln!(out, "::set-output name={}::{}", name, value)?;
            }
        }
    }
    Ok(())
}

/// Append `name=value` lines, using heredoc syntax for multi-line values.
pub fn append_github_output(path: &Path, report: &ReportOutput) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open GITHUB_OUTPUT file: {}", path.display()))?;

    let mut buf = String::new();
    for (name, value) in named_values(report) {
        if value.contains('\n') {
            let mut delimiter = "DBT_CANCEL_STALE_EOF".to_string();
            while value.contains(&delimiter) {
                delimiter.push('_');
            }
            buf.push_str(&format!("{}<<{}\n{}\n{}\n", name, delimiter, value, delimiter));
        } else {
            buf.push_str(&format!("{}={}\n", name, value));
        }
    }

    file.write_all(buf.as_bytes())
        .with_context(|| format!("failed to write GITHUB_OUTPUT file: {}", path.display()))?;
    tracing::debug!(path = %path.display(), "Wrote step outputs");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report() -> ReportOutput {
        ReportOutput {
            any_cancelled: true,
            cancelled_run_ids: vec![100, 98],
            markdown_summary: "**heading**<br>  - Run **100**".into(),
        }
    }

    #[test]
    fn test_named_values() {
        let values = named_values(&report());
        assert_eq!(values[0], (FLAG_KEY, "True".to_string()));
        assert_eq!(values[1], (RUNS_KEY, "[100, 98]".to_string()));
        assert_eq!(values[2].0, MARKDOWN_KEY);

        let empty = ReportOutput {
            any_cancelled: false,
            cancelled_run_ids: vec![],
            markdown_summary: String::new(),
        };
        let values = named_values(&empty);
        assert_eq!(values[0].1, "False");
        assert_eq!(values[1].1, "[]");
    }

    #[test]
    fn test_set_output_commands() {
        let mut out = Vec::new();
        emit(OutputFormat::Github, &report(), None, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("::set-output name=cancelled_jobs_flag::True\n"));
        assert!(text.contains("::set-output name=cancelled_dbt_cloud_job_runs::[100, 98]\n"));
    }

    #[test]
    fn test_json_output() {
        let mut out = Vec::new();
        emit(OutputFormat::Json, &report(), None, &mut out).unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(parsed["any_cancelled"], true);
        assert_eq!(parsed["cancelled_run_ids"], serde_json::json!([100, 98]));
    }

    #[test]
    fn test_github_output_file_appends() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("github_output");
        std::fs::write(&path, "previous=1\n").unwrap();

        let mut multiline = report();
        multiline.markdown_summary = "line one\nline two".into();
        let mut stdout = Vec::new();
        emit(OutputFormat::Github, &multiline, Some(&path), &mut stdout).unwrap();

        assert!(stdout.is_empty());
        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.starts_with("previous=1\n"));
        assert!(written.contains("cancelled_jobs_flag=True\n"));
        assert!(written.contains("cancelled_dbt_cloud_job_runs=[100, 98]\n"));
        assert!(written.contains(
            "cancelled_dbt_cloud_job_runs_markdown<<DBT_CANCEL_STALE_EOF\n\
             line one\nline two\nDBT_CANCEL_STALE_EOF\n"
        ));
    }
}
