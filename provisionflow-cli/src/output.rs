//! Rendering of run reports and catalog listings.

use std::fmt::Write as _;

use clap::ValueEnum;
use provisionflow::config::ResourceNames;
use provisionflow::pipeline::{PipelineCatalog, PipelineReport};

/// How the final report is printed on stdout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum ReportFormat {
    /// One line per stage plus a summary.
    #[default]
    Text,
    /// The full report as a JSON document.
    Json,
}

/// Renders a finished run.
pub fn render_report(report: &PipelineReport, format: ReportFormat) -> anyhow::Result<String> {
    match format {
        ReportFormat::Json => Ok(serde_json::to_string_pretty(report)?),
        ReportFormat::Text => Ok(report_text(report)),
    }
}

fn report_text(report: &PipelineReport) -> String {
    let mut out = String::new();
    for stage in &report.stages {
        let _ = write!(
            out,
            "{:<28} {:<10} attempts={}",
            stage.stage_name, stage.outcome, stage.attempts
        );
        if stage.fallback_used {
            out.push_str(" fallback");
        }
        if let Some(detail) = &stage.detail {
            let _ = write!(out, " ({detail})");
        }
        if let Some(error) = &stage.error {
            let _ = write!(out, " error: {}", error.message);
        }
        out.push('\n');
    }
    for name in &report.not_attempted {
        let _ = writeln!(out, "{name:<28} not attempted");
    }
    out.push_str(&report.summary());
    out
}

/// Lists every pipeline with its stages in execution order.
pub fn render_catalog(catalog: &PipelineCatalog) -> String {
    let mut out = String::new();
    for pipeline in catalog.pipelines() {
        let _ = writeln!(out, "{}", pipeline.name());
        for stage in pipeline.stage_names() {
            let _ = writeln!(out, "  {stage}");
        }
    }
    out
}

/// Renders the derived resource names as JSON.
pub fn render_names(names: &ResourceNames) -> anyhow::Result<String> {
    Ok(serde_json::to_string_pretty(names)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use provisionflow::config::EnvironmentConfig;
    use provisionflow::context::{RunIdentity, RunMode};
    use provisionflow::core::{StageKind, StageOutcome};
    use provisionflow::stages::StageResult;

    fn report() -> PipelineReport {
        let identity = RunIdentity::new("qa", "dataspace", RunMode::Provision);
        let mut report = PipelineReport::start(&identity);
        report.record(StageResult::new(
            "namespace",
            StageKind::Namespace,
            StageOutcome::Skipped,
            chrono::Utc::now(),
        ));
        report.stop_before(["rs-database".to_string()]);
        report.finish();
        report
    }

    #[test]
    fn test_text_report_lists_stages() {
        let text = render_report(&report(), ReportFormat::Text).unwrap();
        assert!(text.contains("namespace"));
        assert!(text.contains("rs-database"));
        assert!(text.contains("not attempted"));
    }

    #[test]
    fn test_json_report() {
        let text = render_report(&report(), ReportFormat::Json).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["pipeline"], "dataspace");
        assert_eq!(value["not_attempted"][0], "rs-database");
    }

    #[test]
    fn test_catalog_listing() {
        let config = EnvironmentConfig::new("qa").with_connector("alpha");
        let catalog = PipelineCatalog::from_config(&config).unwrap();
        let text = render_catalog(&catalog);
        assert!(text.contains("common-services"));
        assert!(text.contains("connector-alpha"));
    }
}
