use std::fmt::Write as _;

use anyhow::Context as _;

use crate::asserter::format_diffs;
use crate::replayer::TestResult;

/// Output formats for replay reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Format {
    #[default]
    Text,
    Junit,
    Tap,
    Json,
}

impl Format {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "text" => Some(Self::Text),
            "junit" => Some(Self::Junit),
            "tap" => Some(Self::Tap),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

/// Renders replay results in the requested format.
pub fn report(results: &[TestResult], format: Format) -> anyhow::Result<String> {
    match format {
        Format::Text => Ok(report_text(results)),
        Format::Junit => Ok(report_junit(results)),
        Format::Tap => Ok(report_tap(results)),
        Format::Json => {
            serde_json::to_string_pretty(results).context("serialize results as JSON")
        }
    }
}

fn report_text(results: &[TestResult]) -> String {
    let mut out = String::new();
    let (mut passed, mut failed, mut errored) = (0, 0, 0);

    for result in results {
        let duration = format_duration(result);
        if !result.error.is_empty() {
            errored += 1;
            let _ = writeln!(out, "ERROR {} ({duration})", result.snapshot_path);
            let _ = writeln!(out, "  {}\n", result.error);
        } else if result.passed {
            passed += 1;
            let _ = writeln!(out, "PASS  {} ({duration})", result.snapshot_path);
        } else {
            failed += 1;
            let _ = writeln!(out, "FAIL  {} ({duration})", result.snapshot_path);
            out.push_str(&format_diffs(&result.diffs));
            out.push('\n');
        }
    }

    let _ = write!(
        out,
        "\nResults: {passed} passed, {failed} failed, {errored} errors, {} total\n",
        results.len()
    );
    out
}

fn report_junit(results: &[TestResult]) -> String {
    let failures = results
        .iter()
        .filter(|r| r.error.is_empty() && !r.passed)
        .count();
    let errors = results.iter().filter(|r| !r.error.is_empty()).count();

    let mut out = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    out.push_str("<testsuites>\n");
    let _ = writeln!(
        out,
        "  <testsuite name=\"snapshot-tests\" tests=\"{}\" failures=\"{failures}\" errors=\"{errors}\">",
        results.len()
    );

    for result in results {
        let name = xml_escape(&result.snapshot_path);
        let time = result.duration.as_secs_f64();
        if !result.error.is_empty() {
            let _ = writeln!(out, "    <testcase name=\"{name}\" time=\"{time:.3}\">");
            let message = xml_escape(&result.error);
            let _ = writeln!(
                out,
                "      <error message=\"{message}\">{message}</error>"
            );
            out.push_str("    </testcase>\n");
        } else if !result.passed {
            let _ = writeln!(out, "    <testcase name=\"{name}\" time=\"{time:.3}\">");
            let _ = writeln!(
                out,
                "      <failure message=\"{} differences found\">{}</failure>",
                result.diffs.len(),
                xml_escape(&format_diffs(&result.diffs))
            );
            out.push_str("    </testcase>\n");
        } else {
            let _ = writeln!(out, "    <testcase name=\"{name}\" time=\"{time:.3}\"/>");
        }
    }

    out.push_str("  </testsuite>\n</testsuites>\n");
    out
}

fn report_tap(results: &[TestResult]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "TAP version 13");
    let _ = writeln!(out, "1..{}", results.len());

    for (index, result) in results.iter().enumerate() {
        let num = index + 1;
        if !result.error.is_empty() {
            let _ = writeln!(out, "not ok {num} - {}", result.snapshot_path);
            let _ = writeln!(out, "  ---\n  error: {}\n  ...", result.error);
        } else if result.passed {
            let _ = writeln!(out, "ok {num} - {}", result.snapshot_path);
        } else {
            let _ = writeln!(out, "not ok {num} - {}", result.snapshot_path);
            out.push_str("  ---\n");
            for diff in &result.diffs {
                let _ = writeln!(out, "  - path: {}\n    message: {}", diff.path, diff.message);
            }
            out.push_str("  ...\n");
        }
    }
    out
}

fn format_duration(result: &TestResult) -> String {
    format!("{:.1?}", result.duration)
}

fn xml_escape(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}
