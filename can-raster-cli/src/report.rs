//! Console reports for decode runs and metrics
//!
//! Rendering returns a `String` so the layout can be tested without a
//! terminal.

use can_raster::outcome::percentage;
use can_raster::{GroupedMetrics, RunSummary};
use std::fmt::Write;

/// Files with more frames than this trigger the large-file advice
const LARGE_FILE_FRAMES: u64 = 100_000;

const RULE: &str = "═══════════════════════════════════════════════";

/// Render the end-of-run summary
pub fn render_summary(summary: &RunSummary) -> String {
    let mut out = String::new();
    write_summary(&mut out, summary).ok();
    out
}

fn write_summary(out: &mut String, summary: &RunSummary) -> std::fmt::Result {
    writeln!(out, "{}", RULE)?;
    writeln!(
        out,
        "  Done: {}/{} files decoded successfully",
        summary.success_count,
        summary.file_count()
    )?;
    writeln!(out, "{}", RULE)?;

    if summary.interrupted {
        writeln!(out, "\n⚠ Run interrupted, remaining files were not processed")?;
    }

    if summary.failed_count > 0 {
        writeln!(out, "\n⚠ {} files failed or produced no data:", summary.failed_count)?;
        for outcome in summary.outcomes.iter().filter(|o| !o.success) {
            writeln!(out, "\n  ✖ {} ({})", outcome.file_name, outcome.database)?;
            writeln!(out, "    Error: {}", outcome.error.as_deref().unwrap_or("unknown error"))?;
            if let Some(diagnostic) = &outcome.diagnostic {
                writeln!(out, "    Detail: {}", diagnostic)?;
            }
        }
    }

    let mut warned = summary.save_warnings().peekable();
    if warned.peek().is_some() {
        writeln!(out, "\n⚠ Save warnings:")?;
        for outcome in warned {
            writeln!(out, "  {}: {}", outcome.file_name, outcome.save_warnings.join(", "))?;
        }
    }

    if summary.total_frames > 0 {
        writeln!(out, "\n📊 Frames:")?;
        writeln!(out, "  Total:   {}", summary.total_frames)?;
        writeln!(
            out,
            "  Decoded: {} ({:.1}%)",
            summary.decoded_frames,
            summary.decode_rate()
        )?;
        writeln!(
            out,
            "  Errors:  {} ({:.1}%)",
            summary.error_count,
            percentage(summary.error_count, summary.total_frames)
        )?;
        if summary.data_points > 0 {
            writeln!(out, "  Data points: {}", summary.data_points)?;
        }
    }

    let taxonomy = summary.taxonomy_by_count();
    if !taxonomy.is_empty() {
        writeln!(out, "\nError types:")?;
        for (kind, count) in &taxonomy {
            writeln!(
                out,
                "  {}: {} ({:.1}%)",
                kind,
                count,
                percentage(*count, summary.error_count)
            )?;
        }

        writeln!(out, "\nHint: decode errors are usually caused by:")?;
        for (kind, _) in &taxonomy {
            writeln!(out, "  - {}: {}", kind, kind.hint())?;
        }
        writeln!(out, "  These frames were skipped; other frames were decoded normally.")?;
    }

    if summary
        .outcomes
        .iter()
        .any(|o| o.total_frames > LARGE_FILE_FRAMES)
    {
        writeln!(out, "\n💡 Large file advice:")?;
        writeln!(out, "  - use step = 0.05 or larger")?;
        writeln!(out, "  - restrict decoding with signal_names")?;
        writeln!(out, "  - reduce workers if memory runs short")?;
    }

    Ok(())
}

/// Render the per-group stage metrics
pub fn render_metrics(metrics: &GroupedMetrics) -> String {
    let mut out = String::new();
    write_metrics(&mut out, metrics).ok();
    out
}

fn write_metrics(out: &mut String, metrics: &GroupedMetrics) -> std::fmt::Result {
    writeln!(out, "{}", RULE)?;
    writeln!(out, "  Stage metrics: {} stages", metrics.stage_count())?;
    writeln!(out, "{}", RULE)?;

    for (label, records) in &metrics.groups {
        writeln!(out, "\n[{}] {} stages", label, records.len())?;
        for record in records {
            let mut line = format!(
                "  {} rows {}..={}",
                record.file, record.stage.start_index, record.stage.end_index
            );
            if let Some(throttle) = record.throttle {
                write!(line, " throttle={}", throttle)?;
            }
            for (name, change) in &record.changes {
                write!(line, " {}={:.3}", name, change)?;
            }
            if let Some(slip) = &record.slip {
                write!(
                    line,
                    " slip_time={:.3} monitor_diff={:.3} slip_WhlSpd={:.3}",
                    slip.slip_first_time, slip.monitor_diff, slip.slip_whl_spd
                )?;
            }
            writeln!(out, "{}", line)?;
        }
    }

    if !metrics.skipped.is_empty() {
        writeln!(out, "\nSkipped files:")?;
        for skipped in &metrics.skipped {
            writeln!(out, "  {}: {}", skipped.file, skipped.reason)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use can_raster::{DecodeErrorKind, FileOutcome, SkippedFile, Stage, StageMetrics};
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn outcome(name: &str, success: bool, total: u64, decoded: u64) -> FileOutcome {
        let mut outcome = FileOutcome::new(name, "chassis.dbc");
        outcome.success = success;
        outcome.total_frames = total;
        outcome.decoded_frames = decoded;
        outcome.error_count = total - decoded;
        outcome
    }

    #[test]
    fn test_summary_sections() {
        let mut ok = outcome("drive1.blf", true, 200_000, 150_000);
        ok.error_taxonomy.insert(DecodeErrorKind::UnknownMessage, 40_000);
        ok.error_taxonomy.insert(DecodeErrorKind::MalformedPayload, 10_000);
        ok.save_warnings.push(".csv: disk full".to_string());

        let mut failed = outcome("broken.blf", false, 0, 0);
        failed.fail_with_diagnostic("Failed to parse log file: bad magic", "LogParse(\"bad magic\")");

        let summary = RunSummary::from_outcomes(vec![ok, failed], Utc::now(), false);
        let text = render_summary(&summary);

        assert!(text.contains("Done: 1/2 files decoded successfully"));
        assert!(text.contains("✖ broken.blf (chassis.dbc)"));
        assert!(text.contains("Detail: LogParse"));
        assert!(text.contains("drive1.blf: .csv: disk full"));
        assert!(text.contains("Decoded: 150000 (75.0%)"));
        assert!(text.contains("UnknownMessage: 40000 (80.0%)"));
        assert!(text.contains("Large file advice"));

        let unknown = text.find("UnknownMessage: 40000").unwrap();
        let malformed = text.find("MalformedPayload: 10000").unwrap();
        assert!(unknown < malformed);
    }

    #[test]
    fn test_clean_summary_is_short() {
        let summary = RunSummary::from_outcomes(vec![outcome("a.asc", true, 10, 10)], Utc::now(), false);
        let text = render_summary(&summary);
        assert!(!text.contains("Error types"));
        assert!(!text.contains("Large file advice"));
        assert!(!text.contains("interrupted"));
    }

    #[test]
    fn test_metrics_rendering() {
        let mut groups = BTreeMap::new();
        groups.insert(
            "on_eco".to_string(),
            vec![StageMetrics {
                file: "on_eco_1.csv".to_string(),
                stage: Stage::new(3, 9),
                changes: BTreeMap::new(),
                slip: None,
                throttle: Some(40.0),
            }],
        );
        groups.insert("off_eco".to_string(), Vec::new());
        let metrics = GroupedMetrics {
            groups,
            skipped: vec![SkippedFile {
                file: "highway.csv".to_string(),
                reason: "no condition group matches the file name".to_string(),
            }],
        };

        let text = render_metrics(&metrics);
        assert!(text.contains("[off_eco] 0 stages"));
        assert!(text.contains("on_eco_1.csv rows 3..=9 throttle=40"));
        assert!(text.contains("highway.csv: no condition group"));
    }
}
