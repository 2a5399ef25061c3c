use std::path::Path;

use anyhow::{anyhow, Result};
use serde::Deserialize;

const ANSI_GREEN: &str = "\x1b[32m";
const ANSI_YELLOW: &str = "\x1b[33m";
const ANSI_RED: &str = "\x1b[31m";
const ANSI_RESET: &str = "\x1b[0m";


/// Metrics gathered over one run. `None` means the producing stage did not
/// run (or its byproduct was unreadable).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunMetrics {
    /// Fraction of clean bases with Q >= 30.
    pub q30_rate: Option<f64>,
    pub mean_read_length: Option<f64>,
    /// Fraction of G/C in clean reads.
    pub gc_content: Option<f64>,
    /// Fraction of duplicated reads.
    pub duplication_rate: Option<f64>,
    pub raw_reads: Option<u64>,
    pub clean_reads: Option<u64>,
    /// Percentage of mapped reads.
    pub alignment_rate: Option<f64>,
}


// fastp JSON report, reduced to the fields the report uses
#[derive(Debug, Default, Deserialize)]
struct FastpReport {
    summary: Option<FastpSummary>,
    duplication: Option<FastpDuplication>,
}

#[derive(Debug, Default, Deserialize)]
struct FastpSummary {
    before_filtering: Option<FilteringStats>,
    after_filtering: Option<FilteringStats>,
}

#[derive(Debug, Default, Deserialize)]
struct FilteringStats {
    total_reads: Option<u64>,
    q30_rate: Option<f64>,
    read1_mean_length: Option<f64>,
    read2_mean_length: Option<f64>,
    gc_content: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct FastpDuplication {
    rate: Option<f64>,
}


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlignmentSeverity {
    High,
    Marginal,
    Low,
}

impl AlignmentSeverity {
    pub fn from_rate(percent: f64) -> Self {
        if percent >= 90.0 {
            AlignmentSeverity::High
        } else if percent >= 70.0 {
            AlignmentSeverity::Marginal
        } else {
            AlignmentSeverity::Low
        }
    }

    fn label(&self) -> &'static str {
        match self {
            AlignmentSeverity::High => "high confidence",
            AlignmentSeverity::Marginal => "marginal",
            AlignmentSeverity::Low => "low confidence",
        }
    }

    fn color(&self) -> &'static str {
        match self {
            AlignmentSeverity::High => ANSI_GREEN,
            AlignmentSeverity::Marginal => ANSI_YELLOW,
            AlignmentSeverity::Low => ANSI_RED,
        }
    }
}


/// Owns the RunMetrics of a run and renders the final report.
#[derive(Debug, Default)]
pub struct MetricsAggregator {
    metrics: RunMetrics,
}

impl MetricsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn metrics(&self) -> &RunMetrics {
        &self.metrics
    }

    /// Reads QC metrics from a fastp JSON report. Fields missing from the
    /// report leave the corresponding metric untouched.
    pub async fn ingest_fastp_json(&mut self, path: &Path) -> Result<()> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Cannot read {}: {}", path.display(), e))?;
        self.ingest_fastp_str(&raw)
            .map_err(|e| anyhow!("Cannot parse {}: {}", path.display(), e))
    }

    fn ingest_fastp_str(&mut self, raw: &str) -> Result<()> {
        let report: FastpReport = serde_json::from_str(raw)?;
        let summary = report.summary.unwrap_or_default();
        let before = summary.before_filtering.unwrap_or_default();
        let after = summary.after_filtering.unwrap_or_default();

        set_if_some(&mut self.metrics.raw_reads, before.total_reads);
        set_if_some(&mut self.metrics.clean_reads, after.total_reads);
        set_if_some(&mut self.metrics.q30_rate, after.q30_rate);
        set_if_some(&mut self.metrics.gc_content, after.gc_content);

        let lengths: Vec<f64> = [after.read1_mean_length, after.read2_mean_length]
            .into_iter()
            .flatten()
            .collect();
        if !lengths.is_empty() {
            self.metrics.mean_read_length = Some(lengths.iter().sum::<f64>() / lengths.len() as f64);
        }
        set_if_some(
            &mut self.metrics.duplication_rate,
            report.duplication.and_then(|d| d.rate),
        );
        Ok(())
    }

    /// Reads the alignment rate from `samtools flagstat` output.
    pub async fn ingest_flagstat(&mut self, path: &Path) -> Result<()> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Cannot read {}: {}", path.display(), e))?;
        match parse_flagstat_mapped(&raw) {
            Some(rate) => {
                self.metrics.alignment_rate = Some(rate);
                Ok(())
            }
            None => Err(anyhow!("No mapped-percentage line in {}", path.display())),
        }
    }

    /// Fills the duplication rate from `samtools markdup -f` statistics when
    /// fastp has not already set it.
    pub async fn ingest_markdup(&mut self, path: &Path) -> Result<()> {
        if self.metrics.duplication_rate.is_some() {
            return Ok(());
        }
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Cannot read {}: {}", path.display(), e))?;
        match parse_markdup_rate(&raw) {
            Some(rate) => {
                self.metrics.duplication_rate = Some(rate);
                Ok(())
            }
            None => Err(anyhow!("No READ or DUPLICATE TOTAL count in {}", path.display())),
        }
    }

    /// Renders the seven report lines. With `terminal` set, the alignment
    /// rate is colored and annotated with its severity.
    pub fn render(&self, terminal: bool) -> String {
        let m = &self.metrics;
        let alignment = match m.alignment_rate {
            Some(rate) if terminal => {
                let severity = AlignmentSeverity::from_rate(rate);
                format!("{}{:.2}%{} ({})", severity.color(), rate, ANSI_RESET, severity.label())
            }
            Some(rate) => format!("{:.2}%", rate),
            None => "NA".to_string(),
        };

        let lines = [
            format!("Q30 rate: {}", percent(m.q30_rate)),
            format!("Mean clean read length: {}", m.mean_read_length.map(|l| format!("{:.0}", l)).unwrap_or_else(na)),
            format!("GC content: {}", percent(m.gc_content)),
            format!("Duplication rate: {}", percent(m.duplication_rate)),
            format!("Total raw reads: {}", m.raw_reads.map(|n| n.to_string()).unwrap_or_else(na)),
            format!("Total clean reads: {}", m.clean_reads.map(|n| n.to_string()).unwrap_or_else(na)),
            format!("Alignment rate: {}", alignment),
        ];
        let mut out = lines.join("\n");
        out.push('\n');
        out
    }

    /// Writes the plain rendition to `path`.
    pub async fn write_report(&self, path: &Path) -> Result<()> {
        tokio::fs::write(path, self.render(false))
            .await
            .map_err(|e| anyhow!("Failed to write report {}: {}", path.display(), e))
    }
}

fn set_if_some<T>(slot: &mut Option<T>, value: Option<T>) {
    if value.is_some() {
        *slot = value;
    }
}

fn na() -> String {
    "NA".to_string()
}

fn percent(fraction: Option<f64>) -> String {
    fraction
        .map(|f| format!("{:.2}%", f * 100.0))
        .unwrap_or_else(na)
}

/// Extracts the percentage from the `<n> + <m> mapped (<pct>% : ...)` line.
fn parse_flagstat_mapped(raw: &str) -> Option<f64> {
    raw.lines().find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 5 || fields[1] != "+" || fields[3] != "mapped" {
            return None;
        }
        fields[4]
            .trim_start_matches('(')
            .trim_end_matches('%')
            .parse::<f64>()
            .ok()
    })
}

// DUPLICATE TOTAL / READ, as a fraction like fastp's rate
fn parse_markdup_rate(raw: &str) -> Option<f64> {
    let count = |key: &str| {
        raw.lines().find_map(|line| {
            let (name, value) = line.split_once(':')?;
            if name.trim() != key {
                return None;
            }
            value.trim().parse::<u64>().ok()
        })
    };
    let read = count("READ").filter(|n| *n > 0)?;
    let duplicates = count("DUPLICATE TOTAL")?;
    Some(duplicates as f64 / read as f64)
}


#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const FASTP_PE: &str = r#"{
        "summary": {
            "fastp_version": "0.23.4",
            "before_filtering": {"total_reads": 2000, "total_bases": 300000, "q30_rate": 0.9, "read1_mean_length": 150, "read2_mean_length": 150, "gc_content": 0.41},
            "after_filtering": {"total_reads": 1900, "total_bases": 270000, "q30_rate": 0.9512, "read1_mean_length": 142, "read2_mean_length": 140, "gc_content": 0.4155}
        },
        "duplication": {"rate": 0.0873},
        "filtering_result": {"passed_filter_reads": 1900}
    }"#;

    const FLAGSTAT: &str = "\
2000 + 0 in total (QC-passed reads + QC-failed reads)
1990 + 0 primary
0 + 0 secondary
1902 + 0 mapped (95.10% : N/A)
1902 + 0 primary mapped (95.10% : N/A)
";

    #[test]
    fn test_fastp_fields() -> Result<()> {
        let mut agg = MetricsAggregator::new();
        agg.ingest_fastp_str(FASTP_PE)?;
        let m = agg.metrics();
        assert_eq!(m.raw_reads, Some(2000));
        assert_eq!(m.clean_reads, Some(1900));
        assert_eq!(m.q30_rate, Some(0.9512));
        assert_eq!(m.mean_read_length, Some(141.0));
        assert_eq!(m.gc_content, Some(0.4155));
        assert_eq!(m.duplication_rate, Some(0.0873));
        assert_eq!(m.alignment_rate, None);
        Ok(())
    }

    #[test]
    fn test_fastp_missing_sections_left_unset() -> Result<()> {
        let mut agg = MetricsAggregator::new();
        agg.ingest_fastp_str(r#"{"summary": {"after_filtering": {"total_reads": 10}}}"#)?;
        let m = agg.metrics();
        assert_eq!(m.clean_reads, Some(10));
        assert_eq!(m.raw_reads, None);
        assert_eq!(m.duplication_rate, None);
        assert_eq!(m.mean_read_length, None);
        Ok(())
    }

    #[test]
    fn test_fastp_malformed() {
        let mut agg = MetricsAggregator::new();
        assert!(agg.ingest_fastp_str("{not json").is_err());
        assert_eq!(agg.metrics(), &RunMetrics::default());
    }

    #[test]
    fn test_flagstat_mapped_line() {
        assert_eq!(parse_flagstat_mapped(FLAGSTAT), Some(95.10));
        assert_eq!(parse_flagstat_mapped("0 + 0 mapped (N/A : N/A)\n"), None);
        assert_eq!(parse_flagstat_mapped(""), None);
    }

    #[test]
    fn test_markdup_rate() {
        let stats = "COMMAND: samtools markdup -r -f s.markdup.txt\nREAD: 400\nDUPLICATE PAIR: 40\n\
                     DUPLICATE PRIMARY TOTAL: 48\nDUPLICATE TOTAL: 50\n";
        assert_eq!(parse_markdup_rate(stats), Some(0.125));
        assert_eq!(parse_markdup_rate("READ: 0\nDUPLICATE TOTAL: 0\n"), None);
        assert_eq!(parse_markdup_rate("READ: 10\n"), None);
    }

    #[tokio::test]
    async fn test_markdup_does_not_override_fastp() -> Result<()> {
        let dir = tempdir()?;
        let stats = dir.path().join("s.markdup.txt");
        std::fs::write(&stats, "READ: 1000\nDUPLICATE TOTAL: 300\n")?;

        let mut agg = MetricsAggregator::new();
        agg.ingest_markdup(&stats).await?;
        assert_eq!(agg.metrics().duplication_rate, Some(0.3));

        let mut agg = MetricsAggregator::new();
        agg.ingest_fastp_str(FASTP_PE)?;
        let from_fastp = agg.metrics().duplication_rate;
        agg.ingest_markdup(&stats).await?;
        assert_eq!(agg.metrics().duplication_rate, from_fastp);
        Ok(())
    }

    #[test]
    fn test_severity_bands() {
        assert_eq!(AlignmentSeverity::from_rate(90.0), AlignmentSeverity::High);
        assert_eq!(AlignmentSeverity::from_rate(89.99), AlignmentSeverity::Marginal);
        assert_eq!(AlignmentSeverity::from_rate(70.0), AlignmentSeverity::Marginal);
        assert_eq!(AlignmentSeverity::from_rate(69.9), AlignmentSeverity::Low);
    }

    #[tokio::test]
    async fn test_report_plain_and_terminal() -> Result<()> {
        let dir = tempdir()?;
        let json = dir.path().join("s.fastp.json");
        let flagstat = dir.path().join("s.flagstat.txt");
        std::fs::write(&json, FASTP_PE)?;
        std::fs::write(&flagstat, FLAGSTAT)?;

        let mut agg = MetricsAggregator::new();
        agg.ingest_fastp_json(&json).await?;
        agg.ingest_flagstat(&flagstat).await?;

        let plain = agg.render(false);
        assert_eq!(
            plain,
            "Q30 rate: 95.12%\n\
             Mean clean read length: 141\n\
             GC content: 41.55%\n\
             Duplication rate: 8.73%\n\
             Total raw reads: 2000\n\
             Total clean reads: 1900\n\
             Alignment rate: 95.10%\n"
        );
        assert!(!plain.contains('\x1b'));

        let terminal = agg.render(true);
        assert!(terminal.contains(ANSI_GREEN));
        assert!(terminal.contains("high confidence"));

        let report = dir.path().join("s.atacflow.report.txt");
        agg.write_report(&report).await?;
        assert_eq!(std::fs::read_to_string(&report)?, plain);
        Ok(())
    }

    #[test]
    fn test_report_all_unset() {
        let rendered = MetricsAggregator::new().render(true);
        assert_eq!(rendered.lines().count(), 7);
        assert!(rendered.lines().all(|l| l.ends_with("NA")));
    }
}
