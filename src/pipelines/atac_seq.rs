use std::fmt;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info, warn};

use crate::config::defs::{
    Layout, Mode, PipelineConfig, PipelineError, ResumeMetricsPolicy, SamtoolsSubcommand, BAM_SAMPLE_RECORDS,
    MIN_MAPQ, SAMTOOLS_TAG, STAR_GENOME_PARAMETERS,
};
use crate::pipelines::stages::{plan, required_tools, SampleFiles, StageKind};
use crate::utils::classify::{check_content, classify, extracted_reads, layout_from_flags, parse_sam_flags, resolve_sra_layout};
use crate::utils::command::samtools::SamtoolsConfig;
use crate::utils::command::{bam_coverage, fasterq_dump, fastp, macs3, samtools, star, ToolCall, ToolInvoker};
use crate::utils::file::remove_if_exists;
use crate::utils::gate::{Artifact, StepGate};
use crate::utils::metrics::{MetricsAggregator, RunMetrics};
use crate::utils::reference::{index_dir, index_files, read_effective_genome_size};

// Intermediates of the duplicate-removal chain, in creation order.
const DEDUP_TMP_STEPS: [&str; 4] = ["namesort", "fixmate", "possort", "markdup"];


/// Position in the plan, used only for progress lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepCounter {
    step: usize,
    total: usize,
}

impl StepCounter {
    pub fn new(total: usize) -> Self {
        StepCounter { step: 0, total }
    }

    pub fn next(self) -> Self {
        StepCounter { step: self.step + 1, ..self }
    }
}

impl fmt::Display for StepCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}/{}]", self.step, self.total)
    }
}


/// Outcome of a completed run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub mode: Mode,
    /// None when no stage needed the layout (e.g. a fully resumed BAM run).
    pub layout: Option<Layout>,
    pub ran: Vec<StageKind>,
    pub skipped: Vec<StageKind>,
    pub metrics: RunMetrics,
    pub report: PathBuf,
}


/// Drives the stage list of one mode, gating every stage on its artifact.
pub struct StageSequencer<'a, T: ToolInvoker> {
    config: Arc<PipelineConfig>,
    invoker: &'a T,
    gate: StepGate,
    files: SampleFiles,
    index_dir: PathBuf,
    mode: Mode,
    layout: Option<Layout>,
    /// Raw reads fed to QC; set up front for FASTQ, after extraction for SRA.
    reads: Vec<PathBuf>,
    aggregator: MetricsAggregator,
}

impl<'a, T: ToolInvoker> StageSequencer<'a, T> {
    pub fn new(config: Arc<PipelineConfig>, mode: Mode, invoker: &'a T) -> Self {
        let (layout, reads) = match mode {
            Mode::FastqSe => (Some(Layout::Single), vec![config.input.clone()]),
            Mode::FastqPe => (
                Some(Layout::Paired),
                std::iter::once(config.input.clone()).chain(config.input2.clone()).collect::<Vec<_>>(),
            ),
            Mode::Sra | Mode::Bam => (None, Vec::new()),
        };
        StageSequencer {
            gate: StepGate::new(config.gate_policy),
            files: SampleFiles::new(&config.out_dir, &config.sample),
            index_dir: index_dir(&config.genome),
            config,
            invoker,
            mode,
            layout,
            reads,
            aggregator: MetricsAggregator::new(),
        }
    }

    /// Runs the plan in order. The first failing stage aborts the run;
    /// outputs of completed stages stay in place for a later resume.
    pub async fn run(mut self) -> Result<RunSummary, PipelineError> {
        let stages = plan(self.mode, &self.config);
        let mut counter = StepCounter::new(stages.len());
        let mut ran = Vec::new();
        let mut skipped = Vec::new();

        for kind in stages {
            counter = counter.next();

            if kind == StageKind::Cleanup {
                info!("{} {}", counter, kind.label());
                self.cleanup().await?;
                ran.push(kind);
                continue;
            }

            let artifact = self.artifact(kind)?;
            if self.gate.should_run(&artifact, kind.is_shared())? {
                info!("{} {}", counter, kind.label());
                self.check_inputs(kind)?;
                self.execute(kind).await?;
                self.gate.verify(kind.name(), kind.tool().unwrap_or_default(), &artifact)?;
                self.after_stage(kind, true).await?;
                ran.push(kind);
            } else {
                info!("{} {}: outputs present, skipping", counter, kind.label());
                self.after_stage(kind, false).await?;
                skipped.push(kind);
            }
        }

        let report = self.config.report_path();
        self.aggregator
            .write_report(&report)
            .await
            .map_err(|e| PipelineError::IOError(e.to_string()))?;
        println!("\n{}", self.aggregator.render(std::io::stdout().is_terminal()));
        info!("Report written to {}", report.display());

        Ok(RunSummary {
            mode: self.mode,
            layout: self.layout,
            ran,
            skipped,
            metrics: self.aggregator.metrics().clone(),
            report,
        })
    }

    fn layout_known(&self, kind: StageKind) -> Result<Layout, PipelineError> {
        self.layout.ok_or_else(|| PipelineError::StageFailure {
            stage: kind.name().to_string(),
            tool: kind.tool().unwrap_or_default().to_string(),
            error: "read layout is not resolved".to_string(),
        })
    }

    /// Output a stage declares; its presence decides skipping.
    fn artifact(&self, kind: StageKind) -> Result<Artifact, PipelineError> {
        let files = &self.files;
        let artifact = match kind {
            StageKind::Extract => Artifact::AnyOf(extracted_reads(files.out_dir(), &self.config.sample)),
            StageKind::QualityTrim => {
                let mut outputs = files.clean_reads(self.layout_known(kind)?);
                outputs.push(files.fastp_json());
                Artifact::AllOf(outputs)
            }
            StageKind::BuildIndex => Artifact::AllOf(index_files(&self.index_dir)),
            StageKind::Align => Artifact::File(files.aligned_bam()),
            StageKind::SortIndex => Artifact::AllOf(vec![files.sorted_bam(), files.sorted_bai(), files.flagstat()]),
            StageKind::DedupFilter if self.mode == Mode::Bam => {
                Artifact::AllOf(vec![files.filtered_bam(), files.markdup_stats(), files.flagstat()])
            }
            StageKind::DedupFilter => Artifact::AllOf(vec![files.filtered_bam(), files.markdup_stats()]),
            StageKind::SortIndexFiltered => Artifact::AllOf(vec![files.final_bam(), files.final_bai()]),
            // narrowPeak and summits are empty when nothing passes the q-value cutoff
            StageKind::CallPeaks => Artifact::File(files.peaks_xls()),
            StageKind::SignalTrack => Artifact::File(files.bigwig()),
            StageKind::Cleanup => Artifact::AllOf(Vec::new()),
        };
        Ok(artifact)
    }

    fn required_inputs(&self, kind: StageKind) -> Result<Vec<PathBuf>, PipelineError> {
        let files = &self.files;
        let inputs = match kind {
            StageKind::Extract | StageKind::Cleanup => Vec::new(),
            StageKind::QualityTrim => self.reads.clone(),
            StageKind::BuildIndex => vec![self.config.genome.clone(), self.config.annotation.clone()],
            StageKind::Align => {
                let mut inputs = files.clean_reads(self.layout_known(kind)?);
                inputs.push(self.index_dir.join(STAR_GENOME_PARAMETERS));
                inputs
            }
            StageKind::SortIndex => vec![files.aligned_bam()],
            StageKind::DedupFilter => vec![self.dedup_source()],
            StageKind::SortIndexFiltered => vec![files.filtered_bam()],
            StageKind::CallPeaks => vec![files.final_bam()],
            StageKind::SignalTrack => vec![files.final_bam(), files.final_bai()],
        };
        Ok(inputs)
    }

    fn check_inputs(&self, kind: StageKind) -> Result<(), PipelineError> {
        let missing: Vec<String> = self
            .required_inputs(kind)?
            .iter()
            .filter(|p| !p.exists())
            .map(|p| p.display().to_string())
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        Err(PipelineError::StageFailure {
            stage: kind.name().to_string(),
            tool: kind.tool().unwrap_or_default().to_string(),
            error: format!("required input missing: {}", missing.join(", ")),
        })
    }

    fn dedup_source(&self) -> PathBuf {
        match self.mode {
            Mode::Bam => self.config.input.clone(),
            _ => self.files.sorted_bam(),
        }
    }

    async fn execute(&mut self, kind: StageKind) -> Result<(), PipelineError> {
        if kind == StageKind::BuildIndex {
            tokio::fs::create_dir_all(&self.index_dir).await?;
        }
        let calls = self.calls(kind).await?;
        let result = self.invoke_all(kind, &calls).await;

        if kind == StageKind::BuildIndex && result.is_err() {
            warn!("Removing incomplete index {}", self.index_dir.display());
            if let Err(e) = tokio::fs::remove_dir_all(&self.index_dir).await {
                warn!("Could not remove {}: {}", self.index_dir.display(), e);
            }
        }
        if kind == StageKind::DedupFilter {
            for step in DEDUP_TMP_STEPS {
                let tmp = self.files.tmp_bam(step);
                if let Err(e) = remove_if_exists(&tmp).await {
                    warn!("Could not remove {}: {}", tmp.display(), e);
                }
            }
        }
        result
    }

    async fn invoke_all(&self, kind: StageKind, calls: &[ToolCall]) -> Result<(), PipelineError> {
        for call in calls {
            debug!("{}: {}", kind.name(), call.command_line());
            self.invoker
                .invoke(call)
                .await
                .map_err(|e| PipelineError::StageFailure {
                    stage: kind.name().to_string(),
                    tool: call.program.clone(),
                    error: e.to_string(),
                })?;
        }
        Ok(())
    }

    /// Resolves the layout on first use. BAM inputs are sampled with
    /// `samtools head`; the flag-parity guess is best-effort.
    async fn ensure_layout(&mut self, kind: StageKind) -> Result<Layout, PipelineError> {
        if let Some(layout) = self.layout {
            return Ok(layout);
        }
        let layout = match self.mode {
            Mode::Bam => {
                let config = SamtoolsConfig {
                    subcommand: SamtoolsSubcommand::Head,
                    subcommand_fields: vec![
                        ("-h".to_string(), Some("0".to_string())),
                        ("-n".to_string(), Some(BAM_SAMPLE_RECORDS.to_string())),
                        (self.config.input.to_string_lossy().to_string(), None),
                    ],
                };
                let call = ToolCall::new(
                    SAMTOOLS_TAG,
                    samtools::arg_generator(&config, self.config.threads),
                    self.files.out_dir(),
                );
                let output = self.invoker.invoke(&call).await.map_err(|e| PipelineError::StageFailure {
                    stage: kind.name().to_string(),
                    tool: SAMTOOLS_TAG.to_string(),
                    error: format!("sampling alignment flags: {}", e),
                })?;
                let layout = layout_from_flags(&parse_sam_flags(&output.stdout));
                info!("Inferred {} layout from sampled BAM flags (best-effort)", layout);
                layout
            }
            _ => {
                let (layout, reads) = resolve_sra_layout(self.files.out_dir(), &self.config.sample)?;
                self.reads = reads;
                layout
            }
        };
        self.layout = Some(layout);
        Ok(layout)
    }

    async fn calls(&mut self, kind: StageKind) -> Result<Vec<ToolCall>, PipelineError> {
        let config = Arc::clone(&self.config);
        let threads = config.threads;
        let out_dir = self.files.out_dir().to_path_buf();
        let files = self.files.clone();

        let calls = match kind {
            StageKind::Extract => vec![ToolCall::new(
                kind_tool(kind),
                fasterq_dump::arg_generator(&config.input, &out_dir, &config.sample, threads),
                &out_dir,
            )],

            StageKind::QualityTrim => {
                let layout = self.ensure_layout(kind).await?;
                let fastp_config = fastp::FastpConfig {
                    inputs: self.reads.clone(),
                    outputs: files.clean_reads(layout),
                    json: files.fastp_json(),
                    html: files.fastp_html(),
                    quality: config.quality_base,
                    threads,
                };
                let expected: Vec<PathBuf> = fastp_config
                    .outputs
                    .iter()
                    .cloned()
                    .chain([fastp_config.json.clone(), fastp_config.html.clone()])
                    .collect();
                vec![ToolCall::new(kind_tool(kind), fastp::arg_generator(&fastp_config), &out_dir)
                    .expecting(&expected)]
            }

            StageKind::BuildIndex => vec![ToolCall::new(
                kind_tool(kind),
                star::genome_generate_args(&self.index_dir, &config.genome, &config.annotation, threads),
                &out_dir,
            )
            .expecting(&index_files(&self.index_dir))],

            StageKind::Align => {
                let layout = self.ensure_layout(kind).await?;
                let reads = files.clean_reads(layout);
                vec![ToolCall::new(
                    kind_tool(kind),
                    star::align_args(&self.index_dir, &reads, &files.star_prefix(), threads),
                    &out_dir,
                )
                .expecting(&[&files.aligned_bam()])]
            }

            StageKind::SortIndex => vec![
                samtools_call(SamtoolsSubcommand::Sort, vec![
                    flag("-o", &files.sorted_bam()),
                    positional(&files.aligned_bam()),
                ], threads, &out_dir)
                .expecting(&[&files.sorted_bam()]),
                samtools_call(SamtoolsSubcommand::Index, vec![positional(&files.sorted_bam())], threads, &out_dir)
                    .expecting(&[&files.sorted_bai()]),
                samtools_call(SamtoolsSubcommand::Flagstat, vec![positional(&files.sorted_bam())], threads, &out_dir)
                    .stdout_to(&files.flagstat()),
            ],

            StageKind::DedupFilter => {
                let layout = self.ensure_layout(kind).await?;
                self.dedup_calls(layout, threads, &out_dir)
            }

            StageKind::SortIndexFiltered => vec![
                samtools_call(SamtoolsSubcommand::Sort, vec![
                    flag("-o", &files.final_bam()),
                    positional(&files.filtered_bam()),
                ], threads, &out_dir)
                .expecting(&[&files.final_bam()]),
                samtools_call(SamtoolsSubcommand::Index, vec![positional(&files.final_bam())], threads, &out_dir)
                    .expecting(&[&files.final_bai()]),
            ],

            StageKind::CallPeaks => {
                let layout = self.ensure_layout(kind).await?;
                let genome_size = read_effective_genome_size(&self.index_dir).await?;
                debug!("Effective genome size: {}", genome_size);
                let peaks = files.peaks();
                vec![ToolCall::new(
                    kind_tool(kind),
                    macs3::arg_generator(&files.final_bam(), layout, genome_size, &config.sample, &out_dir),
                    &out_dir,
                )
                .expecting(&peaks)]
            }

            StageKind::SignalTrack => {
                let layout = self.ensure_layout(kind).await?;
                vec![ToolCall::new(
                    kind_tool(kind),
                    bam_coverage::arg_generator(&files.final_bam(), &files.bigwig(), config.bin_size, layout, threads),
                    &out_dir,
                )
                .expecting(&[&files.bigwig()])]
            }

            StageKind::Cleanup => Vec::new(),
        };
        Ok(calls)
    }

    /// name-sort, fixmate, coordinate sort, markdup -r, then MAPQ/mapped
    /// (and proper-pair for PE) filtering. BAM inputs also get a flagstat
    /// for the alignment rate, since they skip SortIndex.
    fn dedup_calls(&self, layout: Layout, threads: usize, out_dir: &Path) -> Vec<ToolCall> {
        let files = &self.files;
        let source = self.dedup_source();
        let [namesort, fixmate, possort, markdup] = DEDUP_TMP_STEPS.map(|step| files.tmp_bam(step));
        let mut calls = Vec::new();

        if self.mode == Mode::Bam {
            calls.push(
                samtools_call(SamtoolsSubcommand::Flagstat, vec![positional(&source)], threads, out_dir)
                    .stdout_to(&files.flagstat()),
            );
        }
        calls.push(
            samtools_call(SamtoolsSubcommand::Sort, vec![
                ("-n".to_string(), None),
                flag("-o", &namesort),
                positional(&source),
            ], threads, out_dir)
            .expecting(&[&namesort]),
        );
        calls.push(
            samtools_call(SamtoolsSubcommand::Fixmate, vec![
                ("-m".to_string(), None),
                positional(&namesort),
                positional(&fixmate),
            ], threads, out_dir)
            .expecting(&[&fixmate]),
        );
        calls.push(
            samtools_call(SamtoolsSubcommand::Sort, vec![flag("-o", &possort), positional(&fixmate)], threads, out_dir)
                .expecting(&[&possort]),
        );
        calls.push(
            samtools_call(SamtoolsSubcommand::Markdup, vec![
                ("-r".to_string(), None),
                flag("-f", &files.markdup_stats()),
                positional(&possort),
                positional(&markdup),
            ], threads, out_dir)
            .expecting(&[&markdup, &files.markdup_stats()]),
        );

        let mut view_fields = vec![
            ("-b".to_string(), None),
            ("-q".to_string(), Some(MIN_MAPQ.to_string())),
            ("-F".to_string(), Some("4".to_string())),
        ];
        if layout.is_paired() {
            view_fields.push(("-f".to_string(), Some("2".to_string())));
        }
        view_fields.push(flag("-o", &files.filtered_bam()));
        view_fields.push(positional(&markdup));
        calls.push(
            samtools_call(SamtoolsSubcommand::View, view_fields, threads, out_dir).expecting(&[&files.filtered_bam()]),
        );
        calls
    }

    async fn after_stage(&mut self, kind: StageKind, ran: bool) -> Result<(), PipelineError> {
        let ingest = ran || self.config.resume_metrics == ResumeMetricsPolicy::Recover;
        match kind {
            StageKind::Extract => {
                let layout = self.ensure_layout(kind).await?;
                info!("Extracted reads are {}", layout);
            }
            StageKind::QualityTrim if ingest => {
                let json = self.files.fastp_json();
                if let Err(e) = self.aggregator.ingest_fastp_json(&json).await {
                    warn!("QC metrics unavailable: {}", e);
                }
            }
            StageKind::SortIndex if ingest => self.ingest_flagstat().await,
            StageKind::DedupFilter if ingest => {
                if self.mode == Mode::Bam {
                    self.ingest_flagstat().await;
                }
                let stats = self.files.markdup_stats();
                if let Err(e) = self.aggregator.ingest_markdup(&stats).await {
                    warn!("Duplication metrics unavailable: {}", e);
                }
            }
            _ => {}
        }
        Ok(())
    }

    async fn ingest_flagstat(&mut self) {
        let flagstat = self.files.flagstat();
        if let Err(e) = self.aggregator.ingest_flagstat(&flagstat).await {
            warn!("Alignment metrics unavailable: {}", e);
        }
    }

    /// Deletes the large intermediates. The inputs of the run are never
    /// touched, whatever their names.
    async fn cleanup(&self) -> Result<(), PipelineError> {
        let files = &self.files;
        let mut targets = Vec::new();
        if self.mode == Mode::Sra {
            targets.extend(extracted_reads(files.out_dir(), &self.config.sample));
        }
        targets.extend([files.aligned_bam(), files.sorted_bam(), files.sorted_bai(), files.filtered_bam()]);

        let mut removed = 0;
        for target in targets {
            if is_run_input(&self.config, &target) {
                continue;
            }
            if remove_if_exists(&target).await? {
                debug!("Removed {}", target.display());
                removed += 1;
            }
        }
        info!("Removed {} intermediate files", removed);
        Ok(())
    }
}

fn kind_tool(kind: StageKind) -> &'static str {
    kind.tool().unwrap_or_default()
}

fn is_run_input(config: &PipelineConfig, path: &Path) -> bool {
    path == config.input || config.input2.as_deref() == Some(path)
}

fn flag(key: &str, path: &Path) -> (String, Option<String>) {
    (key.to_string(), Some(path.to_string_lossy().to_string()))
}

fn positional(path: &Path) -> (String, Option<String>) {
    (path.to_string_lossy().to_string(), None)
}

fn samtools_call(
    subcommand: SamtoolsSubcommand,
    subcommand_fields: Vec<(String, Option<String>)>,
    threads: usize,
    out_dir: &Path,
) -> ToolCall {
    let config = SamtoolsConfig { subcommand, subcommand_fields };
    ToolCall::new(SAMTOOLS_TAG, samtools::arg_generator(&config, threads), out_dir)
}


/// Classifies the input, checks it, and runs the stage plan for its mode.
///
/// # Arguments
///
/// * `config` - Validated run configuration.
/// * `invoker` - Runs the external tools; a mock in tests.
///
/// # Returns
/// RunSummary of the completed run, or the first fatal error. Input errors
/// are raised before any tool is invoked.
pub async fn run<T: ToolInvoker>(config: Arc<PipelineConfig>, invoker: &T) -> Result<RunSummary, PipelineError> {
    println!("\n-------------\n ATAC-Seq\n-------------\n");

    let mode = classify(&config.input, config.input2.as_deref())?;
    check_content(mode, &config.input, config.input2.as_deref())?;
    info!("Sample {}: {} mode", config.sample, mode);

    if mode == Mode::Bam && is_run_input(&config, &SampleFiles::new(&config.out_dir, &config.sample).final_bam()) {
        return Err(PipelineError::ConfigValidation(format!(
            "Output {} would overwrite the input BAM; choose another --output",
            config.input.display()
        )));
    }

    let stages = plan(mode, &config);
    invoker.preflight(&required_tools(&stages))?;

    tokio::fs::create_dir_all(&config.out_dir)
        .await
        .map_err(|e| PipelineError::Path(format!("Cannot create {}: {}", config.out_dir.display(), e)))?;
    info!("Output directory: {}", config.out_dir.display());

    let summary = StageSequencer::new(config, mode, invoker).run().await?;
    info!(
        "{} stages run, {} skipped",
        summary.ran.len(),
        summary.skipped.len()
    );
    Ok(summary)
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_counter_display() {
        let counter = StepCounter::new(9);
        assert_eq!(counter.to_string(), "[0/9]");
        let counter = counter.next().next();
        assert_eq!(counter.to_string(), "[2/9]");
    }

    #[test]
    fn test_dedup_tmp_names_are_distinct() {
        let files = SampleFiles::new(Path::new("/out"), "s");
        let tmps: Vec<PathBuf> = DEDUP_TMP_STEPS.iter().map(|s| files.tmp_bam(s)).collect();
        for tmp in &tmps {
            assert_ne!(tmp, &files.filtered_bam());
            assert_ne!(tmp, &files.final_bam());
        }
        assert_eq!(tmps.len(), 4);
    }
}
