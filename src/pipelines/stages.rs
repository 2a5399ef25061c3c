//! The fixed stage lists per mode and the artifact naming shared by every stage.

use std::path::{Path, PathBuf};

use crate::config::defs::{
    Layout, Mode, PipelineConfig, BAM_COVERAGE_TAG, FASTERQ_DUMP_TAG, FASTP_TAG, MACS3_TAG, SAMTOOLS_TAG, STAR_TAG,
};


#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    Extract,
    QualityTrim,
    BuildIndex,
    Align,
    SortIndex,
    DedupFilter,
    SortIndexFiltered,
    CallPeaks,
    SignalTrack,
    Cleanup,
}

impl StageKind {
    pub fn name(&self) -> &'static str {
        match self {
            StageKind::Extract => "extract",
            StageKind::QualityTrim => "quality_trim",
            StageKind::BuildIndex => "build_index",
            StageKind::Align => "align",
            StageKind::SortIndex => "sort_index",
            StageKind::DedupFilter => "dedup_filter",
            StageKind::SortIndexFiltered => "sort_index_filtered",
            StageKind::CallPeaks => "call_peaks",
            StageKind::SignalTrack => "signal_track",
            StageKind::Cleanup => "cleanup",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            StageKind::Extract => "Extracting reads from SRA",
            StageKind::QualityTrim => "Trimming and quality control",
            StageKind::BuildIndex => "Building reference index",
            StageKind::Align => "Aligning reads",
            StageKind::SortIndex => "Sorting and indexing alignments",
            StageKind::DedupFilter => "Removing duplicates and low-quality alignments",
            StageKind::SortIndexFiltered => "Sorting and indexing filtered alignments",
            StageKind::CallPeaks => "Calling peaks",
            StageKind::SignalTrack => "Generating signal track",
            StageKind::Cleanup => "Removing intermediate files",
        }
    }

    /// External program the stage drives; None for in-process stages.
    pub fn tool(&self) -> Option<&'static str> {
        match self {
            StageKind::Extract => Some(FASTERQ_DUMP_TAG),
            StageKind::QualityTrim => Some(FASTP_TAG),
            StageKind::BuildIndex | StageKind::Align => Some(STAR_TAG),
            StageKind::SortIndex | StageKind::DedupFilter | StageKind::SortIndexFiltered => Some(SAMTOOLS_TAG),
            StageKind::CallPeaks => Some(MACS3_TAG),
            StageKind::SignalTrack => Some(BAM_COVERAGE_TAG),
            StageKind::Cleanup => None,
        }
    }

    /// The reference index is keyed by genome, not by sample.
    pub fn is_shared(&self) -> bool {
        matches!(self, StageKind::BuildIndex)
    }
}


const SRA_STAGES: &[StageKind] = &[
    StageKind::Extract,
    StageKind::QualityTrim,
    StageKind::BuildIndex,
    StageKind::Align,
    StageKind::SortIndex,
    StageKind::DedupFilter,
    StageKind::SortIndexFiltered,
    StageKind::CallPeaks,
    StageKind::SignalTrack,
    StageKind::Cleanup,
];

// Reads are the direct input: everything after extraction.
const FASTQ_STAGES: &[StageKind] = &[
    StageKind::QualityTrim,
    StageKind::BuildIndex,
    StageKind::Align,
    StageKind::SortIndex,
    StageKind::DedupFilter,
    StageKind::SortIndexFiltered,
    StageKind::CallPeaks,
    StageKind::SignalTrack,
    StageKind::Cleanup,
];

// Index kept for the effective genome size used by peak calling.
const BAM_STAGES: &[StageKind] = &[
    StageKind::BuildIndex,
    StageKind::DedupFilter,
    StageKind::SortIndexFiltered,
    StageKind::CallPeaks,
    StageKind::SignalTrack,
    StageKind::Cleanup,
];

pub fn stage_table(mode: Mode) -> &'static [StageKind] {
    match mode {
        Mode::Sra => SRA_STAGES,
        Mode::FastqSe | Mode::FastqPe => FASTQ_STAGES,
        Mode::Bam => BAM_STAGES,
    }
}

/// Stage list for this run: the mode's table minus the optional stages the
/// configuration turns off.
pub fn plan(mode: Mode, config: &PipelineConfig) -> Vec<StageKind> {
    stage_table(mode)
        .iter()
        .copied()
        .filter(|kind| match kind {
            StageKind::SignalTrack => config.signal_track_enabled(),
            StageKind::Cleanup => config.remove,
            _ => true,
        })
        .collect()
}

/// Programs a plan needs on PATH, without duplicates, in stage order.
pub fn required_tools(plan: &[StageKind]) -> Vec<&'static str> {
    let mut tools: Vec<&'static str> = Vec::new();
    for tool in plan.iter().filter_map(|kind| kind.tool()) {
        if !tools.contains(&tool) {
            tools.push(tool);
        }
    }
    tools
}


/// File names of every per-sample artifact, all under the output directory.
#[derive(Debug, Clone)]
pub struct SampleFiles {
    out_dir: PathBuf,
    sample: String,
}

impl SampleFiles {
    pub fn new(out_dir: &Path, sample: &str) -> Self {
        SampleFiles {
            out_dir: out_dir.to_path_buf(),
            sample: sample.to_string(),
        }
    }

    pub fn out_dir(&self) -> &Path {
        &self.out_dir
    }

    fn named(&self, suffix: &str) -> PathBuf {
        self.out_dir.join(format!("{}{}", self.sample, suffix))
    }

    pub fn clean_reads(&self, layout: Layout) -> Vec<PathBuf> {
        match layout {
            Layout::Single => vec![self.named(".clean.fastq")],
            Layout::Paired => vec![self.named("_1.clean.fastq"), self.named("_2.clean.fastq")],
        }
    }

    pub fn fastp_json(&self) -> PathBuf {
        self.named(".fastp.json")
    }

    pub fn fastp_html(&self) -> PathBuf {
        self.named(".fastp.html")
    }

    /// STAR appends its own file names to this prefix.
    pub fn star_prefix(&self) -> PathBuf {
        self.named(".")
    }

    pub fn aligned_bam(&self) -> PathBuf {
        self.named(".Aligned.out.bam")
    }

    pub fn sorted_bam(&self) -> PathBuf {
        self.named(".sorted.bam")
    }

    pub fn sorted_bai(&self) -> PathBuf {
        self.named(".sorted.bam.bai")
    }

    pub fn flagstat(&self) -> PathBuf {
        self.named(".flagstat.txt")
    }

    pub fn markdup_stats(&self) -> PathBuf {
        self.named(".markdup.txt")
    }

    pub fn tmp_bam(&self, step: &str) -> PathBuf {
        self.named(&format!(".tmp.{}.bam", step))
    }

    pub fn filtered_bam(&self) -> PathBuf {
        self.named(".filtered.bam")
    }

    pub fn final_bam(&self) -> PathBuf {
        self.named(".bam")
    }

    pub fn final_bai(&self) -> PathBuf {
        self.named(".bam.bai")
    }

    /// MACS3 writes this table even when no peak passes the cutoff.
    pub fn peaks_xls(&self) -> PathBuf {
        self.named("_peaks.xls")
    }

    pub fn peaks(&self) -> Vec<PathBuf> {
        vec![self.named("_peaks.narrowPeak"), self.peaks_xls(), self.named("_summits.bed")]
    }

    pub fn bigwig(&self) -> PathBuf {
        self.named(".bw")
    }
}
