use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use clap::ValueEnum;
use lazy_static::lazy_static;
use thiserror::Error;

// External software
pub const FASTERQ_DUMP_TAG: &str = "fasterq-dump";
pub const FASTP_TAG: &str = "fastp";
pub const STAR_TAG: &str = "STAR";
pub const SAMTOOLS_TAG: &str = "samtools";
pub const MACS3_TAG: &str = "macs3";
pub const BAM_COVERAGE_TAG: &str = "bamCoverage";

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SamtoolsSubcommand {
    Sort,
    Index,
    Flagstat,
    Fixmate,
    Markdup,
    View,
    Head,
}

impl SamtoolsSubcommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            SamtoolsSubcommand::Sort => "sort",
            SamtoolsSubcommand::Index => "index",
            SamtoolsSubcommand::Flagstat => "flagstat",
            SamtoolsSubcommand::Fixmate => "fixmate",
            SamtoolsSubcommand::Markdup => "markdup",
            SamtoolsSubcommand::View => "view",
            SamtoolsSubcommand::Head => "head",
        }
    }
}

// Naming
pub const PIPELINE_NAME: &str = "atacflow";
pub const REPORT_SUFFIX: &str = "report.txt";
pub const STAR_INDEX_SUFFIX: &str = "STAR";
pub const STAR_GENOME_PARAMETERS: &str = "genomeParameters.txt";
// genomeGenerate writes the suffix arrays last
pub const STAR_INDEX_FILES: &[&str] = &["Genome", "SA", "SAindex", STAR_GENOME_PARAMETERS];
pub const STAR_GENOME_SIZE_FIELD: &str = "genomeFileSizes";

// Static Parameters
pub const DEFAULT_QUALITY_BASE: u8 = 20;
pub const MAX_QUALITY_BASE: u8 = 40;
pub const DEFAULT_THREADS: usize = 8;
pub const MIN_THREADS: usize = 2;
pub const MIN_MAPQ: u8 = 30;
pub const BAM_SAMPLE_RECORDS: usize = 10_000;
pub const MACS3_QVALUE: f64 = 0.05;
pub const SE_SHIFT: i32 = -100;
pub const SE_EXTSIZE: u32 = 200;

pub const SAMPLE_DELIMITERS: &[char] = &['@', ':', '.', '_', '-'];

pub const GZIP_EXT: &str = "gz";
pub const FASTQ_EXTS: &[&'static str] = &["fastq", "fq"];
pub const SRA_EXT: &str = "sra";
pub const BAM_EXT: &str = "bam";
pub const ANNOTATION_EXTS: &[&'static str] = &["gff", "gff3", "gtf"];
pub const ANNOTATION_COLUMNS: usize = 9;

lazy_static! {
    /// Extension chain (lowercase, without the leading dot) to execution mode.
    pub static ref INPUT_EXTENSIONS: HashMap<&'static str, Mode> = {
        let mut m = HashMap::new();
        m.insert(SRA_EXT, Mode::Sra);
        m.insert("fastq", Mode::FastqSe);
        m.insert("fastq.gz", Mode::FastqSe);
        m.insert("fq", Mode::FastqSe);
        m.insert("fq.gz", Mode::FastqSe);
        m.insert(BAM_EXT, Mode::Bam);
        m
    };
}


/// Execution branch selected once per run from the shape of the input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    Sra,
    FastqSe,
    FastqPe,
    Bam,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Mode::Sra => "SRA",
            Mode::FastqSe => "FASTQ_SE",
            Mode::FastqPe => "FASTQ_PE",
            Mode::Bam => "BAM",
        };
        write!(f, "{}", name)
    }
}

/// Read layout of the sequencing run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    Single,
    Paired,
}

impl Layout {
    pub fn is_paired(&self) -> bool {
        matches!(self, Layout::Paired)
    }
}

impl fmt::Display for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Layout::Single => write!(f, "single-end"),
            Layout::Paired => write!(f, "paired-end"),
        }
    }
}

/// How StepGate treats artifacts left behind by an earlier run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatePolicy {
    /// Refuse to overwrite complete per-sample artifacts.
    Strict,
    /// Keep complete artifacts and skip their stages.
    Resume,
    /// Re-run every per-sample stage.
    Force,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Default)]
pub enum ResumeMetricsPolicy {
    /// Read metrics back from byproducts of skipped stages.
    #[default]
    Recover,
    /// Leave metrics of skipped stages unset.
    Blank,
}


#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Invalid configuration: {0}")]
    ConfigValidation(String),

    #[error("Path error: {0}")]
    Path(String),

    #[error("Format error: {0}")]
    Format(String),

    #[error("Invalid input pair: {0}")]
    InvalidInputPair(String),

    #[error("Unrecognized input: {0}")]
    UnrecognizedInput(String),

    #[error("Unsupported data shape: {0}")]
    UnsupportedDataShape(String),

    #[error("Stage '{stage}' failed in {tool}: {error}")]
    StageFailure {
        stage: String,
        tool: String,
        error: String,
    },

    #[error("Required command not found in PATH: {0}")]
    ToolNotFound(String),

    #[error("IO error: {0}")]
    IOError(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PipelineError {
    /// Remediation hint printed alongside the diagnostic.
    pub fn hint(&self) -> &'static str {
        match self {
            PipelineError::ConfigValidation(_) => "Check the command-line arguments; run with --help for usage.",
            PipelineError::Path(_) => "Check that the file exists and the output directory is writable. Use --skip to resume or --force to overwrite an earlier run.",
            PipelineError::Format(_) => "Annotation must be .gff/.gff3/.gtf with nine tab-separated columns; reads must be FASTQ (optionally gzipped).",
            PipelineError::InvalidInputPair(_) => "--input and --input2 must be two different FASTQ files (fastq, fastq.gz, fq, fq.gz).",
            PipelineError::UnrecognizedInput(_) => "Supported inputs: .sra or an SRA accession, .fastq/.fq(.gz), .bam.",
            PipelineError::UnsupportedDataShape(_) => "Only bulk single-end or paired-end data is supported; single-cell runs are rejected.",
            PipelineError::StageFailure { .. } => "Inspect the tool output above; fix the cause and re-run with --skip to resume from the failed stage.",
            PipelineError::ToolNotFound(_) => "Install the tool or add its directory to PATH.",
            PipelineError::IOError(_) => "Check disk space and permissions in the output directory.",
            PipelineError::Other(_) => "Re-run with --verbose for details.",
        }
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(e: std::io::Error) -> Self {
        PipelineError::IOError(e.to_string())
    }
}


/// Immutable, validated run configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub cwd: PathBuf,
    pub input: PathBuf,
    pub input2: Option<PathBuf>,
    pub genome: PathBuf,
    pub annotation: PathBuf,
    pub quality_base: u8,
    pub threads: usize,
    pub bin_size: u32,
    pub gate_policy: GatePolicy,
    pub remove: bool,
    pub resume_metrics: ResumeMetricsPolicy,
    pub out_dir: PathBuf,
    pub sample: String,
}

impl PipelineConfig {
    /// Range and exclusivity checks that need no filesystem access.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.quality_base > MAX_QUALITY_BASE {
            return Err(PipelineError::ConfigValidation(format!(
                "--qualityBase must be within [0,{}], got {}",
                MAX_QUALITY_BASE, self.quality_base
            )));
        }
        if self.threads < MIN_THREADS {
            return Err(PipelineError::ConfigValidation(format!(
                "--threads must be at least {}, got {}",
                MIN_THREADS, self.threads
            )));
        }
        if self.sample.is_empty() {
            return Err(PipelineError::ConfigValidation(format!(
                "Cannot derive a sample name from {}",
                self.input.display()
            )));
        }
        Ok(())
    }

    pub fn signal_track_enabled(&self) -> bool {
        self.bin_size > 0
    }

    pub fn report_path(&self) -> PathBuf {
        self.out_dir.join(format!("{}.{}.{}", self.sample, PIPELINE_NAME, REPORT_SUFFIX))
    }
}
