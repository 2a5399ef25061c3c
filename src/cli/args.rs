use clap::Parser;

use crate::config::defs::{ResumeMetricsPolicy, DEFAULT_QUALITY_BASE, DEFAULT_THREADS};

#[derive(Parser, Debug, Clone, Default)]
#[command(
    name = "atacflow",
    version,
    about = "Bulk ATAC-Seq pipeline: SRA/FASTQ/BAM to peaks, signal tracks and a QC report"
)]
pub struct Arguments {

    #[arg(short = 'i', long = "input", help = "SRA file or accession, FASTQ (R1 when paired) or BAM")]
    pub input: String,

    #[arg(short = 'I', long = "input2", help = "R2 FASTQ for paired-end input")]
    pub input2: Option<String>,

    #[arg(short = 'g', long = "genome", help = "Reference genome FASTA; the STAR index is built beside it")]
    pub genome: String,

    #[arg(short = 'a', long = "annotation", help = "Genome annotation (.gff, .gff3 or .gtf)")]
    pub annotation: String,

    #[arg(short = 'q', long = "qualityBase", default_value_t = DEFAULT_QUALITY_BASE as i64, allow_negative_numbers = true)]
    pub quality_base: i64,

    #[arg(short = 'b', long = "binSize", default_value_t = 0, help = "Bin size of the bigWig signal track; 0 disables it")]
    pub bin_size: u32,

    #[arg(short = 'o', long = "output", help = "Output directory for all generated files. If not specified, a directory named '<sample>_YYYYMMDD' will be created in the current working directory.")]
    pub out_dir: Option<String>,

    #[arg(short = 't', long = "threads", default_value_t = DEFAULT_THREADS)]
    pub threads: usize,

    #[arg(short = 'f', long = "force", action, conflicts_with = "skip", help = "Re-run every stage, overwriting earlier results")]
    pub force: bool,

    #[arg(short = 's', long = "skip", action, help = "Resume: skip stages whose outputs already exist")]
    pub skip: bool,

    #[arg(short = 'r', long = "remove", action, help = "Delete intermediate reads and alignments after the run")]
    pub remove: bool,

    #[arg(long = "resumeMetrics", default_value = "recover", value_enum)]
    pub resume_metrics: ResumeMetricsPolicy,

    #[arg(short = 'v', long = "verbose", action)]
    pub verbose: bool,
}
