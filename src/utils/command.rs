//! Functions and structs for building external tool command lines and running them

use std::collections::VecDeque;
use std::env;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{anyhow, Result};
use log::debug;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio_stream::wrappers::LinesStream;
use tokio_stream::StreamExt;

use crate::config::defs::PipelineError;

const STDERR_TAIL_LINES: usize = 20;


/// One external program invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub program: String,
    pub args: Vec<String>,
    pub work_dir: PathBuf,
    /// Files the call is expected to produce.
    pub expected: Vec<PathBuf>,
    /// Redirect stdout into this file instead of capturing it.
    pub stdout_to: Option<PathBuf>,
}

impl ToolCall {
    pub fn new(program: &str, args: Vec<String>, work_dir: &Path) -> Self {
        ToolCall {
            program: program.to_string(),
            args,
            work_dir: work_dir.to_path_buf(),
            expected: Vec::new(),
            stdout_to: None,
        }
    }

    pub fn expecting<P: AsRef<Path>>(mut self, paths: &[P]) -> Self {
        self.expected.extend(paths.iter().map(|p| p.as_ref().to_path_buf()));
        self
    }

    pub fn stdout_to(mut self, path: &Path) -> Self {
        self.stdout_to = Some(path.to_path_buf());
        self.expected.push(path.to_path_buf());
        self
    }

    pub fn command_line(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        if let Some(path) = &self.stdout_to {
            line.push_str(&format!(" > {}", path.display()));
        }
        line
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}


/// Capability to run a ToolCall to completion.
#[allow(async_fn_in_trait)]
pub trait ToolInvoker {
    /// Runs the call, blocking the pipeline until the process exits.
    /// A non-zero exit is an error carrying the tail of stderr.
    async fn invoke(&self, call: &ToolCall) -> Result<ToolOutput>;

    /// Checks that every program can be started before any stage runs.
    fn preflight(&self, _programs: &[&str]) -> Result<(), PipelineError> {
        Ok(())
    }
}


/// Runs tools as child processes.
#[derive(Debug, Clone, Default)]
pub struct SystemInvoker;

impl ToolInvoker for SystemInvoker {
    /// Resolves each program on PATH without executing it.
    fn preflight(&self, programs: &[&str]) -> Result<(), PipelineError> {
        for program in programs {
            match locate_on_path(program) {
                Some(path) => debug!("Found {} at {}", program, path.display()),
                None => return Err(PipelineError::ToolNotFound(program.to_string())),
            }
        }
        Ok(())
    }

    async fn invoke(&self, call: &ToolCall) -> Result<ToolOutput> {
        debug!("Running: {}", call.command_line());

        let mut cmd = Command::new(&call.program);
        cmd.args(&call.args)
            .current_dir(&call.work_dir)
            .stdin(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        match &call.stdout_to {
            Some(path) => {
                let file = std::fs::File::create(path)
                    .map_err(|e| anyhow!("Failed to create {}: {}", path.display(), e))?;
                cmd.stdout(Stdio::from(file));
            }
            None => {
                cmd.stdout(Stdio::piped());
            }
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| anyhow!("Failed to spawn {}: {}. Is {} installed?", call.program, e, call.program))?;

        let stdout = child.stdout.take();
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("Failed to capture stderr of {}", call.program))?;

        let read_stdout = async move {
            let mut buf = String::new();
            if let Some(mut out) = stdout {
                out.read_to_string(&mut buf).await?;
            }
            Ok::<String, std::io::Error>(buf)
        };

        let program = call.program.as_str();
        let read_stderr = async move {
            let mut lines = LinesStream::new(BufReader::new(stderr).lines());
            let mut tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL_LINES);
            while let Some(line) = lines.next().await {
                let line = line?;
                debug!("[{}] {}", program, line);
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            Ok::<Vec<String>, std::io::Error>(tail.into_iter().collect())
        };

        let (stdout, stderr_tail) = tokio::try_join!(read_stdout, read_stderr)?;
        let status = child.wait().await?;
        let stderr = stderr_tail.join("\n");

        if !status.success() {
            return Err(anyhow!("`{}` exited with {}: {}", call.command_line(), status, stderr));
        }
        Ok(ToolOutput {
            code: status.code(),
            stdout,
            stderr,
        })
    }
}

fn locate_on_path(program: &str) -> Option<PathBuf> {
    let candidate = Path::new(program);
    if candidate.components().count() > 1 {
        return is_executable(candidate).then(|| candidate.to_path_buf());
    }
    let paths = env::var_os("PATH")?;
    env::split_paths(&paths)
        .map(|dir| dir.join(program))
        .find(|p| is_executable(p))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}


pub mod fasterq_dump {
    use std::path::Path;

    /// `--split-files` writes one `<sample>_N.fastq` per biological read, so
    /// a single-cell run shows up as a third file instead of being folded
    /// into a paired layout.
    pub fn arg_generator(input: &Path, out_dir: &Path, sample: &str, threads: usize) -> Vec<String> {
        vec![
            "--split-files".to_string(),
            "-e".to_string(),
            threads.to_string(),
            "-O".to_string(),
            out_dir.to_string_lossy().to_string(),
            "-o".to_string(),
            format!("{}.fastq", sample),
            input.to_string_lossy().to_string(),
        ]
    }
}

pub mod fastp {
    use std::path::PathBuf;

    // fastp caps worker threads at 16
    const FASTP_MAX_THREADS: usize = 16;

    #[derive(Debug, Clone)]
    pub struct FastpConfig {
        pub inputs: Vec<PathBuf>,
        pub outputs: Vec<PathBuf>,
        pub json: PathBuf,
        pub html: PathBuf,
        pub quality: u8,
        pub threads: usize,
    }

    pub fn arg_generator(config: &FastpConfig) -> Vec<String> {
        let mut args_vec: Vec<String> = Vec::new();
        let in_flags = ["-i", "-I"];
        let out_flags = ["-o", "-O"];
        for (flag, path) in in_flags.iter().zip(&config.inputs) {
            args_vec.push(flag.to_string());
            args_vec.push(path.to_string_lossy().to_string());
        }
        for (flag, path) in out_flags.iter().zip(&config.outputs) {
            args_vec.push(flag.to_string());
            args_vec.push(path.to_string_lossy().to_string());
        }
        if config.inputs.len() > 1 {
            args_vec.push("--detect_adapter_for_pe".to_string());
        }
        args_vec.push("-q".to_string());
        args_vec.push(config.quality.to_string());
        args_vec.push("-w".to_string());
        args_vec.push(config.threads.min(FASTP_MAX_THREADS).to_string());
        args_vec.push("-j".to_string());
        args_vec.push(config.json.to_string_lossy().to_string());
        args_vec.push("-h".to_string());
        args_vec.push(config.html.to_string_lossy().to_string());
        args_vec
    }
}

pub mod star {
    use std::path::{Path, PathBuf};

    pub fn genome_generate_args(index_dir: &Path, genome: &Path, annotation: &Path, threads: usize) -> Vec<String> {
        let mut args_vec = vec![
            "--runMode".to_string(),
            "genomeGenerate".to_string(),
            "--runThreadN".to_string(),
            threads.to_string(),
            "--genomeDir".to_string(),
            index_dir.to_string_lossy().to_string(),
            "--genomeFastaFiles".to_string(),
            genome.to_string_lossy().to_string(),
            "--sjdbGTFfile".to_string(),
            annotation.to_string_lossy().to_string(),
        ];
        let is_gff = annotation
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case("gff") || e.eq_ignore_ascii_case("gff3"))
            .unwrap_or(false);
        if is_gff {
            args_vec.push("--sjdbGTFtagExonParentTranscript".to_string());
            args_vec.push("Parent".to_string());
        }
        args_vec
    }

    /// Unsorted BAM output lands at `<prefix>Aligned.out.bam`.
    pub fn align_args(index_dir: &Path, reads: &[PathBuf], prefix: &Path, threads: usize) -> Vec<String> {
        let mut args_vec = vec![
            "--runThreadN".to_string(),
            threads.to_string(),
            "--genomeDir".to_string(),
            index_dir.to_string_lossy().to_string(),
            "--readFilesIn".to_string(),
        ];
        args_vec.extend(reads.iter().map(|r| r.to_string_lossy().to_string()));
        args_vec.extend([
            "--outSAMtype".to_string(),
            "BAM".to_string(),
            "Unsorted".to_string(),
            "--alignIntronMax".to_string(),
            "1".to_string(),
            "--alignEndsType".to_string(),
            "EndToEnd".to_string(),
            // flagstat mapped% is only meaningful with unmapped reads kept
            "--outSAMunmapped".to_string(),
            "Within".to_string(),
            "--outFileNamePrefix".to_string(),
            prefix.to_string_lossy().to_string(),
        ]);
        args_vec
    }
}

pub mod samtools {
    use crate::config::defs::SamtoolsSubcommand;

    #[derive(Debug, Clone)]
    pub struct SamtoolsConfig {
        pub subcommand: SamtoolsSubcommand,
        /// Ordered flags and positional arguments following the subcommand.
        pub subcommand_fields: Vec<(String, Option<String>)>,
    }

    pub fn arg_generator(config: &SamtoolsConfig, threads: usize) -> Vec<String> {
        let mut args_vec: Vec<String> = vec![config.subcommand.as_str().to_string()];
        if config.subcommand != SamtoolsSubcommand::Head {
            args_vec.push("-@".to_string());
            args_vec.push(threads.to_string());
        }
        for (key, value) in &config.subcommand_fields {
            args_vec.push(key.clone());
            if let Some(value) = value {
                args_vec.push(value.clone());
            }
        }
        args_vec
    }
}

pub mod macs3 {
    use std::path::Path;
    use crate::config::defs::{Layout, MACS3_QVALUE, SE_EXTSIZE, SE_SHIFT};

    pub fn arg_generator(bam: &Path, layout: Layout, genome_size: u64, sample: &str, out_dir: &Path) -> Vec<String> {
        let format = if layout.is_paired() { "BAMPE" } else { "BAM" };
        let mut args_vec = vec![
            "callpeak".to_string(),
            "-t".to_string(),
            bam.to_string_lossy().to_string(),
            "-f".to_string(),
            format.to_string(),
            "-g".to_string(),
            genome_size.to_string(),
            "-n".to_string(),
            sample.to_string(),
            "--outdir".to_string(),
            out_dir.to_string_lossy().to_string(),
            "-q".to_string(),
            MACS3_QVALUE.to_string(),
        ];
        if !layout.is_paired() {
            args_vec.extend([
                "--nomodel".to_string(),
                "--shift".to_string(),
                SE_SHIFT.to_string(),
                "--extsize".to_string(),
                SE_EXTSIZE.to_string(),
            ]);
        }
        args_vec
    }
}

pub mod bam_coverage {
    use std::path::Path;
    use crate::config::defs::Layout;

    pub fn arg_generator(bam: &Path, out: &Path, bin_size: u32, layout: Layout, threads: usize) -> Vec<String> {
        let mut args_vec = vec![
            "-b".to_string(),
            bam.to_string_lossy().to_string(),
            "-o".to_string(),
            out.to_string_lossy().to_string(),
            "--binSize".to_string(),
            bin_size.to_string(),
            "--normalizeUsing".to_string(),
            "RPKM".to_string(),
            "-p".to_string(),
            threads.to_string(),
        ];
        if layout.is_paired() {
            args_vec.push("--extendReads".to_string());
        }
        args_vec
    }
}
