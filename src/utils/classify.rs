//! Input classification: picks the execution mode from the input names and
//! resolves the read layout (single/paired) where the name alone cannot.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use log::warn;

use crate::config::defs::{Layout, Mode, PipelineError, BAM_SAMPLE_RECORDS, FASTQ_EXTS, GZIP_EXT, INPUT_EXTENSIONS};
use crate::utils::fastq::validate_fastq_head;
use crate::utils::file::{extension_chain, is_gzipped};


/// Selects the execution mode from the input path(s).
///
/// # Arguments
///
/// * `input` - Primary input path (or SRA accession).
/// * `input2` - Optional R2 path; its presence forces paired FASTQ.
///
/// # Returns
/// Exactly one Mode, or InvalidInputPair / UnrecognizedInput.
pub fn classify(input: &Path, input2: Option<&Path>) -> Result<Mode, PipelineError> {
    if let Some(input2) = input2 {
        for path in [input, input2] {
            if !is_fastq_name(path) {
                return Err(PipelineError::InvalidInputPair(format!(
                    "{} is not a FASTQ file name",
                    path.display()
                )));
            }
        }
        if same_file(input, input2) {
            return Err(PipelineError::InvalidInputPair(format!(
                "--input and --input2 both point to {}",
                input.display()
            )));
        }
        return Ok(Mode::FastqPe);
    }

    match extension_chain(input) {
        None => {
            warn!(
                "{} has no extension; treating it as an SRA accession",
                input.display()
            );
            Ok(Mode::Sra)
        }
        Some(chain) => INPUT_EXTENSIONS
            .get(chain.as_str())
            .copied()
            .ok_or_else(|| PipelineError::UnrecognizedInput(format!(
                "{} (extension '.{}')",
                input.display(),
                chain
            ))),
    }
}

fn is_fastq_name(path: &Path) -> bool {
    match extension_chain(path) {
        Some(chain) => {
            let base = chain.strip_suffix(&format!(".{}", GZIP_EXT)).unwrap_or(chain.as_str());
            FASTQ_EXTS.contains(&base)
        }
        None => false,
    }
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(ca), Ok(cb)) => ca == cb,
        _ => normalize(a) == normalize(b),
    }
}

fn normalize(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}


/// Cheap content checks on the inputs of a mode: FASTQ heads must parse,
/// BAMs must be BGZF (gzip magic). SRA inputs are left to the extractor.
pub fn check_content(mode: Mode, input: &Path, input2: Option<&Path>) -> Result<(), PipelineError> {
    match mode {
        Mode::FastqSe => validate_fastq_head(input),
        Mode::FastqPe => {
            validate_fastq_head(input)?;
            match input2 {
                Some(path) => validate_fastq_head(path),
                None => Err(PipelineError::InvalidInputPair("paired mode without --input2".to_string())),
            }
        }
        Mode::Bam => {
            if is_gzipped(input)? {
                Ok(())
            } else {
                Err(PipelineError::Format(format!("{} is not a BGZF-compressed BAM", input.display())))
            }
        }
        Mode::Sra => Ok(()),
    }
}


/// Files fasterq-dump may have written for `sample` into `out_dir`.
pub fn extracted_reads(out_dir: &Path, sample: &str) -> Vec<PathBuf> {
    vec![
        out_dir.join(format!("{}_1.fastq", sample)),
        out_dir.join(format!("{}_2.fastq", sample)),
        out_dir.join(format!("{}.fastq", sample)),
    ]
}

/// Decides the layout of an extracted SRA run: `_1` and `_2` without `_3`
/// is paired, a lone read file is single, three or more numbered files is
/// single-cell and rejected.
///
/// # Arguments
///
/// * `out_dir` - Directory the extractor wrote into.
/// * `sample` - Sample name used as the extraction prefix.
///
/// # Returns
/// Layout plus the read files to feed into QC.
pub fn resolve_sra_layout(out_dir: &Path, sample: &str) -> Result<(Layout, Vec<PathBuf>), PipelineError> {
    let numbered = |n: usize| out_dir.join(format!("{}_{}.fastq", sample, n));
    let present = |p: &Path| fs::metadata(p).map(|m| m.len() > 0).unwrap_or(false);

    let r1 = numbered(1);
    let r2 = numbered(2);
    if present(&numbered(3)) {
        return Err(PipelineError::UnsupportedDataShape(format!(
            "{} extracted into three or more read files; single-cell data is not supported",
            sample
        )));
    }
    if present(&r1) && present(&r2) {
        return Ok((Layout::Paired, vec![r1, r2]));
    }

    let single = out_dir.join(format!("{}.fastq", sample));
    if present(&single) {
        return Ok((Layout::Single, vec![single]));
    }
    if present(&r1) {
        return Ok((Layout::Single, vec![r1]));
    }
    Err(PipelineError::StageFailure {
        stage: "extract".to_string(),
        tool: "fasterq-dump".to_string(),
        error: format!("no extracted reads for {} in {}", sample, out_dir.display()),
    })
}


/// Column 2 (FLAG) of up to BAM_SAMPLE_RECORDS SAM records; header lines
/// and malformed flags are ignored.
pub fn parse_sam_flags(sam: &str) -> Vec<u16> {
    sam.lines()
        .filter(|line| !line.starts_with('@') && !line.trim().is_empty())
        .filter_map(|line| line.split('\t').nth(1))
        .filter_map(|flag| flag.parse::<u16>().ok())
        .take(BAM_SAMPLE_RECORDS)
        .collect()
}

/// Best-effort layout guess for a BAM: single-end if any distinct sampled
/// flag is even (paired bit unset). A sample with no records is treated as
/// single-end.
pub fn layout_from_flags(flags: &[u16]) -> Layout {
    let distinct: HashSet<u16> = flags.iter().copied().collect();
    if distinct.is_empty() {
        warn!("No alignment records sampled; assuming single-end");
        return Layout::Single;
    }
    if distinct.iter().any(|flag| flag % 2 == 0) {
        Layout::Single
    } else {
        Layout::Paired
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_single_input_modes() {
        let cases = [
            ("sample.sra", Mode::Sra),
            ("sample.SRA", Mode::Sra),
            ("SRR1234567", Mode::Sra),
            ("reads.fastq", Mode::FastqSe),
            ("reads.fastq.gz", Mode::FastqSe),
            ("reads.fq", Mode::FastqSe),
            ("reads.fq.gz", Mode::FastqSe),
            ("reads.FQ.GZ", Mode::FastqSe),
            ("aligned.bam", Mode::Bam),
        ];
        for (name, expected) in cases {
            assert_eq!(classify(Path::new(name), None).unwrap(), expected, "{}", name);
        }
    }

    #[test]
    fn test_unrecognized_extension() {
        for name in ["reads.txt", "aligned.cram", "reads.fasta.gz", "x.sra.gz"] {
            assert!(
                matches!(classify(Path::new(name), None), Err(PipelineError::UnrecognizedInput(_))),
                "{}",
                name
            );
        }
    }

    #[test]
    fn test_paired_inputs() {
        let mode = classify(Path::new("/d/s_R1.fq.gz"), Some(Path::new("/d/s_R2.fastq.gz"))).unwrap();
        assert_eq!(mode, Mode::FastqPe);
    }

    #[test]
    fn test_paired_identical_rejected() {
        let result = classify(Path::new("/d/s.fq"), Some(Path::new("/d/./s.fq")));
        assert!(matches!(result, Err(PipelineError::InvalidInputPair(_))));
        let result = classify(Path::new("/d/s.fq"), Some(Path::new("/d/s.fq")));
        assert!(matches!(result, Err(PipelineError::InvalidInputPair(_))));
    }

    #[test]
    fn test_paired_non_fastq_rejected() {
        let result = classify(Path::new("/d/s.bam"), Some(Path::new("/d/s2.fq")));
        assert!(matches!(result, Err(PipelineError::InvalidInputPair(_))));
    }

    #[test]
    fn test_sra_layouts() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let out = dir.path();
        std::fs::write(out.join("s_1.fastq"), "@r\nA\n+\nI\n")?;
        std::fs::write(out.join("s_2.fastq"), "@r\nA\n+\nI\n")?;
        let (layout, reads) = resolve_sra_layout(out, "s")?;
        assert_eq!(layout, Layout::Paired);
        assert_eq!(reads.len(), 2);

        std::fs::write(out.join("s_3.fastq"), "@r\nA\n+\nI\n")?;
        assert!(matches!(resolve_sra_layout(out, "s"), Err(PipelineError::UnsupportedDataShape(_))));

        std::fs::write(out.join("t.fastq"), "@r\nA\n+\nI\n")?;
        let (layout, reads) = resolve_sra_layout(out, "t")?;
        assert_eq!(layout, Layout::Single);
        assert_eq!(reads, vec![out.join("t.fastq")]);

        assert!(matches!(resolve_sra_layout(out, "missing"), Err(PipelineError::StageFailure { .. })));
        Ok(())
    }

    #[test]
    fn test_flag_parity_heuristic() {
        let sam = "@HD\tVN:1.6\nr1\t99\tchr1\t100\nr1\t147\tchr1\t300\nr2\t83\tchr1\t50\n";
        assert_eq!(layout_from_flags(&parse_sam_flags(sam)), Layout::Paired);

        let sam = "r1\t0\tchr1\t100\nr2\t16\tchr1\t300\n";
        assert_eq!(layout_from_flags(&parse_sam_flags(sam)), Layout::Single);

        // One unpaired record among pairs flips the guess
        assert_eq!(layout_from_flags(&[99, 147, 4]), Layout::Single);
        assert_eq!(layout_from_flags(&[]), Layout::Single);
    }

    #[test]
    fn test_bam_content_check() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let bam = dir.path().join("a.bam");
        std::fs::write(&bam, b"not a bam")?;
        assert!(matches!(check_content(Mode::Bam, &bam, None), Err(PipelineError::Format(_))));
        std::fs::write(&bam, [0x1F, 0x8B, 0x08, 0x04])?;
        check_content(Mode::Bam, &bam, None)?;
        Ok(())
    }
}
