use std::fs::File;
use std::io::{self, BufRead, BufReader, Read};
use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::config::defs::{PipelineConfig, PipelineError, ANNOTATION_COLUMNS, ANNOTATION_EXTS, GZIP_EXT, SAMPLE_DELIMITERS};


pub fn is_gzipped(path: &Path) -> io::Result<bool> {
    let mut file = File::open(path)?;
    let mut buffer = [0u8; 2];
    match file.read_exact(&mut buffer) {
        Ok(()) => Ok(buffer == [0x1F, 0x8B]), // Gzip magic bytes
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}


/// Lowercase extension chain of a file name, keeping the extension in front
/// of a trailing `gz`.
///
/// # Arguments
///
/// * `path` - Any path; only the file name is inspected.
///
/// # Returns
/// `Some("fq.gz")` for `reads.fq.gz`, `Some("bam")` for `x.bam`, `None` when
/// the name has no extension.
pub fn extension_chain(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    let mut parts: Vec<&str> = name.split('.').collect();
    if parts.len() < 2 || (parts[0].is_empty() && parts.len() == 2) {
        return None;
    }
    let last = parts.pop()?.to_ascii_lowercase();
    if last == GZIP_EXT && parts.len() >= 2 {
        let inner = parts.pop()?.to_ascii_lowercase();
        return Some(format!("{}.{}", inner, last));
    }
    Some(last)
}


/// Derives the sample name shared by every artifact of a run: the input's
/// base name cut at the first of `@ : . _ -`.
///
/// # Arguments
///
/// * `path` - Input path (or bare SRA accession).
///
/// # Returns
/// Sample name; empty names are a configuration error.
pub fn sample_name(path: &Path) -> Result<String, PipelineError> {
    let base = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| PipelineError::ConfigValidation(format!("Input path {} has no file name", path.display())))?;
    let sample = match base.find(SAMPLE_DELIMITERS) {
        Some(idx) => &base[..idx],
        None => base,
    };
    if sample.is_empty() {
        return Err(PipelineError::ConfigValidation(format!(
            "Cannot derive a sample name from '{}': it starts with a delimiter",
            base
        )));
    }
    Ok(sample.to_string())
}


/// Joins a relative path onto `cwd`; absolute paths pass through.
pub fn absolutize(path: &Path, cwd: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        cwd.join(path)
    }
}


/// Checks the genome, annotation and read inputs before any stage runs.
/// An extensionless input is treated as an SRA accession and may be absent
/// from disk.
pub fn validate_file_inputs(config: &PipelineConfig) -> Result<(), PipelineError> {
    require_file(&config.genome, "--genome")?;
    require_file(&config.annotation, "--annotation")?;
    validate_annotation(&config.annotation)?;

    if extension_chain(&config.input).is_some() {
        require_file(&config.input, "--input")?;
    } else if !config.input.exists() {
        debug!("{} is not on disk; passing it on as an SRA accession", config.input.display());
    }
    if let Some(input2) = &config.input2 {
        require_file(input2, "--input2")?;
    }
    Ok(())
}

fn require_file(path: &Path, flag: &str) -> Result<(), PipelineError> {
    if !path.is_file() {
        return Err(PipelineError::Path(format!("{} file not found: {}", flag, path.display())));
    }
    Ok(())
}


/// Annotation files need a GFF/GTF extension and nine tab-separated columns
/// on the first line that is not a `#` comment.
pub fn validate_annotation(path: &Path) -> Result<(), PipelineError> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    if !ANNOTATION_EXTS.contains(&ext.as_str()) {
        return Err(PipelineError::Format(format!(
            "Annotation {} must have one of the extensions {:?}",
            path.display(),
            ANNOTATION_EXTS
        )));
    }

    let reader = BufReader::new(File::open(path)?);
    for line in reader.lines() {
        let line = line?;
        if line.starts_with('#') || line.trim().is_empty() {
            continue;
        }
        let columns = line.split('\t').count();
        if columns != ANNOTATION_COLUMNS {
            return Err(PipelineError::Format(format!(
                "Annotation {} has {} tab-separated columns on its first data line, expected {}",
                path.display(),
                columns,
                ANNOTATION_COLUMNS
            )));
        }
        return Ok(());
    }
    Err(PipelineError::Format(format!("Annotation {} has no data lines", path.display())))
}


/// Deletes a file, treating an already missing file as success.
pub async fn remove_if_exists(path: &Path) -> io::Result<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => {
            warn!("Could not remove {}: {}", path.display(), e);
            Err(e)
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::defs::{GatePolicy, ResumeMetricsPolicy};
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn test_extension_chain() {
        assert_eq!(extension_chain(Path::new("reads.fq.gz")).as_deref(), Some("fq.gz"));
        assert_eq!(extension_chain(Path::new("/data/reads.FASTQ")).as_deref(), Some("fastq"));
        assert_eq!(extension_chain(Path::new("x.bam")).as_deref(), Some("bam"));
        assert_eq!(extension_chain(Path::new("SRR000001")), None);
        assert_eq!(extension_chain(Path::new("archive.gz")).as_deref(), Some("gz"));
    }

    #[test]
    fn test_sample_name_delimiters() {
        assert_eq!(sample_name(Path::new("sample.sra")).unwrap(), "sample");
        assert_eq!(sample_name(Path::new("/in/SRR123_1.fastq.gz")).unwrap(), "SRR123");
        assert_eq!(sample_name(Path::new("liver-rep2.bam")).unwrap(), "liver");
        assert_eq!(sample_name(Path::new("run@lane:1.fq")).unwrap(), "run");
        assert_eq!(sample_name(Path::new("SRR000001")).unwrap(), "SRR000001");
        assert!(sample_name(Path::new("_odd.fq")).is_err());
    }

    #[test]
    fn test_annotation_valid_gtf() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("ref.gtf");
        let mut f = File::create(&path)?;
        writeln!(f, "#!genome-build test")?;
        writeln!(f, "chr1\tsrc\texon\t1\t100\t.\t+\t.\tgene_id \"g1\";")?;
        validate_annotation(&path)?;
        Ok(())
    }

    #[test]
    fn test_annotation_wrong_columns() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("ref.gff3");
        std::fs::write(&path, "chr1\tsrc\texon\t1\t100\n")?;
        assert!(matches!(validate_annotation(&path), Err(PipelineError::Format(_))));
        Ok(())
    }

    #[test]
    fn test_annotation_wrong_extension() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("ref.bed");
        std::fs::write(&path, "chr1\t1\t100\n")?;
        assert!(matches!(validate_annotation(&path), Err(PipelineError::Format(_))));
        Ok(())
    }

    #[test]
    fn test_is_gzipped() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let gz = dir.path().join("a.gz");
        std::fs::write(&gz, [0x1F, 0x8B, 0x08, 0x00])?;
        let plain = dir.path().join("a.txt");
        std::fs::write(&plain, b"@r1\n")?;
        let empty = dir.path().join("empty");
        std::fs::write(&empty, b"")?;
        assert!(is_gzipped(&gz)?);
        assert!(!is_gzipped(&plain)?);
        assert!(!is_gzipped(&empty)?);
        Ok(())
    }

    #[tokio::test]
    async fn test_remove_if_exists() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("gone.bam");
        std::fs::write(&path, b"x")?;
        assert!(remove_if_exists(&path).await?);
        assert!(!remove_if_exists(&path).await?);
        Ok(())
    }

    fn config_in(dir: &Path, input: &str, input2: Option<&str>, annotation: &str) -> PipelineConfig {
        PipelineConfig {
            cwd: dir.to_path_buf(),
            input: dir.join(input),
            input2: input2.map(|name| dir.join(name)),
            genome: dir.join("ref.fa"),
            annotation: dir.join(annotation),
            quality_base: 20,
            threads: 8,
            bin_size: 0,
            gate_policy: GatePolicy::Strict,
            remove: false,
            resume_metrics: ResumeMetricsPolicy::Recover,
            out_dir: dir.join("out"),
            sample: "reads".to_string(),
        }
    }

    #[test]
    fn test_validate_file_inputs() -> anyhow::Result<()> {
        let dir = tempdir()?;
        std::fs::write(dir.path().join("ref.fa"), ">chr1\nACGT\n")?;
        std::fs::write(dir.path().join("ref.gtf"), "chr1\tsrc\texon\t1\t4\t.\t+\t.\tgene_id \"g\";\n")?;
        std::fs::write(dir.path().join("ref.gff"), "chr1 exon 1 4\n")?;
        std::fs::write(dir.path().join("r1.fq"), "@r\nACGT\n+\nIIII\n")?;

        validate_file_inputs(&config_in(dir.path(), "r1.fq", None, "ref.gtf"))?;
        // extensionless inputs are accessions and may be absent
        validate_file_inputs(&config_in(dir.path(), "SRR000001", None, "ref.gtf"))?;

        let missing_mate = validate_file_inputs(&config_in(dir.path(), "r1.fq", Some("r2.fq"), "ref.gtf"));
        match missing_mate {
            Err(PipelineError::Path(msg)) => assert!(msg.contains("--input2")),
            other => panic!("unexpected result {:?}", other),
        }
        assert!(matches!(
            validate_file_inputs(&config_in(dir.path(), "r1.fq", None, "ref.gff")),
            Err(PipelineError::Format(_))
        ));
        assert!(matches!(
            validate_file_inputs(&config_in(dir.path(), "missing.fq", None, "ref.gtf")),
            Err(PipelineError::Path(_))
        ));
        Ok(())
    }
}
