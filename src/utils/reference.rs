use std::path::{Path, PathBuf};

use crate::config::defs::{
    PipelineError, STAR_GENOME_PARAMETERS, STAR_GENOME_SIZE_FIELD, STAR_INDEX_FILES, STAR_INDEX_SUFFIX,
};


/// STAR index directory for a genome: `<genome_dir>/<genome_stem>.STAR`.
/// It lives beside the FASTA so every run against that genome shares it.
pub fn index_dir(genome: &Path) -> PathBuf {
    let stem = genome
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "genome".to_string());
    let parent = genome.parent().unwrap_or_else(|| Path::new("."));
    parent.join(format!("{}.{}", stem, STAR_INDEX_SUFFIX))
}


/// Files a finished index holds. A directory missing any of them is a
/// leftover from a failed build.
pub fn index_files(index_dir: &Path) -> Vec<PathBuf> {
    STAR_INDEX_FILES.iter().map(|name| index_dir.join(name)).collect()
}


/// Reads the effective genome size handed to the peak caller from the
/// `genomeFileSizes` field of the index's `genomeParameters.txt`.
///
/// # Arguments
///
/// * `index_dir` - STAR index directory, built now or by an earlier run.
///
/// # Returns
/// First integer of the field, or a StageFailure when it is missing.
pub async fn read_effective_genome_size(index_dir: &Path) -> Result<u64, PipelineError> {
    let params = index_dir.join(STAR_GENOME_PARAMETERS);
    let raw = tokio::fs::read_to_string(&params).await.map_err(|e| PipelineError::StageFailure {
        stage: "call_peaks".to_string(),
        tool: "STAR".to_string(),
        error: format!("cannot read {}: {}", params.display(), e),
    })?;
    parse_genome_size(&raw).ok_or_else(|| PipelineError::StageFailure {
        stage: "call_peaks".to_string(),
        tool: "STAR".to_string(),
        error: format!("no numeric {} field in {}", STAR_GENOME_SIZE_FIELD, params.display()),
    })
}

fn parse_genome_size(raw: &str) -> Option<u64> {
    raw.lines()
        .filter(|line| !line.starts_with('#'))
        .find_map(|line| {
            let mut fields = line.split_whitespace();
            if fields.next()? != STAR_GENOME_SIZE_FIELD {
                return None;
            }
            fields.next()?.parse::<u64>().ok()
        })
        .filter(|size| *size > 0)
}


#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const PARAMS: &str = "\
### STAR   --runMode genomeGenerate   --genomeDir ref.STAR
### GstrandBit 32
versionGenome\t2.7.4a
genomeType\tFull
genomeFastaFiles\tref.fa
genomeSAindexNbases\t14
genomeFileSizes\t3099922541 24528936378
";

    #[test]
    fn test_index_dir_beside_genome() {
        assert_eq!(index_dir(Path::new("/refs/hg38.fa")), PathBuf::from("/refs/hg38.STAR"));
        assert_eq!(index_dir(Path::new("/refs/mm10.fasta")), PathBuf::from("/refs/mm10.STAR"));
    }

    #[test]
    fn test_index_files_include_parameters() {
        let files = index_files(Path::new("/refs/hg38.STAR"));
        assert!(files.contains(&PathBuf::from("/refs/hg38.STAR/genomeParameters.txt")));
        assert!(files.contains(&PathBuf::from("/refs/hg38.STAR/SA")));
        assert_eq!(files.len(), STAR_INDEX_FILES.len());
    }

    #[test]
    fn test_parse_genome_size() {
        assert_eq!(parse_genome_size(PARAMS), Some(3_099_922_541));
        assert_eq!(parse_genome_size("genomeFileSizes\tNaN\n"), None);
        assert_eq!(parse_genome_size("versionGenome\t2.7.4a\n"), None);
        assert_eq!(parse_genome_size("# genomeFileSizes\t5\n"), None);
    }

    #[tokio::test]
    async fn test_read_from_existing_index() -> anyhow::Result<()> {
        let dir = tempdir()?;
        std::fs::write(dir.path().join(STAR_GENOME_PARAMETERS), PARAMS)?;
        assert_eq!(read_effective_genome_size(dir.path()).await?, 3_099_922_541);

        let empty = tempdir()?;
        assert!(matches!(
            read_effective_genome_size(empty.path()).await,
            Err(PipelineError::StageFailure { .. })
        ));
        Ok(())
    }
}
