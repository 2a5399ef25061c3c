use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

use flate2::read::MultiGzDecoder;
use seq_io::fastq::{Reader, Record};

use crate::config::defs::{PipelineError, GZIP_EXT};
use crate::utils::file::is_gzipped;

pub enum FastqReader {
    Uncompressed(BufReader<File>),
    Gzipped(MultiGzDecoder<BufReader<File>>),
}

impl Read for FastqReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            FastqReader::Uncompressed(r) => r.read(buf),
            FastqReader::Gzipped(r) => r.read(buf),
        }
    }
}

/// Opens a FASTQ, choosing decompression from the gzip magic bytes rather
/// than the extension.
pub fn fastq_reader(path: &Path) -> io::Result<Reader<FastqReader>> {
    let file = BufReader::new(File::open(path)?);
    let reader = if is_gzipped(path)? {
        Reader::new(FastqReader::Gzipped(MultiGzDecoder::new(file)))
    } else {
        Reader::new(FastqReader::Uncompressed(file))
    };
    Ok(reader)
}


/// Checks that a FASTQ input looks like one: a `.gz` name must carry gzip
/// magic bytes and the first record must parse.
///
/// # Arguments
///
/// * `path` - Path to a .fastq/.fq file, optionally gzipped.
///
/// # Returns
/// Ok(()) or a Format error naming the file.
pub fn validate_fastq_head(path: &Path) -> Result<(), PipelineError> {
    let named_gz = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case(GZIP_EXT))
        .unwrap_or(false);
    if named_gz && !is_gzipped(path)? {
        return Err(PipelineError::Format(format!(
            "{} is named .gz but is not gzip-compressed",
            path.display()
        )));
    }

    let mut reader = fastq_reader(path)?;
    match reader.next() {
        Some(Ok(record)) if !record.seq().is_empty() => Ok(()),
        Some(Ok(_)) => Err(PipelineError::Format(format!("{}: first FASTQ record has no sequence", path.display()))),
        Some(Err(e)) => Err(PipelineError::Format(format!("{}: not a valid FASTQ: {}", path.display(), e))),
        None => Err(PipelineError::Format(format!("{}: FASTQ contains no records", path.display()))),
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn test_plain_fastq_ok() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("r.fq");
        std::fs::write(&path, "@r1\nACGT\n+\nIIII\n")?;
        validate_fastq_head(&path)?;
        Ok(())
    }

    #[test]
    fn test_gzipped_fastq_ok() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("r.fq.gz");
        let mut enc = GzEncoder::new(File::create(&path)?, Compression::default());
        enc.write_all(b"@r1\nACGT\n+\nIIII\n")?;
        enc.finish()?;
        validate_fastq_head(&path)?;
        Ok(())
    }

    #[test]
    fn test_fake_gz_rejected() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("r.fastq.gz");
        std::fs::write(&path, "@r1\nACGT\n+\nIIII\n")?;
        assert!(matches!(validate_fastq_head(&path), Err(PipelineError::Format(_))));
        Ok(())
    }

    #[test]
    fn test_not_fastq_rejected() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("r.fastq");
        std::fs::write(&path, ">contig\nACGT\n")?;
        assert!(matches!(validate_fastq_head(&path), Err(PipelineError::Format(_))));
        let empty = dir.path().join("e.fastq");
        std::fs::write(&empty, "")?;
        assert!(matches!(validate_fastq_head(&empty), Err(PipelineError::Format(_))));
        Ok(())
    }
}
