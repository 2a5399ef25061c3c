pub mod defs;

use std::path::{Path, PathBuf};

use chrono::Local;

use crate::cli::Arguments;
use crate::config::defs::{GatePolicy, PipelineConfig, PipelineError, MAX_QUALITY_BASE};
use crate::utils::file::{absolutize, sample_name};

impl PipelineConfig {
    /// Builds and validates the run configuration from parsed arguments.
    /// Paths are made absolute against `cwd`; the output directory defaults
    /// to `<sample>_YYYYMMDD` in `cwd` and is not created here.
    ///
    /// # Arguments
    ///
    /// * `args` - Parsed command-line arguments.
    /// * `cwd` - The current working directory.
    ///
    /// # Returns
    /// A validated PipelineConfig, or ConfigValidation on bad values.
    pub fn from_args(args: &Arguments, cwd: &Path) -> Result<Self, PipelineError> {
        if args.force && args.skip {
            return Err(PipelineError::ConfigValidation(
                "--force and --skip are mutually exclusive".to_string(),
            ));
        }
        if args.quality_base < 0 || args.quality_base > MAX_QUALITY_BASE as i64 {
            return Err(PipelineError::ConfigValidation(format!(
                "--qualityBase must be within [0,{}], got {}",
                MAX_QUALITY_BASE, args.quality_base
            )));
        }

        let input = absolutize(Path::new(&args.input), cwd);
        let sample = sample_name(&input)?;

        let gate_policy = if args.force {
            GatePolicy::Force
        } else if args.skip {
            GatePolicy::Resume
        } else {
            GatePolicy::Strict
        };

        let out_dir = match &args.out_dir {
            Some(out) => absolutize(Path::new(out), cwd),
            None => default_out_dir(cwd, &sample),
        };

        let config = PipelineConfig {
            cwd: cwd.to_path_buf(),
            input,
            input2: args.input2.as_ref().map(|p| absolutize(Path::new(p), cwd)),
            genome: absolutize(Path::new(&args.genome), cwd),
            annotation: absolutize(Path::new(&args.annotation), cwd),
            quality_base: args.quality_base as u8,
            threads: args.threads,
            bin_size: args.bin_size,
            gate_policy,
            remove: args.remove,
            resume_metrics: args.resume_metrics,
            out_dir,
            sample,
        };
        config.validate()?;
        Ok(config)
    }
}

fn default_out_dir(cwd: &Path, sample: &str) -> PathBuf {
    cwd.join(format!("{}_{}", sample, Local::now().format("%Y%m%d")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn args(extra: &[&str]) -> Arguments {
        let mut argv = vec!["atacflow", "-i", "sample.sra", "-g", "ref.fa", "-a", "ref.gtf"];
        argv.extend_from_slice(extra);
        Arguments::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_from_args_defaults() {
        let cwd = PathBuf::from("/work");
        let config = PipelineConfig::from_args(&args(&["-o", "out"]), &cwd).unwrap();
        assert_eq!(config.sample, "sample");
        assert_eq!(config.input, PathBuf::from("/work/sample.sra"));
        assert_eq!(config.out_dir, PathBuf::from("/work/out"));
        assert_eq!(config.gate_policy, GatePolicy::Strict);
        assert!(!config.signal_track_enabled());
        assert_eq!(config.report_path(), PathBuf::from("/work/out/sample.atacflow.report.txt"));
    }

    #[test]
    fn test_default_out_dir_uses_sample() {
        let cwd = PathBuf::from("/work");
        let config = PipelineConfig::from_args(&args(&[]), &cwd).unwrap();
        let name = config.out_dir.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("sample_"));
        assert_eq!(name.len(), "sample_".len() + 8);
    }

    #[test]
    fn test_quality_out_of_range() {
        let cwd = PathBuf::from("/work");
        for q in ["41", "-1", "100"] {
            let result = PipelineConfig::from_args(&args(&["--qualityBase", q]), &cwd);
            assert!(matches!(result, Err(PipelineError::ConfigValidation(_))), "qualityBase {}", q);
        }
        assert!(PipelineConfig::from_args(&args(&["--qualityBase", "40"]), &cwd).is_ok());
        assert!(PipelineConfig::from_args(&args(&["--qualityBase", "0"]), &cwd).is_ok());
    }

    #[test]
    fn test_threads_lower_bound() {
        let cwd = PathBuf::from("/work");
        let result = PipelineConfig::from_args(&args(&["--threads", "1"]), &cwd);
        assert!(matches!(result, Err(PipelineError::ConfigValidation(_))));
    }

    #[test]
    fn test_force_and_skip_rejected_without_clap() {
        let mut a = args(&[]);
        a.force = true;
        a.skip = true;
        let result = PipelineConfig::from_args(&a, Path::new("/work"));
        assert!(matches!(result, Err(PipelineError::ConfigValidation(_))));
    }

    #[test]
    fn test_gate_policy_from_flags() {
        let cwd = PathBuf::from("/work");
        assert_eq!(PipelineConfig::from_args(&args(&["--skip"]), &cwd).unwrap().gate_policy, GatePolicy::Resume);
        assert_eq!(PipelineConfig::from_args(&args(&["--force"]), &cwd).unwrap().gate_policy, GatePolicy::Force);
    }
}
