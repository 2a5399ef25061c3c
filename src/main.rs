use std::env;
use std::io::Write;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use env_logger::Builder;
use log::{debug, error, info, warn, LevelFilter};

use atacflow::cli::parse;
use atacflow::config::defs::{PipelineConfig, PipelineError};
use atacflow::pipelines::atac_seq;
use atacflow::utils::command::SystemInvoker;
use atacflow::utils::file::validate_file_inputs;
use atacflow::utils::system::{detect_cores_and_load, oversubscription_warning};


#[tokio::main]
async fn main() -> Result<()> {
    let run_start = Instant::now();

    let args = parse();

    let log_level = if args.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    Builder::new()
        .filter_level(log_level)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{}] {}: {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.args()
            )
        })
        .init();

    println!("\n-------------\n atacflow\n-------------\n");

    let dir = env::current_dir()?;
    info!("The current directory is {:?}", dir);

    let (physical_cores, cpu_load) = detect_cores_and_load().await;
    debug!("Detected {} physical cores; CPU load {:.1}%", physical_cores, cpu_load);
    if let Some(message) = oversubscription_warning(args.threads, physical_cores) {
        warn!("{}", message);
    }

    if let Err(e) = pipeline_run(&args, &dir).await {
        error!("Pipeline failed: {} at {} milliseconds.", e, run_start.elapsed().as_millis());
        eprintln!("Hint: {}", e.hint());
        std::process::exit(1);
    }

    println!("Run complete: {} milliseconds.", run_start.elapsed().as_millis());
    Ok(())
}


async fn pipeline_run(args: &atacflow::Arguments, cwd: &std::path::Path) -> Result<(), PipelineError> {
    let config = PipelineConfig::from_args(args, cwd)?;
    validate_file_inputs(&config)?;
    atac_seq::run(Arc::new(config), &SystemInvoker).await?;
    Ok(())
}
