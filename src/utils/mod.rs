pub mod classify;
pub mod command;
pub mod fastq;
pub mod file;
pub mod gate;
pub mod metrics;
pub mod reference;
pub mod system;
