pub mod atac_seq;
pub mod stages;
