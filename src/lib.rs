pub mod ai;
pub mod cli;
pub mod core;
pub mod replicate;
