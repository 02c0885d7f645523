#![deny(unused_variables)]
pub mod callers;
pub mod chromosomes;
pub mod command;
pub mod config;
pub mod dispatch;
pub mod grouping;
pub mod identity;
pub mod merge;
pub mod partition;
pub mod planner;
#[path = "../shared/files.rs"]
pub mod shared_files;
pub mod sim;
pub mod state;
pub mod types;
pub mod workflow;
pub mod shared {
    pub use super::shared_files as files;
}
