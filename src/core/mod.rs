mod engine;
mod report;

pub mod call_tree;
pub mod llm;
pub mod model;
pub mod parser;
pub mod pipeline;
pub mod progress;
pub mod stages;
pub mod store;
pub mod task_runner;

pub use engine::{AnalyzeRequest, Engine};
