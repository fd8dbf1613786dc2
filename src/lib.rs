pub mod anthropic;
pub mod commands;
pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod ollama;
pub mod openai;
pub mod planner;
pub mod processor;
pub mod provider;
pub mod repository;
pub mod safety;
pub mod types;
pub mod ui;

pub use error::{PleaseError, Result};
pub use processor::CommandProcessor;
pub use types::{RiskLevel, ScriptRequest, ScriptResponse, ScriptType};
