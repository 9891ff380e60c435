//! Financial Research Agent
//!
//! Answers natural-language questions about public companies from their
//! financial statements:
//! - Extracts companies and tickers, then plans atomic data-fetch tasks
//! - Fetches statements through a prioritized provider router with retry
//! - Validates the fetched data and scores confidence before any answer
//! - Synthesizes an answer only from validated data
//!
//! PIPELINE:
//! PLANNING → EXECUTING → VALIDATING → SYNTHESIZING → COMPLETED (or FAILED)

pub mod config;
pub mod controller;
pub mod data;
pub mod entities;
pub mod error;
pub mod executor;
pub mod models;
pub mod planner;
pub mod reasoning;
pub mod report;
pub mod synthesizer;
pub mod validator;

pub use error::Result;

// Re-export common types
pub use config::ResearchConfig;
pub use controller::{Controller, ErrorSource, Phase, RunState};
pub use data::{AlphaVantageProvider, DataProvider, ProviderRouter};
pub use error::{ErrorKind, ResearchError};
pub use models::*;
pub use reasoning::{OpenRouterClient, ReasoningClient};
pub use report::FinalReport;
pub use validator::{ConfidenceBreakdown, ValidationIssue, ValidationResult};
