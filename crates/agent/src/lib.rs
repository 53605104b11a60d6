//! The perception -> decision -> action loop: transcription, command
//! parsing, plan execution and the task lifecycle around them.

pub mod executor;
pub mod grammar;
pub mod orchestrator;
pub mod parser;
pub mod registry;
pub mod transcription;

#[cfg(test)]
mod testing;

pub use executor::{ExecutionJournal, ExecutionOutcome, ExecutionReport, Executor};
pub use grammar::{normalize_site, parse_command, GrammarMatch};
pub use orchestrator::Orchestrator;
pub use parser::{validate_plan, GrammarParser, IntentParser, PlanSource, ReasoningParser};
pub use registry::TaskRegistry;
pub use transcription::TranscriptionAdapter;
