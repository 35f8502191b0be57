//! Post-run results parsing.
//!
//! The parser is an external program. Its outcome never changes an entry's
//! status; failures are only logged by the caller.

use std::path::Path;
use std::process::Command;

use tracing::debug;

use crate::error::{Result, SchedulerError};


pub trait ResultsParser {
    fn parse(&mut self, results_dir: &Path) -> Result<()>;
}


/// Used when no parser command is configured.
#[derive(Debug, Default)]
pub struct NoopParser;

impl ResultsParser for NoopParser {
    fn parse(&mut self, _results_dir: &Path) -> Result<()> {
        Ok(())
    }
}


/// Runs `command... <results_dir>` and waits for it.
#[derive(Debug, Clone)]
pub struct CommandParser {
    command: Vec<String>,
}

impl CommandParser {
    /// `None` for an empty command.
    pub fn new(command: Vec<String>) -> Option<Self> {
        if command.is_empty() {
            None
        } else {
            Some(CommandParser { command })
        }
    }
}

impl ResultsParser for CommandParser {
    fn parse(&mut self, results_dir: &Path) -> Result<()> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| SchedulerError::Config("empty parser command".into()))?;
        debug!(program, dir = %results_dir.display(), "running results parser");
        let status = Command::new(program).args(args).arg(results_dir).status()?;
        if status.success() {
            Ok(())
        } else {
            Err(SchedulerError::Launch(format!(
                "parser {} exited with {}",
                program, status
            )))
        }
    }
}


/// The parser configured by `parser_command`.
pub fn from_command(command: &[String]) -> Box<dyn ResultsParser> {
    match CommandParser::new(command.to_vec()) {
        Some(parser) => Box::new(parser),
        None => Box::new(NoopParser),
    }
}
