//! The pidfile a worker leaves in its results directory.
//!
//! Line 1 is the worker's pid, written as soon as it starts. Line 2 is its
//! exit code, appended when it terminates. Nothing else is ever written.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;

pub const PIDFILE_NAME: &str = ".execute_pid";


#[derive(Debug, Error)]
pub enum PidfileError {
    #[error("cannot read pidfile: {0}")]
    Io(#[from] io::Error),
    #[error("malformed pidfile: {0}")]
    Malformed(String),
}


/// One reading of a pidfile. An absent file reads as all `None`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PidfileState {
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
}

impl PidfileState {
    pub fn is_started(&self) -> bool {
        self.pid.is_some()
    }

    pub fn is_finished(&self) -> bool {
        self.exit_code.is_some()
    }
}


pub fn path_in(results_dir: &Path) -> PathBuf {
    results_dir.join(PIDFILE_NAME)
}

pub fn parse(content: &str) -> Result<PidfileState, PidfileError> {
    let lines: Vec<&str> = content.lines().map(str::trim).collect();
    if lines.len() > 2 {
        return Err(PidfileError::Malformed(format!("{} lines", lines.len())));
    }
    let mut state = PidfileState::default();
    if let Some(first) = lines.first() {
        if first.is_empty() {
            return Err(PidfileError::Malformed("empty pid line".into()));
        }
        let pid = first
            .parse::<u32>()
            .map_err(|_| PidfileError::Malformed(format!("bad pid '{}'", first)))?;
        state.pid = Some(pid);
    }
    if let Some(second) = lines.get(1) {
        let code = second
            .parse::<i32>()
            .map_err(|_| PidfileError::Malformed(format!("bad exit code '{}'", second)))?;
        state.exit_code = Some(code);
    }
    Ok(state)
}

pub fn read(results_dir: &Path) -> Result<PidfileState, PidfileError> {
    match fs::read_to_string(path_in(results_dir)) {
        Ok(content) => parse(&content),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(PidfileState::default()),
        Err(e) => Err(e.into()),
    }
}

/// Rename a leftover pidfile so a relaunch in the same directory starts
/// from an empty reading. Returns whether there was one.
pub fn move_aside(results_dir: &Path) -> io::Result<bool> {
    let path = path_in(results_dir);
    if !path.exists() {
        return Ok(false);
    }
    let mut aside = path.clone().into_os_string();
    aside.push(".previous");
    fs::rename(&path, aside)?;
    Ok(true)
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn three_readings() {
        assert_eq!(parse("").unwrap(), PidfileState::default());
        assert_eq!(
            parse("4242\n").unwrap(),
            PidfileState { pid: Some(4242), exit_code: None }
        );
        assert_eq!(
            parse("4242\n0\n").unwrap(),
            PidfileState { pid: Some(4242), exit_code: Some(0) }
        );
    }

    #[test]
    fn garbage_is_malformed() {
        assert!(matches!(parse("abc\n"), Err(PidfileError::Malformed(_))));
        assert!(matches!(parse("12\nx\n"), Err(PidfileError::Malformed(_))));
        assert!(matches!(parse("12\n0\n7\n"), Err(PidfileError::Malformed(_))));
    }

    #[test]
    fn missing_file_is_not_started() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!read(dir.path()).unwrap().is_started());
        assert!(!move_aside(dir.path()).unwrap());
    }

    #[test]
    fn move_aside_clears_reading() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(path_in(dir.path()), "1\n0\n").unwrap();
        assert!(read(dir.path()).unwrap().is_finished());
        assert!(move_aside(dir.path()).unwrap());
        assert_eq!(read(dir.path()).unwrap(), PidfileState::default());
        assert!(dir.path().join(".execute_pid.previous").exists());
    }
}
