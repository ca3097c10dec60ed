//! Scripted command runner for tests
//!
//! Compiled for unit tests and, with the `test-util` feature, for the
//! integration tests under `tests/`.

use crate::process::{CommandOutput, CommandRunner, CommandSpec, ProcessError};
use async_trait::async_trait;
use std::sync::Mutex;

pub type Reply = Result<CommandOutput, ProcessError>;

/// Answers commands by (program, leading args) prefix; unmatched commands succeed silently
#[derive(Default)]
pub struct ScriptedRunner {
    rules: Mutex<Vec<(String, Vec<String>, Reply)>>,
    calls: Mutex<Vec<CommandSpec>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(self, program: &str, prefix: &[&str], reply: Reply) -> Self {
        self.rules.lock().unwrap().push((
            program.to_string(),
            prefix.iter().map(|s| s.to_string()).collect(),
            reply,
        ));
        self
    }

    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls.lock().unwrap().clone()
    }

    /// Calls to `program` whose first argument is `subcommand`
    pub fn calls_to(&self, program: &str, subcommand: &str) -> Vec<CommandSpec> {
        self.calls()
            .into_iter()
            .filter(|c| {
                c.program == program && c.args.first().map(String::as_str) == Some(subcommand)
            })
            .collect()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ProcessError> {
        self.calls.lock().unwrap().push(spec.clone());

        let rules = self.rules.lock().unwrap();
        let reply = rules.iter().find(|(program, prefix, _)| {
            *program == spec.program && spec.args.starts_with(prefix)
        });

        match reply {
            Some((_, _, reply)) => reply.clone(),
            None => ok(""),
        }
    }
}

pub fn ok(stdout: &str) -> Reply {
    Ok(CommandOutput {
        status: Some(0),
        stdout: stdout.to_string(),
        stderr: String::new(),
    })
}

pub fn fail(code: i32, stderr: &str) -> Reply {
    Ok(CommandOutput {
        status: Some(code),
        stdout: String::new(),
        stderr: stderr.to_string(),
    })
}

/// Binary not installed
pub fn missing(program: &str) -> Reply {
    Err(ProcessError::Spawn {
        program: program.to_string(),
        message: "No such file or directory (os error 2)".to_string(),
    })
}
