//! A scripted [`CommandRunner`] for adapter tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;

use crate::errors::CommandError;
use crate::platform::{CommandOutput, CommandRunner, CommandSpec};

#[derive(Debug)]
struct Rule {
    program: String,
    args: Vec<String>,
    responses: VecDeque<Result<CommandOutput, CommandError>>,
}

impl Rule {
    fn matches(&self, spec: &CommandSpec) -> bool {
        let args: Vec<&str> = self.args.iter().map(String::as_str).collect();
        self.program == spec.program && spec.has_args(&args)
    }

    fn next(&mut self) -> Result<CommandOutput, CommandError> {
        if self.responses.len() > 1 {
            self.responses.pop_front().unwrap_or_else(|| Ok(CommandOutput::default()))
        } else {
            self.responses.front().cloned().unwrap_or_else(|| Ok(CommandOutput::default()))
        }
    }
}

/// Answers commands from a script and records every call.
///
/// A rule matches on program name plus an ordered run of arguments. The most
/// recently added matching rule answers; its responses are consumed in order
/// and the last one repeats. Unmatched commands succeed with empty output.
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<CommandSpec>>,
}

impl ScriptedRunner {
    /// Creates a runner with no rules.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Answers matching commands with `output`.
    #[must_use]
    pub fn on(self, program: &str, args: &[&str], output: CommandOutput) -> Self {
        self.on_sequence(program, args, vec![output])
    }

    /// Answers matching commands with `outputs` in turn.
    #[must_use]
    pub fn on_sequence(self, program: &str, args: &[&str], outputs: Vec<CommandOutput>) -> Self {
        self.push(program, args, outputs.into_iter().map(Ok).collect());
        self
    }

    /// Makes matching commands fail to spawn.
    #[must_use]
    pub fn fail_spawn(self, program: &str, args: &[&str], message: &str) -> Self {
        let err = CommandError::new(program, message);
        self.push(program, args, VecDeque::from([Err(err)]));
        self
    }

    /// Adds a rule after construction.
    pub fn add(&self, program: &str, args: &[&str], output: CommandOutput) {
        self.push(program, args, VecDeque::from([Ok(output)]));
    }

    fn push(&self, program: &str, args: &[&str], responses: VecDeque<Result<CommandOutput, CommandError>>) {
        self.rules.lock().push(Rule {
            program: program.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            responses,
        });
    }

    /// Returns every command run so far.
    #[must_use]
    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls.lock().clone()
    }

    /// Returns the total number of commands run.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Returns the commands that match `program` and `args`.
    #[must_use]
    pub fn calls_matching(&self, program: &str, args: &[&str]) -> Vec<CommandSpec> {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.program == program && c.has_args(args))
            .cloned()
            .collect()
    }

    /// Clears the call log.
    pub fn reset_calls(&self) {
        self.calls.lock().clear();
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, CommandError> {
        self.calls.lock().push(spec.clone());
        let mut rules = self.rules.lock();
        match rules.iter_mut().rev().find(|r| r.matches(spec)) {
            Some(rule) => rule.next(),
            None => Ok(CommandOutput::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sequence_then_repeat_last() {
        let runner = ScriptedRunner::new().on_sequence(
            "kubectl",
            &["get", "job"],
            vec![CommandOutput::ok("1"), CommandOutput::ok("2")],
        );
        let spec = CommandSpec::new("kubectl").args(["get", "job", "x"]);

        assert_eq!(runner.run(&spec).await.unwrap().stdout, "1");
        assert_eq!(runner.run(&spec).await.unwrap().stdout, "2");
        assert_eq!(runner.run(&spec).await.unwrap().stdout, "2");
        assert_eq!(runner.call_count(), 3);
    }

    #[tokio::test]
    async fn test_latest_rule_wins_and_default_succeeds() {
        let runner = ScriptedRunner::new().on("az", &["group"], CommandOutput::failed(1, "no"));
        runner.add("az", &["group", "delete"], CommandOutput::ok("deleted"));

        let out = runner
            .run(&CommandSpec::new("az").args(["group", "delete"]))
            .await
            .unwrap();
        assert_eq!(out.stdout, "deleted");

        let out = runner.run(&CommandSpec::new("helm").arg("version")).await.unwrap();
        assert!(out.success());
        assert_eq!(runner.calls_matching("az", &["group"]).len(), 1);
    }

    #[tokio::test]
    async fn test_fail_spawn() {
        let runner = ScriptedRunner::new().fail_spawn("az", &[], "not installed");
        let err = runner.run(&CommandSpec::new("az").arg("login")).await.unwrap_err();
        assert_eq!(err.message, "not installed");
    }
}
