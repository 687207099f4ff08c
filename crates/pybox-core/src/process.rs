use std::{
    path::Path,
    process::{Command, Stdio},
};

use anyhow::{Context, Result};

/// Environment variable changes applied to a subprocess on top of the inherited environment.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EnvOverrides {
    vars: Vec<(String, String)>,
    removed: Vec<String>,
}

impl EnvOverrides {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn set(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    #[must_use]
    pub fn unset(mut self, key: impl Into<String>) -> Self {
        self.remove(key);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        self.removed.retain(|existing| existing != &key);
        let value = value.into();
        match self.vars.iter_mut().find(|(existing, _)| existing == &key) {
            Some(slot) => slot.1 = value,
            None => self.vars.push((key, value)),
        }
    }

    pub fn remove(&mut self, key: impl Into<String>) {
        let key = key.into();
        self.vars.retain(|(existing, _)| existing != &key);
        if !self.removed.contains(&key) {
            self.removed.push(key);
        }
    }

    /// Layer `other` on top of `self`; entries in `other` win.
    pub fn extend(&mut self, other: &EnvOverrides) {
        for key in &other.removed {
            self.remove(key.clone());
        }
        for (key, value) in &other.vars {
            self.insert(key.clone(), value.clone());
        }
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars
            .iter()
            .find(|(existing, _)| existing == key)
            .map(|(_, value)| value.as_str())
    }

    #[must_use]
    pub fn is_removed(&self, key: &str) -> bool {
        self.removed.iter().any(|existing| existing == key)
    }

    #[must_use]
    pub fn vars(&self) -> &[(String, String)] {
        &self.vars
    }

    #[must_use]
    pub fn removed(&self) -> &[String] {
        &self.removed
    }

    pub fn apply(&self, command: &mut Command) {
        for key in &self.removed {
            command.env_remove(key);
        }
        for (key, value) in &self.vars {
            command.env(key, value);
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl RunOutput {
    #[must_use]
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// Execute a program and capture stdout/stderr.
///
/// # Errors
///
/// Returns an error when the program cannot be spawned or its output cannot be collected.
pub fn run_command(
    program: &Path,
    args: &[String],
    envs: &EnvOverrides,
    cwd: Option<&Path>,
) -> Result<RunOutput> {
    let mut command = Command::new(program);
    command.args(args);
    envs.apply(&mut command);
    if let Some(cwd) = cwd {
        command.current_dir(cwd);
    }
    command.stdin(Stdio::null());
    command.stdout(Stdio::piped());
    command.stderr(Stdio::piped());

    let output = command
        .output()
        .with_context(|| format!("failed to start {}", program.display()))?;
    let code = output.status.code().unwrap_or(-1);
    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    Ok(RunOutput {
        code,
        stdout,
        stderr,
    })
}
