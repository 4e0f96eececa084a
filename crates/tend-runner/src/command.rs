use std::path::Path;
use std::process::Command;

use crate::error::SpawnError;

/// How a configured command line is turned into an OS process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invocation {
    /// `<shell> -c <script>`
    Shell { shell: String, script: String },
    /// Words split with POSIX shell quoting rules; the first is the program.
    Direct { program: String, args: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedCommand {
    /// The command as configured.
    pub original: String,
    /// The command line after rewrites (unbuffered python).
    pub effective: String,
    pub invocation: Invocation,
}

impl PreparedCommand {
    /// Binary the OS is asked to execute.
    pub fn program(&self) -> &str {
        match &self.invocation {
            Invocation::Shell { shell, .. } => shell,
            Invocation::Direct { program, .. } => program,
        }
    }

    pub fn to_command(&self) -> Command {
        match &self.invocation {
            Invocation::Shell { shell, script } => {
                let mut cmd = Command::new(shell);
                cmd.arg("-c").arg(script);
                cmd
            }
            Invocation::Direct { program, args } => {
                let mut cmd = Command::new(program);
                cmd.args(args);
                cmd
            }
        }
    }
}

pub fn prepare_command(command: &str, shell: Option<&str>) -> Result<PreparedCommand, SpawnError> {
    let original = command.trim();
    if original.is_empty() {
        return Err(SpawnError::EmptyCommand);
    }
    let effective = unbuffered_python(original);

    let invocation = match shell {
        Some(shell) => Invocation::Shell {
            shell: shell.to_string(),
            script: effective.clone(),
        },
        None => {
            let mut words = shlex::split(&effective)
                .ok_or_else(|| SpawnError::Unparseable {
                    command: original.to_string(),
                })?
                .into_iter();
            let program = words.next().ok_or(SpawnError::EmptyCommand)?;
            Invocation::Direct {
                program,
                args: words.collect(),
            }
        }
    };

    Ok(PreparedCommand {
        original: original.to_string(),
        effective,
        invocation,
    })
}

/// Insert `-u` after a leading python interpreter so its output is not
/// block-buffered behind a pipe.
///
/// Only an unquoted leading word is rewritten; anything `shlex` cannot split
/// is returned as is.
pub fn unbuffered_python(command: &str) -> String {
    let trimmed = command.trim_start();
    let Some(words) = shlex::split(trimmed) else {
        return trimmed.to_string();
    };
    let Some((program, args)) = words.split_first() else {
        return trimmed.to_string();
    };
    let (first, rest) = match trimmed.find(char::is_whitespace) {
        Some(idx) => trimmed.split_at(idx),
        None => (trimmed, ""),
    };

    let is_python = first == program
        && Path::new(program)
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with("python"));
    let already_unbuffered = args.iter().any(|word| word == "-u");

    if is_python && !already_unbuffered {
        format!("{first} -u{rest}")
    } else {
        trimmed.to_string()
    }
}
