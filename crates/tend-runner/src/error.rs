use std::path::PathBuf;

/// Failure to launch a command. Never retried automatically.
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("command is empty")]
    EmptyCommand,
    #[error("cannot split command into words (unbalanced quotes?): {command}")]
    Unparseable { command: String },
    #[error("binary not found ({program}) while starting {command}")]
    BinaryNotFound { program: String, command: String },
    #[error("permission denied executing {program} while starting {command}: {source}")]
    PermissionDenied {
        program: String,
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("working directory does not exist: {path}")]
    WorkingDirectoryMissing { path: PathBuf },
    #[error("command failed to start ({command}): {source}")]
    Io {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

impl SpawnError {
    pub(crate) fn classify(program: &str, command: &str, source: std::io::Error) -> Self {
        match source.kind() {
            std::io::ErrorKind::NotFound => SpawnError::BinaryNotFound {
                program: program.to_string(),
                command: command.to_string(),
            },
            std::io::ErrorKind::PermissionDenied => SpawnError::PermissionDenied {
                program: program.to_string(),
                command: command.to_string(),
                source,
            },
            _ => SpawnError::Io {
                command: command.to_string(),
                source,
            },
        }
    }
}
