//! Validation for daemon settings and command configuration.

use serde::{Deserialize, Serialize};

use crate::config::{CommandConfig, TendConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationLevel {
    Error,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub level: ValidationLevel,
    pub code: &'static str,
    pub message: String,
}

pub trait Validate {
    fn validate(&self) -> Vec<ValidationIssue>;
}

pub fn has_errors(issues: &[ValidationIssue]) -> bool {
    issues
        .iter()
        .any(|issue| issue.level == ValidationLevel::Error)
}

impl Validate for TendConfig {
    fn validate(&self) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();

        let url = self.source.repo_url.trim();
        if url.is_empty() {
            issues.push(ValidationIssue {
                level: ValidationLevel::Error,
                code: "source.repo_url.empty",
                message: "repo_url must be set so the program can be cloned".to_string(),
            });
        } else if !(url.starts_with("https://")
            || url.starts_with("http://")
            || url.starts_with("file://")
            || url.starts_with('/'))
        {
            issues.push(ValidationIssue {
                level: ValidationLevel::Warning,
                code: "source.repo_url.scheme",
                message: format!(
                    "repo_url {url:?} is not http(s), file:// or an absolute path; token injection will not apply"
                ),
            });
        }

        if self.supervisor.grace_period_secs == 0 {
            issues.push(ValidationIssue {
                level: ValidationLevel::Warning,
                code: "supervisor.grace_period.zero",
                message: "grace period is 0; every stop will escalate to SIGKILL immediately"
                    .to_string(),
            });
        }

        if self.supervisor.log_max_lines == 0 {
            issues.push(ValidationIssue {
                level: ValidationLevel::Error,
                code: "supervisor.log_max_lines.zero",
                message: "log_max_lines must be greater than zero".to_string(),
            });
        }

        if self.paths.runtime_dir.as_os_str().is_empty() {
            issues.push(ValidationIssue {
                level: ValidationLevel::Error,
                code: "paths.runtime_dir.empty",
                message: "runtime_dir must not be empty".to_string(),
            });
        }

        issues
    }
}

impl Validate for CommandConfig {
    fn validate(&self) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();

        if self.run_command.trim().is_empty() {
            issues.push(ValidationIssue {
                level: ValidationLevel::Error,
                code: "commands.start.empty",
                message: "start command must not be empty".to_string(),
            });
        }

        for (name, cmd) in &self.scripts {
            if cmd.trim().is_empty() {
                issues.push(ValidationIssue {
                    level: ValidationLevel::Warning,
                    code: "commands.script.empty",
                    message: format!("script {name:?} has an empty command and cannot be run"),
                });
            }
        }

        issues
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_tend_config;

    #[test]
    fn default_config_requires_a_repo_url() {
        let issues = TendConfig::default().validate();
        assert!(has_errors(&issues));
        assert!(issues
            .iter()
            .any(|issue| issue.code == "source.repo_url.empty"));
    }

    #[test]
    fn complete_config_has_no_issues() {
        let config = parse_tend_config(
            "[source]\nrepo_url = \"https://github.com/acme/widget.git\"\n",
        )
        .expect("parse");
        assert!(config.validate().is_empty());
    }

    #[test]
    fn zero_values_are_flagged() {
        let mut config = parse_tend_config("[source]\nrepo_url = \"git@github.com:acme/w.git\"\n")
            .expect("parse");
        config.supervisor.grace_period_secs = 0;
        config.supervisor.log_max_lines = 0;

        let issues = config.validate();
        let codes: Vec<_> = issues.iter().map(|issue| issue.code).collect();
        assert!(codes.contains(&"source.repo_url.scheme"));
        assert!(codes.contains(&"supervisor.grace_period.zero"));
        assert!(codes.contains(&"supervisor.log_max_lines.zero"));
        assert!(has_errors(&issues));
    }

    #[test]
    fn command_config_flags_empty_commands() {
        let mut config = CommandConfig {
            run_command: " ".to_string(),
            ..CommandConfig::default()
        };
        config.scripts.insert("noop".to_string(), String::new());

        let issues = config.validate();
        assert_eq!(issues.len(), 2);
        assert_eq!(issues[0].level, ValidationLevel::Error);
        assert_eq!(issues[1].code, "commands.script.empty");
    }
}
