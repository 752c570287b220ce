//! Typed tool operations.
//!
//! A `ToolUsage` coming from the oracle is a free-form name plus string params.
//! It is converted to a `ToolOperation` before dispatch so every operation the
//! dispatcher handles is matched exhaustively.

use crate::types::ToolUsage;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ToolUsageError {
    #[error("invalid tool usage: missing tool name")]
    MissingName,
    #[error("unrecognized tool: {0}")]
    Unknown(String),
    #[error("{tool} requires a '{param}' parameter")]
    MissingParam { tool: &'static str, param: &'static str },
    #[error("{tool} has an unparsable '{param}' parameter: {reason}")]
    InvalidParam {
        tool: &'static str,
        param: &'static str,
        reason: String,
    },
}

/// Package manager invocations the oracle may request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackageCommand {
    /// `<pm> <args...>`
    Run { args: Vec<String> },
    Install,
    Build,
    Test,
    Add { package: String },
    /// Delete the dependency directory.
    RemoveModules,
}

impl PackageCommand {
    /// Render as a shell command line.
    ///
    /// `package_manager` comes from configuration and is used verbatim; every
    /// other word is quoted so oracle-supplied values stay single arguments.
    pub fn command_line(&self, package_manager: &str, dependency_dir: &str) -> String {
        let (program, args): (&str, Vec<&str>) = match self {
            Self::Run { args } => (package_manager, args.iter().map(String::as_str).collect()),
            Self::Install => (package_manager, vec!["install"]),
            Self::Build => (package_manager, vec!["build"]),
            Self::Test => (package_manager, vec!["test"]),
            Self::Add { package } => (package_manager, vec!["add", package.as_str()]),
            Self::RemoveModules => ("rm", vec!["-rf", "--", dependency_dir]),
        };
        if args.is_empty() {
            return program.to_string();
        }
        format!("{program} {}", shell_words::join(args))
    }
}

/// A validated operation with its required parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolOperation {
    MoveFile { source: String, destination: String },
    DeleteFile { file_name: String },
    UpdateFile { file_name: String, content: String },
    RequestFiles { file_pattern: String },
    Package(PackageCommand),
}

impl ToolOperation {
    /// Validate a usage. Names match case-insensitively.
    pub fn from_usage(usage: &ToolUsage) -> Result<Self, ToolUsageError> {
        let name = usage.name.trim();
        if name.is_empty() {
            return Err(ToolUsageError::MissingName);
        }

        let param = |tool: &'static str, key: &'static str| -> Result<String, ToolUsageError> {
            usage
                .params
                .get(key)
                .filter(|v| !v.trim().is_empty())
                .cloned()
                .ok_or(ToolUsageError::MissingParam { tool, param: key })
        };

        let op = match name.to_lowercase().as_str() {
            "movefile" => Self::MoveFile {
                source: param("moveFile", "source")?,
                destination: param("moveFile", "destination")?,
            },
            "deletefile" => Self::DeleteFile {
                file_name: param("deleteFile", "fileName")?,
            },
            "updatefile" => Self::UpdateFile {
                file_name: param("updateFile", "fileName")?,
                // Empty content is a legitimate update.
                content: usage.params.get("content").cloned().unwrap_or_default(),
            },
            "requestfiles" => Self::RequestFiles {
                file_pattern: param("requestFiles", "filePattern")?,
            },
            "yarn" => {
                let command = usage.params.get("command").map_or("", String::as_str);
                let args = shell_words::split(command).map_err(|err| {
                    ToolUsageError::InvalidParam {
                        tool: "yarn",
                        param: "command",
                        reason: err.to_string(),
                    }
                })?;
                Self::Package(PackageCommand::Run { args })
            }
            "yarninstall" => Self::Package(PackageCommand::Install),
            "yarnbuild" => Self::Package(PackageCommand::Build),
            "yarntest" => Self::Package(PackageCommand::Test),
            "yarnadd" => Self::Package(PackageCommand::Add {
                package: param("yarnAdd", "package")?,
            }),
            "removemodules" => Self::Package(PackageCommand::RemoveModules),
            _ => return Err(ToolUsageError::Unknown(name.to_string())),
        };
        Ok(op)
    }
}
