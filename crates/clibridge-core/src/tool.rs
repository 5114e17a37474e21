//! Supported CLI tools and their launch templates.
//!
//! The set of tools is closed: a request naming anything else is rejected
//! before a process is spawned. Each tool maps to an explicit template
//! describing the program, its arguments, and how a continuation token is
//! passed back to it.

use crate::session::ContinuationToken;
use crate::{DomainError, DomainResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

/// Environment variables removed from every child process.
///
/// The bridge's own secret must never reach a CLI tool.
pub const SCRUBBED_ENV_VARS: &[&str] = &["CLIBRIDGE_API_KEY"];

/// Line echo loop used by the `echo-cli` diagnostic tool.
///
/// Each input line is echoed, then acknowledged after a short pause so a
/// single input produces more than one output event.
const ECHO_SCRIPT: &str =
    "while IFS= read -r line; do printf '%s\\n' \"$line\"; sleep 0.05; printf 'ack %s\\n' \"$line\"; done";

// ============================================================================
// Tool Kind
// ============================================================================

/// A supported interactive CLI tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ToolKind {
    /// Anthropic Claude Code CLI
    Claude,
    /// OpenAI Codex CLI
    Codex,
    /// Google Gemini CLI
    Gemini,
    /// Built-in line echo loop for diagnostics
    EchoCli,
}

impl ToolKind {
    /// All supported tools, in display order.
    pub const ALL: [ToolKind; 4] = [Self::Claude, Self::Codex, Self::Gemini, Self::EchoCli];

    /// Returns the wire tag of this tool.
    #[must_use]
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Claude => "claude",
            Self::Codex => "codex",
            Self::Gemini => "gemini",
            Self::EchoCli => "echo-cli",
        }
    }

    /// Default executable name.
    #[must_use]
    pub fn default_program(&self) -> &'static str {
        match self {
            Self::Claude => "claude",
            Self::Codex => "codex",
            Self::Gemini => "gemini",
            Self::EchoCli => "sh",
        }
    }

    /// Builds the launch description for this tool.
    ///
    /// Claude is the only tool whose conversation id can be chosen up
    /// front: without a continuation token a fresh UUID is passed via
    /// `--session-id` and becomes the session's continuation token.
    #[must_use]
    pub fn launch(
        &self,
        overrides: &ToolOverrides,
        continuation: Option<&ContinuationToken>,
        cwd: Option<PathBuf>,
    ) -> ToolLaunch {
        let program = overrides
            .program_for(*self)
            .unwrap_or_else(|| self.default_program())
            .to_string();

        let mut continuation_out = continuation.cloned();
        let args: Vec<String> = match self {
            Self::Claude => {
                let mut args = strings(&[
                    "--print",
                    "--input-format",
                    "stream-json",
                    "--output-format",
                    "stream-json",
                    "--verbose",
                ]);
                match continuation {
                    Some(token) => {
                        args.push("--resume".to_string());
                        args.push(token.as_str().to_string());
                    }
                    None => {
                        let assigned = ContinuationToken::new(Uuid::new_v4().to_string());
                        args.push("--session-id".to_string());
                        args.push(assigned.as_str().to_string());
                        continuation_out = Some(assigned);
                    }
                }
                args
            }
            Self::Codex => {
                let mut args = strings(&["exec", "--json"]);
                if let Some(token) = continuation {
                    args.push("resume".to_string());
                    args.push(token.as_str().to_string());
                }
                args
            }
            Self::Gemini => {
                let mut args = strings(&["--output-format", "stream-json"]);
                if let Some(token) = continuation {
                    args.push("--resume".to_string());
                    args.push(token.as_str().to_string());
                }
                args
            }
            Self::EchoCli => strings(&["-c", ECHO_SCRIPT]),
        };

        ToolLaunch {
            spec: LaunchSpec {
                program,
                args,
                env: vec![
                    ("NO_COLOR".to_string(), "1".to_string()),
                    ("TERM".to_string(), "dumb".to_string()),
                ],
                env_remove: SCRUBBED_ENV_VARS.iter().map(|v| (*v).to_string()).collect(),
                cwd,
            },
            continuation: continuation_out,
        }
    }

    fn expected_tags() -> String {
        Self::ALL
            .iter()
            .map(ToolKind::tag)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl fmt::Display for ToolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for ToolKind {
    type Err = DomainError;

    fn from_str(s: &str) -> DomainResult<Self> {
        Self::ALL
            .into_iter()
            .find(|tool| tool.tag() == s)
            .ok_or_else(|| DomainError::UnknownTool {
                name: s.to_string(),
                expected: Self::expected_tags(),
            })
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| (*s).to_string()).collect()
}

// ============================================================================
// Launch Description
// ============================================================================

/// Per-tool executable overrides (e.g. an absolute path to `claude`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOverrides {
    pub claude: Option<String>,
    pub codex: Option<String>,
    pub gemini: Option<String>,
}

impl ToolOverrides {
    fn program_for(&self, tool: ToolKind) -> Option<&str> {
        match tool {
            ToolKind::Claude => self.claude.as_deref(),
            ToolKind::Codex => self.codex.as_deref(),
            ToolKind::Gemini => self.gemini.as_deref(),
            ToolKind::EchoCli => None,
        }
    }
}

/// Everything needed to spawn a process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Variables set in the child's environment
    pub env: Vec<(String, String)>,
    /// Variables removed from the inherited environment
    pub env_remove: Vec<String>,
    pub cwd: Option<PathBuf>,
}

impl LaunchSpec {
    /// Creates a spec with no environment changes and no working directory.
    pub fn new(program: impl Into<String>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            env: Vec::new(),
            env_remove: Vec::new(),
            cwd: None,
        }
    }

    /// Renders the command line for logging.
    #[must_use]
    pub fn display_command(&self) -> String {
        let mut parts = vec![self.program.clone()];
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }
}

/// A launch spec plus the continuation token the session will report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolLaunch {
    pub spec: LaunchSpec,
    pub continuation: Option<ContinuationToken>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_str_accepts_known_tags() {
        for tool in ToolKind::ALL {
            assert_eq!(tool.tag().parse::<ToolKind>().unwrap(), tool);
        }
    }

    #[test]
    fn test_from_str_rejects_unknown() {
        let err = "bash".parse::<ToolKind>().unwrap_err();
        assert!(matches!(err, DomainError::UnknownTool { .. }));
        assert!(err.to_string().contains("echo-cli"));
    }

    #[test]
    fn test_serde_uses_tags() {
        let json = serde_json::to_string(&ToolKind::EchoCli).unwrap();
        assert_eq!(json, "\"echo-cli\"");
        let parsed: ToolKind = serde_json::from_str("\"gemini\"").unwrap();
        assert_eq!(parsed, ToolKind::Gemini);
    }

    #[test]
    fn test_claude_without_token_assigns_session_id() {
        let launch = ToolKind::Claude.launch(&ToolOverrides::default(), None, None);
        let token = launch.continuation.expect("claude assigns a token");

        let args = &launch.spec.args;
        let pos = args.iter().position(|a| a == "--session-id").unwrap();
        assert_eq!(args[pos + 1], token.as_str());
        assert!(!args.contains(&"--resume".to_string()));
    }

    #[test]
    fn test_claude_with_token_resumes() {
        let token = ContinuationToken::new("abc-123");
        let launch = ToolKind::Claude.launch(&ToolOverrides::default(), Some(&token), None);
        assert_eq!(launch.continuation, Some(token));
        assert!(launch.spec.args.ends_with(&["--resume".to_string(), "abc-123".to_string()]));
    }

    #[test]
    fn test_codex_resume_subcommand() {
        let token = ContinuationToken::new("thread-9");
        let launch = ToolKind::Codex.launch(&ToolOverrides::default(), Some(&token), None);
        assert_eq!(launch.spec.args, vec!["exec", "--json", "resume", "thread-9"]);

        let fresh = ToolKind::Codex.launch(&ToolOverrides::default(), None, None);
        assert_eq!(fresh.continuation, None);
    }

    #[test]
    fn test_overrides_replace_program() {
        let overrides = ToolOverrides {
            gemini: Some("/opt/bin/gemini".to_string()),
            ..Default::default()
        };
        let launch = ToolKind::Gemini.launch(&overrides, None, None);
        assert_eq!(launch.spec.program, "/opt/bin/gemini");

        let claude = ToolKind::Claude.launch(&overrides, None, None);
        assert_eq!(claude.spec.program, "claude");
    }

    #[test]
    fn test_every_template_scrubs_secret_and_disables_color() {
        for tool in ToolKind::ALL {
            let launch = tool.launch(&ToolOverrides::default(), None, None);
            assert!(launch.spec.env_remove.contains(&"CLIBRIDGE_API_KEY".to_string()));
            assert!(launch
                .spec
                .env
                .contains(&("NO_COLOR".to_string(), "1".to_string())));
        }
    }

    #[test]
    fn test_echo_cli_runs_through_shell() {
        let launch = ToolKind::EchoCli.launch(&ToolOverrides::default(), None, None);
        assert_eq!(launch.spec.program, "sh");
        assert_eq!(launch.spec.args.first().map(String::as_str), Some("-c"));
        assert!(launch.spec.display_command().starts_with("sh -c while"));
    }
}
