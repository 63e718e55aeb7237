//! Remote code execution boundary.
//!
//! The editor can hand the shared buffer to a Piston-compatible execution
//! service (`POST /api/v2/execute`). Only the request/response shapes and the
//! runtime table live here; sending the request is up to the embedding
//! application.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExecError {
    #[error("unsupported language: {0}")]
    UnsupportedLanguage(String),
    #[error("malformed response: {0}")]
    Json(#[from] serde_json::Error),
}

/// A language runtime offered by the execution service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Runtime {
    pub language: &'static str,
    pub version: &'static str,
    pub aliases: &'static [&'static str],
    /// Set when the service runs the language on a separate runtime (e.g. node).
    pub runtime: Option<&'static str>,
}

/// Runtimes the editor's language picker offers.
pub const RUNTIMES: &[Runtime] = &[
    Runtime {
        language: "java",
        version: "15.0.2",
        aliases: &[],
        runtime: None,
    },
    Runtime {
        language: "python",
        version: "3.10.0",
        aliases: &["py", "py3", "python3", "python3.10"],
        runtime: None,
    },
    Runtime {
        language: "javascript",
        version: "18.15.0",
        aliases: &["node-javascript", "node-js", "javascript", "js"],
        runtime: Some("node"),
    },
    Runtime {
        language: "sqlite3",
        version: "3.36.0",
        aliases: &["sqlite", "sql"],
        runtime: None,
    },
];

impl Runtime {
    /// Look up by language name or alias (case-insensitive).
    pub fn find(name: &str) -> Option<&'static Runtime> {
        let name = name.to_ascii_lowercase();
        RUNTIMES
            .iter()
            .find(|r| r.language == name || r.aliases.iter().any(|a| *a == name))
    }
}

/// A source file sent for execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub content: String,
}

/// Command-line arguments the editor passes to every run.
pub const DEFAULT_ARGS: &[&str] = &["1", "2", "3"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub language: String,
    pub version: String,
    pub files: Vec<ExecFile>,
    pub stdin: String,
    pub args: Vec<String>,
    /// Milliseconds.
    pub compile_timeout: u64,
    /// Milliseconds.
    pub run_timeout: u64,
    /// Bytes, `-1` for no limit.
    pub compile_memory_limit: i64,
    /// Bytes, `-1` for no limit.
    pub run_memory_limit: i64,
}

impl ExecuteRequest {
    /// Request running `source` with the service defaults the editor uses.
    pub fn new(language: &str, source: impl Into<String>) -> Result<Self, ExecError> {
        let runtime =
            Runtime::find(language).ok_or_else(|| ExecError::UnsupportedLanguage(language.to_string()))?;
        Ok(Self {
            language: runtime.language.to_string(),
            version: runtime.version.to_string(),
            files: vec![ExecFile {
                name: None,
                content: source.into(),
            }],
            stdin: String::new(),
            args: DEFAULT_ARGS.iter().map(|a| a.to_string()).collect(),
            compile_timeout: 10_000,
            run_timeout: 3_000,
            compile_memory_limit: -1,
            run_memory_limit: -1,
        })
    }

    pub fn with_stdin(mut self, stdin: impl Into<String>) -> Self {
        self.stdin = stdin.into();
        self
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn to_json(&self) -> Result<String, ExecError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Output of one stage (compile or run).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageOutput {
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    /// Interleaved stdout + stderr.
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub code: Option<i32>,
    #[serde(default)]
    pub signal: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteResponse {
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub version: String,
    pub run: StageOutput,
    #[serde(default)]
    pub compile: Option<StageOutput>,
}

impl ExecuteResponse {
    pub fn from_json(body: &str) -> Result<Self, ExecError> {
        Ok(serde_json::from_str(body)?)
    }

    /// The run wrote nothing to stderr.
    pub fn succeeded(&self) -> bool {
        self.run.stderr.is_empty()
    }

    /// Text to show in the output pane (or the error toast): the
    /// interleaved run output either way.
    pub fn display_output(&self) -> &str {
        &self.run.output
    }

    /// [`display_output`](Self::display_output) split into pane lines.
    pub fn output_lines(&self) -> impl Iterator<Item = &str> {
        self.run.output.split('\n')
    }
}
