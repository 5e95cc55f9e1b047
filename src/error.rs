//! Unified issue type surfaced by all code-generation phases.
//!
//! Codegen never returns a partial module: every fatal problem is collected
//! into an `IssueList` and the whole generation attempt is abandoned.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Error => write!(f, "error"),
            Severity::Warning => write!(f, "warning"),
        }
    }
}

/// One problem found while compiling a composition.
#[derive(Debug, Clone)]
pub struct Issue {
    pub severity: Severity,
    /// The phase the issue was detected in, e.g. `"compiling composition"`.
    pub phase: String,
    /// Short human-readable summary, e.g. `"Unsupported composition layout"`.
    pub summary: String,
    /// Full detail: which node/port/function, what was expected.
    pub details: String,
    /// Graph identifier of the node involved, if any.
    pub node: Option<String>,
}

impl Issue {
    pub fn error(summary: impl Into<String>, details: impl Into<String>) -> Self {
        Issue {
            severity: Severity::Error,
            phase: "compiling composition".into(),
            summary: summary.into(),
            details: details.into(),
            node: None,
        }
    }

    pub fn for_node(mut self, node: impl Into<String>) -> Self {
        self.node = Some(node.into());
        self
    }
}

impl fmt::Display for Issue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.node {
            Some(node) => write!(
                f,
                "{} ({}): {} — {} (node '{}')",
                self.severity, self.phase, self.summary, self.details, node
            ),
            None => write!(
                f,
                "{} ({}): {} — {}",
                self.severity, self.phase, self.summary, self.details
            ),
        }
    }
}

impl std::error::Error for Issue {}

/// All fatal issues from one code-generation attempt.
#[derive(Debug, Clone, Default)]
pub struct IssueList {
    pub issues: Vec<Issue>,
}

impl IssueList {
    pub fn new() -> Self {
        IssueList { issues: Vec::new() }
    }

    pub fn push(&mut self, issue: Issue) {
        self.issues.push(issue);
    }

    pub fn is_empty(&self) -> bool {
        self.issues.is_empty()
    }

    pub fn len(&self) -> usize {
        self.issues.len()
    }
}

impl From<Issue> for IssueList {
    fn from(issue: Issue) -> Self {
        IssueList { issues: vec![issue] }
    }
}

impl fmt::Display for IssueList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, issue) in self.issues.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{}", issue)?;
        }
        Ok(())
    }
}

impl std::error::Error for IssueList {}
