//! Diagnostic report model
//!
//! A tree of sections with pass/warn/fail/skip status and remediation
//! hints. Serializes to a stable JSON schema and renders as a plain-text
//! tree.

use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Section outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SectionStatus {
    Pass,
    Skip,
    Warn,
    Fail,
}

impl SectionStatus {
    pub fn symbol(&self) -> &'static str {
        match self {
            Self::Pass => "ok",
            Self::Warn => "warn",
            Self::Fail => "FAIL",
            Self::Skip => "skip",
        }
    }
}

/// A remediation hint attached to a section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecommendedAction {
    /// Human-readable instruction.
    pub action: String,
    /// Optional command the user can run verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

impl RecommendedAction {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            command: None,
        }
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }
}

/// One node of the report tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticSection {
    pub section: String,
    pub status: SectionStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub details: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recommended_actions: Vec<RecommendedAction>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<DiagnosticSection>,
}

impl DiagnosticSection {
    pub fn new(section: impl Into<String>, status: SectionStatus) -> Self {
        Self {
            section: section.into(),
            status,
            details: Vec::new(),
            recommended_actions: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.details.push(detail.into());
        self
    }

    pub fn action(mut self, action: RecommendedAction) -> Self {
        self.recommended_actions.push(action);
        self
    }

    pub fn child(mut self, child: DiagnosticSection) -> Self {
        self.children.push(child);
        self
    }

    /// Worst status in this subtree. `skip` never worsens an otherwise
    /// passing section.
    pub fn effective_status(&self) -> SectionStatus {
        self.children
            .iter()
            .map(DiagnosticSection::effective_status)
            .chain(std::iter::once(self.status))
            .max()
            .unwrap_or(SectionStatus::Pass)
    }
}

/// The assembled report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticReport {
    pub generated_at: DateTime<Utc>,
    pub sections: Vec<DiagnosticSection>,
}

impl DiagnosticReport {
    pub fn new(sections: Vec<DiagnosticSection>) -> Self {
        Self {
            generated_at: Utc::now(),
            sections,
        }
    }

    /// Worst status across the whole report.
    pub fn overall_status(&self) -> SectionStatus {
        self.sections
            .iter()
            .map(DiagnosticSection::effective_status)
            .max()
            .unwrap_or(SectionStatus::Pass)
    }

    /// All remediation hints in document order.
    pub fn all_actions(&self) -> Vec<&RecommendedAction> {
        fn collect<'a>(section: &'a DiagnosticSection, out: &mut Vec<&'a RecommendedAction>) {
            out.extend(section.recommended_actions.iter());
            for child in &section.children {
                collect(child, out);
            }
        }
        let mut out = Vec::new();
        for section in &self.sections {
            collect(section, &mut out);
        }
        out
    }

    /// Render the report as an indented plain-text tree.
    pub fn render_text(&self) -> String {
        fn render(section: &DiagnosticSection, depth: usize, out: &mut String) {
            let indent = "  ".repeat(depth);
            let _ = writeln!(
                out,
                "{}[{}] {}",
                indent,
                section.status.symbol(),
                section.section
            );
            for detail in &section.details {
                let _ = writeln!(out, "{}    {}", indent, detail);
            }
            for action in &section.recommended_actions {
                match &action.command {
                    Some(cmd) => {
                        let _ = writeln!(out, "{}    -> {} ({})", indent, action.action, cmd);
                    }
                    None => {
                        let _ = writeln!(out, "{}    -> {}", indent, action.action);
                    }
                }
            }
            for child in &section.children {
                render(child, depth + 1, out);
            }
        }

        let mut out = String::new();
        for section in &self.sections {
            render(section, 0, &mut out);
        }
        out
    }
}
