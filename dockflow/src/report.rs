//! HTML result report.
//!
//! The report links every artifact of a [`ResultManifest`] by its path
//! relative to the job's output directory, so the whole directory can be
//! moved or served as-is.

use crate::core::{ArtifactKind, ResultManifest};
use crate::errors::DockflowError;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tracing::info;

/// A labelled input shown in the report's input section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportInput {
    /// Label, e.g. `Receptor`.
    pub label: String,
    /// Value, e.g. the input file name.
    pub value: String,
}

impl ReportInput {
    /// Creates a new input entry.
    #[must_use]
    pub fn new(label: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            value: value.into(),
        }
    }
}

/// Where and with what inputs a job's report is rendered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportSpec {
    /// Destination of the HTML file.
    pub path: PathBuf,
    /// Entries for the input section.
    pub inputs: Vec<ReportInput>,
}

impl ReportSpec {
    /// Creates a report spec writing to `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            inputs: Vec::new(),
        }
    }

    /// Adds an input entry.
    #[must_use]
    pub fn with_input(mut self, label: impl Into<String>, value: impl Into<String>) -> Self {
        self.inputs.push(ReportInput::new(label, value));
        self
    }
}

/// Renders the report document.
///
/// # Errors
///
/// `ManifestIncomplete` if any artifact kind is missing.
pub fn render_html(manifest: &ResultManifest, inputs: &[ReportInput]) -> Result<String, DockflowError> {
    manifest.validate()?;

    let mut html = String::with_capacity(2048);
    html.push_str("<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n");
    html.push_str("    <meta charset=\"UTF-8\">\n    <title>REPORT</title>\n</head>\n<body>\n");
    let _ = writeln!(
        html,
        "    <h2 align=\"left\">JOB id: {}</h2>",
        escape(manifest.job_id.as_str())
    );

    html.push_str("    <h2 align=\"left\">Input file</h2>\n");
    if inputs.is_empty() {
        html.push_str("    <p align=\"left\">You can find your input files in the job directory.</p>\n");
    } else {
        html.push_str("    <ul>\n");
        for input in inputs {
            let _ = writeln!(
                html,
                "        <li>{}: {}</li>",
                escape(&input.label),
                escape(&input.value)
            );
        }
        html.push_str("    </ul>\n");
    }

    html.push_str("    <h2 align=\"left\">Result files</h2>\n");
    for kind in ArtifactKind::ALL {
        let href = manifest
            .relative(kind)
            .map(|path| href(&path))
            .unwrap_or_default();
        let _ = writeln!(html, "    <h3 align=\"left\">{}</h3>", kind.title());
        let _ = writeln!(
            html,
            "    <p align=\"left\">Click <a href=\"{}\">here</a> to download the {} file.</p>",
            escape(&href),
            kind.title()
        );
    }

    html.push_str("</body>\n</html>\n");
    Ok(html)
}

/// Renders and writes the report atomically.
///
/// The document is written next to `spec.path` under a temporary name and
/// renamed into place, so readers never see a partial report.
///
/// # Errors
///
/// `ManifestIncomplete` before anything is written, `Io` if writing fails.
pub async fn write_report(spec: &ReportSpec, manifest: &ResultManifest) -> Result<PathBuf, DockflowError> {
    let html = render_html(manifest, &spec.inputs)?;

    let file_name = spec
        .path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "report.html".to_string());
    let tmp = spec.path.with_file_name(format!(".{file_name}.tmp"));

    tokio::fs::write(&tmp, html.as_bytes()).await?;
    if let Err(e) = tokio::fs::rename(&tmp, &spec.path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }

    info!(job_id = %manifest.job_id, path = %spec.path.display(), "Report written");
    Ok(spec.path.clone())
}

/// Joins path components with `/` for use in a URL.
fn href(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Escapes text for HTML content and attribute values.
#[must_use]
pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            other => out.push(other),
        }
    }
    out
}
