use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::warn;

/// Pages at or below this size are assumed to be truncated.
pub const MIN_PAGE_BYTES: usize = 1000;

/// Strings that only appear in a page when rendering went wrong.
pub const ERROR_MARKERS: &[&str] = &[
    "内容处理失败",
    "content processing failed",
    "undefined",
    "[object Object]",
    "{{CONTENT}}",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PageVerification {
    pub path: PathBuf,
    pub problems: Vec<String>,
}

impl PageVerification {
    pub fn is_ok(&self) -> bool {
        self.problems.is_empty()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct VerificationReport {
    pub checked: usize,
    pub passed: usize,
    pub failures: Vec<PageVerification>,
}

impl VerificationReport {
    pub fn is_ok(&self) -> bool {
        self.failures.is_empty()
    }
}

pub fn verify_generated_page(path: &Path) -> PageVerification {
    let mut problems = Vec::new();
    match fs::read_to_string(path) {
        Ok(html) => check_html(&html, &mut problems),
        Err(error) => problems.push(format!("unreadable: {error}")),
    }
    PageVerification {
        path: path.to_path_buf(),
        problems,
    }
}

fn check_html(html: &str, problems: &mut Vec<String>) {
    if !html.contains("class=\"main-content\"") {
        problems.push("missing main-content container".to_string());
    }
    if !has_title(html) {
        problems.push("missing or empty <title>".to_string());
    }
    if !html.contains("<meta name=\"description\"") {
        problems.push("missing meta description".to_string());
    }
    if !html.contains("<footer") {
        problems.push("missing footer".to_string());
    }
    for marker in ERROR_MARKERS {
        if html.contains(marker) {
            problems.push(format!("contains error marker `{marker}`"));
        }
    }
    if html.len() <= MIN_PAGE_BYTES {
        problems.push(format!(
            "page is only {} bytes (expected more than {MIN_PAGE_BYTES})",
            html.len()
        ));
    }
}

fn has_title(html: &str) -> bool {
    let Some(start) = html.find("<title") else {
        return false;
    };
    let Some(open_end) = html[start..].find('>') else {
        return false;
    };
    let body_start = start + open_end + 1;
    let Some(close) = html[body_start..].find("</title>") else {
        return false;
    };
    !html[body_start..body_start + close].trim().is_empty()
}

pub fn verify_pages<P: AsRef<Path>>(paths: &[P]) -> VerificationReport {
    let mut report = VerificationReport::default();
    for path in paths {
        let verification = verify_generated_page(path.as_ref());
        report.checked += 1;
        if verification.is_ok() {
            report.passed += 1;
        } else {
            warn!(
                page = %verification.path.display(),
                problems = %verification.problems.join("; "),
                "page failed verification"
            );
            report.failures.push(verification);
        }
    }
    report
}
