/// Scaffold Line Mapper
///
/// Lesson authors may wrap learner code with setup (header) and grading
/// (footer) code the learner never sees. The interpreter reports errors in
/// combined-source coordinates; this module maps them back.
///
/// Deterministic: the same header/body/footer always yield the same combined
/// source and offset, which replays of an interactive session rely on.
use serde::{Deserialize, Serialize};

/// Line bookkeeping for one wrapped program. Recomputed on every run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScaffoldMapping {
    /// Lines injected before the learner's code
    pub body_line_offset: usize,
    /// Lines of learner code
    pub body_lines: usize,
}

impl ScaffoldMapping {
    pub fn remap(&self, reported_line: usize) -> usize {
        remap_error_line(reported_line, self.body_line_offset)
    }
}

/// Number of lines a fragment occupies once joined with a trailing newline
fn line_count(text: &str) -> usize {
    let trimmed = text.strip_suffix('\n').unwrap_or(text);
    if trimmed.is_empty() {
        0
    } else {
        trimmed.split('\n').count()
    }
}

/// Join header, body and footer into the source actually executed
///
/// Empty parts are skipped entirely, so an absent header yields offset 0.
/// Each non-empty part starts on a fresh line.
pub fn wrap(header: &str, body: &str, footer: &str) -> (String, ScaffoldMapping) {
    let mut combined = String::with_capacity(header.len() + body.len() + footer.len() + 2);
    let mut offset = 0;

    if !header.is_empty() {
        let header = header.strip_suffix('\n').unwrap_or(header);
        combined.push_str(header);
        combined.push('\n');
        offset = header.split('\n').count();
    }

    combined.push_str(body);

    if !footer.is_empty() {
        if !body.is_empty() && !body.ends_with('\n') {
            combined.push('\n');
        }
        combined.push_str(footer);
    }

    let mapping = ScaffoldMapping {
        body_line_offset: offset,
        body_lines: line_count(body),
    };
    (combined, mapping)
}

/// Translate a line in the combined source to the learner's coordinates,
/// never returning less than 1
pub fn remap_error_line(reported_line: usize, body_line_offset: usize) -> usize {
    reported_line.saturating_sub(body_line_offset).max(1)
}
