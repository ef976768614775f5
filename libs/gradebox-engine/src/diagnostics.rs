// Traceback cleaning for learner-facing error messages
//
// Raw tracebacks expose bootstrap and scaffold frames the learner cannot act
// on. They are reduced to the final "Kind: message" line, with the line number
// translated into learner coordinates.

use crate::scaffold::ScaffoldMapping;
use lazy_static::lazy_static;
use regex::Regex;
use std::fmt;
use std::path::Path;

/// Filename the learner program is compiled under by the local interpreter
pub const PROGRAM_NAME: &str = "<learner>";

lazy_static! {
    static ref FRAME_RE: Regex = Regex::new(r#"^\s*File "([^"]*)", line (\d+)"#).unwrap();
    static ref ERROR_LINE_RE: Regex = Regex::new(
        r"^([A-Za-z_][\w.]*(?:Error|Exception|Interrupt|Exit|Warning|Iteration))(?::\s?(.*))?$"
    )
    .unwrap();
    static ref INLINE_LOCATION_RE: Regex = Regex::new(r"\s*\(([^,()]+), line (\d+)\)$").unwrap();
    static ref CARET_RE: Regex = Regex::new(r"^\s*[\^~]+\s*$").unwrap();
    static ref ANY_LINE_RE: Regex = Regex::new(r"\bline (\d+)\b").unwrap();
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanedError {
    /// Exception class, when the traceback names one
    pub kind: Option<String>,
    pub message: String,
    /// Learner-visible line
    pub line: Option<usize>,
}

impl fmt::Display for CleanedError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match (&self.kind, self.message.is_empty()) {
            (Some(kind), true) => write!(f, "{}", kind)?,
            (Some(kind), false) => write!(f, "{}: {}", kind, self.message)?,
            (None, _) => write!(f, "{}", self.message)?,
        }
        if let Some(line) = self.line {
            write!(f, " on line {}", line)?;
        }
        Ok(())
    }
}

/// Reduce raw stderr to one actionable line
///
/// `program_file` is the name the combined program ran under (`<learner>`,
/// `main.py`, `script.py`, ...). Frames from any other file are library or
/// bootstrap code and only used when the program itself has no frame.
pub fn clean_error(stderr: &str, mapping: &ScaffoldMapping, program_file: &str) -> CleanedError {
    let lines: Vec<&str> = stderr.lines().collect();

    let mut kind = None;
    let mut message = None;
    let mut inline_line = None;

    if let Some(caps) = lines.iter().rev().find_map(|l| ERROR_LINE_RE.captures(l.trim_end())) {
        kind = Some(caps[1].to_string());
        let mut text = caps.get(2).map(|m| m.as_str().to_string()).unwrap_or_default();
        if let Some(loc) = INLINE_LOCATION_RE.captures(&text) {
            if is_program_file(&loc[1], program_file) {
                inline_line = loc[2].parse::<usize>().ok();
            }
            let start = loc.get(0).map(|m| m.start()).unwrap_or(text.len());
            text.truncate(start);
        }
        message = Some(text);
    }

    if message.is_none() {
        message = lines
            .iter()
            .rev()
            .map(|l| l.trim())
            .find(|l| !l.is_empty() && !FRAME_RE.is_match(l) && !CARET_RE.is_match(l))
            .map(|l| l.to_string());
    }

    let message = match message {
        Some(m) => m,
        None => {
            return CleanedError {
                kind: None,
                message: "Unknown error".to_string(),
                line: None,
            }
        }
    };

    let reported = inline_line.or_else(|| reported_line(&lines, program_file));

    CleanedError {
        kind,
        message,
        line: reported.map(|l| mapping.remap(l)),
    }
}

/// Matches by full path or by basename, since sandboxes run from a work dir
fn is_program_file(path: &str, program_file: &str) -> bool {
    path == program_file || Path::new(path).file_name().and_then(|n| n.to_str()) == Some(program_file)
}

/// Line of the innermost frame in the program's own file, else of any frame
fn reported_line(lines: &[&str], program_file: &str) -> Option<usize> {
    let frames: Vec<(String, usize)> = lines
        .iter()
        .filter_map(|l| FRAME_RE.captures(l))
        .filter_map(|c| Some((c[1].to_string(), c[2].parse().ok()?)))
        .collect();

    if let Some((_, line)) = frames.iter().rev().find(|(file, _)| is_program_file(file, program_file)) {
        return Some(*line);
    }
    if let Some((_, line)) = frames.last() {
        return Some(*line);
    }

    lines
        .iter()
        .rev()
        .find_map(|l| ANY_LINE_RE.captures(l))
        .and_then(|c| c[1].parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scaffold::wrap;

    fn mapping(offset: usize) -> ScaffoldMapping {
        ScaffoldMapping {
            body_line_offset: offset,
            body_lines: 10,
        }
    }

    #[test]
    fn test_name_error_reduced_and_remapped() {
        let stderr = "Traceback (most recent call last):\n  File \"<string>\", line 21, in <module>\n  File \"<learner>\", line 3, in <module>\nNameError: name 'x' is not defined\n";
        let cleaned = clean_error(stderr, &mapping(2), PROGRAM_NAME);
        assert_eq!(cleaned.kind.as_deref(), Some("NameError"));
        assert_eq!(cleaned.message, "name 'x' is not defined");
        assert_eq!(cleaned.line, Some(1));
        assert_eq!(cleaned.to_string(), "NameError: name 'x' is not defined on line 1");
    }

    #[test]
    fn test_innermost_learner_frame_wins() {
        let stderr = "Traceback (most recent call last):\n  File \"<learner>\", line 8, in <module>\n  File \"<learner>\", line 5, in helper\n  File \"/usr/lib/python3/json/__init__.py\", line 346, in loads\nValueError: bad\n";
        let cleaned = clean_error(stderr, &mapping(0), PROGRAM_NAME);
        assert_eq!(cleaned.line, Some(5));
    }

    #[test]
    fn test_syntax_error_with_caret() {
        let stderr = "  File \"<learner>\", line 4\n    print(\"hi\"\n         ^\nSyntaxError: '(' was never closed\n";
        let (_, m) = wrap("a = 1\nb = 2\nc = 3", "print(\"hi\"", "");
        let cleaned = clean_error(stderr, &m, PROGRAM_NAME);
        assert_eq!(cleaned.kind.as_deref(), Some("SyntaxError"));
        assert_eq!(cleaned.line, Some(1));
    }

    #[test]
    fn test_inline_location_is_stripped() {
        let stderr = "SyntaxError: invalid syntax (<learner>, line 7)";
        let cleaned = clean_error(stderr, &mapping(2), PROGRAM_NAME);
        assert_eq!(cleaned.message, "invalid syntax");
        assert_eq!(cleaned.line, Some(5));
    }

    #[test]
    fn test_exception_without_message() {
        let stderr = "Traceback (most recent call last):\n  File \"<learner>\", line 1, in <module>\nKeyboardInterrupt\n";
        let cleaned = clean_error(stderr, &mapping(0), PROGRAM_NAME);
        assert_eq!(cleaned.to_string(), "KeyboardInterrupt on line 1");
    }

    #[test]
    fn test_fallback_to_last_meaningful_line() {
        let stderr = "  File \"<learner>\", line 2\nsomething odd happened\n   \n";
        let cleaned = clean_error(stderr, &mapping(0), PROGRAM_NAME);
        assert_eq!(cleaned.kind, None);
        assert_eq!(cleaned.message, "something odd happened");
        assert_eq!(cleaned.line, Some(2));
    }

    #[test]
    fn test_empty_stderr() {
        let cleaned = clean_error("", &mapping(0), PROGRAM_NAME);
        assert_eq!(cleaned.message, "Unknown error");
        assert_eq!(cleaned.line, None);
    }

    #[test]
    fn test_library_frame_does_not_hide_program_line() {
        let stderr = "Traceback (most recent call last):\n  File \"/tmp/main.py\", line 3, in <module>\n  File \"/usr/lib/python3.11/json/__init__.py\", line 346, in loads\n    return _default_decoder.decode(s)\n  File \"/usr/lib/python3.11/json/decoder.py\", line 355, in raw_decode\n    raise JSONDecodeError(\"Expecting value\", s, err.value) from None\njson.decoder.JSONDecodeError: Expecting value: line 1 column 1 (char 0)\n";
        let (_, m) = wrap("import json", "data = input()\nprint(json.loads(data))", "");
        let cleaned = clean_error(stderr, &m, "main.py");
        assert_eq!(cleaned.kind.as_deref(), Some("json.decoder.JSONDecodeError"));
        assert_eq!(cleaned.line, Some(2));
    }

    #[test]
    fn test_other_file_used_when_program_has_no_frame() {
        let stderr = "  File \"/usr/lib/python3.11/runpy.py\", line 12\nRuntimeError: boom\n";
        let cleaned = clean_error(stderr, &mapping(0), "script.py");
        assert_eq!(cleaned.line, Some(12));
    }

    #[test]
    fn test_inline_location_for_named_file() {
        let stderr = "SyntaxError: invalid syntax (script.py, line 4)";
        let cleaned = clean_error(stderr, &mapping(1), "script.py");
        assert_eq!(cleaned.message, "invalid syntax");
        assert_eq!(cleaned.line, Some(3));
    }

    #[test]
    fn test_error_in_header_clamps_to_first_line() {
        let stderr = "  File \"<learner>\", line 1, in <module>\nImportError: no module\n";
        let cleaned = clean_error(stderr, &mapping(3), PROGRAM_NAME);
        assert_eq!(cleaned.line, Some(1));
    }
}
