/// Output Classifier
///
/// Tags every raw interpreter event with exactly one [`OutputKind`] so a
/// terminal transcript can keep what the program printed apart from what the
/// learner typed. Pure and total: events whose flags do not describe a known
/// shape fall back to [`OutputKind::SystemMessage`].
use serde::{Deserialize, Serialize};
use std::fmt;

/// One event as emitted by the interpreter, flags as reported
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawOutputEvent {
    pub text: String,
    #[serde(default)]
    pub is_stdout: bool,
    #[serde(default)]
    pub is_stderr: bool,
    #[serde(default)]
    pub is_prompt_signal: bool,
    #[serde(default)]
    pub is_input_echo: bool,
}

impl RawOutputEvent {
    pub fn stdout(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_stdout: true,
            ..Default::default()
        }
    }

    pub fn stderr(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_stderr: true,
            ..Default::default()
        }
    }

    pub fn prompt(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_prompt_signal: true,
            ..Default::default()
        }
    }

    pub fn echo(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_input_echo: true,
            ..Default::default()
        }
    }

    /// Status text produced by the session itself
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    ProgramOutput,
    InputEcho,
    InputPrompt,
    SystemMessage,
}

impl fmt::Display for OutputKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            OutputKind::ProgramOutput => "program-output",
            OutputKind::InputEcho => "input-echo",
            OutputKind::InputPrompt => "input-prompt",
            OutputKind::SystemMessage => "system",
        };
        write!(f, "{}", s)
    }
}

/// A classified piece of the session transcript
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputFragment {
    pub kind: OutputKind,
    pub text: String,
}

impl OutputFragment {
    pub fn new(kind: OutputKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
        }
    }

    pub fn is_prompt(&self) -> bool {
        self.kind == OutputKind::InputPrompt
    }

    /// Text to render; empty prompts still need something visible
    pub fn display_text(&self) -> &str {
        if self.kind == OutputKind::InputPrompt && self.text.is_empty() {
            "> "
        } else {
            &self.text
        }
    }
}

impl fmt::Display for OutputFragment {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{:?}", self.kind, self.text)
    }
}

/// Tag a raw event
///
/// Priority: a prompt signal always wins (even with empty text), then an
/// echo, then a single unambiguous stream. Stderr is runtime chatter, not
/// program output, so it is a system message like anything unrecognized.
pub fn classify(event: &RawOutputEvent) -> OutputKind {
    if event.is_prompt_signal {
        return OutputKind::InputPrompt;
    }

    match (event.is_input_echo, event.is_stdout, event.is_stderr) {
        (true, false, false) => OutputKind::InputEcho,
        (false, true, false) => OutputKind::ProgramOutput,
        _ => OutputKind::SystemMessage,
    }
}

pub fn to_fragment(event: RawOutputEvent) -> OutputFragment {
    let kind = classify(&event);
    OutputFragment {
        kind,
        text: event.text,
    }
}

/// Classify a stream of events, preserving order
pub fn classify_stream<I>(events: I) -> impl Iterator<Item = OutputFragment>
where
    I: IntoIterator<Item = RawOutputEvent>,
{
    events.into_iter().map(to_fragment)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_streams() {
        assert_eq!(classify(&RawOutputEvent::stdout("hi")), OutputKind::ProgramOutput);
        assert_eq!(classify(&RawOutputEvent::echo("typed")), OutputKind::InputEcho);
        assert_eq!(classify(&RawOutputEvent::stderr("warn")), OutputKind::SystemMessage);
        assert_eq!(classify(&RawOutputEvent::system("Program completed.")), OutputKind::SystemMessage);
    }

    #[test]
    fn test_empty_prompt_is_kept() {
        let fragment = to_fragment(RawOutputEvent::prompt(""));
        assert_eq!(fragment.kind, OutputKind::InputPrompt);
        assert_eq!(fragment.text, "");
        assert_eq!(fragment.display_text(), "> ");
    }

    #[test]
    fn test_prompt_signal_wins_over_stream_flags() {
        let event = RawOutputEvent {
            text: "Name? ".to_string(),
            is_stdout: true,
            is_prompt_signal: true,
            ..Default::default()
        };
        assert_eq!(classify(&event), OutputKind::InputPrompt);
    }

    #[test]
    fn test_contradictory_flags_fall_back_to_system() {
        let both = RawOutputEvent {
            text: "?".to_string(),
            is_stdout: true,
            is_stderr: true,
            ..Default::default()
        };
        assert_eq!(classify(&both), OutputKind::SystemMessage);

        let echo_on_stdout = RawOutputEvent {
            text: "?".to_string(),
            is_stdout: true,
            is_input_echo: true,
            ..Default::default()
        };
        assert_eq!(classify(&echo_on_stdout), OutputKind::SystemMessage);
    }

    #[test]
    fn test_stream_order_preserved() {
        let fragments: Vec<_> = classify_stream(vec![
            RawOutputEvent::prompt(""),
            RawOutputEvent::echo("hello"),
            RawOutputEvent::stdout("hello"),
        ])
        .collect();
        let kinds: Vec<_> = fragments.iter().map(|f| f.kind).collect();
        assert_eq!(
            kinds,
            vec![OutputKind::InputPrompt, OutputKind::InputEcho, OutputKind::ProgramOutput]
        );
    }

    #[test]
    fn test_deserialize_missing_flags() {
        let event: RawOutputEvent = serde_json::from_str(r#"{"text":"x"}"#).unwrap();
        assert_eq!(classify(&event), OutputKind::SystemMessage);
    }
}
