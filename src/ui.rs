use anstyle::{AnsiColor, Style};
use is_terminal::IsTerminal;
use std::fmt::Display;
use std::io::{self, Write};
use std::time::{Duration, Instant};

/// Width of the right-aligned label column.
const LABEL_WIDTH: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tone {
    Working,
    Done,
    Note,
    Warning,
    Failure,
}

impl Tone {
    fn style(self) -> Style {
        let color = match self {
            Tone::Working => AnsiColor::Cyan,
            Tone::Done => AnsiColor::Green,
            Tone::Note => AnsiColor::Blue,
            Tone::Warning => AnsiColor::Yellow,
            Tone::Failure => AnsiColor::Red,
        };
        Style::new().bold().fg_color(Some(color.into()))
    }
}

// Status lines always go to stderr: stdout carries activation scripts and reports.
fn use_color() -> bool {
    io::stderr().is_terminal() && std::env::var_os("NO_COLOR").is_none()
}

/// Render a status line; continuation lines are indented under the message.
fn render(tone: Tone, label: &str, message: &str, color: bool) -> String {
    let (open, close) = if color {
        let style = tone.style();
        (style.render().to_string(), style.render_reset().to_string())
    } else {
        (String::new(), String::new())
    };

    let mut rendered = String::new();
    for (index, line) in message.split('\n').enumerate() {
        if index == 0 {
            rendered.push_str(&format!("{open}{label:>width$}{close} {line}\n", width = LABEL_WIDTH));
        } else {
            rendered.push_str(&format!("{:>width$} {line}\n", "", width = LABEL_WIDTH));
        }
    }
    rendered
}

fn emit(tone: Tone, label: &str, message: impl Display) {
    let line = render(tone, label, &message.to_string(), use_color());
    let mut stderr = io::stderr().lock();
    let _ = stderr.write_all(line.as_bytes());
    let _ = stderr.flush();
}

fn elapsed(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs >= 60 {
        match secs % 60 {
            0 => format!("{}m", secs / 60),
            rest => format!("{}m {rest}s", secs / 60),
        }
    } else if secs >= 1 {
        format!("{:.2}s", duration.as_secs_f64())
    } else if duration.as_millis() >= 1 {
        format!("{}ms", duration.as_millis())
    } else {
        format!("{}µs", duration.as_micros())
    }
}

pub fn status(label: &str, message: impl Display) {
    emit(Tone::Working, label, message);
}

pub fn info(message: impl Display) {
    emit(Tone::Note, "Info", message);
}

pub fn warn(message: impl Display) {
    emit(Tone::Warning, "Warning", message);
}

pub fn error(message: impl Display) {
    emit(Tone::Failure, "Error", message);
}

pub fn success(label: &str, message: impl Display) {
    emit(Tone::Done, label, message);
}

/// A unit of work reported when it starts and again when it ends.
///
/// Dropping an unfinished step reports it as interrupted.
pub struct Progress {
    subject: String,
    started: Instant,
    finished: bool,
}

impl Progress {
    pub fn new(label: impl Into<String>, subject: impl Into<String>) -> Self {
        let label: String = label.into();
        let subject = subject.into();
        emit(Tone::Working, &label, &subject);

        Self {
            subject,
            started: Instant::now(),
            finished: false,
        }
    }

    pub fn success(mut self, label: &str, detail: Option<String>) {
        self.finished = true;
        let took = elapsed(self.started.elapsed());
        match detail.filter(|detail| !detail.is_empty()) {
            Some(detail) => emit(Tone::Done, label, format!("{} {detail} in {took}", self.subject)),
            None => emit(Tone::Done, label, format!("{} in {took}", self.subject)),
        }
    }

    pub fn fail(mut self, label: &str, error: impl Display) {
        self.finished = true;
        let took = elapsed(self.started.elapsed());
        emit(
            Tone::Failure,
            label,
            format!("{} after {took}: {error}", self.subject),
        );
    }
}

impl Drop for Progress {
    fn drop(&mut self) {
        if !self.finished {
            emit(Tone::Warning, "Interrupted", &self.subject);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(Duration::from_micros(250), "250µs")]
    #[case(Duration::from_millis(42), "42ms")]
    #[case(Duration::from_millis(1500), "1.50s")]
    #[case(Duration::from_secs(120), "2m")]
    #[case(Duration::from_secs(125), "2m 5s")]
    fn formats_elapsed_time(#[case] duration: Duration, #[case] expected: &str) {
        assert_eq!(elapsed(duration), expected);
    }

    #[test]
    fn render_aligns_labels_and_continuations() {
        let rendered = render(Tone::Failure, "Error", "first\nsecond", false);
        assert_eq!(rendered, "       Error first\n             second\n");
    }

    #[test]
    fn render_wraps_label_in_color_codes() {
        let rendered = render(Tone::Done, "Locked", "2 input(s)", true);
        assert!(rendered.starts_with("\u{1b}["));
        assert!(rendered.contains("Locked"));
        assert!(rendered.ends_with("2 input(s)\n"));
    }
}
