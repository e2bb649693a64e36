//! Notification delivery and alert message formatting.

use tokio::process::Command;

use snowwatch_core::{NotifyConfig, NotifyError};
use snowwatch_weather::{ChangeEvent, Severity};

/// Sink for human-readable alert messages.
///
/// Failures are returned, never swallowed; the orchestrator decides whether to retry.
#[allow(async_fn_in_trait)]
pub trait Notifier {
    async fn notify(&self, title: &str, message: &str) -> Result<(), NotifyError>;
}

/// Prints a framed block to stdout.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsoleNotifier;

impl Notifier for ConsoleNotifier {
    async fn notify(&self, title: &str, message: &str) -> Result<(), NotifyError> {
        let width = title
            .chars()
            .count()
            .max(message.lines().map(|l| l.chars().count()).max().unwrap_or(0))
            .min(72);
        let rule = "=".repeat(width);
        println!("{}\n{}\n{}\n{}\n{}", rule, title, "-".repeat(width), message, rule);
        Ok(())
    }
}

/// Writes alerts to the log only.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    async fn notify(&self, title: &str, message: &str) -> Result<(), NotifyError> {
        tracing::info!("{}: {}", title, message.replace('\n', " | "));
        Ok(())
    }
}

/// Runs an external program as `<program> [args...] <title> <message>`.
#[derive(Debug, Clone)]
pub struct CommandNotifier {
    program: String,
    args: Vec<String>,
}

impl CommandNotifier {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Split a configured command line such as `notify-send -u critical`.
    pub fn from_command_line(command: &str) -> Option<Self> {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self {
            program,
            args: parts.collect(),
        })
    }
}

impl Notifier for CommandNotifier {
    async fn notify(&self, title: &str, message: &str) -> Result<(), NotifyError> {
        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(title)
            .arg(message)
            .output()
            .await?;

        if output.status.success() {
            tracing::debug!("Notification delivered via {}", self.program);
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(NotifyError::CommandFailed(format!(
                "{} ({}): {}",
                self.program,
                output.status,
                stderr.trim()
            )))
        }
    }
}

/// Notifier chosen from configuration at startup.
#[derive(Debug, Clone)]
pub enum ConfiguredNotifier {
    Console(ConsoleNotifier),
    Log(LogNotifier),
    Command(CommandNotifier),
}

impl ConfiguredNotifier {
    /// `quiet` forces log-only delivery.
    pub fn from_config(config: &NotifyConfig, quiet: bool) -> Self {
        if quiet || !config.enabled {
            return Self::Log(LogNotifier);
        }
        match config.command.as_deref().and_then(CommandNotifier::from_command_line) {
            Some(command) => Self::Command(command),
            None => Self::Console(ConsoleNotifier),
        }
    }
}

impl Notifier for ConfiguredNotifier {
    async fn notify(&self, title: &str, message: &str) -> Result<(), NotifyError> {
        match self {
            Self::Console(n) => n.notify(title, message).await,
            Self::Log(n) => n.notify(title, message).await,
            Self::Command(n) => n.notify(title, message).await,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageLimits {
    pub max_lines: usize,
    pub max_length: usize,
}

impl Default for MessageLimits {
    fn default() -> Self {
        Self {
            max_lines: 5,
            max_length: 250,
        }
    }
}

impl From<&NotifyConfig> for MessageLimits {
    fn from(config: &NotifyConfig) -> Self {
        Self {
            max_lines: config.max_lines,
            max_length: config.max_length,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertMessage {
    pub title: String,
    pub body: String,
    /// Leading events whose line survives in full. At least one for a non-empty batch.
    pub shown: usize,
}

impl AlertMessage {
    pub fn build(place: &str, events: &[ChangeEvent], limits: MessageLimits) -> Self {
        let urgent = events.iter().any(|e| e.severity == Severity::High);
        let title = if urgent {
            format!("⚠️ Weather Alert: {}", place)
        } else {
            format!("Weather Alert: {}", place)
        };

        let mut lines: Vec<String> = events
            .iter()
            .take(limits.max_lines)
            .map(|e| {
                let marker = if e.severity == Severity::High { "!" } else { "-" };
                format!("{} {}", marker, e.summary())
            })
            .collect();
        if events.len() > limits.max_lines {
            lines.push(format!(
                "... and {} more changes",
                events.len() - limits.max_lines
            ));
        }

        let listed = events.len().min(limits.max_lines);
        let body = lines.join("\n");
        let shown = if body.chars().count() <= limits.max_length {
            listed
        } else {
            intact_lines(&lines[..listed], limits.max_length.saturating_sub(3))
        };

        Self {
            title,
            body: truncate(&body, limits.max_length),
            shown: shown.max(1).min(events.len()),
        }
    }
}

/// Lines that fit completely within the first `budget` chars of the joined body.
fn intact_lines(lines: &[String], budget: usize) -> usize {
    let mut used = 0;
    let mut count = 0;
    for line in lines {
        used += line.chars().count();
        if used > budget {
            break;
        }
        count += 1;
        used += 1;
    }
    count
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let kept: String = text.chars().take(max_chars.saturating_sub(3)).collect();
    format!("{}...", kept)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::panic)]
    use super::*;
    use chrono::{TimeZone, Utc};
    use snowwatch_weather::{ChangeKind, ChangeValue};

    fn event(period: &str, previous: f64, current: f64, severity: Severity) -> ChangeEvent {
        ChangeEvent {
            kind: ChangeKind::SnowTotal,
            period: period.to_string(),
            magnitude: (current - previous).abs(),
            previous: ChangeValue::Number(previous),
            current: ChangeValue::Number(current),
            severity,
            detected_at: Utc.with_ymd_and_hms(2026, 1, 12, 12, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_message_title_and_markers() {
        let events = vec![
            event("2026-01-13-day", 1.0, 3.0, Severity::Medium),
            event("2026-01-14-day", 2.0, 8.0, Severity::High),
        ];
        let message = AlertMessage::build("Breckenridge, CO", &events, MessageLimits {
            max_lines: 5,
            max_length: 1000,
        });

        assert_eq!(message.title, "⚠️ Weather Alert: Breckenridge, CO");
        let lines: Vec<&str> = message.body.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("- Snow forecast increased"));
        assert!(lines[1].starts_with("! Snow forecast increased"));
    }

    #[test]
    fn test_message_without_high_events_has_plain_title() {
        let events = vec![event("2026-01-13-day", 1.0, 3.0, Severity::Medium)];
        let message = AlertMessage::build("80424", &events, MessageLimits::default());
        assert_eq!(message.title, "Weather Alert: 80424");
    }

    #[test]
    fn test_message_overflow_line() {
        let events: Vec<_> = (0..8)
            .map(|i| event(&format!("2026-01-{:02}-day", 13 + i), 0.0, 3.0, Severity::Medium))
            .collect();
        let message = AlertMessage::build("80424", &events, MessageLimits {
            max_lines: 5,
            max_length: 10_000,
        });

        let lines: Vec<&str> = message.body.lines().collect();
        assert_eq!(lines.len(), 6);
        assert_eq!(lines[5], "... and 3 more changes");
        assert_eq!(message.shown, 5);
    }

    #[test]
    fn test_message_truncated_to_max_length() {
        let events: Vec<_> = (0..5)
            .map(|i| event(&format!("2026-01-{:02}-day", 13 + i), 0.0, 3.0, Severity::Medium))
            .collect();
        let message = AlertMessage::build("80424", &events, MessageLimits {
            max_lines: 5,
            max_length: 60,
        });

        assert_eq!(message.body.chars().count(), 60);
        assert!(message.body.ends_with("..."));
        // only the first line is readable in full
        assert_eq!(message.shown, 1);
    }

    #[test]
    fn test_shown_counts_lines_kept_whole() {
        let events: Vec<_> = (0..3)
            .map(|i| event(&format!("2026-01-{:02}-day", 13 + i), 0.0, 3.0, Severity::Medium))
            .collect();
        let line = format!("- {}", events[0].summary()).chars().count();

        let two = AlertMessage::build("80424", &events, MessageLimits {
            max_lines: 5,
            max_length: 2 * line + 1 + 3,
        });
        assert_eq!(two.shown, 2);

        let all = AlertMessage::build("80424", &events, MessageLimits {
            max_lines: 5,
            max_length: 3 * line + 2,
        });
        assert_eq!(all.shown, 3);
        assert!(!all.body.ends_with("..."));

        // a single line longer than the limit still counts as delivered
        let tiny = AlertMessage::build("80424", &events, MessageLimits {
            max_lines: 5,
            max_length: 10,
        });
        assert_eq!(tiny.shown, 1);
    }

    #[test]
    fn test_configured_notifier_selection() {
        let mut config = NotifyConfig::default();
        assert!(matches!(
            ConfiguredNotifier::from_config(&config, false),
            ConfiguredNotifier::Console(_)
        ));
        assert!(matches!(
            ConfiguredNotifier::from_config(&config, true),
            ConfiguredNotifier::Log(_)
        ));

        config.command = Some("notify-send -u critical".to_string());
        match ConfiguredNotifier::from_config(&config, false) {
            ConfiguredNotifier::Command(c) => {
                assert_eq!(c.program, "notify-send");
                assert_eq!(c.args, vec!["-u", "critical"]);
            }
            other => panic!("expected command notifier, got {:?}", other),
        }

        config.command = Some("   ".to_string());
        assert!(matches!(
            ConfiguredNotifier::from_config(&config, false),
            ConfiguredNotifier::Console(_)
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_notifier_reports_failure() {
        assert!(CommandNotifier::new("true").notify("t", "m").await.is_ok());

        let result = CommandNotifier::new("false").notify("t", "m").await;
        assert!(matches!(result, Err(NotifyError::CommandFailed(_))));
    }

    #[tokio::test]
    async fn test_command_notifier_missing_program() {
        let result = CommandNotifier::new("snowwatch-no-such-program")
            .notify("t", "m")
            .await;
        assert!(matches!(result, Err(NotifyError::Io(_))));
    }
}
