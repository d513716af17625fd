// Copyright (c) Kyutai, all rights reserved.
// This source code is licensed under the license found in the
// LICENSE file in the root directory of this source tree.

//! Console event formatter used when logs are not emitted as JSON.

use owo_colors::OwoColorize;
use std::fmt;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::format::{self, FormatEvent, FormatFields};
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::registry::LookupSpan;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogStyle {
    /// Icon and message only.
    Compact,
    /// Level and target, colored when writing to a terminal.
    #[default]
    Pretty,
    /// Pretty plus span scope and file/line.
    Verbose,
}

impl std::str::FromStr for LogStyle {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "compact" => Ok(LogStyle::Compact),
            "pretty" => Ok(LogStyle::Pretty),
            "verbose" => Ok(LogStyle::Verbose),
            _ => Err(format!("Invalid log style '{s}'. Expected: compact, pretty, or verbose")),
        }
    }
}

fn level_icon(level: Level) -> &'static str {
    match level {
        Level::TRACE => "·",
        Level::DEBUG => "●",
        Level::INFO => "✓",
        Level::WARN => "⚠",
        Level::ERROR => "✕",
    }
}

pub struct ConsoleFormatter<T> {
    timer: T,
    ansi: bool,
    style: LogStyle,
}

impl<T> ConsoleFormatter<T> {
    pub fn new(timer: T, style: LogStyle) -> Self {
        Self { timer, ansi: false, style }
    }

    pub fn with_ansi(mut self, ansi: bool) -> Self {
        self.ansi = ansi;
        self
    }

    fn write_level(&self, writer: &mut format::Writer<'_>, level: Level) -> fmt::Result {
        let icon = level_icon(level);
        let label = match self.style {
            LogStyle::Compact => icon.to_string(),
            LogStyle::Pretty | LogStyle::Verbose => format!("{icon} {:<5}", level.as_str()),
        };
        if !self.ansi {
            return write!(writer, "{label}");
        }
        match level {
            Level::TRACE => write!(writer, "{}", label.dimmed()),
            Level::DEBUG => write!(writer, "{}", label.blue()),
            Level::INFO => write!(writer, "{}", label.green()),
            Level::WARN => write!(writer, "{}", label.yellow()),
            Level::ERROR => write!(writer, "{}", label.red().bold()),
        }
    }

    fn write_dimmed(&self, writer: &mut format::Writer<'_>, s: &str) -> fmt::Result {
        if self.ansi {
            write!(writer, " {}", s.dimmed())
        } else {
            write!(writer, " {s}")
        }
    }
}

impl<S, N, T> FormatEvent<S, N> for ConsoleFormatter<T>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
    T: FormatTime,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let meta = event.metadata();
        self.timer.format_time(&mut writer)?;
        write!(writer, " ")?;
        self.write_level(&mut writer, *meta.level())?;

        if self.style != LogStyle::Compact {
            self.write_dimmed(&mut writer, meta.target())?;
        }
        if self.style == LogStyle::Verbose {
            if let Some(scope) = ctx.event_scope() {
                let spans: Vec<_> = scope.from_root().map(|s| s.name()).collect();
                if !spans.is_empty() {
                    self.write_dimmed(&mut writer, &format!("{}:", spans.join(":")))?;
                }
            }
            if let (Some(file), Some(line)) = (meta.file(), meta.line()) {
                let file = file.rsplit('/').next().unwrap_or(file);
                self.write_dimmed(&mut writer, &format!("{file}:{line}"))?;
            }
        }

        write!(writer, " ")?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn render(style: LogStyle, f: impl FnOnce()) -> String {
        let out = Captured::default();
        let writer = out.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .event_format(ConsoleFormatter::new((), style))
            .with_writer(move || writer.clone())
            .finish();
        tracing::subscriber::with_default(subscriber, f);
        let bytes = out.0.lock().unwrap().clone();
        String::from_utf8(bytes).unwrap()
    }

    #[test]
    fn log_style_from_str() {
        assert_eq!(LogStyle::from_str("compact").unwrap(), LogStyle::Compact);
        assert_eq!(LogStyle::from_str("Pretty").unwrap(), LogStyle::Pretty);
        assert_eq!(LogStyle::from_str("VERBOSE").unwrap(), LogStyle::Verbose);
        assert!(LogStyle::from_str("loud").is_err());
    }

    #[test]
    fn pretty_has_level_and_target() {
        let line = render(LogStyle::Pretty, || tracing::warn!(chunks = 3, "slow consumer"));
        assert!(line.contains("⚠ WARN"), "{line}");
        assert!(line.contains("orpheus_server::logging"), "{line}");
        assert!(line.contains("slow consumer"), "{line}");
        assert!(line.contains("chunks=3"), "{line}");
        assert!(!line.contains('\u{1b}'), "{line}");
    }

    #[test]
    fn compact_drops_target() {
        let line = render(LogStyle::Compact, || tracing::info!("ready"));
        assert!(line.contains("✓ ready"), "{line}");
        assert!(!line.contains("orpheus_server"), "{line}");
    }

    #[test]
    fn verbose_shows_spans_and_location() {
        let line = render(LogStyle::Verbose, || {
            let span = tracing::info_span!("speech");
            let _enter = span.enter();
            tracing::error!("decode failed")
        });
        assert!(line.contains("speech:"), "{line}");
        assert!(line.contains("logging.rs:"), "{line}");
        assert!(line.contains("✕ ERROR"), "{line}");
    }
}
