use std::fmt;
use std::io::IsTerminal;

use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::{format::Writer, FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

const COLOR_RESET: &str = "\x1b[0m";
const COLOR_CYAN: &str = "\x1b[36m";
const COLOR_GREEN: &str = "\x1b[32m";
const COLOR_BRIGHT_YELLOW: &str = "\x1b[93m";
const COLOR_BRIGHT_RED: &str = "\x1b[91m";
const COLOR_BRIGHT_GRAY: &str = "\x1b[90m";

const COMPONENT_WIDTH: usize = 16;
const LEVEL_WIDTH: usize = 5;

/// `[timestamp] [component] [LEVEL] message` event formatter
pub struct DuplexLogFormatter {
    service_name: String,
    color_enabled: bool,
}

impl DuplexLogFormatter {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            color_enabled: stderr_is_terminal(),
        }
    }

    pub fn with_color(mut self, enabled: bool) -> Self {
        self.color_enabled = enabled;
        self
    }

    /// Fixed-width component column, falling back to the service name
    fn format_component(&self, component: Option<&str>) -> String {
        let name = component.unwrap_or(&self.service_name);
        if name.chars().count() > COMPONENT_WIDTH {
            let truncated: String = name.chars().take(COMPONENT_WIDTH - 1).collect();
            format!("{}…", truncated)
        } else {
            format!("{:<width$}", name, width = COMPONENT_WIDTH)
        }
    }

    fn format_level(level: &tracing::Level) -> String {
        format!("{:<width$}", level.as_str(), width = LEVEL_WIDTH)
    }

    fn color_for_level(&self, level: &tracing::Level) -> &'static str {
        if !self.color_enabled {
            return "";
        }
        match *level {
            tracing::Level::ERROR => COLOR_BRIGHT_RED,
            tracing::Level::WARN => COLOR_BRIGHT_YELLOW,
            tracing::Level::INFO => COLOR_GREEN,
            tracing::Level::DEBUG | tracing::Level::TRACE => COLOR_BRIGHT_GRAY,
        }
    }

    fn render(&self, timestamp: &str, level: &tracing::Level, fields: &FieldVisitor) -> String {
        let color = self.color_for_level(level);
        let (cyan, reset) = if self.color_enabled {
            (COLOR_CYAN, COLOR_RESET)
        } else {
            ("", "")
        };

        let mut line = format!(
            "{}[{}]{} [{}] [{}{}{}] {}",
            cyan,
            timestamp,
            reset,
            self.format_component(fields.component.as_deref()),
            color,
            Self::format_level(level),
            reset,
            fields.message
        );
        for (name, value) in &fields.extra {
            line.push_str(&format!(" {}={}", name, value));
        }
        line
    }
}

impl<S, N> FormatEvent<S, N> for DuplexLogFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(&self, _ctx: &FmtContext<'_, S, N>, mut writer: Writer<'_>, event: &Event<'_>) -> fmt::Result {
        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f").to_string();

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        writeln!(writer, "{}", self.render(&timestamp, event.metadata().level(), &visitor))
    }
}

/// Collects the message, the `component` field and any other fields
#[derive(Default)]
struct FieldVisitor {
    message: String,
    component: Option<String>,
    extra: Vec<(&'static str, String)>,
}

impl tracing::field::Visit for FieldVisitor {
    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        match field.name() {
            "message" => self.message = value.to_string(),
            "component" => self.component = Some(value.to_string()),
            name => self.extra.push((name, value.to_string())),
        }
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn fmt::Debug) {
        let text = format!("{:?}", value);
        let text = text
            .strip_prefix('"')
            .and_then(|t| t.strip_suffix('"'))
            .map(str::to_string)
            .unwrap_or(text);
        match field.name() {
            "message" => self.message = text,
            "component" => self.component = Some(text),
            name => self.extra.push((name, text)),
        }
    }
}

fn stderr_is_terminal() -> bool {
    if std::env::var("TERM").map(|term| term == "dumb").unwrap_or(false) {
        return false;
    }
    std::io::stderr().is_terminal()
}
