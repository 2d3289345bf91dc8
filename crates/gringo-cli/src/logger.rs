use colored::{Color, Colorize};
use gringo_core::{ServiceState, ServiceStatus};
use std::hash::{DefaultHasher, Hash, Hasher};
use std::io::{self, Stdout, Write};

/// Prints service output and supervisor messages with a colored prefix per
/// service.
pub struct Logger<W: Write = Stdout> {
    output: W,
}

impl<W: Write> Logger<W> {
    pub fn new(output: W) -> Self {
        Self { output }
    }

    fn string_to_color(s: &str) -> Color {
        let colors = [
            Color::Green,
            Color::Blue,
            Color::Magenta,
            Color::Cyan,
            Color::BrightGreen,
            Color::BrightBlue,
            Color::BrightMagenta,
            Color::BrightCyan,
        ];

        let mut hasher = DefaultHasher::new();
        s.hash(&mut hasher);
        let hash = hasher.finish();

        let idx = usize::try_from(hash % colors.len() as u64).unwrap_or_default();
        colors[idx]
    }

    fn state_color(state: &ServiceState) -> Color {
        match state {
            ServiceState::Ready => Color::Green,
            ServiceState::Starting => Color::Yellow,
            ServiceState::Failed(_) => Color::Red,
            ServiceState::NotStarted | ServiceState::Stopped { .. } => Color::BrightBlack,
        }
    }

    pub fn log(&mut self, service_name: &str, message: &str) {
        let prefix = format!("[{service_name}]").color(Self::string_to_color(service_name));
        for line in message.lines() {
            let _ = writeln!(self.output, "{prefix} {line}");
        }
    }

    pub fn system(&mut self, message: &str) {
        let prefix = "[gringo]".color(Color::Yellow);
        for line in message.lines() {
            let _ = writeln!(self.output, "{prefix} {line}");
        }
    }

    pub fn error(&mut self, message: &str) {
        let prefix = "[gringo]".color(Color::Red);
        for line in message.lines() {
            let _ = writeln!(self.output, "{prefix} {}", line.color(Color::Red));
        }
    }

    /// One line per service: name, state (with reason), pid and port.
    pub fn status(&mut self, status: &ServiceStatus) {
        let mut line = format!(
            "{:<16} {}",
            status.name,
            status.state.to_string().color(Self::state_color(&status.state))
        );
        if let Some(pid) = status.pid {
            line.push_str(&format!("  pid {pid}"));
        }
        if let Some(port) = status.port {
            line.push_str(&format!("  port {port}"));
        }
        self.system(&line);
    }
}

impl Logger {
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}
