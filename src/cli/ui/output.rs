use console::style;

use crate::ai::degraded::OperationMode;
use crate::ai::provider::CircuitState;

pub struct Output;

impl Output {
    pub fn new() -> Self {
        Self
    }

    pub fn success(&self, message: &str) {
        println!("{} {}", style("✓").green(), message);
    }

    pub fn error(&self, message: &str) {
        eprintln!("{} {}", style("✗").red(), message);
    }

    pub fn warning(&self, message: &str) {
        println!("{} {}", style("⚠").yellow(), message);
    }

    pub fn info(&self, message: &str) {
        println!("{} {}", style("ℹ").blue(), message);
    }

    pub fn header(&self, message: &str) {
        println!("\n{}", style(message).bold().underlined());
    }

    pub fn section(&self, message: &str) {
        println!("\n{}", style(message).bold());
        println!("{}", "─".repeat(40));
    }

    /// Aligned `label: value` line
    pub fn field(&self, label: &str, value: impl std::fmt::Display) {
        println!("  {:<18} {}", style(format!("{}:", label)).dim(), value);
    }

    pub fn mode(&self, mode: OperationMode) -> String {
        match mode {
            OperationMode::Normal => style(mode.to_string()).green().to_string(),
            OperationMode::Degraded => style(mode.to_string()).yellow().to_string(),
            OperationMode::Emergency => style(mode.to_string()).red().bold().to_string(),
        }
    }

    pub fn circuit(&self, state: CircuitState) -> String {
        match state {
            CircuitState::Closed => style(state.to_string()).green().to_string(),
            CircuitState::HalfOpen => style(state.to_string()).yellow().to_string(),
            CircuitState::Open => style(state.to_string()).red().to_string(),
        }
    }
}

impl Default for Output {
    fn default() -> Self {
        Self::new()
    }
}
