//! Terminal output helpers.

use colored::Colorize;

/// Print a success message.
pub fn success(msg: &str) {
    eprintln!("  {} {}", "\u{2714}".bright_green(), msg);
}

/// Print an error message.
pub fn error(msg: &str) {
    eprintln!("  {} {}", "\u{2718}".bright_red(), msg.bright_red());
}

/// Key-value display: "  Label:       value".
pub fn kv(label: &str, value: &str) {
    eprintln!("  {:<13}{}", format!("{label}:"), value);
}

/// Hint line in dimmed text.
pub fn hint(msg: &str) {
    eprintln!("  {} {}", "hint:".dimmed(), msg.dimmed());
}
