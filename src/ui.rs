use crate::types::{RiskLevel, ScriptResponse};
use chrono::Local;
use crossterm::style::{style, Color, Stylize};
use std::io::IsTerminal;

fn paint(text: &str, color: Color, colored: bool) -> String {
    if colored {
        style(text).with(color).bold().to_string()
    } else {
        text.to_string()
    }
}

fn risk_color(risk: RiskLevel) -> Color {
    match risk {
        RiskLevel::Low => Color::Green,
        RiskLevel::Medium => Color::Yellow,
        RiskLevel::High => Color::Red,
        RiskLevel::Critical => Color::Magenta,
    }
}

/// Everything shown on stderr after a script is generated.
pub fn render_assessment(response: &ScriptResponse, colored: bool) -> String {
    let mut out = String::new();
    out.push('\n');
    if let Some(explanation) = response.explanation() {
        out.push_str(&format!("  {}\n", explanation));
    }

    let risk = response.risk_level();
    out.push_str(&format!(
        "  risk: {}  ({} via {})\n",
        paint(risk.as_str(), risk_color(risk), colored),
        response.model(),
        response.provider()
    ));

    for warning in response.warnings() {
        out.push_str(&format!("  {} {}\n", paint("warning:", Color::Red, colored), warning));
    }
    for note in response.safety_notes() {
        out.push_str(&format!("  note: {}\n", note));
    }
    if response.requires_confirmation() {
        out.push_str(&format!(
            "  {}\n",
            paint("review this script before running it", Color::Yellow, colored)
        ));
    }
    out
}

/// Script on stdout so it can be piped or redirected; the assessment on stderr.
pub fn print_response(response: &ScriptResponse) {
    println!("{}", response.script());
    let colored = std::io::stderr().is_terminal();
    eprint!("{}", render_assessment(response, colored));
}

pub fn render_history(entries: &[ScriptResponse], colored: bool) -> String {
    let mut out = String::new();
    for entry in entries {
        let risk = entry.risk_level();
        out.push_str(&format!(
            "{} [{}] {}\n",
            entry.created_at().with_timezone(&Local).format("%Y-%m-%d %H:%M"),
            paint(risk.as_str(), risk_color(risk), colored),
            entry.task_description()
        ));
        for line in entry.script().lines() {
            out.push_str(&format!("    {}\n", line));
        }
        out.push('\n');
    }
    out
}

pub fn print_history(entries: &[ScriptResponse]) {
    if entries.is_empty() {
        println!("no history yet.");
        return;
    }
    println!("recent scripts:");
    println!();
    print!("{}", render_history(entries, std::io::stdout().is_terminal()));
}
