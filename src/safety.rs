//! Pattern-based risk assessment for generated scripts.
//!
//! Scripts are lower-cased and matched against a table of dangerous
//! constructs. Each entry belongs to one tier; the assessed risk is the tier
//! of the first entry that matches when the table is scanned from
//! `Critical` down to `Medium`. Every matching entry contributes one warning.
//!
//! Full-line comments are never scanned, and most patterns only look at code
//! outside string literals, so `echo "reboot later"` is not a reboot. Strings
//! that are run anyway stay visible: arguments to `sh -c`, `eval`, `iex` and
//! friends, and `$(...)` inside double quotes. Python keeps all of its
//! strings since that is where it puts shell commands.
//!
//! This advises a human reviewer. Nothing here gates execution, so the
//! patterns trade some precision for coverage.

use crate::types::{RiskLevel, ScriptResponse, ScriptType};
use regex::Regex;

const NOTE_REVIEW: &str = "Review the script line by line before running it";
const NOTE_BACKUP: &str = "Create a backup of any files this script touches before running it";
const NOTE_ISOLATE: &str = "Test this script in an isolated environment (VM or container) first";
const NOTE_IRREVERSIBLE: &str =
    "This script can cause irreversible damage; never run it on a machine you cannot rebuild";

/// Script types a pattern is checked against.
#[derive(Debug, Clone, Copy)]
enum Scope {
    Any,
    Only(&'static [ScriptType]),
}

impl Scope {
    fn includes(&self, script_type: ScriptType) -> bool {
        match self {
            Scope::Any => true,
            Scope::Only(types) => script_type == ScriptType::Auto || types.contains(&script_type),
        }
    }
}

/// Which rendering of the script a pattern is matched against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum View {
    /// Inert string contents blanked out.
    Code,
    /// String contents kept, for patterns about quoted paths or literals.
    Text,
}

const HANDOFF_TOKENS: &[&str] = &[
    "-c",
    "/c",
    "/k",
    "-e",
    "-command",
    "eval",
    "iex",
    "invoke-expression",
];

/// The lower-cased script without comment lines, in both views.
struct Scan {
    text: String,
    code: String,
}

impl Scan {
    fn new(script: &str, script_type: ScriptType) -> Self {
        let lowered = script.to_lowercase();
        let text = lowered
            .lines()
            .filter(|line| !is_comment_line(line, script_type))
            .collect::<Vec<_>>()
            .join("\n");
        let code = if script_type == ScriptType::Python {
            text.clone()
        } else {
            text.lines()
                .map(|line| blank_strings(line, script_type))
                .collect::<Vec<_>>()
                .join("\n")
        };
        Self { text, code }
    }

    fn view(&self, view: View) -> &str {
        match view {
            View::Code => &self.code,
            View::Text => &self.text,
        }
    }
}

fn is_comment_line(line: &str, script_type: ScriptType) -> bool {
    let trimmed = line.trim_start();
    let hash = trimmed.starts_with('#') || trimmed.starts_with("<#");
    let rem = trimmed.starts_with("::")
        || trimmed == "rem"
        || trimmed.starts_with("rem ")
        || trimmed.starts_with("@rem ");
    match script_type {
        ScriptType::Command => rem,
        ScriptType::Auto => hash || rem,
        _ => hash,
    }
}

/// Replaces the contents of string literals on one line with spaces. Quotes
/// stay in place. Strings are not tracked across lines.
fn blank_strings(line: &str, script_type: ScriptType) -> String {
    let single_quotes = script_type != ScriptType::Command;
    let escape = match script_type {
        ScriptType::PowerShell => Some('`'),
        ScriptType::Command => None,
        _ => Some('\\'),
    };

    let mut out = String::with_capacity(line.len());
    let mut chars = line.chars().peekable();
    while let Some(quote) = chars.next() {
        if quote != '"' && !(quote == '\'' && single_quotes) {
            out.push(quote);
            continue;
        }
        let runs = out
            .split_whitespace()
            .last()
            .is_some_and(|token| HANDOFF_TOKENS.contains(&token));
        out.push(quote);

        // Depth of `$(...)` nesting inside a double-quoted string.
        let mut depth = 0usize;
        while let Some(c) = chars.next() {
            let keep = runs || depth > 0;
            if quote == '"' && Some(c) == escape {
                out.push(if keep { c } else { ' ' });
                if let Some(next) = chars.next() {
                    out.push(if keep { next } else { ' ' });
                }
            } else if depth == 0 && c == quote {
                out.push(c);
                break;
            } else if depth > 0 {
                match c {
                    '(' => depth += 1,
                    ')' => depth -= 1,
                    _ => {}
                }
                out.push(c);
            } else if quote == '"' && c == '$' && chars.peek() == Some(&'(') {
                chars.next();
                out.push_str("$(");
                depth = 1;
            } else {
                out.push(if runs { c } else { ' ' });
            }
        }
    }
    out
}

#[derive(Debug)]
enum Matcher {
    /// Any regex matches somewhere in the text.
    Any(Vec<Regex>),
    /// A single line matches every regex.
    SameLine(Vec<Regex>),
    /// Both regexes match somewhere in the text, not necessarily together.
    Both(Regex, Regex),
    /// `rm` aimed at `/` or `/*` whose flags include both recursive and force.
    RootWipe(Regex),
    /// Plain substring, used for configured patterns.
    Literal(String),
    Either(Vec<Matcher>),
}

impl Matcher {
    fn is_match(&self, text: &str) -> bool {
        match self {
            Matcher::Any(patterns) => patterns.iter().any(|p| p.is_match(text)),
            Matcher::SameLine(patterns) => text
                .lines()
                .any(|line| patterns.iter().all(|p| p.is_match(line))),
            Matcher::Both(first, second) => first.is_match(text) && second.is_match(text),
            Matcher::RootWipe(pattern) => pattern
                .captures_iter(text)
                .any(|caps| caps.get(1).is_some_and(|flags| recursive_and_forced(flags.as_str()))),
            Matcher::Literal(needle) => text.contains(needle.as_str()),
            Matcher::Either(matchers) => matchers.iter().any(|m| m.is_match(text)),
        }
    }
}

fn recursive_and_forced(flags: &str) -> bool {
    let mut recursive = false;
    let mut forced = false;
    for flag in flags.split_whitespace() {
        if let Some(long) = flag.strip_prefix("--") {
            recursive |= long == "recursive";
            forced |= long == "force";
        } else if let Some(short) = flag.strip_prefix('-') {
            recursive |= short.contains('r');
            forced |= short.contains('f');
        }
    }
    recursive && forced
}

#[derive(Debug)]
struct DangerPattern {
    level: RiskLevel,
    scope: Scope,
    view: View,
    warning: String,
    matcher: Matcher,
}

impl DangerPattern {
    fn new(level: RiskLevel, warning: &str, matcher: Matcher) -> Self {
        Self {
            level,
            scope: Scope::Any,
            view: View::Code,
            warning: warning.to_string(),
            matcher,
        }
    }

    fn scoped(mut self, types: &'static [ScriptType]) -> Self {
        self.scope = Scope::Only(types);
        self
    }

    fn including_strings(mut self) -> Self {
        self.view = View::Text;
        self
    }

    fn matches(&self, scan: &Scan, script_type: ScriptType) -> bool {
        self.scope.includes(script_type) && self.matcher.is_match(scan.view(self.view))
    }
}

fn re(pattern: &str) -> Regex {
    Regex::new(pattern).unwrap_or_else(|e| panic!("built-in pattern {pattern:?} is invalid: {e}"))
}

/// Filesystem or whole-disk destruction.
fn critical_patterns() -> Vec<DangerPattern> {
    vec![
        DangerPattern::new(
            RiskLevel::Critical,
            "CRITICAL: 'rm -rf /' deletes the entire filesystem",
            Matcher::RootWipe(re(
                r"(?m)\brm[ \t]+((?:-{1,2}[a-z-]+[ \t]+)+)/\*?(?:[ \t;&|)]|$)",
            )),
        ),
        DangerPattern::new(
            RiskLevel::Critical,
            "CRITICAL: 'dd' writes directly to a disk device and destroys its contents",
            Matcher::Any(vec![
                re(r"(?m)\bdd\b[^\n]*\bif=/dev/(?:zero|random|urandom)\b[^\n]*\bof=/dev/"),
                re(r"(?m)\bdd\b[^\n]*\bof=/dev/(?:sd[a-z]|hd[a-z]|vd[a-z]|xvd[a-z]|nvme\d+n\d+|mmcblk\d+|disk\d+)"),
            ]),
        ),
        DangerPattern::new(
            RiskLevel::Critical,
            "CRITICAL: output redirected into a raw disk device",
            Matcher::Any(vec![re(
                r">[ \t]*/dev/(?:sd[a-z]|hd[a-z]|vd[a-z]|nvme\d+n\d+|mmcblk\d+)",
            )]),
        ),
        DangerPattern::new(
            RiskLevel::Critical,
            "CRITICAL: 'format' erases an entire drive",
            Matcher::Any(vec![
                re(r"(?m)(?:^|[ \t;&|(])format(?:\.com)?[ \t]+[a-z]:(?:[ \t\\/]|$)"),
                re(r"\bformat-volume\b"),
                re(r"\bclear-disk\b"),
            ]),
        ),
        DangerPattern::new(
            RiskLevel::Critical,
            "CRITICAL: 'mkfs' creates a new filesystem and wipes the existing one",
            Matcher::Any(vec![re(r"\bmkfs(?:\.[a-z0-9]+)?\b")]),
        ),
        DangerPattern::new(
            RiskLevel::Critical,
            "CRITICAL: recursive forced deletion of a drive root",
            Matcher::Either(vec![
                Matcher::SameLine(vec![
                    re(r"\b(?:remove-item|ri)\b"),
                    re(r#"(?:^|[ \t'"=])[a-z]:\\?\*?['"]?(?:[ \t;]|$)"#),
                    re(r"-recurse\b"),
                    re(r"-force\b"),
                ]),
                Matcher::SameLine(vec![
                    re(r"\b(?:rd|rmdir|del|erase)\b"),
                    re(r"[ \t]/s\b"),
                    re(r#"(?:^|[ \t'"])[a-z]:\\\*?['"]?(?:[ \t;]|$)"#),
                ]),
            ]),
        )
        .including_strings(),
        DangerPattern::new(
            RiskLevel::Critical,
            "CRITICAL: fork bomb exhausts system resources",
            Matcher::Any(vec![re(r":\(\)\s*\{\s*:\s*\|\s*:\s*&\s*\}\s*;\s*:")]),
        ),
    ]
}

/// Broad deletion, permission changes and policy bypasses.
fn high_patterns() -> Vec<DangerPattern> {
    vec![
        DangerPattern::new(
            RiskLevel::High,
            "HIGH: recursive or forced 'rm' (e.g. 'rm -rf') can permanently delete files",
            Matcher::Any(vec![
                re(r"(?m)\brm[ \t]+(?:[^\n]*[ \t])?(?:-[a-z]*[rf][a-z]*|--recursive|--force)(?:[ \t]|$)"),
                re(r"(?m)\brm[ \t]+[^\n]*\*"),
            ]),
        ),
        DangerPattern::new(
            RiskLevel::High,
            "HIGH: 'Remove-Item -Recurse' deletes whole directory trees",
            Matcher::SameLine(vec![re(r"\b(?:remove-item|ri)\b"), re(r"-recurse\b")]),
        ),
        DangerPattern::new(
            RiskLevel::High,
            "HIGH: 'del /s' or 'rd /s' deletes whole directory trees",
            Matcher::Any(vec![re(r"(?m)\b(?:del|erase|rd|rmdir)\b[^\n]*[ \t]/s\b")]),
        )
        .scoped(&[ScriptType::Command, ScriptType::PowerShell]),
        DangerPattern::new(
            RiskLevel::High,
            "HIGH: 'shutil.rmtree' deletes whole directory trees",
            Matcher::Any(vec![re(r"\bshutil\.rmtree\b")]),
        )
        .scoped(&[ScriptType::Python]),
        DangerPattern::new(
            RiskLevel::High,
            "HIGH: permissions are loosened ('chmod 777', recursive 'chmod'/'chown', 'icacls /grant everyone')",
            Matcher::Any(vec![
                re(r"(?m)\bchmod\b[^\n]*(?:\b777\b|a\+rwx|[ \t]-r\b|--recursive)"),
                re(r"(?m)\bchown\b[^\n]*(?:[ \t]-r\b|--recursive)"),
                re(r"(?m)\bicacls\b[^\n]*/grant[^\n]*\beveryone\b"),
            ]),
        ),
        DangerPattern::new(
            RiskLevel::High,
            "HIGH: PowerShell execution policy is changed or bypassed",
            Matcher::Any(vec![
                re(r"\bset-executionpolicy\b"),
                re(r"-(?:executionpolicy|ep)[ \t]+(?:bypass|unrestricted)\b"),
            ]),
        ),
        DangerPattern::new(
            RiskLevel::High,
            "HIGH: system shutdown or reboot",
            Matcher::Any(vec![
                re(r"(?m)(?:^|[ \t;&|])(?:sudo[ \t]+)?(?:shutdown|reboot|halt|poweroff)\b"),
                re(r"\binit[ \t]+[06]\b"),
                re(r"\b(?:stop|restart)-computer\b"),
            ]),
        ),
    ]
}

/// Remote code fetched and executed in one go.
fn medium_patterns() -> Vec<DangerPattern> {
    vec![DangerPattern::new(
        RiskLevel::Medium,
        "MEDIUM: downloads remote content and executes it",
        Matcher::Both(
            re(r"\b(?:curl|wget|invoke-webrequest|iwr|invoke-restmethod|irm|downloadstring|downloadfile)\b"),
            re(r"\|[ \t]*(?:sudo[ \t]+)?(?:sh|bash|zsh|dash|ksh|python[0-9.]*|perl|ruby|node)\b|\b(?:invoke-expression|iex|eval)\b|\b(?:sh|bash|zsh)[ \t]+(?:-c\b|<\()"),
        ),
    )]
}

/// Classifies scripts by danger. Holds only immutable pattern tables.
#[derive(Debug)]
pub struct RiskAssessor {
    patterns: Vec<DangerPattern>,
}

impl Default for RiskAssessor {
    fn default() -> Self {
        Self::new()
    }
}

impl RiskAssessor {
    pub fn new() -> Self {
        Self::with_extra_patterns(&[])
    }

    /// Built-in tables plus literal patterns from the user's config, which
    /// count as `High`.
    pub fn with_extra_patterns(extra: &[String]) -> Self {
        let mut patterns = critical_patterns();
        patterns.extend(high_patterns());
        patterns.extend(
            extra
                .iter()
                .map(|p| p.trim().to_lowercase())
                .filter(|p| !p.is_empty())
                .map(|p| {
                    DangerPattern::new(
                        RiskLevel::High,
                        &format!("HIGH: matches configured dangerous pattern '{}'", p),
                        Matcher::Literal(p),
                    )
                    .including_strings()
                }),
        );
        patterns.extend(medium_patterns());
        patterns.sort_by(|a, b| b.level.cmp(&a.level));
        Self { patterns }
    }

    pub fn assess_risk_level(&self, script: &str, script_type: ScriptType) -> RiskLevel {
        let scan = Scan::new(script, script_type);
        self.patterns
            .iter()
            .find(|p| p.matches(&scan, script_type))
            .map(|p| p.level)
            .unwrap_or(RiskLevel::Low)
    }

    pub fn validate_script(&self, script: &str, script_type: ScriptType) -> Vec<String> {
        let scan = Scan::new(script, script_type);
        self.patterns
            .iter()
            .filter(|p| p.matches(&scan, script_type))
            .map(|p| p.warning.clone())
            .collect()
    }

    pub fn generate_safety_notes(&self, script: &str, script_type: ScriptType) -> Vec<String> {
        safety_notes_for(self.assess_risk_level(script, script_type))
    }

    pub fn contains_dangerous_operations(&self, script: &str, script_type: ScriptType) -> bool {
        self.assess_risk_level(script, script_type) >= RiskLevel::High
    }

    /// Returns a new response with the assessed risk level and this scan's
    /// warnings and notes appended after any the response already carried.
    pub fn enhance_with_validation(&self, response: ScriptResponse) -> ScriptResponse {
        let risk = self.assess_risk_level(response.script(), response.script_type());
        let warnings = self.validate_script(response.script(), response.script_type());
        let notes = safety_notes_for(risk);

        response
            .with_risk_level(risk)
            .with_warnings(warnings)
            .with_safety_notes(notes)
    }
}

fn safety_notes_for(risk: RiskLevel) -> Vec<String> {
    let mut notes = Vec::new();
    if risk >= RiskLevel::Medium {
        notes.push(NOTE_REVIEW.to_string());
        notes.push(NOTE_BACKUP.to_string());
        notes.push(NOTE_ISOLATE.to_string());
    }
    if risk == RiskLevel::Critical {
        notes.push(NOTE_IRREVERSIBLE.to_string());
    }
    notes
}
