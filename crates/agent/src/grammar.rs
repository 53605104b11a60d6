//! Deterministic command grammar.
//!
//! A transcript is split into clauses on "then" / "and then"; every clause must
//! match one template for the grammar to produce a plan. If any clause is not
//! recognised the whole command is left to the reasoning fallback.

use once_cell::sync::Lazy;
use regex::Regex;
use voxnav_core::types::{ActionStep, WaitCondition};
use voxnav_core::Selector;

/// Timeout given to `wait for <text>` steps.
pub const DEFAULT_WAIT_MS: u64 = 10_000;

const SEARCH_URL: &str = "https://www.google.com/search?q=";

static CLAUSE_SPLIT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\s*,?\s+(?:and\s+)?then\s+").expect("clause split regex is valid"));

static POLITE_PREFIX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(?:(?:please|can you|could you|now|ok|okay)[\s,]+)+").expect("polite prefix regex is valid")
});

static NAVIGATE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(?:go\s+to|open|visit|navigate\s+to|browse\s+to)\s+(?:the\s+)?(?:website\s+|site\s+|page\s+)?(.+)$")
        .expect("navigate regex is valid")
});

static CLICK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(?:click|press|tap|hit|select)(?:\s+on)?\s+(.+?)(?:\s+(?:button|link|tab))?$")
        .expect("click regex is valid")
});

static TYPE_INTO: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(?:type|enter|write)\s+(.+?)\s+(?:into|in|on)\s+(.+?)(?:\s+(?:field|box|input|bar))?$")
        .expect("type regex is valid")
});

static EXTRACT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(?:read|extract|tell\s+me)\s+(.+)$").expect("extract regex is valid")
});

static WAIT_SECONDS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^wait(?:\s+for)?\s+(\d+|a|an|one|two|three|four|five|six|seven|eight|nine|ten)\s+(seconds?|minutes?)$")
        .expect("wait seconds regex is valid")
});

static WAIT_FOR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^wait\s+(?:for|until)\s+(.+?)(?:\s+(?:appears|shows up|is visible))?$").expect("wait for regex is valid"));

static SEARCH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(?:search|look\s+up|google)(?:\s+for)?\s+(.+)$").expect("search regex is valid"));

static SPOKEN_DOT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\s*\bdot\b\s*").expect("dot regex is valid"));
static SPOKEN_SLASH: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\s*\bslash\b\s*").expect("slash regex is valid"));
static SPOKEN_COLON: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\s*\bcolon\b\s*").expect("colon regex is valid"));
static HOST_LIKE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z0-9](?:[a-z0-9-]*[a-z0-9])?(?:\.[a-z0-9](?:[a-z0-9-]*[a-z0-9])?)*(?::\d+)?(?:/\S*)?$")
        .expect("host regex is valid")
});

/// Words that refer to something only the speaker can see.
const PRONOUNS: &[&str] = &[
    "it", "this", "that", "them", "these", "those", "there", "here", "this one", "that one", "thing",
    "something", "one",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GrammarMatch {
    Plan(Vec<ActionStep>),
    /// A template matched but its target cannot be resolved.
    Ambiguous(String),
    NoMatch,
}

enum Clause {
    Step(ActionStep),
    Ambiguous(String),
    Unknown,
}

/// Normalise a transcript for matching: trims whitespace, trailing sentence
/// punctuation and polite lead-ins.
fn clean(text: &str) -> String {
    let trimmed = text.trim().trim_end_matches(['.', '!', '?', ',', ';']).trim();
    POLITE_PREFIX.replace(trimmed, "").trim().to_string()
}

fn strip_article(label: &str) -> &str {
    let label = label.trim();
    for article in ["the ", "a ", "an ", "my "] {
        match (label.get(..article.len()), label.get(article.len()..)) {
            (Some(head), Some(rest)) if head.eq_ignore_ascii_case(article) && !rest.trim().is_empty() => {
                return rest.trim();
            }
            _ => {}
        }
    }
    label
}

fn strip_quotes(text: &str) -> &str {
    text.trim()
        .trim_matches(|c| c == '"' || c == '\'' || c == '\u{201c}' || c == '\u{201d}')
        .trim()
}

fn is_pronoun(target: &str) -> bool {
    let lower = target.trim().to_lowercase();
    PRONOUNS.contains(&lower.as_str())
}

/// Turn a spoken site ("example dot com", "docs.rs slash tokio", "github")
/// into an https URL. Returns `None` when the words do not look like a site.
pub fn normalize_site(spoken: &str) -> Option<String> {
    let raw = strip_quotes(spoken);
    if raw.is_empty() {
        return None;
    }
    let lower = raw.to_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        return if raw.contains(char::is_whitespace) { None } else { Some(raw.to_string()) };
    }

    let joined = SPOKEN_DOT.replace_all(&lower, ".");
    let joined = SPOKEN_SLASH.replace_all(&joined, "/");
    let joined = SPOKEN_COLON.replace_all(&joined, ":");
    let mut site = joined.trim().trim_end_matches('/').to_string();
    // "example . com" and "example.com / docs"
    site = site.replace(" .", ".").replace(". ", ".").replace(" /", "/").replace("/ ", "/");
    if let Some(rest) = site.strip_prefix("www ") {
        site = format!("www.{}", rest);
    }

    if site.contains(char::is_whitespace) || !HOST_LIKE.is_match(&site) {
        return None;
    }
    let host_end = site.find(['/', ':']).unwrap_or(site.len());
    if !site[..host_end].contains('.') && &site[..host_end] != "localhost" {
        site.insert_str(host_end, ".com");
    }
    Some(format!("https://{}", site))
}

fn word_number(word: &str) -> Option<u64> {
    let n = match word.to_lowercase().as_str() {
        "a" | "an" | "one" => 1,
        "two" => 2,
        "three" => 3,
        "four" => 4,
        "five" => 5,
        "six" => 6,
        "seven" => 7,
        "eight" => 8,
        "nine" => 9,
        "ten" => 10,
        digits => return digits.parse().ok(),
    };
    Some(n)
}

fn search_url(query: &str) -> String {
    let encoded: String = url::form_urlencoded::byte_serialize(query.trim().as_bytes()).collect();
    format!("{}{}", SEARCH_URL, encoded)
}

fn target_clause(target: &str, verb: &str, build: impl FnOnce(String) -> Clause) -> Clause {
    let label = strip_quotes(strip_article(target));
    if label.is_empty() {
        return Clause::Unknown;
    }
    if is_pronoun(label) {
        return Clause::Ambiguous(format!("'{} {}' does not say which element is meant", verb, label));
    }
    build(Selector::text(label))
}

fn match_clause(clause: &str) -> Clause {
    if let Some(caps) = WAIT_SECONDS.captures(clause) {
        let Some(n) = word_number(&caps[1]) else {
            return Clause::Unknown;
        };
        let unit_ms = if caps[2].to_lowercase().starts_with("minute") { 60_000 } else { 1_000 };
        return Clause::Step(ActionStep::Wait {
            condition: WaitCondition::Delay,
            timeout_ms: n.saturating_mul(unit_ms),
        });
    }
    if let Some(caps) = WAIT_FOR.captures(clause) {
        let text = strip_quotes(&caps[1]);
        if is_pronoun(text) {
            return Clause::Ambiguous(format!("'wait for {}' does not say what to wait for", text));
        }
        return Clause::Step(ActionStep::Wait {
            condition: WaitCondition::Text(text.to_string()),
            timeout_ms: DEFAULT_WAIT_MS,
        });
    }
    if let Some(caps) = TYPE_INTO.captures(clause) {
        let text = strip_quotes(&caps[1]).to_string();
        if text.is_empty() {
            return Clause::Unknown;
        }
        return target_clause(&caps[2], "type into", |selector| Clause::Step(ActionStep::type_text(&selector, &text)));
    }
    if let Some(caps) = SEARCH.captures(clause) {
        let query = strip_quotes(&caps[1]);
        if query.is_empty() {
            return Clause::Unknown;
        }
        return Clause::Step(ActionStep::navigate(&search_url(query)));
    }
    if let Some(caps) = NAVIGATE.captures(clause) {
        let target = caps[1].trim();
        if is_pronoun(target) {
            return Clause::Ambiguous(format!("'go to {}' does not name a site", target));
        }
        return match normalize_site(target) {
            Some(url) => Clause::Step(ActionStep::navigate(&url)),
            None => Clause::Unknown,
        };
    }
    if let Some(caps) = CLICK.captures(clause) {
        return target_clause(&caps[1], "click", |selector| Clause::Step(ActionStep::click(&selector)));
    }
    if let Some(caps) = EXTRACT.captures(clause) {
        return target_clause(&caps[1], "read", |selector| Clause::Step(ActionStep::extract(&selector)));
    }
    Clause::Unknown
}

/// Match a whole transcript against the command templates.
pub fn parse_command(text: &str) -> GrammarMatch {
    let cleaned = clean(text);
    if cleaned.is_empty() {
        return GrammarMatch::NoMatch;
    }

    let mut steps = Vec::new();
    for raw in CLAUSE_SPLIT.split(&cleaned) {
        let clause = clean(raw);
        if clause.is_empty() {
            continue;
        }
        match match_clause(&clause) {
            Clause::Step(step) => steps.push(step),
            Clause::Ambiguous(reason) => return GrammarMatch::Ambiguous(reason),
            Clause::Unknown => return GrammarMatch::NoMatch,
        }
    }
    if steps.is_empty() {
        GrammarMatch::NoMatch
    } else {
        GrammarMatch::Plan(steps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(text: &str) -> Vec<ActionStep> {
        match parse_command(text) {
            GrammarMatch::Plan(steps) => steps,
            other => panic!("expected a plan for {:?}, got {:?}", text, other),
        }
    }

    #[test]
    fn test_spoken_sites() {
        assert_eq!(normalize_site("example dot com").as_deref(), Some("https://example.com"));
        assert_eq!(normalize_site("Example.com").as_deref(), Some("https://example.com"));
        assert_eq!(normalize_site("docs dot rs slash tokio").as_deref(), Some("https://docs.rs/tokio"));
        assert_eq!(normalize_site("github").as_deref(), Some("https://github.com"));
        assert_eq!(normalize_site("www dot bbc dot co dot uk").as_deref(), Some("https://www.bbc.co.uk"));
        assert_eq!(normalize_site("localhost colon 8080").as_deref(), Some("https://localhost:8080"));
        assert_eq!(normalize_site("http://10.0.0.1/status").as_deref(), Some("http://10.0.0.1/status"));
        assert_eq!(normalize_site("the settings page"), None);
    }

    #[test]
    fn test_navigate() {
        assert_eq!(plan("go to example dot com"), vec![ActionStep::navigate("https://example.com")]);
        assert_eq!(plan("Please open wikipedia.org."), vec![ActionStep::navigate("https://wikipedia.org")]);
        assert_eq!(parse_command("open the settings menu"), GrammarMatch::NoMatch);
    }

    #[test]
    fn test_click_and_type() {
        assert_eq!(plan("click the sign in button"), vec![ActionStep::click("text=sign in")]);
        assert_eq!(plan("tap on Login"), vec![ActionStep::click("text=Login")]);
        assert_eq!(
            plan("type \"rust async\" into the search box"),
            vec![ActionStep::type_text("text=search", "rust async")]
        );
    }

    #[test]
    fn test_wait_and_extract() {
        assert_eq!(
            plan("wait 3 seconds"),
            vec![ActionStep::Wait { condition: WaitCondition::Delay, timeout_ms: 3000 }]
        );
        assert_eq!(
            plan("wait for two seconds"),
            vec![ActionStep::Wait { condition: WaitCondition::Delay, timeout_ms: 2000 }]
        );
        assert_eq!(
            plan("wait for Welcome back"),
            vec![ActionStep::Wait { condition: WaitCondition::Text("Welcome back".into()), timeout_ms: DEFAULT_WAIT_MS }]
        );
        assert_eq!(plan("read the headline"), vec![ActionStep::extract("text=headline")]);
    }

    #[test]
    fn test_search() {
        assert_eq!(
            plan("search for rust borrow checker"),
            vec![ActionStep::navigate("https://www.google.com/search?q=rust+borrow+checker")]
        );
    }

    #[test]
    fn test_multi_step_clauses() {
        let steps = plan("go to example dot com and then click More information, then read the title");
        assert_eq!(
            steps,
            vec![
                ActionStep::navigate("https://example.com"),
                ActionStep::click("text=More information"),
                ActionStep::extract("text=title"),
            ]
        );
    }

    #[test]
    fn test_pronoun_targets_are_ambiguous() {
        assert!(matches!(parse_command("click it"), GrammarMatch::Ambiguous(_)));
        assert!(matches!(parse_command("go to example.com then press that one"), GrammarMatch::Ambiguous(_)));
        assert!(matches!(parse_command("type hello into it"), GrammarMatch::Ambiguous(_)));
    }

    #[test]
    fn test_unknown_clause_defers_whole_command() {
        assert_eq!(parse_command("go to example.com then book me a table for two"), GrammarMatch::NoMatch);
        assert_eq!(parse_command("what's the weather like"), GrammarMatch::NoMatch);
        assert_eq!(parse_command("   "), GrammarMatch::NoMatch);
    }

    #[test]
    fn test_parsing_is_deterministic() {
        let text = "open news dot ycombinator dot com then click new";
        assert_eq!(parse_command(text), parse_command(text));
    }
}
