//! Classification of incoming simple-protocol query text.

/// What to do with one query string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// Whitespace or bare semicolons.
    Empty,
    /// Session setting, acknowledged locally with the given tag.
    SessionNoop(&'static str),
    /// Transaction control, acknowledged locally with the given tag.
    Transactional(&'static str),
    /// Anything else, forwarded upstream.
    Query,
}

impl CommandKind {
    /// Classify by the leading keyword, ignoring case.
    pub fn classify(sql: &str) -> Self {
        let text = sql.trim_matches(|c: char| c.is_whitespace() || c == ';');
        if text.is_empty() {
            return CommandKind::Empty;
        }

        let keyword_end = text
            .find(|c: char| !c.is_ascii_alphabetic())
            .unwrap_or(text.len());
        let keyword = &text[..keyword_end];

        const TRANSACTIONAL: [&str; 3] = ["BEGIN", "COMMIT", "ROLLBACK"];

        if keyword.eq_ignore_ascii_case("SET") {
            CommandKind::SessionNoop("SET")
        } else if let Some(tag) = TRANSACTIONAL.into_iter().find(|t| keyword.eq_ignore_ascii_case(t)) {
            CommandKind::Transactional(tag)
        } else {
            CommandKind::Query
        }
    }
}
