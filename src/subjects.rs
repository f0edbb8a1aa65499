//! Subject naming and wildcard matching.
//!
//! Subjects are `.`-separated tokens. In subscription patterns `*` matches
//! exactly one token and a trailing `>` matches one or more tokens.

/// Broadcast subject for presence announcements.
pub const PRESENCE: &str = "lattice.presence";

/// Asks every station to announce itself immediately.
pub const PRESENCE_PROBE: &str = "lattice.presence.probe";

const EXEC_PREFIX: &str = "lattice.exec";
const REPLY_PREFIX: &str = "lattice.exec.reply";
const ANY_PREFIX: &str = "lattice.exec.any";
const INBOX_PREFIX: &str = "_INBOX";

/// Direct request subject for one agent on one station.
pub fn exec(station_id: &str, agent_name: &str) -> String {
    format!("{}.{}.{}", EXEC_PREFIX, station_id, agent_name)
}

/// Pattern covering every agent on a station.
pub fn exec_station_pattern(station_id: &str) -> String {
    format!("{}.{}.*", EXEC_PREFIX, station_id)
}

/// Request subject served by whichever station hosting the agent picks it up.
pub fn exec_any(agent_name: &str) -> String {
    format!("{}.{}", ANY_PREFIX, agent_name)
}

/// Queue group shared by all hosts of an agent for any-station requests.
pub fn exec_any_group(agent_name: &str) -> String {
    format!("{}.{}", EXEC_PREFIX, agent_name)
}

/// Per-call reply channel.
pub fn reply(correlation_id: &str) -> String {
    format!("{}.{}", REPLY_PREFIX, correlation_id)
}

/// Private inbox for request/reply.
pub fn inbox(id: &str) -> String {
    format!("{}.{}", INBOX_PREFIX, id)
}

/// Agent name addressed by a direct or any-station exec subject.
pub fn exec_agent(subject: &str) -> Option<&str> {
    let rest = subject.strip_prefix(EXEC_PREFIX)?.strip_prefix('.')?;
    let mut parts = rest.split('.');
    let _station = parts.next()?;
    let agent = parts.next()?;
    if parts.next().is_some() || agent.is_empty() {
        return None;
    }
    Some(agent)
}

/// Whether a published subject is valid (non-empty tokens, no wildcards).
pub fn is_valid_subject(subject: &str) -> bool {
    !subject.is_empty()
        && subject
            .split('.')
            .all(|t| !t.is_empty() && t != "*" && t != ">" && !t.contains(char::is_whitespace))
}

/// Whether a subscription pattern is well formed.
pub fn is_valid_pattern(pattern: &str) -> bool {
    if pattern.is_empty() {
        return false;
    }
    let tokens: Vec<&str> = pattern.split('.').collect();
    tokens.iter().enumerate().all(|(i, t)| {
        !t.is_empty() && !t.contains(char::is_whitespace) && (*t != ">" || i == tokens.len() - 1)
    })
}

/// Match a concrete subject against a subscription pattern.
pub fn matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');

    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => continue,
            (Some(p), Some(s)) if p == s => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_well_known_subjects() {
        assert_eq!(exec("alpha", "reporter"), "lattice.exec.alpha.reporter");
        assert_eq!(exec_station_pattern("alpha"), "lattice.exec.alpha.*");
        assert_eq!(reply("c-1"), "lattice.exec.reply.c-1");
        assert_eq!(exec_any("reporter"), "lattice.exec.any.reporter");
    }

    #[test]
    fn extracts_agent_from_exec_subject() {
        assert_eq!(exec_agent("lattice.exec.alpha.reporter"), Some("reporter"));
        assert_eq!(exec_agent("lattice.exec.any.reporter"), Some("reporter"));
        assert_eq!(exec_agent("lattice.exec.alpha"), None);
        assert_eq!(exec_agent("lattice.exec.alpha.reporter.extra"), None);
        assert_eq!(exec_agent("lattice.presence"), None);
    }

    #[test]
    fn wildcard_matching() {
        assert!(matches("lattice.presence", "lattice.presence"));
        assert!(!matches("lattice.presence", "lattice.presence.extra"));
        assert!(matches("lattice.exec.alpha.*", "lattice.exec.alpha.reporter"));
        assert!(!matches("lattice.exec.alpha.*", "lattice.exec.beta.reporter"));
        assert!(!matches("lattice.exec.alpha.*", "lattice.exec.alpha"));
        assert!(matches("lattice.>", "lattice.exec.reply.c-1"));
        assert!(!matches("lattice.>", "lattice"));
        assert!(matches("*.presence", "lattice.presence"));
    }

    #[test]
    fn validates_subjects_and_patterns() {
        assert!(is_valid_subject("lattice.exec.alpha.reporter"));
        assert!(!is_valid_subject("lattice..presence"));
        assert!(!is_valid_subject("lattice.*"));
        assert!(is_valid_pattern("lattice.*.reporter"));
        assert!(is_valid_pattern("lattice.>"));
        assert!(!is_valid_pattern("lattice.>.reporter"));
        assert!(!is_valid_pattern(""));
    }
}
