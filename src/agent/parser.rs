//! Agent Stream Parser (§4.4): turns raw PTY output chunks into structured
//! events while preserving the raw text for UI streaming.

use chrono::{DateTime, Duration as ChronoDuration, Timelike, Utc};
use regex::Regex;

use crate::agent::events::{QuotaStatus, StreamEvent, Verdict};
use crate::clock::Clock;

const HEX_HASH_MIN_LEN: usize = 7;

struct Patterns {
    accepted: Regex,
    rejected: Regex,
    all_features_complete: Regex,
    commits_header: Regex,
    hex_hash: Regex,
    quota_phrase: Regex,
    failure_marker: Regex,
    duration_phrase: Regex,
    absolute_time: Regex,
}

impl Patterns {
    fn new() -> Self {
        Self {
            accepted: Regex::new(r"(?i)^\s*ACCEPTED\s*$").unwrap(),
            rejected: Regex::new(r"(?i)^\s*REJECTED:\s*(.*)$").unwrap(),
            all_features_complete: Regex::new(r"(?i)^\s*ALL_FEATURES_COMPLETE\s*$").unwrap(),
            commits_header: Regex::new(r"(?i)^\s*Commits:\s*$").unwrap(),
            hex_hash: Regex::new(r"\b[0-9a-f]{7,40}\b").unwrap(),
            quota_phrase: Regex::new(r"(?i)(rate limit|quota)").unwrap(),
            failure_marker: Regex::new(r"(?i)(error|fail|exceeded|blocked|denied)").unwrap(),
            duration_phrase: Regex::new(r"(?i)try again in\s+(\d+)\s*(minute|minutes|hour|hours)").unwrap(),
            absolute_time: Regex::new(r"(?i)resets? at\s+(\d{1,2}):(\d{2})").unwrap(),
        }
    }

    fn is_verdict_start(&self, line: &str) -> bool {
        self.accepted.is_match(line) || self.rejected.is_match(line) || self.all_features_complete.is_match(line)
    }
}

/// A pending verdict accumulated across lines, finalized only when the idle
/// window elapses or a new verdict-like line begins (§4.4: "only the last
/// one before session idle is used").
enum Pending {
    None,
    Accepted,
    Rejected { reason: Vec<String> },
    AllFeaturesComplete { collecting_commits: bool, commits: Vec<String> },
}

pub struct AgentStreamParser {
    patterns: Patterns,
    line_buffer: String,
    pending: Pending,
    recent_lines: Vec<String>,
}

impl Default for AgentStreamParser {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentStreamParser {
    pub fn new() -> Self {
        Self {
            patterns: Patterns::new(),
            line_buffer: String::new(),
            pending: Pending::None,
            recent_lines: Vec::new(),
        }
    }

    /// Feed a raw output chunk. Returns `text`/`quota` events immediately;
    /// verdicts are only finalized by `flush_idle`.
    pub fn feed(&mut self, chunk: &[u8], clock: &dyn Clock) -> Vec<StreamEvent> {
        let text = String::from_utf8_lossy(chunk);
        self.line_buffer.push_str(&text);

        let mut events = Vec::new();
        while let Some(pos) = self.line_buffer.find('\n') {
            let line: String = self.line_buffer.drain(..=pos).collect();
            let line = line.trim_end_matches(['\n', '\r']).to_string();
            events.extend(self.process_line(&line, clock));
        }
        events
    }

    fn process_line(&mut self, line: &str, clock: &dyn Clock) -> Vec<StreamEvent> {
        let mut events = vec![StreamEvent::Text { chunk: line.to_string() }];

        self.recent_lines.push(line.to_string());
        if self.recent_lines.len() > 5 {
            self.recent_lines.remove(0);
        }

        if let Some(quota) = self.detect_quota(line, clock) {
            events.push(quota);
        }

        // A new verdict-like line finalizes whatever was pending before it,
        // except REJECTED reason continuation / commit list continuation.
        match &mut self.pending {
            Pending::Rejected { reason } if !self.patterns.is_verdict_start(line) => {
                if line.trim().is_empty() {
                    // blank line ends the reason block; keep pending until idle.
                } else {
                    reason.push(line.to_string());
                    return events;
                }
            }
            Pending::AllFeaturesComplete { collecting_commits: true, commits } if !self.patterns.is_verdict_start(line) => {
                if line.trim().is_empty() {
                    // blank line ends the commit list.
                } else {
                    for m in self.patterns.hex_hash.find_iter(line) {
                        if m.as_str().len() >= HEX_HASH_MIN_LEN {
                            commits.push(m.as_str().to_string());
                        }
                    }
                    return events;
                }
            }
            _ => {}
        }

        if self.patterns.accepted.is_match(line) {
            self.pending = Pending::Accepted;
        } else if let Some(caps) = self.patterns.rejected.captures(line) {
            let first = caps.get(1).map(|m| m.as_str().to_string()).unwrap_or_default();
            let reason = if first.is_empty() { Vec::new() } else { vec![first] };
            self.pending = Pending::Rejected { reason };
        } else if self.patterns.all_features_complete.is_match(line) {
            self.pending = Pending::AllFeaturesComplete {
                collecting_commits: false,
                commits: Vec::new(),
            };
        } else if self.patterns.commits_header.is_match(line) {
            if let Pending::AllFeaturesComplete { collecting_commits, .. } = &mut self.pending {
                *collecting_commits = true;
            }
        }

        events
    }

    fn detect_quota(&self, line: &str, clock: &dyn Clock) -> Option<StreamEvent> {
        if !self.patterns.quota_phrase.is_match(line) {
            return None;
        }
        let window = self.recent_lines.join("\n");
        if !self.patterns.failure_marker.is_match(&window) {
            return None;
        }

        let reset_at = if let Some(caps) = self.patterns.duration_phrase.captures(line) {
            let amount: i64 = caps.get(1)?.as_str().parse().ok()?;
            let unit = caps.get(2)?.as_str().to_lowercase();
            let delta = if unit.starts_with("hour") {
                ChronoDuration::hours(amount)
            } else {
                ChronoDuration::minutes(amount)
            };
            Some(clock.now() + delta)
        } else if let Some(caps) = self.patterns.absolute_time.captures(line) {
            let hour: u32 = caps.get(1)?.as_str().parse().ok()?;
            let minute: u32 = caps.get(2)?.as_str().parse().ok()?;
            let now = clock.now();
            now.with_hour(hour).and_then(|t| t.with_minute(minute)).and_then(|t| t.with_second(0))
        } else {
            None
        };

        let status = if line.to_lowercase().contains("quota") {
            QuotaStatus::QuotaExhausted
        } else {
            QuotaStatus::RateLimited
        };

        Some(StreamEvent::Quota { status, reset_at })
    }

    /// Finalize and return the pending verdict, if any, clearing state.
    /// Called by the Iteration Engine after ~500ms of no output, or an
    /// explicit role-marker terminator.
    pub fn flush_idle(&mut self) -> Option<StreamEvent> {
        let pending = std::mem::replace(&mut self.pending, Pending::None);
        match pending {
            Pending::None => None,
            Pending::Accepted => Some(StreamEvent::Verdict(Verdict::Accepted)),
            Pending::Rejected { reason } => Some(StreamEvent::Verdict(Verdict::Rejected {
                reason: reason.join("\n").trim().to_string(),
            })),
            Pending::AllFeaturesComplete { commits, .. } => Some(StreamEvent::Verdict(Verdict::AllFeaturesComplete {
                summary: String::new(),
                commits,
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;

    fn feed_str(parser: &mut AgentStreamParser, s: &str) -> Vec<StreamEvent> {
        parser.feed(s.as_bytes(), &SystemClock)
    }

    #[test]
    fn accepted_is_recognized_as_verdict_start() {
        let mut parser = AgentStreamParser::new();
        feed_str(&mut parser, "ACCEPTED\n");
        let verdict = parser.flush_idle().unwrap();
        assert!(matches!(verdict, StreamEvent::Verdict(Verdict::Accepted)));
    }

    #[test]
    fn rejected_reason_collected_until_blank_line() {
        let mut parser = AgentStreamParser::new();
        feed_str(&mut parser, "REJECTED: criterion 2 not met\n");
        feed_str(&mut parser, "more detail on the same rejection\n");
        feed_str(&mut parser, "\n");
        let verdict = parser.flush_idle().unwrap();
        match verdict {
            StreamEvent::Verdict(Verdict::Rejected { reason }) => {
                assert!(reason.contains("criterion 2 not met"));
                assert!(reason.contains("more detail on the same rejection"));
            }
            other => panic!("expected Rejected, got {other:?}"),
        }
    }

    #[test]
    fn rejected_reason_stops_at_next_verdict_like_line() {
        let mut parser = AgentStreamParser::new();
        feed_str(&mut parser, "REJECTED: first issue\n");
        feed_str(&mut parser, "ACCEPTED\n");
        // the second verdict supersedes; flush_idle returns the last one.
        let verdict = parser.flush_idle().unwrap();
        assert!(matches!(verdict, StreamEvent::Verdict(Verdict::Accepted)));
    }

    #[test]
    fn all_features_complete_captures_commit_hashes() {
        let mut parser = AgentStreamParser::new();
        feed_str(&mut parser, "ALL_FEATURES_COMPLETE\n");
        feed_str(&mut parser, "Commits:\n");
        feed_str(&mut parser, "abc1234 feat: add widget\n");
        feed_str(&mut parser, "def5678 feat: add gadget\n");
        feed_str(&mut parser, "\n");
        let verdict = parser.flush_idle().unwrap();
        match verdict {
            StreamEvent::Verdict(Verdict::AllFeaturesComplete { commits, .. }) => {
                assert_eq!(commits, vec!["abc1234", "def5678"]);
            }
            other => panic!("expected AllFeaturesComplete, got {other:?}"),
        }
    }

    #[test]
    fn quota_not_raised_on_passing_mention() {
        let mut parser = AgentStreamParser::new();
        let events = feed_str(&mut parser, "our rate limit handling is now more robust\n");
        assert!(!events.iter().any(|e| matches!(e, StreamEvent::Quota { .. })));
    }

    #[test]
    fn quota_raised_when_failure_marker_present() {
        let mut parser = AgentStreamParser::new();
        let events = feed_str(
            &mut parser,
            "error: rate limit exceeded, try again in 30 minutes\n",
        );
        let quota = events.iter().find(|e| matches!(e, StreamEvent::Quota { .. })).unwrap();
        match quota {
            StreamEvent::Quota { status, reset_at } => {
                assert_eq!(*status, QuotaStatus::RateLimited);
                assert!(reset_at.is_some());
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn last_verdict_before_idle_wins() {
        let mut parser = AgentStreamParser::new();
        feed_str(&mut parser, "REJECTED: nope\n");
        feed_str(&mut parser, "\n");
        assert!(matches!(
            parser.flush_idle(),
            Some(StreamEvent::Verdict(Verdict::Rejected { .. }))
        ));
        feed_str(&mut parser, "ACCEPTED\n");
        assert!(matches!(
            parser.flush_idle(),
            Some(StreamEvent::Verdict(Verdict::Accepted))
        ));
    }
}
