//! Local intent matching against recognized utterances.

use rand::Rng;
use regex::Regex;

use crate::config::IntentConfig;
use crate::error::{Error, Result};

/// Which reply list to draw from after dispatching an intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    /// The command succeeded but returned no text of its own.
    Positive,
    /// The command failed or timed out.
    Negative,
}

/// A compiled intent: patterns plus the command they trigger.
#[derive(Debug)]
pub struct Intent {
    pub name: String,
    pub function: String,
    pub params: String,
    pub replys_positive: Vec<String>,
    pub replys_negative: Vec<String>,
    patterns: Vec<Regex>,
}

impl Intent {
    /// True when any pattern full-matches `text`.
    fn matches(&self, text: &str) -> bool {
        self.patterns.iter().any(|re| re.is_match(text))
    }

    /// Picks one reply uniformly at random; empty list yields "".
    pub fn random_reply(&self, kind: ReplyKind) -> String {
        let replys = match kind {
            ReplyKind::Positive => &self.replys_positive,
            ReplyKind::Negative => &self.replys_negative,
        };
        if replys.is_empty() {
            return String::new();
        }
        let idx = rand::thread_rng().gen_range(0..replys.len());
        replys[idx].clone()
    }
}

/// Ordered intent registry. Built once at startup, immutable after.
#[derive(Debug, Default)]
pub struct IntentMatcher {
    intents: Vec<Intent>,
}

impl IntentMatcher {
    /// Compiles every configured pattern with full-match anchoring. An
    /// invalid pattern aborts the load, naming the offending intent.
    pub fn load(configs: &[IntentConfig]) -> Result<Self> {
        let mut intents = Vec::with_capacity(configs.len());
        for cfg in configs {
            let mut patterns = Vec::with_capacity(cfg.patterns.len());
            for pat in &cfg.patterns {
                let anchored = format!("^(?:{pat})$");
                let re = Regex::new(&anchored).map_err(|e| {
                    Error::Config(format!(
                        "intent {:?}: bad pattern {:?}: {}",
                        cfg.name, pat, e
                    ))
                })?;
                patterns.push(re);
            }
            intents.push(Intent {
                name: cfg.name.clone(),
                function: cfg.cmd.function.clone(),
                params: cfg.cmd.param.clone(),
                replys_positive: cfg.replysp.clone(),
                replys_negative: cfg.replysn.clone(),
                patterns,
            });
        }
        Ok(Self { intents })
    }

    /// First intent whose pattern list full-matches `text`, in load order.
    pub fn match_text(&self, text: &str) -> Option<&Intent> {
        self.intents.iter().find(|intent| intent.matches(text))
    }

    /// Number of loaded intents.
    pub fn len(&self) -> usize {
        self.intents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intents.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CmdConfig;

    fn intent_cfg(name: &str, patterns: &[&str]) -> IntentConfig {
        IntentConfig {
            name: name.to_string(),
            patterns: patterns.iter().map(|s| s.to_string()).collect(),
            cmd: CmdConfig {
                function: format!("{name}.run"),
                param: "{}".to_string(),
            },
            replysp: vec!["好".to_string()],
            replysn: vec!["失败".to_string()],
        }
    }

    #[test]
    fn test_full_match_semantics() {
        let m = IntentMatcher::load(&[intent_cfg("light", &["打开灯"])]).unwrap();
        assert!(m.match_text("打开灯").is_some());
        // Substring hits are not full matches.
        assert!(m.match_text("请打开灯好吗").is_none());
    }

    #[test]
    fn test_patterns_within_intent_are_ored() {
        let m = IntentMatcher::load(&[intent_cfg("light", &["开灯", "打开灯"])]).unwrap();
        assert_eq!(m.match_text("开灯").unwrap().name, "light");
        assert_eq!(m.match_text("打开灯").unwrap().name, "light");
    }

    #[test]
    fn test_first_match_wins_in_load_order() {
        let m = IntentMatcher::load(&[
            intent_cfg("first", &["停"]),
            intent_cfg("second", &["停"]),
        ])
        .unwrap();
        // Deterministic: same text, same load order, same winner.
        for _ in 0..10 {
            assert_eq!(m.match_text("停").unwrap().name, "first");
        }
    }

    #[test]
    fn test_alternation_stays_anchored() {
        // A top-level alternation must not escape the full-match anchor.
        let m = IntentMatcher::load(&[intent_cfg("ab", &["a|b"])]).unwrap();
        assert!(m.match_text("a").is_some());
        assert!(m.match_text("b").is_some());
        assert!(m.match_text("ax").is_none());
    }

    #[test]
    fn test_bad_pattern_names_intent() {
        let err = IntentMatcher::load(&[intent_cfg("broken", &["("])]).unwrap_err();
        assert!(err.to_string().contains("broken"), "{err}");
    }

    #[test]
    fn test_random_reply_empty_list() {
        let mut cfg = intent_cfg("x", &["y"]);
        cfg.replysn.clear();
        let m = IntentMatcher::load(&[cfg]).unwrap();
        let intent = m.match_text("y").unwrap();
        assert_eq!(intent.random_reply(ReplyKind::Negative), "");
        assert_eq!(intent.random_reply(ReplyKind::Positive), "好");
    }

    #[test]
    fn test_random_reply_uniform_coverage() {
        let mut cfg = intent_cfg("x", &["y"]);
        cfg.replysp = vec!["a".into(), "b".into(), "c".into()];
        let m = IntentMatcher::load(&[cfg]).unwrap();
        let intent = m.match_text("y").unwrap();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..200 {
            seen.insert(intent.random_reply(ReplyKind::Positive));
        }
        assert_eq!(seen.len(), 3);
    }
}
