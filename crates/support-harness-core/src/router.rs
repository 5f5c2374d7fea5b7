//! Query router: intent and complexity classification.
//!
//! Classification runs in two tiers:
//!
//! 1. **Pattern tier.** The query is normalized (lowercase, punctuation
//!    stripped, whitespace collapsed) and compared against fixed phrase
//!    tables. A match must be the *whole* normalized query, or a short
//!    query (at most `greeting_prefix_max_words` words, no product
//!    keyword) whose first word is a greeting token. Tables are checked in
//!    the order small talk, greeting, farewell, appreciation, chitchat.
//! 2. **Complexity tier.** Product keywords, question patterns, length and
//!    troubleshooting markers assign a [`ComplexityTier`]. Ambiguous
//!    queries can be handed to an [`IntentClassifier`]; if it fails the
//!    tier falls back to `moderate`.
//!
//! Independently of the tiers, explicit requests for a human ("speak to a
//! human", "urgent", ...) set `handoff_requested`.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};

use crate::models::{ComplexityTier, Intent, RouterDecision};

const SMALL_TALK: &[&str] = &[
    "how are you", "how r u", "how are u", "hows it going", "how's it going", "what's new",
    "whats new", "how do you do", "nice to meet you", "pleasure", "how's your day",
    "hows your day", "are you a bot", "are you real", "are you human", "who are you",
    "what are you", "what's your name", "whats your name", "your name", "who made you",
    "who created you", "are you ai", "are you chatgpt", "can you help", "can you help me",
    "i need help", "help me", "help please", "please help", "need assistance", "assist me",
];

const GREETINGS: &[&str] = &[
    "hi", "hello", "hey", "hiya", "howdy", "greetings", "yo", "sup", "good morning",
    "good afternoon", "good evening", "good night", "morning", "afternoon", "evening", "hola",
    "bonjour", "ciao", "what's up", "whats up", "wassup", "wazzup", "g'day", "aloha",
    "hi there", "hello there", "hey there",
];

const GREETING_STARTERS: &[&str] = &["hi", "hello", "hey", "hiya", "howdy", "yo", "sup"];

const FAREWELLS: &[&str] = &[
    "bye", "goodbye", "farewell", "see you", "see ya", "later", "take care", "have a nice day",
    "have a good one", "cya", "thanks bye", "thank you bye", "ok bye", "gtg", "gotta go",
    "talk later", "catch you later", "peace", "cheers", "bye bye",
];

const APPRECIATION: &[&str] = &[
    "thanks", "thank you", "thx", "ty", "thank u", "appreciate it", "thanks a lot",
    "thank you so much", "many thanks", "grateful", "much appreciated", "thanks for your help",
    "thanks for helping", "thanks so much",
];

const CHITCHAT: &[&str] = &[
    "tell me a joke", "joke", "funny", "weather", "whats the weather", "what time is it", "time",
    "date", "what day is it", "today", "tell me something", "interesting", "fun fact", "bored",
    "boring", "random", "anything", "whatever", "idk", "i dont know", "dunno", "nothing",
    "nevermind", "nvm", "forget it", "ok", "okay", "k", "cool", "nice", "great", "awesome", "sure",
    "alright", "fine", "yes", "no", "yeah", "yep", "nope", "maybe", "perhaps", "lol", "haha",
    "hehe", "lmao", "rofl", "omg", "wow", "hmm", "umm", "uh",
];

const PRODUCT_KEYWORDS: &[&str] = &[
    "account", "billing", "bill", "subscription", "payment", "invoice", "plan", "feature",
    "integration", "api", "setup", "configure", "settings", "error", "issue", "problem", "bug",
    "broken", "not working", "fix", "tutorial", "guide", "password", "login", "log in",
    "sign in", "sign up", "register", "upgrade", "downgrade", "cancel", "refund", "pricing",
    "price", "cost", "charge", "charged", "trial", "demo", "workspace", "project", "task", "team",
    "member", "admin", "user", "notification", "notifications", "email", "sync", "export",
    "import", "data", "backup", "2fa", "authentication", "permission", "permissions", "webhook",
    "sso", "reset",
];

const QUESTION_PATTERNS: &[&str] = &[
    "how to", "what is", "what are", "how do", "how can", "where is", "where can", "when can",
    "can i", "can you", "tell me", "show me", "help me", "get started", "getting started",
    "is it possible", "why",
];

const TROUBLESHOOTING_MARKERS: &[&str] = &[
    "error", "not working", "broken", "failed", "fails", "failing", "crash", "crashes", "still",
    "tried", "doesnt", "doesn't", "cant", "can't", "unable", "bug", "stuck", "wrong",
    "after updating", "keeps",
];

const HANDOFF_PHRASES: &[&str] = &[
    "speak to a human", "speak to human", "speak to someone", "talk to a human",
    "talk to human", "talk to an agent", "talk to agent", "talk to a person", "real person",
    "human agent", "human support", "live agent", "customer service rep", "escalate", "urgent",
    "emergency",
];

/// Tunable router knobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterParams {
    /// Longest query (in words) that still counts as a greeting when it
    /// merely starts with a greeting token.
    pub greeting_prefix_max_words: usize,
}

impl Default for RouterParams {
    fn default() -> Self {
        Self {
            greeting_prefix_max_words: 3,
        }
    }
}

#[derive(Debug, Error)]
#[error("intent classifier failed: {0}")]
pub struct ClassifierError(pub String);

/// Verdict from an external intent classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub intent: Intent,
    pub complexity_tier: ComplexityTier,
}

/// External (typically LLM-backed) classifier for ambiguous queries.
#[async_trait]
pub trait IntentClassifier: Send + Sync {
    async fn classify(&self, query: &str) -> Result<Classification, ClassifierError>;
}

/// Lowercase, drop apostrophes, turn other punctuation into spaces and
/// collapse whitespace.
pub fn normalize(text: &str) -> String {
    let cleaned: String = text
        .to_lowercase()
        .chars()
        .filter(|c| *c != '\'' && *c != '’')
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn table(phrases: &[&str]) -> HashSet<String> {
    phrases.iter().map(|p| normalize(p)).collect()
}

/// Whether `phrase` occurs in `padded` on word boundaries.
/// `padded` must be a normalized query wrapped in single spaces.
fn contains_phrase(padded: &str, phrase: &str) -> bool {
    padded.contains(&format!(" {} ", phrase))
}

pub struct Router {
    params: RouterParams,
    tables: Vec<(Intent, HashSet<String>)>,
    greeting_starters: HashSet<String>,
    product_keywords: Vec<String>,
    question_patterns: Vec<String>,
    troubleshooting: Vec<String>,
    handoff: Vec<String>,
    classifier: Option<Arc<dyn IntentClassifier>>,
}

impl Router {
    pub fn new(params: RouterParams) -> Self {
        let list = |p: &[&str]| p.iter().map(|s| normalize(s)).collect::<Vec<_>>();
        Self {
            params,
            tables: vec![
                (Intent::SmallTalk, table(SMALL_TALK)),
                (Intent::Greeting, table(GREETINGS)),
                (Intent::Farewell, table(FAREWELLS)),
                (Intent::Appreciation, table(APPRECIATION)),
                (Intent::Chitchat, table(CHITCHAT)),
            ],
            greeting_starters: table(GREETING_STARTERS),
            product_keywords: list(PRODUCT_KEYWORDS),
            question_patterns: list(QUESTION_PATTERNS),
            troubleshooting: list(TROUBLESHOOTING_MARKERS),
            handoff: list(HANDOFF_PHRASES),
            classifier: None,
        }
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn IntentClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn params(&self) -> &RouterParams {
        &self.params
    }

    /// Classify a query. Never fails: classifier errors degrade to
    /// `moderate`.
    pub async fn classify(&self, query: &str) -> RouterDecision {
        let norm = normalize(query);
        let padded = format!(" {} ", norm);

        if let Some((intent, pattern)) = self.match_pattern(&norm) {
            debug!(intent = intent.as_str(), pattern = %pattern, "pattern tier match");
            return RouterDecision {
                intent,
                complexity_tier: ComplexityTier::Simple,
                matched_pattern: Some(pattern),
                handoff_requested: false,
            };
        }

        let handoff_requested = self.handoff.iter().any(|p| contains_phrase(&padded, p));
        let product_hits = self.count_matches(&padded, &self.product_keywords);
        let has_question = self
            .question_patterns
            .iter()
            .any(|p| norm.starts_with(p.as_str()) || contains_phrase(&padded, p));
        let word_count = norm.split_whitespace().count();

        let ambiguous = product_hits == 0 && !has_question && word_count > 4;
        if ambiguous {
            if let Some(classifier) = &self.classifier {
                return match classifier.classify(query).await {
                    Ok(c) => {
                        debug!(intent = c.intent.as_str(), tier = c.complexity_tier.as_str(), "classifier verdict");
                        RouterDecision {
                            intent: c.intent,
                            complexity_tier: c.complexity_tier,
                            matched_pattern: None,
                            handoff_requested: handoff_requested && !c.intent.is_conversational(),
                        }
                    }
                    Err(e) => {
                        warn!("{}; falling back to moderate", e);
                        RouterDecision {
                            intent: Intent::Question,
                            complexity_tier: ComplexityTier::Moderate,
                            matched_pattern: None,
                            handoff_requested,
                        }
                    }
                };
            }
        }

        RouterDecision {
            intent: Intent::Question,
            complexity_tier: self.complexity(query, &padded, word_count, product_hits),
            matched_pattern: None,
            handoff_requested,
        }
    }

    /// Pattern-tier lookup on an already normalized query.
    pub fn match_pattern(&self, norm: &str) -> Option<(Intent, String)> {
        if norm.is_empty() {
            return None;
        }

        for (intent, phrases) in &self.tables {
            if phrases.contains(norm) {
                return Some((*intent, norm.to_string()));
            }
            if *intent == Intent::Greeting {
                if let Some(token) = self.greeting_prefix(norm) {
                    return Some((Intent::Greeting, token));
                }
            }
        }
        None
    }

    fn greeting_prefix(&self, norm: &str) -> Option<String> {
        let mut words = norm.split_whitespace();
        let first = words.next()?;
        let word_count = 1 + words.count();
        if word_count > self.params.greeting_prefix_max_words
            || !self.greeting_starters.contains(first)
        {
            return None;
        }
        let padded = format!(" {} ", norm);
        if self.count_matches(&padded, &self.product_keywords) > 0 {
            return None;
        }
        Some(first.to_string())
    }

    fn count_matches(&self, padded: &str, phrases: &[String]) -> usize {
        phrases.iter().filter(|p| contains_phrase(padded, p)).count()
    }

    fn complexity(&self, raw: &str, padded: &str, word_count: usize, product_hits: usize) -> ComplexityTier {
        let sentences = raw
            .split(['.', '?', '!'])
            .filter(|s| !s.trim().is_empty())
            .count();
        let trouble = self.count_matches(padded, &self.troubleshooting);

        if word_count > 25 || sentences >= 3 || trouble >= 2 || product_hits >= 3 {
            ComplexityTier::Complex
        } else if word_count <= 8 && product_hits <= 1 && trouble == 0 {
            ComplexityTier::Simple
        } else {
            ComplexityTier::Moderate
        }
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new(RouterParams::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingClassifier {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl IntentClassifier for CountingClassifier {
        async fn classify(&self, _query: &str) -> Result<Classification, ClassifierError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(ClassifierError("quota exceeded".into()))
            } else {
                Ok(Classification {
                    intent: Intent::Question,
                    complexity_tier: ComplexityTier::Complex,
                })
            }
        }
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("  Hello,   THERE!! "), "hello there");
        assert_eq!(normalize("What's up?"), "whats up");
        assert_eq!(normalize("G'day"), "gday");
    }

    #[tokio::test]
    async fn test_greetings_match() {
        let router = Router::default();
        for q in ["hi", "Hello!", "hey", "Good morning", "What's up?", "hey there"] {
            let d = router.classify(q).await;
            assert_eq!(d.intent, Intent::Greeting, "query {:?}", q);
            assert!(d.is_direct_reply());
            assert!(d.matched_pattern.is_some());
        }
    }

    #[tokio::test]
    async fn test_greeting_word_does_not_hijack_question() {
        let router = Router::default();
        let d = router.classify("hi, how do I export my invoices to csv?").await;
        assert_eq!(d.intent, Intent::Question);
        assert!(d.matched_pattern.is_none());

        let d = router.classify("hey refund").await;
        assert_eq!(d.intent, Intent::Question);
    }

    #[tokio::test]
    async fn test_small_talk_checked_before_greeting() {
        let router = Router::default();
        assert_eq!(router.classify("How are you?").await.intent, Intent::SmallTalk);
        assert_eq!(router.classify("are you a bot").await.intent, Intent::SmallTalk);
    }

    #[tokio::test]
    async fn test_other_conversational_intents() {
        let router = Router::default();
        assert_eq!(router.classify("bye").await.intent, Intent::Farewell);
        assert_eq!(router.classify("Thank you!").await.intent, Intent::Appreciation);
        assert_eq!(router.classify("tell me a joke").await.intent, Intent::Chitchat);
        assert_eq!(router.classify("ok").await.intent, Intent::Chitchat);
    }

    #[tokio::test]
    async fn test_substring_does_not_match() {
        let router = Router::default();
        // "thanks" appears, but the query is not wholly a known phrase.
        let d = router.classify("thanks, but my invoice is still wrong").await;
        assert_eq!(d.intent, Intent::Question);
    }

    #[tokio::test]
    async fn test_password_question_is_product_question() {
        let router = Router::default();
        let d = router.classify("How do I reset my password?").await;
        assert_eq!(d.intent, Intent::Question);
        assert!(!d.is_direct_reply());
        assert!(!d.handoff_requested);
    }

    #[tokio::test]
    async fn test_complexity_tiers() {
        let router = Router::default();
        assert_eq!(
            router.classify("Where can I find my invoice?").await.complexity_tier,
            ComplexityTier::Simple
        );
        assert_eq!(
            router
                .classify("How can I connect the Slack integration to my workspace?")
                .await
                .complexity_tier,
            ComplexityTier::Moderate
        );
        assert_eq!(
            router
                .classify("Sync is broken. I tried reconnecting the integration. It still fails with an error after updating.")
                .await
                .complexity_tier,
            ComplexityTier::Complex
        );
    }

    #[tokio::test]
    async fn test_handoff_requested() {
        let router = Router::default();
        let d = router.classify("I want to speak to a human about my bill").await;
        assert!(d.handoff_requested);
        let d = router.classify("URGENT: payment failed").await;
        assert!(d.handoff_requested);
    }

    #[tokio::test]
    async fn test_ambiguous_query_uses_classifier() {
        let classifier = Arc::new(CountingClassifier {
            calls: AtomicUsize::new(0),
            fail: false,
        });
        let router = Router::default().with_classifier(classifier.clone());
        let d = router.classify("my colleague says the thing looks odd today").await;
        assert_eq!(classifier.calls.load(Ordering::SeqCst), 1);
        assert_eq!(d.complexity_tier, ComplexityTier::Complex);

        // Clear product question: classifier is not consulted.
        router.classify("How do I upgrade my plan?").await;
        assert_eq!(classifier.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_classifier_failure_falls_back_to_moderate() {
        let router = Router::default().with_classifier(Arc::new(CountingClassifier {
            calls: AtomicUsize::new(0),
            fail: true,
        }));
        let d = router.classify("my colleague says the thing looks odd today").await;
        assert_eq!(d.intent, Intent::Question);
        assert_eq!(d.complexity_tier, ComplexityTier::Moderate);
    }

    #[tokio::test]
    async fn test_greeting_prefix_cutoff_is_tunable() {
        let router = Router::new(RouterParams {
            greeting_prefix_max_words: 5,
        });
        assert_eq!(router.classify("hey folks good to see").await.intent, Intent::Greeting);

        let strict = Router::new(RouterParams {
            greeting_prefix_max_words: 1,
        });
        assert_eq!(strict.classify("hey folks").await.intent, Intent::Question);
    }
}
