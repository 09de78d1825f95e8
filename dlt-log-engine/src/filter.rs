//! Filter rules and their evaluation
//!
//! A message is included when it matches at least one enabled positive rule
//! (or there are none) and no enabled negative rule. Marker rules never
//! affect inclusion; the first matching one attaches its color.

use crate::types::{DecodedMessage, DltId};
use log::warn;
use once_cell::unsync::OnceCell;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterKind {
    #[default]
    Positive,
    Negative,
    Marker,
}

/// One user defined filter rule. Unset fields match anything.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FilterRule {
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub kind: FilterKind,

    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub ecu_id: Option<DltId>,

    #[serde(default)]
    pub app_id: Option<DltId>,

    #[serde(default)]
    pub ctx_id: Option<DltId>,

    /// Substring (or regex) matched against the rendered header
    #[serde(default)]
    pub header_text: Option<String>,

    /// Substring (or regex) matched against the rendered payload
    #[serde(default)]
    pub payload_text: Option<String>,

    /// Treat the text fields as regular expressions
    #[serde(default)]
    pub regex: bool,

    #[serde(default)]
    pub ignore_case: bool,

    #[serde(default)]
    pub log_level_min: Option<u8>,

    #[serde(default)]
    pub log_level_max: Option<u8>,

    /// Only match control messages
    #[serde(default)]
    pub control_messages: bool,

    #[serde(default)]
    pub marker_color: Option<String>,
}

fn default_true() -> bool {
    true
}

impl FilterRule {
    fn with_kind(name: impl Into<String>, kind: FilterKind) -> Self {
        Self {
            name: name.into(),
            kind,
            enabled: true,
            ..Default::default()
        }
    }

    pub fn positive(name: impl Into<String>) -> Self {
        Self::with_kind(name, FilterKind::Positive)
    }

    pub fn negative(name: impl Into<String>) -> Self {
        Self::with_kind(name, FilterKind::Negative)
    }

    pub fn marker(name: impl Into<String>, color: impl Into<String>) -> Self {
        let mut rule = Self::with_kind(name, FilterKind::Marker);
        rule.marker_color = Some(color.into());
        rule
    }

    pub fn with_ecu(mut self, id: impl Into<DltId>) -> Self {
        self.ecu_id = Some(id.into());
        self
    }

    pub fn with_app(mut self, id: impl Into<DltId>) -> Self {
        self.app_id = Some(id.into());
        self
    }

    pub fn with_ctx(mut self, id: impl Into<DltId>) -> Self {
        self.ctx_id = Some(id.into());
        self
    }

    pub fn with_header_text(mut self, text: impl Into<String>) -> Self {
        self.header_text = Some(text.into());
        self
    }

    pub fn with_payload_text(mut self, text: impl Into<String>) -> Self {
        self.payload_text = Some(text.into());
        self
    }

    pub fn with_regex(mut self, enabled: bool) -> Self {
        self.regex = enabled;
        self
    }

    pub fn with_ignore_case(mut self, enabled: bool) -> Self {
        self.ignore_case = enabled;
        self
    }

    pub fn with_log_levels(mut self, min: Option<u8>, max: Option<u8>) -> Self {
        self.log_level_min = min;
        self.log_level_max = max;
        self
    }

    pub fn with_control_messages(mut self, enabled: bool) -> Self {
        self.control_messages = enabled;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

/// A named list of rules, e.g. one of the default filters
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NamedFilterSet {
    pub name: String,
    #[serde(default)]
    pub rules: Vec<FilterRule>,
}

impl NamedFilterSet {
    pub fn new(name: impl Into<String>, rules: Vec<FilterRule>) -> Self {
        Self { name: name.into(), rules }
    }

    pub fn compile(&self) -> FilterSet {
        FilterSet::named(self.name.clone(), &self.rules)
    }
}

/// Result of evaluating a message against a filter set
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FilterVerdict {
    pub included: bool,
    pub marker: Option<String>,
}

enum TextMatcher {
    Substring { needle: String, ignore_case: bool },
    Regex(Regex),
}

impl TextMatcher {
    fn is_match(&self, text: &str) -> bool {
        match self {
            TextMatcher::Substring { needle, ignore_case: false } => text.contains(needle.as_str()),
            TextMatcher::Substring { needle, ignore_case: true } => text.to_lowercase().contains(needle.as_str()),
            TextMatcher::Regex(regex) => regex.is_match(text),
        }
    }
}

struct CompiledRule {
    rule: FilterRule,
    header: Option<TextMatcher>,
    payload: Option<TextMatcher>,
    /// A text pattern failed to compile; the rule never matches
    broken: bool,
}

impl CompiledRule {
    fn compile(rule: &FilterRule) -> Self {
        let mut broken = false;
        let mut matcher = |text: &Option<String>| -> Option<TextMatcher> {
            let text = text.as_ref()?;
            if !rule.regex {
                let needle = if rule.ignore_case { text.to_lowercase() } else { text.clone() };
                return Some(TextMatcher::Substring { needle, ignore_case: rule.ignore_case });
            }
            match RegexBuilder::new(text).case_insensitive(rule.ignore_case).build() {
                Ok(regex) => Some(TextMatcher::Regex(regex)),
                Err(e) => {
                    warn!("Filter '{}': invalid regex '{}': {}", rule.name, text, e);
                    broken = true;
                    None
                }
            }
        };
        let header = matcher(&rule.header_text);
        let payload = matcher(&rule.payload_text);
        Self { rule: rule.clone(), header, payload, broken }
    }

    fn matches(&self, message: &DecodedMessage, texts: &MessageTexts<'_>) -> bool {
        if self.broken {
            return false;
        }
        let rule = &self.rule;
        if rule.ecu_id.is_some_and(|id| message.ecu() != id) {
            return false;
        }
        if rule.app_id.is_some_and(|id| message.app() != id) {
            return false;
        }
        if rule.ctx_id.is_some_and(|id| message.ctx() != id) {
            return false;
        }
        if rule.log_level_min.is_some() || rule.log_level_max.is_some() {
            let Some(level) = message.log_level() else { return false };
            if rule.log_level_min.is_some_and(|min| level < min) || rule.log_level_max.is_some_and(|max| level > max) {
                return false;
            }
        }
        if rule.control_messages && !message.is_control() {
            return false;
        }
        if let Some(header) = &self.header {
            if !header.is_match(texts.header()) {
                return false;
            }
        }
        if let Some(payload) = &self.payload {
            if !payload.is_match(texts.payload()) {
                return false;
            }
        }
        true
    }
}

/// Header and payload renderings, computed at most once per message
pub struct MessageTexts<'a> {
    message: &'a DecodedMessage,
    header: OnceCell<String>,
    payload: OnceCell<String>,
}

impl<'a> MessageTexts<'a> {
    pub fn new(message: &'a DecodedMessage) -> Self {
        Self { message, header: OnceCell::new(), payload: OnceCell::new() }
    }

    pub fn header(&self) -> &str {
        self.header.get_or_init(|| self.message.header_text())
    }

    pub fn payload(&self) -> &str {
        self.payload.get_or_init(|| self.message.payload_text())
    }
}

/// A compiled, ordered set of filter rules
pub struct FilterSet {
    name: String,
    positive: Vec<CompiledRule>,
    negative: Vec<CompiledRule>,
    markers: Vec<CompiledRule>,
}

impl FilterSet {
    /// Compile the enabled rules. Rules whose regex does not compile never match.
    pub fn compile(rules: &[FilterRule]) -> Self {
        Self::named("", rules)
    }

    pub fn named(name: impl Into<String>, rules: &[FilterRule]) -> Self {
        let mut set = Self {
            name: name.into(),
            positive: Vec::new(),
            negative: Vec::new(),
            markers: Vec::new(),
        };
        for rule in rules.iter().filter(|r| r.enabled) {
            let compiled = CompiledRule::compile(rule);
            match rule.kind {
                FilterKind::Positive => set.positive.push(compiled),
                FilterKind::Negative => set.negative.push(compiled),
                FilterKind::Marker => set.markers.push(compiled),
            }
        }
        set
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// True when no enabled rule exists, so every message passes
    pub fn is_empty(&self) -> bool {
        self.positive.is_empty() && self.negative.is_empty() && self.markers.is_empty()
    }

    pub fn evaluate(&self, message: &DecodedMessage) -> FilterVerdict {
        self.evaluate_with(message, &MessageTexts::new(message))
    }

    /// Evaluate reusing texts already rendered for this message
    pub fn evaluate_with(&self, message: &DecodedMessage, texts: &MessageTexts<'_>) -> FilterVerdict {
        let positive = self.positive.is_empty() || self.positive.iter().any(|r| r.matches(message, texts));
        let included = positive && !self.negative.iter().any(|r| r.matches(message, texts));
        let marker = self
            .markers
            .iter()
            .find(|r| r.matches(message, texts))
            .and_then(|r| r.rule.marker_color.clone());
        FilterVerdict { included, marker }
    }
}

impl std::fmt::Debug for FilterSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterSet")
            .field("name", &self.name)
            .field("positive", &self.positive.len())
            .field("negative", &self.negative.len())
            .field("markers", &self.markers.len())
            .finish()
    }
}
