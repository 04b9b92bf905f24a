//! Dictionary-driven replaceable-line tagging.
//!
//! Repeating ambient chatter (weather, time of day, tides) gets a tag so
//! the front end can overwrite the previous line with the same tag instead
//! of stacking copies. The dictionary ships with defaults and extends from
//! the config file.

use crate::config::ReplaceableRule;
use mudgate_core::classify::LineTagger;
use mudgate_core::{BridgeError, BridgeResult};
use regex::Regex;

/// Built-in dictionary entries.
const DEFAULT_RULES: &[(&str, &str)] = &[
    (r"^The (?:sun|moon) (?:rises|sets|sinks|climbs)", "celestial"),
    (r"^(?:Dawn|Dusk|Midnight|Noon) (?:breaks|falls|arrives)", "timeofday"),
    (r"^(?:Rain|Snow|Sleet|Hail) (?:begins|stops|falls)", "weather"),
    (r"^A (?:gentle|cold|biting|warm) (?:breeze|wind) blows", "weather"),
    (r"^The tide (?:ebbs|turns|flows)", "tide"),
];

/// First matching rule wins; config rules are consulted before the
/// built-ins so deployments can shadow them.
pub struct ReplaceableTagger {
    rules: Vec<(Regex, String)>,
}

impl ReplaceableTagger {
    pub fn new(extra: &[ReplaceableRule]) -> BridgeResult<Self> {
        let mut rules = Vec::with_capacity(extra.len() + DEFAULT_RULES.len());
        for rule in extra {
            let regex = Regex::new(&rule.pattern).map_err(|e| {
                BridgeError::Config(format!("replaceable pattern {:?}: {e}", rule.pattern))
            })?;
            rules.push((regex, rule.tag.clone()));
        }
        for (pattern, tag) in DEFAULT_RULES {
            let regex = Regex::new(pattern)
                .map_err(|e| BridgeError::Config(format!("builtin pattern {pattern:?}: {e}")))?;
            rules.push((regex, (*tag).to_string()));
        }
        Ok(Self { rules })
    }
}

impl LineTagger for ReplaceableTagger {
    fn attempt(&self, clean_line: &str) -> Option<String> {
        self.rules
            .iter()
            .find(|(regex, _)| regex.is_match(clean_line))
            .map(|(_, tag)| tag.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_dictionary_matches() {
        let tagger = ReplaceableTagger::new(&[]).unwrap();
        assert_eq!(
            tagger.attempt("The sun rises over the eastern mountains."),
            Some("celestial".into())
        );
        assert_eq!(tagger.attempt("Billum waves."), None);
    }

    #[test]
    fn config_rules_shadow_builtins() {
        let extra = vec![ReplaceableRule {
            pattern: "^The sun".into(),
            tag: "sky".into(),
        }];
        let tagger = ReplaceableTagger::new(&extra).unwrap();
        assert_eq!(tagger.attempt("The sun rises."), Some("sky".into()));
    }

    #[test]
    fn invalid_pattern_is_a_config_error() {
        let extra = vec![ReplaceableRule {
            pattern: "([unclosed".into(),
            tag: "broken".into(),
        }];
        assert!(ReplaceableTagger::new(&extra).is_err());
    }
}
