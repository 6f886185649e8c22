//! Relabel rules and the validation Prometheus applies when loading them.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::RelabelError;

pub const DEFAULT_SEPARATOR: &str = ";";
pub const DEFAULT_REGEX: &str = "(.*)";
pub const DEFAULT_REPLACEMENT: &str = "$1";

static LABEL_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_]*$").expect("label name regex"));

// Target labels of replace-like actions may reference capture groups.
static TEMPLATED_LABEL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:(?:[a-zA-Z_]|\$(?:\{\w+\}|\w+))+\w*)+$").expect("templated label regex")
});

/// What a relabel rule does with the labels it matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RelabelAction {
    #[default]
    Replace,
    Keep,
    Drop,
    KeepEqual,
    DropEqual,
    HashMod,
    LabelMap,
    LabelDrop,
    LabelKeep,
    Lowercase,
    Uppercase,
}

impl RelabelAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Replace => "replace",
            Self::Keep => "keep",
            Self::Drop => "drop",
            Self::KeepEqual => "keepequal",
            Self::DropEqual => "dropequal",
            Self::HashMod => "hashmod",
            Self::LabelMap => "labelmap",
            Self::LabelDrop => "labeldrop",
            Self::LabelKeep => "labelkeep",
            Self::Lowercase => "lowercase",
            Self::Uppercase => "uppercase",
        }
    }
}

impl fmt::Display for RelabelAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RelabelAction {
    type Err = RelabelError;

    /// Actions are matched case-insensitively (`Replace`, `replace`, `HashMod`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let action = match s.to_ascii_lowercase().as_str() {
            "" | "replace" => Self::Replace,
            "keep" => Self::Keep,
            "drop" => Self::Drop,
            "keepequal" => Self::KeepEqual,
            "dropequal" => Self::DropEqual,
            "hashmod" => Self::HashMod,
            "labelmap" => Self::LabelMap,
            "labeldrop" => Self::LabelDrop,
            "labelkeep" => Self::LabelKeep,
            "lowercase" => Self::Lowercase,
            "uppercase" => Self::Uppercase,
            _ => return Err(RelabelError::UnknownAction(s.to_string())),
        };
        Ok(action)
    }
}

impl Serialize for RelabelAction {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for RelabelAction {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A single Prometheus relabel rule.
///
/// Unset fields take Prometheus' defaults and are omitted on output.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RelabelConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub source_labels: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub separator: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regex: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modulus: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replacement: Option<String>,
    #[serde(default)]
    pub action: RelabelAction,
}

impl RelabelConfig {
    /// `replace` of the joined source labels into `target`.
    pub fn replace(source_labels: &[&str], target: &str) -> Self {
        Self {
            source_labels: source_labels.iter().map(|s| s.to_string()).collect(),
            target_label: Some(target.to_string()),
            ..Default::default()
        }
    }

    /// `keep` targets whose joined source labels match `regex`.
    pub fn keep(source_labels: &[&str], regex: &str) -> Self {
        Self {
            source_labels: source_labels.iter().map(|s| s.to_string()).collect(),
            regex: Some(regex.to_string()),
            action: RelabelAction::Keep,
            ..Default::default()
        }
    }

    /// `drop` targets whose joined source labels match `regex`.
    pub fn drop(source_labels: &[&str], regex: &str) -> Self {
        Self {
            action: RelabelAction::Drop,
            ..Self::keep(source_labels, regex)
        }
    }

    pub fn with_regex(mut self, regex: &str) -> Self {
        self.regex = Some(regex.to_string());
        self
    }

    pub fn with_replacement(mut self, replacement: &str) -> Self {
        self.replacement = Some(replacement.to_string());
        self
    }

    pub fn with_separator(mut self, separator: &str) -> Self {
        self.separator = Some(separator.to_string());
        self
    }

    /// Check the rule the way Prometheus does when it loads a config.
    pub fn validate(&self) -> Result<(), RelabelError> {
        let action = self.action.as_str();

        if let Some(regex) = &self.regex {
            Regex::new(&format!("^(?:{regex})$")).map_err(|e| RelabelError::Regex {
                regex: regex.clone(),
                reason: e.to_string(),
            })?;
        }

        if self.action == RelabelAction::HashMod && self.modulus.unwrap_or(0) == 0 {
            return Err(RelabelError::ZeroModulus);
        }

        let target = self.target_label.as_deref().unwrap_or("");
        let needs_target = matches!(
            self.action,
            RelabelAction::Replace
                | RelabelAction::HashMod
                | RelabelAction::Lowercase
                | RelabelAction::Uppercase
                | RelabelAction::KeepEqual
                | RelabelAction::DropEqual
        );
        if needs_target && target.is_empty() {
            return Err(RelabelError::MissingTargetLabel(action));
        }

        match self.action {
            RelabelAction::Replace | RelabelAction::Lowercase | RelabelAction::Uppercase
                if !TEMPLATED_LABEL.is_match(target) =>
            {
                return Err(RelabelError::InvalidTargetLabel {
                    action,
                    target: target.to_string(),
                });
            }
            RelabelAction::HashMod | RelabelAction::KeepEqual | RelabelAction::DropEqual
                if !LABEL_NAME.is_match(target) =>
            {
                return Err(RelabelError::InvalidTargetLabel {
                    action,
                    target: target.to_string(),
                });
            }
            RelabelAction::LabelDrop | RelabelAction::LabelKeep => {
                if !self.source_labels.is_empty() {
                    return Err(RelabelError::UnexpectedField { action, field: "source_labels" });
                }
                if !target.is_empty() {
                    return Err(RelabelError::UnexpectedField { action, field: "target_label" });
                }
                if self.modulus.is_some_and(|m| m != 0) {
                    return Err(RelabelError::UnexpectedField { action, field: "modulus" });
                }
            }
            RelabelAction::KeepEqual | RelabelAction::DropEqual => {
                if self.regex.as_deref().is_some_and(|r| r != DEFAULT_REGEX) {
                    return Err(RelabelError::UnexpectedField { action, field: "regex" });
                }
                if self.modulus.is_some_and(|m| m != 0) {
                    return Err(RelabelError::UnexpectedField { action, field: "modulus" });
                }
            }
            _ => {}
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_rule_is_replace() {
        let rule: RelabelConfig =
            serde_yaml::from_str("source_labels: [a]\ntarget_label: b\n").unwrap();
        assert_eq!(rule.action, RelabelAction::Replace);
        assert!(rule.validate().is_ok());
    }

    #[test]
    fn action_is_case_insensitive() {
        assert_eq!("HashMod".parse::<RelabelAction>().unwrap(), RelabelAction::HashMod);
        assert_eq!("Keep".parse::<RelabelAction>().unwrap(), RelabelAction::Keep);
        assert!("explode".parse::<RelabelAction>().is_err());
    }

    #[test]
    fn replace_requires_target_label() {
        let rule = RelabelConfig {
            source_labels: vec!["a".into()],
            ..Default::default()
        };
        assert_eq!(rule.validate(), Err(RelabelError::MissingTargetLabel("replace")));
    }

    #[test]
    fn replace_accepts_templated_target() {
        let rule = RelabelConfig::replace(&["a"], "label_$1");
        assert!(rule.validate().is_ok());
        let rule = RelabelConfig::replace(&["a"], "1bad");
        assert!(matches!(rule.validate(), Err(RelabelError::InvalidTargetLabel { .. })));
    }

    #[test]
    fn hashmod_rejects_zero_modulus() {
        let rule = RelabelConfig {
            source_labels: vec!["__address__".into()],
            target_label: Some("__tmp_hash".into()),
            modulus: Some(0),
            action: RelabelAction::HashMod,
            ..Default::default()
        };
        assert_eq!(rule.validate(), Err(RelabelError::ZeroModulus));

        let rule = RelabelConfig { modulus: Some(3), ..rule };
        assert!(rule.validate().is_ok());
    }

    #[test]
    fn invalid_regex_is_rejected() {
        let rule = RelabelConfig::keep(&["a"], "(unclosed");
        assert!(matches!(rule.validate(), Err(RelabelError::Regex { .. })));
    }

    #[test]
    fn labeldrop_rejects_source_labels() {
        let rule = RelabelConfig {
            source_labels: vec!["a".into()],
            regex: Some("tmp_.*".into()),
            action: RelabelAction::LabelDrop,
            ..Default::default()
        };
        assert_eq!(
            rule.validate(),
            Err(RelabelError::UnexpectedField { action: "labeldrop", field: "source_labels" })
        );
    }

    #[test]
    fn keepequal_rejects_custom_regex() {
        let rule = RelabelConfig {
            source_labels: vec!["a".into()],
            target_label: Some("b".into()),
            regex: Some("x+".into()),
            action: RelabelAction::KeepEqual,
            ..Default::default()
        };
        assert!(matches!(rule.validate(), Err(RelabelError::UnexpectedField { field: "regex", .. })));
    }

    #[test]
    fn shard_placeholder_regex_is_valid() {
        let rule = RelabelConfig::keep(&["__tmp_hash"], "$(SHARD)");
        assert!(rule.validate().is_ok());
    }

    #[test]
    fn serializes_lowercase_action_and_skips_defaults() {
        let yaml = serde_yaml::to_string(&RelabelConfig::keep(&["a", "b"], "x;y")).unwrap();
        assert!(yaml.contains("action: keep"));
        assert!(!yaml.contains("separator"));
        assert!(!yaml.contains("modulus"));
    }
}
