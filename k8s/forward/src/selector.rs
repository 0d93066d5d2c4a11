use crate::error::{InvalidSelector, ResolveError};
use k8s_openapi::apimachinery::pkg::apis::meta::v1 as metav1;
use snafu::ensure;
use std::{collections::BTreeMap, fmt, str::FromStr};

/// The set based operators of a label selector requirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    /// The label value is one of the values.
    In,
    /// The label is missing or its value is none of the values.
    NotIn,
    /// The label is present.
    Exists,
    /// The label is missing.
    DoesNotExist,
}

impl FromStr for Operator {
    type Err = ResolveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "In" => Ok(Self::In),
            "NotIn" => Ok(Self::NotIn),
            "Exists" => Ok(Self::Exists),
            "DoesNotExist" => Ok(Self::DoesNotExist),
            other => InvalidSelector {
                reason: format!("{other:?} is not a valid label selector operator"),
            }
            .fail(),
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self {
            Self::In => "In",
            Self::NotIn => "NotIn",
            Self::Exists => "Exists",
            Self::DoesNotExist => "DoesNotExist",
        };
        f.write_str(op)
    }
}

/// A single label selector expression, eg: `tier in (frontend,backend)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    key: String,
    operator: Operator,
    values: Vec<String>,
}

impl Requirement {
    /// Returns a new `Self` from the given parameters.
    /// # Arguments
    /// * `key` - the label key
    /// * `operator` - how the label relates to the values
    /// * `values` - must be non-empty for `In`/`NotIn` and empty otherwise
    pub fn new<K: Into<String>, V: Into<String>>(
        key: K,
        operator: Operator,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        Self {
            key: key.into(),
            operator,
            values: values.into_iter().map(Into::into).collect(),
        }
    }
    /// The label key.
    pub fn key(&self) -> &str {
        &self.key
    }
    /// The operator.
    pub fn operator(&self) -> Operator {
        self.operator
    }
    /// The values.
    pub fn values(&self) -> &[String] {
        &self.values
    }

    fn validate(&self) -> Result<(), ResolveError> {
        ensure!(
            !self.key.is_empty(),
            InvalidSelector {
                reason: "requirement key must not be empty"
            }
        );
        match self.operator {
            Operator::In | Operator::NotIn => ensure!(
                !self.values.is_empty(),
                InvalidSelector {
                    reason: format!(
                        "values must be specified for '{}' with operator {}",
                        self.key, self.operator
                    )
                }
            ),
            Operator::Exists | Operator::DoesNotExist => ensure!(
                self.values.is_empty(),
                InvalidSelector {
                    reason: format!(
                        "values may not be specified for '{}' with operator {}",
                        self.key, self.operator
                    )
                }
            ),
        }
        Ok(())
    }

    fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        let value = labels.get(&self.key);
        match self.operator {
            Operator::In => value.map_or(false, |v| self.values.contains(v)),
            Operator::NotIn => value.map_or(true, |v| !self.values.contains(v)),
            Operator::Exists => value.is_some(),
            Operator::DoesNotExist => value.is_none(),
        }
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let values = || {
            let mut values = self.values.clone();
            values.sort();
            values.join(",")
        };
        match self.operator {
            Operator::In => write!(f, "{} in ({})", self.key, values()),
            Operator::NotIn => write!(f, "{} notin ({})", self.key, values()),
            Operator::Exists => write!(f, "{}", self.key),
            Operator::DoesNotExist => write!(f, "!{}", self.key),
        }
    }
}

/// A label query: the exact match labels and the set based requirements must all hold.
/// Displays in the canonical kubernetes form, eg: `app=etcd,tier in (a,b),!canary`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector {
    match_labels: BTreeMap<String, String>,
    match_expressions: Vec<Requirement>,
}

impl LabelSelector {
    /// Modify and return `Self` with the exact match label.
    pub fn with_label<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.match_labels.insert(key.into(), value.into());
        self
    }
    /// Modify and return `Self` with the requirement.
    pub fn with_expression(mut self, requirement: Requirement) -> Self {
        self.match_expressions.push(requirement);
        self
    }
    /// The exact match labels.
    pub fn match_labels(&self) -> &BTreeMap<String, String> {
        &self.match_labels
    }
    /// The set based requirements.
    pub fn match_expressions(&self) -> &[Requirement] {
        &self.match_expressions
    }
    /// True when there's nothing to select on.
    pub fn is_empty(&self) -> bool {
        self.match_labels.is_empty() && self.match_expressions.is_empty()
    }

    /// Check that every requirement is well formed.
    pub fn validate(&self) -> Result<(), ResolveError> {
        ensure!(
            self.match_labels.keys().all(|key| !key.is_empty()),
            InvalidSelector {
                reason: "label key must not be empty"
            }
        );
        self.match_expressions
            .iter()
            .try_for_each(Requirement::validate)
    }

    /// Check whether the given labels are selected by `Self`.
    /// An empty selector selects everything.
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.match_labels
            .iter()
            .all(|(key, value)| labels.get(key) == Some(value))
            && self.match_expressions.iter().all(|r| r.matches(labels))
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("<none>");
        }
        let mut requirements = self
            .match_labels
            .iter()
            .map(|(key, value)| (key.as_str(), format!("{key}={value}")))
            .chain(
                self.match_expressions
                    .iter()
                    .map(|r| (r.key.as_str(), r.to_string())),
            )
            .collect::<Vec<_>>();
        requirements.sort_by(|a, b| a.0.cmp(b.0));

        let requirements = requirements
            .into_iter()
            .map(|(_, requirement)| requirement)
            .collect::<Vec<_>>();
        f.write_str(&requirements.join(","))
    }
}

impl From<BTreeMap<String, String>> for LabelSelector {
    fn from(match_labels: BTreeMap<String, String>) -> Self {
        Self {
            match_labels,
            match_expressions: vec![],
        }
    }
}

impl TryFrom<metav1::LabelSelector> for LabelSelector {
    type Error = ResolveError;

    fn try_from(selector: metav1::LabelSelector) -> Result<Self, Self::Error> {
        let match_expressions = selector
            .match_expressions
            .unwrap_or_default()
            .into_iter()
            .map(|r| {
                Ok(Requirement::new(
                    r.key,
                    r.operator.parse()?,
                    r.values.unwrap_or_default(),
                ))
            })
            .collect::<Result<Vec<_>, ResolveError>>()?;

        Ok(Self {
            match_labels: selector.match_labels.unwrap_or_default(),
            match_expressions,
        })
    }
}
