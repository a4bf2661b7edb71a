//! Attribute filter predicates for subscriptions.
//!
//! A [`FilterPredicate`] names one envelope attribute and the values it may
//! take. An envelope that lacks the attribute never matches.

use crate::event::{Envelope, MetadataAttribute, METADATA_TYPE_ATTRIBUTE};
use std::collections::BTreeSet;
use std::fmt;

/// Allowlist over a single envelope attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterPredicate {
    attribute: String,
    allowlist: BTreeSet<String>,
}

impl FilterPredicate {
    /// Match envelopes whose `attribute` is one of `values`.
    pub fn allowlist<I, S>(attribute: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            attribute: attribute.into(),
            allowlist: values.into_iter().map(Into::into).collect(),
        }
    }

    /// `metadata_type ∈ {Caption, Date, Photographer}`
    pub fn metadata_types() -> Self {
        Self::allowlist(
            METADATA_TYPE_ATTRIBUTE,
            MetadataAttribute::ALL.iter().map(|attr| attr.as_str()),
        )
    }

    pub fn attribute(&self) -> &str {
        &self.attribute
    }

    pub fn values(&self) -> impl Iterator<Item = &str> {
        self.allowlist.iter().map(|s| s.as_str())
    }

    /// True iff the envelope carries the attribute with an allowlisted value.
    pub fn matches(&self, envelope: &Envelope) -> bool {
        envelope
            .attribute(&self.attribute)
            .is_some_and(|value| self.allowlist.contains(value))
    }
}

impl fmt::Display for FilterPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let values: Vec<&str> = self.values().collect();
        write!(f, "{} in [{}]", self.attribute, values.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tagged(value: &str) -> Envelope {
        Envelope::new("{}").with_attribute(METADATA_TYPE_ATTRIBUTE, value)
    }

    #[test]
    fn test_metadata_types_allowlist() {
        let filter = FilterPredicate::metadata_types();
        assert!(filter.matches(&tagged("Caption")));
        assert!(filter.matches(&tagged("Date")));
        assert!(filter.matches(&tagged("Photographer")));
        assert!(!filter.matches(&tagged("Other")));
        // Case-sensitive
        assert!(!filter.matches(&tagged("caption")));
    }

    #[test]
    fn test_missing_attribute_never_matches() {
        let filter = FilterPredicate::metadata_types();
        assert!(!filter.matches(&Envelope::new("{}")));
    }

    #[test]
    fn test_display() {
        let filter = FilterPredicate::allowlist("color", ["red", "blue"]);
        assert_eq!(filter.to_string(), "color in [blue, red]");
    }
}
