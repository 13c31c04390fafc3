//! Filters over stored chunks.
//!
//! Two kinds of filter travel with every query:
//!
//! - a **metadata filter** ([`MetadataFilter`]): exact equality on metadata
//!   keys, all of which must hold;
//! - a list of **content filters** ([`WhereDocument`]): a recursive boolean
//!   tree over the chunk text. Top-level entries are AND-ed.
//!
//! Backends that can push filters into their query language do so (see the
//! SQLite vectorstore); the rest evaluate [`WhereDocument::matches`] in
//! process. Both must produce the same result set.
//!
//! The wire form mirrors the operator names used by the original Chroma
//! style API:
//!
//! ```json
//! {"$and": [{"$contains": "rust"}, {"$not_contains": "python"}]}
//! ```

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::models::Document;

/// Metadata equality filter: key → expected value.
pub type MetadataFilter = HashMap<String, String>;

/// Recursive boolean filter over document content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WhereDocument {
    #[serde(rename = "$eq")]
    Equals(String),
    #[serde(rename = "$contains")]
    Contains(String),
    #[serde(rename = "$not_contains")]
    NotContains(String),
    #[serde(rename = "$and")]
    And(Vec<WhereDocument>),
    #[serde(rename = "$or")]
    Or(Vec<WhereDocument>),
}

impl WhereDocument {
    pub fn operator(&self) -> &'static str {
        match self {
            WhereDocument::Equals(_) => "$eq",
            WhereDocument::Contains(_) => "$contains",
            WhereDocument::NotContains(_) => "$not_contains",
            WhereDocument::And(_) => "$and",
            WhereDocument::Or(_) => "$or",
        }
    }

    /// Decode the JSON wire form, rejecting empty or unknown operators.
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        if value.as_object().is_some_and(|o| o.is_empty()) {
            return Err(Error::InvalidFilter(
                "where document operator is empty".to_string(),
            ));
        }
        let wd: WhereDocument = serde_json::from_value(value)
            .map_err(|e| Error::InvalidFilter(format!("unsupported where document: {}", e)))?;
        wd.validate()?;
        Ok(wd)
    }

    /// Check the tree is well formed: leaves carry a value and boolean
    /// nodes have at least one child, at every depth.
    pub fn validate(&self) -> Result<()> {
        match self {
            WhereDocument::Equals(v) | WhereDocument::Contains(v) | WhereDocument::NotContains(v) => {
                if v.is_empty() {
                    return Err(Error::InvalidFilter(format!(
                        "where document operator {} requires a value",
                        self.operator()
                    )));
                }
                Ok(())
            }
            WhereDocument::And(children) | WhereDocument::Or(children) => {
                if children.is_empty() {
                    return Err(Error::InvalidFilter(format!(
                        "where document operator {} must have at least one sub-filter",
                        self.operator()
                    )));
                }
                children.iter().try_for_each(WhereDocument::validate)
            }
        }
    }

    /// Evaluate the filter against a document's content.
    ///
    /// Assumes [`validate`](Self::validate) already passed.
    pub fn matches(&self, doc: &Document) -> bool {
        match self {
            WhereDocument::Equals(v) => doc.content == *v,
            WhereDocument::Contains(v) => doc.content.contains(v.as_str()),
            WhereDocument::NotContains(v) => !doc.content.contains(v.as_str()),
            WhereDocument::And(children) => children.iter().all(|c| c.matches(doc)),
            WhereDocument::Or(children) => children.iter().any(|c| c.matches(doc)),
        }
    }

    /// Turn a keyword list into content filters.
    ///
    /// Plain keywords become one `$or` group of `$contains`; keywords with a
    /// leading `-` become one `$and` group of `$not_contains`. Each group is
    /// only emitted when non-empty, and the groups are siblings (AND-ed).
    pub fn from_keywords<S: AsRef<str>>(keywords: &[S]) -> Vec<WhereDocument> {
        let mut include = Vec::new();
        let mut exclude = Vec::new();
        for kw in keywords.iter().map(AsRef::as_ref) {
            match kw.strip_prefix('-') {
                Some(rest) if !rest.is_empty() => {
                    exclude.push(WhereDocument::NotContains(rest.to_string()))
                }
                Some(_) => {}
                None if !kw.is_empty() => include.push(WhereDocument::Contains(kw.to_string())),
                None => {}
            }
        }

        let mut filters = Vec::new();
        if !include.is_empty() {
            filters.push(WhereDocument::Or(include));
        }
        if !exclude.is_empty() {
            filters.push(WhereDocument::And(exclude));
        }
        filters
    }
}

pub fn validate_all(filters: &[WhereDocument]) -> Result<()> {
    filters.iter().try_for_each(WhereDocument::validate)
}

/// True when the document passes every top-level content filter.
pub fn matches_all(filters: &[WhereDocument], doc: &Document) -> bool {
    filters.iter().all(|f| f.matches(doc))
}

/// True when every key in `filter` equals the document's metadata value.
pub fn matches_metadata(filter: &MetadataFilter, doc: &Document) -> bool {
    filter
        .iter()
        .all(|(k, v)| doc.metadata_str(k).as_deref() == Some(v.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(content: &str) -> Document {
        Document::new(content)
    }

    #[test]
    fn test_validate_rejects_empty_leaf_value() {
        for wd in [
            WhereDocument::Equals(String::new()),
            WhereDocument::Contains(String::new()),
            WhereDocument::NotContains(String::new()),
        ] {
            let err = wd.validate().unwrap_err();
            assert!(matches!(err, Error::InvalidFilter(_)));
            assert!(err.to_string().contains(wd.operator()));
        }
    }

    #[test]
    fn test_validate_rejects_childless_groups() {
        assert!(WhereDocument::And(vec![]).validate().is_err());
        assert!(WhereDocument::Or(vec![]).validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_operator() {
        let err = WhereDocument::from_value(json!({})).unwrap_err();
        assert!(err.to_string().contains("operator is empty"));
        assert!(WhereDocument::from_value(json!({"": "x"})).is_err());
        assert!(WhereDocument::from_value(json!({"$regex": "x"})).is_err());
    }

    #[test]
    fn test_validate_rejects_nested_invalid() {
        let wd = WhereDocument::And(vec![
            WhereDocument::Contains("a".into()),
            WhereDocument::Or(vec![WhereDocument::Equals(String::new())]),
        ]);
        assert!(wd.validate().is_err());
    }

    #[test]
    fn test_validate_accepts_deep_tree() {
        let mut wd = WhereDocument::Contains("leaf".into());
        for depth in 0..64 {
            wd = if depth % 2 == 0 {
                WhereDocument::And(vec![wd, WhereDocument::NotContains("x".into())])
            } else {
                WhereDocument::Or(vec![WhereDocument::Equals("y".into()), wd])
            };
        }
        assert!(wd.validate().is_ok());
    }

    #[test]
    fn test_from_value_decodes_nested() {
        let wd = WhereDocument::from_value(json!({
            "$and": [{"$contains": "rust"}, {"$not_contains": "python"}]
        }))
        .unwrap();
        assert_eq!(
            wd,
            WhereDocument::And(vec![
                WhereDocument::Contains("rust".into()),
                WhereDocument::NotContains("python".into()),
            ])
        );
    }

    #[test]
    fn test_or_matches_either() {
        let wd = WhereDocument::Or(vec![
            WhereDocument::Contains("a".into()),
            WhereDocument::Contains("b".into()),
        ]);
        assert!(wd.matches(&doc("xax")));
        assert!(wd.matches(&doc("xbx")));
        assert!(wd.matches(&doc("ab")));
        assert!(!wd.matches(&doc("xyz")));
    }

    #[test]
    fn test_and_with_not_contains() {
        let wd = WhereDocument::And(vec![
            WhereDocument::Contains("a".into()),
            WhereDocument::NotContains("b".into()),
        ]);
        assert!(wd.matches(&doc("xax")));
        assert!(!wd.matches(&doc("ab")));
        assert!(!wd.matches(&doc("xyz")));
        assert!(!wd.matches(&doc("b")));
    }

    #[test]
    fn test_equals_is_exact_and_case_sensitive() {
        let wd = WhereDocument::Equals("Hello".into());
        assert!(wd.matches(&doc("Hello")));
        assert!(!wd.matches(&doc("hello")));
        assert!(!wd.matches(&doc("Hello world")));
    }

    #[test]
    fn test_keywords_to_filters() {
        let filters = WhereDocument::from_keywords(&["foo", "-bar"]);
        assert_eq!(
            filters,
            vec![
                WhereDocument::Or(vec![WhereDocument::Contains("foo".into())]),
                WhereDocument::And(vec![WhereDocument::NotContains("bar".into())]),
            ]
        );
        assert!(validate_all(&filters).is_ok());
        assert!(matches_all(&filters, &doc("foo baz")));
        assert!(!matches_all(&filters, &doc("foo bar")));
        assert!(!matches_all(&filters, &doc("baz")));
    }

    #[test]
    fn test_keywords_only_negative() {
        let filters = WhereDocument::from_keywords(&["-x", "-", ""]);
        assert_eq!(
            filters,
            vec![WhereDocument::And(vec![WhereDocument::NotContains("x".into())])]
        );
    }

    #[test]
    fn test_metadata_filter() {
        let d = doc("x")
            .with_metadata("absPath", "/tmp/a.md")
            .with_metadata("fileSize", 12);
        let mut f = MetadataFilter::new();
        f.insert("absPath".into(), "/tmp/a.md".into());
        assert!(matches_metadata(&f, &d));
        f.insert("fileSize".into(), "12".into());
        assert!(matches_metadata(&f, &d));
        f.insert("missing".into(), "y".into());
        assert!(!matches_metadata(&f, &d));
    }
}
