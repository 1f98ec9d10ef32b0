//! Filter transforms applied before a search is forwarded upstream.

use crate::filter::{FilterError, FilterNode};

/// Filter sent upstream when pruning removes every clause.
pub const UNIVERSAL_FILTER: &str = "(objectClass=*)";

/// Removes every comparison and presence clause on a blocked attribute.
///
/// Attribute names are compared case-insensitively. AND/OR nodes left with one operand are
/// replaced by that operand, nodes left with none are removed, and a NOT whose operand was
/// removed is removed too. Extensible matches are never pruned. If nothing survives the result
/// is [`UNIVERSAL_FILTER`].
///
/// # Errors
///
/// Returns an error if the filter cannot be parsed or the pruned tree cannot be encoded.
pub fn drop_attributes<S: AsRef<str>>(filter: &str, blocked: &[S]) -> Result<String, FilterError> {
    let tree = FilterNode::parse(filter)?;
    let is_blocked = |attribute: &str| {
        blocked
            .iter()
            .any(|name| name.as_ref().eq_ignore_ascii_case(attribute))
    };
    match prune(tree, &is_blocked) {
        Some(node) => node.encode(),
        None => Ok(UNIVERSAL_FILTER.to_string()),
    }
}

/// Turns every disjunction in the filter into a conjunction over the same operands.
///
/// # Errors
///
/// Returns an error if the filter cannot be parsed or re-encoded.
pub fn rewrite_or_to_and(filter: &str) -> Result<String, FilterError> {
    relabel_or(FilterNode::parse(filter)?).encode()
}

fn prune(node: FilterNode, is_blocked: &impl Fn(&str) -> bool) -> Option<FilterNode> {
    match node {
        FilterNode::And(children) => collapse(children, FilterNode::And, is_blocked),
        FilterNode::Or(children) => collapse(children, FilterNode::Or, is_blocked),
        FilterNode::Not(child) => prune(*child, is_blocked).map(|kept| FilterNode::Not(Box::new(kept))),
        FilterNode::Extensible { .. } => Some(node),
        leaf => match leaf.attribute() {
            Some(attribute) if is_blocked(attribute) => None,
            _ => Some(leaf),
        },
    }
}

fn collapse(
    children: Vec<FilterNode>,
    rebuild: fn(Vec<FilterNode>) -> FilterNode,
    is_blocked: &impl Fn(&str) -> bool,
) -> Option<FilterNode> {
    let mut survivors: Vec<FilterNode> = children
        .into_iter()
        .filter_map(|child| prune(child, is_blocked))
        .collect();
    match survivors.len() {
        0 => None,
        1 => survivors.pop(),
        _ => Some(rebuild(survivors)),
    }
}

fn relabel_or(node: FilterNode) -> FilterNode {
    match node {
        FilterNode::And(children) | FilterNode::Or(children) => {
            FilterNode::And(children.into_iter().map(relabel_or).collect())
        }
        FilterNode::Not(child) => FilterNode::Not(Box::new(relabel_or(*child))),
        leaf => leaf,
    }
}

/// Per-backend filter rewriting.
#[derive(Debug, Clone)]
pub struct FilterRewriteEngine {
    blocked: Vec<String>,
    rewrite_or_to_and: bool,
    fail_open: bool,
}

/// The filter to forward plus the transform errors that were tolerated on the way.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rewritten {
    /// Filter to send upstream.
    pub filter: String,
    /// Errors of transforms that fell back to their input.
    pub failures: Vec<FilterError>,
}

impl FilterRewriteEngine {
    /// Creates an engine that fails open.
    pub fn new<I, S>(blocked: I, rewrite_or_to_and: bool) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            blocked: blocked.into_iter().map(Into::into).collect(),
            rewrite_or_to_and,
            fail_open: true,
        }
    }

    /// Whether a transform error falls back to the untransformed filter.
    #[must_use]
    pub const fn with_fail_open(mut self, fail_open: bool) -> Self {
        self.fail_open = fail_open;
        self
    }

    /// Attributes pruned from filters.
    #[must_use]
    pub fn blocked(&self) -> &[String] {
        &self.blocked
    }

    /// Applies attribute dropping and then, when enabled, the OR to AND rewrite.
    ///
    /// # Errors
    ///
    /// Only when fail-open is disabled: the first transform error.
    pub fn rewrite(&self, filter: &str) -> Result<Rewritten, FilterError> {
        let mut failures = Vec::new();
        let mut current = filter.to_string();

        match drop_attributes(&current, &self.blocked) {
            Ok(pruned) => current = pruned,
            Err(err) if self.fail_open => failures.push(err),
            Err(err) => return Err(err),
        }

        if self.rewrite_or_to_and {
            match rewrite_or_to_and(&current) {
                Ok(rewritten) => current = rewritten,
                Err(err) if self.fail_open => failures.push(err),
                Err(err) => return Err(err),
            }
        }

        Ok(Rewritten {
            filter: current,
            failures,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drop_collapses_single_survivor() {
        assert_eq!(
            drop_attributes("(&(objectClass=person)(mobile=123))", &["mobile"]).unwrap(),
            "(objectClass=person)"
        );
    }

    #[test]
    fn drop_keeps_multiple_survivors() {
        assert_eq!(
            drop_attributes("(|(uid=bob)(mail=bob@x.com)(mobile=1))", &["MOBILE"]).unwrap(),
            "(|(uid=bob)(mail=bob@x.com))"
        );
    }

    #[test]
    fn drop_removes_negation_of_blocked_clause() {
        assert_eq!(
            drop_attributes("(&(objectClass=user)(!(mobile=*)))", &["mobile"]).unwrap(),
            "(objectClass=user)"
        );
        assert_eq!(
            drop_attributes("(&(objectClass=user)(!(cn=x)))", &["mobile"]).unwrap(),
            "(&(objectClass=user)(!(cn=x)))"
        );
    }

    #[test]
    fn drop_leaves_extensible_match() {
        assert_eq!(
            drop_attributes("(&(mobile=1)(mobile:dn:=2))", &["mobile"]).unwrap(),
            "(mobile:dn:=2)"
        );
    }

    #[test]
    fn drop_everything_falls_back_to_universal_filter() {
        assert_eq!(
            drop_attributes("(|(uid=bob)(uid=alice))", &["uid"]).unwrap(),
            UNIVERSAL_FILTER
        );
        assert_eq!(drop_attributes("(uid=*)", &["uid"]).unwrap(), UNIVERSAL_FILTER);
    }

    #[test]
    fn drop_reports_parse_errors() {
        assert!(matches!(
            drop_attributes("(uid=bob", &["uid"]),
            Err(FilterError::Parse { .. })
        ));
    }

    #[test]
    fn or_to_and_relabels_recursively() {
        assert_eq!(
            rewrite_or_to_and("(|(uid=bob)(!(|(mail=a)(mail=b))))").unwrap(),
            "(&(uid=bob)(!(&(mail=a)(mail=b))))"
        );
        assert_eq!(rewrite_or_to_and("(uid=bob)").unwrap(), "(uid=bob)");
    }

    #[test]
    fn engine_applies_drop_then_rewrite() {
        let engine = FilterRewriteEngine::new(["mobile"], true);
        let rewritten = engine
            .rewrite("(|(uid=bob)(mobile=1)(mail=bob@x.com))")
            .unwrap();
        assert_eq!(rewritten.filter, "(&(uid=bob)(mail=bob@x.com))");
        assert!(rewritten.failures.is_empty());
    }

    #[test]
    fn engine_without_rewrite_keeps_disjunctions() {
        let engine = FilterRewriteEngine::new(Vec::<String>::new(), false);
        let rewritten = engine.rewrite("(|(uid=bob)(mail=bob@x.com))").unwrap();
        assert_eq!(rewritten.filter, "(|(uid=bob)(mail=bob@x.com))");
    }

    #[test]
    fn engine_fails_open_by_default() {
        let engine = FilterRewriteEngine::new(["mobile"], true);
        let rewritten = engine.rewrite("(uid=bob").unwrap();
        assert_eq!(rewritten.filter, "(uid=bob");
        assert_eq!(rewritten.failures.len(), 2);
    }

    #[test]
    fn engine_strict_mode_rejects() {
        let engine = FilterRewriteEngine::new(["mobile"], false).with_fail_open(false);
        assert!(engine.rewrite("(uid=bob").is_err());
        assert_eq!(engine.blocked(), ["mobile".to_string()]);
    }
}
