//! Attribute name translation between a backend's schema and the one clients expect.

use ldap_proxy_core::types::DirectoryEntry;
use std::collections::HashMap;
use tracing::{debug, warn};

const RULE_SEPARATOR: &str = "<->";

/// Symmetric attribute rename table built from `A<->B` rules.
#[derive(Debug, Clone, Default)]
pub struct AttributeRenamer {
    table: HashMap<String, String>,
}

impl AttributeRenamer {
    /// Builds the table from `A<->B` rules.
    ///
    /// Each rule adds both `A -> B` and `B -> A`. Rules that do not split into exactly two
    /// non-empty names are logged and skipped. A later rule overrides an earlier one for the same
    /// name.
    pub fn from_rules<I, S>(rules: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut table = HashMap::new();
        for rule in rules {
            let rule = rule.as_ref();
            match parse_rule(rule) {
                Some((left, right)) => {
                    debug!(left, right, "registered attribute swap");
                    table.insert(left.to_string(), right.to_string());
                    table.insert(right.to_string(), left.to_string());
                }
                None => warn!(rule, "ignoring invalid attribute swap rule"),
            }
        }
        Self { table }
    }

    /// Returns the translated name, or `None` when no rule applies.
    ///
    /// Lookup is case-sensitive.
    #[must_use]
    pub fn after_swap(&self, name: &str) -> Option<&str> {
        self.table.get(name).map(String::as_str)
    }

    /// Number of names with a translation.
    #[must_use]
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// Whether the table has no rules.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Renames the attributes of an entry, keeping value sets and order untouched.
    #[must_use]
    pub fn rename_entry(&self, mut entry: DirectoryEntry) -> DirectoryEntry {
        for attribute in &mut entry.attributes {
            if let Some(renamed) = self.after_swap(&attribute.name) {
                attribute.name = renamed.to_string();
            }
        }
        entry
    }
}

fn parse_rule(rule: &str) -> Option<(&str, &str)> {
    let mut parts = rule.split(RULE_SEPARATOR);
    let left = parts.next()?.trim();
    let right = parts.next()?.trim();
    if parts.next().is_some() || left.is_empty() || right.is_empty() {
        return None;
    }
    Some((left, right))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ldap_proxy_core::types::EntryAttribute;

    #[test]
    fn rules_are_symmetric() {
        let renamer = AttributeRenamer::from_rules(["uid<->sAMAccountName", "mobile<->telephoneNumber"]);
        assert_eq!(renamer.after_swap("uid"), Some("sAMAccountName"));
        assert_eq!(renamer.after_swap("sAMAccountName"), Some("uid"));
        assert_eq!(renamer.after_swap("mobile"), Some("telephoneNumber"));
        assert_eq!(renamer.after_swap("telephoneNumber"), Some("mobile"));
        assert_eq!(renamer.len(), 4);
    }

    #[test]
    fn unknown_names_pass_through() {
        let renamer = AttributeRenamer::from_rules(["uid<->sAMAccountName"]);
        assert_eq!(renamer.after_swap("mail"), None);
        assert_eq!(renamer.after_swap("UID"), None);
    }

    #[test]
    fn invalid_rules_are_skipped() {
        let renamer = AttributeRenamer::from_rules([
            "uid",
            "a<->b<->c",
            "<->cn",
            "  ",
            " mail <-> userPrincipalName ",
        ]);
        assert_eq!(renamer.len(), 2);
        assert_eq!(renamer.after_swap("mail"), Some("userPrincipalName"));
        assert_eq!(renamer.after_swap("cn"), None);
    }

    #[test]
    fn empty_rule_list() {
        let renamer = AttributeRenamer::from_rules(Vec::<String>::new());
        assert!(renamer.is_empty());
    }

    #[test]
    fn rename_entry_keeps_values_and_order() {
        let renamer = AttributeRenamer::from_rules(["uid<->sAMAccountName"]);
        let entry = DirectoryEntry::new(
            "cn=bob,dc=example,dc=com",
            vec![
                EntryAttribute::new("sAMAccountName", ["bob"]),
                EntryAttribute::new("mail", ["bob@example.com"]),
            ],
        );

        let renamed = renamer.rename_entry(entry);
        assert_eq!(renamed.attribute_names(), vec!["uid", "mail"]);
        assert_eq!(renamed.attributes[0].values, vec![b"bob".to_vec()]);
        assert_eq!(renamed.dn, "cn=bob,dc=example,dc=com");
    }
}
