//! Per-service allow-lists of method names, keyed by caller domain.

use std::borrow::Cow;
use std::collections::{HashMap, HashSet};

use crate::AuthDomain;

/// Static mapping `AuthDomain -> {method names}` for one service.
///
/// Lookups are exact and case-sensitive; there are no wildcards. The table is
/// assembled once with [`CapabilityTable::allow`] and never mutated afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapabilityTable {
    allowed: HashMap<AuthDomain, HashSet<Cow<'static, str>>>,
}

impl CapabilityTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Permit `methods` for callers in `domain`.
    pub fn allow<I, M>(mut self, domain: AuthDomain, methods: I) -> Self
    where
        I: IntoIterator<Item = M>,
        M: Into<Cow<'static, str>>,
    {
        self.allowed
            .entry(domain)
            .or_default()
            .extend(methods.into_iter().map(Into::into));
        self
    }

    /// Pure lookup: is `method` callable from `domain`?
    pub fn is_allowed(&self, domain: AuthDomain, method: &str) -> bool {
        self.allowed
            .get(&domain)
            .is_some_and(|methods| methods.contains(method))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn db_table() -> CapabilityTable {
        CapabilityTable::new()
            .allow(AuthDomain::Super, ["create", "get_progress", "drop"])
            .allow(AuthDomain::Anonymous, ["db_exist", "list"])
    }

    #[test]
    fn allows_only_listed_domain_method_pairs() {
        let table = db_table();

        assert!(table.is_allowed(AuthDomain::Super, "drop"));
        assert!(!table.is_allowed(AuthDomain::Anonymous, "drop"));
        assert!(!table.is_allowed(AuthDomain::Authenticated, "drop"));
        assert!(table.is_allowed(AuthDomain::Anonymous, "list"));
    }

    #[test]
    fn lookup_is_exact_and_case_sensitive() {
        let table = db_table();

        assert!(!table.is_allowed(AuthDomain::Super, "Drop"));
        assert!(!table.is_allowed(AuthDomain::Super, "drop "));
        assert!(!table.is_allowed(AuthDomain::Super, "*"));
        assert!(!table.is_allowed(AuthDomain::Super, ""));
    }

    #[test]
    fn empty_table_allows_nothing() {
        let table = CapabilityTable::new();
        for domain in AuthDomain::ALL {
            assert!(!table.is_allowed(domain, "list"));
        }
    }

    proptest! {
        #[test]
        fn unlisted_methods_are_never_allowed(method in "[a-zA-Z_]{1,16}") {
            let table = db_table();
            let listed = ["create", "get_progress", "drop", "db_exist", "list"].contains(&method.as_str());
            for domain in AuthDomain::ALL {
                if !listed {
                    prop_assert!(!table.is_allowed(domain, &method));
                }
            }
        }
    }
}
