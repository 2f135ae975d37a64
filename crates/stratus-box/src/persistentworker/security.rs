use std::collections::HashSet;
use stratus_core::{IsolationKind, Result, StratusError};

/// Which isolation kinds a persistent worker is willing to run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SecurityPolicy {
    /// `None` allows everything.
    allowed: Option<HashSet<IsolationKind>>,
}

impl SecurityPolicy {
    pub fn no_security() -> Self {
        Self { allowed: None }
    }

    pub fn allow_only(kinds: impl IntoIterator<Item = IsolationKind>) -> Self {
        Self {
            allowed: Some(kinds.into_iter().collect()),
        }
    }

    pub fn allows(&self, kind: IsolationKind) -> bool {
        self.allowed.as_ref().map_or(true, |allowed| allowed.contains(&kind))
    }

    pub fn check(&self, kind: IsolationKind) -> Result<()> {
        if self.allows(kind) {
            Ok(())
        } else {
            Err(StratusError::CreateInstance(format!(
                "{} isolation is not allowed by this worker's security settings",
                kind
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_security_allows_everything() {
        let policy = SecurityPolicy::no_security();
        for kind in [
            IsolationKind::None,
            IsolationKind::Tart,
            IsolationKind::Parallels,
            IsolationKind::Container,
        ] {
            assert!(policy.check(kind).is_ok());
        }
    }

    #[test]
    fn test_allow_list_rejects_others() {
        let policy = SecurityPolicy::allow_only([IsolationKind::Tart]);
        assert!(policy.check(IsolationKind::Tart).is_ok());

        let err = policy.check(IsolationKind::None).unwrap_err();
        assert!(err.is_construction_failure());
        assert!(err.to_string().contains("none isolation"));
    }
}
