use std::sync::Arc;
use crate::core::error::{Error, Result};
use crate::core::transaction::TransactionSet;

/// Operation classes gated by the authorization layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Permission {
    Read,
    Write,
    Delete,
}

/// Per-request state handed to every collection operation.
///
/// Authorization happens before the core runs; the context only carries
/// the verdict and an optional restriction of the attributes a search may
/// return. The open Transaction Set, if any, is attached here by
/// [`crate::core::transaction::transaction`].
#[derive(Default)]
pub struct RequestContext {
    pub authorized: bool,
    pub select_restriction: Option<Vec<String>>,
    pub(crate) transaction: Option<Arc<TransactionSet>>,
}

impl RequestContext {
    /// An authorized context with no restrictions.
    pub fn new() -> Self {
        RequestContext {
            authorized: true,
            select_restriction: None,
            transaction: None,
        }
    }

    pub fn unauthorized() -> Self {
        RequestContext {
            authorized: false,
            ..Default::default()
        }
    }

    pub fn with_select_restriction(mut self, attributes: Vec<String>) -> Self {
        self.select_restriction = Some(attributes);
        self
    }

    pub fn check(&self, permission: Permission) -> Result<()> {
        if self.authorized {
            Ok(())
        } else {
            Err(Error::forbidden(format!("{:?} not permitted for this request", permission)))
        }
    }

    pub fn transaction(&self) -> Option<&Arc<TransactionSet>> {
        self.transaction.as_ref()
    }

    pub fn in_transaction(&self) -> bool {
        self.transaction.is_some()
    }

    /// Attributes a search may return: the requested list narrowed by the
    /// permission restriction.
    pub fn narrow_select(&self, requested: Option<&[String]>) -> Option<Vec<String>> {
        match (requested, &self.select_restriction) {
            (None, None) => None,
            (Some(requested), None) => Some(requested.to_vec()),
            (None, Some(allowed)) => Some(allowed.clone()),
            (Some(requested), Some(allowed)) => Some(
                requested
                    .iter()
                    .filter(|name| allowed.contains(name))
                    .cloned()
                    .collect(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::ErrorKind;

    #[test]
    fn unauthorized_context_is_forbidden() {
        let err = RequestContext::unauthorized().check(Permission::Read).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Forbidden);
        assert!(RequestContext::new().check(Permission::Delete).is_ok());
    }

    #[test]
    fn restriction_narrows_requested_select() {
        let ctx = RequestContext::new().with_select_restriction(vec!["a".into(), "b".into()]);
        let requested = vec!["b".to_string(), "c".to_string()];
        assert_eq!(ctx.narrow_select(Some(&requested)), Some(vec!["b".to_string()]));
        assert_eq!(ctx.narrow_select(None), Some(vec!["a".to_string(), "b".to_string()]));
        assert_eq!(RequestContext::new().narrow_select(None), None);
    }
}
