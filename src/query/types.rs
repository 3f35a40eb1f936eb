use serde::{Deserialize, Serialize};
use crate::core::error::Result;
use crate::query::condition::Condition;

/// Sort order for query results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortOrder {
    Asc,   // Ascending: 0 → 9, A → Z
    Desc,  // Descending: 9 → 0, Z → A
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sort {
    pub attribute: String,
    pub order: SortOrder,
}

impl Sort {
    pub fn descending(&self) -> bool {
        self.order == SortOrder::Desc
    }
}

/// One search against a collection.
#[derive(Debug, Clone, Default)]
pub struct SearchRequest {
    pub condition: Option<Condition>,
    pub sort: Option<Sort>,
    pub offset: usize,
    pub limit: Option<usize>,
    pub select: Option<Vec<String>>,
    /// Overrides `Config::allow_full_scan` for this request.
    pub allow_full_scan: Option<bool>,
}

impl SearchRequest {
    pub fn new(condition: Condition) -> Self {
        SearchRequest {
            condition: Some(condition),
            ..Default::default()
        }
    }

    /// Every record, in primary key order.
    pub fn all() -> Self {
        SearchRequest::default()
    }

    pub fn sort_by(mut self, attribute: &str, order: SortOrder) -> Self {
        self.sort = Some(Sort {
            attribute: attribute.to_string(),
            order,
        });
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn select(mut self, attributes: &[&str]) -> Self {
        self.select = Some(attributes.iter().map(|s| s.to_string()).collect());
        self
    }

    pub fn allow_full_scan(mut self, allow: bool) -> Self {
        self.allow_full_scan = Some(allow);
        self
    }

    /// Validate the condition and rewrite wildcard patterns. Runs before
    /// planning so malformed requests fail without touching the store.
    pub fn normalized(mut self) -> Result<Self> {
        if let Some(condition) = self.condition.take() {
            let condition = condition.rewrite_wildcards()?;
            condition.validate()?;
            self.condition = Some(condition);
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::condition::Comparator;

    #[test]
    fn normalization_rewrites_and_validates() {
        let request = SearchRequest::new(Condition::equals("name", "ab*")).normalized().unwrap();
        let leaf = request.condition.as_ref().and_then(Condition::as_leaf).unwrap();
        assert_eq!(leaf.comparator, Comparator::StartsWith);
        assert!(SearchRequest::new(Condition::leaf("a", Comparator::Between, 1)).normalized().is_err());
    }
}
