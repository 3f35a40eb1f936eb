use tracing::debug;
use crate::core::error::{Error, Result};
use crate::core::types::Value;
use crate::query::condition::{Comparator, Condition, Leaf, Operator};
use crate::query::estimator::CostEstimator;
use crate::query::types::SearchRequest;
use crate::schema::schema::Relationship;
use crate::search::{IndexState, SearchContext};

/// Query planner creates execution plans
pub struct QueryPlanner<'a> {
    ctx: &'a SearchContext,
    sort_attribute: Option<&'a str>,
}

/// Physical execution plan
#[derive(Debug, Clone)]
pub enum Plan {
    /// Every record in primary key order, optionally filtered.
    FullScan { filter: Option<Condition>, reverse: bool },
    /// One leaf answered by the primary store or a secondary index.
    IndexRange { leaf: Leaf, reverse: bool },
    /// `inner` runs on the related collection; its hits are mapped back
    /// through the relationship attribute.
    Join { attribute: String, collection: String, inner: Box<Plan> },
    /// The driver produces candidates, each filter narrows them in order.
    Intersect { driver: Box<Plan>, filters: Vec<FilterStep> },
    /// Deduplicated concatenation.
    Union { inputs: Vec<Plan> },
    SortInMemory { attribute: String, descending: bool, input: Box<Plan> },
}

/// One trailing operand of an intersection.
#[derive(Debug, Clone)]
pub struct FilterStep {
    pub condition: Condition,
    /// Estimated number of candidates reaching this step.
    pub incoming: f64,
    /// Estimated matches of the condition on its own.
    pub estimate: f64,
}

impl<'a> QueryPlanner<'a> {
    pub fn new(ctx: &'a SearchContext) -> Self {
        QueryPlanner { ctx, sort_attribute: None }
    }

    /// Plan a whole request, including its ordering.
    pub fn plan(ctx: &SearchContext, request: &SearchRequest) -> Result<Plan> {
        let sort = request.sort.as_ref();
        let planner = QueryPlanner {
            ctx,
            sort_attribute: sort.map(|s| s.attribute.as_str()),
        };
        let plan = match (&request.condition, sort) {
            (Some(condition), _) => planner.plan_condition(condition)?,
            (None, Some(sort)) => planner.plan_condition(&Condition::sort(&sort.attribute, sort.descending()))?,
            (None, None) => planner.full_scan(None, false, "no condition")?,
        };
        Ok(match sort {
            Some(sort) => planner.order_by(plan, &sort.attribute, sort.descending()),
            None => plan,
        })
    }

    pub fn plan_condition(&self, condition: &Condition) -> Result<Plan> {
        match condition {
            Condition::Leaf(leaf) if leaf.is_path() => self.plan_path(leaf),
            Condition::Leaf(leaf) => self.plan_leaf(condition, leaf),
            Condition::Group(group) => match group.operator {
                Operator::Or => {
                    for child in &group.conditions {
                        if self.needs_full_scan(child)? {
                            return self.full_scan(Some(condition.clone()), false, "or with an unindexed branch");
                        }
                    }
                    let inputs = group
                        .conditions
                        .iter()
                        .map(|c| self.plan_condition(c))
                        .collect::<Result<Vec<_>>>()?;
                    Ok(Plan::Union { inputs })
                }
                Operator::And => match group.conditions.as_slice() {
                    [] => self.full_scan(None, false, "empty and"),
                    [only] => self.plan_condition(only),
                    children => self.plan_intersection(condition, children),
                },
            },
        }
    }

    fn plan_intersection(&self, condition: &Condition, children: &[Condition]) -> Result<Plan> {
        let estimator = CostEstimator::new(self.ctx, self.sort_attribute);
        let mut scored = Vec::with_capacity(children.len());
        for child in children {
            scored.push((estimator.estimate(child)?, self.needs_full_scan(child)?, child));
        }
        // cheapest operand that can drive without scanning everything
        let driver = scored
            .iter()
            .enumerate()
            .filter(|(_, (_, full_scan, _))| !full_scan)
            .min_by(|(_, (a, _, _)), (_, (b, _, _))| a.total_cmp(b))
            .map(|(i, _)| i);
        let Some(driver) = driver else {
            return self.full_scan(Some(condition.clone()), false, "no indexed operand");
        };
        let (driver_estimate, _, driver_condition) = scored.remove(driver);
        let driver = self.plan_condition(driver_condition)?;

        scored.sort_by(|a, b| a.0.total_cmp(&b.0));
        let total = self.ctx.stats.total()?.max(1) as f64;
        let mut incoming = if driver_estimate.is_finite() { driver_estimate } else { total };
        let mut filters = Vec::with_capacity(scored.len());
        for (estimate, _, child) in scored {
            filters.push(FilterStep {
                condition: child.clone(),
                incoming,
                estimate,
            });
            incoming *= (estimate / total).min(1.0);
        }
        Ok(Plan::Intersect {
            driver: Box::new(driver),
            filters,
        })
    }

    fn plan_leaf(&self, condition: &Condition, leaf: &Leaf) -> Result<Plan> {
        let name = leaf.name();
        if leaf.comparator == Comparator::Sort {
            if self.ctx.schema.is_primary_key(name) {
                return self.full_scan(None, leaf.descending, "sort on identity");
            }
            if self.sort_indexable(name) {
                self.allow_full_scan("sort")?;
                return Ok(Plan::IndexRange {
                    leaf: leaf.clone(),
                    reverse: leaf.descending,
                });
            }
            return Ok(Plan::SortInMemory {
                attribute: name.to_string(),
                descending: leaf.descending,
                input: Box::new(self.full_scan(None, false, "sort on unindexed attribute")?),
            });
        }
        if self.index_usable(leaf) {
            Ok(Plan::IndexRange {
                leaf: leaf.clone(),
                reverse: false,
            })
        } else {
            self.full_scan(Some(condition.clone()), false, "unindexed condition")
        }
    }

    fn plan_path(&self, leaf: &Leaf) -> Result<Plan> {
        let (_, relationship) = self.ctx.relationship(leaf.name())?;
        if let Relationship::From { local_attribute, .. } = relationship {
            if self.ctx.index_state(local_attribute) == IndexState::Missing {
                self.allow_full_scan("join on an unindexed foreign key")?;
            }
        }
        let related = self.ctx.related(relationship.collection())?;
        let inner = QueryPlanner::new(&related).plan_condition(&Condition::Leaf(leaf.tail()))?;
        Ok(Plan::Join {
            attribute: leaf.name().to_string(),
            collection: relationship.collection().to_string(),
            inner: Box::new(inner),
        })
    }

    /// True when the condition cannot be answered from an index.
    pub fn needs_full_scan(&self, condition: &Condition) -> Result<bool> {
        match condition {
            Condition::Leaf(leaf) if leaf.is_path() => {
                let (_, relationship) = self.ctx.relationship(leaf.name())?;
                if let Relationship::From { local_attribute, .. } = relationship {
                    if self.ctx.index_state(local_attribute) == IndexState::Missing {
                        return Ok(true);
                    }
                }
                let related = self.ctx.related(relationship.collection())?;
                QueryPlanner::new(&related).needs_full_scan(&Condition::Leaf(leaf.tail()))
            }
            Condition::Leaf(leaf) => Ok(leaf.comparator == Comparator::Sort || !self.index_usable(leaf)),
            Condition::Group(group) => {
                let mut any = false;
                let mut all = true;
                for child in &group.conditions {
                    let full = self.needs_full_scan(child)?;
                    any |= full;
                    all &= full;
                }
                Ok(match group.operator {
                    Operator::And => all,
                    Operator::Or => any,
                })
            }
        }
    }

    fn index_usable(&self, leaf: &Leaf) -> bool {
        let comparator_ok = match leaf.comparator {
            Comparator::NotEqual => matches!(leaf.value, Some(Value::Null)),
            Comparator::Contains | Comparator::EndsWith | Comparator::Sort => false,
            _ => true,
        };
        comparator_ok && self.ctx.index_state(leaf.name()) != IndexState::Missing
    }

    /// An index yields every record in attribute order only when each
    /// record has exactly one entry in it.
    fn sort_indexable(&self, attribute: &str) -> bool {
        match self.ctx.index_state(attribute) {
            IndexState::Primary => true,
            IndexState::Missing => false,
            IndexState::Ready | IndexState::Building => self
                .ctx
                .schema
                .attribute(attribute)
                .is_some_and(|a| !a.is_multi_valued() && a.index_nulls),
        }
    }

    fn allow_full_scan(&self, reason: &str) -> Result<()> {
        if self.ctx.allow_full_scan {
            debug!(collection = %self.ctx.collection, reason, "full-scan fallback");
            Ok(())
        } else {
            Err(Error::client(format!(
                "Query on {} requires a full scan ({}) and full scans are not allowed",
                self.ctx.collection, reason
            )))
        }
    }

    fn full_scan(&self, filter: Option<Condition>, reverse: bool, reason: &str) -> Result<Plan> {
        self.allow_full_scan(reason)?;
        Ok(Plan::FullScan { filter, reverse })
    }

    fn orders_by(&self, plan: &Plan, attribute: &str) -> bool {
        match plan {
            Plan::FullScan { .. } => self.ctx.schema.is_primary_key(attribute),
            Plan::IndexRange { leaf, .. } => {
                leaf.name() == attribute
                    && (self.ctx.schema.is_primary_key(attribute) || !self.ctx.is_multi_valued(attribute))
            }
            Plan::Intersect { driver, .. } => self.orders_by(driver, attribute),
            Plan::SortInMemory { attribute: sorted, .. } => sorted == attribute,
            Plan::Join { .. } | Plan::Union { .. } => false,
        }
    }

    fn order_by(&self, plan: Plan, attribute: &str, descending: bool) -> Plan {
        if !self.orders_by(&plan, attribute) {
            return Plan::SortInMemory {
                attribute: attribute.to_string(),
                descending,
                input: Box::new(plan),
            };
        }
        reorient(plan, descending)
    }
}

fn reorient(plan: Plan, descending: bool) -> Plan {
    match plan {
        Plan::FullScan { filter, .. } => Plan::FullScan { filter, reverse: descending },
        Plan::IndexRange { leaf, .. } => Plan::IndexRange { leaf, reverse: descending },
        Plan::Intersect { driver, filters } => Plan::Intersect {
            driver: Box::new(reorient(*driver, descending)),
            filters,
        },
        Plan::SortInMemory { attribute, input, .. } => Plan::SortInMemory { attribute, descending, input },
        other => other,
    }
}
