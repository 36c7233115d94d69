//! Declarative placement rules and their evaluation.
//!
//! A [`Rule`] pairs an ordered list of AND-condition groups with one
//! behavior. Evaluation is pure: [`Rule::generate_action`] reads a set of
//! [`ContextTelemetry`] and [`ServerTelemetry`] snapshots (all captured
//! at the same instant) and returns at most one proposed migration, never
//! mutating anything. A rule that finds no profitable move returns
//! `None`, which is the normal case, not an error.
//!
//! Rules are loaded from JSON, e.g.:
//!
//! ```json
//! {
//!   "rules": [{
//!     "kind": "actor",
//!     "priority": 1,
//!     "related_context_types": ["Room"],
//!     "conditions": [{ "conditions": [{
//!       "kind": "access_count_percent",
//!       "comparator": "greater_eq",
//!       "threshold": 0.8
//!     }]}],
//!     "behavior": { "kind": "isolate", "resource": "cpu" }
//!   }]
//! }
//! ```

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::elasticity::telemetry::{ContextTelemetry, ServerTelemetry};
use crate::error::{Error, ErrorKind, Result};
use crate::mapping::MappingSnapshot;
use crate::ownership::OwnershipStructure;
use crate::types::{ContextName, NodeAddr};

/// Projected CPU usage above which a colocation target is too busy to
/// accept a context, percent.
pub const CPU_BUSY_THRESHOLD: f64 = 70.0;

/// Metric a condition inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionKind {
    /// The context's type name matches one of the condition's types.
    ContextType,
    /// The context has an ownership parent of the paired type.
    Reference,
    /// Percentile of total received-access count among all peers.
    AccessCountPercent,
    /// Percentile of client-request count among all peers.
    EventAccessCountPercent,
    /// The hosting server's CPU usage.
    ServerCpuUsage,
    /// Mean marker latency percentile. Reserved; matches nothing.
    MarkerLatencyPercent,
}

/// How a metric is compared against the threshold. Only `GreaterEq` and
/// `LessEq` participate in evaluation; the others are accepted in rule
/// files but match nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparator {
    /// Equal.
    Eq,
    /// Strictly less.
    Lt,
    /// Greater or equal (percentile membership).
    GreaterEq,
    /// Less or equal.
    LessEq,
}

/// One metric comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    /// The inspected metric.
    pub kind: ConditionKind,
    /// The comparison against `threshold`.
    pub comparator: Comparator,
    /// Context types the condition relates; for [`ConditionKind::Reference`]
    /// exactly two: the context's own type and the parent type.
    #[serde(default)]
    pub context_types: BTreeSet<String>,
    /// Marker name for latency conditions.
    #[serde(default)]
    pub marker: String,
    /// Comparison threshold; percentiles are fractions in `[0, 1]`,
    /// CPU usage is percent.
    pub threshold: f64,
}

impl Condition {
    /// Subset of `check` satisfying the condition against one epoch of
    /// telemetry.
    #[must_use]
    pub fn satisfied(
        &self,
        telemetry: &BTreeMap<ContextName, ContextTelemetry>,
        server: &ServerTelemetry,
        check: &BTreeSet<ContextName>,
        structure: &OwnershipStructure,
    ) -> BTreeSet<ContextName> {
        let mut satisfied = BTreeSet::new();
        if check.is_empty() {
            return satisfied;
        }
        match self.kind {
            ConditionKind::ContextType => {
                for ctx in check {
                    if self.context_types.contains(ctx.type_name()) {
                        satisfied.insert(ctx.clone());
                    }
                }
            }
            ConditionKind::AccessCountPercent => {
                self.percentile_pass(check, telemetry, &mut satisfied, |t| {
                    t.total_from_access_count()
                });
            }
            ConditionKind::EventAccessCountPercent => {
                self.percentile_pass(check, telemetry, &mut satisfied, |t| t.client_requests);
            }
            ConditionKind::ServerCpuUsage => {
                if self.comparator == Comparator::GreaterEq && server.cpu_usage >= self.threshold
                {
                    satisfied.extend(check.iter().cloned());
                }
            }
            ConditionKind::Reference => {
                for ctx in check {
                    if !self.reference_parents(structure, ctx).is_empty() {
                        satisfied.insert(ctx.clone());
                    }
                }
            }
            ConditionKind::MarkerLatencyPercent => {
                warn!(marker = %self.marker, "marker latency conditions are not evaluated");
            }
        }
        satisfied
    }

    /// Percentile membership: a context's rank is the fraction of
    /// measured peers with a strictly smaller metric. `GreaterEq` passes
    /// ranks at or above the threshold; `LessEq` the opposite tail. With
    /// five distinct counts and a 0.8 threshold, exactly the top context
    /// (the top 20%) ranks at 0.8 and passes.
    fn percentile_pass(
        &self,
        check: &BTreeSet<ContextName>,
        telemetry: &BTreeMap<ContextName, ContextTelemetry>,
        satisfied: &mut BTreeSet<ContextName>,
        metric: impl Fn(&ContextTelemetry) -> u64,
    ) {
        if check.len() <= 1 || telemetry.is_empty() {
            return;
        }
        let counts: BTreeMap<&ContextName, u64> =
            telemetry.iter().map(|(name, t)| (name, metric(t))).collect();
        for ctx in check {
            let Some(&own) = counts.get(ctx) else {
                continue;
            };
            let below = counts.values().filter(|&&peer| own > peer).count();
            let percent = below as f64 / counts.len() as f64;
            debug!(context = %ctx, percent, "percentile condition");
            let passes = match self.comparator {
                Comparator::GreaterEq => percent >= self.threshold,
                Comparator::LessEq => percent <= self.threshold,
                Comparator::Eq | Comparator::Lt => false,
            };
            if passes {
                satisfied.insert(ctx.clone());
            }
        }
    }

    /// Ownership parents of `ctx` matching the condition's paired type.
    #[must_use]
    pub fn reference_parents(
        &self,
        structure: &OwnershipStructure,
        ctx: &ContextName,
    ) -> Vec<ContextName> {
        let Some(parent_type) = self.paired_type(ctx) else {
            return Vec::new();
        };
        structure
            .parents_of(ctx)
            .into_iter()
            .filter(|p| p.type_name() == parent_type)
            .collect()
    }

    /// For a two-type reference condition, the type paired with `ctx`'s.
    fn paired_type(&self, ctx: &ContextName) -> Option<&str> {
        if self.kind != ConditionKind::Reference || self.context_types.len() != 2 {
            return None;
        }
        let own = ctx.type_name();
        let mut types = self.context_types.iter();
        let first = types.next()?.as_str();
        let second = types.next()?.as_str();
        if own == first {
            Some(second)
        } else if own == second {
            Some(first)
        } else {
            None
        }
    }
}

/// Conditions that must all hold (set intersection over evaluation).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AndConditions {
    /// The conjunct conditions.
    pub conditions: Vec<Condition>,
}

impl AndConditions {
    /// Contexts from `check` satisfying every conjunct.
    #[must_use]
    pub fn satisfied(
        &self,
        telemetry: &BTreeMap<ContextName, ContextTelemetry>,
        server: &ServerTelemetry,
        check: &BTreeSet<ContextName>,
        structure: &OwnershipStructure,
    ) -> BTreeSet<ContextName> {
        let mut remaining = check.clone();
        for condition in &self.conditions {
            if remaining.is_empty() {
                break;
            }
            remaining = condition.satisfied(telemetry, server, &remaining, structure);
        }
        remaining
    }

    fn reference_condition(&self) -> Option<&Condition> {
        self.conditions
            .iter()
            .find(|c| c.kind == ConditionKind::Reference)
    }
}

/// What a matched rule does with the satisfying contexts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BehaviorKind {
    /// Move the context next to a referenced parent.
    Colocate,
    /// Keep the contexts on distinct nodes.
    Separate,
    /// Never migrate the context.
    Pin,
    /// Move the context to the least-loaded other node.
    Isolate,
    /// Even out resource load across nodes.
    WorkloadBalance,
    /// Even out context counts across nodes.
    NumberBalance,
}

/// Resource dimension a behavior optimizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resource {
    /// CPU time.
    Cpu,
    /// Network / request volume.
    Net,
}

/// The action half of a rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Behavior {
    /// What to do.
    pub kind: BehaviorKind,
    /// The resource dimension, where the behavior needs one.
    #[serde(default = "default_resource")]
    pub resource: Resource,
    /// Context types the behavior names explicitly.
    #[serde(default)]
    pub context_types: Vec<String>,
    /// Individual contexts the behavior names explicitly.
    #[serde(default)]
    pub context_names: Vec<ContextName>,
}

fn default_resource() -> Resource {
    Resource::Cpu
}

/// Placement constraint attached to a proposed migration, hinting the
/// receiving monitor at why the target was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationHint {
    /// Target had the most idle CPU.
    IdleCpu,
    /// Target had the lightest request load.
    IdleNet,
    /// Source shed load off a busy CPU.
    BusyCpu,
}

/// A proposed migration with its expected benefit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    /// The context to move.
    pub context: ContextName,
    /// Where to move it.
    pub target: NodeAddr,
    /// Expected benefit in the behavior's resource dimension.
    pub benefit: f64,
    /// Why the target qualifies.
    pub hint: MigrationHint,
}

impl Action {
    /// True when this proposal cannot be applied alongside `other`:
    /// both move the same context, or both claim the same target's
    /// idle headroom. All projections in a cycle were computed against
    /// one capture, so stacking two moves onto one idle node would
    /// invalidate the numbers that justified them.
    #[must_use]
    pub fn conflicts_with(&self, other: &Action) -> bool {
        if self.context == other.context {
            return true;
        }
        self.target == other.target
            && matches!(self.hint, MigrationHint::IdleCpu | MigrationHint::IdleNet)
            && matches!(other.hint, MigrationHint::IdleCpu | MigrationHint::IdleNet)
    }
}

/// Rule classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    /// Evaluated per context against its peers.
    Actor,
    /// Evaluated once over the whole node.
    Global,
    /// Chooses a context's first placement; never migrates.
    InitPlacement,
}

/// One declarative placement rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    /// Rule classification.
    pub kind: RuleKind,
    /// Evaluation priority; higher wins when proposals conflict.
    #[serde(default)]
    pub priority: u16,
    /// AND-groups, each independently sufficient (OR over groups).
    pub conditions: Vec<AndConditions>,
    /// Context types the rule applies to; `"ANY"` matches all.
    pub related_context_types: BTreeSet<String>,
    /// What to do with the satisfying contexts.
    pub behavior: Behavior,
}

impl Rule {
    /// True if the rule applies to contexts of `context_type`.
    #[must_use]
    pub fn applies_to(&self, context_type: &str) -> bool {
        self.related_context_types.contains(context_type)
            || self.related_context_types.contains("ANY")
    }

    /// Contexts from `check` satisfying at least one AND-group.
    #[must_use]
    pub fn satisfied(
        &self,
        telemetry: &BTreeMap<ContextName, ContextTelemetry>,
        server: &ServerTelemetry,
        check: &BTreeSet<ContextName>,
        structure: &OwnershipStructure,
    ) -> BTreeSet<ContextName> {
        let mut satisfied = BTreeSet::new();
        for group in &self.conditions {
            satisfied.extend(group.satisfied(telemetry, server, check, structure));
        }
        satisfied
    }

    /// Proposes at most one migration for `ctx` under this rule's
    /// behavior. Pure: the inputs are one epoch of telemetry, and
    /// `None` means "no profitable move", never an error.
    #[must_use]
    pub fn generate_action(
        &self,
        ctx: &ContextTelemetry,
        mapping: &MappingSnapshot,
        structure: &OwnershipStructure,
        servers: &BTreeMap<NodeAddr, ServerTelemetry>,
        local: &NodeAddr,
    ) -> Option<Action> {
        match (self.behavior.kind, self.behavior.resource) {
            (BehaviorKind::Isolate, Resource::Cpu) => {
                self.isolate_cpu(ctx, servers, local)
            }
            (BehaviorKind::Isolate, Resource::Net) => {
                self.isolate_net(ctx, servers, local)
            }
            (BehaviorKind::Colocate, _) => self.colocate(ctx, mapping, structure, servers, local),
            (BehaviorKind::Pin, _) => None,
            _ => {
                debug!(behavior = ?self.behavior.kind, "behavior proposes no per-context action");
                None
            }
        }
    }

    /// Move a hot context to the other node whose projected CPU usage
    /// after accepting it is lowest, provided that beats staying put.
    fn isolate_cpu(
        &self,
        ctx: &ContextTelemetry,
        servers: &BTreeMap<NodeAddr, ServerTelemetry>,
        local: &NodeAddr,
    ) -> Option<Action> {
        if ctx.total_from_access_count() == 0 {
            return None;
        }
        let local_usage = servers.get(local)?.cpu_usage;
        let mut best: Option<(NodeAddr, f64)> = None;
        for (addr, server) in servers {
            if addr == local {
                continue;
            }
            let accept = server.usage_after_adding(ctx.exec_time_us as f64);
            if accept <= local_usage && best.as_ref().map_or(true, |(_, b)| accept < *b) {
                best = Some((addr.clone(), accept));
            }
        }
        let (target, accept) = best?;
        if accept >= 100.0 {
            return None;
        }
        let benefit = local_usage - accept;
        debug!(context = %ctx.context, target = %target, benefit, "isolate (cpu)");
        Some(Action {
            context: ctx.context.clone(),
            target,
            benefit,
            hint: MigrationHint::IdleCpu,
        })
    }

    /// Move a request-heavy context to the node with the lightest
    /// combined request load.
    fn isolate_net(
        &self,
        ctx: &ContextTelemetry,
        servers: &BTreeMap<NodeAddr, ServerTelemetry>,
        local: &NodeAddr,
    ) -> Option<Action> {
        let local_requests = servers.get(local)?.client_requests;
        let mut best: Option<(NodeAddr, u64)> = None;
        for (addr, server) in servers {
            if addr == local {
                continue;
            }
            let accept = ctx.client_requests + server.client_requests;
            if accept < local_requests && best.as_ref().map_or(true, |(_, b)| accept < *b) {
                best = Some((addr.clone(), accept));
            }
        }
        let (target, accept) = best?;
        let benefit = (local_requests - accept) as f64;
        debug!(context = %ctx.context, target = %target, benefit, "isolate (net)");
        Some(Action {
            context: ctx.context.clone(),
            target,
            benefit,
            hint: MigrationHint::IdleNet,
        })
    }

    /// Move the context next to a referenced ownership parent whose node
    /// is not already too busy to take it.
    fn colocate(
        &self,
        ctx: &ContextTelemetry,
        mapping: &MappingSnapshot,
        structure: &OwnershipStructure,
        servers: &BTreeMap<NodeAddr, ServerTelemetry>,
        local: &NodeAddr,
    ) -> Option<Action> {
        let mut parents = Vec::new();
        for group in &self.conditions {
            if let Some(condition) = group.reference_condition() {
                parents.extend(condition.reference_parents(structure, &ctx.context));
            }
        }
        let mut best: Option<(NodeAddr, f64)> = None;
        for parent in parents {
            let Some(addr) = mapping.entries.get(&parent) else {
                continue;
            };
            if addr == local {
                continue;
            }
            let Some(server) = servers.get(addr) else {
                continue;
            };
            let accept = server.usage_after_removing(ctx.exec_time_us as f64);
            if accept < CPU_BUSY_THRESHOLD && best.as_ref().map_or(true, |(_, b)| accept < *b) {
                best = Some((addr.clone(), accept));
            }
        }
        let (target, accept) = best?;
        debug!(context = %ctx.context, target = %target, "colocate with parent");
        Some(Action {
            context: ctx.context.clone(),
            target,
            benefit: accept,
            hint: MigrationHint::BusyCpu,
        })
    }
}

/// All rules configured for a node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ElasticityConfig {
    /// The configured rules.
    pub rules: Vec<Rule>,
}

impl ElasticityConfig {
    /// Parses a rule file from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| {
            Error::new(ErrorKind::InvalidRule)
                .with_message("elasticity rule file rejected")
                .with_source(e)
        })
    }

    /// Rules applicable to `context_type`, highest priority first.
    #[must_use]
    pub fn rules_for(&self, context_type: &str) -> Vec<&Rule> {
        let mut rules: Vec<&Rule> = self
            .rules
            .iter()
            .filter(|r| r.kind != RuleKind::InitPlacement && r.applies_to(context_type))
            .collect();
        rules.sort_by(|a, b| b.priority.cmp(&a.priority));
        rules
    }

    /// The initial-placement rule for `context_type`, if configured.
    #[must_use]
    pub fn initial_placement(&self, context_type: &str) -> Option<&Rule> {
        self.rules
            .iter()
            .find(|r| r.kind == RuleKind::InitPlacement && r.applies_to(context_type))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> ContextName {
        ContextName::new(s)
    }

    fn telemetry_with_accesses(counts: &[(&str, u64)]) -> BTreeMap<ContextName, ContextTelemetry> {
        counts
            .iter()
            .map(|(ctx, n)| {
                let mut t = ContextTelemetry {
                    context: name(ctx),
                    addr: NodeAddr::new("n1"),
                    ..ContextTelemetry::default()
                };
                t.from_access_counts.insert(name("peer"), *n);
                (name(ctx), t)
            })
            .collect()
    }

    fn access_percent_rule(threshold: f64) -> Rule {
        Rule {
            kind: RuleKind::Actor,
            priority: 1,
            conditions: vec![AndConditions {
                conditions: vec![Condition {
                    kind: ConditionKind::AccessCountPercent,
                    comparator: Comparator::GreaterEq,
                    context_types: BTreeSet::new(),
                    marker: String::new(),
                    threshold,
                }],
            }],
            related_context_types: ["ANY".to_owned()].into(),
            behavior: Behavior {
                kind: BehaviorKind::Isolate,
                resource: Resource::Cpu,
                context_types: Vec::new(),
                context_names: Vec::new(),
            },
        }
    }

    #[test]
    fn access_percentile_selects_top_fraction() {
        // Five contexts with distinct access counts; threshold 0.8 keeps
        // exactly the top 20%.
        let telemetry = telemetry_with_accesses(&[
            ("App.C[1]", 10),
            ("App.C[2]", 20),
            ("App.C[3]", 30),
            ("App.C[4]", 40),
            ("App.C[5]", 50),
        ]);
        let check: BTreeSet<ContextName> = telemetry.keys().cloned().collect();
        let rule = access_percent_rule(0.8);
        let server = ServerTelemetry::default();
        let structure = OwnershipStructure::new();

        let satisfied = rule.satisfied(&telemetry, &server, &check, &structure);
        // Ranks are 0.0, 0.2, 0.4, 0.6, 0.8; only the hottest context
        // reaches the 0.8 threshold.
        assert_eq!(satisfied.len(), 1);
        assert!(satisfied.contains(&name("App.C[5]")));
    }

    #[test]
    fn single_context_percentile_matches_nothing() {
        let telemetry = telemetry_with_accesses(&[("App.C[1]", 10)]);
        let check: BTreeSet<ContextName> = telemetry.keys().cloned().collect();
        let rule = access_percent_rule(0.5);
        let satisfied = rule.satisfied(
            &telemetry,
            &ServerTelemetry::default(),
            &check,
            &OwnershipStructure::new(),
        );
        assert!(satisfied.is_empty());
    }

    #[test]
    fn isolate_cpu_picks_least_loaded_acceptor() {
        let mut ctx = ContextTelemetry {
            context: name("App.C[1]"),
            addr: NodeAddr::new("n1"),
            exec_time_us: 100_000,
            ..ContextTelemetry::default()
        };
        ctx.from_access_counts.insert(name("peer"), 5);

        let server = |addr: &str, usage: f64| ServerTelemetry {
            addr: NodeAddr::new(addr),
            cpu_usage: usage,
            total_cpu_time_us: 1_000_000.0,
            client_requests: 0,
            hosted_contexts: 1,
        };
        let servers: BTreeMap<NodeAddr, ServerTelemetry> = [
            (NodeAddr::new("n1"), server("n1", 90.0)),
            (NodeAddr::new("n2"), server("n2", 40.0)),
            (NodeAddr::new("n3"), server("n3", 20.0)),
        ]
        .into();

        let rule = access_percent_rule(0.0);
        let mapping = MappingSnapshot {
            entries: BTreeMap::new(),
            head: NodeAddr::new("n1"),
            version: 1,
        };
        let action = rule
            .generate_action(
                &ctx,
                &mapping,
                &OwnershipStructure::new(),
                &servers,
                &NodeAddr::new("n1"),
            )
            .expect("profitable move exists");
        // n3 projects to 30% after accepting; n2 to 50%.
        assert_eq!(action.target, NodeAddr::new("n3"));
        assert!((action.benefit - 60.0).abs() < 1e-9);
        assert_eq!(action.hint, MigrationHint::IdleCpu);
    }

    #[test]
    fn isolate_without_accesses_proposes_nothing() {
        let ctx = ContextTelemetry {
            context: name("App.C[1]"),
            addr: NodeAddr::new("n1"),
            exec_time_us: 100_000,
            ..ContextTelemetry::default()
        };
        let rule = access_percent_rule(0.0);
        let mapping = MappingSnapshot {
            entries: BTreeMap::new(),
            head: NodeAddr::new("n1"),
            version: 1,
        };
        assert!(rule
            .generate_action(
                &ctx,
                &mapping,
                &OwnershipStructure::new(),
                &BTreeMap::new(),
                &NodeAddr::new("n1"),
            )
            .is_none());
    }

    #[test]
    fn conflicting_proposals_are_detected() {
        let action = |ctx: &str, target: &str, hint| Action {
            context: name(ctx),
            target: NodeAddr::new(target),
            benefit: 10.0,
            hint,
        };
        let a = action("App.C[1]", "n2", MigrationHint::IdleCpu);
        // Same context, different destinations.
        assert!(a.conflicts_with(&action("App.C[1]", "n3", MigrationHint::IdleNet)));
        // Different contexts both claiming n2's idle headroom.
        assert!(a.conflicts_with(&action("App.C[2]", "n2", MigrationHint::IdleCpu)));
        // Disjoint contexts and destinations coexist.
        assert!(!a.conflicts_with(&action("App.C[2]", "n3", MigrationHint::IdleCpu)));
        // A colocation onto n2 is not a headroom claim.
        assert!(!a.conflicts_with(&action("App.C[2]", "n2", MigrationHint::BusyCpu)));
    }

    #[test]
    fn rules_parse_from_json_and_sort_by_priority() {
        let json = r#"{
            "rules": [
                {
                    "kind": "actor",
                    "priority": 1,
                    "related_context_types": ["Room"],
                    "conditions": [{ "conditions": [{
                        "kind": "access_count_percent",
                        "comparator": "greater_eq",
                        "threshold": 0.8
                    }]}],
                    "behavior": { "kind": "isolate", "resource": "cpu" }
                },
                {
                    "kind": "actor",
                    "priority": 5,
                    "related_context_types": ["ANY"],
                    "conditions": [{ "conditions": [{
                        "kind": "server_cpu_usage",
                        "comparator": "greater_eq",
                        "threshold": 70.0
                    }]}],
                    "behavior": { "kind": "workload_balance" }
                }
            ]
        }"#;
        let config = ElasticityConfig::from_json(json).expect("parse");
        let rules = config.rules_for("Room");
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].priority, 5);
        assert!(config.initial_placement("Room").is_none());

        let err = ElasticityConfig::from_json("{").expect_err("truncated");
        assert_eq!(err.kind(), ErrorKind::InvalidRule);
    }
}
