//! Telemetry-driven context placement.
//!
//! [`telemetry`] records per-context and per-node load; [`rule`] holds
//! the declarative policy and its pure evaluator. [`propose_actions`]
//! ties them together: one evaluation cycle over one epoch of snapshots,
//! producing at most one proposed migration per context.

pub mod rule;
pub mod telemetry;

use std::collections::{BTreeMap, BTreeSet};

pub use rule::{
    Action, AndConditions, Behavior, BehaviorKind, Comparator, Condition, ConditionKind,
    ElasticityConfig, MigrationHint, Resource, Rule, RuleKind,
};
pub use telemetry::{ContextRuntimeInfo, ContextTelemetry, MarkerStats, ServerTelemetry};

use crate::mapping::MappingSnapshot;
use crate::ownership::OwnershipStructure;
use crate::types::{ContextName, NodeAddr};

/// Runs one evaluation cycle.
///
/// For every locally hosted context, the applicable rules are tried in
/// priority order; the first rule whose conditions the context satisfies
/// and whose behavior finds a profitable move contributes one action.
/// Contradictory proposals ([`Action::conflicts_with`]) are then pruned,
/// keeping the higher-benefit side of each conflict. All inputs must
/// come from the same capture epoch.
#[must_use]
pub fn propose_actions(
    config: &ElasticityConfig,
    telemetry: &BTreeMap<ContextName, ContextTelemetry>,
    servers: &BTreeMap<NodeAddr, ServerTelemetry>,
    mapping: &MappingSnapshot,
    structure: &OwnershipStructure,
    local: &NodeAddr,
) -> Vec<Action> {
    let check: BTreeSet<ContextName> = telemetry
        .iter()
        .filter(|(_, t)| t.addr == *local)
        .map(|(name, _)| name.clone())
        .collect();
    let Some(server) = servers.get(local) else {
        return Vec::new();
    };

    let mut actions = Vec::new();
    for ctx_name in &check {
        let ctx = &telemetry[ctx_name];
        for rule in config.rules_for(ctx_name.type_name()) {
            let satisfied = rule.satisfied(telemetry, server, &check, structure);
            if !satisfied.contains(ctx_name) {
                continue;
            }
            if let Some(action) = rule.generate_action(ctx, mapping, structure, servers, local) {
                actions.push(action);
                break;
            }
        }
    }

    actions.sort_by(|a, b| b.benefit.total_cmp(&a.benefit));
    let mut kept: Vec<Action> = Vec::new();
    for action in actions {
        if kept.iter().all(|k| !k.conflicts_with(&action)) {
            kept.push(action);
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_proposes_one_action_per_hot_context() {
        let json = r#"{
            "rules": [{
                "kind": "actor",
                "priority": 1,
                "related_context_types": ["ANY"],
                "conditions": [{ "conditions": [{
                    "kind": "access_count_percent",
                    "comparator": "greater_eq",
                    "threshold": 0.8
                }]}],
                "behavior": { "kind": "isolate", "resource": "cpu" }
            }]
        }"#;
        let config = ElasticityConfig::from_json(json).expect("parse");

        let mut telemetry = BTreeMap::new();
        for (i, accesses) in [10_u64, 20, 30, 40, 50].iter().enumerate() {
            let name = ContextName::new(format!("App.C[{i}]"));
            let mut t = ContextTelemetry {
                context: name.clone(),
                addr: NodeAddr::new("n1"),
                exec_time_us: 50_000,
                ..ContextTelemetry::default()
            };
            t.from_access_counts.insert(ContextName::new("peer"), *accesses);
            telemetry.insert(name, t);
        }

        let server = |addr: &str, usage: f64| ServerTelemetry {
            addr: NodeAddr::new(addr),
            cpu_usage: usage,
            total_cpu_time_us: 1_000_000.0,
            client_requests: 0,
            hosted_contexts: 5,
        };
        let servers: BTreeMap<NodeAddr, ServerTelemetry> = [
            (NodeAddr::new("n1"), server("n1", 80.0)),
            (NodeAddr::new("n2"), server("n2", 10.0)),
        ]
        .into();
        let mapping = MappingSnapshot {
            entries: BTreeMap::new(),
            head: NodeAddr::new("n1"),
            version: 1,
        };

        let actions = propose_actions(
            &config,
            &telemetry,
            &servers,
            &mapping,
            &OwnershipStructure::new(),
            &NodeAddr::new("n1"),
        );
        // The 0.8 percentile keeps only the hottest context; it migrates.
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].context, ContextName::new("App.C[4]"));
        assert_eq!(actions[0].target, NodeAddr::new("n2"));
        assert_eq!(actions[0].hint, MigrationHint::IdleCpu);
    }

    #[test]
    fn cycle_drops_the_weaker_of_two_conflicting_moves() {
        // Threshold 0.6 over five distinct counts passes the top two
        // contexts; both want the one idle node, so only the move with
        // the larger projected benefit survives the cycle.
        let json = r#"{
            "rules": [{
                "kind": "actor",
                "priority": 1,
                "related_context_types": ["ANY"],
                "conditions": [{ "conditions": [{
                    "kind": "access_count_percent",
                    "comparator": "greater_eq",
                    "threshold": 0.6
                }]}],
                "behavior": { "kind": "isolate", "resource": "cpu" }
            }]
        }"#;
        let config = ElasticityConfig::from_json(json).expect("parse");

        let mut telemetry = BTreeMap::new();
        for (i, (accesses, exec)) in [
            (10_u64, 50_000_u64),
            (20, 50_000),
            (30, 50_000),
            (40, 50_000),
            (50, 30_000),
        ]
        .iter()
        .enumerate()
        {
            let name = ContextName::new(format!("App.C[{i}]"));
            let mut t = ContextTelemetry {
                context: name.clone(),
                addr: NodeAddr::new("n1"),
                exec_time_us: *exec,
                ..ContextTelemetry::default()
            };
            t.from_access_counts.insert(ContextName::new("peer"), *accesses);
            telemetry.insert(name, t);
        }

        let server = |addr: &str, usage: f64| ServerTelemetry {
            addr: NodeAddr::new(addr),
            cpu_usage: usage,
            total_cpu_time_us: 1_000_000.0,
            client_requests: 0,
            hosted_contexts: 5,
        };
        let servers: BTreeMap<NodeAddr, ServerTelemetry> = [
            (NodeAddr::new("n1"), server("n1", 80.0)),
            (NodeAddr::new("n2"), server("n2", 10.0)),
        ]
        .into();
        let mapping = MappingSnapshot {
            entries: BTreeMap::new(),
            head: NodeAddr::new("n1"),
            version: 1,
        };

        let actions = propose_actions(
            &config,
            &telemetry,
            &servers,
            &mapping,
            &OwnershipStructure::new(),
            &NodeAddr::new("n1"),
        );
        // App.C[4] projects the cheaper move (67 vs 65 points of
        // benefit) and wins the contested target.
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].context, ContextName::new("App.C[4]"));
        assert_eq!(actions[0].target, NodeAddr::new("n2"));
    }
}
