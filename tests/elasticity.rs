//! Elasticity policy scenarios: percentile selection over a telemetry
//! epoch, colocation with a referenced parent, and rule loading from the
//! JSON configuration surface.

use std::collections::{BTreeMap, BTreeSet};

use contexture::elasticity::{
    propose_actions, AndConditions, Behavior, BehaviorKind, Comparator, Condition, ConditionKind,
    ContextTelemetry, ElasticityConfig, MigrationHint, Resource, Rule, RuleKind, ServerTelemetry,
};
use contexture::mapping::MappingSnapshot;
use contexture::types::{ContextName, NodeAddr, GLOBAL_CONTEXT};
use contexture::OwnershipStructure;

fn name(s: &str) -> ContextName {
    ContextName::new(s)
}

fn server(addr: &str, usage: f64) -> ServerTelemetry {
    ServerTelemetry {
        addr: NodeAddr::new(addr),
        cpu_usage: usage,
        total_cpu_time_us: 1_000_000.0,
        client_requests: 0,
        hosted_contexts: 5,
    }
}

fn telemetry(ctx: &str, addr: &str, accesses: u64) -> ContextTelemetry {
    let mut t = ContextTelemetry {
        context: name(ctx),
        addr: NodeAddr::new(addr),
        exec_time_us: 10_000,
        ..ContextTelemetry::default()
    };
    t.from_access_counts.insert(name("App.Client[1]"), accesses);
    t
}

#[test]
fn compare_me_at_080_selects_top_fifth_of_five() {
    // Five contexts with distinct access counts. COMPARE at >= 0.8 over
    // the access-count percentile keeps exactly the top 20%.
    let condition = Condition {
        kind: ConditionKind::AccessCountPercent,
        comparator: Comparator::GreaterEq,
        context_types: BTreeSet::new(),
        marker: String::new(),
        threshold: 0.8,
    };
    let epoch: BTreeMap<ContextName, ContextTelemetry> = (1..=5)
        .map(|i| {
            let ctx = format!("App.Worker[{i}]");
            (name(&ctx), telemetry(&ctx, "n1", i * 100))
        })
        .collect();
    let check: BTreeSet<ContextName> = epoch.keys().cloned().collect();

    let satisfied = condition.satisfied(
        &epoch,
        &server("n1", 50.0),
        &check,
        &OwnershipStructure::new(),
    );
    assert_eq!(satisfied, BTreeSet::from([name("App.Worker[5]")]));
}

#[test]
fn compare_le_selects_the_cold_tail() {
    let condition = Condition {
        kind: ConditionKind::AccessCountPercent,
        comparator: Comparator::LessEq,
        context_types: BTreeSet::new(),
        marker: String::new(),
        threshold: 0.2,
    };
    let epoch: BTreeMap<ContextName, ContextTelemetry> = (1..=5)
        .map(|i| {
            let ctx = format!("App.Worker[{i}]");
            (name(&ctx), telemetry(&ctx, "n1", i * 100))
        })
        .collect();
    let check: BTreeSet<ContextName> = epoch.keys().cloned().collect();

    let satisfied = condition.satisfied(
        &epoch,
        &server("n1", 50.0),
        &check,
        &OwnershipStructure::new(),
    );
    // Ranks 0.0 and 0.2 both sit in the <= 0.2 tail.
    assert_eq!(
        satisfied,
        BTreeSet::from([name("App.Worker[1]"), name("App.Worker[2]")])
    );
}

#[test]
fn colocate_moves_context_to_its_parent_node() {
    let structure = OwnershipStructure::with_edges([
        (name(GLOBAL_CONTEXT), name("App.Table[1]")),
        (name("App.Table[1]"), name("App.Row[7]")),
    ]);

    let reference = Condition {
        kind: ConditionKind::Reference,
        comparator: Comparator::GreaterEq,
        context_types: ["Row".to_owned(), "Table".to_owned()].into(),
        marker: String::new(),
        threshold: 0.0,
    };
    let rule = Rule {
        kind: RuleKind::Actor,
        priority: 1,
        conditions: vec![AndConditions {
            conditions: vec![reference],
        }],
        related_context_types: ["Row".to_owned()].into(),
        behavior: Behavior {
            kind: BehaviorKind::Colocate,
            resource: Resource::Cpu,
            context_types: Vec::new(),
            context_names: Vec::new(),
        },
    };

    // The row lives on n1; its table lives on a lightly loaded n2.
    let row = telemetry("App.Row[7]", "n1", 50);
    let mapping = MappingSnapshot {
        entries: [
            (name("App.Table[1]"), NodeAddr::new("n2")),
            (name("App.Row[7]"), NodeAddr::new("n1")),
        ]
        .into(),
        head: NodeAddr::new("n1"),
        version: 3,
    };
    let servers: BTreeMap<NodeAddr, ServerTelemetry> = [
        (NodeAddr::new("n1"), server("n1", 80.0)),
        (NodeAddr::new("n2"), server("n2", 30.0)),
    ]
    .into();

    let action = rule
        .generate_action(&row, &mapping, &structure, &servers, &NodeAddr::new("n1"))
        .expect("parent node can accept the row");
    assert_eq!(action.target, NodeAddr::new("n2"));
    assert_eq!(action.hint, MigrationHint::BusyCpu);
}

#[test]
fn full_cycle_from_json_policy() {
    let policy = ElasticityConfig::from_json(
        r#"{
            "rules": [{
                "kind": "actor",
                "priority": 3,
                "related_context_types": ["Worker"],
                "conditions": [{ "conditions": [
                    { "kind": "server_cpu_usage", "comparator": "greater_eq", "threshold": 70.0 },
                    { "kind": "access_count_percent", "comparator": "greater_eq", "threshold": 0.8 }
                ]}],
                "behavior": { "kind": "isolate", "resource": "cpu" }
            }]
        }"#,
    )
    .expect("policy parses");

    let epoch: BTreeMap<ContextName, ContextTelemetry> = (1..=5)
        .map(|i| {
            let ctx = format!("App.Worker[{i}]");
            (name(&ctx), telemetry(&ctx, "n1", i * 100))
        })
        .collect();
    let servers: BTreeMap<NodeAddr, ServerTelemetry> = [
        (NodeAddr::new("n1"), server("n1", 85.0)),
        (NodeAddr::new("n2"), server("n2", 20.0)),
    ]
    .into();
    let mapping = MappingSnapshot {
        entries: BTreeMap::new(),
        head: NodeAddr::new("n1"),
        version: 1,
    };

    let actions = propose_actions(
        &policy,
        &epoch,
        &servers,
        &mapping,
        &OwnershipStructure::new(),
        &NodeAddr::new("n1"),
    );
    // Only the hottest worker passes both conjuncts; it moves off the
    // busy node.
    assert_eq!(actions.len(), 1);
    assert_eq!(actions[0].context, name("App.Worker[5]"));
    assert_eq!(actions[0].target, NodeAddr::new("n2"));

    // On an idle node the CPU condition fails and nothing moves.
    let idle_servers: BTreeMap<NodeAddr, ServerTelemetry> = [
        (NodeAddr::new("n1"), server("n1", 10.0)),
        (NodeAddr::new("n2"), server("n2", 20.0)),
    ]
    .into();
    let actions = propose_actions(
        &policy,
        &epoch,
        &idle_servers,
        &mapping,
        &OwnershipStructure::new(),
        &NodeAddr::new("n1"),
    );
    assert!(actions.is_empty());
}
