//! Depth-first rule dispatch.
//!
//! One top-level mutation is processed with an explicit work stack instead
//! of recursion:
//!
//! ```text
//! Mutate(m)      plan the event, push Apply, then the Pre rules on top
//! Fire(ev, r)    run rule r, push its queued mutations on top
//! Apply(ev)      write to storage, push the Post rules on top
//! ```
//!
//! Everything a rule queues therefore completes before the next rule of the
//! same event runs. A rule never fires twice for the same entity within one
//! top-level mutation; the `(entity id, rule name)` set enforces that for
//! every rule whose `fire_once` is set. The total number of rule invocations
//! is capped to catch runaway rules.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::data::Node;
use crate::error::{GraphError, Result};
use crate::graph::ops;
use crate::graph::Mutation;
use crate::rules::{Entity, EventKind, GraphEvent, Rule, RuleContext, RulePhase, RuleRegistry};
use crate::storage::GraphStorage;

enum Work {
    Mutate(Mutation),
    Apply(Arc<GraphEvent>),
    Fire(Arc<GraphEvent>, Arc<dyn Rule>),
}

pub struct Dispatcher<'a> {
    storage: &'a mut dyn GraphStorage,
    rules: &'a RuleRegistry,
    max_dispatches: usize,
    fired: HashSet<(u128, String)>,
    dispatched: usize,
}

impl<'a> Dispatcher<'a> {
    pub fn new(storage: &'a mut dyn GraphStorage, rules: &'a RuleRegistry, max_dispatches: usize) -> Self {
        Self {
            storage,
            rules,
            max_dispatches,
            fired: HashSet::new(),
            dispatched: 0,
        }
    }

    /// Rule invocations made by the last `run`.
    pub fn dispatched(&self) -> usize {
        self.dispatched
    }

    /// Apply one top-level mutation and everything its rules cause.
    pub fn run(&mut self, mutation: Mutation) -> Result<()> {
        self.fired.clear();
        self.dispatched = 0;

        let mut stack = vec![Work::Mutate(mutation)];
        while let Some(work) = stack.pop() {
            match work {
                Work::Mutate(m) => {
                    m.validate()?;
                    let Some(event) = self.plan(m)? else {
                        continue;
                    };
                    let event = Arc::new(event);
                    stack.push(Work::Apply(Arc::clone(&event)));
                    self.push_fires(&mut stack, &event, RulePhase::Pre);
                }
                Work::Apply(event) => {
                    self.apply(&event)?;
                    self.push_fires(&mut stack, &event, RulePhase::Post);
                }
                Work::Fire(event, rule) => {
                    for derived in self.fire(&event, rule.as_ref())?.into_iter().rev() {
                        stack.push(Work::Mutate(derived));
                    }
                }
            }
        }

        debug!(rules = self.dispatched, "Mutation dispatched");
        Ok(())
    }

    fn push_fires(&self, stack: &mut Vec<Work>, event: &Arc<GraphEvent>, phase: RulePhase) {
        for rule in self.rules.rules_for(event.kind, phase).into_iter().rev() {
            stack.push(Work::Fire(Arc::clone(event), rule));
        }
    }

    /// Turn a mutation into the event it will produce. Removing something
    /// that does not exist produces nothing.
    fn plan(&self, mutation: Mutation) -> Result<Option<GraphEvent>> {
        let st = &*self.storage;
        let event = match mutation {
            Mutation::StoreNode { partition, node } => {
                let previous = ops::fetch_node(st, &partition, &node.key, &node.kind)?;
                node_event(partition, node, previous)
            }
            Mutation::UpdateNode { partition, node } => {
                let previous = ops::fetch_node(st, &partition, &node.key, &node.kind)?;
                let merged = match &previous {
                    Some(existing) => {
                        let mut merged = existing.clone();
                        merged.merge_from(&node);
                        merged
                    }
                    None => node,
                };
                node_event(partition, merged, previous)
            }
            Mutation::RemoveNode { partition, key, kind } => {
                match ops::fetch_node(st, &partition, &key, &kind)? {
                    Some(node) => GraphEvent {
                        kind: EventKind::NodeDeleted,
                        partition,
                        entity: Entity::Node(node),
                        previous: None,
                    },
                    None => return Ok(None),
                }
            }
            Mutation::StoreEdge { partition, edge } => {
                let previous = ops::fetch_edge(st, &partition, &edge.key, &edge.kind)?;
                GraphEvent {
                    kind: if previous.is_some() {
                        EventKind::EdgeUpdated
                    } else {
                        EventKind::EdgeCreated
                    },
                    partition,
                    entity: Entity::Edge(edge),
                    previous: previous.map(Entity::Edge),
                }
            }
            Mutation::RemoveEdge { partition, key, kind } => {
                match ops::fetch_edge(st, &partition, &key, &kind)? {
                    Some(edge) => GraphEvent {
                        kind: EventKind::EdgeDeleted,
                        partition,
                        entity: Entity::Edge(edge),
                        previous: None,
                    },
                    None => return Ok(None),
                }
            }
        };
        Ok(Some(event))
    }

    fn apply(&mut self, event: &GraphEvent) -> Result<()> {
        let part = &event.partition;
        let st = &mut *self.storage;
        match (&event.entity, event.kind) {
            (Entity::Node(node), EventKind::NodeDeleted) => {
                ops::delete_node(st, part, &node.key, &node.kind)?;
            }
            (Entity::Node(node), _) => {
                ops::write_node(st, part, node)?;
            }
            (Entity::Edge(edge), EventKind::EdgeDeleted) => {
                ops::delete_edge(st, part, &edge.key, &edge.kind)?;
            }
            (Entity::Edge(edge), _) => {
                ops::write_edge(st, part, edge)?;
            }
        }
        Ok(())
    }

    fn fire(&mut self, event: &GraphEvent, rule: &dyn Rule) -> Result<Vec<Mutation>> {
        if rule.fire_once() && !self.fired.insert((event.entity_id(), rule.name().to_string())) {
            warn!(
                rule = rule.name(),
                partition = %event.partition,
                event = ?event.kind,
                "Rule already fired for this entity, skipping"
            );
            return Ok(Vec::new());
        }

        self.dispatched += 1;
        if self.dispatched > self.max_dispatches {
            return Err(GraphError::RuleCycle {
                limit: self.max_dispatches,
            });
        }

        let mut ctx = RuleContext::new(&mut *self.storage);
        rule.handle(&mut ctx, event).map_err(|e| match e {
            e @ GraphError::Rule { .. } => e,
            e if e.is_fatal() => e,
            e => GraphError::Rule {
                rule: rule.name().to_string(),
                message: e.to_string(),
            },
        })?;
        Ok(ctx.into_queued())
    }
}

fn node_event(partition: String, node: Node, previous: Option<Node>) -> GraphEvent {
    GraphEvent {
        kind: if previous.is_some() {
            EventKind::NodeUpdated
        } else {
            EventKind::NodeCreated
        },
        partition,
        entity: Entity::Node(node),
        previous: previous.map(Entity::Node),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Edge, EdgeEnd};
    use crate::storage::MemoryStorage;
    use std::sync::Mutex;

    /// Records every invocation as "rule:event:key".
    struct Recorder {
        name: String,
        kinds: Vec<EventKind>,
        phase: RulePhase,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Recorder {
        fn new(name: &str, kinds: &[EventKind], phase: RulePhase, log: &Arc<Mutex<Vec<String>>>) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                kinds: kinds.to_vec(),
                phase,
                log: Arc::clone(log),
            })
        }
    }

    impl Rule for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        fn handles(&self) -> &[EventKind] {
            &self.kinds
        }

        fn phase(&self) -> RulePhase {
            self.phase
        }

        fn handle(&self, _ctx: &mut RuleContext<'_>, event: &GraphEvent) -> Result<()> {
            let key = match &event.entity {
                Entity::Node(n) => n.key.clone(),
                Entity::Edge(e) => e.key.clone(),
            };
            self.log
                .lock()
                .unwrap()
                .push(format!("{}:{:?}:{}", self.name, event.kind, key));
            Ok(())
        }
    }

    /// On creation of `trigger`, stores two child nodes.
    struct Spawner;

    impl Rule for Spawner {
        fn name(&self) -> &str {
            "spawner"
        }

        fn handles(&self) -> &[EventKind] {
            &[EventKind::NodeCreated]
        }

        fn handle(&self, ctx: &mut RuleContext<'_>, event: &GraphEvent) -> Result<()> {
            if let Some(node) = event.node() {
                if node.key == "trigger" {
                    ctx.store_node(&event.partition, Node::new("child1", "Thing"));
                    ctx.store_node(&event.partition, Node::new("child2", "Thing"));
                }
            }
            Ok(())
        }
    }

    /// Touches the node it fires for, forever.
    struct Toucher;

    impl Rule for Toucher {
        fn name(&self) -> &str {
            "toucher"
        }

        fn handles(&self) -> &[EventKind] {
            &[EventKind::NodeCreated, EventKind::NodeUpdated]
        }

        fn handle(&self, ctx: &mut RuleContext<'_>, event: &GraphEvent) -> Result<()> {
            if let Some(node) = event.node() {
                ctx.update_node(&event.partition, node.clone().with_attr("touched", true));
            }
            Ok(())
        }
    }

    /// Creates a new node on every creation, never terminating.
    struct Breeder;

    impl Rule for Breeder {
        fn name(&self) -> &str {
            "breeder"
        }

        fn handles(&self) -> &[EventKind] {
            &[EventKind::NodeCreated]
        }

        fn handle(&self, ctx: &mut RuleContext<'_>, event: &GraphEvent) -> Result<()> {
            if let Some(node) = event.node() {
                ctx.store_node(&event.partition, Node::new(format!("{}x", node.key), "Thing"));
            }
            Ok(())
        }
    }

    struct Veto;

    impl Rule for Veto {
        fn name(&self) -> &str {
            "veto"
        }

        fn handles(&self) -> &[EventKind] {
            &[EventKind::NodeCreated]
        }

        fn phase(&self) -> RulePhase {
            RulePhase::Pre
        }

        fn handle(&self, _ctx: &mut RuleContext<'_>, _event: &GraphEvent) -> Result<()> {
            Err(GraphError::InvalidData("no new nodes".into()))
        }
    }

    fn store(key: &str) -> Mutation {
        Mutation::StoreNode {
            partition: "main".into(),
            node: Node::new(key, "Thing"),
        }
    }

    fn entries(log: &Arc<Mutex<Vec<String>>>) -> Vec<String> {
        log.lock().unwrap().clone()
    }

    #[test]
    fn test_derived_mutations_run_depth_first() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = RuleRegistry::new();
        registry.set_user_rule(Arc::new(Spawner));
        registry.set_user_rule(Recorder::new("after", &[EventKind::NodeCreated], RulePhase::Post, &log));

        let mut st = MemoryStorage::new("mem");
        let mut dispatcher = Dispatcher::new(&mut st, &registry, 100);
        dispatcher.run(store("trigger")).unwrap();

        // Both children complete before "after" sees the trigger
        assert_eq!(
            entries(&log),
            vec![
                "after:NodeCreated:child1",
                "after:NodeCreated:child2",
                "after:NodeCreated:trigger",
            ]
        );
    }

    #[test]
    fn test_pre_rules_run_before_apply() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = RuleRegistry::new();
        registry.set_user_rule(Recorder::new("post", &[EventKind::NodeCreated], RulePhase::Post, &log));
        registry.set_user_rule(Recorder::new("pre", &[EventKind::NodeCreated], RulePhase::Pre, &log));

        let mut st = MemoryStorage::new("mem");
        Dispatcher::new(&mut st, &registry, 100).run(store("n1")).unwrap();
        assert_eq!(entries(&log), vec!["pre:NodeCreated:n1", "post:NodeCreated:n1"]);
    }

    #[test]
    fn test_pre_rule_error_vetoes_mutation() {
        let mut registry = RuleRegistry::new();
        registry.set_user_rule(Arc::new(Veto));

        let mut st = MemoryStorage::new("mem");
        let err = Dispatcher::new(&mut st, &registry, 100).run(store("n1")).unwrap_err();
        match err {
            GraphError::Rule { rule, .. } => assert_eq!(rule, "veto"),
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(ops::fetch_node(&st, "main", "n1", "Thing").unwrap().is_none());
    }

    #[test]
    fn test_guard_stops_self_retrigger() {
        let mut registry = RuleRegistry::new();
        registry.set_user_rule(Arc::new(Toucher));

        let mut st = MemoryStorage::new("mem");
        let mut dispatcher = Dispatcher::new(&mut st, &registry, 100);
        dispatcher.run(store("n1")).unwrap();
        // Once for the creation; the update it queued is applied but the
        // rule does not fire again for the same node
        assert_eq!(dispatcher.dispatched(), 1);
        drop(dispatcher);

        let node = ops::fetch_node(&st, "main", "n1", "Thing").unwrap().unwrap();
        assert_eq!(node.attr("touched").and_then(|v| v.as_bool()), Some(true));
    }

    #[test]
    fn test_runaway_rule_hits_cycle_limit() {
        let mut registry = RuleRegistry::new();
        registry.set_user_rule(Arc::new(Breeder));

        let mut st = MemoryStorage::new("mem");
        let err = Dispatcher::new(&mut st, &registry, 10).run(store("n")).unwrap_err();
        assert!(matches!(err, GraphError::RuleCycle { limit: 10 }));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_remove_missing_is_noop() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = RuleRegistry::new();
        registry.set_user_rule(Recorder::new("del", &[EventKind::NodeDeleted], RulePhase::Post, &log));

        let mut st = MemoryStorage::new("mem");
        Dispatcher::new(&mut st, &registry, 100)
            .run(Mutation::RemoveNode {
                partition: "main".into(),
                key: "ghost".into(),
                kind: "Thing".into(),
            })
            .unwrap();
        assert!(entries(&log).is_empty());
    }

    #[test]
    fn test_edge_events() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = RuleRegistry::new();
        registry.set_user_rule(Recorder::new("edges", EventKind::ALL, RulePhase::Post, &log));

        let mut st = MemoryStorage::new("mem");
        let edge = Edge::new(
            "e1",
            "Link",
            EdgeEnd::new("a", "Thing", "from"),
            EdgeEnd::new("b", "Thing", "to"),
        );
        {
            let mut dispatcher = Dispatcher::new(&mut st, &registry, 100);
            dispatcher.run(store("a")).unwrap();
            dispatcher.run(store("b")).unwrap();
            dispatcher
                .run(Mutation::StoreEdge {
                    partition: "main".into(),
                    edge: edge.clone(),
                })
                .unwrap();
            dispatcher
                .run(Mutation::StoreEdge {
                    partition: "main".into(),
                    edge: edge.with_attr("weight", 2),
                })
                .unwrap();
        }
        assert_eq!(
            entries(&log),
            vec![
                "edges:NodeCreated:a",
                "edges:NodeCreated:b",
                "edges:EdgeCreated:e1",
                "edges:EdgeUpdated:e1",
            ]
        );
    }
}
