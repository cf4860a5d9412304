//! Rules engine.
//!
//! A rule is a named handler bound to a set of event kinds and a phase.
//! Rules see the graph through a `RuleContext` and may queue further
//! mutations, which the dispatcher processes depth-first before the next
//! rule of the same event runs.
//!
//! Ordering within a phase: system rules first, then user rules, each group
//! in registration order. Registering a rule under an existing name
//! replaces it in place.

pub mod dispatch;
pub mod system;

use std::sync::Arc;

use crate::data::{entity_id, Edge, Node};
use crate::error::Result;
use crate::graph::ops::{self, EdgeRef, Traversal};
use crate::graph::Mutation;
use crate::storage::{GraphStorage, MainDb};

pub use dispatch::Dispatcher;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    NodeCreated,
    NodeUpdated,
    NodeDeleted,
    EdgeCreated,
    EdgeUpdated,
    EdgeDeleted,
}

impl EventKind {
    pub const ALL: &'static [EventKind] = &[
        EventKind::NodeCreated,
        EventKind::NodeUpdated,
        EventKind::NodeDeleted,
        EventKind::EdgeCreated,
        EventKind::EdgeUpdated,
        EventKind::EdgeDeleted,
    ];
}

/// When a rule fires relative to the low-level mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RulePhase {
    /// Before the mutation is applied. An error vetoes it.
    Pre,
    /// After the mutation is applied.
    Post,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Entity {
    Node(Node),
    Edge(Edge),
}

/// A mutation as seen by rules.
///
/// `entity` is the new version for creates and updates and the removed
/// version for deletes. `previous` is set for updates only.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphEvent {
    pub kind: EventKind,
    pub partition: String,
    pub entity: Entity,
    pub previous: Option<Entity>,
}

impl GraphEvent {
    /// Id of the entity this event is about, used by the re-fire guard.
    pub fn entity_id(&self) -> u128 {
        match &self.entity {
            Entity::Node(n) => entity_id("node", &self.partition, &n.kind, &n.key),
            Entity::Edge(e) => entity_id("edge", &self.partition, &e.kind, &e.key),
        }
    }

    pub fn node(&self) -> Option<&Node> {
        match &self.entity {
            Entity::Node(n) => Some(n),
            Entity::Edge(_) => None,
        }
    }

    pub fn edge(&self) -> Option<&Edge> {
        match &self.entity {
            Entity::Edge(e) => Some(e),
            Entity::Node(_) => None,
        }
    }
}

pub trait Rule: Send + Sync {
    fn name(&self) -> &str;

    /// Event kinds this rule is bound to.
    fn handles(&self) -> &[EventKind];

    fn phase(&self) -> RulePhase {
        RulePhase::Post
    }

    /// Whether the re-fire guard applies. Rules that never queue mutations
    /// can opt out and see every event of an entity.
    fn fire_once(&self) -> bool {
        true
    }

    fn handle(&self, ctx: &mut RuleContext<'_>, event: &GraphEvent) -> Result<()>;
}

/// Registered rules, system group and user group.
#[derive(Clone, Default)]
pub struct RuleRegistry {
    system: Vec<Arc<dyn Rule>>,
    user: Vec<Arc<dyn Rule>>,
}

impl RuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_system_rule(&mut self, rule: Arc<dyn Rule>) {
        upsert(&mut self.system, rule);
    }

    pub fn set_user_rule(&mut self, rule: Arc<dyn Rule>) {
        upsert(&mut self.user, rule);
    }

    /// Rules to run for an event kind in a phase, system rules first.
    pub fn rules_for(&self, kind: EventKind, phase: RulePhase) -> Vec<Arc<dyn Rule>> {
        self.system
            .iter()
            .chain(self.user.iter())
            .filter(|r| r.phase() == phase && r.handles().contains(&kind))
            .cloned()
            .collect()
    }

    /// Sorted names of all registered rules.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .system
            .iter()
            .chain(self.user.iter())
            .map(|r| r.name().to_string())
            .collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.system.len() + self.user.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn upsert(rules: &mut Vec<Arc<dyn Rule>>, rule: Arc<dyn Rule>) {
    match rules.iter_mut().find(|r| r.name() == rule.name()) {
        Some(slot) => *slot = rule,
        None => rules.push(rule),
    }
}

/// The view of the graph a rule runs against.
///
/// Reads see every mutation applied so far in the enclosing commit.
/// Writes are queued and run after the current handler returns.
pub struct RuleContext<'a> {
    storage: &'a mut dyn GraphStorage,
    queued: Vec<Mutation>,
}

impl<'a> RuleContext<'a> {
    pub(crate) fn new(storage: &'a mut dyn GraphStorage) -> Self {
        Self {
            storage,
            queued: Vec::new(),
        }
    }

    pub fn fetch_node(&self, part: &str, key: &str, kind: &str) -> Result<Option<Node>> {
        ops::fetch_node(&*self.storage, part, key, kind)
    }

    pub fn fetch_edge(&self, part: &str, key: &str, kind: &str) -> Result<Option<Edge>> {
        ops::fetch_edge(&*self.storage, part, key, kind)
    }

    pub fn edge_refs(&self, part: &str, key: &str, kind: &str) -> Result<Vec<EdgeRef>> {
        ops::edge_refs(&*self.storage, part, key, kind)
    }

    pub fn traverse(&self, part: &str, key: &str, kind: &str, spec: &str) -> Result<Vec<Traversal>> {
        ops::traverse(&*self.storage, part, key, kind, spec, false)
    }

    pub fn node_keys(&self, part: &str, kind: &str) -> Result<Vec<String>> {
        ops::node_keys(&*self.storage, part, kind)
    }

    pub fn main_db(&self) -> &MainDb {
        self.storage.main_db()
    }

    pub(crate) fn main_db_mut(&mut self) -> &mut MainDb {
        self.storage.main_db_mut()
    }

    pub fn store_node(&mut self, part: &str, node: Node) {
        self.queued.push(Mutation::StoreNode {
            partition: part.to_string(),
            node,
        });
    }

    pub fn update_node(&mut self, part: &str, node: Node) {
        self.queued.push(Mutation::UpdateNode {
            partition: part.to_string(),
            node,
        });
    }

    pub fn remove_node(&mut self, part: &str, key: &str, kind: &str) {
        self.queued.push(Mutation::RemoveNode {
            partition: part.to_string(),
            key: key.to_string(),
            kind: kind.to_string(),
        });
    }

    pub fn store_edge(&mut self, part: &str, edge: Edge) {
        self.queued.push(Mutation::StoreEdge {
            partition: part.to_string(),
            edge,
        });
    }

    pub fn remove_edge(&mut self, part: &str, key: &str, kind: &str) {
        self.queued.push(Mutation::RemoveEdge {
            partition: part.to_string(),
            key: key.to_string(),
            kind: kind.to_string(),
        });
    }

    pub(crate) fn into_queued(self) -> Vec<Mutation> {
        self.queued
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named {
        name: &'static str,
        phase: RulePhase,
    }

    impl Rule for Named {
        fn name(&self) -> &str {
            self.name
        }

        fn handles(&self) -> &[EventKind] {
            &[EventKind::NodeCreated]
        }

        fn phase(&self) -> RulePhase {
            self.phase
        }

        fn handle(&self, _ctx: &mut RuleContext<'_>, _event: &GraphEvent) -> Result<()> {
            Ok(())
        }
    }

    fn rule(name: &'static str, phase: RulePhase) -> Arc<dyn Rule> {
        Arc::new(Named { name, phase })
    }

    #[test]
    fn test_system_rules_run_first() {
        let mut registry = RuleRegistry::new();
        registry.set_user_rule(rule("a.user", RulePhase::Post));
        registry.set_system_rule(rule("z.system", RulePhase::Post));

        let names: Vec<String> = registry
            .rules_for(EventKind::NodeCreated, RulePhase::Post)
            .iter()
            .map(|r| r.name().to_string())
            .collect();
        assert_eq!(names, vec!["z.system", "a.user"]);
        assert!(registry.rules_for(EventKind::NodeDeleted, RulePhase::Post).is_empty());
        assert!(registry.rules_for(EventKind::NodeCreated, RulePhase::Pre).is_empty());
    }

    #[test]
    fn test_reregistering_replaces_in_place() {
        let mut registry = RuleRegistry::new();
        registry.set_user_rule(rule("first", RulePhase::Post));
        registry.set_user_rule(rule("second", RulePhase::Post));
        registry.set_user_rule(rule("first", RulePhase::Pre));

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.names(), vec!["first", "second"]);
        let pre = registry.rules_for(EventKind::NodeCreated, RulePhase::Pre);
        assert_eq!(pre.len(), 1);
        assert_eq!(pre[0].name(), "first");
    }

    #[test]
    fn test_event_entity_id_follows_entity() {
        let event = GraphEvent {
            kind: EventKind::NodeCreated,
            partition: "main".into(),
            entity: Entity::Node(Node::new("p1", "Person")),
            previous: None,
        };
        assert_eq!(event.entity_id(), entity_id("node", "main", "Person", "p1"));
        assert!(event.node().is_some());
        assert!(event.edge().is_none());
    }
}
