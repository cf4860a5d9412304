//! System rules, registered by every graph manager before any user rule.

use std::sync::Arc;

use crate::data::{is_reserved_attr, EndSide};
use crate::error::Result;
use crate::graph::schema::{
    add_to_set, adjust_count, edge_attrs_key, edge_count_key, node_attrs_key, node_count_key,
    node_edges_key, EDGE_KINDS_KEY, NODE_KINDS_KEY, PARTITIONS_KEY,
};
use crate::rules::{EventKind, GraphEvent, Rule, RuleContext, RuleRegistry};

pub const DELETE_NODE_EDGES: &str = "system.deletenodeedges";
pub const UPDATE_NODE_STATS: &str = "system.updatenodestats";

/// Register the system rules on a registry.
pub fn register(registry: &mut RuleRegistry) {
    registry.set_system_rule(Arc::new(DeleteNodeEdges));
    registry.set_system_rule(Arc::new(UpdateNodeStats));
}

// ── Cascade ────────────────────────────────────────────────────────

/// Removes the edges of a removed node and cascades along them.
///
/// - Node removed: every incident edge is removed. If the removed node's own
///   end is `cascading` (without `cascading_last`) the far node goes too.
/// - Edge removed: for each end marked `cascading_last`, the node at the
///   other end is removed once it has no edge left with the same spec.
pub struct DeleteNodeEdges;

impl Rule for DeleteNodeEdges {
    fn name(&self) -> &str {
        DELETE_NODE_EDGES
    }

    fn handles(&self) -> &[EventKind] {
        &[EventKind::NodeDeleted, EventKind::EdgeDeleted]
    }

    fn handle(&self, ctx: &mut RuleContext<'_>, event: &GraphEvent) -> Result<()> {
        let part = event.partition.as_str();

        if let Some(node) = event.node() {
            for edge_ref in ctx.edge_refs(part, &node.key, &node.kind)? {
                let Some(edge) = ctx.fetch_edge(part, &edge_ref.key, &edge_ref.kind)? else {
                    continue;
                };
                ctx.remove_edge(part, &edge.key, &edge.kind);

                let Some(side) = edge.side_of(&node.key, &node.kind) else {
                    continue;
                };
                let own = edge.end(side);
                let far = edge.end(side.other());
                if own.cascading && !own.cascading_last && !far.points_at(&node.key, &node.kind) {
                    ctx.remove_node(part, &far.key, &far.kind);
                }
            }
        }

        if let Some(edge) = event.edge() {
            for side in [EndSide::End1, EndSide::End2] {
                if !edge.end(side).cascading_last {
                    continue;
                }
                let far_side = side.other();
                let far = edge.end(far_side);
                if ctx.fetch_node(part, &far.key, &far.kind)?.is_none() {
                    continue;
                }

                let spec = edge.spec(far_side);
                let mut remaining = false;
                for edge_ref in ctx.edge_refs(part, &far.key, &far.kind)? {
                    if let Some(other) = ctx.fetch_edge(part, &edge_ref.key, &edge_ref.kind)? {
                        if let Some(other_side) = other.side_of(&far.key, &far.kind) {
                            if other.spec(other_side) == spec {
                                remaining = true;
                                break;
                            }
                        }
                    }
                }

                if !remaining {
                    ctx.remove_node(part, &far.key, &far.kind);
                }
            }
        }

        Ok(())
    }
}

// ── Statistics ─────────────────────────────────────────────────────

/// Keeps the schema registries and per-kind counts up to date.
///
/// Runs on every event, including later events of an entity already seen
/// in the same mutation. It only touches the main database.
pub struct UpdateNodeStats;

impl Rule for UpdateNodeStats {
    fn name(&self) -> &str {
        UPDATE_NODE_STATS
    }

    fn handles(&self) -> &[EventKind] {
        EventKind::ALL
    }

    fn fire_once(&self) -> bool {
        false
    }

    fn handle(&self, ctx: &mut RuleContext<'_>, event: &GraphEvent) -> Result<()> {
        let db = ctx.main_db_mut();

        match event.kind {
            EventKind::NodeCreated | EventKind::NodeUpdated => {
                if let Some(node) = event.node() {
                    add_to_set(db, PARTITIONS_KEY, [event.partition.as_str()])?;
                    add_to_set(db, NODE_KINDS_KEY, [node.kind.as_str()])?;
                    add_to_set(db, &node_attrs_key(&node.kind), node.registry_attrs())?;
                    if event.kind == EventKind::NodeCreated {
                        adjust_count(db, &node_count_key(&node.kind), 1);
                    }
                }
            }
            EventKind::NodeDeleted => {
                if let Some(node) = event.node() {
                    adjust_count(db, &node_count_key(&node.kind), -1);
                }
            }
            EventKind::EdgeCreated | EventKind::EdgeUpdated => {
                if let Some(edge) = event.edge() {
                    add_to_set(db, PARTITIONS_KEY, [event.partition.as_str()])?;
                    add_to_set(db, EDGE_KINDS_KEY, [edge.kind.as_str()])?;
                    let attrs = edge
                        .attrs
                        .keys()
                        .map(String::as_str)
                        .filter(|a| !is_reserved_attr(a));
                    add_to_set(db, &edge_attrs_key(&edge.kind), attrs)?;
                    for side in [EndSide::End1, EndSide::End2] {
                        let spec = edge.spec(side);
                        add_to_set(db, &node_edges_key(&edge.end(side).kind), [spec.as_str()])?;
                    }
                    if event.kind == EventKind::EdgeCreated {
                        adjust_count(db, &edge_count_key(&edge.kind), 1);
                    }
                }
            }
            EventKind::EdgeDeleted => {
                if let Some(edge) = event.edge() {
                    adjust_count(db, &edge_count_key(&edge.kind), -1);
                }
            }
        }

        Ok(())
    }
}
