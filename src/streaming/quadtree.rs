//! Quadtree of render sections around a moving center
//!
//! Nodes live in a flat arena addressed through a `SectionPos -> index`
//! map. Each tick first builds a plan without touching the tree and then
//! applies it, so a tick that fails part way leaves the tree as it was.
//!
//! Rendering rules:
//! - a node coarser than its expected detail level defers to its children
//!   and is only switched off once every child can draw
//! - a node at its expected level, or one finer, loads and draws once no
//!   ancestor is drawing
//! - no enabled node ever has an enabled ancestor

use std::collections::HashMap;
use std::f64::consts::SQRT_2;
use std::sync::Arc;
use std::time::Duration;

use glam::DVec2;

use crate::core::config::QuadTreeConfig;
use crate::core::error::{Error, Result};
use crate::core::time::TickTimer;
use crate::math::{DetailCurve, SectionPos};
use crate::streaming::provider::RenderBuffer;
use crate::streaming::render_section::{PipelineContext, RenderSection};

struct Node {
    pos: SectionPos,
    section: Option<RenderSection>,
    /// Empty data for this node was already reported to the provider
    retrieval_requested: bool,
}

impl Node {
    fn new(pos: SectionPos) -> Self {
        Self { pos, section: None, retrieval_requested: false }
    }
}

/// How a node's detail level relates to the level wanted at its distance
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LevelMatch {
    /// Coarser than needed: recurse into the children
    TooCoarse,
    /// Exact level, or one finer
    Render,
}

/// Classify a node at `level` against `expected`
///
/// Anything finer than `expected - 1` can only come from a broken
/// selection and is reported as an invariant violation.
pub fn match_level(pos: SectionPos, expected: u8) -> Result<LevelMatch> {
    let level = pos.detail_level;
    if level > expected {
        Ok(LevelMatch::TooCoarse)
    } else if level == expected || level + 1 == expected {
        Ok(LevelMatch::Render)
    } else {
        Err(Error::InvariantViolation(format!(
            "{} reached at detail level {} but {} was expected",
            pos, level, expected
        )))
    }
}

#[derive(Clone, Copy, Debug)]
enum Visit {
    Descend { children_ready: bool },
    Render,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Action {
    CreateNode(SectionPos),
    Disable(SectionPos),
    DisableDescendants(SectionPos),
    CloseSection(SectionPos),
    DeleteDescendants(SectionPos),
    Enable(SectionPos),
    StartUpload(SectionPos),
}

impl Action {
    /// Apply order: structure first, every disable before any enable
    fn phase(self) -> u8 {
        match self {
            Action::CreateNode(_) => 0,
            Action::Disable(_) | Action::DisableDescendants(_) => 1,
            Action::CloseSection(_) => 2,
            Action::DeleteDescendants(_) => 3,
            Action::Enable(_) => 4,
            Action::StartUpload(_) => 5,
        }
    }
}

/// Outcome of one tick
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TickStats {
    pub sections_updated: usize,
    pub uploads_started: usize,
    pub enabled: usize,
    pub disabled: usize,
    pub nodes_removed: usize,
    pub retrievals_queued: usize,
}

/// LOD quadtree over a square region around a center block
pub struct QuadTree {
    nodes: Vec<Option<Node>>,
    free: Vec<usize>,
    index: HashMap<SectionPos, usize>,
    center: (i64, i64),
    half_width: i64,
    root_level: u8,
    curve: DetailCurve,
    ctx: Arc<PipelineContext>,
    timer: TickTimer,
}

impl QuadTree {
    pub fn new(config: &QuadTreeConfig, curve: DetailCurve, ctx: Arc<PipelineContext>, center: (i64, i64)) -> Self {
        let mut tree = Self {
            nodes: Vec::new(),
            free: Vec::new(),
            index: HashMap::new(),
            center,
            half_width: config.half_width_blocks,
            root_level: config.root_detail_level,
            curve,
            ctx,
            timer: TickTimer::default(),
        };
        for root in tree.root_positions() {
            tree.insert_node(root);
        }
        log::debug!(
            "quadtree created: {} roots at detail {} around ({}, {})",
            tree.index.len(),
            tree.root_level,
            center.0,
            center.1
        );
        tree
    }

    /// Half-open block square `[min, max)` covered by the tree
    pub fn bounds(&self) -> ((i64, i64), (i64, i64)) {
        (
            (self.center.0 - self.half_width, self.center.1 - self.half_width),
            (self.center.0 + self.half_width, self.center.1 + self.half_width),
        )
    }

    pub fn center(&self) -> (i64, i64) {
        self.center
    }

    pub fn root_level(&self) -> u8 {
        self.root_level
    }

    pub fn is_in_bounds(&self, pos: SectionPos) -> bool {
        let (min, max) = self.bounds();
        pos.overlaps_block_square(min, max)
    }

    /// Root positions overlapping the bounds
    pub fn root_positions(&self) -> Vec<SectionPos> {
        let ((min_x, min_z), (max_x, max_z)) = self.bounds();
        let lo = SectionPos::from_block(self.root_level, min_x, min_z);
        let hi = SectionPos::from_block(self.root_level, max_x - 1, max_z - 1);
        let mut roots = Vec::with_capacity(((hi.x - lo.x + 1) * (hi.z - lo.z + 1)).max(0) as usize);
        for z in lo.z..=hi.z {
            for x in lo.x..=hi.x {
                roots.push(SectionPos::new(self.root_level, x, z));
            }
        }
        roots
    }

    pub fn node_count(&self) -> usize {
        self.index.len()
    }

    pub fn contains_node(&self, pos: SectionPos) -> bool {
        self.index.contains_key(&pos)
    }

    pub fn section(&self, pos: SectionPos) -> Option<&RenderSection> {
        self.node(pos).and_then(|n| n.section.as_ref())
    }

    /// Positions currently drawing, sorted
    pub fn enabled_sections(&self) -> Vec<SectionPos> {
        let mut enabled: Vec<SectionPos> = self
            .live_nodes()
            .filter(|n| n.section.as_ref().is_some_and(RenderSection::is_rendering_enabled))
            .map(|n| n.pos)
            .collect();
        enabled.sort();
        enabled
    }

    /// Buffers of enabled sections that have something to draw
    pub fn visible_buffers(&self) -> Vec<(SectionPos, &dyn RenderBuffer)> {
        self.live_nodes()
            .filter_map(|n| {
                let section = n.section.as_ref()?;
                if !section.is_rendering_enabled() {
                    return None;
                }
                section.buffer().map(|b| (n.pos, b))
            })
            .collect()
    }

    /// Sections with an upload pipeline still running
    pub fn uploads_in_flight(&self) -> usize {
        self.live_nodes()
            .filter(|n| n.section.as_ref().is_some_and(RenderSection::is_in_flight))
            .count()
    }

    /// Duration of the most recent tick
    pub fn last_tick_duration(&self) -> Duration {
        self.timer.last()
    }

    fn live_nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().flatten()
    }

    fn node(&self, pos: SectionPos) -> Option<&Node> {
        self.index.get(&pos).and_then(|&i| self.nodes[i].as_ref())
    }

    fn node_mut(&mut self, pos: SectionPos) -> Option<&mut Node> {
        let i = *self.index.get(&pos)?;
        self.nodes[i].as_mut()
    }

    fn section_mut(&mut self, pos: SectionPos) -> Option<&mut RenderSection> {
        self.node_mut(pos).and_then(|n| n.section.as_mut())
    }

    fn insert_node(&mut self, pos: SectionPos) {
        if self.index.contains_key(&pos) {
            return;
        }
        let node = Some(Node::new(pos));
        let i = match self.free.pop() {
            Some(i) => {
                self.nodes[i] = node;
                i
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        };
        self.index.insert(pos, i);
    }

    /// Remove one node, closing its section
    fn remove_node(&mut self, pos: SectionPos) -> bool {
        let Some(i) = self.index.remove(&pos) else {
            return false;
        };
        if let Some(mut node) = self.nodes[i].take() {
            if let Some(section) = node.section.as_mut() {
                section.close();
            }
        }
        self.free.push(i);
        true
    }

    /// Existing strict descendants of `pos`, parents before children
    fn descendants(&self, pos: SectionPos) -> Vec<SectionPos> {
        let mut out = Vec::new();
        let mut stack = vec![pos];
        while let Some(p) = stack.pop() {
            let Some(children) = p.children() else { continue };
            for child in children {
                if self.index.contains_key(&child) {
                    out.push(child);
                    stack.push(child);
                }
            }
        }
        out
    }

    fn is_loaded(&self, pos: SectionPos) -> bool {
        self.section(pos).is_some_and(RenderSection::is_loaded)
    }

    /// Has something to show, even if a newer upload is pending
    fn is_drawable(&self, pos: SectionPos) -> bool {
        self.section(pos).is_some_and(RenderSection::is_drawable)
    }

    fn is_enabled(&self, pos: SectionPos) -> bool {
        self.section(pos).is_some_and(RenderSection::is_rendering_enabled)
    }

    fn is_in_flight(&self, pos: SectionPos) -> bool {
        self.section(pos).is_some_and(RenderSection::is_in_flight)
    }

    /// Detail level wanted for `pos` with the viewer at `viewer`
    pub fn expected_detail_level(&self, pos: SectionPos, viewer: DVec2) -> u8 {
        let distance = viewer.distance(pos.center_block());
        let max_radius = self.half_width as f64 * SQRT_2;
        self.curve.detail_level_in_region(distance, max_radius, self.root_level)
    }

    /// Advance the tree one step for a viewer at `viewer` (block space)
    ///
    /// Finished uploads are applied first, then the plan for this viewer
    /// position is built and applied. If planning fails the error is logged
    /// and nothing is changed.
    pub fn tick(&mut self, viewer: DVec2) -> Result<TickStats> {
        self.timer.begin();
        self.ctx.registry.prune();

        let mut stats = TickStats::default();
        let ctx = Arc::clone(&self.ctx);
        for node in self.nodes.iter_mut().flatten() {
            if let Some(section) = node.section.as_mut() {
                if section.poll(&ctx) {
                    stats.sections_updated += 1;
                }
            }
        }

        let actions = match self.plan(viewer) {
            Ok(actions) => actions,
            Err(err) => {
                log::error!("quadtree tick skipped at ({:.0}, {:.0}): {}", viewer.x, viewer.y, err);
                self.timer.end();
                return Err(err);
            }
        };
        self.apply(actions, &mut stats);
        stats.retrievals_queued = self.request_missing_data();

        debug_assert!(self.check_no_overlap().is_ok());

        let elapsed = self.timer.end();
        if self.timer.tick_count() > 10 && elapsed > self.timer.average() * 8 && elapsed > Duration::from_millis(4) {
            log::debug!("slow quadtree tick: {:?} (average {:?})", elapsed, self.timer.average());
        }
        Ok(stats)
    }

    /// Build the action list for a tick without modifying the tree
    fn plan(&self, viewer: DVec2) -> Result<Vec<Action>> {
        let roots = self.root_positions();
        let mut visits = HashMap::new();
        for &root in &roots {
            self.classify(root, viewer, &mut visits)?;
        }

        let mut actions = Vec::new();
        for &root in &roots {
            self.decide(root, false, &visits, &mut actions)?;
        }
        actions.sort_by_key(|a| a.phase());
        Ok(actions)
    }

    /// Record how each reachable node should behave and return whether its
    /// area can be drawn without holes
    fn classify(&self, pos: SectionPos, viewer: DVec2, visits: &mut HashMap<SectionPos, Visit>) -> Result<bool> {
        let expected = self.expected_detail_level(pos, viewer);
        match match_level(pos, expected)? {
            LevelMatch::TooCoarse => {
                let children = pos.children().ok_or_else(|| {
                    Error::InvariantViolation(format!("{} is too coarse but has no children", pos))
                })?;
                let mut children_ready = true;
                for child in children {
                    children_ready &= self.classify(child, viewer, visits)?;
                }
                visits.insert(pos, Visit::Descend { children_ready });
                Ok(children_ready || self.is_drawable(pos))
            }
            LevelMatch::Render => {
                visits.insert(pos, Visit::Render);
                Ok(self.is_drawable(pos))
            }
        }
    }

    fn decide(
        &self,
        pos: SectionPos,
        ancestor_on: bool,
        visits: &HashMap<SectionPos, Visit>,
        actions: &mut Vec<Action>,
    ) -> Result<()> {
        let visit = visits
            .get(&pos)
            .copied()
            .ok_or_else(|| Error::InvariantViolation(format!("{} was never classified", pos)))?;
        if !self.index.contains_key(&pos) {
            actions.push(Action::CreateNode(pos));
        }
        let enabled = self.is_enabled(pos);
        let drawable = self.is_drawable(pos);

        match visit {
            Visit::Descend { children_ready } => {
                // Keep drawing the coarse node until all its children can take over
                let on = !ancestor_on && !children_ready && drawable;
                push_toggle(actions, pos, enabled, on);
                if on && !enabled {
                    actions.push(Action::DisableDescendants(pos));
                }
                if children_ready && self.section(pos).is_some() {
                    actions.push(Action::CloseSection(pos));
                }
                if let Some(children) = pos.children() {
                    for child in children {
                        self.decide(child, ancestor_on || on, visits, actions)?;
                    }
                }
            }
            Visit::Render => {
                let on = !ancestor_on && drawable;
                push_toggle(actions, pos, enabled, on);
                if !self.is_loaded(pos) && !self.is_in_flight(pos) {
                    actions.push(Action::StartUpload(pos));
                }
                if on {
                    actions.push(Action::DeleteDescendants(pos));
                } else if ancestor_on {
                    actions.push(Action::DisableDescendants(pos));
                }
            }
        }
        Ok(())
    }

    fn apply(&mut self, actions: Vec<Action>, stats: &mut TickStats) {
        let ctx = Arc::clone(&self.ctx);
        for action in actions {
            match action {
                Action::CreateNode(pos) => self.insert_node(pos),
                Action::Disable(pos) => {
                    if let Some(section) = self.section_mut(pos) {
                        section.set_rendering_enabled(false);
                        stats.disabled += 1;
                    }
                }
                Action::DisableDescendants(pos) => {
                    for child in self.descendants(pos) {
                        if let Some(section) = self.section_mut(child) {
                            if section.is_rendering_enabled() {
                                section.set_rendering_enabled(false);
                                stats.disabled += 1;
                            }
                        }
                    }
                }
                Action::CloseSection(pos) => {
                    if let Some(node) = self.node_mut(pos) {
                        if let Some(mut section) = node.section.take() {
                            section.close();
                        }
                        node.retrieval_requested = false;
                    }
                }
                Action::DeleteDescendants(pos) => {
                    for child in self.descendants(pos) {
                        if self.remove_node(child) {
                            stats.nodes_removed += 1;
                        }
                    }
                }
                Action::Enable(pos) => {
                    if let Some(section) = self.section_mut(pos) {
                        if section.is_drawable() {
                            section.set_rendering_enabled(true);
                            stats.enabled += 1;
                        }
                    }
                }
                Action::StartUpload(pos) => {
                    if let Some(node) = self.node_mut(pos) {
                        let section = node.section.get_or_insert_with(|| RenderSection::new(pos));
                        if section.start_upload(&ctx) {
                            stats.uploads_started += 1;
                        }
                    }
                }
            }
        }
    }

    /// Report loaded positions without data to the provider
    fn request_missing_data(&mut self) -> usize {
        let provider = Arc::clone(self.ctx.registry.provider());
        let mut queued = 0;
        for node in self.nodes.iter_mut().flatten() {
            let Some(section) = node.section.as_ref() else { continue };
            if node.retrieval_requested || !section.is_drawable() || !section.source_was_empty() {
                continue;
            }
            if !provider.can_queue_retrieval() {
                break;
            }
            for pos in provider.positions_to_retrieve(node.pos) {
                if provider.queue_position_for_retrieval(pos) {
                    queued += 1;
                }
            }
            node.retrieval_requested = true;
        }
        queued
    }

    /// Move the center, evicting nodes that leave the bounds
    ///
    /// Nodes still in bounds keep their sections. Retrieval requests outside
    /// the new bounds are dropped.
    pub fn set_center(&mut self, center: (i64, i64)) -> usize {
        if center == self.center {
            return 0;
        }
        self.center = center;
        let (min, max) = self.bounds();
        let root_level = self.root_level;

        let doomed: Vec<SectionPos> = self
            .index
            .keys()
            .copied()
            .filter(|p| !p.convert_to_detail_level(root_level).overlaps_block_square(min, max))
            .collect();
        for &pos in &doomed {
            self.remove_node(pos);
        }
        for root in self.root_positions() {
            self.insert_node(root);
        }

        self.ctx
            .registry
            .provider()
            .remove_retrieval_request_if(&|pos: SectionPos| !pos.overlaps_block_square(min, max));

        log::debug!(
            "quadtree recentered on ({}, {}): {} nodes evicted, {} remain",
            center.0,
            center.1,
            doomed.len(),
            self.index.len()
        );
        doomed.len()
    }

    /// Mark a position's data as changed so it is reloaded
    pub fn reload_position(&mut self, pos: SectionPos) {
        self.ctx.registry.invalidate(pos);
        if let Some(node) = self.node_mut(pos) {
            node.retrieval_requested = false;
            if let Some(section) = node.section.as_mut() {
                section.mark_stale();
            }
        }
    }

    /// Verify that no enabled section has an enabled ancestor
    pub fn check_no_overlap(&self) -> Result<()> {
        for pos in self.enabled_sections() {
            let mut ancestor = pos.parent();
            while let Some(p) = ancestor {
                if p.detail_level > self.root_level {
                    break;
                }
                if self.is_enabled(p) {
                    return Err(Error::InvariantViolation(format!(
                        "{} and its ancestor {} are both enabled",
                        pos, p
                    )));
                }
                ancestor = p.parent();
            }
        }
        Ok(())
    }

    /// Close every section and drop all nodes
    pub fn clear(&mut self) {
        for node in self.nodes.iter_mut().flatten() {
            if let Some(section) = node.section.as_mut() {
                section.close();
            }
        }
        self.nodes.clear();
        self.free.clear();
        self.index.clear();
    }
}

impl Drop for QuadTree {
    fn drop(&mut self) {
        self.clear();
    }
}

fn push_toggle(actions: &mut Vec<Action>, pos: SectionPos, enabled: bool, on: bool) {
    if enabled != on {
        actions.push(if on { Action::Enable(pos) } else { Action::Disable(pos) });
    }
}
