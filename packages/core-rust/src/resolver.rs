//! Phase resolution: turns handler contributions with partial-ordering
//! constraints into a concrete, deterministic chain for one flow.
//!
//! Resolution runs in four steps:
//!
//! 1. Take the declared phase list for the flow.
//! 2. Bucket every contribution into its phase. Unknown phases and
//!    duplicate handler names are rejected.
//! 3. Order each bucket: the `phase_first` claimant, then the remaining
//!    handlers topologically sorted over their `before`/`after` edges
//!    (ties broken by registration order), then the `phase_last` claimant.
//! 4. Concatenate the buckets in phase order.
//!
//! Resolution never drops a handler: it either places every contribution
//! or fails with a [`ConfigError`].

use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::ConfigError;
use crate::handler::ChainEntry;
use crate::phase::{Flow, Phase, PhaseOrder};

// ---------------------------------------------------------------------------
// HandlerChain
// ---------------------------------------------------------------------------

/// Fully ordered handlers for one flow, grouped by phase.
///
/// Chains are immutable once built and shared between exchanges via `Arc`.
#[derive(Clone)]
pub struct HandlerChain {
    flow: Flow,
    phases: Vec<Phase>,
    entries: Vec<Arc<ChainEntry>>,
}

impl HandlerChain {
    fn from_phases(flow: Flow, phases: Vec<Phase>) -> Self {
        let entries = phases
            .iter()
            .flat_map(|p| p.handlers.iter().cloned())
            .collect();
        Self {
            flow,
            phases,
            entries,
        }
    }

    pub fn flow(&self) -> Flow {
        self.flow
    }

    pub fn phases(&self) -> &[Phase] {
        &self.phases
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Arc<ChainEntry>> {
        self.entries.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<ChainEntry>> {
        self.entries.iter()
    }

    pub fn handler_names(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.name()).collect()
    }
}

impl fmt::Debug for HandlerChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerChain")
            .field("flow", &self.flow)
            .field("handlers", &self.handler_names())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// PhaseResolver
// ---------------------------------------------------------------------------

/// Builds handler chains against a declared [`PhaseOrder`].
#[derive(Debug, Clone, Copy)]
pub struct PhaseResolver<'a> {
    order: &'a PhaseOrder,
}

impl<'a> PhaseResolver<'a> {
    pub fn new(order: &'a PhaseOrder) -> Self {
        Self { order }
    }

    /// Resolves `contributions` into a chain for `flow`.
    ///
    /// `contributions` must be in registration order (global scope first,
    /// then service, then operation); that order breaks ties.
    ///
    /// # Errors
    ///
    /// - `ConfigError::UnknownPhase` if a handler names a phase not declared for `flow`
    /// - `ConfigError::DuplicateHandler` if two contributions share a name
    /// - `ConfigError::PhaseOrderConflict` on competing first/last claims or cyclic constraints
    pub fn resolve(
        &self,
        flow: Flow,
        contributions: &[Arc<ChainEntry>],
    ) -> Result<HandlerChain, ConfigError> {
        let declared = self.order.phases(flow);
        let mut slot_of: HashMap<&str, usize> = HashMap::new();
        for (i, name) in declared.iter().enumerate() {
            slot_of.entry(name.as_str()).or_insert(i);
        }

        let mut buckets: Vec<Vec<Arc<ChainEntry>>> = vec![Vec::new(); declared.len()];
        let mut seen: HashSet<&str> = HashSet::new();
        for entry in contributions {
            let desc = entry.description();
            let Some(&slot) = slot_of.get(desc.phase.as_str()) else {
                return Err(ConfigError::UnknownPhase {
                    phase: desc.phase.clone(),
                    handler: desc.name.clone(),
                    flow,
                });
            };
            if !seen.insert(entry.name()) {
                return Err(ConfigError::DuplicateHandler {
                    phase: desc.phase.clone(),
                    handler: desc.name.clone(),
                });
            }
            buckets[slot].push(Arc::clone(entry));
        }

        let mut phases = Vec::with_capacity(declared.len());
        for (name, bucket) in declared.iter().zip(buckets) {
            // Repeated phase names share the first slot; later repeats stay empty.
            let handlers = order_phase(name, bucket)?;
            phases.push(Phase {
                name: name.clone(),
                handlers,
            });
        }

        let chain = HandlerChain::from_phases(flow, phases);
        debug!(%flow, handlers = ?chain.handler_names(), "resolved handler chain");
        Ok(chain)
    }
}

/// Orders the handlers of a single phase.
fn order_phase(
    phase: &str,
    entries: Vec<Arc<ChainEntry>>,
) -> Result<Vec<Arc<ChainEntry>>, ConfigError> {
    if entries.is_empty() {
        return Ok(entries);
    }

    let conflict = |detail: String| ConfigError::PhaseOrderConflict {
        phase: phase.to_string(),
        detail,
    };

    let first = sole_claimant(&entries, |e| e.description().phase_first)
        .map_err(|(a, b)| conflict(format!("both '{a}' and '{b}' claim phaseFirst")))?;
    let last = sole_claimant(&entries, |e| e.description().phase_last)
        .map_err(|(a, b)| conflict(format!("both '{a}' and '{b}' claim phaseLast")))?;

    if let (Some(f), Some(l)) = (first, last) {
        if f == l {
            if entries.len() > 1 {
                return Err(conflict(format!(
                    "'{}' claims both phaseFirst and phaseLast but shares the phase",
                    entries[f].name()
                )));
            }
            return Ok(entries);
        }
    }

    let index_of: HashMap<&str, usize> = entries
        .iter()
        .enumerate()
        .map(|(i, e)| (e.name(), i))
        .collect();

    // Directed edges (from runs before to), restricted to this phase.
    let mut edges: BTreeSet<(usize, usize)> = BTreeSet::new();
    for (i, entry) in entries.iter().enumerate() {
        let desc = entry.description();
        for target in &desc.before {
            match index_of.get(target.as_str()) {
                Some(&j) => {
                    edges.insert((i, j));
                }
                None => warn!(
                    phase,
                    handler = entry.name(),
                    before = %target,
                    "ignoring constraint on handler outside the phase"
                ),
            }
        }
        for source in &desc.after {
            match index_of.get(source.as_str()) {
                Some(&j) => {
                    edges.insert((j, i));
                }
                None => warn!(
                    phase,
                    handler = entry.name(),
                    after = %source,
                    "ignoring constraint on handler outside the phase"
                ),
            }
        }
    }

    if let Some(f) = first {
        if let Some(&(p, _)) = edges.iter().find(|&&(_, to)| to == f) {
            return Err(conflict(format!(
                "'{}' is phaseFirst but '{}' must run before it",
                entries[f].name(),
                entries[p].name()
            )));
        }
    }
    if let Some(l) = last {
        if let Some(&(_, s)) = edges.iter().find(|&&(from, _)| from == l) {
            return Err(conflict(format!(
                "'{}' is phaseLast but '{}' must run after it",
                entries[l].name(),
                entries[s].name()
            )));
        }
    }

    let pinned = |i: usize| Some(i) == first || Some(i) == last;
    let middle: Vec<usize> = (0..entries.len()).filter(|&i| !pinned(i)).collect();
    let sorted = topological_order(&middle, &edges).map_err(|stuck| {
        let names: Vec<&str> = stuck.iter().map(|&i| entries[i].name()).collect();
        conflict(format!(
            "cyclic before/after constraints among: {}",
            names.join(", ")
        ))
    })?;

    let mut ordered = Vec::with_capacity(entries.len());
    ordered.extend(first.map(|f| Arc::clone(&entries[f])));
    ordered.extend(sorted.into_iter().map(|i| Arc::clone(&entries[i])));
    ordered.extend(last.map(|l| Arc::clone(&entries[l])));
    Ok(ordered)
}

/// Returns the index of the single entry matching `claims`, or the names of
/// the first two competing claimants.
fn sole_claimant(
    entries: &[Arc<ChainEntry>],
    claims: impl Fn(&ChainEntry) -> bool,
) -> Result<Option<usize>, (String, String)> {
    let mut found: Option<usize> = None;
    for (i, entry) in entries.iter().enumerate() {
        if claims(entry.as_ref()) {
            if let Some(prev) = found {
                return Err((entries[prev].name().to_string(), entry.name().to_string()));
            }
            found = Some(i);
        }
    }
    Ok(found)
}

/// Kahn's algorithm over `nodes`, considering only edges between them.
///
/// A min-heap on the registration index makes the output deterministic.
/// On a cycle, returns the nodes that could not be placed.
fn topological_order(
    nodes: &[usize],
    edges: &BTreeSet<(usize, usize)>,
) -> Result<Vec<usize>, Vec<usize>> {
    let members: HashSet<usize> = nodes.iter().copied().collect();
    let mut in_degree: HashMap<usize, usize> = nodes.iter().map(|&n| (n, 0)).collect();
    let mut adjacency: HashMap<usize, Vec<usize>> = HashMap::new();

    for &(from, to) in edges {
        if members.contains(&from) && members.contains(&to) {
            adjacency.entry(from).or_default().push(to);
            *in_degree.entry(to).or_default() += 1;
        }
    }

    let mut ready: BinaryHeap<Reverse<usize>> = in_degree
        .iter()
        .filter(|&(_, &deg)| deg == 0)
        .map(|(&n, _)| Reverse(n))
        .collect();

    let mut sorted = Vec::with_capacity(nodes.len());
    while let Some(Reverse(node)) = ready.pop() {
        sorted.push(node);
        for next in adjacency.get(&node).into_iter().flatten() {
            if let Some(deg) = in_degree.get_mut(next) {
                *deg -= 1;
                if *deg == 0 {
                    ready.push(Reverse(*next));
                }
            }
        }
    }

    if sorted.len() == nodes.len() {
        Ok(sorted)
    } else {
        let placed: HashSet<usize> = sorted.into_iter().collect();
        let mut stuck: Vec<usize> = nodes.iter().copied().filter(|n| !placed.contains(n)).collect();
        stuck.sort_unstable();
        Err(stuck)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
