//! Cellular Potts Monte Carlo core.
//!
//! Owns the label lattice, the cell registry, the boundary-pixel index, and
//! the Metropolis flip driver with its interchangeable candidate-selection
//! strategies. Energy terms plug in through [`EnergyTerm`]; acceptance and
//! fluctuation-amplitude models are selectable at runtime; steppers and
//! watchers observe the loop without owning any of its state.

use morphocell_lattice::{
    BoundaryKind, Dim3, Field3, Lattice, LatticeError, NeighborTable, Point3,
};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use slotmap::{SecondaryMap, SlotMap, new_key_type};
use smallvec::SmallVec;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

new_key_type! {
    /// Generational handle to a cell record.
    pub struct CellKey;
}

/// Side-data keyed by cell handle, for attribute adders and plugins.
pub type CellMap<T> = SecondaryMap<CellKey, T>;

/// Occupant of a lattice site. `None` is the medium.
pub type Label = Option<CellKey>;

/// Type id carried by the medium.
pub const MEDIUM_TYPE: u8 = 0;

/// Errors surfaced by the Potts core.
#[derive(Debug, Error, PartialEq)]
pub enum PottsError {
    /// Configuration values that cannot be used.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    /// Lattice-level failure.
    #[error(transparent)]
    Lattice(#[from] LatticeError),
    /// No builder registered under the requested energy-function type name.
    #[error("unknown energy function type '{0}'")]
    UnknownEnergyFunction(String),
    /// No acceptance-probability model registered under the requested name.
    #[error("unknown acceptance function '{0}'")]
    UnknownAcceptanceFunction(String),
    /// No fluctuation-amplitude model registered under the requested name.
    #[error("unknown fluctuation amplitude function '{0}'")]
    UnknownFluctuationFunction(String),
    /// No flip algorithm registered under the requested name.
    #[error("unknown metropolis algorithm '{0}'")]
    UnknownAlgorithm(String),
    /// A cell with this id already exists.
    #[error("cell id {0} already exists")]
    DuplicateCellId(u64),
    /// The incremental boundary index disagrees with the membership predicate.
    #[error("boundary index desync at {point}: tracked={tracked}, expected={expected}")]
    BoundaryDesync {
        point: Point3,
        tracked: bool,
        expected: bool,
    },
    /// The registry disagrees with the lattice footprint.
    #[error("registry desync: {0}")]
    RegistryDesync(String),
}

/// Monte Carlo step counter. One step is one `metropolis` invocation.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct Mcs(pub u64);

impl Mcs {
    /// Step zero.
    pub const ZERO: Mcs = Mcs(0);

    /// The following step.
    #[must_use]
    pub const fn next(self) -> Mcs {
        Mcs(self.0 + 1)
    }
}

// ---------------------------------------------------------------------------
// Cell registry
// ---------------------------------------------------------------------------

/// Bookkeeping for one cell.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct CellRecord {
    /// Stable numeric id, unique for the lifetime of the registry.
    pub id: u64,
    /// Cluster (compartment group) id.
    pub cluster_id: u64,
    /// Cell type id; `MEDIUM_TYPE` is reserved for the medium.
    pub type_id: u8,
    /// Live lattice footprint in sites.
    pub volume: u64,
}

/// Arena of live cells plus the id index used for explicit-id creation.
///
/// Ids are monotonic unless explicitly supplied; explicit ids bump the
/// monotonic counters past themselves so later automatic ids never collide.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CellRegistry {
    cells: SlotMap<CellKey, CellRecord>,
    by_id: HashMap<u64, CellKey>,
    next_cell_id: u64,
    next_cluster_id: u64,
    recently_created_id: u64,
    recently_created_cluster_id: u64,
}

impl Default for CellRegistry {
    fn default() -> Self {
        Self {
            cells: SlotMap::with_key(),
            by_id: HashMap::new(),
            next_cell_id: 1,
            next_cluster_id: 1,
            recently_created_id: 0,
            recently_created_cluster_id: 0,
        }
    }
}

impl CellRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live cells.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// Whether no cells are live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Whether `key` refers to a live cell.
    #[must_use]
    pub fn contains(&self, key: CellKey) -> bool {
        self.cells.contains_key(key)
    }

    /// Record for `key`, if live.
    #[must_use]
    pub fn get(&self, key: CellKey) -> Option<&CellRecord> {
        self.cells.get(key)
    }

    /// Mutable record for `key`, if live.
    pub fn get_mut(&mut self, key: CellKey) -> Option<&mut CellRecord> {
        self.cells.get_mut(key)
    }

    /// Handle for a numeric cell id.
    #[must_use]
    pub fn lookup(&self, id: u64) -> Option<CellKey> {
        self.by_id.get(&id).copied()
    }

    /// Iterate live cells.
    pub fn iter(&self) -> impl Iterator<Item = (CellKey, &CellRecord)> + '_ {
        self.cells.iter()
    }

    /// Iterate live cells mutably.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (CellKey, &mut CellRecord)> + '_ {
        self.cells.iter_mut()
    }

    /// Iterate live handles.
    pub fn keys(&self) -> impl Iterator<Item = CellKey> + '_ {
        self.cells.keys()
    }

    /// Create a cell with automatically assigned ids and zero volume.
    ///
    /// When `cluster_id` is `None` the cell starts its own cluster.
    pub fn create(&mut self, type_id: u8, cluster_id: Option<u64>) -> CellKey {
        let id = self.next_cell_id;
        self.next_cell_id += 1;
        let cluster = cluster_id.unwrap_or_else(|| {
            let c = self.next_cluster_id;
            self.next_cluster_id += 1;
            c
        });
        self.insert(id, cluster, type_id)
    }

    /// Create a cell with explicit ids, rejecting id collisions.
    pub fn create_with_ids(
        &mut self,
        id: u64,
        cluster_id: u64,
        type_id: u8,
    ) -> Result<CellKey, PottsError> {
        if self.by_id.contains_key(&id) {
            return Err(PottsError::DuplicateCellId(id));
        }
        self.next_cell_id = self.next_cell_id.max(id + 1);
        self.next_cluster_id = self.next_cluster_id.max(cluster_id + 1);
        Ok(self.insert(id, cluster_id, type_id))
    }

    fn insert(&mut self, id: u64, cluster_id: u64, type_id: u8) -> CellKey {
        let key = self.cells.insert(CellRecord {
            id,
            cluster_id,
            type_id,
            volume: 0,
        });
        self.by_id.insert(id, key);
        self.recently_created_id = id;
        self.recently_created_cluster_id = cluster_id;
        key
    }

    /// Remove a cell, returning its final record.
    pub fn remove(&mut self, key: CellKey) -> Option<CellRecord> {
        let record = self.cells.remove(key)?;
        self.by_id.remove(&record.id);
        Some(record)
    }

    /// Id assigned by the most recent creation.
    #[must_use]
    pub fn recently_created_id(&self) -> u64 {
        self.recently_created_id
    }

    /// Cluster id assigned by the most recent creation.
    #[must_use]
    pub fn recently_created_cluster_id(&self) -> u64 {
        self.recently_created_cluster_id
    }
}

fn label_type(registry: &CellRegistry, label: Label) -> u8 {
    label
        .and_then(|key| registry.get(key))
        .map_or(MEDIUM_TYPE, |record| record.type_id)
}

// ---------------------------------------------------------------------------
// Energy terms and aggregation
// ---------------------------------------------------------------------------

/// Read-only view handed to energy terms during evaluation.
#[derive(Clone, Copy)]
pub struct LatticeView<'a> {
    pub field: &'a Field3<Label>,
    pub registry: &'a CellRegistry,
    pub neighbors: &'a NeighborTable,
}

/// One term of the Hamiltonian.
///
/// `delta` is the energy change of relabeling `pt` from `old_label` to
/// `new_label`, evaluated against the current lattice. `total` is the term's
/// full energy over the lattice; terms that cannot recompute it return the
/// default zero and are skipped by full-recompute audits.
pub trait EnergyTerm: Send + Sync {
    fn delta(&self, view: &LatticeView<'_>, pt: Point3, new_label: Label, old_label: Label)
    -> f64;

    fn total(&self, view: &LatticeView<'_>) -> f64 {
        let _ = view;
        0.0
    }
}

/// Factory producing a term from its type name.
pub type EnergyTermBuilder = Box<dyn Fn() -> Box<dyn EnergyTerm> + Send + Sync>;

/// Ordered collection of named energy terms plus the connectivity constraint.
///
/// Registration order is evaluation order; re-registering an existing name
/// replaces the term in place without disturbing the order. The connectivity
/// constraint sits outside the named list and toggles independently.
#[derive(Default)]
pub struct EnergyAggregator {
    terms: Vec<(String, Box<dyn EnergyTerm>)>,
    builders: HashMap<String, EnergyTermBuilder>,
    connectivity: Option<Box<dyn EnergyTerm>>,
    connectivity_enabled: bool,
}

impl fmt::Debug for EnergyAggregator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnergyAggregator")
            .field("terms", &self.names())
            .field("builders", &self.builders.len())
            .field("connectivity_enabled", &self.connectivity_enabled)
            .finish()
    }
}

impl EnergyAggregator {
    /// Register a term under `name`, replacing any existing term in place.
    pub fn register(&mut self, name: impl Into<String>, term: Box<dyn EnergyTerm>) {
        let name = name.into();
        if let Some(slot) = self.terms.iter_mut().find(|(n, _)| *n == name) {
            slot.1 = term;
        } else {
            self.terms.push((name, term));
        }
    }

    /// Remove the term registered under `name`.
    ///
    /// Unknown names are a warning, not an error.
    pub fn unregister(&mut self, name: &str) -> bool {
        let before = self.terms.len();
        self.terms.retain(|(n, _)| n != name);
        let removed = self.terms.len() != before;
        if !removed {
            warn!(name, "unregister requested for unknown energy function");
        }
        removed
    }

    /// Registered term names in evaluation order.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.terms.iter().map(|(n, _)| n.as_str()).collect()
    }

    /// Register a builder so terms can be constructed by type name.
    pub fn register_builder(&mut self, name: impl Into<String>, builder: EnergyTermBuilder) {
        self.builders.insert(name.into(), builder);
    }

    /// Build and register a term from a previously registered builder.
    pub fn create(&mut self, type_name: &str) -> Result<(), PottsError> {
        let term = match self.builders.get(type_name) {
            Some(builder) => builder(),
            None => return Err(PottsError::UnknownEnergyFunction(type_name.to_owned())),
        };
        self.register(type_name, term);
        Ok(())
    }

    /// Install the connectivity constraint (enabled by default).
    pub fn register_connectivity_constraint(&mut self, term: Box<dyn EnergyTerm>) {
        self.connectivity = Some(term);
        self.connectivity_enabled = true;
    }

    /// Toggle the connectivity constraint without unregistering it.
    pub fn set_connectivity_enabled(&mut self, enabled: bool) {
        self.connectivity_enabled = enabled;
    }

    /// Whether the connectivity constraint currently participates.
    #[must_use]
    pub fn connectivity_enabled(&self) -> bool {
        self.connectivity_enabled && self.connectivity.is_some()
    }

    /// Summed energy change of a candidate flip over all active terms.
    #[must_use]
    pub fn change_energy(
        &self,
        view: &LatticeView<'_>,
        pt: Point3,
        new_label: Label,
        old_label: Label,
    ) -> f64 {
        let mut total: f64 = self
            .terms
            .iter()
            .map(|(_, term)| term.delta(view, pt, new_label, old_label))
            .sum();
        if self.connectivity_enabled
            && let Some(connectivity) = &self.connectivity
        {
            total += connectivity.delta(view, pt, new_label, old_label);
        }
        total
    }

    /// Like [`Self::change_energy`] but also returns per-term contributions
    /// for the named terms, in registration order.
    #[must_use]
    pub fn change_energy_breakdown(
        &self,
        view: &LatticeView<'_>,
        pt: Point3,
        new_label: Label,
        old_label: Label,
    ) -> (f64, Vec<f64>) {
        let mut breakdown = Vec::with_capacity(self.terms.len());
        let mut total = 0.0;
        for (_, term) in &self.terms {
            let delta = term.delta(view, pt, new_label, old_label);
            breakdown.push(delta);
            total += delta;
        }
        if self.connectivity_enabled
            && let Some(connectivity) = &self.connectivity
        {
            total += connectivity.delta(view, pt, new_label, old_label);
        }
        (total, breakdown)
    }

    /// Full energy summed over all active terms.
    #[must_use]
    pub fn total_energy(&self, view: &LatticeView<'_>) -> f64 {
        let mut total: f64 = self.terms.iter().map(|(_, term)| term.total(view)).sum();
        if self.connectivity_enabled
            && let Some(connectivity) = &self.connectivity
        {
            total += connectivity.total(view);
        }
        total
    }
}

// ---------------------------------------------------------------------------
// Acceptance and fluctuation models
// ---------------------------------------------------------------------------

/// Runtime acceptance expression over `(delta, temperature)`.
pub type AcceptanceExpr = Arc<dyn Fn(f64, f64) -> f64 + Send + Sync>;

/// Probability model mapping an energy change to an acceptance probability.
#[derive(Clone, Default)]
pub enum AcceptanceFunction {
    /// Boltzmann acceptance: certain for non-positive changes, `exp(-dE/T)`
    /// otherwise.
    #[default]
    Metropolis,
    /// First-order expansion of the Boltzmann factor, clamped to `[0, 1]`.
    FirstOrderExpansion,
    /// User-supplied expression, clamped to `[0, 1]`.
    Custom(AcceptanceExpr),
}

impl fmt::Debug for AcceptanceFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Metropolis => f.write_str("Metropolis"),
            Self::FirstOrderExpansion => f.write_str("FirstOrderExpansion"),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl AcceptanceFunction {
    /// Acceptance probability of a flip with energy change `delta` at
    /// effective temperature `temperature`.
    ///
    /// At non-positive temperature only energy-lowering (or neutral) flips
    /// are accepted.
    #[must_use]
    pub fn probability(&self, delta: f64, temperature: f64) -> f64 {
        match self {
            Self::Metropolis => {
                if delta <= 0.0 {
                    1.0
                } else if temperature <= 0.0 {
                    0.0
                } else {
                    (-delta / temperature).exp().min(1.0)
                }
            }
            Self::FirstOrderExpansion => {
                if delta <= 0.0 {
                    1.0
                } else if temperature <= 0.0 {
                    0.0
                } else {
                    (1.0 - delta / temperature).clamp(0.0, 1.0)
                }
            }
            Self::Custom(expr) => expr(delta, temperature).clamp(0.0, 1.0),
        }
    }
}

/// Configured acceptance model; `Custom` must have an expression registered
/// before it can be resolved.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum AcceptanceChoice {
    #[default]
    Default,
    FirstOrderExpansion,
    Custom,
}

impl AcceptanceChoice {
    /// Parse the registered model names.
    pub fn from_name(name: &str) -> Result<Self, PottsError> {
        match name {
            "Default" | "Metropolis" => Ok(Self::Default),
            "FirstOrderExpansion" => Ok(Self::FirstOrderExpansion),
            "Custom" => Ok(Self::Custom),
            _ => Err(PottsError::UnknownAcceptanceFunction(name.to_owned())),
        }
    }
}

/// Combines the motilities of the two cells involved in a flip into the
/// effective temperature for that flip.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum FluctuationAmplitudeFunction {
    #[default]
    Min,
    Max,
    ArithmeticAverage,
}

impl FluctuationAmplitudeFunction {
    /// Parse the registered model names.
    pub fn from_name(name: &str) -> Result<Self, PottsError> {
        match name {
            "Min" => Ok(Self::Min),
            "Max" => Ok(Self::Max),
            "ArithmeticAverage" => Ok(Self::ArithmeticAverage),
            _ => Err(PottsError::UnknownFluctuationFunction(name.to_owned())),
        }
    }

    /// Effective temperature for a flip between cells with the given
    /// motilities. The medium carries no motility; when neither side has one
    /// the global `fallback` temperature applies.
    #[must_use]
    pub fn resolve(self, new_motility: Option<f64>, old_motility: Option<f64>, fallback: f64) -> f64 {
        match (new_motility, old_motility) {
            (None, None) => fallback,
            (Some(m), None) | (None, Some(m)) => m,
            (Some(a), Some(b)) => match self {
                Self::Min => a.min(b),
                Self::Max => a.max(b),
                Self::ArithmeticAverage => 0.5 * (a + b),
            },
        }
    }
}

fn type_motility(motilities: &[f64], type_id: u8, label: Label) -> Option<f64> {
    if label.is_none() {
        return None;
    }
    motilities.get(type_id as usize).copied()
}

// ---------------------------------------------------------------------------
// Boundary index
// ---------------------------------------------------------------------------

/// Incrementally maintained index of boundary pixels.
///
/// A boundary pixel is a non-frozen site with at least one resolvable,
/// non-frozen neighbor carrying a different label. The dense vector plus the
/// point-to-slot map gives O(1) removal and uniform random picks; the
/// just-inserted/just-deleted sets expose the churn since the last flip pass
/// for incremental consumers.
#[derive(Debug, Default, Clone)]
pub struct BoundaryTracker {
    slots: HashMap<Point3, usize>,
    points: Vec<Point3>,
    just_inserted: HashSet<Point3>,
    just_deleted: HashSet<Point3>,
}

impl BoundaryTracker {
    /// Whether `pt` is currently indexed.
    #[must_use]
    pub fn contains(&self, pt: Point3) -> bool {
        self.slots.contains_key(&pt)
    }

    /// Number of indexed boundary pixels.
    #[must_use]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Whether the index is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Dense vector of boundary pixels, unordered.
    #[must_use]
    pub fn points(&self) -> &[Point3] {
        &self.points
    }

    /// Pixels inserted since the last [`Self::clear_deltas`].
    #[must_use]
    pub fn just_inserted(&self) -> &HashSet<Point3> {
        &self.just_inserted
    }

    /// Pixels deleted since the last [`Self::clear_deltas`].
    #[must_use]
    pub fn just_deleted(&self) -> &HashSet<Point3> {
        &self.just_deleted
    }

    /// Forget the churn sets.
    pub fn clear_deltas(&mut self) {
        self.just_inserted.clear();
        self.just_deleted.clear();
    }

    /// Uniformly random boundary pixel, if any.
    pub fn random_pick<R: Rng>(&self, rng: &mut R) -> Option<Point3> {
        if self.points.is_empty() {
            return None;
        }
        Some(self.points[rng.random_range(0..self.points.len())])
    }

    /// Evaluate the membership predicate directly against the lattice.
    #[must_use]
    pub fn is_boundary(
        field: &Field3<Label>,
        table: &NeighborTable,
        pt: Point3,
        frozen: &dyn Fn(Label) -> bool,
    ) -> bool {
        let Some(label) = field.at(pt) else {
            return false;
        };
        if frozen(label) {
            return false;
        }
        field.neighbors(pt, table).iter().any(|neighbor| {
            let neighbor_label = field.at(*neighbor).unwrap_or_default();
            neighbor_label != label && !frozen(neighbor_label)
        })
    }

    /// Rebuild the whole index from scratch, resetting the churn sets.
    pub fn rebuild(
        &mut self,
        field: &Field3<Label>,
        table: &NeighborTable,
        frozen: &dyn Fn(Label) -> bool,
    ) {
        self.slots.clear();
        self.points.clear();
        self.just_inserted.clear();
        self.just_deleted.clear();
        for pt in field.iter_points() {
            if Self::is_boundary(field, table, pt, frozen) {
                self.slots.insert(pt, self.points.len());
                self.points.push(pt);
            }
        }
    }

    /// Re-evaluate `pt` and its whole neighborhood after a label change at
    /// `pt`. Touches exactly the sites whose membership can have changed.
    pub fn update_around(
        &mut self,
        field: &Field3<Label>,
        table: &NeighborTable,
        pt: Point3,
        frozen: &dyn Fn(Label) -> bool,
    ) {
        self.refresh(field, table, pt, frozen);
        for neighbor in field.neighbors(pt, table) {
            self.refresh(field, table, neighbor, frozen);
        }
    }

    fn refresh(
        &mut self,
        field: &Field3<Label>,
        table: &NeighborTable,
        pt: Point3,
        frozen: &dyn Fn(Label) -> bool,
    ) {
        if Self::is_boundary(field, table, pt, frozen) {
            self.insert(pt);
        } else {
            self.remove(pt);
        }
    }

    fn insert(&mut self, pt: Point3) {
        if self.slots.contains_key(&pt) {
            return;
        }
        self.slots.insert(pt, self.points.len());
        self.points.push(pt);
        self.just_inserted.insert(pt);
        self.just_deleted.remove(&pt);
    }

    fn remove(&mut self, pt: Point3) {
        let Some(idx) = self.slots.remove(&pt) else {
            return;
        };
        self.points.swap_remove(idx);
        if idx < self.points.len() {
            let moved = self.points[idx];
            if let Some(slot) = self.slots.get_mut(&moved) {
                *slot = idx;
            }
        }
        self.just_deleted.insert(pt);
        self.just_inserted.remove(&pt);
    }
}

// ---------------------------------------------------------------------------
// Hooks
// ---------------------------------------------------------------------------

/// Post-step hook, run after fixed steppers at the end of each Monte Carlo
/// step.
pub trait Stepper: Send {
    fn step(&mut self, potts: &mut PottsState);
}

/// Post-step hook that runs before ordinary steppers.
pub trait FixedStepper: Send {
    fn step(&mut self, potts: &mut PottsState);
}

/// Observer of individual lattice label changes.
pub trait FieldChangeWatcher: Send {
    fn field_changed(&mut self, pt: Point3, new_label: Label, old_label: Label);
}

/// Observer of accepted flips that change the occupant type at a site.
pub trait TypeChangeWatcher: Send {
    fn type_changed(&mut self, pt: Point3, old_type: u8, new_type: u8);
}

/// Observer of cell lifecycle events, typically maintaining [`CellMap`]
/// side data.
pub trait AttributeAdder: Send {
    fn cell_created(&mut self, cell: CellKey, record: &CellRecord);

    fn cell_destroyed(&mut self, cell: CellKey, record: &CellRecord) {
        let _ = (cell, record);
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Candidate-selection strategy used by the flip driver.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum MetropolisAlgorithm {
    /// Uniform full-volume sampling that rebuilds the neighbor-offset list on
    /// every attempt. Statistically exact baseline; wasteful on purpose.
    List,
    /// Uniform full-volume sampling against the precomputed offset table.
    #[default]
    Fast,
    /// Samples source pixels from the boundary index only.
    BoundaryWalker,
}

impl MetropolisAlgorithm {
    /// Parse the registered algorithm names.
    pub fn from_name(name: &str) -> Result<Self, PottsError> {
        match name {
            "List" => Ok(Self::List),
            "Fast" => Ok(Self::Fast),
            "BoundaryWalker" => Ok(Self::BoundaryWalker),
            _ => Err(PottsError::UnknownAlgorithm(name.to_owned())),
        }
    }
}

/// Full configuration of the Potts core. Re-applicable at runtime through
/// [`PottsState::update`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PottsConfig {
    /// Lattice dimensions.
    pub dim: Dim3,
    /// Neighbor order: how many distance shells participate in flips and in
    /// the boundary predicate.
    pub neighbor_order: usize,
    /// Global temperature, used when no per-type motility applies.
    pub temperature: f64,
    /// Deterministic seed; entropy-seeded when absent.
    pub rng_seed: Option<u64>,
    /// Boundary condition along x.
    pub boundary_x: BoundaryKind,
    /// Boundary condition along y.
    pub boundary_y: BoundaryKind,
    /// Boundary condition along z.
    pub boundary_z: BoundaryKind,
    /// Cell types whose pixels never participate in flips.
    pub frozen_types: Vec<u8>,
    /// Candidate-selection strategy.
    pub metropolis_algorithm: MetropolisAlgorithm,
    /// Acceptance-probability model.
    pub acceptance_function: AcceptanceChoice,
    /// Fluctuation-amplitude combination model.
    pub fluctuation_amplitude: FluctuationAmplitudeFunction,
    /// Per-type motility, indexed by type id. Empty means the global
    /// temperature applies to every flip.
    pub cell_type_motility: Vec<f64>,
    /// Flip workers; zero means the rayon pool width.
    pub worker_count: usize,
    /// Emit a per-step debug summary every this many steps; zero disables.
    pub debug_output_frequency: u32,
}

impl Default for PottsConfig {
    fn default() -> Self {
        Self {
            dim: Dim3::new(64, 64, 64),
            neighbor_order: 1,
            temperature: 10.0,
            rng_seed: None,
            boundary_x: BoundaryKind::NoFlux,
            boundary_y: BoundaryKind::NoFlux,
            boundary_z: BoundaryKind::NoFlux,
            frozen_types: Vec::new(),
            metropolis_algorithm: MetropolisAlgorithm::Fast,
            acceptance_function: AcceptanceChoice::Default,
            fluctuation_amplitude: FluctuationAmplitudeFunction::Min,
            cell_type_motility: Vec::new(),
            worker_count: 0,
            debug_output_frequency: 0,
        }
    }
}

impl PottsConfig {
    /// Validate invariants that the type system cannot encode.
    pub fn validate(&self) -> Result<(), PottsError> {
        if self.dim.x <= 0 || self.dim.y <= 0 || self.dim.z <= 0 {
            return Err(PottsError::InvalidConfig(
                "lattice dimensions must be positive",
            ));
        }
        if self.neighbor_order == 0 {
            return Err(PottsError::InvalidConfig(
                "neighbor order must be at least 1",
            ));
        }
        if self.neighbor_order > 10 {
            return Err(PottsError::InvalidConfig(
                "neighbor order above 10 is not supported",
            ));
        }
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return Err(PottsError::InvalidConfig(
                "temperature must be finite and non-negative",
            ));
        }
        if self
            .cell_type_motility
            .iter()
            .any(|m| !m.is_finite() || *m < 0.0)
        {
            return Err(PottsError::InvalidConfig(
                "cell type motilities must be finite and non-negative",
            ));
        }
        Ok(())
    }

    /// Master RNG for this configuration.
    #[must_use]
    pub fn seeded_rng(&self) -> SmallRng {
        match self.rng_seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::seed_from_u64(rand::random::<u64>()),
        }
    }

    fn boundaries(&self) -> [BoundaryKind; 3] {
        [self.boundary_x, self.boundary_y, self.boundary_z]
    }

    fn frozen_lookup(&self) -> [bool; 256] {
        let mut frozen = [false; 256];
        for type_id in &self.frozen_types {
            frozen[*type_id as usize] = true;
        }
        frozen
    }
}

// ---------------------------------------------------------------------------
// Diagnostics
// ---------------------------------------------------------------------------

/// Per-attempt energy bookkeeping, recorded only while enabled.
#[derive(Debug, Default)]
struct EnergyDiagnostics {
    enabled: bool,
    changes: Vec<Vec<f64>>,
    results: Vec<bool>,
}

impl EnergyDiagnostics {
    fn begin_pass(&mut self) {
        self.changes.clear();
        self.results.clear();
    }

    fn record(&mut self, breakdown: Option<Vec<f64>>, accepted: bool) {
        if !self.enabled {
            return;
        }
        self.changes.push(breakdown.unwrap_or_default());
        self.results.push(accepted);
    }
}

// ---------------------------------------------------------------------------
// Flip driver
// ---------------------------------------------------------------------------

/// Worker-local state for one flip worker: an independent RNG stream and the
/// shared neighbor-offset table.
struct WorkerContext {
    rng: SmallRng,
    table: NeighborTable,
}

/// Candidate flip evaluated against the lattice as seen at proposal time.
struct FlipProposal {
    pt: Point3,
    new_label: Label,
    old_label: Label,
    delta: f64,
    breakdown: Option<Vec<f64>>,
    amplitude: f64,
    sample: f64,
}

/// The simulation core: lattice, registry, boundary index, energy
/// aggregation, and the Metropolis driver.
pub struct PottsState {
    config: PottsConfig,
    field: Field3<Label>,
    registry: CellRegistry,
    boundary: BoundaryTracker,
    neighbor_table: NeighborTable,
    energy: EnergyAggregator,
    diagnostics: EnergyDiagnostics,
    acceptance: AcceptanceFunction,
    custom_acceptance: Option<AcceptanceExpr>,
    fluctuation: FluctuationAmplitudeFunction,
    algorithm: MetropolisAlgorithm,
    frozen: [bool; 256],
    rng: SmallRng,
    temperature: f64,
    total_energy: f64,
    mcs: Mcs,
    number_of_attempts: u32,
    current_attempt: u32,
    attempted_calculations: u32,
    accepted_flips: u32,
    steppers: Vec<Box<dyn Stepper>>,
    fixed_steppers: Vec<Box<dyn FixedStepper>>,
    field_watchers: Vec<Box<dyn FieldChangeWatcher>>,
    type_watchers: Vec<Box<dyn TypeChangeWatcher>>,
    attribute_adders: Vec<Box<dyn AttributeAdder>>,
}

impl fmt::Debug for PottsState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PottsState")
            .field("dim", &self.field.dim())
            .field("mcs", &self.mcs)
            .field("cells", &self.registry.len())
            .field("boundary_points", &self.boundary.len())
            .field("total_energy", &self.total_energy)
            .finish_non_exhaustive()
    }
}

impl PottsState {
    /// Build a state from a validated configuration. The lattice starts as
    /// all-medium with an empty registry.
    pub fn new(config: PottsConfig) -> Result<Self, PottsError> {
        config.validate()?;
        let field = Field3::new(config.dim, config.boundaries())?;
        let neighbor_table = NeighborTable::new(config.neighbor_order);
        let rng = config.seeded_rng();
        let frozen = config.frozen_lookup();
        let mut state = Self {
            field,
            registry: CellRegistry::new(),
            boundary: BoundaryTracker::default(),
            neighbor_table,
            energy: EnergyAggregator::default(),
            diagnostics: EnergyDiagnostics::default(),
            acceptance: AcceptanceFunction::Metropolis,
            custom_acceptance: None,
            fluctuation: config.fluctuation_amplitude,
            algorithm: config.metropolis_algorithm,
            frozen,
            rng,
            temperature: config.temperature,
            total_energy: 0.0,
            mcs: Mcs::ZERO,
            number_of_attempts: 0,
            current_attempt: 0,
            attempted_calculations: 0,
            accepted_flips: 0,
            steppers: Vec::new(),
            fixed_steppers: Vec::new(),
            field_watchers: Vec::new(),
            type_watchers: Vec::new(),
            attribute_adders: Vec::new(),
            config,
        };
        state.acceptance = state.resolve_acceptance(state.config.acceptance_function)?;
        Ok(state)
    }

    /// Re-apply a configuration to a running state.
    ///
    /// Steers temperature, frozen types, motilities, neighbor order, boundary
    /// conditions, lattice dimensions, and the algorithm/acceptance/
    /// fluctuation selections. Dimension changes resize without shifting.
    pub fn update(&mut self, config: PottsConfig) -> Result<(), PottsError> {
        config.validate()?;
        let acceptance = self.resolve_acceptance(config.acceptance_function)?;
        self.field.set_boundaries(config.boundaries());
        if config.dim != self.field.dim() {
            self.field.resize(config.dim, Point3::default())?;
            self.recount_volumes();
        }
        if config.neighbor_order != self.neighbor_table.order() {
            self.neighbor_table = NeighborTable::new(config.neighbor_order);
        }
        self.frozen = config.frozen_lookup();
        self.temperature = config.temperature;
        self.fluctuation = config.fluctuation_amplitude;
        self.algorithm = config.metropolis_algorithm;
        self.acceptance = acceptance;
        self.config = config;
        self.rebuild_boundary();
        Ok(())
    }

    fn resolve_acceptance(
        &self,
        choice: AcceptanceChoice,
    ) -> Result<AcceptanceFunction, PottsError> {
        match choice {
            AcceptanceChoice::Default => Ok(AcceptanceFunction::Metropolis),
            AcceptanceChoice::FirstOrderExpansion => Ok(AcceptanceFunction::FirstOrderExpansion),
            AcceptanceChoice::Custom => self
                .custom_acceptance
                .clone()
                .map(AcceptanceFunction::Custom)
                .ok_or(PottsError::InvalidConfig(
                    "custom acceptance selected but no expression registered",
                )),
        }
    }

    /// Register the expression backing the `Custom` acceptance model.
    pub fn register_custom_acceptance(&mut self, expr: AcceptanceExpr) {
        if self.config.acceptance_function == AcceptanceChoice::Custom {
            self.acceptance = AcceptanceFunction::Custom(Arc::clone(&expr));
        }
        self.custom_acceptance = Some(expr);
    }

    /// Select the acceptance model.
    pub fn set_acceptance_function(&mut self, choice: AcceptanceChoice) -> Result<(), PottsError> {
        self.acceptance = self.resolve_acceptance(choice)?;
        self.config.acceptance_function = choice;
        Ok(())
    }

    /// Select the acceptance model by registered name.
    pub fn set_acceptance_function_by_name(&mut self, name: &str) -> Result<(), PottsError> {
        self.set_acceptance_function(AcceptanceChoice::from_name(name)?)
    }

    /// Select the fluctuation-amplitude model.
    pub fn set_fluctuation_amplitude(&mut self, model: FluctuationAmplitudeFunction) {
        self.fluctuation = model;
        self.config.fluctuation_amplitude = model;
    }

    /// Select the candidate-selection strategy.
    pub fn set_metropolis_algorithm(&mut self, algorithm: MetropolisAlgorithm) {
        self.algorithm = algorithm;
        self.config.metropolis_algorithm = algorithm;
    }

    /// Replace the frozen type set; the boundary predicate depends on it, so
    /// the index is rebuilt.
    pub fn set_frozen_types(&mut self, types: &[u8]) {
        self.config.frozen_types = types.to_vec();
        self.frozen = self.config.frozen_lookup();
        self.rebuild_boundary();
    }

    // -- energy surface ----------------------------------------------------

    /// Register an energy term under `name`, replacing in place on re-use.
    pub fn register_energy_function(&mut self, name: impl Into<String>, term: Box<dyn EnergyTerm>) {
        self.energy.register(name, term);
    }

    /// Remove an energy term; unknown names warn and return `false`.
    pub fn unregister_energy_function(&mut self, name: &str) -> bool {
        self.energy.unregister(name)
    }

    /// Registered energy term names in evaluation order.
    #[must_use]
    pub fn energy_function_names(&self) -> Vec<&str> {
        self.energy.names()
    }

    /// Register a builder so terms can be constructed by type name.
    pub fn register_energy_builder(&mut self, name: impl Into<String>, builder: EnergyTermBuilder) {
        self.energy.register_builder(name, builder);
    }

    /// Build and register a term from a registered builder.
    pub fn create_energy_function(&mut self, type_name: &str) -> Result<(), PottsError> {
        self.energy.create(type_name)
    }

    /// Install the connectivity constraint.
    pub fn register_connectivity_constraint(&mut self, term: Box<dyn EnergyTerm>) {
        self.energy.register_connectivity_constraint(term);
    }

    /// Toggle the connectivity constraint.
    pub fn set_connectivity_enabled(&mut self, enabled: bool) {
        self.energy.set_connectivity_enabled(enabled);
    }

    /// Energy change of relabeling `pt` to `new_label`, against the current
    /// lattice.
    #[must_use]
    pub fn change_energy(&self, pt: Point3, new_label: Label, old_label: Label) -> f64 {
        let view = self.view();
        self.energy.change_energy(&view, pt, new_label, old_label)
    }

    /// Recompute the total energy from scratch and adopt it as the running
    /// total.
    pub fn recompute_total_energy(&mut self) -> f64 {
        let total = {
            let view = self.view();
            self.energy.total_energy(&view)
        };
        self.total_energy = total;
        total
    }

    fn view(&self) -> LatticeView<'_> {
        LatticeView {
            field: &self.field,
            registry: &self.registry,
            neighbors: &self.neighbor_table,
        }
    }

    // -- diagnostics -------------------------------------------------------

    /// Enable or disable per-attempt energy bookkeeping.
    pub fn set_diagnostics(&mut self, enabled: bool) {
        self.diagnostics.enabled = enabled;
    }

    /// Per-term energy changes of the most recent step's evaluated attempts.
    #[must_use]
    pub fn current_energy_changes(&self) -> &[Vec<f64>] {
        &self.diagnostics.changes
    }

    /// Accept/reject outcomes of the most recent step's evaluated attempts.
    #[must_use]
    pub fn current_flip_results(&self) -> &[bool] {
        &self.diagnostics.results
    }

    // -- hooks -------------------------------------------------------------

    /// Register a post-step hook.
    pub fn register_stepper(&mut self, stepper: Box<dyn Stepper>) {
        self.steppers.push(stepper);
    }

    /// Register a fixed stepper; `front` inserts it ahead of the existing
    /// ones. Returns the current index of the new stepper.
    pub fn register_fixed_stepper(&mut self, stepper: Box<dyn FixedStepper>, front: bool) -> usize {
        if front {
            self.fixed_steppers.insert(0, stepper);
            0
        } else {
            self.fixed_steppers.push(stepper);
            self.fixed_steppers.len() - 1
        }
    }

    /// Remove a fixed stepper by its current index.
    pub fn unregister_fixed_stepper(&mut self, index: usize) -> Option<Box<dyn FixedStepper>> {
        if index < self.fixed_steppers.len() {
            Some(self.fixed_steppers.remove(index))
        } else {
            None
        }
    }

    /// Register a lattice label-change observer.
    pub fn register_field_change_watcher(&mut self, watcher: Box<dyn FieldChangeWatcher>) {
        self.field_watchers.push(watcher);
    }

    /// Register an occupant-type-change observer.
    pub fn register_type_change_watcher(&mut self, watcher: Box<dyn TypeChangeWatcher>) {
        self.type_watchers.push(watcher);
    }

    /// Register a cell lifecycle observer.
    pub fn register_attribute_adder(&mut self, adder: Box<dyn AttributeAdder>) {
        self.attribute_adders.push(adder);
    }

    fn run_fixed_steppers(&mut self) {
        let mut steppers = std::mem::take(&mut self.fixed_steppers);
        for stepper in &mut steppers {
            stepper.step(self);
        }
        steppers.append(&mut self.fixed_steppers);
        self.fixed_steppers = steppers;
    }

    fn run_steppers(&mut self) {
        let mut steppers = std::mem::take(&mut self.steppers);
        for stepper in &mut steppers {
            stepper.step(self);
        }
        steppers.append(&mut self.steppers);
        self.steppers = steppers;
    }

    // -- cell lifecycle ----------------------------------------------------

    /// Create a cell and bind it to the (resolved) point `pt`.
    pub fn create_cell_at(
        &mut self,
        pt: Point3,
        type_id: u8,
        cluster_id: Option<u64>,
    ) -> Result<CellKey, PottsError> {
        let resolved = self
            .field
            .resolve(pt)
            .ok_or(PottsError::Lattice(LatticeError::OutOfBounds(pt)))?;
        let key = self.registry.create(type_id, cluster_id);
        self.set_cell_label(resolved, Some(key))?;
        self.notify_cell_created(key);
        Ok(key)
    }

    /// Create a cell with explicit ids and bind it to `pt`.
    pub fn create_cell_with_ids(
        &mut self,
        pt: Point3,
        id: u64,
        cluster_id: u64,
        type_id: u8,
    ) -> Result<CellKey, PottsError> {
        let resolved = self
            .field
            .resolve(pt)
            .ok_or(PottsError::Lattice(LatticeError::OutOfBounds(pt)))?;
        let key = self.registry.create_with_ids(id, cluster_id, type_id)?;
        self.set_cell_label(resolved, Some(key))?;
        self.notify_cell_created(key);
        Ok(key)
    }

    fn notify_cell_created(&mut self, key: CellKey) {
        if self.attribute_adders.is_empty() {
            return;
        }
        let Some(record) = self.registry.get(key).copied() else {
            return;
        };
        for adder in &mut self.attribute_adders {
            adder.cell_created(key, &record);
        }
    }

    /// Destroy a cell, optionally clearing its remaining lattice footprint.
    ///
    /// With `cleanup_lattice` the footprint is scanned out and the boundary
    /// index rebuilt; without it the caller has already drained the footprint
    /// (the volume-zero cascade path).
    pub fn destroy_cell(&mut self, key: CellKey, cleanup_lattice: bool) -> Option<CellRecord> {
        if !self.registry.contains(key) {
            return None;
        }
        if cleanup_lattice {
            let footprint: Vec<Point3> = self
                .field
                .iter_points()
                .filter(|pt| self.field.at(*pt) == Some(Some(key)))
                .collect();
            for pt in &footprint {
                // Resolved points; the write cannot fail.
                let _ = self.field.set(*pt, None);
            }
            if !footprint.is_empty() {
                self.rebuild_boundary();
            }
            for pt in footprint {
                for watcher in &mut self.field_watchers {
                    watcher.field_changed(pt, None, Some(key));
                }
            }
        }
        let record = self.registry.remove(key)?;
        for adder in &mut self.attribute_adders {
            adder.cell_destroyed(key, &record);
        }
        Some(record)
    }

    /// Bind a label directly, maintaining volumes, the boundary index, and
    /// field watchers. This is the initialization path; the flip driver goes
    /// through the same bookkeeping.
    ///
    /// A cell whose footprint reaches zero is destroyed in cascade.
    pub fn set_cell_label(&mut self, pt: Point3, new_label: Label) -> Result<Label, PottsError> {
        let old_label = self.field.set(pt, new_label)?;
        if let Some(key) = new_label
            && let Some(record) = self.registry.get_mut(key)
        {
            record.volume += 1;
        }
        let mut emptied = None;
        if let Some(key) = old_label
            && let Some(record) = self.registry.get_mut(key)
        {
            record.volume = record.volume.saturating_sub(1);
            if record.volume == 0 {
                emptied = Some(key);
            }
        }
        if let Some(key) = emptied {
            self.destroy_cell(key, false);
        }
        {
            let registry = &self.registry;
            let frozen = &self.frozen;
            self.boundary
                .update_around(&self.field, &self.neighbor_table, pt, &|label| {
                    frozen[label_type(registry, label) as usize]
                });
        }
        for watcher in &mut self.field_watchers {
            watcher.field_changed(pt, new_label, old_label);
        }
        Ok(old_label)
    }

    /// Reset every lattice site to medium.
    ///
    /// With `reset_registry` all cells are destroyed; without it the records
    /// survive with zero volume, awaiting a bulk re-bind.
    pub fn clean_cell_field(&mut self, reset_registry: bool) {
        self.field.clear();
        if reset_registry {
            let keys: Vec<CellKey> = self.registry.keys().collect();
            for key in keys {
                self.destroy_cell(key, false);
            }
        } else {
            for (_, record) in self.registry.iter_mut() {
                record.volume = 0;
            }
        }
        self.total_energy = 0.0;
        self.rebuild_boundary();
    }

    /// Resize the lattice, shifting retained content by `shift`; footprints
    /// are recounted and cells shifted out of the addressable volume are
    /// destroyed.
    pub fn resize_cell_field(&mut self, dim: Dim3, shift: Point3) -> Result<(), PottsError> {
        self.field.resize(dim, shift)?;
        self.config.dim = dim;
        self.recount_volumes();
        self.rebuild_boundary();
        Ok(())
    }

    fn recount_volumes(&mut self) {
        let mut footprints: HashMap<CellKey, u64> = HashMap::new();
        for pt in self.field.iter_points() {
            if let Some(key) = self.field.at(pt).flatten() {
                *footprints.entry(key).or_default() += 1;
            }
        }
        let emptied: Vec<CellKey> = self
            .registry
            .keys()
            .filter(|key| !footprints.contains_key(key))
            .collect();
        for (key, record) in self.registry.iter_mut() {
            record.volume = footprints.get(&key).copied().unwrap_or(0);
        }
        for key in emptied {
            self.destroy_cell(key, false);
        }
    }

    /// Rebuild the boundary index from the membership predicate.
    pub fn rebuild_boundary(&mut self) {
        {
            let registry = &self.registry;
            let frozen = &self.frozen;
            self.boundary
                .rebuild(&self.field, &self.neighbor_table, &|label| {
                    frozen[label_type(registry, label) as usize]
                });
        }
        debug!(points = self.boundary.len(), "boundary index rebuilt");
    }

    // -- audits ------------------------------------------------------------

    /// Verify the boundary index against the membership predicate at every
    /// site. Disagreement is a fatal invariant violation.
    pub fn check_boundary_consistency(&self) -> Result<(), PottsError> {
        let registry = &self.registry;
        let frozen = &self.frozen;
        let frozen_fn = |label: Label| frozen[label_type(registry, label) as usize];
        for pt in self.field.iter_points() {
            let expected =
                BoundaryTracker::is_boundary(&self.field, &self.neighbor_table, pt, &frozen_fn);
            let tracked = self.boundary.contains(pt);
            if expected != tracked {
                return Err(PottsError::BoundaryDesync {
                    point: pt,
                    tracked,
                    expected,
                });
            }
        }
        Ok(())
    }

    /// Verify that every lattice label has a live record with the correct
    /// volume and that every record has a footprint.
    pub fn check_registry_sync(&self) -> Result<(), PottsError> {
        let mut footprints: HashMap<CellKey, u64> = HashMap::new();
        for pt in self.field.iter_points() {
            if let Some(key) = self.field.at(pt).flatten() {
                *footprints.entry(key).or_default() += 1;
            }
        }
        for (key, count) in &footprints {
            match self.registry.get(*key) {
                None => {
                    return Err(PottsError::RegistryDesync(format!(
                        "label {key:?} occupies {count} sites without a registry record"
                    )));
                }
                Some(record) if record.volume != *count => {
                    return Err(PottsError::RegistryDesync(format!(
                        "cell {} records volume {} but occupies {count} sites",
                        record.id, record.volume
                    )));
                }
                Some(_) => {}
            }
        }
        for (key, record) in self.registry.iter() {
            if !footprints.contains_key(&key) {
                return Err(PottsError::RegistryDesync(format!(
                    "cell {} has no lattice footprint",
                    record.id
                )));
            }
        }
        Ok(())
    }

    // -- flip driver -------------------------------------------------------

    /// Run one Monte Carlo step: `steps` flip attempts at the given
    /// temperature, using the configured strategy. Returns the number of
    /// accepted flips. Fixed steppers and steppers run after the budget is
    /// exhausted.
    pub fn metropolis(&mut self, steps: u32, temperature: f64) -> u32 {
        self.temperature = temperature;
        self.number_of_attempts = steps;
        self.current_attempt = 0;
        self.attempted_calculations = 0;
        self.boundary.clear_deltas();
        self.diagnostics.begin_pass();

        let accepted = match self.algorithm {
            MetropolisAlgorithm::List => self.metropolis_list(steps),
            MetropolisAlgorithm::Fast => self.metropolis_fast(steps),
            MetropolisAlgorithm::BoundaryWalker => self.metropolis_boundary_walker(steps),
        };

        self.accepted_flips = accepted;
        self.mcs = self.mcs.next();
        self.run_fixed_steppers();
        self.run_steppers();

        debug_assert!(self.check_boundary_consistency().is_ok());
        if self.config.debug_output_frequency > 0
            && self.mcs.0.is_multiple_of(u64::from(self.config.debug_output_frequency))
        {
            debug!(
                mcs = self.mcs.0,
                attempts = steps,
                accepted,
                energy = self.total_energy,
                "metropolis step complete"
            );
        }
        accepted
    }

    fn metropolis_list(&mut self, steps: u32) -> u32 {
        let order = self.neighbor_table.order();
        self.run_attempts(steps, move |ctx, field, _boundary| {
            let pt = random_point(&mut ctx.rng, field.dim());
            // Rebuilds the offset list for every attempt. Exact but slow;
            // the baseline the other strategies are checked against.
            let table = NeighborTable::new(order);
            let offset = table.offsets()[ctx.rng.random_range(0..table.len())];
            let neighbor = field.resolve(pt + offset)?;
            Some((pt, neighbor))
        })
    }

    fn metropolis_fast(&mut self, steps: u32) -> u32 {
        self.run_attempts(steps, |ctx, field, _boundary| {
            let pt = random_point(&mut ctx.rng, field.dim());
            let idx = ctx.rng.random_range(0..ctx.table.len());
            let neighbor = field.resolve(pt + ctx.table.offsets()[idx])?;
            Some((pt, neighbor))
        })
    }

    fn metropolis_boundary_walker(&mut self, steps: u32) -> u32 {
        self.run_attempts(steps, |ctx, field, boundary| {
            let pt = boundary.random_pick(&mut ctx.rng)?;
            let idx = ctx.rng.random_range(0..ctx.table.len());
            let neighbor = field.resolve(pt + ctx.table.offsets()[idx])?;
            Some((pt, neighbor))
        })
    }

    /// Shared driver: rounds of up to `worker_count` proposals evaluated in
    /// parallel against a read-only snapshot, then committed serially.
    ///
    /// A proposal whose flip neighborhood overlaps an earlier apply from the
    /// same round is re-evaluated against the mutated lattice before its
    /// accept decision; the stored uniform sample keeps the decision
    /// consistent with the original draw.
    fn run_attempts<F>(&mut self, steps: u32, select: F) -> u32
    where
        F: Fn(&mut WorkerContext, &Field3<Label>, &BoundaryTracker) -> Option<(Point3, Point3)>
            + Sync,
    {
        let workers = self.effective_workers();
        let mut contexts = self.worker_contexts(workers);
        let reach = self.neighbor_table.max_reach();
        let mut accepted_total = 0u32;
        let mut remaining = steps;

        while remaining > 0 {
            let batch = remaining.min(workers as u32) as usize;
            let proposals: Vec<Option<FlipProposal>> = {
                let field = &self.field;
                let registry = &self.registry;
                let boundary = &self.boundary;
                let energy = &self.energy;
                let frozen = &self.frozen;
                let motilities = self.config.cell_type_motility.as_slice();
                let fluctuation = self.fluctuation;
                let temperature = self.temperature;
                let with_breakdown = self.diagnostics.enabled;
                let neighbor_table = &self.neighbor_table;
                let select = &select;
                contexts[..batch]
                    .par_iter_mut()
                    .map(|ctx| -> Option<FlipProposal> {
                        let (pt, neighbor) = select(ctx, field, boundary)?;
                        let old_label = field.at(pt)?;
                        let new_label = field.at(neighbor)?;
                        if new_label == old_label {
                            return None;
                        }
                        let old_type = label_type(registry, old_label);
                        let new_type = label_type(registry, new_label);
                        if frozen[old_type as usize] || frozen[new_type as usize] {
                            return None;
                        }
                        let view = LatticeView {
                            field,
                            registry,
                            neighbors: neighbor_table,
                        };
                        let (delta, breakdown) = if with_breakdown {
                            let (delta, per_term) =
                                energy.change_energy_breakdown(&view, pt, new_label, old_label);
                            (delta, Some(per_term))
                        } else {
                            (energy.change_energy(&view, pt, new_label, old_label), None)
                        };
                        let amplitude = fluctuation.resolve(
                            type_motility(motilities, new_type, new_label),
                            type_motility(motilities, old_type, old_label),
                            temperature,
                        );
                        Some(FlipProposal {
                            pt,
                            new_label,
                            old_label,
                            delta,
                            breakdown,
                            amplitude,
                            sample: ctx.rng.random::<f64>(),
                        })
                    })
                    .collect()
            };

            let mut applied: SmallVec<[Point3; 8]> = SmallVec::new();
            for proposal in proposals.into_iter().flatten() {
                self.attempted_calculations += 1;
                let FlipProposal {
                    pt,
                    new_label,
                    old_label,
                    mut delta,
                    mut breakdown,
                    amplitude,
                    sample,
                } = proposal;

                // An earlier commit may have evaporated the target cell
                // entirely; adopting its dead key would desync the registry.
                if let Some(key) = new_label
                    && !self.registry.contains(key)
                {
                    self.diagnostics.record(breakdown, false);
                    continue;
                }

                let stale = applied
                    .iter()
                    .any(|prev| self.field.wrapped_chebyshev(*prev, pt) <= 2 * reach);
                if stale {
                    if self.field.at(pt) != Some(old_label) {
                        self.diagnostics.record(breakdown, false);
                        continue;
                    }
                    let view = self.view();
                    if breakdown.is_some() {
                        let (d, per_term) =
                            self.energy
                                .change_energy_breakdown(&view, pt, new_label, old_label);
                        delta = d;
                        breakdown = Some(per_term);
                    } else {
                        delta = self.energy.change_energy(&view, pt, new_label, old_label);
                    }
                }

                let accepted = sample < self.acceptance.probability(delta, amplitude);
                self.diagnostics.record(breakdown, accepted);
                if accepted {
                    self.apply_flip(pt, new_label, old_label, delta);
                    applied.push(pt);
                    accepted_total += 1;
                }
            }

            self.current_attempt += batch as u32;
            remaining -= batch as u32;
        }
        accepted_total
    }

    fn apply_flip(&mut self, pt: Point3, new_label: Label, old_label: Label, delta: f64) {
        let old_type = self.label_type(old_label);
        let new_type = self.label_type(new_label);
        if self.set_cell_label(pt, new_label).is_err() {
            debug_assert!(false, "accepted flip targeted an unresolvable point");
            return;
        }
        self.total_energy += delta;
        if new_type != old_type {
            for watcher in &mut self.type_watchers {
                watcher.type_changed(pt, old_type, new_type);
            }
        }
    }

    fn effective_workers(&self) -> usize {
        if self.config.worker_count == 0 {
            rayon::current_num_threads().max(1)
        } else {
            self.config.worker_count
        }
    }

    fn worker_contexts(&mut self, count: usize) -> Vec<WorkerContext> {
        (0..count)
            .map(|_| WorkerContext {
                rng: SmallRng::seed_from_u64(self.rng.random::<u64>()),
                table: self.neighbor_table.clone(),
            })
            .collect()
    }

    // -- accessors ---------------------------------------------------------

    /// Current running total energy.
    #[must_use]
    pub fn energy(&self) -> f64 {
        self.total_energy
    }

    /// Temperature of the most recent (or running) step.
    #[must_use]
    pub fn temperature(&self) -> f64 {
        self.temperature
    }

    /// Completed Monte Carlo steps.
    #[must_use]
    pub fn mcs(&self) -> Mcs {
        self.mcs
    }

    /// Attempt budget of the most recent step.
    #[must_use]
    pub fn number_of_attempts(&self) -> u32 {
        self.number_of_attempts
    }

    /// Attempts consumed so far within the current step.
    #[must_use]
    pub fn current_attempt(&self) -> u32 {
        self.current_attempt
    }

    /// Attempts of the most recent step that reached energy evaluation.
    #[must_use]
    pub fn attempted_energy_calculations(&self) -> u32 {
        self.attempted_calculations
    }

    /// Accepted flips of the most recent step.
    #[must_use]
    pub fn accepted_flips(&self) -> u32 {
        self.accepted_flips
    }

    /// Number of live cells.
    #[must_use]
    pub fn cell_count(&self) -> usize {
        self.registry.len()
    }

    /// The cell registry.
    #[must_use]
    pub fn registry(&self) -> &CellRegistry {
        &self.registry
    }

    /// Record for a cell handle.
    #[must_use]
    pub fn cell(&self, key: CellKey) -> Option<&CellRecord> {
        self.registry.get(key)
    }

    /// Mutable record for a cell handle.
    pub fn cell_mut(&mut self, key: CellKey) -> Option<&mut CellRecord> {
        self.registry.get_mut(key)
    }

    /// Occupant of `pt`, if it resolves.
    #[must_use]
    pub fn cell_at(&self, pt: Point3) -> Option<CellKey> {
        self.field.at(pt).flatten()
    }

    /// The label lattice.
    #[must_use]
    pub fn field(&self) -> &Field3<Label> {
        &self.field
    }

    /// The boundary index.
    #[must_use]
    pub fn boundary(&self) -> &BoundaryTracker {
        &self.boundary
    }

    /// The neighbor-offset table in use.
    #[must_use]
    pub fn neighbor_table(&self) -> &NeighborTable {
        &self.neighbor_table
    }

    /// The active configuration.
    #[must_use]
    pub fn config(&self) -> &PottsConfig {
        &self.config
    }

    /// Type id carried by the occupant of a label.
    #[must_use]
    pub fn label_type(&self, label: Label) -> u8 {
        label_type(&self.registry, label)
    }

    /// Whether a type id is frozen.
    #[must_use]
    pub fn is_frozen_type(&self, type_id: u8) -> bool {
        self.frozen[type_id as usize]
    }
}

fn random_point(rng: &mut SmallRng, dim: Dim3) -> Point3 {
    Point3::new(
        rng.random_range(0..dim.x),
        rng.random_range(0..dim.y),
        rng.random_range(0..dim.z),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Uniform contact penalty: `j` per neighboring site pair with differing
    /// labels.
    struct ContactPenalty {
        j: f64,
    }

    impl EnergyTerm for ContactPenalty {
        fn delta(
            &self,
            view: &LatticeView<'_>,
            pt: Point3,
            new_label: Label,
            old_label: Label,
        ) -> f64 {
            let mut before = 0i32;
            let mut after = 0i32;
            for neighbor in view.field.neighbors(pt, view.neighbors) {
                let label = view.field.at(neighbor).unwrap_or_default();
                if label != old_label {
                    before += 1;
                }
                if label != new_label {
                    after += 1;
                }
            }
            self.j * f64::from(after - before)
        }

        fn total(&self, view: &LatticeView<'_>) -> f64 {
            let mut mismatched_ordered = 0i64;
            for pt in view.field.iter_points() {
                let label = view.field.at(pt).unwrap_or_default();
                for neighbor in view.field.neighbors(pt, view.neighbors) {
                    if view.field.at(neighbor).unwrap_or_default() != label {
                        mismatched_ordered += 1;
                    }
                }
            }
            self.j * (mismatched_ordered as f64) / 2.0
        }
    }

    /// Quadratic volume constraint toward a target footprint.
    struct VolumeConstraint {
        lambda: f64,
        target: f64,
    }

    impl VolumeConstraint {
        fn volume(&self, registry: &CellRegistry, label: Label) -> Option<f64> {
            label
                .and_then(|key| registry.get(key))
                .map(|record| record.volume as f64)
        }

        fn energy(&self, volume: f64) -> f64 {
            let diff = volume - self.target;
            self.lambda * diff * diff
        }
    }

    impl EnergyTerm for VolumeConstraint {
        fn delta(
            &self,
            view: &LatticeView<'_>,
            _pt: Point3,
            new_label: Label,
            old_label: Label,
        ) -> f64 {
            let mut delta = 0.0;
            if let Some(v) = self.volume(view.registry, new_label) {
                delta += self.energy(v + 1.0) - self.energy(v);
            }
            if let Some(v) = self.volume(view.registry, old_label) {
                delta += self.energy(v - 1.0) - self.energy(v);
            }
            delta
        }

        fn total(&self, view: &LatticeView<'_>) -> f64 {
            view.registry
                .iter()
                .map(|(_, record)| self.energy(record.volume as f64))
                .sum()
        }
    }

    /// Constant per-flip cost, for acceptance-path tests.
    struct FixedCost(f64);

    impl EnergyTerm for FixedCost {
        fn delta(
            &self,
            _view: &LatticeView<'_>,
            _pt: Point3,
            _new_label: Label,
            _old_label: Label,
        ) -> f64 {
            self.0
        }
    }

    fn base_config() -> PottsConfig {
        PottsConfig {
            dim: Dim3::new(10, 10, 10),
            temperature: 10.0,
            rng_seed: Some(21),
            worker_count: 1,
            ..PottsConfig::default()
        }
    }

    /// Two 50-site cells of different types filling two adjacent 5x5x2
    /// blocks, the rest medium.
    fn two_cell_state() -> (PottsState, CellKey, CellKey) {
        let mut state = PottsState::new(base_config()).expect("state");
        let a = state
            .create_cell_at(Point3::new(0, 0, 0), 1, None)
            .expect("cell a");
        let b = state
            .create_cell_at(Point3::new(5, 0, 0), 2, None)
            .expect("cell b");
        for z in 0..2 {
            for y in 0..5 {
                for x in 0..5 {
                    state
                        .set_cell_label(Point3::new(x, y, z), Some(a))
                        .expect("bind a");
                    state
                        .set_cell_label(Point3::new(x + 5, y, z), Some(b))
                        .expect("bind b");
                }
            }
        }
        (state, a, b)
    }

    #[test]
    fn registry_assigns_monotonic_ids() {
        let mut registry = CellRegistry::new();
        let a = registry.create(1, None);
        let b = registry.create(2, None);
        assert_eq!(registry.get(a).map(|r| r.id), Some(1));
        assert_eq!(registry.get(b).map(|r| r.id), Some(2));
        assert_ne!(
            registry.get(a).map(|r| r.cluster_id),
            registry.get(b).map(|r| r.cluster_id)
        );
        assert_eq!(registry.lookup(2), Some(b));
        assert_eq!(registry.recently_created_id(), 2);
    }

    #[test]
    fn explicit_ids_are_respected_and_collisions_rejected() {
        let mut registry = CellRegistry::new();
        let a = registry.create_with_ids(7, 3, 1).expect("explicit");
        assert_eq!(registry.get(a).map(|r| r.id), Some(7));
        assert_eq!(
            registry.create_with_ids(7, 4, 1),
            Err(PottsError::DuplicateCellId(7))
        );
        // Automatic ids continue past the explicit one.
        let b = registry.create(1, None);
        assert_eq!(registry.get(b).map(|r| r.id), Some(8));
    }

    #[test]
    fn create_and_destroy_cell_round_trips_through_lattice_and_boundary() {
        let mut state = PottsState::new(base_config()).expect("state");
        let pt = Point3::new(2, 3, 4);
        let key = state.create_cell_at(pt, 1, None).expect("create");

        assert_eq!(state.cell_at(pt), Some(key));
        assert_eq!(state.cell(key).map(|r| r.volume), Some(1));
        assert!(state.boundary().contains(pt));
        assert_eq!(state.cell_count(), 1);

        state.destroy_cell(key, true);
        assert_eq!(state.cell_at(pt), None);
        assert!(!state.boundary().contains(pt));
        assert!(state.boundary().is_empty());
        assert_eq!(state.cell_count(), 0);
    }

    #[test]
    fn boundary_tracker_matches_predicate_after_manual_edits() {
        let (mut state, a, _b) = two_cell_state();
        state.check_boundary_consistency().expect("after setup");
        state.check_registry_sync().expect("registry after setup");

        // Punch a hole and extend a protrusion; incremental updates must
        // keep agreeing with the predicate.
        state
            .set_cell_label(Point3::new(2, 2, 0), None)
            .expect("hole");
        state
            .set_cell_label(Point3::new(2, 2, 5), Some(a))
            .expect("protrusion");
        state.check_boundary_consistency().expect("after edits");
        state.check_registry_sync().expect("registry after edits");
    }

    #[test]
    fn interior_pixels_are_not_boundary() {
        let (state, _a, _b) = two_cell_state();
        // (2,2,0) has all six face neighbors inside cell a except z=-1,
        // which does not resolve under no-flux, and z=1 which is also a.
        assert!(!state.boundary().contains(Point3::new(2, 2, 0)));
        // The interface plane is boundary on both sides.
        assert!(state.boundary().contains(Point3::new(4, 2, 0)));
        assert!(state.boundary().contains(Point3::new(5, 2, 0)));
    }

    #[test]
    fn frozen_cells_are_excluded_from_boundary_and_flips() {
        let config = PottsConfig {
            frozen_types: vec![1],
            ..base_config()
        };
        let mut state = PottsState::new(config).expect("state");
        let key = state
            .create_cell_at(Point3::new(5, 5, 5), 1, None)
            .expect("create");
        // A lone frozen pixel: neither it nor the surrounding medium
        // qualifies, since the only differing neighbors are frozen.
        assert!(state.boundary().is_empty());

        let before: Vec<Point3> = state
            .field()
            .iter_points()
            .filter(|pt| state.cell_at(*pt) == Some(key))
            .collect();
        state.metropolis(2000, 50.0);
        let after: Vec<Point3> = state
            .field()
            .iter_points()
            .filter(|pt| state.cell_at(*pt) == Some(key))
            .collect();
        assert_eq!(before, after);

        state.set_frozen_types(&[]);
        assert!(!state.boundary().is_empty());
    }

    #[test]
    fn energy_function_registration_is_ordered_and_replaceable() {
        let mut state = PottsState::new(base_config()).expect("state");
        state.register_energy_function("Contact", Box::new(ContactPenalty { j: 1.0 }));
        state.register_energy_function("Volume", Box::new(VolumeConstraint {
            lambda: 1.0,
            target: 25.0,
        }));
        assert_eq!(state.energy_function_names(), vec!["Contact", "Volume"]);

        // Same name replaces in place, preserving order.
        state.register_energy_function("Contact", Box::new(ContactPenalty { j: 2.0 }));
        assert_eq!(state.energy_function_names(), vec!["Contact", "Volume"]);

        assert!(state.unregister_energy_function("Volume"));
        assert!(!state.unregister_energy_function("Volume"));
        assert_eq!(state.energy_function_names(), vec!["Contact"]);
    }

    #[test]
    fn energy_builders_construct_terms_by_type_name() {
        let mut state = PottsState::new(base_config()).expect("state");
        state.register_energy_builder(
            "Contact",
            Box::new(|| -> Box<dyn EnergyTerm> { Box::new(ContactPenalty { j: 1.5 }) }),
        );
        state.create_energy_function("Contact").expect("create");
        assert_eq!(state.energy_function_names(), vec!["Contact"]);
        assert_eq!(
            state.create_energy_function("Surface"),
            Err(PottsError::UnknownEnergyFunction("Surface".into()))
        );
    }

    #[test]
    fn connectivity_constraint_toggles_independently() {
        let (mut state, a, _b) = two_cell_state();
        state.register_connectivity_constraint(Box::new(FixedCost(100.0)));
        let pt = Point3::new(4, 2, 0);
        let with = state.change_energy(pt, None, Some(a));
        state.set_connectivity_enabled(false);
        let without = state.change_energy(pt, None, Some(a));
        assert!((with - without - 100.0).abs() < 1e-12);
    }

    #[test]
    fn acceptance_probabilities_match_models() {
        let metropolis = AcceptanceFunction::Metropolis;
        assert_eq!(metropolis.probability(-1.0, 0.0), 1.0);
        assert_eq!(metropolis.probability(0.0, 0.0), 1.0);
        assert_eq!(metropolis.probability(1.0, 0.0), 0.0);
        assert!((metropolis.probability(1.0, 1.0) - (-1.0f64).exp()).abs() < 1e-12);

        let first_order = AcceptanceFunction::FirstOrderExpansion;
        assert_eq!(first_order.probability(-1.0, 1.0), 1.0);
        assert!((first_order.probability(0.5, 1.0) - 0.5).abs() < 1e-12);
        assert_eq!(first_order.probability(2.0, 1.0), 0.0);

        let custom = AcceptanceFunction::Custom(Arc::new(|delta, _| 2.0 - delta));
        // Out-of-range expression values are clamped.
        assert_eq!(custom.probability(0.0, 1.0), 1.0);
        assert_eq!(custom.probability(5.0, 1.0), 0.0);
    }

    #[test]
    fn custom_acceptance_requires_a_registered_expression() {
        let mut state = PottsState::new(base_config()).expect("state");
        assert_eq!(
            state.set_acceptance_function_by_name("Custom"),
            Err(PottsError::InvalidConfig(
                "custom acceptance selected but no expression registered"
            ))
        );
        assert!(matches!(
            state.set_acceptance_function_by_name("SecondOrder"),
            Err(PottsError::UnknownAcceptanceFunction(_))
        ));

        state.register_custom_acceptance(Arc::new(|delta, _| if delta < 0.5 { 1.0 } else { 0.0 }));
        state
            .set_acceptance_function_by_name("Custom")
            .expect("custom now resolvable");
        state
            .set_acceptance_function_by_name("Default")
            .expect("back to default");
    }

    #[test]
    fn fluctuation_amplitudes_combine_motilities() {
        let min = FluctuationAmplitudeFunction::Min;
        let max = FluctuationAmplitudeFunction::Max;
        let avg = FluctuationAmplitudeFunction::ArithmeticAverage;
        assert_eq!(min.resolve(Some(10.0), Some(20.0), 5.0), 10.0);
        assert_eq!(max.resolve(Some(10.0), Some(20.0), 5.0), 20.0);
        assert_eq!(avg.resolve(Some(10.0), Some(20.0), 5.0), 15.0);
        // One-sided motility wins; no motility falls back to the global
        // temperature.
        assert_eq!(min.resolve(Some(3.0), None, 5.0), 3.0);
        assert_eq!(max.resolve(None, None, 5.0), 5.0);

        assert!(FluctuationAmplitudeFunction::from_name("ArithmeticAverage").is_ok());
        assert!(matches!(
            FluctuationAmplitudeFunction::from_name("GeometricMean"),
            Err(PottsError::UnknownFluctuationFunction(_))
        ));
    }

    #[test]
    fn config_validation_rejects_bad_values() {
        let mut config = base_config();
        config.dim = Dim3::new(0, 4, 4);
        assert!(matches!(
            PottsState::new(config),
            Err(PottsError::InvalidConfig(_))
        ));

        let mut config = base_config();
        config.neighbor_order = 0;
        assert!(config.validate().is_err());

        let mut config = base_config();
        config.temperature = -1.0;
        assert!(config.validate().is_err());

        let mut config = base_config();
        config.cell_type_motility = vec![5.0, -2.0];
        assert!(config.validate().is_err());
    }

    #[test]
    fn algorithm_names_parse() {
        assert_eq!(
            MetropolisAlgorithm::from_name("BoundaryWalker"),
            Ok(MetropolisAlgorithm::BoundaryWalker)
        );
        assert!(matches!(
            MetropolisAlgorithm::from_name("Turbo"),
            Err(PottsError::UnknownAlgorithm(_))
        ));
    }

    #[test]
    fn zero_temperature_accepts_no_costly_flips() {
        let (mut state, _a, _b) = two_cell_state();
        state.register_energy_function("Cost", Box::new(FixedCost(1.0)));
        let accepted = state.metropolis(1000, 0.0);
        assert_eq!(accepted, 0);
        assert_eq!(state.accepted_flips(), 0);
        assert!(state.attempted_energy_calculations() > 0);
        assert_eq!(state.current_attempt(), 1000);
        assert_eq!(state.number_of_attempts(), 1000);
    }

    #[test]
    fn volume_penalty_at_zero_temperature_only_shrinks_cells() {
        let (mut state, _a, _b) = two_cell_state();
        state.register_energy_function(
            "Volume",
            Box::new(VolumeConstraint {
                lambda: 1.0,
                target: 0.0,
            }),
        );
        state.recompute_total_energy();
        let before = state.energy();
        let accepted = state.metropolis(5000, 0.0);
        assert!(accepted > 0);
        assert!(state.energy() < before);
        state.check_registry_sync().expect("registry sync");
        state.check_boundary_consistency().expect("boundary sync");
        // Volumes never grow at zero temperature under a shrinking penalty.
        for (_, record) in state.registry().iter() {
            assert!(record.volume <= 50);
        }
    }

    #[test]
    fn running_energy_matches_full_recompute() {
        let (mut state, _a, _b) = two_cell_state();
        state.register_energy_function("Contact", Box::new(ContactPenalty { j: 2.0 }));
        state.register_energy_function(
            "Volume",
            Box::new(VolumeConstraint {
                lambda: 0.5,
                target: 50.0,
            }),
        );
        state.recompute_total_energy();
        state.metropolis(3000, 8.0);
        let running = state.energy();
        let recomputed = state.recompute_total_energy();
        assert!(
            (running - recomputed).abs() < 1e-9,
            "running {running} vs recomputed {recomputed}"
        );
    }

    #[test]
    fn seeded_runs_are_deterministic() {
        let run = || {
            let (mut state, _a, _b) = two_cell_state();
            state.register_energy_function("Contact", Box::new(ContactPenalty { j: 1.0 }));
            state.recompute_total_energy();
            let accepted = state.metropolis(2000, 6.0);
            (accepted, state.energy(), state.cell_count())
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn evaporated_cells_are_destroyed_in_cascade() {
        let mut state = PottsState::new(base_config()).expect("state");
        let key = state
            .create_cell_at(Point3::new(4, 4, 4), 1, None)
            .expect("create");
        assert_eq!(state.cell_count(), 1);
        state.set_cell_label(Point3::new(4, 4, 4), None).expect("drain");
        assert_eq!(state.cell_count(), 0);
        assert!(!state.registry().contains(key));
        state.check_registry_sync().expect("sync");
    }

    #[test]
    fn clean_cell_field_resets_lattice_and_optionally_registry() {
        let (mut state, a, _b) = two_cell_state();
        state.clean_cell_field(false);
        assert_eq!(state.cell_at(Point3::new(0, 0, 0)), None);
        assert_eq!(state.cell_count(), 2);
        assert_eq!(state.cell(a).map(|r| r.volume), Some(0));
        assert!(state.boundary().is_empty());

        state.clean_cell_field(true);
        assert_eq!(state.cell_count(), 0);
    }

    #[test]
    fn resize_shifts_cells_and_recounts_volumes() {
        let mut state = PottsState::new(base_config()).expect("state");
        let key = state
            .create_cell_at(Point3::new(2, 2, 2), 1, None)
            .expect("create");
        state
            .resize_cell_field(Dim3::new(12, 12, 12), Point3::new(1, 1, 1))
            .expect("grow");
        assert_eq!(state.cell_at(Point3::new(3, 3, 3)), Some(key));
        assert_eq!(state.cell(key).map(|r| r.volume), Some(1));
        state.check_boundary_consistency().expect("boundary");

        // Shrinking past the cell destroys it.
        state
            .resize_cell_field(Dim3::new(2, 2, 2), Point3::new(0, 0, 0))
            .expect("shrink");
        assert_eq!(state.cell_count(), 0);
        state.check_registry_sync().expect("registry");
    }

    struct EventLog {
        log: Arc<Mutex<Vec<&'static str>>>,
        tag: &'static str,
    }

    impl Stepper for EventLog {
        fn step(&mut self, _potts: &mut PottsState) {
            self.log.lock().unwrap().push(self.tag);
        }
    }

    impl FixedStepper for EventLog {
        fn step(&mut self, _potts: &mut PottsState) {
            self.log.lock().unwrap().push(self.tag);
        }
    }

    #[test]
    fn fixed_steppers_run_before_steppers_and_front_insertion_leads() {
        let (mut state, _a, _b) = two_cell_state();
        let log = Arc::new(Mutex::new(Vec::new()));
        state.register_stepper(Box::new(EventLog {
            log: Arc::clone(&log),
            tag: "post",
        }));
        state.register_fixed_stepper(
            Box::new(EventLog {
                log: Arc::clone(&log),
                tag: "fixed",
            }),
            false,
        );
        state.register_fixed_stepper(
            Box::new(EventLog {
                log: Arc::clone(&log),
                tag: "front",
            }),
            true,
        );
        state.metropolis(10, 1.0);
        assert_eq!(*log.lock().unwrap(), vec!["front", "fixed", "post"]);

        let removed = state.unregister_fixed_stepper(0);
        assert!(removed.is_some());
        log.lock().unwrap().clear();
        state.metropolis(10, 1.0);
        assert_eq!(*log.lock().unwrap(), vec!["fixed", "post"]);
    }

    struct TypeSpy {
        events: Arc<Mutex<Vec<(Point3, u8, u8)>>>,
    }

    impl TypeChangeWatcher for TypeSpy {
        fn type_changed(&mut self, pt: Point3, old_type: u8, new_type: u8) {
            self.events.lock().unwrap().push((pt, old_type, new_type));
        }
    }

    #[test]
    fn type_change_watchers_fire_on_type_changing_flips() {
        let (mut state, _a, _b) = two_cell_state();
        let events = Arc::new(Mutex::new(Vec::new()));
        state.register_type_change_watcher(Box::new(TypeSpy {
            events: Arc::clone(&events),
        }));
        // No energy terms: every candidate flip is accepted, so cross-type
        // interfaces are guaranteed to fire.
        state.metropolis(2000, 10.0);
        let events = events.lock().unwrap();
        assert!(!events.is_empty());
        for (_, old_type, new_type) in events.iter() {
            assert_ne!(old_type, new_type);
        }
    }

    struct SideData {
        data: Arc<Mutex<CellMap<f64>>>,
    }

    impl AttributeAdder for SideData {
        fn cell_created(&mut self, cell: CellKey, _record: &CellRecord) {
            self.data.lock().unwrap().insert(cell, 1.0);
        }

        fn cell_destroyed(&mut self, cell: CellKey, _record: &CellRecord) {
            self.data.lock().unwrap().remove(cell);
        }
    }

    #[test]
    fn attribute_adders_maintain_side_data_across_lifecycle() {
        let mut state = PottsState::new(base_config()).expect("state");
        let data = Arc::new(Mutex::new(CellMap::new()));
        state.register_attribute_adder(Box::new(SideData {
            data: Arc::clone(&data),
        }));
        let key = state
            .create_cell_at(Point3::new(1, 1, 1), 1, None)
            .expect("create");
        assert_eq!(data.lock().unwrap().get(key), Some(&1.0));
        state.destroy_cell(key, true);
        assert!(data.lock().unwrap().get(key).is_none());
    }

    #[test]
    fn diagnostics_record_per_term_changes_and_outcomes() {
        let (mut state, _a, _b) = two_cell_state();
        state.register_energy_function("Contact", Box::new(FixedCost(0.5)));
        state.register_energy_function("Volume", Box::new(FixedCost(-0.25)));
        state.set_diagnostics(true);
        state.metropolis(200, 1.0);

        let changes = state.current_energy_changes();
        let results = state.current_flip_results();
        assert!(!changes.is_empty());
        assert_eq!(changes.len(), results.len());
        assert_eq!(
            changes.len(),
            state.attempted_energy_calculations() as usize
        );
        for row in changes {
            assert_eq!(row, &vec![0.5, -0.25]);
        }
        // A fresh step clears the previous recording.
        state.set_diagnostics(false);
        state.metropolis(10, 1.0);
        assert!(state.current_energy_changes().is_empty());
    }

    #[test]
    fn update_steers_a_running_state() {
        let (mut state, _a, _b) = two_cell_state();
        let mut config = state.config().clone();
        config.temperature = 3.0;
        config.metropolis_algorithm = MetropolisAlgorithm::BoundaryWalker;
        config.fluctuation_amplitude = FluctuationAmplitudeFunction::Max;
        config.neighbor_order = 2;
        config.frozen_types = vec![2];
        state.update(config).expect("update");

        assert_eq!(state.temperature(), 3.0);
        assert_eq!(state.neighbor_table().order(), 2);
        assert!(state.is_frozen_type(2));
        state.check_boundary_consistency().expect("rebuilt boundary");
        let accepted = state.metropolis(500, 3.0);
        let _ = accepted;
        state.check_registry_sync().expect("registry");
    }

    #[test]
    fn boundary_walker_runs_on_the_boundary_index() {
        let (mut state, _a, _b) = two_cell_state();
        state.set_metropolis_algorithm(MetropolisAlgorithm::BoundaryWalker);
        state.register_energy_function("Contact", Box::new(ContactPenalty { j: 1.0 }));
        state.recompute_total_energy();
        let accepted = state.metropolis(2000, 8.0);
        assert!(accepted > 0);
        state.check_boundary_consistency().expect("boundary");
        state.check_registry_sync().expect("registry");
    }

    #[test]
    fn boundary_churn_sets_track_the_last_step() {
        let (mut state, _a, _b) = two_cell_state();
        state.metropolis(500, 10.0);
        let inserted = state.boundary().just_inserted();
        let deleted = state.boundary().just_deleted();
        // Flips were accepted, so the index churned; the sets are disjoint.
        assert!(!inserted.is_empty() || !deleted.is_empty());
        assert!(inserted.is_disjoint(deleted));
    }

    #[test]
    fn mcs_advances_per_invocation() {
        let (mut state, _a, _b) = two_cell_state();
        assert_eq!(state.mcs(), Mcs::ZERO);
        state.metropolis(10, 1.0);
        state.metropolis(10, 1.0);
        assert_eq!(state.mcs(), Mcs(2));
    }
}
