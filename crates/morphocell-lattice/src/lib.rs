//! 3D label lattice storage and neighbor enumeration for the morphocell engine.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt;
use std::ops::Add;
use std::str::FromStr;
use thiserror::Error;

/// Errors emitted by lattice construction and mutation.
#[derive(Debug, Error, PartialEq)]
pub enum LatticeError {
    /// Indicates configuration values that cannot be used (e.g., zero dimensions).
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    /// A point that does not resolve to an addressable lattice site.
    #[error("point {0} is outside the lattice")]
    OutOfBounds(Point3),
}

/// Integer lattice coordinate.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
pub struct Point3 {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl Point3 {
    /// Construct a new point.
    #[must_use]
    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    /// Pack the coordinates into a single scalar for compact diagnostics.
    ///
    /// Valid only while every coordinate magnitude stays below 1e6; the
    /// structural `Hash` derive is what set/map keys use, so collisions here
    /// never affect correctness.
    #[must_use]
    pub fn packed(self) -> i64 {
        debug_assert!(
            self.x.unsigned_abs() < 1_000_000
                && self.y.unsigned_abs() < 1_000_000
                && self.z.unsigned_abs() < 1_000_000,
            "packed() requires coordinates below 1e6"
        );
        i64::from(self.x) * 1_000_000_000_000 + i64::from(self.y) * 1_000_000 + i64::from(self.z)
    }

    /// Squared Euclidean distance to the origin.
    #[must_use]
    pub const fn norm_sq(self) -> i64 {
        let (x, y, z) = (self.x as i64, self.y as i64, self.z as i64);
        x * x + y * y + z * z
    }

    /// Chebyshev (max-axis) distance to another point.
    #[must_use]
    pub fn chebyshev(self, other: Self) -> i32 {
        (self.x - other.x)
            .abs()
            .max((self.y - other.y).abs())
            .max((self.z - other.z).abs())
    }
}

impl Add for Point3 {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

impl fmt::Display for Point3 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}

/// Lattice dimensions along each axis.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Dim3 {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl Dim3 {
    /// Construct new dimensions.
    #[must_use]
    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    /// Number of addressable lattice sites.
    #[must_use]
    pub const fn volume(self) -> usize {
        (self.x as usize) * (self.y as usize) * (self.z as usize)
    }

    /// Whether `pt` lies strictly inside the addressable range.
    #[must_use]
    pub const fn contains(self, pt: Point3) -> bool {
        pt.x >= 0 && pt.x < self.x && pt.y >= 0 && pt.y < self.y && pt.z >= 0 && pt.z < self.z
    }
}

/// Boundary condition applied along one lattice axis.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum BoundaryKind {
    /// Coordinates wrap around the axis extent.
    Periodic,
    /// Coordinates outside the extent do not resolve.
    #[default]
    NoFlux,
}

impl FromStr for BoundaryKind {
    type Err = LatticeError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name.to_ascii_lowercase().as_str() {
            "periodic" => Ok(Self::Periodic),
            "noflux" | "no_flux" => Ok(Self::NoFlux),
            _ => Err(LatticeError::InvalidConfig("unknown boundary condition name")),
        }
    }
}

/// Enumerate neighbor offsets grouped into shells of equal Euclidean distance.
///
/// Shell 1 holds the 6 face neighbors, shell 2 the 12 edge neighbors, shell 3
/// the 8 corner neighbors, and so on; neighbor order `n` means the union of
/// the first `n` shells.
#[must_use]
pub fn neighbor_shells(max_order: usize) -> Vec<Vec<Point3>> {
    let radius = max_order as i32;
    let mut offsets: Vec<(i64, Point3)> = Vec::new();
    for x in -radius..=radius {
        for y in -radius..=radius {
            for z in -radius..=radius {
                if x == 0 && y == 0 && z == 0 {
                    continue;
                }
                let pt = Point3::new(x, y, z);
                offsets.push((pt.norm_sq(), pt));
            }
        }
    }
    offsets.sort_by_key(|(dist, pt)| (*dist, pt.x, pt.y, pt.z));

    let mut shells: Vec<Vec<Point3>> = Vec::with_capacity(max_order);
    let mut current_dist = -1;
    for (dist, pt) in offsets {
        if dist != current_dist {
            if shells.len() == max_order {
                break;
            }
            shells.push(Vec::new());
            current_dist = dist;
        }
        if let Some(shell) = shells.last_mut() {
            shell.push(pt);
        }
    }
    shells
}

/// Precomputed flattened neighbor offsets for a fixed neighbor order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NeighborTable {
    order: usize,
    offsets: Vec<Point3>,
    max_reach: i32,
}

impl NeighborTable {
    /// Build the offset table for `order` shells.
    #[must_use]
    pub fn new(order: usize) -> Self {
        let offsets: Vec<Point3> = neighbor_shells(order).into_iter().flatten().collect();
        let max_reach = offsets
            .iter()
            .map(|pt| pt.chebyshev(Point3::default()))
            .max()
            .unwrap_or(0);
        Self {
            order,
            offsets,
            max_reach,
        }
    }

    /// Neighbor order this table was built for.
    #[must_use]
    pub const fn order(&self) -> usize {
        self.order
    }

    /// All offsets, shells concatenated in distance order.
    #[must_use]
    pub fn offsets(&self) -> &[Point3] {
        &self.offsets
    }

    /// Number of offsets in the table.
    #[must_use]
    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    /// Whether the table is empty (order zero).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// Largest Chebyshev reach of any offset; two flip neighborhoods cannot
    /// overlap when their centers are further apart than twice this value.
    #[must_use]
    pub const fn max_reach(&self) -> i32 {
        self.max_reach
    }
}

/// Common behaviour exposed by 3D lattices of copyable labels.
pub trait Lattice<T: Copy> {
    /// Current dimensions.
    fn dim(&self) -> Dim3;

    /// Resolve a possibly out-of-range point through the boundary conditions.
    fn resolve(&self, pt: Point3) -> Option<Point3>;

    /// Copy of the label at `pt`, if it resolves.
    fn at(&self, pt: Point3) -> Option<T>;

    /// Replace the label at `pt`, returning the previous value.
    fn set(&mut self, pt: Point3, value: T) -> Result<T, LatticeError>;
}

/// Dense boxed 3D field with per-axis boundary conditions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Field3<T> {
    dim: Dim3,
    boundaries: [BoundaryKind; 3],
    cells: Vec<T>,
}

impl<T: Copy + Default + PartialEq> Field3<T> {
    /// Construct a field of `dim.volume()` default-initialised sites.
    pub fn new(dim: Dim3, boundaries: [BoundaryKind; 3]) -> Result<Self, LatticeError> {
        if dim.x <= 0 || dim.y <= 0 || dim.z <= 0 {
            return Err(LatticeError::InvalidConfig(
                "lattice dimensions must be positive",
            ));
        }
        Ok(Self {
            dim,
            boundaries,
            cells: vec![T::default(); dim.volume()],
        })
    }

    /// Boundary conditions per axis.
    #[must_use]
    pub const fn boundaries(&self) -> [BoundaryKind; 3] {
        self.boundaries
    }

    /// Replace the boundary conditions.
    pub fn set_boundaries(&mut self, boundaries: [BoundaryKind; 3]) {
        self.boundaries = boundaries;
    }

    #[inline]
    fn index(&self, pt: Point3) -> usize {
        debug_assert!(self.dim.contains(pt));
        ((pt.z as usize) * (self.dim.y as usize) + (pt.y as usize)) * (self.dim.x as usize)
            + (pt.x as usize)
    }

    fn resolve_axis(coord: i32, extent: i32, kind: BoundaryKind) -> Option<i32> {
        if (0..extent).contains(&coord) {
            return Some(coord);
        }
        match kind {
            BoundaryKind::Periodic => Some(coord.rem_euclid(extent)),
            BoundaryKind::NoFlux => None,
        }
    }

    /// Iterate every addressable point in x-fastest order.
    pub fn iter_points(&self) -> impl Iterator<Item = Point3> + '_ {
        let dim = self.dim;
        (0..dim.z).flat_map(move |z| {
            (0..dim.y).flat_map(move |y| (0..dim.x).map(move |x| Point3::new(x, y, z)))
        })
    }

    /// Resolved neighbor points of `pt` for the given offset table.
    ///
    /// Offsets that fail to resolve (no-flux edges) are skipped, so the
    /// returned list may be shorter than the table.
    #[must_use]
    pub fn neighbors(&self, pt: Point3, table: &NeighborTable) -> SmallVec<[Point3; 26]> {
        table
            .offsets()
            .iter()
            .filter_map(|offset| self.resolve(pt + *offset))
            .collect()
    }

    /// Chebyshev distance between two in-range points, accounting for
    /// wrap-around on periodic axes.
    #[must_use]
    pub fn wrapped_chebyshev(&self, a: Point3, b: Point3) -> i32 {
        let axis = |da: i32, extent: i32, kind: BoundaryKind| -> i32 {
            let d = da.abs();
            match kind {
                BoundaryKind::Periodic => d.min(extent - d),
                BoundaryKind::NoFlux => d,
            }
        };
        axis(a.x - b.x, self.dim.x, self.boundaries[0])
            .max(axis(a.y - b.y, self.dim.y, self.boundaries[1]))
            .max(axis(a.z - b.z, self.dim.z, self.boundaries[2]))
    }

    /// Resize the field, shifting retained content by `shift`.
    ///
    /// A site at `p` in the old field lands at `p + shift` in the new one;
    /// content shifted outside the new extent is dropped and new sites start
    /// at the default label.
    pub fn resize(&mut self, dim: Dim3, shift: Point3) -> Result<(), LatticeError> {
        if dim.x <= 0 || dim.y <= 0 || dim.z <= 0 {
            return Err(LatticeError::InvalidConfig(
                "lattice dimensions must be positive",
            ));
        }
        let mut next = vec![T::default(); dim.volume()];
        let stride_x = dim.x as usize;
        let stride_xy = stride_x * dim.y as usize;
        for pt in self.iter_points() {
            let moved = pt + shift;
            if dim.contains(moved) {
                let idx = (moved.z as usize) * stride_xy
                    + (moved.y as usize) * stride_x
                    + (moved.x as usize);
                next[idx] = self.cells[self.index(pt)];
            }
        }
        self.dim = dim;
        self.cells = next;
        Ok(())
    }

    /// Reset every site to the default label.
    pub fn clear(&mut self) {
        self.cells.fill(T::default());
    }
}

impl<T: Copy + Default + PartialEq> Lattice<T> for Field3<T> {
    fn dim(&self) -> Dim3 {
        self.dim
    }

    fn resolve(&self, pt: Point3) -> Option<Point3> {
        let x = Self::resolve_axis(pt.x, self.dim.x, self.boundaries[0])?;
        let y = Self::resolve_axis(pt.y, self.dim.y, self.boundaries[1])?;
        let z = Self::resolve_axis(pt.z, self.dim.z, self.boundaries[2])?;
        Some(Point3::new(x, y, z))
    }

    fn at(&self, pt: Point3) -> Option<T> {
        let resolved = self.resolve(pt)?;
        Some(self.cells[self.index(resolved)])
    }

    fn set(&mut self, pt: Point3, value: T) -> Result<T, LatticeError> {
        let resolved = self.resolve(pt).ok_or(LatticeError::OutOfBounds(pt))?;
        let idx = self.index(resolved);
        Ok(std::mem::replace(&mut self.cells[idx], value))
    }
}
