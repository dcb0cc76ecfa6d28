//! Atomic structures
//!
//! A [`Structure`] is the value the relaxation driver hands to the loop at
//! every step. Within one trajectory only positions (and optionally the
//! cell) change; atom count and species order are fixed.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Cartesian 3-vector.
pub type Vec3 = [f64; 3];

/// 3x3 cell matrix, one lattice vector per row.
pub type Cell = [[f64; 3]; 3];

/// A single atom.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Atom {
    /// Chemical symbol (e.g. "Cu")
    pub symbol: String,
    /// Cartesian position in Å
    pub position: Vec3,
    /// Integer tag (surface/adsorbate labelling)
    #[serde(default)]
    pub tag: i32,
    /// Formal charge
    #[serde(default)]
    pub charge: f64,
    /// Momentum
    #[serde(default)]
    pub momentum: Vec3,
    /// Initial magnetic moment
    #[serde(default)]
    pub magmom: f64,
}

impl Atom {
    /// Create an atom with default tag, charge, momentum and magnetic moment.
    #[must_use]
    pub fn new(symbol: impl Into<String>, position: Vec3) -> Self {
        Self {
            symbol: symbol.into(),
            position,
            tag: 0,
            charge: 0.0,
            momentum: [0.0; 3],
            magmom: 0.0,
        }
    }

    /// Set the tag.
    #[must_use]
    pub const fn with_tag(mut self, tag: i32) -> Self {
        self.tag = tag;
        self
    }
}

/// Atomic configuration at one point of a trajectory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Structure {
    atoms: Vec<Atom>,
    cell: Cell,
    pbc: [bool; 3],
    fixed: BTreeSet<usize>,
}

impl Structure {
    /// Create a non-periodic structure with a zero cell.
    #[must_use]
    pub fn new(atoms: Vec<Atom>) -> Self {
        Self {
            atoms,
            cell: [[0.0; 3]; 3],
            pbc: [false; 3],
            fixed: BTreeSet::new(),
        }
    }

    /// Set the cell matrix.
    #[must_use]
    pub const fn with_cell(mut self, cell: Cell) -> Self {
        self.cell = cell;
        self
    }

    /// Set periodic boundary flags.
    #[must_use]
    pub const fn with_pbc(mut self, pbc: [bool; 3]) -> Self {
        self.pbc = pbc;
        self
    }

    /// Fix the given atom indices in place.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if an index is out of range.
    pub fn with_fixed(mut self, indices: impl IntoIterator<Item = usize>) -> Result<Self> {
        for index in indices {
            if index >= self.atoms.len() {
                return Err(Error::InvalidInput(format!(
                    "fixed index {index} out of range ({} atoms)",
                    self.atoms.len()
                )));
            }
            self.fixed.insert(index);
        }
        Ok(self)
    }

    /// Number of atoms.
    #[must_use]
    pub fn len(&self) -> usize {
        self.atoms.len()
    }

    /// Whether the structure has no atoms.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.atoms.is_empty()
    }

    /// Atoms in order.
    #[must_use]
    pub fn atoms(&self) -> &[Atom] {
        &self.atoms
    }

    /// Cell matrix.
    #[must_use]
    pub const fn cell(&self) -> &Cell {
        &self.cell
    }

    /// Periodic boundary flags.
    #[must_use]
    pub const fn pbc(&self) -> [bool; 3] {
        self.pbc
    }

    /// Indices of immobile atoms.
    #[must_use]
    pub const fn fixed(&self) -> &BTreeSet<usize> {
        &self.fixed
    }

    /// Whether atom `index` is held fixed.
    #[must_use]
    pub fn is_fixed(&self, index: usize) -> bool {
        self.fixed.contains(&index)
    }

    /// Positions in atom order.
    pub fn positions(&self) -> impl Iterator<Item = Vec3> + '_ {
        self.atoms.iter().map(|a| a.position)
    }

    /// Symbols in atom order.
    pub fn symbols(&self) -> impl Iterator<Item = &str> + '_ {
        self.atoms.iter().map(|a| a.symbol.as_str())
    }

    /// Count of each species.
    #[must_use]
    pub fn species_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for atom in &self.atoms {
            *counts.entry(atom.symbol.clone()).or_insert(0) += 1;
        }
        counts
    }

    /// Chemical formula in Hill order (C, H, then alphabetical; purely
    /// alphabetical when there is no carbon).
    #[must_use]
    pub fn chemical_formula(&self) -> String {
        let counts = self.species_counts();
        let mut order: Vec<&String> = Vec::with_capacity(counts.len());
        if counts.contains_key("C") {
            for leading in ["C", "H"] {
                if let Some((key, _)) = counts.get_key_value(leading) {
                    order.push(key);
                }
            }
            order.extend(counts.keys().filter(|k| *k != "C" && *k != "H"));
        } else {
            order.extend(counts.keys());
        }

        let mut formula = String::new();
        for symbol in order {
            let n = counts[symbol];
            formula.push_str(symbol);
            if n > 1 {
                let _ = write!(formula, "{n}");
            }
        }
        formula
    }

    /// Cell volume, `|det(cell)|`.
    #[must_use]
    pub fn volume(&self) -> f64 {
        let [a, b, c] = self.cell;
        let det = a[0] * (b[1] * c[2] - b[2] * c[1]) - a[1] * (b[0] * c[2] - b[2] * c[0])
            + a[2] * (b[0] * c[1] - b[1] * c[0]);
        det.abs()
    }

    /// Whether `other` has the same atom count and species order.
    #[must_use]
    pub fn same_layout(&self, other: &Self) -> bool {
        self.len() == other.len() && self.symbols().eq(other.symbols())
    }

    /// Largest per-atom force norm over movable atoms.
    ///
    /// Returns 0.0 when every atom is fixed.
    #[must_use]
    pub fn fmax(&self, forces: &[Vec3]) -> f64 {
        forces
            .iter()
            .enumerate()
            .filter(|(i, _)| !self.is_fixed(*i))
            .map(|(_, f)| norm(*f))
            .fold(0.0, f64::max)
    }

    /// Copy of this structure with new positions.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ShapeMismatch`] if the position count differs from
    /// the atom count.
    pub fn with_positions(&self, positions: &[Vec3]) -> Result<Self> {
        if positions.len() != self.atoms.len() {
            return Err(Error::shape_mismatch(
                "Structure::with_positions",
                format!("{} positions", self.atoms.len()),
                positions.len(),
            ));
        }
        let mut next = self.clone();
        for (atom, position) in next.atoms.iter_mut().zip(positions) {
            atom.position = *position;
        }
        Ok(next)
    }
}

/// Euclidean norm of a 3-vector.
#[must_use]
pub fn norm(v: Vec3) -> f64 {
    v[2].mul_add(v[2], v[0].mul_add(v[0], v[1] * v[1])).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn water() -> Structure {
        Structure::new(vec![
            Atom::new("O", [0.0, 0.0, 0.0]),
            Atom::new("H", [0.96, 0.0, 0.0]),
            Atom::new("H", [-0.24, 0.93, 0.0]),
        ])
    }

    #[test]
    fn test_formula_without_carbon_is_alphabetical() {
        assert_eq!(water().chemical_formula(), "H2O");
    }

    #[test]
    fn test_formula_hill_order_with_carbon() {
        let methanol = Structure::new(vec![
            Atom::new("O", [0.0; 3]),
            Atom::new("H", [0.0; 3]),
            Atom::new("C", [0.0; 3]),
            Atom::new("H", [0.0; 3]),
            Atom::new("H", [0.0; 3]),
            Atom::new("H", [0.0; 3]),
        ]);
        assert_eq!(methanol.chemical_formula(), "CH4O");
    }

    #[test]
    fn test_volume_of_cubic_cell() {
        let s = water().with_cell([[2.0, 0.0, 0.0], [0.0, 3.0, 0.0], [0.0, 0.0, 4.0]]);
        assert!((s.volume() - 24.0).abs() < 1e-12);
    }

    #[test]
    fn test_fmax_skips_fixed_atoms() {
        let s = water().with_fixed([0]).unwrap();
        let forces = [[10.0, 0.0, 0.0], [0.0, 3.0, 4.0], [1.0, 0.0, 0.0]];
        assert!((s.fmax(&forces) - 5.0).abs() < 1e-12);
    }

    #[test]
    fn test_with_fixed_rejects_out_of_range() {
        assert!(water().with_fixed([3]).is_err());
    }

    #[test]
    fn test_with_positions_preserves_layout() {
        let s = water();
        let moved = s.with_positions(&[[1.0; 3], [2.0; 3], [3.0; 3]]).unwrap();
        assert!(s.same_layout(&moved));
        assert_eq!(moved.atoms()[2].position, [3.0; 3]);
        assert!(matches!(
            s.with_positions(&[[0.0; 3]]),
            Err(Error::ShapeMismatch { .. })
        ));
    }
}
