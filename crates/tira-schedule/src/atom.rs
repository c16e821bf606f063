//! Tagged transformation atoms and their canonical text form.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A loop level identifier, written `L<n>` in schedule strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LoopId(pub u32);

impl fmt::Display for LoopId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

/// One loop transformation applied to a program.
///
/// The tag set is closed; the parser is the only producer, so a constructed
/// `Atom` is valid by definition and normalisation is just re-emission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "tag")]
pub enum Atom {
    /// `S(outer, inner, a, b, …)` — skew of two loops by signed factors.
    Skew {
        /// Outer loop of the skewed pair.
        outer: LoopId,
        /// Inner loop of the skewed pair.
        inner: LoopId,
        /// Skewing factor applied to the outer loop.
        factor_outer: i64,
        /// Skewing factor applied to the inner loop.
        factor_inner: i64,
        /// Target computations; empty means all.
        comps: Vec<String>,
    },
    /// `I(outer, inner, …)` — interchange of two loops.
    Interchange {
        /// First loop of the swapped pair.
        outer: LoopId,
        /// Second loop of the swapped pair.
        inner: LoopId,
        /// Target computations; empty means all.
        comps: Vec<String>,
    },
    /// `R(level, …)` — iteration order reversal.
    Reverse {
        /// Reversed loop level.
        level: LoopId,
        /// Target computations; empty means all.
        comps: Vec<String>,
    },
    /// `P(level, …)` — parallelisation of a loop level.
    Parallelize {
        /// Parallelised loop level.
        level: LoopId,
        /// Target computations; empty means all.
        comps: Vec<String>,
    },
    /// `T2(outer, inner, w, h, …)` — two-dimensional tiling.
    Tile2 {
        /// Outer tiled loop.
        outer: LoopId,
        /// Inner tiled loop.
        inner: LoopId,
        /// Tile extent along the outer loop.
        size_outer: u64,
        /// Tile extent along the inner loop.
        size_inner: u64,
        /// Target computations; empty means all.
        comps: Vec<String>,
    },
    /// `T3(l0, l1, l2, s0, s1, s2, …)` — three-dimensional tiling.
    Tile3 {
        /// Outermost tiled loop.
        outer: LoopId,
        /// Middle tiled loop.
        middle: LoopId,
        /// Innermost tiled loop.
        inner: LoopId,
        /// Tile extent along the outermost loop.
        size_outer: u64,
        /// Tile extent along the middle loop.
        size_middle: u64,
        /// Tile extent along the innermost loop.
        size_inner: u64,
        /// Target computations; empty means all.
        comps: Vec<String>,
    },
    /// `U(level, factor, …)` — loop unrolling.
    Unroll {
        /// Unrolled loop level.
        level: LoopId,
        /// Unroll factor.
        factor: u64,
        /// Target computations; empty means all.
        comps: Vec<String>,
    },
    /// `F(first, second, …)` — fusion of two loop nests.
    Fuse {
        /// First fused loop.
        first: LoopId,
        /// Second fused loop.
        second: LoopId,
        /// Target computations; empty means all.
        comps: Vec<String>,
    },
}

impl Atom {
    /// The transformation tag as it appears in schedule strings.
    pub fn tag(&self) -> &'static str {
        match self {
            Atom::Skew { .. } => "S",
            Atom::Interchange { .. } => "I",
            Atom::Reverse { .. } => "R",
            Atom::Parallelize { .. } => "P",
            Atom::Tile2 { .. } => "T2",
            Atom::Tile3 { .. } => "T3",
            Atom::Unroll { .. } => "U",
            Atom::Fuse { .. } => "F",
        }
    }

    /// The computations this atom targets; empty means all.
    pub fn comps(&self) -> &[String] {
        match self {
            Atom::Skew { comps, .. }
            | Atom::Interchange { comps, .. }
            | Atom::Reverse { comps, .. }
            | Atom::Parallelize { comps, .. }
            | Atom::Tile2 { comps, .. }
            | Atom::Tile3 { comps, .. }
            | Atom::Unroll { comps, .. }
            | Atom::Fuse { comps, .. } => comps,
        }
    }

    fn write_args(&self, out: &mut String) {
        match self {
            Atom::Skew {
                outer,
                inner,
                factor_outer,
                factor_inner,
                ..
            } => {
                out.push_str(&format!("{outer},{inner},{factor_outer},{factor_inner}"));
            }
            Atom::Interchange { outer, inner, .. } => {
                out.push_str(&format!("{outer},{inner}"));
            }
            Atom::Reverse { level, .. } | Atom::Parallelize { level, .. } => {
                out.push_str(&level.to_string());
            }
            Atom::Tile2 {
                outer,
                inner,
                size_outer,
                size_inner,
                ..
            } => {
                out.push_str(&format!("{outer},{inner},{size_outer},{size_inner}"));
            }
            Atom::Tile3 {
                outer,
                middle,
                inner,
                size_outer,
                size_middle,
                size_inner,
                ..
            } => {
                out.push_str(&format!(
                    "{outer},{middle},{inner},{size_outer},{size_middle},{size_inner}"
                ));
            }
            Atom::Unroll { level, factor, .. } => {
                out.push_str(&format!("{level},{factor}"));
            }
            Atom::Fuse { first, second, .. } => {
                out.push_str(&format!("{first},{second}"));
            }
        }
    }
}

impl fmt::Display for Atom {
    /// Canonical form: no whitespace, comp names single-quoted.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut text = String::new();
        text.push_str(self.tag());
        text.push('(');
        self.write_args(&mut text);
        let comps = self.comps();
        if !comps.is_empty() {
            text.push_str(",comps=[");
            for (idx, comp) in comps.iter().enumerate() {
                if idx > 0 {
                    text.push(',');
                }
                text.push('\'');
                text.push_str(comp);
                text.push('\'');
            }
            text.push(']');
        }
        text.push(')');
        f.write_str(&text)
    }
}

/// Joins atoms into a canonical schedule string.
pub fn emit_schedule(atoms: &[Atom]) -> String {
    atoms
        .iter()
        .map(Atom::to_string)
        .collect::<Vec<_>>()
        .join("|")
}
