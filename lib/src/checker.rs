/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Checker: verifies a coloring against an independently rebuilt
//! interference graph, before the function is rewritten.
//!
//! The graph is rebuilt from scratch with the move trick, so two registers
//! joined only by a copy may legitimately share a color.  Every remaining
//! edge whose endpoints both have a color (physical registers are their own
//! color) must connect different colors.  Every virtual register must have
//! been given a color, and every color must come from the universe.

use log::{debug, info};
use std::fmt;

use crate::data_structures::{Map, PhysReg, RealRegUniverse, Reg, VirtualReg};
use crate::func::Func;
use crate::interference::build;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CheckerError {
  /// Two interfering registers ended up in the same physical register.
  SameColor { a: Reg, b: Reg, color: PhysReg },
  /// A virtual register was given a register outside the universe.
  NotAllocatable { reg: VirtualReg, color: PhysReg },
  /// A virtual register mentioned by the code has no color.
  Uncolored { reg: VirtualReg },
}

impl fmt::Display for CheckerError {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    match self {
      CheckerError::SameColor { a, b, color } => {
        write!(f, "{:?} and {:?} interfere but are both in {}", a, b, color)
      }
      CheckerError::NotAllocatable { reg, color } => {
        write!(f, "{:?} was assigned non-allocatable register {}", reg, color)
      }
      CheckerError::Uncolored { reg } => write!(f, "{:?} has no color", reg),
    }
  }
}

/// A set of errors detected by the checker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CheckerErrors {
  pub errors: Vec<CheckerError>,
}

impl fmt::Display for CheckerErrors {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    write!(f, "{} checker error(s)", self.errors.len())?;
    for err in &self.errors {
      write!(f, "; {}", err)?;
    }
    Ok(())
  }
}

/// Check `coloring` for `func`, whose liveness must be up to date.
pub fn check_coloring(
  func: &Func, universe: &RealRegUniverse, coloring: &Map<VirtualReg, PhysReg>,
) -> Result<(), CheckerErrors> {
  info!("check_coloring: begin");
  let graph = build(func, universe, true);
  let mut errors = vec![];

  for vreg in graph.nodes.iter() {
    match coloring.get(vreg) {
      None => errors.push(CheckerError::Uncolored { reg: *vreg }),
      Some(color) if !universe.is_allocatable(*color) => {
        errors.push(CheckerError::NotAllocatable { reg: *vreg, color: *color })
      }
      Some(_) => {}
    }
  }

  let color_of = |reg: Reg| match reg.as_virtual_reg() {
    Some(vreg) => coloring.get(&vreg).copied(),
    None => reg.as_phys_reg(),
  };
  for (a, b) in graph.edges() {
    if let (Some(ca), Some(cb)) = (color_of(a), color_of(b)) {
      if ca == cb {
        debug!("check_coloring: {:?} and {:?} share {}", a, b, ca);
        errors.push(CheckerError::SameColor { a, b, color: ca });
      }
    }
  }

  info!("check_coloring: end: {} error(s)", errors.len());
  if errors.is_empty() {
    Ok(())
  } else {
    Err(CheckerErrors { errors })
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::analysis::run_liveness;
  use crate::mc::*;

  fn sample() -> (Func, Reg, Reg, Reg) {
    let mut func = Func::new("chk");
    let a = func.new_virtual_reg();
    let b = func.new_virtual_reg();
    let c = func.new_virtual_reg();
    func.block(
      "entry",
      vec![
        i_li(a, 1),
        i_move(b, a),
        i_addu(c, b, Reg::new_phys(PhysReg::T2)),
        i_jr(Reg::new_phys(PhysReg::Ra), false),
      ],
    );
    func.finish().unwrap();
    run_liveness(&mut func).unwrap();
    (func, a, b, c)
  }

  fn coloring(pairs: &[(Reg, PhysReg)]) -> Map<VirtualReg, PhysReg> {
    pairs.iter().map(|(r, p)| (r.to_virtual_reg(), *p)).collect()
  }

  #[test]
  fn test_accepts_shared_move_color() {
    let (func, a, b, c) = sample();
    let colors =
      coloring(&[(a, PhysReg::T0), (b, PhysReg::T0), (c, PhysReg::T0)]);
    assert_eq!(check_coloring(&func, &RealRegUniverse::mips(), &colors), Ok(()));
  }

  #[test]
  fn test_rejects_clash_with_physical() {
    // t2 is live into the function, so it is live across both defs.
    let (func, a, b, c) = sample();
    let colors =
      coloring(&[(a, PhysReg::T2), (b, PhysReg::T2), (c, PhysReg::T0)]);
    let errs = check_coloring(&func, &RealRegUniverse::mips(), &colors)
      .unwrap_err()
      .errors;
    assert!(errs.iter().all(|e| match e {
      CheckerError::SameColor { color, .. } => *color == PhysReg::T2,
      _ => false,
    }));
    assert_eq!(errs.len(), 2);
  }

  #[test]
  fn test_reports_missing_and_reserved() {
    let (func, a, b, _) = sample();
    let colors = coloring(&[(a, PhysReg::T0), (b, PhysReg::Sp)]);
    let errs = check_coloring(&func, &RealRegUniverse::mips(), &colors)
      .unwrap_err()
      .errors;
    assert_eq!(
      errs,
      vec![
        CheckerError::NotAllocatable {
          reg: b.to_virtual_reg(),
          color: PhysReg::Sp
        },
        CheckerError::Uncolored { reg: VirtualReg::new(2) },
      ]
    );
  }
}
