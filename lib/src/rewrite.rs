/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Apply a coloring: replace every virtual register by its physical one,
//! drop the copies that coalescing made redundant, and work out which
//! allocatable registers the function now clobbers.

use log::{debug, info};

use crate::data_structures::{Map, PhysReg, RealRegUniverse, Reg, VirtualReg};
use crate::func::Func;
use crate::interface::RegAllocError;

#[derive(Clone, Copy, Debug, Default)]
pub struct RewriteStats {
  pub num_rewritten: u32,
  pub num_moves_removed: u32,
}

pub fn rewrite_func(
  func: &mut Func, coloring: &Map<VirtualReg, PhysReg>,
) -> Result<RewriteStats, RegAllocError> {
  info!("rewrite_func: begin");
  let mut stats = RewriteStats::default();

  // Nothing is touched unless every virtual register has a color.
  let mut to_rewrite = vec![];
  for iix in func.layout() {
    let regs = func.inst(iix).get_regs();
    let mut had_virtual = false;
    for reg in regs.uses.iter().chain(regs.defs.iter()) {
      if let Some(vreg) = reg.as_virtual_reg() {
        if !coloring.contains_key(&vreg) {
          return Err(RegAllocError::UnassignedVirtualReg { reg: vreg, inst: iix });
        }
        had_virtual = true;
      }
    }
    if had_virtual {
      to_rewrite.push(iix);
    }
  }

  for iix in to_rewrite {
    func.inst_mut(iix).map_regs(|reg| match reg.as_virtual_reg() {
      Some(vreg) => {
        stats.num_rewritten += 1;
        coloring[&vreg].to_reg()
      }
      None => reg,
    });

    // Only copies that mentioned a virtual register go: a copy written
    // between two physical registers by the producer stays where it is.
    if let Some((dst, src)) = func.inst(iix).is_move() {
      if dst == src {
        debug!("rewrite_func: remove {:?}", func.inst(iix));
        func.remove_inst(iix);
        stats.num_moves_removed += 1;
      }
    }
  }

  info!(
    "rewrite_func: end: {} operands rewritten, {} moves removed",
    stats.num_rewritten, stats.num_moves_removed
  );
  Ok(stats)
}

/// Allocatable registers written anywhere in `func`, in index order.  `ra`
/// and `sp` are handled by the prologue and never appear.
pub fn callee_saved_regs(func: &Func, universe: &RealRegUniverse) -> Vec<PhysReg> {
  let mut saves: Vec<PhysReg> = vec![];
  for iix in func.layout() {
    for def in func.inst(iix).get_regs().defs.iter() {
      if let Some(preg) = def.as_phys_reg() {
        if preg != PhysReg::Ra
          && preg != PhysReg::Sp
          && universe.is_allocatable(preg)
          && !saves.contains(&preg)
        {
          saves.push(preg);
        }
      }
    }
  }
  saves.sort_by_key(|r| r.get_index());
  saves
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::mc::*;

  fn ra() -> Reg {
    Reg::new_phys(PhysReg::Ra)
  }

  #[test]
  fn test_rewrite_and_drop_copies() {
    let mut func = Func::new("rw");
    let a = func.new_virtual_reg();
    let b = func.new_virtual_reg();
    let t4 = Reg::new_phys(PhysReg::T4);
    func.block(
      "entry",
      vec![
        i_li(a, 1),
        i_move(b, a),
        i_move(t4, t4),
        i_addu(Reg::new_phys(PhysReg::V0), b, a),
        i_jr(ra(), false),
      ],
    );
    func.finish().unwrap();

    let mut coloring = Map::default();
    coloring.insert(a.to_virtual_reg(), PhysReg::S1);
    coloring.insert(b.to_virtual_reg(), PhysReg::S1);
    let stats = rewrite_func(&mut func, &coloring).unwrap();
    assert_eq!(stats.num_rewritten, 5);
    assert_eq!(stats.num_moves_removed, 1);

    let listing: Vec<String> = func
      .layout()
      .into_iter()
      .map(|iix| format!("{:?}", func.inst(iix)))
      .collect();
    assert_eq!(
      listing,
      vec![
        "addiu $s1, $zero, 1",
        "move $t4, $t4",
        "addu $v0, $s1, $s1",
        "jr $ra",
      ]
    );
    assert_eq!(
      callee_saved_regs(&func, &RealRegUniverse::mips()),
      vec![PhysReg::S1]
    );
  }

  #[test]
  fn test_unassigned() {
    let mut func = Func::new("rw");
    let a = func.new_virtual_reg();
    func.block("entry", vec![i_li(a, 1), i_jr(ra(), false)]);
    func.finish().unwrap();
    match rewrite_func(&mut func, &Map::default()) {
      Err(RegAllocError::UnassignedVirtualReg { reg, .. }) => {
        assert_eq!(reg, a.to_virtual_reg())
      }
      _ => panic!("expected an unassigned register"),
    }
  }

  #[test]
  fn test_unassigned_leaves_func_alone() {
    let mut func = Func::new("rw");
    let a = func.new_virtual_reg();
    let b = func.new_virtual_reg();
    func.block(
      "entry",
      vec![i_li(a, 1), i_move(b, a), i_addiu(b, b, 1), i_jr(ra(), false)],
    );
    func.finish().unwrap();
    let before: Vec<String> =
      func.layout().into_iter().map(|iix| format!("{:?}", func.inst(iix))).collect();

    // Only |a| has a color.
    let mut coloring = Map::default();
    coloring.insert(a.to_virtual_reg(), PhysReg::T0);
    match rewrite_func(&mut func, &coloring) {
      Err(RegAllocError::UnassignedVirtualReg { reg, .. }) => {
        assert_eq!(reg, b.to_virtual_reg())
      }
      _ => panic!("expected an unassigned register"),
    }
    let after: Vec<String> =
      func.layout().into_iter().map(|iix| format!("{:?}", func.inst(iix))).collect();
    assert_eq!(before, after);
  }

  #[test]
  fn test_callee_saves_order() {
    let mut func = Func::new("cs");
    let regs = [PhysReg::S3, PhysReg::T1, PhysReg::Sp, PhysReg::S3, PhysReg::V1];
    let insts: Vec<Inst> =
      regs.iter().map(|r| i_li(Reg::new_phys(*r), 0)).collect();
    func.block("entry", insts);
    func.finish().unwrap();
    assert_eq!(
      callee_saved_regs(&func, &RealRegUniverse::mips()),
      vec![PhysReg::T1, PhysReg::S3]
    );
  }
}
