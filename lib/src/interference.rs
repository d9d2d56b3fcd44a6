/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! The interference graph, and its construction from per-block liveness.

use log::{debug, log_enabled, Level};
use std::collections::BTreeSet;

use crate::data_structures::{
  BlockIx, InstIx, Map, RealRegUniverse, Reg, Set, VirtualReg,
};
use crate::func::Func;

/// What `degree` reports for physical registers.  They are never simplified,
/// spilled or recolored, so they always look maximally constrained.
pub const INFINITE_DEGREE: u32 = u32::MAX;

/// Undirected graph over registers.  Only virtual registers get an adjacency
/// list and a degree; edges between two physical registers are never
/// recorded since nothing could act on them.
pub struct InterferenceGraph {
  adj_set: Set<(Reg, Reg)>,
  adj_list: Map<VirtualReg, BTreeSet<Reg>>,
  degree: Map<VirtualReg, u32>,
  spill_weight: Map<VirtualReg, u32>,
  /// Every virtual register mentioned by the code.
  pub nodes: BTreeSet<VirtualReg>,
  /// For each register, the moves it takes part in.
  pub move_list: Map<Reg, Vec<InstIx>>,
  /// Every recorded move, as (dst, src).
  pub moves: Map<InstIx, (Reg, Reg)>,
}

fn canonical(u: Reg, v: Reg) -> (Reg, Reg) {
  if u < v {
    (u, v)
  } else {
    (v, u)
  }
}

impl InterferenceGraph {
  pub fn new() -> Self {
    Self {
      adj_set: Set::empty(),
      adj_list: Map::default(),
      degree: Map::default(),
      spill_weight: Map::default(),
      nodes: BTreeSet::new(),
      move_list: Map::default(),
      moves: Map::default(),
    }
  }

  pub fn add_node(&mut self, vreg: VirtualReg) {
    if self.nodes.insert(vreg) {
      self.adj_list.entry(vreg).or_default();
      self.degree.entry(vreg).or_insert(0);
    }
  }

  pub fn add_edge(&mut self, u: Reg, v: Reg) {
    if u == v || (u.is_phys() && v.is_phys()) {
      return;
    }
    if self.adj_set.contains(canonical(u, v)) {
      return;
    }
    self.adj_set.insert(canonical(u, v));
    if let Some(uv) = u.as_virtual_reg() {
      self.adj_list.entry(uv).or_default().insert(v);
      *self.degree.entry(uv).or_insert(0) += 1;
    }
    if let Some(vv) = v.as_virtual_reg() {
      self.adj_list.entry(vv).or_default().insert(u);
      *self.degree.entry(vv).or_insert(0) += 1;
    }
  }

  pub fn interferes(&self, u: Reg, v: Reg) -> bool {
    self.adj_set.contains(canonical(u, v))
  }

  /// Every neighbour of `vreg`, in ascending order, regardless of what has
  /// happened to them since the graph was built.
  pub fn adjacent_all(&self, vreg: VirtualReg) -> impl Iterator<Item = Reg> + '_ {
    self.adj_list.get(&vreg).into_iter().flat_map(|s| s.iter().copied())
  }

  pub fn degree(&self, reg: Reg) -> u32 {
    match reg.as_virtual_reg() {
      Some(vreg) => self.degree.get(&vreg).copied().unwrap_or(0),
      None => INFINITE_DEGREE,
    }
  }

  pub fn decrement_degree(&mut self, vreg: VirtualReg) {
    let degree = self.degree.entry(vreg).or_insert(0);
    debug_assert!(*degree > 0, "decrement_degree: {:?} has degree 0", vreg);
    *degree = degree.saturating_sub(1);
  }

  /// Sum of `1 + loop depth` over every def and use site.
  pub fn spill_weight(&self, vreg: VirtualReg) -> u32 {
    self.spill_weight.get(&vreg).copied().unwrap_or(0)
  }

  fn add_weight(&mut self, reg: Reg, loop_depth: u32) {
    if let Some(vreg) = reg.as_virtual_reg() {
      *self.spill_weight.entry(vreg).or_insert(0) += 1 + loop_depth;
    }
  }

  fn add_move(&mut self, iix: InstIx, dst: Reg, src: Reg) {
    self.moves.insert(iix, (dst, src));
    self.move_list.entry(dst).or_default().push(iix);
    self.move_list.entry(src).or_default().push(iix);
  }

  /// All edges, each once, in ascending order.
  pub fn edges(&self) -> Vec<(Reg, Reg)> {
    self.adj_set.to_vec()
  }

  pub fn num_edges(&self) -> usize {
    self.adj_set.card()
  }
}

/// Build the interference graph of `func`, whose liveness sets must be up to
/// date.  With `coalescing`, the source of a register-to-register move is
/// not made to interfere with its destination, and the move is recorded for
/// the coalescer when both operands are virtual or allocatable.
pub fn build(
  func: &Func, universe: &RealRegUniverse, coalescing: bool,
) -> InterferenceGraph {
  debug!("build: begin (coalescing = {})", coalescing);
  let mut graph = InterferenceGraph::new();
  let movable = |reg: Reg| match reg.as_phys_reg() {
    Some(preg) => universe.is_allocatable(preg),
    None => true,
  };

  for bix in (0..func.blocks.len()).rev().map(BlockIx::new) {
    let block = &func.blocks[bix];
    let loop_depth = block.loop_depth;
    let mut live = block.live_out.clone();

    for iix in func.block_insts(bix).into_iter().rev() {
      let inst = func.inst(iix);
      let regs = inst.get_regs();
      for reg in regs.uses.iter().chain(regs.defs.iter()) {
        if let Some(vreg) = reg.as_virtual_reg() {
          graph.add_node(vreg);
        }
      }

      if coalescing {
        if let Some((dst, src)) = inst.is_move() {
          if !src.is_zero() {
            live.delete(src);
            if dst != src && movable(dst) && movable(src) {
              graph.add_move(iix, dst, src);
            }
          }
        }
      }

      for def in regs.defs.iter() {
        live.insert(*def);
      }
      for def in regs.defs.iter() {
        for l in live.iter() {
          graph.add_edge(*def, *l);
        }
      }
      for def in regs.defs.iter() {
        graph.add_weight(*def, loop_depth);
        live.delete(*def);
      }
      for r_use in regs.uses.iter() {
        graph.add_weight(*r_use, loop_depth);
        live.insert(*r_use);
      }
    }
  }

  if log_enabled!(Level::Debug) {
    debug!(
      "build: end: {} nodes, {} edges, {} moves",
      graph.nodes.len(),
      graph.num_edges(),
      graph.moves.len()
    );
  }
  graph
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::analysis::run_liveness;
  use crate::data_structures::PhysReg;
  use crate::mc::*;

  fn ret() -> Inst {
    i_jr(Reg::new_phys(PhysReg::Ra), false)
  }

  #[test]
  fn test_move_trick() {
    let mut func = Func::new("mv");
    let a = func.new_virtual_reg();
    let b = func.new_virtual_reg();
    let c = func.new_virtual_reg();
    func.block(
      "entry",
      vec![i_li(a, 1), i_move(b, a), i_addu(c, a, b), ret()],
    );
    func.finish().unwrap();
    run_liveness(&mut func).unwrap();
    let universe = RealRegUniverse::mips();

    // |a| is still live after the move, so it interferes with |b| when the
    // move is built like any other instruction.
    let plain = build(&func, &universe, false);
    assert!(plain.interferes(a, b));
    assert!(plain.moves.is_empty());

    // With the move trick they hold the same value across the move, so no
    // edge.
    let with_moves = build(&func, &universe, true);
    assert!(!with_moves.interferes(a, b));
    assert_eq!(with_moves.moves.len(), 1);
    assert_eq!(with_moves.move_list[&a].len(), 1);
    assert_eq!(with_moves.move_list[&b].len(), 1);
  }

  #[test]
  fn test_degrees_and_weights() {
    let mut func = Func::new("deg");
    let x = func.new_virtual_reg();
    let y = func.new_virtual_reg();
    let z = func.new_virtual_reg();
    let v0 = Reg::new_phys(PhysReg::V0);
    func.block(
      "entry",
      vec![i_li(x, 1), i_li(y, 2), i_call("f", 0), i_addu(z, x, y)],
    );
    func.block("body", vec![i_addu(z, z, x), i_branch_z(BranchZOp::Bgtz, z, "body")]);
    func.block("exit", vec![ret()]);
    func.finish().unwrap();
    func.blocks[BlockIx::new(1)].loop_depth = 1;
    run_liveness(&mut func).unwrap();
    let g = build(&func, &RealRegUniverse::mips(), true);

    // The call defines v0 while x and y are live.
    assert!(g.interferes(v0, x));
    assert!(g.interferes(v0, y));
    assert!(g.interferes(x, y));
    assert_eq!(g.degree(v0), INFINITE_DEGREE);
    assert!(g.adjacent_all(x.to_virtual_reg()).any(|r| r == v0));

    // x: def in entry (1), use in entry (1), use in body (2).
    assert_eq!(g.spill_weight(x.to_virtual_reg()), 4);
    // z: def in entry (1), use, def and use in body (2 each).
    assert_eq!(g.spill_weight(z.to_virtual_reg()), 7);
  }

  #[test]
  fn test_reserved_moves_not_recorded() {
    let mut func = Func::new("res");
    let a = func.new_virtual_reg();
    let b = func.new_virtual_reg();
    let v0 = Reg::new_phys(PhysReg::V0);
    let t0 = Reg::new_phys(PhysReg::T0);
    func.block(
      "entry",
      vec![
        i_call("f", 0),
        i_move(a, v0),
        i_move(b, Reg::new_phys(PhysReg::Zero)),
        i_move(t0, a),
        i_addu(a, t0, b),
        i_jr(Reg::new_phys(PhysReg::Ra), false),
      ],
    );
    func.finish().unwrap();
    run_liveness(&mut func).unwrap();
    let g = build(&func, &RealRegUniverse::restricted(4), true);
    // Only the move into t0 is a coalescing candidate.
    assert_eq!(g.moves.len(), 1);
    assert!(g.move_list.get(&v0).is_none());
    assert!(g.move_list.get(&t0).is_some());
  }
}
