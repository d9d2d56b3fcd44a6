/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! The baseline allocator: build the graph without the move trick, then
//! greedily give every virtual register the first color none of its
//! neighbours holds.  Anything that does not fit is spilled.

use log::{debug, info};

use crate::data_structures::{Map, PhysReg, RealRegUniverse, VirtualReg};
use crate::func::Func;
use crate::interface::RoundOutcome;
use crate::interference::build;
use crate::spill::SpillState;

pub fn alloc_round(
  func: &Func, universe: &RealRegUniverse, spill_state: &SpillState,
) -> RoundOutcome {
  let graph = build(func, universe, false);

  // Spill clones go on top of the stack, so they are colored first: their
  // live ranges are short and spilling them again is pointless.
  let mut stack: Vec<VirtualReg> = graph
    .nodes
    .iter()
    .copied()
    .filter(|v| !spill_state.is_clone(*v))
    .collect();
  stack.extend(graph.nodes.iter().copied().filter(|v| spill_state.is_clone(*v)));

  let mut color = Map::<VirtualReg, PhysReg>::default();
  let mut spilled = vec![];
  while let Some(vreg) = stack.pop() {
    let mut ok_colors = universe.allocable.clone();
    for adj in graph.adjacent_all(vreg) {
      let taken = match adj.as_virtual_reg() {
        Some(av) => color.get(&av).copied(),
        None => adj.as_phys_reg(),
      };
      if let Some(preg) = taken {
        ok_colors.retain(|c| *c != preg);
      }
    }
    match ok_colors.first() {
      Some(preg) => {
        color.insert(vreg, *preg);
      }
      None => {
        debug!("naive: spill {:?}", vreg);
        spilled.push(vreg);
      }
    }
  }

  info!(
    "naive round: {} nodes, {} colored, {} spilled",
    graph.nodes.len(),
    color.len(),
    spilled.len()
  );
  if spilled.is_empty() {
    RoundOutcome::Colored(color)
  } else {
    spilled.sort();
    RoundOutcome::Spilled(spilled)
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::analysis::run_liveness;
  use crate::data_structures::Reg;
  use crate::mc::*;

  #[test]
  fn test_naive_keeps_moves() {
    // Without the move trick |a| and |b| interfere across the move and must
    // get different colors.
    let mut func = Func::new("mv");
    let a = func.new_virtual_reg();
    let b = func.new_virtual_reg();
    let c = func.new_virtual_reg();
    func.block(
      "entry",
      vec![
        i_li(a, 1),
        i_move(b, a),
        i_addu(c, a, b),
        i_jr(Reg::new_phys(PhysReg::Ra), false),
      ],
    );
    func.finish().unwrap();
    run_liveness(&mut func).unwrap();
    let outcome =
      alloc_round(&func, &RealRegUniverse::mips(), &SpillState::new());
    match outcome {
      RoundOutcome::Colored(colors) => {
        assert_eq!(colors[&a.to_virtual_reg()], PhysReg::T1);
        assert_eq!(colors[&b.to_virtual_reg()], PhysReg::T0);
        assert_eq!(colors[&c.to_virtual_reg()], PhysReg::T0);
      }
      RoundOutcome::Spilled(s) => panic!("unexpected spills {:?}", s),
    }
  }

  #[test]
  fn test_naive_avoids_physical_neighbours() {
    let mut func = Func::new("phys");
    let a = func.new_virtual_reg();
    let t0 = Reg::new_phys(PhysReg::T0);
    func.block(
      "entry",
      vec![
        i_li(a, 1),
        i_li(t0, 2),
        i_addu(t0, t0, a),
        i_jr(Reg::new_phys(PhysReg::Ra), false),
      ],
    );
    func.finish().unwrap();
    run_liveness(&mut func).unwrap();
    match alloc_round(&func, &RealRegUniverse::restricted(2), &SpillState::new())
    {
      RoundOutcome::Colored(colors) => {
        assert_eq!(colors[&a.to_virtual_reg()], PhysReg::T1)
      }
      RoundOutcome::Spilled(s) => panic!("unexpected spills {:?}", s),
    }
  }
}
