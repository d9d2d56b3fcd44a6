/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

#![allow(non_snake_case)]

//! Control-flow and dataflow analyses over a `Func`: block orderings,
//! dominators and loop depths, and the per-block liveness sets that the
//! interference graph is built from.

use log::{debug, log_enabled, trace, Level};
use std::collections::VecDeque;

use crate::data_structures::{BlockIx, Reg, Set, TypedIxVec};
use crate::func::Func;
use crate::interface::RegAllocError;

//=============================================================================
// Block orderings

struct BlockOrders {
  // Post-order sequence covering every block.  Blocks not reachable from
  // the entry are appended after the reachable ones.
  post_ord: Vec<BlockIx>,
  // Reachable from the entry block.
  reachable: TypedIxVec<BlockIx, bool>,
}

fn calc_block_orders(func: &Func) -> BlockOrders {
  let nBlocks = func.blocks.len();
  let mut pre_ord = Vec::<BlockIx>::new();
  let mut post_ord = Vec::<BlockIx>::new();
  let mut visited = TypedIxVec::<BlockIx, bool>::new();
  visited.resize(nBlocks, false);

  // Depth first search with an explicit stack.  Each entry holds a block and
  // the index of the next successor to look at.
  let dfs = |root: BlockIx,
             visited: &mut TypedIxVec<BlockIx, bool>,
             pre_ord: &mut Vec<BlockIx>,
             post_ord: &mut Vec<BlockIx>| {
    let mut stack = Vec::<(BlockIx, usize)>::new();
    visited[root] = true;
    pre_ord.push(root);
    stack.push((root, 0));
    while let Some(&(bix, next)) = stack.last() {
      let succs = &func.blocks[bix].succs;
      if next < succs.len() {
        let top = stack.len() - 1;
        stack[top].1 += 1;
        let succ = succs[next];
        if !visited[succ] {
          visited[succ] = true;
          pre_ord.push(succ);
          stack.push((succ, 0));
        }
      } else {
        post_ord.push(bix);
        stack.pop();
      }
    }
  };

  if nBlocks > 0 {
    dfs(func.entry_block(), &mut visited, &mut pre_ord, &mut post_ord);
  }
  let reachable = visited.clone();

  // Deal with any leftovers, so every block gets liveness sets.
  for bix in BlockIx::new(0).dotdot(BlockIx::new(nBlocks)) {
    if !visited[bix] {
      dfs(bix, &mut visited, &mut pre_ord, &mut post_ord);
    }
  }

  debug_assert!(pre_ord.len() == nBlocks as usize);
  debug_assert!(post_ord.len() == nBlocks as usize);
  BlockOrders { post_ord, reachable }
}

//=============================================================================
// Dominators and loop depths

// Calculate the dominance relationship, given a post-order sequence of the
// blocks.  The resulting vector maps each block to the set of blocks that
// dominate it.  This algorithm is from Fig 7.14 of Muchnick 1997.
fn calc_dominators(
  func: &Func, post_ord: &[BlockIx], start: BlockIx,
) -> TypedIxVec<BlockIx, Set<BlockIx>> {
  let nBlocks = func.blocks.len();
  let all: Set<BlockIx> =
    Set::from_vec((0..nBlocks).map(|n| BlockIx::new(n)).collect());
  let mut dom_map = TypedIxVec::<BlockIx, Set<BlockIx>>::new();
  dom_map.resize(nBlocks, all.clone());
  dom_map[start] = Set::unit(start);

  let mut rounds = 0;
  loop {
    rounds += 1;
    let mut change = false;
    // Reverse postorder.
    for bixN in post_ord.iter().rev() {
      if *bixN == start {
        continue;
      }
      let mut dominators = all.clone();
      for bixP in func.blocks[*bixN].preds.iter() {
        dominators.intersect(&dom_map[*bixP]);
      }
      dominators.insert(*bixN);
      if !dominators.equals(&dom_map[*bixN]) {
        change = true;
        dom_map[*bixN] = dominators;
      }
    }
    if !change {
      break;
    }
  }
  debug!("calc_dominators: converged after {} rounds", rounds);
  dom_map
}

/// Set `loop_depth` of every block from the shape of the CFG: 0 outside any
/// loop, otherwise the number of natural loops the block is nested in.
pub fn compute_loop_depths(func: &mut Func) {
  let nBlocks = func.blocks.len();
  if nBlocks == 0 {
    return;
  }
  let orders = calc_block_orders(func);
  let dom_map = calc_dominators(func, &orders.post_ord, func.entry_block());

  // A "back edge" m->n is some edge m->n where n dominates m.  'n' is the
  // loop header node.  Only reachable blocks take part; the dominator sets
  // of unreachable ones are meaningless.
  let mut back_edges = Vec::<(BlockIx, BlockIx)>::new();
  for bixM in BlockIx::new(0).dotdot(BlockIx::new(nBlocks)) {
    if !orders.reachable[bixM] {
      continue;
    }
    for bixN in func.blocks[bixM].succs.iter() {
      if dom_map[bixM].contains(*bixN) && !back_edges.contains(&(bixM, *bixN))
      {
        back_edges.push((bixM, *bixN));
      }
    }
  }

  // For each back edge, collect up all the blocks in the natural loop it
  // defines.  This is Fig 7.21 of Muchnick 1997.
  // Back edges sharing a header describe one loop, so bodies are merged per
  // header.
  let mut headers = Vec::<BlockIx>::new();
  let mut natural_loops = Vec::<Set<BlockIx>>::new();
  for (bixM, bixN) in back_edges.iter() {
    let mut body = Set::<BlockIx>::two(*bixM, *bixN);
    if bixM != bixN {
      let mut stack = vec![*bixM];
      while let Some(bixP) = stack.pop() {
        for bixQ in func.blocks[bixP].preds.iter() {
          if !body.contains(*bixQ) && orders.reachable[*bixQ] {
            body.insert(*bixQ);
            stack.push(*bixQ);
          }
        }
      }
    }
    match headers.iter().position(|h| h == bixN) {
      Some(ix) => natural_loops[ix].union(&body),
      None => {
        headers.push(*bixN);
        natural_loops.push(body);
      }
    }
  }

  // Order loops by increasing size and count, for each loop, the chain of
  // strictly larger loops containing it.  This assumes loops are either
  // disjoint or nested, which holds for reducible graphs.
  natural_loops.sort_by_key(|l| l.card());
  let nLoops = natural_loops.len();
  let mut loop_depths = vec![0u32; nLoops];
  for i in 0..nLoops {
    let mut curr = i;
    let mut depth = 1;
    for j in i + 1..nLoops {
      if natural_loops[curr].is_subset_of(&natural_loops[j]) {
        depth += 1;
        curr = j;
      }
    }
    loop_depths[i] = depth;
  }

  for bix in BlockIx::new(0).dotdot(BlockIx::new(nBlocks)) {
    func.blocks[bix].loop_depth = 0;
  }
  for (body, depth) in natural_loops.iter().zip(loop_depths) {
    for bix in body.iter() {
      if func.blocks[*bix].loop_depth < depth {
        func.blocks[*bix].loop_depth = depth;
      }
    }
  }

  if log_enabled!(Level::Debug) {
    for bix in BlockIx::new(0).dotdot(BlockIx::new(nBlocks)) {
      debug!(
        "loop depth of {:?} ({}) = {}",
        bix, func.blocks[bix].name, func.blocks[bix].loop_depth
      );
    }
  }
}

//=============================================================================
// Register table check

/// Every virtual register mentioned by the code must be known to the
/// function and not yet retired.
pub fn check_registered(func: &Func) -> Result<(), RegAllocError> {
  for iix in func.layout() {
    let regs = func.inst(iix).get_regs();
    for reg in regs.uses.iter().chain(regs.defs.iter()) {
      if let Some(vreg) = reg.as_virtual_reg() {
        if !func.is_registered(vreg) {
          return Err(RegAllocError::UnknownVirtualReg { reg: vreg, inst: iix });
        }
      }
    }
  }
  Ok(())
}

//=============================================================================
// Computation of live-in and live-out sets

// Returned TypedIxVecs contain one element per block.  |use| holds registers
// whose first event in the block is a read, |def| those whose first event is
// a write.
fn calc_def_and_use(
  func: &Func,
) -> (TypedIxVec<BlockIx, Set<Reg>>, TypedIxVec<BlockIx, Set<Reg>>) {
  let mut def_sets = TypedIxVec::new();
  let mut use_sets = TypedIxVec::new();
  for bix in func.blocks.range() {
    let mut def = Set::empty();
    let mut uce = Set::empty();
    for iix in func.block_insts(bix) {
      let regs = func.inst(iix).get_regs();
      for u in regs.uses.iter() {
        if !def.contains(*u) {
          uce.insert(*u);
        }
      }
      for d in regs.defs.iter() {
        if !uce.contains(*d) {
          def.insert(*d);
        }
      }
    }
    def_sets.push(def);
    use_sets.push(uce);
  }
  (def_sets, use_sets)
}

// Returned vectors contain one element per block
fn calc_livein_and_liveout(
  func: &Func, def_sets: &TypedIxVec<BlockIx, Set<Reg>>,
  use_sets: &TypedIxVec<BlockIx, Set<Reg>>, orders: &BlockOrders,
) -> (TypedIxVec<BlockIx, Set<Reg>>, TypedIxVec<BlockIx, Set<Reg>>) {
  let nBlocks = func.blocks.len();
  let empty = Set::<Reg>::empty();

  let mut nEvals = 0;
  let mut liveouts = TypedIxVec::<BlockIx, Set<Reg>>::new();
  liveouts.resize(nBlocks, empty.clone());

  // Seed the work queue in postorder, so that successors tend to be
  // evaluated before their predecessors.  After that, blocks are
  // re-evaluated on demand.
  let mut workQ = VecDeque::<BlockIx>::new();
  let mut inQ = TypedIxVec::<BlockIx, bool>::new();
  inQ.resize(nBlocks, true);
  for bix in orders.post_ord.iter() {
    workQ.push_back(*bix);
  }

  while let Some(bixI) = workQ.pop_front() {
    inQ[bixI] = false;
    let mut set = Set::<Reg>::empty();
    for bixJ in func.blocks[bixI].succs.iter() {
      let mut liveinJ = liveouts[*bixJ].clone();
      liveinJ.remove(&def_sets[*bixJ]);
      liveinJ.union(&use_sets[*bixJ]);
      set.union(&liveinJ);
    }
    nEvals += 1;

    if !set.equals(&liveouts[bixI]) {
      liveouts[bixI] = set;
      // |bixI|'s predecessors may now have a different liveout.
      for bixJ in func.blocks[bixI].preds.iter() {
        if !inQ[*bixJ] {
          inQ[*bixJ] = true;
          workQ.push_back(*bixJ);
        }
      }
    }
  }

  let mut liveins = TypedIxVec::<BlockIx, Set<Reg>>::new();
  liveins.resize(nBlocks, empty);
  for bixI in BlockIx::new(0).dotdot(BlockIx::new(nBlocks)) {
    let mut liveinI = liveouts[bixI].clone();
    liveinI.remove(&def_sets[bixI]);
    liveinI.union(&use_sets[bixI]);
    liveins[bixI] = liveinI;
  }

  debug!("calc_livein_and_liveout: {} evaluations", nEvals);
  (liveins, liveouts)
}

/// Recompute the four liveness sets of every block from scratch.
pub fn run_liveness(func: &mut Func) -> Result<(), RegAllocError> {
  debug!("run_liveness: begin");
  check_registered(func)?;

  let orders = calc_block_orders(func);
  let (def_sets, use_sets) = calc_def_and_use(func);
  let (liveins, liveouts) =
    calc_livein_and_liveout(func, &def_sets, &use_sets, &orders);

  let nBlocks = func.blocks.len();
  for bix in BlockIx::new(0).dotdot(BlockIx::new(nBlocks)) {
    let block = &mut func.blocks[bix];
    block.live_def = def_sets[bix].clone();
    block.live_use = use_sets[bix].clone();
    block.live_in = liveins[bix].clone();
    block.live_out = liveouts[bix].clone();
    trace!(
      "  {:?} {}: in {:?} out {:?}",
      bix,
      block.name,
      block.live_in,
      block.live_out
    );
  }
  debug!("run_liveness: end");
  Ok(())
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::data_structures::{PhysReg, VirtualReg};
  use crate::mc::*;

  fn ra() -> Reg {
    Reg::new_phys(PhysReg::Ra)
  }

  // entry: i = 0; n = 10
  // loop:  i = i + 1; blez (n - i) .. back to loop
  // exit:  return
  fn counting_loop() -> (Func, Reg, Reg, Reg) {
    let mut func = Func::new("count");
    let i = func.new_virtual_reg_labeled("i");
    let n = func.new_virtual_reg_labeled("n");
    let t = func.new_virtual_reg_labeled("t");
    func.block("entry", vec![i_li(i, 0), i_li(n, 10)]);
    func.block(
      "loop",
      vec![
        i_addiu(i, i, 1),
        i_subu(t, n, i),
        i_branch_z(BranchZOp::Bgtz, t, "loop"),
      ],
    );
    func.block("exit", vec![i_jr(ra(), false)]);
    func.finish().unwrap();
    (func, i, n, t)
  }

  #[test]
  fn test_liveness_loop() {
    let (mut func, i, n, t) = counting_loop();
    run_liveness(&mut func).unwrap();
    let b = |x: u32| BlockIx::new(x);

    assert_eq!(func.blocks[b(0)].live_in.to_vec(), vec![ra()]);
    assert_eq!(func.blocks[b(0)].live_out.to_vec(), vec![ra(), i, n]);
    assert_eq!(func.blocks[b(1)].live_in.to_vec(), vec![ra(), i, n]);
    assert_eq!(func.blocks[b(1)].live_out.to_vec(), vec![ra(), i, n]);
    assert!(func.blocks[b(1)].live_def.contains(t));
    assert!(!func.blocks[b(1)].live_def.contains(i));
    assert!(func.blocks[b(1)].live_use.contains(i));
    assert_eq!(func.blocks[b(2)].live_in.to_vec(), vec![ra()]);
    assert!(func.blocks[b(2)].live_out.is_empty());
  }

  #[test]
  fn test_liveness_idempotent() {
    let (mut func, _, _, _) = counting_loop();
    run_liveness(&mut func).unwrap();
    let first: Vec<Vec<Reg>> =
      func.blocks.iter().map(|b| b.live_in.to_vec()).collect();
    run_liveness(&mut func).unwrap();
    let second: Vec<Vec<Reg>> =
      func.blocks.iter().map(|b| b.live_in.to_vec()).collect();
    assert_eq!(first, second);
  }

  #[test]
  fn test_unknown_vreg() {
    let mut func = Func::new("bad");
    let known = func.new_virtual_reg();
    let stray = Reg::new_virtual(5);
    func.block("entry", vec![i_addu(known, stray, stray), i_jr(ra(), false)]);
    func.finish().unwrap();
    match run_liveness(&mut func) {
      Err(RegAllocError::UnknownVirtualReg { reg, .. }) => {
        assert_eq!(reg, VirtualReg::new(5))
      }
      other => panic!("unexpected {:?}", other),
    }

    // Retired registers are just as unknown.
    let mut func = Func::new("retired");
    let v = func.new_virtual_reg();
    func.block("entry", vec![i_li(v, 1), i_jr(ra(), false)]);
    func.finish().unwrap();
    func.retire_vreg(v.to_virtual_reg());
    assert!(run_liveness(&mut func).is_err());
  }

  #[test]
  fn test_loop_depths() {
    let (mut func, _, _, _) = counting_loop();
    compute_loop_depths(&mut func);
    let depths: Vec<u32> = func.blocks.iter().map(|b| b.loop_depth).collect();
    assert_eq!(depths, vec![0, 1, 0]);

    // Two nested loops, plus a dead block that jumps into the inner one.
    let mut func = Func::new("nested");
    let v = func.new_virtual_reg();
    func.block("entry", vec![i_li(v, 3)]);
    func.block("outer", vec![i_addiu(v, v, -1)]);
    func.block("inner", vec![i_branch_z(BranchZOp::Bgtz, v, "inner")]);
    func.block("latch", vec![i_branch_z(BranchZOp::Bgez, v, "outer")]);
    func.block("exit", vec![i_jr(ra(), false)]);
    func.block("dead", vec![i_j("inner")]);
    func.finish().unwrap();
    compute_loop_depths(&mut func);
    let depths: Vec<u32> = func.blocks.iter().map(|b| b.loop_depth).collect();
    assert_eq!(depths, vec![0, 1, 2, 1, 0, 0]);
  }
}
