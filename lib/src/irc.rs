/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Iterated register coalescing (George and Appel): one round of
//! simplify / coalesce / freeze / potential-spill, followed by optimistic
//! color selection.
//!
//! Every worklist is ordered, and every choice picks the smallest candidate,
//! so a given function is always allocated the same way.

use log::{debug, info, log_enabled, trace, Level};
use std::collections::BTreeSet;

use crate::data_structures::{InstIx, Map, PhysReg, RealRegUniverse, Reg, VirtualReg};
use crate::func::Func;
use crate::interface::{Options, RoundOutcome};
use crate::interference::{build, InterferenceGraph};
use crate::spill::SpillState;
use crate::trees_maps_sets::UnionFind;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum NodeState {
  Initial,
  Simplify,
  Freeze,
  Spill,
  Selected,
  Coalesced,
  Colored,
  Spilled,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum MoveState {
  Worklist,
  Active,
  Coalesced,
  Constrained,
  Frozen,
}

/// Per-round move statistics.
#[derive(Clone, Copy, Debug, Default)]
pub struct MoveStats {
  pub coalesced: u32,
  pub constrained: u32,
  pub frozen: u32,
}

struct IrcState<'a> {
  k: u32,
  universe: &'a RealRegUniverse,
  spill_state: &'a SpillState,
  opts: &'a Options,
  graph: InterferenceGraph,
  node_state: Map<VirtualReg, NodeState>,
  move_state: Map<InstIx, MoveState>,
  simplify_worklist: BTreeSet<VirtualReg>,
  freeze_worklist: BTreeSet<VirtualReg>,
  spill_worklist: BTreeSet<VirtualReg>,
  move_worklist: BTreeSet<InstIx>,
  select_stack: Vec<VirtualReg>,
  alias: UnionFind<Reg>,
  color: Map<VirtualReg, PhysReg>,
  spilled_nodes: Vec<VirtualReg>,
  stats: MoveStats,
}

impl<'a> IrcState<'a> {
  fn new(
    graph: InterferenceGraph, universe: &'a RealRegUniverse,
    spill_state: &'a SpillState, opts: &'a Options,
  ) -> Self {
    let mut node_state = Map::default();
    for vreg in graph.nodes.iter() {
      node_state.insert(*vreg, NodeState::Initial);
    }
    Self {
      k: universe.num_colors(),
      universe,
      spill_state,
      opts,
      graph,
      node_state,
      move_state: Map::default(),
      simplify_worklist: BTreeSet::new(),
      freeze_worklist: BTreeSet::new(),
      spill_worklist: BTreeSet::new(),
      move_worklist: BTreeSet::new(),
      select_stack: vec![],
      alias: UnionFind::new(),
      color: Map::default(),
      spilled_nodes: vec![],
      stats: MoveStats::default(),
    }
  }

  // === Node and move states ===

  fn state(&self, vreg: VirtualReg) -> NodeState {
    self.node_state.get(&vreg).copied().unwrap_or(NodeState::Initial)
  }

  // The worklists mirror |node_state|; every transition goes through here.
  fn set_state(&mut self, vreg: VirtualReg, new: NodeState) {
    match self.state(vreg) {
      NodeState::Simplify => {
        self.simplify_worklist.remove(&vreg);
      }
      NodeState::Freeze => {
        self.freeze_worklist.remove(&vreg);
      }
      NodeState::Spill => {
        self.spill_worklist.remove(&vreg);
      }
      _ => {}
    }
    match new {
      NodeState::Simplify => {
        self.simplify_worklist.insert(vreg);
      }
      NodeState::Freeze => {
        self.freeze_worklist.insert(vreg);
      }
      NodeState::Spill => {
        self.spill_worklist.insert(vreg);
      }
      _ => {}
    }
    self.node_state.insert(vreg, new);
  }

  fn set_move_state(&mut self, mv: InstIx, new: MoveState) {
    if self.move_state.get(&mv) == Some(&MoveState::Worklist) {
      self.move_worklist.remove(&mv);
    }
    match new {
      MoveState::Worklist => {
        self.move_worklist.insert(mv);
      }
      MoveState::Coalesced => self.stats.coalesced += 1,
      MoveState::Constrained => self.stats.constrained += 1,
      MoveState::Frozen => self.stats.frozen += 1,
      MoveState::Active => {}
    }
    self.move_state.insert(mv, new);
  }

  // === Graph queries ===

  fn get_alias(&mut self, reg: Reg) -> Reg {
    self.alias.find(reg)
  }

  // Neighbours that are still in the graph: not selected for coloring and
  // not coalesced into something else.
  fn adjacent(&self, vreg: VirtualReg) -> Vec<Reg> {
    self
      .graph
      .adjacent_all(vreg)
      .filter(|r| match r.as_virtual_reg() {
        Some(v) => match self.state(v) {
          NodeState::Selected | NodeState::Coalesced => false,
          _ => true,
        },
        None => true,
      })
      .collect()
  }

  fn node_moves(&self, reg: Reg) -> Vec<InstIx> {
    let mut moves: Vec<InstIx> = match self.graph.move_list.get(&reg) {
      Some(list) => list
        .iter()
        .copied()
        .filter(|mv| match self.move_state.get(mv) {
          Some(MoveState::Worklist) | Some(MoveState::Active) => true,
          _ => false,
        })
        .collect(),
      None => vec![],
    };
    moves.sort();
    moves.dedup();
    moves
  }

  fn move_related(&self, reg: Reg) -> bool {
    !self.node_moves(reg).is_empty()
  }

  // === Worklist construction ===

  fn make_worklist(&mut self) {
    let mut moves: Vec<InstIx> = self.graph.moves.keys().copied().collect();
    moves.sort();
    for mv in moves {
      self.set_move_state(mv, MoveState::Worklist);
    }

    let nodes: Vec<VirtualReg> = self.graph.nodes.iter().copied().collect();
    for vreg in nodes {
      let reg = vreg.to_reg();
      if self.graph.degree(reg) >= self.k {
        self.set_state(vreg, NodeState::Spill);
      } else if self.move_related(reg) {
        self.set_state(vreg, NodeState::Freeze);
      } else {
        self.set_state(vreg, NodeState::Simplify);
      }
    }
  }

  // === Simplify ===

  fn simplify(&mut self) {
    let vreg = match self.simplify_worklist.iter().next() {
      Some(v) => *v,
      None => return,
    };
    trace!("simplify {:?}", vreg);
    self.set_state(vreg, NodeState::Selected);
    self.select_stack.push(vreg);
    for m in self.adjacent(vreg) {
      self.decrement_degree(m);
    }
  }

  fn decrement_degree(&mut self, reg: Reg) {
    let vreg = match reg.as_virtual_reg() {
      Some(v) => v,
      None => return,
    };
    let d = self.graph.degree(reg);
    self.graph.decrement_degree(vreg);
    if d == self.k {
      let mut nodes = self.adjacent(vreg);
      nodes.push(reg);
      self.enable_moves(&nodes);
      if self.state(vreg) == NodeState::Spill {
        if self.move_related(reg) {
          self.set_state(vreg, NodeState::Freeze);
        } else {
          self.set_state(vreg, NodeState::Simplify);
        }
      }
    }
  }

  fn enable_moves(&mut self, nodes: &[Reg]) {
    for n in nodes {
      for mv in self.node_moves(*n) {
        if self.move_state.get(&mv) == Some(&MoveState::Active) {
          self.set_move_state(mv, MoveState::Worklist);
        }
      }
    }
  }

  // === Coalesce ===

  fn coalesce(&mut self) {
    let mv = match self.move_worklist.iter().next() {
      Some(mv) => *mv,
      None => return,
    };
    let (dst, src) = self.graph.moves[&mv];
    let x = self.get_alias(dst);
    let y = self.get_alias(src);
    // If either end is physical, it is |u|.
    let (u, v) = if y.is_phys() { (y, x) } else { (x, y) };

    if u == v {
      trace!("coalesce {:?}: already together", mv);
      self.set_move_state(mv, MoveState::Coalesced);
      self.add_worklist(u);
    } else if v.is_phys() || self.graph.interferes(u, v) {
      trace!("coalesce {:?}: constrained", mv);
      self.set_move_state(mv, MoveState::Constrained);
      self.add_worklist(u);
      self.add_worklist(v);
    } else if self.can_combine(u, v) {
      trace!("coalesce {:?}: {:?} into {:?}", mv, v, u);
      self.set_move_state(mv, MoveState::Coalesced);
      self.combine(u, v.to_virtual_reg());
      self.add_worklist(u);
    } else {
      self.set_move_state(mv, MoveState::Active);
    }
  }

  // George's test when |u| is physical, Briggs' otherwise.
  fn can_combine(&self, u: Reg, v: Reg) -> bool {
    let vv = v.to_virtual_reg();
    match u.as_virtual_reg() {
      None => self.adjacent(vv).into_iter().all(|t| self.ok(t, u)),
      Some(uv) => {
        let mut nodes: BTreeSet<Reg> = self.adjacent(uv).into_iter().collect();
        nodes.extend(self.adjacent(vv));
        self.conservative(&nodes)
      }
    }
  }

  fn ok(&self, t: Reg, r: Reg) -> bool {
    t.is_phys() || self.graph.degree(t) < self.k || self.graph.interferes(t, r)
  }

  fn conservative(&self, nodes: &BTreeSet<Reg>) -> bool {
    let significant =
      nodes.iter().filter(|n| self.graph.degree(**n) >= self.k).count();
    (significant as u32) < self.k
  }

  fn add_worklist(&mut self, reg: Reg) {
    if let Some(vreg) = reg.as_virtual_reg() {
      if self.state(vreg) == NodeState::Freeze
        && !self.move_related(reg)
        && self.graph.degree(reg) < self.k
      {
        self.set_state(vreg, NodeState::Simplify);
      }
    }
  }

  fn combine(&mut self, u: Reg, v: VirtualReg) {
    self.set_state(v, NodeState::Coalesced);
    self.alias.union_into(v.to_reg(), u);

    let v_moves = self.graph.move_list.get(&v.to_reg()).cloned().unwrap_or_default();
    self.graph.move_list.entry(u).or_default().extend(v_moves);
    self.enable_moves(&[v.to_reg()]);

    for t in self.adjacent(v) {
      self.graph.add_edge(t, u);
      self.decrement_degree(t);
    }

    if let Some(uv) = u.as_virtual_reg() {
      if self.graph.degree(u) >= self.k && self.state(uv) == NodeState::Freeze {
        self.set_state(uv, NodeState::Spill);
      }
    }
  }

  // === Freeze ===

  fn freeze(&mut self) {
    let vreg = match self.freeze_worklist.iter().next() {
      Some(v) => *v,
      None => return,
    };
    trace!("freeze {:?}", vreg);
    self.set_state(vreg, NodeState::Simplify);
    self.freeze_moves(vreg);
  }

  fn freeze_moves(&mut self, u: VirtualReg) {
    let u_alias = self.get_alias(u.to_reg());
    for mv in self.node_moves(u.to_reg()) {
      let (x, y) = self.graph.moves[&mv];
      let v = if self.get_alias(y) == u_alias {
        self.get_alias(x)
      } else {
        self.get_alias(y)
      };
      self.set_move_state(mv, MoveState::Frozen);
      if let Some(vv) = v.as_virtual_reg() {
        if self.state(vv) == NodeState::Freeze
          && !self.move_related(v)
          && self.graph.degree(v) < self.k
        {
          self.set_state(vv, NodeState::Simplify);
        }
      }
    }
  }

  // === Potential spill ===

  // Zero for registers that only just came out of a spill: they live for a
  // handful of instructions, and spilling them again buys nothing.
  fn spill_score(&self, vreg: VirtualReg) -> f64 {
    if let Some(len) = self.spill_state.live_length(vreg) {
      if len < self.opts.short_range_threshold {
        return 0.0;
      }
    }
    let degree = self.graph.degree(vreg.to_reg()) as f64;
    let weight = self.graph.spill_weight(vreg) as f64;
    degree / self.opts.loop_depth_base.powf(weight)
  }

  fn select_spill(&mut self) {
    // Highest score wins, ties going to the lowest register.  Registers that
    // cannot usefully be spilled again are only taken as a last resort.
    let mut best: Option<(VirtualReg, bool, f64)> = None;
    for vreg in self.spill_worklist.iter() {
      let useful = !self.spill_state.is_minimal(*vreg);
      let score = self.spill_score(*vreg);
      let better = match best {
        None => true,
        Some((_, best_useful, best_score)) => {
          (useful && !best_useful) || (useful == best_useful && score > best_score)
        }
      };
      if better {
        best = Some((*vreg, useful, score));
      }
    }
    if let Some((vreg, _, score)) = best {
      debug!("potential spill {:?} (score {})", vreg, score);
      self.set_state(vreg, NodeState::Simplify);
      self.freeze_moves(vreg);
    }
  }

  // === Select ===

  fn assign_colors(&mut self) {
    while let Some(vreg) = self.select_stack.pop() {
      let mut ok_colors: Vec<PhysReg> = self.universe.allocable.clone();
      let neighbours: Vec<Reg> = self.graph.adjacent_all(vreg).collect();
      for w in neighbours {
        let a = self.get_alias(w);
        let taken = match a.as_virtual_reg() {
          None => a.as_phys_reg(),
          Some(av) => self.color.get(&av).copied(),
        };
        if let Some(preg) = taken {
          ok_colors.retain(|c| *c != preg);
        }
      }
      match ok_colors.first() {
        Some(preg) => {
          trace!("color {:?} = {}", vreg, preg);
          self.color.insert(vreg, *preg);
          self.set_state(vreg, NodeState::Colored);
        }
        None => {
          debug!("actual spill {:?}", vreg);
          self.spilled_nodes.push(vreg);
          self.set_state(vreg, NodeState::Spilled);
        }
      }
    }

    let coalesced: Vec<VirtualReg> = self
      .graph
      .nodes
      .iter()
      .copied()
      .filter(|v| self.state(*v) == NodeState::Coalesced)
      .collect();
    for vreg in coalesced {
      let a = self.get_alias(vreg.to_reg());
      let color = match a.as_virtual_reg() {
        None => a.as_phys_reg(),
        Some(av) => self.color.get(&av).copied(),
      };
      if let Some(preg) = color {
        self.color.insert(vreg, preg);
      }
    }
  }

  fn run(&mut self) {
    self.make_worklist();
    loop {
      if !self.simplify_worklist.is_empty() {
        self.simplify();
      } else if !self.move_worklist.is_empty() {
        self.coalesce();
      } else if !self.freeze_worklist.is_empty() {
        self.freeze();
      } else if !self.spill_worklist.is_empty() {
        self.select_spill();
      } else {
        break;
      }
    }
    self.assign_colors();
  }
}

/// One round of iterated register coalescing over `func`, whose liveness
/// must be up to date.
pub fn alloc_round(
  func: &Func, universe: &RealRegUniverse, spill_state: &SpillState,
  opts: &Options,
) -> (RoundOutcome, MoveStats) {
  let graph = build(func, universe, true);
  let mut state = IrcState::new(graph, universe, spill_state, opts);
  state.run();

  if log_enabled!(Level::Info) {
    info!(
      "irc round: {} nodes, {} colored, {} spilled, {} moves coalesced, {} constrained, {} frozen",
      state.graph.nodes.len(),
      state.color.len(),
      state.spilled_nodes.len(),
      state.stats.coalesced,
      state.stats.constrained,
      state.stats.frozen
    );
  }

  let stats = state.stats;
  if state.spilled_nodes.is_empty() {
    (RoundOutcome::Colored(state.color), stats)
  } else {
    let mut spilled = state.spilled_nodes;
    spilled.sort();
    (RoundOutcome::Spilled(spilled), stats)
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::analysis::run_liveness;
  use crate::mc::*;

  fn ra() -> Reg {
    Reg::new_phys(PhysReg::Ra)
  }

  fn colors_of(outcome: RoundOutcome) -> Map<VirtualReg, PhysReg> {
    match outcome {
      RoundOutcome::Colored(c) => c,
      RoundOutcome::Spilled(s) => panic!("unexpected spills {:?}", s),
    }
  }

  #[test]
  fn test_coalesce_virtual_pair() {
    let mut func = Func::new("pair");
    let a = func.new_virtual_reg();
    let b = func.new_virtual_reg();
    let c = func.new_virtual_reg();
    func.block(
      "entry",
      vec![i_li(a, 1), i_move(b, a), i_addiu(c, b, 2), i_jr(ra(), false)],
    );
    func.finish().unwrap();
    run_liveness(&mut func).unwrap();
    let spill_state = SpillState::new();
    let opts = Options::default();
    let (outcome, stats) =
      alloc_round(&func, &RealRegUniverse::mips(), &spill_state, &opts);
    let colors = colors_of(outcome);
    assert_eq!(stats.coalesced, 1);
    assert_eq!(colors[&a.to_virtual_reg()], colors[&b.to_virtual_reg()]);
  }

  #[test]
  fn test_coalesce_with_physical() {
    // The result is moved into t3; coalescing with t3 avoids the move.
    let mut func = Func::new("phys");
    let a = func.new_virtual_reg();
    let t3 = Reg::new_phys(PhysReg::T3);
    func.block(
      "entry",
      vec![i_li(a, 1), i_move(t3, a), i_jr(ra(), false)],
    );
    func.finish().unwrap();
    run_liveness(&mut func).unwrap();
    let spill_state = SpillState::new();
    let opts = Options::default();
    let (outcome, stats) =
      alloc_round(&func, &RealRegUniverse::mips(), &spill_state, &opts);
    assert_eq!(stats.coalesced, 1);
    assert_eq!(colors_of(outcome)[&a.to_virtual_reg()], PhysReg::T3);
  }

  #[test]
  fn test_constrained_move() {
    // b = a, then both are used together, with a redefined in between so
    // they hold different values.
    let mut func = Func::new("constrained");
    let a = func.new_virtual_reg();
    let b = func.new_virtual_reg();
    let c = func.new_virtual_reg();
    func.block(
      "entry",
      vec![
        i_li(a, 1),
        i_move(b, a),
        i_addiu(a, a, 1),
        i_addu(c, a, b),
        i_jr(ra(), false),
      ],
    );
    func.finish().unwrap();
    run_liveness(&mut func).unwrap();
    let spill_state = SpillState::new();
    let opts = Options::default();
    let (outcome, stats) =
      alloc_round(&func, &RealRegUniverse::mips(), &spill_state, &opts);
    assert_eq!(stats.coalesced, 0);
    assert_eq!(stats.constrained, 1);
    let colors = colors_of(outcome);
    assert_ne!(colors[&a.to_virtual_reg()], colors[&b.to_virtual_reg()]);
  }

  #[test]
  fn test_potential_spill_becomes_actual() {
    // Three values live at once with two colors.
    let mut func = Func::new("three");
    let a = func.new_virtual_reg();
    let b = func.new_virtual_reg();
    let c = func.new_virtual_reg();
    let d = func.new_virtual_reg();
    func.block(
      "entry",
      vec![
        i_li(a, 1),
        i_li(b, 2),
        i_li(c, 3),
        i_addu(d, a, b),
        i_addu(d, d, c),
        i_jr(ra(), false),
      ],
    );
    func.finish().unwrap();
    run_liveness(&mut func).unwrap();
    let spill_state = SpillState::new();
    let opts = Options::default();
    let (outcome, _) =
      alloc_round(&func, &RealRegUniverse::restricted(2), &spill_state, &opts);
    match outcome {
      RoundOutcome::Spilled(spilled) => assert_eq!(spilled.len(), 1),
      RoundOutcome::Colored(c) => panic!("colored {:?}", c),
    }
  }
}
