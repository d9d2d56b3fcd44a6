/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Functions: an arena of instructions linked into blocks, plus the
//! per-function state the allocator reads and updates (register table,
//! frame size, rematerialisation table, callee-save set).
//!
//! Instructions are never moved or freed.  Inserting or removing one only
//! rewires the prev/next handles of its neighbours, so an `InstIx` stays
//! valid for the whole life of the function.

use log::trace;
use std::fmt;

use crate::data_structures::{
  BlockIx, InstIx, Map, PhysReg, Reg, Set, TypedIxVec, VirtualReg,
};
use crate::mc::{Inst, Label};

#[cfg(feature = "enable-serde")]
use serde::{Deserialize, Serialize};

//=============================================================================
// Instructions in the arena

/// Who put an instruction there.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub enum InstOrigin {
  /// Present in the function handed to the allocator.
  User,
  /// Reload of `vreg` from the stack slot at `slot(sp)`.
  SpillLoad { vreg: VirtualReg, slot: i32 },
  /// Store of `vreg` to the stack slot at `slot(sp)`.
  SpillStore { vreg: VirtualReg, slot: i32 },
  /// Recomputation of `vreg` from its known address.
  Remat { vreg: VirtualReg },
  /// Address arithmetic for a slot too far from sp to encode directly.
  AddrTemp,
}

#[derive(Clone)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct InstData {
  pub inst: Inst,
  pub origin: InstOrigin,
  block: BlockIx,
  prev: Option<InstIx>,
  next: Option<InstIx>,
  removed: bool,
}

//=============================================================================
// Blocks

#[derive(Clone)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct Block {
  pub name: String,
  first: Option<InstIx>,
  last: Option<InstIx>,
  pub succs: Vec<BlockIx>,
  pub preds: Vec<BlockIx>,
  /// Loop nesting depth; 0 outside any loop.
  pub loop_depth: u32,
  // Liveness, recomputed wholesale by `analysis::run_liveness`.
  pub live_use: Set<Reg>,
  pub live_def: Set<Reg>,
  pub live_in: Set<Reg>,
  pub live_out: Set<Reg>,
}

impl Block {
  fn new(name: &str) -> Block {
    Block {
      name: name.to_string(),
      first: None,
      last: None,
      succs: vec![],
      preds: vec![],
      loop_depth: 0,
      live_use: Set::empty(),
      live_def: Set::empty(),
      live_in: Set::empty(),
      live_out: Set::empty(),
    }
  }
}

//=============================================================================
// Registers with a known home

/// A virtual register whose value can be recomputed from an address rather
/// than reloaded from a spill slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub enum RematLoc {
  /// The register holds the address of a global.
  GlobalAddr(i32),
  /// The register holds `sp + offset`, e.g. the address of a stack local.
  StackOffset(i32),
}

#[derive(Clone, Debug)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct VRegInfo {
  pub label: Option<String>,
  /// Set once a register has been spilled and every reference to it
  /// replaced.  Retired registers must not appear in the code.
  pub retired: bool,
}

//=============================================================================
// Func

#[derive(Clone)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct Func {
  pub name: String,
  insts: TypedIxVec<InstIx, InstData>,
  // Note that |blocks| are in layout order; fall-through goes from one
  // block to the next in this vector.
  pub blocks: TypedIxVec<BlockIx, Block>,
  vregs: Vec<VRegInfo>,
  /// Bytes of stack frame.  Only ever grows.
  pub frame_size: i32,
  pub remat: Map<VirtualReg, RematLoc>,
  /// Allocatable registers this function writes, filled in by allocation.
  pub callee_saves: Vec<PhysReg>,
}

impl Func {
  pub fn new(name: &str) -> Func {
    Func {
      name: name.to_string(),
      insts: TypedIxVec::new(),
      blocks: TypedIxVec::new(),
      vregs: vec![],
      frame_size: 0,
      remat: Map::default(),
      callee_saves: vec![],
    }
  }

  // === Virtual registers ===

  pub fn new_virtual_reg(&mut self) -> Reg {
    let v = Reg::new_virtual(self.vregs.len() as u32);
    self.vregs.push(VRegInfo { label: None, retired: false });
    v
  }

  pub fn new_virtual_reg_labeled(&mut self, label: &str) -> Reg {
    let v = Reg::new_virtual(self.vregs.len() as u32);
    self.vregs.push(VRegInfo { label: Some(label.to_string()), retired: false });
    v
  }

  pub fn num_virtual_regs(&self) -> u32 {
    self.vregs.len() as u32
  }

  pub fn vreg_label(&self, vreg: VirtualReg) -> Option<&str> {
    self.vregs.get(vreg.get_index()).and_then(|info| info.label.as_deref())
  }

  /// Known to the register table and not yet retired.
  pub fn is_registered(&self, vreg: VirtualReg) -> bool {
    match self.vregs.get(vreg.get_index()) {
      Some(info) => !info.retired,
      None => false,
    }
  }

  pub fn retire_vreg(&mut self, vreg: VirtualReg) {
    if let Some(info) = self.vregs.get_mut(vreg.get_index()) {
      info.retired = true;
    }
  }

  pub fn show_reg(&self, reg: Reg) -> String {
    match reg.as_virtual_reg() {
      Some(vreg) => match self.vreg_label(vreg) {
        Some(label) => format!("%{}", label),
        None => format!("{:?}", vreg),
      },
      None => format!("{:?}", reg),
    }
  }

  // === Blocks ===

  pub fn add_block(&mut self, name: &str) -> BlockIx {
    let bix = BlockIx::new(self.blocks.len());
    self.blocks.push(Block::new(name));
    bix
  }

  /// Add a block holding `insts`, in order.
  pub fn block(&mut self, name: &str, insts: Vec<Inst>) -> BlockIx {
    let bix = self.add_block(name);
    for inst in insts {
      self.push_inst(bix, inst);
    }
    bix
  }

  pub fn entry_block(&self) -> BlockIx {
    BlockIx::new(0)
  }

  pub fn find_block(&self, name: &str) -> Option<BlockIx> {
    self.blocks.range().into_iter().find(|bix| self.blocks[*bix].name == name)
  }

  pub fn first_inst(&self, bix: BlockIx) -> Option<InstIx> {
    self.blocks[bix].first
  }

  pub fn last_inst(&self, bix: BlockIx) -> Option<InstIx> {
    self.blocks[bix].last
  }

  /// Snapshot of a block's instructions, in order.  Safe to hold while the
  /// block is being edited.
  pub fn block_insts(&self, bix: BlockIx) -> Vec<InstIx> {
    let mut res = vec![];
    let mut cursor = self.blocks[bix].first;
    while let Some(iix) = cursor {
      res.push(iix);
      cursor = self.insts[iix].next;
    }
    res
  }

  /// Every live instruction in layout order.
  pub fn layout(&self) -> Vec<InstIx> {
    let mut res = vec![];
    for bix in self.blocks.range() {
      res.extend(self.block_insts(bix));
    }
    res
  }

  pub fn num_insts(&self) -> usize {
    self.insts.iter().filter(|data| !data.removed).count()
  }

  // === Instructions ===

  pub fn inst(&self, iix: InstIx) -> &Inst {
    &self.insts[iix].inst
  }

  pub fn inst_mut(&mut self, iix: InstIx) -> &mut Inst {
    &mut self.insts[iix].inst
  }

  pub fn origin(&self, iix: InstIx) -> InstOrigin {
    self.insts[iix].origin
  }

  pub fn inst_block(&self, iix: InstIx) -> BlockIx {
    self.insts[iix].block
  }

  pub fn next_inst(&self, iix: InstIx) -> Option<InstIx> {
    self.insts[iix].next
  }

  pub fn prev_inst(&self, iix: InstIx) -> Option<InstIx> {
    self.insts[iix].prev
  }

  pub fn is_removed(&self, iix: InstIx) -> bool {
    self.insts[iix].removed
  }

  fn alloc_inst(
    &mut self, inst: Inst, origin: InstOrigin, block: BlockIx,
  ) -> InstIx {
    let iix = InstIx::new(self.insts.len());
    self.insts.push(InstData {
      inst,
      origin,
      block,
      prev: None,
      next: None,
      removed: false,
    });
    iix
  }

  /// Append a user instruction at the end of `bix`.
  pub fn push_inst(&mut self, bix: BlockIx, inst: Inst) -> InstIx {
    let iix = self.alloc_inst(inst, InstOrigin::User, bix);
    match self.blocks[bix].last {
      Some(last) => {
        self.insts[last].next = Some(iix);
        self.insts[iix].prev = Some(last);
      }
      None => self.blocks[bix].first = Some(iix),
    }
    self.blocks[bix].last = Some(iix);
    iix
  }

  pub fn insert_before(
    &mut self, at: InstIx, inst: Inst, origin: InstOrigin,
  ) -> InstIx {
    debug_assert!(!self.insts[at].removed);
    let bix = self.insts[at].block;
    let iix = self.alloc_inst(inst, origin, bix);
    let prev = self.insts[at].prev;
    self.insts[iix].prev = prev;
    self.insts[iix].next = Some(at);
    self.insts[at].prev = Some(iix);
    match prev {
      Some(p) => self.insts[p].next = Some(iix),
      None => self.blocks[bix].first = Some(iix),
    }
    trace!("insert {:?} before {:?}: {:?}", iix, at, self.insts[iix].inst);
    iix
  }

  pub fn insert_after(
    &mut self, at: InstIx, inst: Inst, origin: InstOrigin,
  ) -> InstIx {
    debug_assert!(!self.insts[at].removed);
    let bix = self.insts[at].block;
    let iix = self.alloc_inst(inst, origin, bix);
    let next = self.insts[at].next;
    self.insts[iix].prev = Some(at);
    self.insts[iix].next = next;
    self.insts[at].next = Some(iix);
    match next {
      Some(n) => self.insts[n].prev = Some(iix),
      None => self.blocks[bix].last = Some(iix),
    }
    trace!("insert {:?} after {:?}: {:?}", iix, at, self.insts[iix].inst);
    iix
  }

  /// Unlink an instruction.  Hard boundaries (calls, syscalls, branches,
  /// stores, mul/div, writes to sp) must never be removed.
  pub fn remove_inst(&mut self, iix: InstIx) {
    debug_assert!(
      !self.insts[iix].inst.is_hard_boundary(),
      "Func::remove_inst: {:?} is a hard boundary",
      self.insts[iix].inst
    );
    debug_assert!(!self.insts[iix].removed);
    let bix = self.insts[iix].block;
    let prev = self.insts[iix].prev;
    let next = self.insts[iix].next;
    match prev {
      Some(p) => self.insts[p].next = next,
      None => self.blocks[bix].first = next,
    }
    match next {
      Some(n) => self.insts[n].prev = prev,
      None => self.blocks[bix].last = prev,
    }
    let data = &mut self.insts[iix];
    data.prev = None;
    data.next = None;
    data.removed = true;
  }

  // === CFG ===

  /// All blocks have been added.  Resolve branch labels and compute the
  /// successor and predecessor edges.
  ///
  /// Successors of a block are the targets of every branch or jump in it,
  /// plus the next block in layout order if control can fall off the end.
  pub fn finish(&mut self) -> Result<(), String> {
    let mut names = Map::<String, BlockIx>::default();
    for bix in self.blocks.range() {
      let name = self.blocks[bix].name.clone();
      if names.insert(name.clone(), bix).is_some() {
        return Err(format!("duplicate block name '{}'", name));
      }
    }

    for iix in self.layout() {
      if let Some(label) = self.insts[iix].inst.get_target_mut() {
        let name = label.name().to_string();
        match names.get(&name) {
          Some(bix) => *label = Label::Resolved { name, bix: *bix },
          None => return Err(format!("can't resolve label name '{}'", name)),
        }
      }
    }

    let num_blocks = self.blocks.len();
    for bix in self.blocks.range() {
      let mut succs = Vec::<BlockIx>::new();
      let mut falls_through = true;
      for iix in self.block_insts(bix) {
        let inst = &self.insts[iix].inst;
        if let Some(target) = inst.get_target().and_then(|l| l.get_block_ix())
        {
          if !succs.contains(&target) {
            succs.push(target);
          }
        }
        falls_through = inst.falls_through();
      }
      if falls_through && bix.get() + 1 < num_blocks {
        let next = bix.plus(1);
        if !succs.contains(&next) {
          succs.push(next);
        }
      }
      self.blocks[bix].succs = succs;
    }
    self.recompute_preds();
    Ok(())
  }

  /// Override the edges of a block, for clients that know better than the
  /// terminator scan in `finish`.
  pub fn set_succs(&mut self, bix: BlockIx, succs: Vec<BlockIx>) {
    self.blocks[bix].succs = succs;
    self.recompute_preds();
  }

  fn recompute_preds(&mut self) {
    for bix in self.blocks.range() {
      self.blocks[bix].preds.clear();
    }
    for bix in self.blocks.range() {
      for succ in self.blocks[bix].succs.clone() {
        if !self.blocks[succ].preds.contains(&bix) {
          self.blocks[succ].preds.push(bix);
        }
      }
    }
  }
}

//=============================================================================
// Printing.  The output is accepted by the textual parser in the harness.

impl fmt::Display for Func {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    writeln!(fmt, "func {}", self.name)?;
    writeln!(fmt, "frame {}", self.frame_size)?;
    let mut remat: Vec<(&VirtualReg, &RematLoc)> = self.remat.iter().collect();
    remat.sort_by_key(|(vreg, _)| **vreg);
    for (vreg, loc) in remat {
      if !self.is_registered(*vreg) {
        continue;
      }
      let (kind, value) = match loc {
        RematLoc::GlobalAddr(addr) => ("global", addr),
        RematLoc::StackOffset(offset) => ("stack", offset),
      };
      writeln!(fmt, "remat {} {} {}", self.show_reg(vreg.to_reg()), kind, value)?;
    }
    if !self.callee_saves.is_empty() {
      let regs: Vec<String> =
        self.callee_saves.iter().map(|r| r.to_string()).collect();
      writeln!(fmt, "saves {}", regs.join(" "))?;
    }
    for bix in self.blocks.range() {
      let block = &self.blocks[bix];
      writeln!(fmt, "block {} depth {}:", block.name, block.loop_depth)?;
      for iix in self.block_insts(bix) {
        let data = &self.insts[iix];
        let text = data.inst.show_with(|r| self.show_reg(r));
        match data.origin {
          InstOrigin::User => writeln!(fmt, "  {}", text)?,
          InstOrigin::SpillLoad { vreg, .. } => {
            writeln!(fmt, "  {:<28} # reload {}", text, self.show_reg(vreg.to_reg()))?
          }
          InstOrigin::SpillStore { vreg, .. } => {
            writeln!(fmt, "  {:<28} # spill {}", text, self.show_reg(vreg.to_reg()))?
          }
          InstOrigin::Remat { vreg } => {
            writeln!(fmt, "  {:<28} # remat {}", text, self.show_reg(vreg.to_reg()))?
          }
          InstOrigin::AddrTemp => writeln!(fmt, "  {:<28} # slot address", text)?,
        }
      }
    }
    Ok(())
  }
}

impl fmt::Debug for Func {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    write!(fmt, "{}", self)
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::data_structures::PhysReg;
  use crate::mc::*;

  fn diamond() -> (Func, Reg, Reg) {
    let mut func = Func::new("diamond");
    let a = func.new_virtual_reg_labeled("a");
    let b = func.new_virtual_reg();
    func.block(
      "entry",
      vec![i_li(a, 1), i_branch_z(BranchZOp::Bgtz, a, "then")],
    );
    func.block("else", vec![i_li(b, 2), i_j("join")]);
    func.block("then", vec![i_li(b, 3)]);
    func.block("join", vec![i_jr(Reg::new_phys(PhysReg::Ra), false)]);
    func.finish().unwrap();
    (func, a, b)
  }

  #[test]
  fn test_edges() {
    let (func, _, _) = diamond();
    let b = |n: u32| BlockIx::new(n);
    assert_eq!(func.blocks[b(0)].succs, vec![b(2), b(1)]);
    assert_eq!(func.blocks[b(1)].succs, vec![b(3)]);
    // "then" falls through into "join".
    assert_eq!(func.blocks[b(2)].succs, vec![b(3)]);
    assert!(func.blocks[b(3)].succs.is_empty());
    assert_eq!(func.blocks[b(3)].preds, vec![b(1), b(2)]);
  }

  #[test]
  fn test_unknown_label() {
    let mut func = Func::new("bad");
    func.block("entry", vec![i_j("nowhere")]);
    assert!(func.finish().is_err());
  }

  #[test]
  fn test_splicing() {
    let (mut func, a, b) = diamond();
    let entry = func.entry_block();
    let first = func.first_inst(entry).unwrap();
    let branch = func.last_inst(entry).unwrap();

    let mv = func.insert_after(first, i_move(b, a), InstOrigin::User);
    let before =
      func.insert_before(first, i_li(b, 7), InstOrigin::Remat { vreg: b.to_virtual_reg() });
    assert_eq!(func.block_insts(entry), vec![before, first, mv, branch]);
    assert_eq!(func.first_inst(entry), Some(before));
    assert_eq!(func.origin(before), InstOrigin::Remat { vreg: b.to_virtual_reg() });

    func.remove_inst(mv);
    func.remove_inst(before);
    assert_eq!(func.block_insts(entry), vec![first, branch]);
    assert!(func.is_removed(mv));
    assert_eq!(func.prev_inst(branch), Some(first));
    assert_eq!(func.num_insts(), 6);
  }

  #[test]
  fn test_register_table() {
    let (mut func, a, b) = diamond();
    assert_eq!(func.num_virtual_regs(), 2);
    assert_eq!(func.vreg_label(a.to_virtual_reg()), Some("a"));
    assert_eq!(func.show_reg(a), "%a");
    assert_eq!(func.show_reg(b), "%v1");
    func.retire_vreg(b.to_virtual_reg());
    assert!(!func.is_registered(b.to_virtual_reg()));
    assert!(!func.is_registered(VirtualReg::new(9)));
  }

  #[test]
  fn test_printing() {
    let (func, _, _) = diamond();
    let text = format!("{}", func);
    assert!(text.starts_with("func diamond\nframe 0\n"));
    assert!(text.contains("block entry depth 0:\n  addiu %a, $zero, 1\n"));
    assert!(text.contains("  bgtz %a, then\n"));
    assert!(text.contains("  jr $ra\n"));
  }
}
