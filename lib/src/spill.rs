/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Spill code: how references to a spilled register are batched within a
//! block, and the loads, stores and rematerialisations inserted around each
//! batch.

use log::{debug, trace};

use crate::data_structures::{
  BlockIx, InstIx, Map, PhysReg, Reg, VirtualReg,
};
use crate::func::{Func, InstOrigin, RematLoc};
use crate::interface::SpillSchemeChoice;
use crate::mc::{
  can_encode_imm, i_addiu, i_addu, i_lui, i_lw, i_sw, imm_hi, imm_lo, Inst,
};

//=============================================================================
// Batching policies

/// Decides where one batch of references to a spilled register ends and the
/// next begins.  The materialiser calls `should_flush` before looking at
/// each instruction of a block, and `look` on it afterwards; `touches` says
/// whether the instruction mentions the spilled register.
pub trait SpillScheme {
  fn look(&mut self, inst: &Inst, touches: bool);
  fn should_flush(&self) -> bool;
  fn reset(&mut self);
}

/// Batches are runs of consecutive referencing instructions, cut after
/// `limit` instructions have been scanned.
pub struct CountInstrSpillScheme {
  limit: u32,
  count: u32,
  boundary: bool,
}

impl CountInstrSpillScheme {
  pub fn new(limit: u32) -> Self {
    Self { limit, count: 0, boundary: false }
  }
}

impl SpillScheme for CountInstrSpillScheme {
  fn look(&mut self, _inst: &Inst, touches: bool) {
    self.count += 1;
    if !touches {
      self.boundary = true;
    }
  }
  fn should_flush(&self) -> bool {
    self.boundary || self.count > self.limit
  }
  fn reset(&mut self) {
    self.count = 0;
    self.boundary = false;
  }
}

/// Every referencing instruction is a batch of its own.
pub struct EverywhereSpillScheme {
  seen: bool,
}

impl EverywhereSpillScheme {
  pub fn new() -> Self {
    Self { seen: false }
  }
}

impl SpillScheme for EverywhereSpillScheme {
  fn look(&mut self, _inst: &Inst, _touches: bool) {
    self.seen = true;
  }
  fn should_flush(&self) -> bool {
    self.seen
  }
  fn reset(&mut self) {
    self.seen = false;
  }
}

pub fn make_spill_scheme(choice: SpillSchemeChoice) -> Box<dyn SpillScheme> {
  match choice {
    SpillSchemeChoice::CountInstr { limit } => {
      Box::new(CountInstrSpillScheme::new(limit))
    }
    SpillSchemeChoice::Everywhere => Box::new(EverywhereSpillScheme::new()),
  }
}

//=============================================================================
// Bookkeeping that survives from one allocation round to the next

/// Registers below this recorded live length are never worth spilling
/// again: doing so reproduces the same code.
pub const MINIMAL_LIVE_LENGTH: u32 = 2;

pub struct SpillState {
  // Clone -> the register originally spilled.
  origin: Map<VirtualReg, VirtualReg>,
  // Instructions from first to last mention, inclusive, when created.
  live_length: Map<VirtualReg, u32>,
  pub num_stack_spills: u32,
  pub num_remat_spills: u32,
  pub num_inserted: u32,
  pub spilled: Vec<VirtualReg>,
}

impl SpillState {
  pub fn new() -> Self {
    Self {
      origin: Map::default(),
      live_length: Map::default(),
      num_stack_spills: 0,
      num_remat_spills: 0,
      num_inserted: 0,
      spilled: vec![],
    }
  }

  pub fn live_length(&self, vreg: VirtualReg) -> Option<u32> {
    self.live_length.get(&vreg).copied()
  }

  pub fn root_of(&self, vreg: VirtualReg) -> VirtualReg {
    self.origin.get(&vreg).copied().unwrap_or(vreg)
  }

  pub fn is_clone(&self, vreg: VirtualReg) -> bool {
    self.origin.contains_key(&vreg)
  }

  /// Spilling this register again could not make progress.
  pub fn is_minimal(&self, vreg: VirtualReg) -> bool {
    match self.live_length(vreg) {
      Some(len) => len <= MINIMAL_LIVE_LENGTH,
      None => false,
    }
  }
}

//=============================================================================
// Materialisation

fn sp() -> Reg {
  Reg::new_phys(PhysReg::Sp)
}

fn zero() -> Reg {
  Reg::new_phys(PhysReg::Zero)
}

// The references to the spilled register in one batch, all renamed to
// |clone|.
struct Batch {
  clone: Option<Reg>,
  first_use: Option<InstIx>,
  last_def: Option<InstIx>,
}

impl Batch {
  fn new() -> Self {
    Self { clone: None, first_use: None, last_def: None }
  }
}

// Where the value of a spilled register lives.
#[derive(Clone, Copy)]
enum Home {
  Slot(i32),
  Remat(RematLoc),
}

/// Rewrite every reference to `vreg` in terms of fresh short-lived clones,
/// inserting the code that moves the value between the clones and its
/// home.  Registers in the function's remat table are recomputed instead of
/// getting a stack slot.  Afterwards `vreg` is retired.
pub fn spill_register(
  func: &mut Func, vreg: VirtualReg, scheme: &mut dyn SpillScheme,
  state: &mut SpillState,
) {
  let home = match func.remat.get(&vreg) {
    Some(loc) => {
      state.num_remat_spills += 1;
      Home::Remat(*loc)
    }
    None => {
      func.frame_size += 4;
      state.num_stack_spills += 1;
      Home::Slot(func.frame_size - 4)
    }
  };
  let root = state.root_of(vreg);
  debug!("spill_register: {:?} (root {:?}) to {:?}", vreg, root, home_str(home));
  state.spilled.push(vreg);

  let target = vreg.to_reg();
  for bix in func.blocks.range() {
    scheme.reset();
    let mut batch = Batch::new();
    for iix in func.block_insts(bix) {
      let touches = func.inst(iix).get_regs().mentions(target);
      if scheme.should_flush() {
        flush(func, bix, &batch, root, home, state);
        batch = Batch::new();
        scheme.reset();
      }
      scheme.look(func.inst(iix), touches);
      if !touches {
        continue;
      }

      let clone = match batch.clone {
        Some(clone) => clone,
        None => {
          let clone = func.new_virtual_reg();
          state.origin.insert(clone.to_virtual_reg(), root);
          if let Home::Remat(loc) = home {
            func.remat.insert(clone.to_virtual_reg(), loc);
          }
          batch.clone = Some(clone);
          clone
        }
      };
      let regs = func.inst(iix).get_regs();
      if regs.uses.contains(&target)
        && batch.first_use.is_none()
        && batch.last_def.is_none()
      {
        batch.first_use = Some(iix);
      }
      if regs.defs.contains(&target) {
        batch.last_def = Some(iix);
      }
      func.inst_mut(iix).map_regs(|r| if r == target { clone } else { r });
    }
    flush(func, bix, &batch, root, home, state);
  }

  func.retire_vreg(vreg);
}

fn home_str(home: Home) -> String {
  match home {
    Home::Slot(offset) => format!("slot {}($sp)", offset),
    Home::Remat(RematLoc::GlobalAddr(addr)) => format!("global {}", addr),
    Home::Remat(RematLoc::StackOffset(offset)) => format!("$sp + {}", offset),
  }
}

fn flush(
  func: &mut Func, bix: BlockIx, batch: &Batch, root: VirtualReg, home: Home,
  state: &mut SpillState,
) {
  let clone = match batch.clone {
    Some(clone) => clone,
    None => return,
  };
  match home {
    Home::Slot(offset) => {
      if let Some(first_use) = batch.first_use {
        emit_load(func, clone, offset, first_use, root, state);
      }
      if let Some(last_def) = batch.last_def {
        emit_store(func, clone, offset, last_def, root, state);
      }
    }
    Home::Remat(loc) => {
      // The home never changes, so definitions need no store.
      if let Some(first_use) = batch.first_use {
        emit_remat(func, clone, loc, first_use, root, state);
      }
    }
  }

  let mut first = None;
  let mut last = 0;
  for (pos, iix) in func.block_insts(bix).into_iter().enumerate() {
    if func.inst(iix).get_regs().mentions(clone) {
      if first.is_none() {
        first = Some(pos);
      }
      last = pos;
    }
  }
  if let Some(first) = first {
    let len = (last - first + 1) as u32;
    trace!("  {:?} lives for {} instructions", clone, len);
    state.live_length.insert(clone.to_virtual_reg(), len);
  }
}

// A register holding the address of a slot too far from sp for a 16-bit
// offset, good for two instructions.
fn new_address_temp(func: &mut Func, state: &mut SpillState) -> Reg {
  let tmp = func.new_virtual_reg();
  state.live_length.insert(tmp.to_virtual_reg(), MINIMAL_LIVE_LENGTH);
  tmp
}

fn emit_load(
  func: &mut Func, dst: Reg, offset: i32, before: InstIx, root: VirtualReg,
  state: &mut SpillState,
) {
  let origin = InstOrigin::SpillLoad { vreg: root, slot: offset };
  if can_encode_imm(offset) {
    func.insert_before(before, i_lw(dst, sp(), offset), origin);
    state.num_inserted += 1;
  } else {
    let tmp = new_address_temp(func, state);
    func.insert_before(before, i_lui(tmp, imm_hi(offset)), InstOrigin::AddrTemp);
    func.insert_before(before, i_addu(tmp, tmp, sp()), InstOrigin::AddrTemp);
    func.insert_before(before, i_lw(dst, tmp, imm_lo(offset)), origin);
    state.num_inserted += 3;
  }
}

fn emit_store(
  func: &mut Func, src: Reg, offset: i32, after: InstIx, root: VirtualReg,
  state: &mut SpillState,
) {
  let origin = InstOrigin::SpillStore { vreg: root, slot: offset };
  if can_encode_imm(offset) {
    func.insert_after(after, i_sw(src, sp(), offset), origin);
    state.num_inserted += 1;
  } else {
    let tmp = new_address_temp(func, state);
    let hi =
      func.insert_after(after, i_lui(tmp, imm_hi(offset)), InstOrigin::AddrTemp);
    let add = func.insert_after(hi, i_addu(tmp, tmp, sp()), InstOrigin::AddrTemp);
    func.insert_after(add, i_sw(src, tmp, imm_lo(offset)), origin);
    state.num_inserted += 3;
  }
}

fn emit_remat(
  func: &mut Func, dst: Reg, loc: RematLoc, before: InstIx, root: VirtualReg,
  state: &mut SpillState,
) {
  let origin = InstOrigin::Remat { vreg: root };
  let (base, value) = match loc {
    RematLoc::GlobalAddr(addr) => (zero(), addr),
    RematLoc::StackOffset(offset) => (sp(), offset),
  };
  if can_encode_imm(value) {
    func.insert_before(before, i_addiu(dst, base, value), origin);
    state.num_inserted += 1;
  } else {
    func.insert_before(before, i_lui(dst, imm_hi(value)), origin);
    func.insert_before(before, i_addiu(dst, dst, imm_lo(value)), origin);
    state.num_inserted += 2;
    if base != zero() {
      func.insert_before(before, i_addu(dst, dst, base), origin);
      state.num_inserted += 1;
    }
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::mc::*;

  fn ra() -> Reg {
    Reg::new_phys(PhysReg::Ra)
  }

  fn shown(func: &Func, bix: BlockIx) -> Vec<String> {
    func
      .block_insts(bix)
      .into_iter()
      .map(|iix| format!("{:?}", func.inst(iix)))
      .collect()
  }

  #[test]
  fn test_count_scheme() {
    let nop = i_jr(ra(), false);
    let mut scheme = CountInstrSpillScheme::new(2);
    scheme.look(&nop, true);
    scheme.look(&nop, true);
    assert!(!scheme.should_flush());
    scheme.look(&nop, true);
    assert!(scheme.should_flush());
    scheme.reset();
    assert!(!scheme.should_flush());
    scheme.look(&nop, false);
    assert!(scheme.should_flush());

    let mut everywhere = EverywhereSpillScheme::new();
    assert!(!everywhere.should_flush());
    everywhere.look(&nop, true);
    assert!(everywhere.should_flush());
  }

  // a = 1; b = 2; c = a + b; d = c + a; return
  fn sample() -> (Func, Reg) {
    let mut func = Func::new("sample");
    let a = func.new_virtual_reg();
    let b = func.new_virtual_reg();
    let c = func.new_virtual_reg();
    let d = func.new_virtual_reg();
    func.block(
      "entry",
      vec![
        i_li(a, 1),
        i_li(b, 2),
        i_addu(c, a, b),
        i_addu(d, c, a),
        i_jr(ra(), false),
      ],
    );
    func.finish().unwrap();
    (func, a)
  }

  #[test]
  fn test_stack_spill() {
    let (mut func, a) = sample();
    func.frame_size = 8;
    let mut state = SpillState::new();
    let mut scheme = CountInstrSpillScheme::new(30);
    spill_register(&mut func, a.to_virtual_reg(), &mut scheme, &mut state);

    assert_eq!(func.frame_size, 12);
    assert_eq!(state.num_stack_spills, 1);
    assert!(!func.is_registered(a.to_virtual_reg()));
    // The def and the two uses are separated by |li b|, so there are two
    // batches: a store after the def, and one load serving both uses.
    assert_eq!(
      shown(&func, BlockIx::new(0)),
      vec![
        "addiu %v4, $zero, 1",
        "sw %v4, 8($sp)",
        "addiu %v1, $zero, 2",
        "lw %v5, 8($sp)",
        "addu %v2, %v5, %v1",
        "addu %v3, %v2, %v5",
        "jr $ra",
      ]
    );
    assert_eq!(state.live_length(VirtualReg::new(4)), Some(2));
    assert_eq!(state.live_length(VirtualReg::new(5)), Some(3));
    assert_eq!(state.root_of(VirtualReg::new(5)), a.to_virtual_reg());
    assert!(state.is_minimal(VirtualReg::new(4)));
    assert!(!state.is_minimal(VirtualReg::new(5)));
    assert_eq!(state.num_inserted, 2);
  }

  #[test]
  fn test_long_run_is_cut() {
    // a = 0, then 40 increments of a in a row.
    let mut func = Func::new("long");
    let a = func.new_virtual_reg();
    let mut insts = vec![i_li(a, 0)];
    insts.extend((0..40).map(|_| i_addiu(a, a, 1)));
    insts.push(i_jr(ra(), false));
    func.block("entry", insts);
    func.finish().unwrap();

    let mut state = SpillState::new();
    let mut scheme = CountInstrSpillScheme::new(30);
    spill_register(&mut func, a.to_virtual_reg(), &mut scheme, &mut state);

    // The first batch ends after 31 instructions; the rest share a second
    // clone, reloaded from the slot the first one stored to.
    let text = shown(&func, BlockIx::new(0));
    assert_eq!(text.len(), 45);
    assert_eq!(text[0], "addiu %v1, $zero, 0");
    assert_eq!(text[30], "addiu %v1, %v1, 1");
    assert_eq!(text[31], "sw %v1, 0($sp)");
    assert_eq!(text[32], "lw %v2, 0($sp)");
    assert_eq!(text[33], "addiu %v2, %v2, 1");
    assert_eq!(text[43], "sw %v2, 0($sp)");
    assert_eq!(text[44], "jr $ra");
    assert_eq!(state.num_inserted, 3);
    assert_eq!(state.live_length(VirtualReg::new(1)), Some(32));
    assert_eq!(state.live_length(VirtualReg::new(2)), Some(12));
    assert_eq!(state.root_of(VirtualReg::new(2)), a.to_virtual_reg());
  }

  #[test]
  fn test_everywhere_spill() {
    let (mut func, a) = sample();
    let mut state = SpillState::new();
    let mut scheme = EverywhereSpillScheme::new();
    spill_register(&mut func, a.to_virtual_reg(), &mut scheme, &mut state);
    assert_eq!(
      shown(&func, BlockIx::new(0)),
      vec![
        "addiu %v4, $zero, 1",
        "sw %v4, 0($sp)",
        "addiu %v1, $zero, 2",
        "lw %v5, 0($sp)",
        "addu %v2, %v5, %v1",
        "lw %v6, 0($sp)",
        "addu %v3, %v2, %v6",
        "jr $ra",
      ]
    );
  }

  #[test]
  fn test_far_slot() {
    let (mut func, a) = sample();
    func.frame_size = 40000;
    let mut state = SpillState::new();
    let mut scheme = CountInstrSpillScheme::new(30);
    spill_register(&mut func, a.to_virtual_reg(), &mut scheme, &mut state);
    // The slot is at 40000 = (1 << 16) + -25536.
    assert_eq!(
      shown(&func, BlockIx::new(0)),
      vec![
        "addiu %v4, $zero, 1",
        "lui %v5, 1",
        "addu %v5, %v5, $sp",
        "sw %v4, -25536(%v5)",
        "addiu %v1, $zero, 2",
        "lui %v7, 1",
        "addu %v7, %v7, $sp",
        "lw %v6, -25536(%v7)",
        "addu %v2, %v6, %v1",
        "addu %v3, %v2, %v6",
        "jr $ra",
      ]
    );
    assert_eq!(state.live_length(VirtualReg::new(5)), Some(2));
    assert!(state.is_minimal(VirtualReg::new(7)));
    assert_eq!(state.num_inserted, 6);
  }

  #[test]
  fn test_remat_spill() {
    let mut func = Func::new("remat");
    let p = func.new_virtual_reg();
    let g = func.new_virtual_reg();
    let x = func.new_virtual_reg();
    func.block(
      "entry",
      vec![
        i_addiu(p, Reg::new_phys(PhysReg::Sp), 16),
        i_li(g, 70000),
        i_lw(x, p, 0),
        i_sw(x, g, 4),
        i_jr(ra(), false),
      ],
    );
    func.finish().unwrap();
    func.remat.insert(p.to_virtual_reg(), RematLoc::StackOffset(16));
    func.remat.insert(g.to_virtual_reg(), RematLoc::GlobalAddr(70000));

    let mut state = SpillState::new();
    let mut scheme = CountInstrSpillScheme::new(30);
    spill_register(&mut func, p.to_virtual_reg(), &mut scheme, &mut state);
    spill_register(&mut func, g.to_virtual_reg(), &mut scheme, &mut state);

    assert_eq!(func.frame_size, 0);
    assert_eq!(state.num_remat_spills, 2);
    assert_eq!(
      shown(&func, BlockIx::new(0)),
      vec![
        "addiu %v3, $sp, 16",
        "addiu %v5, $zero, 70000",
        "addiu %v4, $sp, 16",
        "lw %v2, 0(%v4)",
        "lui %v6, 1",
        "addiu %v6, %v6, 4464",
        "sw %v2, 4(%v6)",
        "jr $ra",
      ]
    );
    // Clones can be rematerialised the same way.
    assert_eq!(
      func.remat.get(&VirtualReg::new(4)),
      Some(&RematLoc::StackOffset(16))
    );
  }
}
