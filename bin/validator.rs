/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Well-formedness checks for functions handed to the allocator, and for
//! what comes back.

use log::info;

use regcolor::analysis::check_registered;
use regcolor::data_structures::BlockIx;
use regcolor::{Func, PhysReg, RealRegUniverse};

use crate::test_framework::RunResult;

/// Checks a function before allocation.
pub fn validate(func: &Func) -> Result<(), String> {
  if func.blocks.is_empty() {
    return Err("function has no blocks".into());
  }

  for bix in func.blocks.range() {
    let block = &func.blocks[bix];
    let insts = func.block_insts(bix);
    for (i, iix) in insts.iter().enumerate() {
      let inst = func.inst(*iix);
      if let Some(label) = inst.get_target() {
        if label.get_block_ix().is_none() {
          return Err(format!("unresolved label {:?} in block {}", label, block.name));
        }
      }
      // No control flow instructions in the middle.
      if inst.is_control_flow() && i + 1 != insts.len() {
        return Err(format!(
          "control flow inst {:?} in the middle of block {}",
          inst, block.name
        ));
      }
      if inst.get_regs().defs.contains(&PhysReg::Sp.to_reg()) {
        return Err(format!("inst {:?} in block {} writes $sp", inst, block.name));
      }
    }
  }

  // Control must not run off the end of the last block.
  let last = BlockIx::new(func.blocks.len() - 1);
  let falls_off = match func.last_inst(last) {
    Some(iix) => func.inst(iix).falls_through(),
    None => true,
  };
  if falls_off {
    return Err(format!("last block {} falls off the end", func.blocks[last].name));
  }

  check_registered(func).map_err(|e| e.to_string())
}

/// Checks a function after allocation: no virtual registers remain, and
/// every register written is either reserved or in the universe.
pub fn validate_allocated(
  func: &Func, universe: &RealRegUniverse,
) -> Result<(), String> {
  for iix in func.layout() {
    let inst = func.inst(iix);
    let regs = inst.get_regs();
    for reg in regs.uses.iter().chain(regs.defs.iter()) {
      if reg.is_virtual() {
        return Err(format!("virtual register left in {:?}", inst));
      }
    }
  }
  for preg in func.callee_saves.iter() {
    if !universe.is_allocatable(*preg) {
      return Err(format!("callee save {} is not allocatable", preg));
    }
  }
  Ok(())
}

/// Compares an interpreter run before allocation with one after.
pub fn check_results(
  before_regalloc_result: &Result<RunResult, String>,
  after_regalloc_result: &Result<RunResult, String>,
) {
  match before_regalloc_result {
    Ok(before) => {
      let after = match after_regalloc_result {
        Ok(after) => after,
        Err(err) => panic!("code after regalloc should have succeeded: {}", err),
      };

      assert_eq!(
        before.ret_value, after.ret_value,
        "Incorrect interpreter result: expected {:?}, observed {:?}",
        before.ret_value, after.ret_value
      );

      assert_eq!(
        before.stdout, after.stdout,
        r#"Different stdout values before/after regalloc:
- before:
{}
-after:
{}
        "#,
        before.stdout, after.stdout
      );
    }

    // Nothing to compare against: the original already misbehaves.
    Err(err) => info!("original function failed to run: {}", err),
  }
}
