/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Random functions for the fuzz targets.
//!
//! Generated functions always terminate: branches only go forward.  Every
//! register is defined, and every user stack slot written, in the entry
//! block before anything else runs, so the only way a generated function
//! can fail at run time is by dividing by zero.

use arbitrary::{Arbitrary, Result, Unstructured};
use std::fmt;

use regcolor::mc::*;
use regcolor::{Func, PhysReg, Reg};

pub const MAX_VIRTUAL_REGS: u32 = 24;
const MAX_BLOCKS: u32 = 8;
const MAX_BLOCK_INSTS: u32 = 24;
const NUM_USER_SLOTS: i32 = 8;

/// Precolored registers generated code may mention.
const PRECOLORED: [PhysReg; 2] = [PhysReg::T0, PhysReg::S0];

/// A randomly generated function.
pub struct FuzzFunc(pub Func);

impl fmt::Debug for FuzzFunc {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    write!(fmt, "{}", self.0)
  }
}

struct FuzzingEnv {
  regs: Vec<Reg>,
  num_blocks: u32,
}

impl FuzzingEnv {
  fn reg(&self, u: &mut Unstructured) -> Result<Reg> {
    Ok(*u.choose(&self.regs)?)
  }

  fn imm(&self, u: &mut Unstructured) -> Result<i32> {
    Ok(u.int_in_range(-64..=64)?)
  }

  fn slot(&self, u: &mut Unstructured) -> Result<i32> {
    Ok(4 * u.int_in_range(0..=NUM_USER_SLOTS - 1)?)
  }

  fn later_block(&self, cur: u32, u: &mut Unstructured) -> Result<String> {
    Ok(format!("b{}", u.int_in_range(cur + 1..=self.num_blocks - 1)?))
  }

  fn insts(&self, out: &mut Vec<Inst>, u: &mut Unstructured) -> Result<()> {
    const NUM_VARIANTS: u8 = 9;
    match u8::arbitrary(u)? % NUM_VARIANTS {
      0 => out.push(i_alui(
        *u.choose(AluIOp::ALL)?,
        self.reg(u)?,
        self.reg(u)?,
        self.imm(u)?,
      )),
      1 => out.push(i_alur(
        *u.choose(AluROp::ALL)?,
        self.reg(u)?,
        self.reg(u)?,
        self.reg(u)?,
      )),
      2 => out.push(i_move(self.reg(u)?, self.reg(u)?)),
      3 => out.push(i_abs(self.reg(u)?, self.reg(u)?)),
      4 => out.push(i_lw(self.reg(u)?, PhysReg::Sp.to_reg(), self.slot(u)?)),
      5 => out.push(i_sw(self.reg(u)?, PhysReg::Sp.to_reg(), self.slot(u)?)),
      6 => {
        let op = *u.choose(&[MulDivOp::Mult, MulDivOp::Div])?;
        out.push(i_muldiv(op, self.reg(u)?, self.reg(u)?));
        out.push(i_mf(*u.choose(MfOp::ALL)?, self.reg(u)?));
      }
      7 => {
        out.push(i_move(PhysReg::A0.to_reg(), self.reg(u)?));
        out.push(i_syscall(SyscallKind::PrintInt));
      }
      8 => {
        out.push(i_move(PhysReg::A0.to_reg(), self.reg(u)?));
        out.push(i_call("ext", 1));
        out.push(i_move(self.reg(u)?, PhysReg::V0.to_reg()));
      }
      x => {
        debug_assert!(x < NUM_VARIANTS, "update NUM_VARIANTS above");
        unreachable!()
      }
    }
    Ok(())
  }

  // How block |cur| ends, if it does not just fall through.
  fn terminator(&self, cur: u32, u: &mut Unstructured) -> Result<Option<Inst>> {
    if cur + 1 == self.num_blocks {
      let ret = self.reg(u)?;
      return Ok(Some(i_move(PhysReg::V0.to_reg(), ret)));
    }
    Ok(match u8::arbitrary(u)? % 4 {
      0 => None,
      1 => Some(i_j(&self.later_block(cur, u)?)),
      2 => Some(i_branch_e(
        *u.choose(BranchEOp::ALL)?,
        self.reg(u)?,
        self.reg(u)?,
        &self.later_block(cur, u)?,
      )),
      _ => Some(i_branch_z(
        *u.choose(BranchZOp::ALL)?,
        self.reg(u)?,
        &self.later_block(cur, u)?,
      )),
    })
  }
}

impl<'a> Arbitrary<'a> for FuzzFunc {
  fn arbitrary(u: &mut Unstructured<'a>) -> Result<FuzzFunc> {
    let mut func = Func::new("funk");
    let num_vregs = u.int_in_range(1..=MAX_VIRTUAL_REGS)?;
    let num_blocks = u.int_in_range(1..=MAX_BLOCKS)?;

    let mut regs: Vec<Reg> = (0..num_vregs).map(|_| func.new_virtual_reg()).collect();
    regs.extend(PRECOLORED.iter().map(|r| r.to_reg()));
    let env = FuzzingEnv { regs, num_blocks };
    func.frame_size = 4 * NUM_USER_SLOTS;

    for b in 0..num_blocks {
      let mut insts = vec![];
      if b == 0 {
        for (i, reg) in env.regs.iter().enumerate() {
          insts.push(i_li(*reg, i as i32 + 1));
        }
        for slot in 0..NUM_USER_SLOTS {
          insts.push(i_sw(PhysReg::Zero.to_reg(), PhysReg::Sp.to_reg(), 4 * slot));
        }
      }
      let num_insts = u.int_in_range(0..=MAX_BLOCK_INSTS)?;
      for _ in 0..num_insts {
        env.insts(&mut insts, u)?;
      }
      let terminator = env.terminator(b, u)?;
      let is_last = b + 1 == num_blocks;
      if let Some(inst) = terminator {
        insts.push(inst);
      }
      if is_last {
        insts.push(i_jr(PhysReg::Ra.to_reg(), true));
      }
      func.block(&format!("b{}", b), insts);
    }

    if func.finish().is_err() {
      return Err(arbitrary::Error::IncorrectFormat);
    }
    regcolor::compute_loop_depths(&mut func);
    Ok(FuzzFunc(func))
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::test_framework::{run_func, RunInput, RunStage};
  use crate::validator::validate;

  #[test]
  fn test_generated_funcs_are_valid() {
    let seeds: Vec<Vec<u8>> = (0..32u8)
      .map(|s| (0..2048u32).map(|i| (i as u8).wrapping_mul(31).wrapping_add(s.wrapping_mul(7))).collect())
      .collect();
    for data in seeds.iter() {
      let mut u = Unstructured::new(data);
      let func = match FuzzFunc::arbitrary(&mut u) {
        Ok(FuzzFunc(func)) => func,
        Err(_) => continue,
      };
      validate(&func).unwrap();
      match run_func(&func, "gen", &RunInput::default(), RunStage::BeforeRegalloc)
      {
        Ok(_) => {}
        Err(e) => assert_eq!(e, "division by zero"),
      }
    }
  }
}
