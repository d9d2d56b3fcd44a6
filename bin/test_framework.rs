/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! An interpreter for functions, so that a function can be run before and
//! after allocation and the two runs compared.

use log::{debug, trace};
use rustc_hash::FxHashMap;

use regcolor::data_structures::{BlockIx, InstIx, NUM_PHYS_REGS};
use regcolor::func::InstOrigin;
use regcolor::mc::*;
use regcolor::{Func, PhysReg, RealRegUniverse, Reg};

/// Initial value of `sp`.  Spill slots and stack objects live just above it.
pub const STACK_TOP: i32 = 0x7fff_0000;

/// What `ra` holds on entry; jumping to it returns from the function.
pub const RETURN_ADDR: i32 = 0x0bad_c0de;

const MAX_STEPS: usize = 1_000_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunStage {
  BeforeRegalloc,
  AfterRegalloc,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RunResult {
  pub num_steps: usize,
  pub num_spill_insts: usize,
  /// `v0` at a `jr $ra, $v0`, or nothing for a plain return or an exit.
  pub ret_value: Option<i32>,
  pub stdout: String,
}

/// Arguments in `a0..a3` and the values `read_int`/`read_char` return, in
/// order.
#[derive(Clone, Debug, Default)]
pub struct RunInput {
  pub args: Vec<i32>,
  pub stdin: Vec<i32>,
}

struct IState<'a> {
  func: &'a Func,
  nia: Option<InstIx>, // Program counter ("next instruction address")
  vregs: FxHashMap<u32, i32>,
  pregs: [Option<i32>; NUM_PHYS_REGS],
  hi: Option<i32>,
  lo: Option<i32>,
  mem: FxHashMap<i32, i32>,
  stdin: std::vec::IntoIter<i32>,
  stdout: String,
  n_insns: usize,
  n_spill_insts: usize,
  run_stage: RunStage,
  ret_value: Option<i32>,
}

// Deterministic stand-in for an external function.
fn call_result(callee: &str, args: &[i32]) -> i32 {
  let mut h: i32 = 17;
  for b in callee.bytes() {
    h = h.wrapping_mul(31).wrapping_add(b as i32);
  }
  for a in args {
    h = h.wrapping_mul(31).wrapping_add(*a);
  }
  h
}

const ARG_REGS: [PhysReg; 4] = [PhysReg::A0, PhysReg::A1, PhysReg::A2, PhysReg::A3];

impl<'a> IState<'a> {
  fn new(func: &'a Func, input: &RunInput, run_stage: RunStage) -> Self {
    let mut state = IState {
      func,
      nia: None,
      vregs: FxHashMap::default(),
      pregs: [None; NUM_PHYS_REGS],
      hi: None,
      lo: None,
      mem: FxHashMap::default(),
      stdin: input.stdin.clone().into_iter(),
      stdout: String::new(),
      n_insns: 0,
      n_spill_insts: 0,
      run_stage,
      ret_value: None,
    };
    state.nia = state.block_entry(func.entry_block());
    state.pregs[PhysReg::Zero.get_index()] = Some(0);
    state.pregs[PhysReg::Sp.get_index()] = Some(STACK_TOP);
    state.pregs[PhysReg::Ra.get_index()] = Some(RETURN_ADDR);
    for (preg, value) in ARG_REGS.iter().zip(input.args.iter()) {
      state.pregs[preg.get_index()] = Some(*value);
    }
    state
  }

  fn get_reg(&self, reg: Reg) -> Result<i32, String> {
    match reg.as_phys_reg() {
      Some(preg) => match self.pregs[preg.get_index()] {
        Some(v) => Ok(v),
        None => Err(format!("read of uninit register {}", preg)),
      },
      None => {
        if self.run_stage == RunStage::AfterRegalloc {
          return Err(format!("virtual register {:?} after regalloc", reg));
        }
        match self.vregs.get(&(reg.get_index() as u32)) {
          Some(v) => Ok(*v),
          None => Err(format!("read of uninit register {:?}", reg)),
        }
      }
    }
  }

  fn set_reg(&mut self, reg: Reg, val: i32) -> Result<(), String> {
    match reg.as_phys_reg() {
      Some(PhysReg::Zero) => {}
      Some(preg) => self.pregs[preg.get_index()] = Some(val),
      None => {
        if self.run_stage == RunStage::AfterRegalloc {
          return Err(format!("virtual register {:?} after regalloc", reg));
        }
        self.vregs.insert(reg.get_index() as u32, val);
      }
    }
    Ok(())
  }

  fn get_mem(&self, addr: i32) -> Result<i32, String> {
    if addr & 3 != 0 {
      return Err(format!("unaligned load from {:#x}", addr));
    }
    match self.mem.get(&addr) {
      Some(v) => Ok(*v),
      None => Err(format!("read of uninit memory at {:#x}", addr)),
    }
  }

  fn set_mem(&mut self, addr: i32, val: i32) -> Result<(), String> {
    if addr & 3 != 0 {
      return Err(format!("unaligned store to {:#x}", addr));
    }
    self.mem.insert(addr, val);
    Ok(())
  }

  fn get_byte(&self, addr: i32) -> Result<u8, String> {
    let word = self.get_mem(addr & !3)?;
    Ok((word >> (8 * (addr & 3))) as u8)
  }

  fn read_input(&mut self) -> Result<i32, String> {
    match self.stdin.next() {
      Some(v) => Ok(v),
      None => Err("input exhausted".to_string()),
    }
  }

  fn jump(&mut self, target: &Label) -> Result<(), String> {
    match target.get_block_ix() {
      Some(bix) => {
        self.nia = self.block_entry(bix);
        Ok(())
      }
      None => Err(format!("jump to unresolved label {:?}", target)),
    }
  }

  // First instruction at or after the start of |bix|; empty blocks fall
  // through.
  fn block_entry(&self, bix: BlockIx) -> Option<InstIx> {
    let mut bix = bix;
    loop {
      if let Some(first) = self.func.first_inst(bix) {
        return Some(first);
      }
      if bix.get() + 1 >= self.func.blocks.len() {
        return None;
      }
      bix = bix.plus(1);
    }
  }

  // Next instruction in layout order, crossing into following blocks.
  fn fall_through(&self, iix: InstIx) -> Option<InstIx> {
    if let Some(next) = self.func.next_inst(iix) {
      return Some(next);
    }
    let bix = self.func.inst_block(iix);
    if bix.get() + 1 < self.func.blocks.len() {
      self.block_entry(bix.plus(1))
    } else {
      None
    }
  }

  fn syscall(&mut self, kind: SyscallKind) -> Result<bool, String> {
    let a0 = PhysReg::A0.to_reg();
    let v0 = PhysReg::V0.to_reg();
    match kind {
      SyscallKind::PrintInt => {
        let v = self.get_reg(a0)?;
        self.stdout.push_str(&v.to_string());
      }
      SyscallKind::PrintChar => {
        let v = self.get_reg(a0)?;
        self.stdout.push((v as u8) as char);
      }
      SyscallKind::PrintStr => {
        let mut addr = self.get_reg(a0)?;
        loop {
          let b = self.get_byte(addr)?;
          if b == 0 {
            break;
          }
          self.stdout.push(b as char);
          addr = addr.wrapping_add(1);
        }
      }
      SyscallKind::ReadInt | SyscallKind::ReadChar => {
        let v = self.read_input()?;
        self.set_reg(v0, v)?;
      }
      SyscallKind::Exit => return Ok(true),
    }
    Ok(false)
  }

  // Move the interpreter one step forward.  Returns true when done.
  fn step(&mut self) -> Result<bool, String> {
    let iix = match self.nia {
      Some(iix) => iix,
      None => return Err("fell off the end of the function".to_string()),
    };
    self.nia = self.fall_through(iix);
    self.n_insns += 1;
    match self.func.origin(iix) {
      InstOrigin::SpillLoad { .. } | InstOrigin::SpillStore { .. } => {
        self.n_spill_insts += 1
      }
      _ => {}
    }

    let inst = self.func.inst(iix);
    trace!("step {:?}: {:?}", iix, inst);
    match inst {
      Inst::Lui { dst, imm } => self.set_reg(*dst, imm.wrapping_shl(16))?,
      Inst::AluI { op, dst, src, imm } => {
        let v = op.calc(self.get_reg(*src)?, *imm);
        self.set_reg(*dst, v)?;
      }
      Inst::AluR { op, dst, lhs, rhs } => {
        let v = op.calc(self.get_reg(*lhs)?, self.get_reg(*rhs)?);
        self.set_reg(*dst, v)?;
      }
      Inst::Move { dst, src } => {
        let v = self.get_reg(*src)?;
        self.set_reg(*dst, v)?;
      }
      Inst::Abs { dst, src } => {
        let v = self.get_reg(*src)?.wrapping_abs();
        self.set_reg(*dst, v)?;
      }
      Inst::MulDiv { op, lhs, rhs } => {
        let l = self.get_reg(*lhs)?;
        let r = self.get_reg(*rhs)?;
        match op {
          MulDivOp::Div => {
            if r == 0 {
              return Err("division by zero".to_string());
            }
            self.lo = Some(l.wrapping_div(r));
            self.hi = Some(l.wrapping_rem(r));
          }
          MulDivOp::Mult | MulDivOp::Madd => {
            let mut prod = (l as i64).wrapping_mul(r as i64);
            if *op == MulDivOp::Madd {
              let acc = match (self.hi, self.lo) {
                (Some(hi), Some(lo)) => ((hi as i64) << 32) | (lo as u32 as i64),
                _ => return Err("madd with uninit hi/lo".to_string()),
              };
              prod = prod.wrapping_add(acc);
            }
            self.hi = Some((prod >> 32) as i32);
            self.lo = Some(prod as i32);
          }
        }
      }
      Inst::Mf { op, dst } => {
        let v = match op {
          MfOp::Mfhi => self.hi,
          MfOp::Mflo => self.lo,
        };
        match v {
          Some(v) => self.set_reg(*dst, v)?,
          None => return Err("read of uninit hi/lo".to_string()),
        }
      }
      Inst::Lw { dst, base, offset } => {
        let addr = self.get_reg(*base)?.wrapping_add(*offset);
        let v = self.get_mem(addr)?;
        self.set_reg(*dst, v)?;
      }
      Inst::Sw { src, base, offset } => {
        let addr = self.get_reg(*base)?.wrapping_add(*offset);
        let v = self.get_reg(*src)?;
        self.set_mem(addr, v)?;
      }
      Inst::BranchE { op, lhs, rhs, target } => {
        if op.taken(self.get_reg(*lhs)?, self.get_reg(*rhs)?) {
          self.jump(target)?;
        }
      }
      Inst::BranchZ { op, src, target } => {
        if op.taken(self.get_reg(*src)?) {
          self.jump(target)?;
        }
      }
      Inst::Jump { target } => self.jump(target)?,
      Inst::Jr { target, has_return } => {
        let dest = self.get_reg(*target)?;
        if dest != RETURN_ADDR {
          return Err(format!("indirect jump to {:#x}", dest));
        }
        if *has_return {
          self.ret_value = Some(self.get_reg(PhysReg::V0.to_reg())?);
        }
        return Ok(true);
      }
      Inst::Call { callee, num_args } => {
        let mut args = vec![];
        for preg in ARG_REGS.iter().take(*num_args as usize) {
          args.push(self.get_reg(preg.to_reg())?);
        }
        let v = call_result(callee, &args);
        self.set_reg(PhysReg::V0.to_reg(), v)?;
      }
      Inst::Syscall { kind } => return self.syscall(*kind),
    }
    Ok(false)
  }
}

pub fn run_func(
  func: &Func, who: &str, input: &RunInput, run_stage: RunStage,
) -> Result<RunResult, String> {
  debug!("Running stage '{}': Func: name='{}'", who, func.name);

  let mut istate = IState::new(func, input, run_stage);
  loop {
    if istate.n_insns >= MAX_STEPS {
      return Err(format!("no result after {} steps", MAX_STEPS));
    }
    if istate.step()? {
      break;
    }
  }

  debug!(
    "Running stage '{}': done.  {} insns, {} spill insns",
    who, istate.n_insns, istate.n_spill_insts
  );

  Ok(RunResult {
    num_steps: istate.n_insns,
    num_spill_insts: istate.n_spill_insts,
    ret_value: istate.ret_value,
    stdout: istate.stdout,
  })
}

/// The universe for a given register count: all of them when `num_regs` is
/// zero, otherwise the first `num_regs`.
pub fn make_universe(num_regs: usize) -> RealRegUniverse {
  if num_regs == 0 {
    RealRegUniverse::mips()
  } else {
    RealRegUniverse::restricted(num_regs)
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::parser::parse_content;

  #[test]
  fn test_interpret_loop() {
    let func = parse_content(
      "t",
      r#"
block entry:
  li %i, 5
  li %acc, 1
block loop:
  mul %acc, %acc, %i
  addiu %i, %i, -1
  bgtz %i, loop
block exit:
  move $a0, %acc
  syscall print_int
  move $v0, %acc
  jr $ra, $v0
"#,
    )
    .unwrap();
    let res = run_func(&func, "t", &RunInput::default(), RunStage::BeforeRegalloc)
      .unwrap();
    assert_eq!(res.ret_value, Some(120));
    assert_eq!(res.stdout, "120");
  }

  #[test]
  fn test_interpret_errors() {
    let uninit = parse_content("u", "block b:\n  addu %x, %y, %y\n  jr $ra\n")
      .unwrap();
    assert!(run_func(&uninit, "u", &RunInput::default(), RunStage::BeforeRegalloc)
      .is_err());

    let input = RunInput { args: vec![], stdin: vec![7, 0] };
    let div = parse_content(
      "d",
      "block b:\n  syscall read_int\n  move %a, $v0\n  syscall read_int\n  div %a, $v0\n  jr $ra\n",
    )
    .unwrap();
    assert_eq!(
      run_func(&div, "d", &input, RunStage::BeforeRegalloc).unwrap_err(),
      "division by zero"
    );
  }
}
