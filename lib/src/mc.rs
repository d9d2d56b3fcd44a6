/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Machine instructions for the MIPS-like target, and the one place that
//! knows which registers each of them reads and writes.

use smallvec::{smallvec, SmallVec};
use std::fmt;

use crate::data_structures::{BlockIx, PhysReg, Reg};

#[cfg(feature = "enable-serde")]
use serde::{Deserialize, Serialize};

//=============================================================================
// Immediates

pub const IMM_MIN: i32 = -32768;
pub const IMM_MAX: i32 = 32767;

/// Does `v` fit in the signed 16-bit immediate field?
pub fn can_encode_imm(v: i32) -> bool {
  IMM_MIN <= v && v <= IMM_MAX
}

/// Low half of `v`, sign-extended, as used by `addiu` and memory offsets.
pub fn imm_lo(v: i32) -> i32 {
  v as i16 as i32
}

/// High half of `v`, chosen so that `(imm_hi(v) << 16) + imm_lo(v) == v`
/// with wrapping arithmetic.
pub fn imm_hi(v: i32) -> i32 {
  v.wrapping_sub(imm_lo(v)) >> 16
}

//=============================================================================
// Labels

#[derive(Clone, PartialEq, Eq)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub enum Label {
  Unresolved { name: String },
  Resolved { name: String, bix: BlockIx },
}

impl Label {
  pub fn new_unresolved(name: &str) -> Label {
    Label::Unresolved { name: name.to_string() }
  }

  pub fn name(&self) -> &str {
    match self {
      Label::Unresolved { name } | Label::Resolved { name, .. } => name,
    }
  }

  pub fn get_block_ix(&self) -> Option<BlockIx> {
    match self {
      Label::Resolved { bix, .. } => Some(*bix),
      Label::Unresolved { .. } => None,
    }
  }
}

impl fmt::Debug for Label {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    write!(fmt, "{}", self.name())
  }
}

//=============================================================================
// Opcodes

macro_rules! opcode_enum {
  ($Name:ident { $($Variant:ident => $text:literal),* $(,)? }) => {
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
    #[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
    pub enum $Name {
      $($Variant),*
    }
    impl $Name {
      pub const ALL: &'static [$Name] = &[$($Name::$Variant),*];
      pub fn mnemonic(self) -> &'static str {
        match self {
          $($Name::$Variant => $text),*
        }
      }
      pub fn from_mnemonic(s: &str) -> Option<$Name> {
        match s {
          $($text => Some($Name::$Variant),)*
          _ => None,
        }
      }
    }
  };
}

opcode_enum!(AluIOp {
  Addiu => "addiu",
  Sll => "sll",
  Sra => "sra",
  Srl => "srl",
  Slti => "slti",
  Sltiu => "sltiu",
  Xori => "xori",
  Andi => "andi",
  Ori => "ori",
});

opcode_enum!(AluROp {
  Addu => "addu",
  Subu => "subu",
  Slt => "slt",
  Sltu => "sltu",
  Mul => "mul",
  Xor => "xor",
  And => "and",
  Or => "or",
});

opcode_enum!(MulDivOp {
  Div => "div",
  Mult => "mult",
  Madd => "madd",
});

opcode_enum!(MfOp {
  Mfhi => "mfhi",
  Mflo => "mflo",
});

opcode_enum!(BranchEOp {
  Beq => "beq",
  Bne => "bne",
});

opcode_enum!(BranchZOp {
  Bgez => "bgez",
  Bgtz => "bgtz",
  Blez => "blez",
  Bltz => "bltz",
});

opcode_enum!(SyscallKind {
  PrintInt => "print_int",
  PrintStr => "print_str",
  PrintChar => "print_char",
  ReadInt => "read_int",
  ReadChar => "read_char",
  Exit => "exit",
});

impl AluIOp {
  pub fn calc(self, lhs: i32, imm: i32) -> i32 {
    match self {
      AluIOp::Addiu => lhs.wrapping_add(imm),
      AluIOp::Sll => ((lhs as u32) << (imm as u32 & 31)) as i32,
      AluIOp::Sra => lhs >> (imm as u32 & 31),
      AluIOp::Srl => ((lhs as u32) >> (imm as u32 & 31)) as i32,
      AluIOp::Slti => (lhs < imm) as i32,
      AluIOp::Sltiu => ((lhs as u32) < (imm as u32)) as i32,
      // The logical immediates are zero-extended.
      AluIOp::Xori => lhs ^ (imm & 0xFFFF),
      AluIOp::Andi => lhs & (imm & 0xFFFF),
      AluIOp::Ori => lhs | (imm & 0xFFFF),
    }
  }
}

impl AluROp {
  pub fn calc(self, lhs: i32, rhs: i32) -> i32 {
    match self {
      AluROp::Addu => lhs.wrapping_add(rhs),
      AluROp::Subu => lhs.wrapping_sub(rhs),
      AluROp::Slt => (lhs < rhs) as i32,
      AluROp::Sltu => ((lhs as u32) < (rhs as u32)) as i32,
      AluROp::Mul => lhs.wrapping_mul(rhs),
      AluROp::Xor => lhs ^ rhs,
      AluROp::And => lhs & rhs,
      AluROp::Or => lhs | rhs,
    }
  }
}

impl BranchEOp {
  pub fn taken(self, lhs: i32, rhs: i32) -> bool {
    match self {
      BranchEOp::Beq => lhs == rhs,
      BranchEOp::Bne => lhs != rhs,
    }
  }
}

impl BranchZOp {
  pub fn taken(self, v: i32) -> bool {
    match self {
      BranchZOp::Bgez => v >= 0,
      BranchZOp::Bgtz => v > 0,
      BranchZOp::Blez => v <= 0,
      BranchZOp::Bltz => v < 0,
    }
  }
}

impl SyscallKind {
  pub fn is_read(self) -> bool {
    match self {
      SyscallKind::ReadInt | SyscallKind::ReadChar => true,
      _ => false,
    }
  }
}

//=============================================================================
// Instructions.  Destinations are on the left.

#[derive(Clone, PartialEq)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub enum Inst {
  Lui { dst: Reg, imm: i32 },
  AluI { op: AluIOp, dst: Reg, src: Reg, imm: i32 },
  AluR { op: AluROp, dst: Reg, lhs: Reg, rhs: Reg },
  Move { dst: Reg, src: Reg },
  Abs { dst: Reg, src: Reg },
  MulDiv { op: MulDivOp, lhs: Reg, rhs: Reg },
  Mf { op: MfOp, dst: Reg },
  Lw { dst: Reg, base: Reg, offset: i32 },
  Sw { src: Reg, base: Reg, offset: i32 },
  BranchE { op: BranchEOp, lhs: Reg, rhs: Reg, target: Label },
  BranchZ { op: BranchZOp, src: Reg, target: Label },
  Jump { target: Label },
  Jr { target: Reg, has_return: bool },
  Call { callee: String, num_args: u32 },
  Syscall { kind: SyscallKind },
}

/// Registers an instruction reads and writes, in operand order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct InstRegUses {
  pub uses: SmallVec<[Reg; 4]>,
  pub defs: SmallVec<[Reg; 2]>,
}

impl InstRegUses {
  pub fn mentions(&self, reg: Reg) -> bool {
    self.uses.contains(&reg) || self.defs.contains(&reg)
  }
}

fn phys(preg: PhysReg) -> Reg {
  Reg::new_phys(preg)
}

impl Inst {
  pub fn get_regs(&self) -> InstRegUses {
    let (uses, defs): (SmallVec<[Reg; 4]>, SmallVec<[Reg; 2]>) = match self {
      Inst::Lui { dst, .. } => (smallvec![], smallvec![*dst]),
      Inst::AluI { dst, src, .. } => (smallvec![*src], smallvec![*dst]),
      Inst::AluR { dst, lhs, rhs, .. } => {
        (smallvec![*lhs, *rhs], smallvec![*dst])
      }
      Inst::Move { dst, src } | Inst::Abs { dst, src } => {
        (smallvec![*src], smallvec![*dst])
      }
      Inst::MulDiv { lhs, rhs, .. } => (smallvec![*lhs, *rhs], smallvec![]),
      Inst::Mf { dst, .. } => (smallvec![], smallvec![*dst]),
      Inst::Lw { dst, base, .. } => (smallvec![*base], smallvec![*dst]),
      Inst::Sw { src, base, .. } => (smallvec![*src, *base], smallvec![]),
      Inst::BranchE { lhs, rhs, .. } => (smallvec![*lhs, *rhs], smallvec![]),
      Inst::BranchZ { src, .. } => (smallvec![*src], smallvec![]),
      Inst::Jump { .. } => (smallvec![], smallvec![]),
      Inst::Jr { target, has_return } => {
        if *has_return {
          (smallvec![*target, phys(PhysReg::V0)], smallvec![])
        } else {
          (smallvec![*target], smallvec![])
        }
      }
      Inst::Call { .. } => (smallvec![], smallvec![phys(PhysReg::V0)]),
      Inst::Syscall { kind } => {
        if kind.is_read() {
          (smallvec![phys(PhysReg::V0)], smallvec![phys(PhysReg::V0)])
        } else {
          (smallvec![phys(PhysReg::A0), phys(PhysReg::V0)], smallvec![])
        }
      }
    };
    InstRegUses { uses, defs }
  }

  /// Rewrite every explicit register operand through `f`.  Implicit operands
  /// (the v0/a0 of calls and syscalls) are physical and stay as they are.
  pub fn map_regs<F: FnMut(Reg) -> Reg>(&mut self, mut f: F) {
    match self {
      Inst::Lui { dst, .. } | Inst::Mf { dst, .. } => *dst = f(*dst),
      Inst::AluI { dst, src, .. }
      | Inst::Move { dst, src }
      | Inst::Abs { dst, src } => {
        *src = f(*src);
        *dst = f(*dst);
      }
      Inst::AluR { dst, lhs, rhs, .. } => {
        *lhs = f(*lhs);
        *rhs = f(*rhs);
        *dst = f(*dst);
      }
      Inst::MulDiv { lhs, rhs, .. } | Inst::BranchE { lhs, rhs, .. } => {
        *lhs = f(*lhs);
        *rhs = f(*rhs);
      }
      Inst::Lw { dst, base, .. } => {
        *base = f(*base);
        *dst = f(*dst);
      }
      Inst::Sw { src, base, .. } => {
        *src = f(*src);
        *base = f(*base);
      }
      Inst::BranchZ { src, .. } => *src = f(*src),
      Inst::Jr { target, .. } => *target = f(*target),
      Inst::Jump { .. } | Inst::Call { .. } | Inst::Syscall { .. } => {}
    }
  }

  /// `Some((dst, src))` if this is a register-to-register move.
  pub fn is_move(&self) -> Option<(Reg, Reg)> {
    match self {
      Inst::Move { dst, src } => Some((*dst, *src)),
      _ => None,
    }
  }

  /// Instructions that must survive no matter what happens to the values
  /// they compute.
  pub fn is_hard_boundary(&self) -> bool {
    match self {
      Inst::Call { .. }
      | Inst::Syscall { .. }
      | Inst::BranchE { .. }
      | Inst::BranchZ { .. }
      | Inst::Jump { .. }
      | Inst::Jr { .. }
      | Inst::Sw { .. }
      | Inst::MulDiv { .. }
      | Inst::AluR { op: AluROp::Mul, .. } => true,
      _ => self.get_regs().defs.contains(&phys(PhysReg::Sp)),
    }
  }

  pub fn is_control_flow(&self) -> bool {
    match self {
      Inst::BranchE { .. }
      | Inst::BranchZ { .. }
      | Inst::Jump { .. }
      | Inst::Jr { .. } => true,
      _ => false,
    }
  }

  /// Can control reach the textually following instruction?
  pub fn falls_through(&self) -> bool {
    match self {
      Inst::Jump { .. } | Inst::Jr { .. } => false,
      Inst::Syscall { kind: SyscallKind::Exit } => false,
      _ => true,
    }
  }

  pub fn get_target(&self) -> Option<&Label> {
    match self {
      Inst::BranchE { target, .. }
      | Inst::BranchZ { target, .. }
      | Inst::Jump { target } => Some(target),
      _ => None,
    }
  }

  pub fn get_target_mut(&mut self) -> Option<&mut Label> {
    match self {
      Inst::BranchE { target, .. }
      | Inst::BranchZ { target, .. }
      | Inst::Jump { target } => Some(target),
      _ => None,
    }
  }

  /// Render with a caller-supplied register printer, so that functions can
  /// show virtual registers by their debug labels.
  pub fn show_with<F: Fn(Reg) -> String>(&self, r: F) -> String {
    match self {
      Inst::Lui { dst, imm } => format!("lui {}, {}", r(*dst), imm),
      Inst::AluI { op, dst, src, imm } => {
        format!("{} {}, {}, {}", op.mnemonic(), r(*dst), r(*src), imm)
      }
      Inst::AluR { op, dst, lhs, rhs } => {
        format!("{} {}, {}, {}", op.mnemonic(), r(*dst), r(*lhs), r(*rhs))
      }
      Inst::Move { dst, src } => format!("move {}, {}", r(*dst), r(*src)),
      Inst::Abs { dst, src } => format!("abs {}, {}", r(*dst), r(*src)),
      Inst::MulDiv { op, lhs, rhs } => {
        format!("{} {}, {}", op.mnemonic(), r(*lhs), r(*rhs))
      }
      Inst::Mf { op, dst } => format!("{} {}", op.mnemonic(), r(*dst)),
      Inst::Lw { dst, base, offset } => {
        format!("lw {}, {}({})", r(*dst), offset, r(*base))
      }
      Inst::Sw { src, base, offset } => {
        format!("sw {}, {}({})", r(*src), offset, r(*base))
      }
      Inst::BranchE { op, lhs, rhs, target } => format!(
        "{} {}, {}, {}",
        op.mnemonic(),
        r(*lhs),
        r(*rhs),
        target.name()
      ),
      Inst::BranchZ { op, src, target } => {
        format!("{} {}, {}", op.mnemonic(), r(*src), target.name())
      }
      Inst::Jump { target } => format!("j {}", target.name()),
      Inst::Jr { target, has_return } => {
        if *has_return {
          format!("jr {}, {}", r(*target), phys(PhysReg::V0))
        } else {
          format!("jr {}", r(*target))
        }
      }
      Inst::Call { callee, num_args } => format!("call {}, {}", callee, num_args),
      Inst::Syscall { kind } => format!("syscall {}", kind.mnemonic()),
    }
  }
}

impl fmt::Debug for Inst {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    write!(fmt, "{}", self.show_with(|r| format!("{:?}", r)))
  }
}

//=============================================================================
// Constructors, for clients building functions by hand.

pub fn i_lui(dst: Reg, imm: i32) -> Inst {
  Inst::Lui { dst, imm }
}
pub fn i_alui(op: AluIOp, dst: Reg, src: Reg, imm: i32) -> Inst {
  Inst::AluI { op, dst, src, imm }
}
pub fn i_addiu(dst: Reg, src: Reg, imm: i32) -> Inst {
  Inst::AluI { op: AluIOp::Addiu, dst, src, imm }
}
/// `addiu dst, $zero, imm`
pub fn i_li(dst: Reg, imm: i32) -> Inst {
  i_addiu(dst, phys(PhysReg::Zero), imm)
}
pub fn i_alur(op: AluROp, dst: Reg, lhs: Reg, rhs: Reg) -> Inst {
  Inst::AluR { op, dst, lhs, rhs }
}
pub fn i_addu(dst: Reg, lhs: Reg, rhs: Reg) -> Inst {
  i_alur(AluROp::Addu, dst, lhs, rhs)
}
pub fn i_subu(dst: Reg, lhs: Reg, rhs: Reg) -> Inst {
  i_alur(AluROp::Subu, dst, lhs, rhs)
}
pub fn i_slt(dst: Reg, lhs: Reg, rhs: Reg) -> Inst {
  i_alur(AluROp::Slt, dst, lhs, rhs)
}
pub fn i_mul(dst: Reg, lhs: Reg, rhs: Reg) -> Inst {
  i_alur(AluROp::Mul, dst, lhs, rhs)
}
pub fn i_move(dst: Reg, src: Reg) -> Inst {
  Inst::Move { dst, src }
}
pub fn i_abs(dst: Reg, src: Reg) -> Inst {
  Inst::Abs { dst, src }
}
pub fn i_muldiv(op: MulDivOp, lhs: Reg, rhs: Reg) -> Inst {
  Inst::MulDiv { op, lhs, rhs }
}
pub fn i_mf(op: MfOp, dst: Reg) -> Inst {
  Inst::Mf { op, dst }
}
pub fn i_lw(dst: Reg, base: Reg, offset: i32) -> Inst {
  Inst::Lw { dst, base, offset }
}
pub fn i_sw(src: Reg, base: Reg, offset: i32) -> Inst {
  Inst::Sw { src, base, offset }
}
pub fn i_branch_e(op: BranchEOp, lhs: Reg, rhs: Reg, target: &str) -> Inst {
  Inst::BranchE { op, lhs, rhs, target: Label::new_unresolved(target) }
}
pub fn i_branch_z(op: BranchZOp, src: Reg, target: &str) -> Inst {
  Inst::BranchZ { op, src, target: Label::new_unresolved(target) }
}
pub fn i_j(target: &str) -> Inst {
  Inst::Jump { target: Label::new_unresolved(target) }
}
pub fn i_jr(target: Reg, has_return: bool) -> Inst {
  Inst::Jr { target, has_return }
}
pub fn i_call(callee: &str, num_args: u32) -> Inst {
  Inst::Call { callee: callee.to_string(), num_args }
}
pub fn i_syscall(kind: SyscallKind) -> Inst {
  Inst::Syscall { kind }
}

#[test]
fn test_imm_split() {
  for v in [0, 1, -1, 32767, 32768, -32768, -32769, 65535, 70000, -70000]
    .iter()
    .cloned()
    .chain(vec![i32::MAX, i32::MIN])
  {
    let lo = imm_lo(v);
    let hi = imm_hi(v);
    assert!(can_encode_imm(lo));
    assert_eq!((hi << 16).wrapping_add(lo), v, "split of {}", v);
  }
  assert!(can_encode_imm(-32768));
  assert!(!can_encode_imm(32768));
  assert_eq!(imm_lo(40000), 40000 - 65536);
  assert_eq!(imm_hi(40000), 1);
}

#[test]
fn test_operand_effects() {
  let v0 = Reg::new_virtual(0);
  let v1 = Reg::new_virtual(1);
  let sp = phys(PhysReg::Sp);

  let sw = i_sw(v0, sp, 4);
  assert_eq!(sw.get_regs().uses.as_slice(), &[v0, sp]);
  assert!(sw.get_regs().defs.is_empty());
  assert!(sw.is_hard_boundary());

  let call = i_call("f", 2);
  assert_eq!(call.get_regs().defs.as_slice(), &[phys(PhysReg::V0)]);
  assert!(call.get_regs().uses.is_empty());

  let ret = i_jr(phys(PhysReg::Ra), true);
  assert_eq!(ret.get_regs().uses.as_slice(), &[phys(PhysReg::Ra), phys(PhysReg::V0)]);
  assert!(!ret.falls_through());

  let print = i_syscall(SyscallKind::PrintInt);
  assert_eq!(
    print.get_regs().uses.as_slice(),
    &[phys(PhysReg::A0), phys(PhysReg::V0)]
  );
  let read = i_syscall(SyscallKind::ReadInt);
  assert_eq!(read.get_regs().uses.as_slice(), &[phys(PhysReg::V0)]);

  let mv = i_move(v1, v0);
  assert_eq!(mv.is_move(), Some((v1, v0)));
  assert!(!mv.is_hard_boundary());

  // Multiplies and divides stay, in either form.
  assert!(i_mul(v1, v0, v0).is_hard_boundary());
  assert!(i_muldiv(MulDivOp::Div, v0, v1).is_hard_boundary());
  assert!(!i_addu(v1, v0, v0).is_hard_boundary());

  // Anything writing the stack pointer is pinned.
  assert!(i_addiu(sp, sp, -8).is_hard_boundary());
  assert!(!i_addiu(v1, sp, 8).is_hard_boundary());
}

#[test]
fn test_map_regs() {
  let v0 = Reg::new_virtual(0);
  let v1 = Reg::new_virtual(1);
  let mut inst = i_addu(v1, v0, v0);
  inst.map_regs(|r| if r == v0 { phys(PhysReg::T0) } else { phys(PhysReg::T1) });
  assert_eq!(format!("{:?}", inst), "addu $t1, $t0, $t0");

  let mut lw = i_lw(v0, phys(PhysReg::Sp), 12);
  lw.map_regs(|r| if r.is_virtual() { phys(PhysReg::S2) } else { r });
  assert_eq!(format!("{:?}", lw), "lw $s2, 12($sp)");
}
