/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! This is the top level interface for the register allocator.

use log::{info, log_enabled, Level};
use std::fmt;

#[cfg(feature = "enable-serde")]
use serde::{Deserialize, Serialize};

use crate::analysis::run_liveness;
use crate::checker::{check_coloring, CheckerErrors};
use crate::data_structures::{InstIx, Map, PhysReg, RealRegUniverse, VirtualReg};
use crate::func::Func;
use crate::rewrite::{callee_saved_regs, rewrite_func};
use crate::spill::{make_spill_scheme, spill_register, SpillState};
use crate::{irc, naive};

//=============================================================================
// Options

/// Which coloring strategy to run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub enum RegAllocAlgorithm {
  /// Greedy coloring, no coalescing.
  Naive,
  /// Iterated register coalescing.
  Full,
}

/// How references to a spilled register are grouped into batches that share
/// one reload and one store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub enum SpillSchemeChoice {
  /// Runs of consecutive references, at most `limit + 1` long.
  CountInstr { limit: u32 },
  /// Every reference on its own.
  Everywhere,
}

#[derive(Clone, Debug)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct Options {
  pub algorithm: RegAllocAlgorithm,
  pub spill_scheme: SpillSchemeChoice,
  /// Spill clones whose live range is shorter than this are never picked as
  /// potential spills while anything else is available.
  pub short_range_threshold: u32,
  /// A register's spill score is divided by `loop_depth_base ^ weight`.
  pub loop_depth_base: f64,
  /// Verify the final coloring before rewriting.
  pub run_checker: bool,
  /// Give up after this many rounds.  `None` means `4 * V + 16`, where V is
  /// the number of virtual registers in the incoming function.
  pub max_rounds: Option<u32>,
}

impl Default for Options {
  fn default() -> Self {
    Self {
      algorithm: RegAllocAlgorithm::Full,
      spill_scheme: SpillSchemeChoice::CountInstr { limit: 30 },
      short_range_threshold: 7,
      loop_depth_base: 1.4,
      run_checker: false,
      max_rounds: None,
    }
  }
}

//=============================================================================
// Errors

#[derive(Clone, Debug, PartialEq)]
pub enum RegAllocError {
  /// An instruction mentions a virtual register the function does not know
  /// about, or one that has been retired.
  UnknownVirtualReg { reg: VirtualReg, inst: InstIx },
  /// A virtual register reached the rewriter without a color.
  UnassignedVirtualReg { reg: VirtualReg, inst: InstIx },
  /// The register that has to be spilled is itself the product of an
  /// earlier spill, and spilling it again would reproduce the same code.
  NoSpillCandidate { reg: VirtualReg },
  /// The universe is empty but the function has virtual registers.
  EmptyUniverse,
  /// Allocation did not converge within the round limit.
  RetryLimit { rounds: u32 },
  /// The checker rejected the final coloring.
  Checker(CheckerErrors),
}

impl fmt::Display for RegAllocError {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    match self {
      RegAllocError::UnknownVirtualReg { reg, inst } => {
        write!(f, "unknown virtual register {:?} in instruction {:?}", reg, inst)
      }
      RegAllocError::UnassignedVirtualReg { reg, inst } => write!(
        f,
        "virtual register {:?} in instruction {:?} has no register",
        reg, inst
      ),
      RegAllocError::NoSpillCandidate { reg } => {
        write!(f, "{:?} must be spilled but cannot be spilled again", reg)
      }
      RegAllocError::EmptyUniverse => {
        write!(f, "no allocatable registers for a function using virtual ones")
      }
      RegAllocError::RetryLimit { rounds } => {
        write!(f, "allocation did not converge after {} rounds", rounds)
      }
      RegAllocError::Checker(errors) => write!(f, "checker failed: {}", errors),
    }
  }
}

impl std::error::Error for RegAllocError {}

//=============================================================================
// Results

/// What a single coloring round produced.
#[derive(Debug)]
pub enum RoundOutcome {
  /// Every virtual register has a color.
  Colored(Map<VirtualReg, PhysReg>),
  /// These registers could not be colored, in ascending order.
  Spilled(Vec<VirtualReg>),
}

#[derive(Clone, Debug, Default)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct RegAllocStats {
  pub num_rounds: u32,
  pub num_spilled: u32,
  pub num_stack_spills: u32,
  pub num_remat_spills: u32,
  /// Move counts from the final round.
  pub num_coalesced: u32,
  pub num_constrained: u32,
  pub num_frozen: u32,
  pub num_rewritten: u32,
  pub num_moves_removed: u32,
  /// Loads, stores, remats and address computations added by spilling.
  pub num_inserted: u32,
}

#[derive(Clone, Debug)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct RegAllocResult {
  /// Allocatable registers the function now writes, in index order.
  pub callee_saves: Vec<PhysReg>,
  /// Final frame size, in bytes, including spill slots.
  pub frame_size: i32,
  pub stats: RegAllocStats,
}

//=============================================================================
// Top level

fn mentions_virtual_regs(func: &Func) -> bool {
  func.layout().into_iter().any(|iix| {
    let regs = func.inst(iix).get_regs();
    regs.uses.iter().chain(regs.defs.iter()).any(|r| r.is_virtual())
  })
}

/// Allocate registers for `func` in place: on success every virtual register
/// has been replaced by a register from `universe`, spill code has been
/// inserted where needed, coalesced copies are gone, and `func.callee_saves`
/// lists the allocatable registers the function writes.
#[inline(never)]
pub fn allocate_registers(
  func: &mut Func, universe: &RealRegUniverse, opts: &Options,
) -> Result<RegAllocResult, RegAllocError> {
  info!(
    "allocate_registers: begin: {} ({:?}, {} colors)",
    func.name,
    opts.algorithm,
    universe.num_colors()
  );

  if universe.num_colors() == 0 && mentions_virtual_regs(func) {
    return Err(RegAllocError::EmptyUniverse);
  }

  let max_rounds =
    opts.max_rounds.unwrap_or(4 * func.num_virtual_regs() + 16);
  let mut spill_state = SpillState::new();
  let mut stats = RegAllocStats::default();

  let coloring = loop {
    if stats.num_rounds >= max_rounds {
      return Err(RegAllocError::RetryLimit { rounds: stats.num_rounds });
    }
    stats.num_rounds += 1;

    run_liveness(func)?;
    let outcome = match opts.algorithm {
      RegAllocAlgorithm::Naive => naive::alloc_round(func, universe, &spill_state),
      RegAllocAlgorithm::Full => {
        let (outcome, moves) =
          irc::alloc_round(func, universe, &spill_state, opts);
        stats.num_coalesced = moves.coalesced;
        stats.num_constrained = moves.constrained;
        stats.num_frozen = moves.frozen;
        outcome
      }
    };

    match outcome {
      RoundOutcome::Colored(coloring) => break coloring,
      RoundOutcome::Spilled(spilled) => {
        info!(
          "allocate_registers: round {} spills {:?}",
          stats.num_rounds, spilled
        );
        if let Some(reg) = spilled.iter().find(|v| spill_state.is_minimal(**v)) {
          return Err(RegAllocError::NoSpillCandidate { reg: *reg });
        }
        for vreg in spilled {
          let mut scheme = make_spill_scheme(opts.spill_scheme);
          spill_register(func, vreg, scheme.as_mut(), &mut spill_state);
        }
      }
    }
  };

  if opts.run_checker {
    check_coloring(func, universe, &coloring).map_err(RegAllocError::Checker)?;
  }

  let rewrite_stats = rewrite_func(func, &coloring)?;
  func.callee_saves = callee_saved_regs(func, universe);

  stats.num_spilled = spill_state.spilled.len() as u32;
  stats.num_stack_spills = spill_state.num_stack_spills;
  stats.num_remat_spills = spill_state.num_remat_spills;
  stats.num_inserted = spill_state.num_inserted;
  stats.num_rewritten = rewrite_stats.num_rewritten;
  stats.num_moves_removed = rewrite_stats.num_moves_removed;

  if log_enabled!(Level::Info) {
    info!("allocate_registers: end: {:?}", stats);
    info!("allocate_registers: frame {} bytes", func.frame_size);
  }

  Ok(RegAllocResult {
    callee_saves: func.callee_saves.clone(),
    frame_size: func.frame_size,
    stats,
  })
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::data_structures::Reg;
  use crate::mc::*;

  fn ra() -> Reg {
    Reg::new_phys(PhysReg::Ra)
  }

  // v0 = 1; v1 = 2; v2 = 3; v3 = v1 + v2; v4 = v0 + v3
  fn nested_adds() -> Func {
    let mut func = Func::new("nested");
    let v: Vec<Reg> = (0..5).map(|_| func.new_virtual_reg()).collect();
    func.block(
      "entry",
      vec![
        i_li(v[0], 1),
        i_li(v[1], 2),
        i_li(v[2], 3),
        i_addu(v[3], v[1], v[2]),
        i_addu(v[4], v[0], v[3]),
        i_jr(ra(), false),
      ],
    );
    func.finish().unwrap();
    func
  }

  fn count_ops(func: &Func, op: &str) -> usize {
    func
      .layout()
      .into_iter()
      .filter(|iix| format!("{:?}", func.inst(*iix)).starts_with(op))
      .count()
  }

  #[test]
  fn test_nested_adds_two_registers() {
    let mut func = nested_adds();
    let opts = Options { run_checker: true, ..Options::default() };
    let res =
      allocate_registers(&mut func, &RealRegUniverse::restricted(2), &opts)
        .unwrap();
    assert_eq!(res.stats.num_spilled, 1);
    assert_eq!(res.stats.num_stack_spills, 1);
    assert_eq!(res.frame_size, 4);
    assert_eq!(count_ops(&func, "lw "), 1);
    assert_eq!(count_ops(&func, "sw "), 1);
    assert_eq!(res.stats.num_rounds, 2);
  }

  #[test]
  fn test_rounds_bounded_by_vregs() {
    // Every round but the last spills at least one register, so a function
    // with V virtual registers needs at most V + 1 rounds.
    for algorithm in [RegAllocAlgorithm::Full, RegAllocAlgorithm::Naive] {
      let mut func = nested_adds();
      let num_vregs = func.num_virtual_regs();
      let opts = Options { algorithm, run_checker: true, ..Options::default() };
      let res =
        allocate_registers(&mut func, &RealRegUniverse::restricted(2), &opts)
          .unwrap();
      assert!(res.stats.num_spilled >= 1);
      assert!(
        res.stats.num_rounds <= num_vregs + 1,
        "{:?}: {} rounds for {} registers",
        algorithm,
        res.stats.num_rounds,
        num_vregs
      );
    }
  }

  #[test]
  fn test_empty_universe() {
    let mut func = nested_adds();
    let universe = RealRegUniverse { allocable: vec![] };
    assert_eq!(
      allocate_registers(&mut func, &universe, &Options::default())
        .unwrap_err(),
      RegAllocError::EmptyUniverse
    );
  }

  #[test]
  fn test_single_register_gives_up() {
    // With one color, v3 = v1 + v2 needs two registers at once whatever
    // gets spilled.
    let mut func = nested_adds();
    let err =
      allocate_registers(&mut func, &RealRegUniverse::restricted(1), &Options::default())
        .unwrap_err();
    match err {
      RegAllocError::NoSpillCandidate { .. } | RegAllocError::RetryLimit { .. } => {}
      e => panic!("unexpected error {}", e),
    }
  }

  #[test]
  fn test_unknown_register_reported() {
    let mut func = Func::new("bad");
    func.block(
      "entry",
      vec![i_li(Reg::new_virtual(7), 1), i_jr(ra(), false)],
    );
    func.finish().unwrap();
    match allocate_registers(&mut func, &RealRegUniverse::mips(), &Options::default()) {
      Err(RegAllocError::UnknownVirtualReg { reg, .. }) => {
        assert_eq!(reg, VirtualReg::new(7))
      }
      r => panic!("unexpected result {:?}", r),
    }
  }
}
