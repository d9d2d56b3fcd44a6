/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

use std::path::PathBuf;

use colora::test_framework::{make_universe, run_func, RunInput, RunStage};
use colora::{parser, test_cases, validator};
use regcolor::{
  allocate_registers, Func, Options, RegAllocAlgorithm, RegAllocResult,
  SpillSchemeChoice,
};

use clap;
use log::{error, info};
use pretty_env_logger;
use serde::Serialize;

/// What `-d` writes: the function on both sides of allocation, and the
/// allocator's summary.
#[derive(Serialize)]
struct Dump<'a> {
  before: &'a Func,
  after: &'a Func,
  result: &'a RegAllocResult,
}

fn parse_list(s: Option<&str>) -> Result<Vec<i32>, String> {
  match s {
    None => Ok(vec![]),
    Some(s) => s
      .split(',')
      .map(|v| v.trim().parse::<i32>().map_err(|e| format!("{}: {}", v, e)))
      .collect(),
  }
}

//=============================================================================
// Top level

fn main() {
  pretty_env_logger::init();

  let app = clap::App::new("colora")
    .about("a simple program to allow separate testing of regcolor")
    .arg(
      clap::Arg::new("test")
        .short('t')
        .takes_value(true)
        .required_unless_present("file")
        .conflicts_with("file")
        .help("test case name"),
    )
    .arg(
      clap::Arg::new("file")
        .short('f')
        .takes_value(true)
        .help("file holding a function in textual form"),
    )
    .arg(
      clap::Arg::new("regs")
        .short('n')
        .takes_value(true)
        .help("number of registers available (all of them if 0 or not set)"),
    )
    .arg(
      clap::Arg::new("algorithm")
        .short('a')
        .takes_value(true)
        .possible_values(["naive", "full"])
        .help("algorithm name (full if not set)"),
    )
    .arg(
      clap::Arg::new("spill")
        .short('s')
        .takes_value(true)
        .possible_values(["count", "everywhere"])
        .help("how spilled references are grouped (count if not set)"),
    )
    .arg(
      clap::Arg::new("checker")
        .short('c')
        .help("check the coloring before rewriting"),
    )
    .arg(
      clap::Arg::new("args")
        .long("args")
        .takes_value(true)
        .help("comma separated arguments, when running a file"),
    )
    .arg(
      clap::Arg::new("stdin")
        .long("stdin")
        .takes_value(true)
        .help("comma separated values to read, when running a file"),
    )
    .arg(
      clap::Arg::new("dump")
        .short('d')
        .takes_value(true)
        .help("write the functions and the result, bincode-encoded, here"),
    );
  let matches = app.get_matches();

  let (mut func, input) = if let Some(func_name) = matches.value_of("test") {
    match test_cases::find_func(func_name) {
      Ok(found) => found,
      Err(available_func_names) => {
        error!("can't find Func with name '{}'", func_name);
        println!("available func names are:");
        for name in available_func_names {
          println!("     {}", name);
        }
        return;
      }
    }
  } else {
    let path = PathBuf::from(matches.value_of("file").unwrap_or_default());
    let func = match parser::parse_file(path) {
      Ok(func) => func,
      Err(err) => {
        println!("can't read function: {:?}", err);
        return;
      }
    };
    let input = match (
      parse_list(matches.value_of("args")),
      parse_list(matches.value_of("stdin")),
    ) {
      (Ok(args), Ok(stdin)) => RunInput { args, stdin },
      (Err(err), _) | (_, Err(err)) => {
        println!("invalid input value {}", err);
        return;
      }
    };
    (func, input)
  };

  let num_regs = match matches.value_of("regs").unwrap_or("0").parse::<usize>() {
    Ok(n) => n,
    Err(_) => {
      println!("invalid register count");
      return;
    }
  };

  let algorithm = match matches.value_of("algorithm").unwrap_or("full") {
    "naive" => {
      info!("Using the naive allocator");
      RegAllocAlgorithm::Naive
    }
    "full" => {
      info!("Using iterated register coalescing");
      RegAllocAlgorithm::Full
    }
    // Unreachable because of defined "possible_values".
    _ => unreachable!(),
  };

  let defaults = Options::default();
  let spill_scheme = match matches.value_of("spill") {
    Some("everywhere") => SpillSchemeChoice::Everywhere,
    _ => defaults.spill_scheme,
  };
  let opts = Options {
    algorithm,
    spill_scheme,
    run_checker: matches.is_present("checker"),
    ..defaults
  };

  if let Err(err) = validator::validate(&func) {
    println!("invalid function: {}", err);
    return;
  }

  let universe = make_universe(num_regs);
  info!("universe: {}", universe.show().join(" "));

  println!("{}", func);

  // Just so we can run it later.  Not needed for actual allocation.
  let original_func = func.clone();

  let result = match allocate_registers(&mut func, &universe, &opts) {
    Err(e) => {
      println!("allocation failed: {}", e);
      return;
    }
    Ok(r) => r,
  };

  println!("{}", func);
  println!("{:#?}", result.stats);

  if let Err(err) = validator::validate_allocated(&func, &universe) {
    println!("bad allocation: {}", err);
    return;
  }

  if let Some(path) = matches.value_of("dump") {
    let dump = Dump { before: &original_func, after: &func, result: &result };
    match bincode::serialize(&dump) {
      Ok(bytes) => {
        if let Err(err) = std::fs::write(path, bytes) {
          println!("can't write {}: {}", path, err);
        }
      }
      Err(err) => println!("can't encode dump: {}", err),
    }
  }

  let before_regalloc_result = run_func(
    &original_func,
    "Before allocation",
    &input,
    RunStage::BeforeRegalloc,
  );

  let after_regalloc_result =
    run_func(&func, "After allocation", &input, RunStage::AfterRegalloc);

  println!();

  validator::check_results(&before_regalloc_result, &after_regalloc_result);
}

#[cfg(test)]
mod test_utils {
  use super::*;
  use colora::test_framework::RunResult;

  pub fn opts(algorithm: RegAllocAlgorithm) -> Options {
    Options { algorithm, run_checker: true, ..Options::default() }
  }

  pub fn run(
    func_name: &str, num_regs: usize, opts: &Options,
  ) -> (Func, Result<RegAllocResult, regcolor::RegAllocError>) {
    let _ = pretty_env_logger::try_init();
    let (mut func, _) = test_cases::find_func(func_name).unwrap();
    let universe = make_universe(num_regs);
    let result = allocate_registers(&mut func, &universe, opts);
    (func, result)
  }

  /// Allocates, validates, and runs the named function before and after.
  pub fn check_with(
    func_name: &str, num_regs: usize, opts: &Options,
  ) -> (Func, RegAllocResult, RunResult) {
    let _ = pretty_env_logger::try_init();
    let (mut func, input) = test_cases::find_func(func_name).unwrap();
    let universe = make_universe(num_regs);
    validator::validate(&func).unwrap();
    let before_regalloc_result =
      run_func(&func, "Before allocation", &input, RunStage::BeforeRegalloc);
    let result = allocate_registers(&mut func, &universe, opts)
      .unwrap_or_else(|err| {
        panic!("allocation of {} failed: {}", func_name, err);
      });
    println!("{}", func);
    validator::validate_allocated(&func, &universe).unwrap();
    let after_regalloc_result =
      run_func(&func, "After allocation", &input, RunStage::AfterRegalloc);
    validator::check_results(&before_regalloc_result, &after_regalloc_result);
    (func, result, after_regalloc_result.unwrap())
  }

  pub fn check(func_name: &str, num_regs: usize, algorithm: RegAllocAlgorithm) {
    check_with(func_name, num_regs, &opts(algorithm));
  }

  pub fn count_spill_code(func: &Func) -> (usize, usize) {
    use regcolor::mc::Inst;
    let mut loads = 0;
    let mut stores = 0;
    for iix in func.layout() {
      match func.inst(iix) {
        Inst::Lw { .. } => loads += 1,
        Inst::Sw { .. } => stores += 1,
        _ => {}
      }
    }
    (loads, stores)
  }
}

#[cfg(test)]
use regcolor::PhysReg;

#[test]
fn every_case_both_algorithms() {
  for name in test_cases::func_names() {
    for num_regs in [0, 8, 4] {
      test_utils::check(name, num_regs, RegAllocAlgorithm::Full);
      test_utils::check(name, num_regs, RegAllocAlgorithm::Naive);
    }
  }
}

#[test]
fn every_case_everywhere_scheme() {
  let opts = Options {
    spill_scheme: SpillSchemeChoice::Everywhere,
    ..test_utils::opts(RegAllocAlgorithm::Full)
  };
  for name in test_cases::func_names() {
    test_utils::check_with(name, 4, &opts);
  }
}

#[test]
fn nested_adds_two_regs() {
  let (func, result, run) = test_utils::check_with(
    "nested_adds",
    2,
    &test_utils::opts(RegAllocAlgorithm::Full),
  );
  assert_eq!(result.stats.num_spilled, 1);
  assert_eq!(result.stats.num_stack_spills, 1);
  assert_eq!(result.frame_size, 4);
  assert_eq!(test_utils::count_spill_code(&func), (1, 1));
  assert_eq!(run.ret_value, Some(6));
  assert_eq!(run.num_spill_insts, 2);

  test_utils::check("nested_adds", 2, RegAllocAlgorithm::Naive);
}

#[test]
fn one_reg_is_not_enough() {
  for algorithm in [RegAllocAlgorithm::Full, RegAllocAlgorithm::Naive] {
    let (_, result) =
      test_utils::run("nested_adds", 1, &test_utils::opts(algorithm));
    assert!(result.is_err());
  }
}

#[test]
fn single_move_is_coalesced() {
  let (func, result, run) = test_utils::check_with(
    "single_move",
    3,
    &test_utils::opts(RegAllocAlgorithm::Full),
  );
  assert_eq!(run.ret_value, Some(8));
  assert_eq!(result.stats.num_spilled, 0);
  assert!(result.stats.num_coalesced >= 1);
  assert!(result.stats.num_moves_removed >= 1);
  for iix in func.layout() {
    if let Some((dst, src)) = func.inst(iix).is_move() {
      assert!(dst != src, "identity move left: {:?}", func.inst(iix));
    }
  }
}

#[test]
fn precolored_code_is_untouched() {
  let (before, _) = test_cases::find_func("precolored").unwrap();
  let (after, result, _) = test_utils::check_with(
    "precolored",
    0,
    &test_utils::opts(RegAllocAlgorithm::Full),
  );
  let show = |func: &Func| -> Vec<String> {
    func.layout().into_iter().map(|iix| format!("{:?}", func.inst(iix))).collect()
  };
  assert_eq!(show(&before), show(&after));
  assert_eq!(result.stats.num_rounds, 1);
  assert_eq!(result.callee_saves, vec![PhysReg::T0, PhysReg::T1, PhysReg::T2]);
}

#[test]
fn frame_grows_by_stack_spills() {
  for num_regs in [2, 3] {
    let (func, result, _) = test_utils::check_with(
      "far_frame",
      num_regs,
      &test_utils::opts(RegAllocAlgorithm::Full),
    );
    assert_eq!(
      result.frame_size,
      40000 + 4 * result.stats.num_stack_spills as i32
    );
    assert_eq!(func.frame_size, result.frame_size);
  }
}

#[test]
fn reserved_regs_never_assigned() {
  let universe = make_universe(4);
  for name in test_cases::func_names() {
    let (before, _) = test_cases::find_func(name).unwrap();
    let mentioned = |func: &Func| -> Vec<PhysReg> {
      let mut regs = vec![];
      for iix in func.layout() {
        let uses = func.inst(iix).get_regs();
        for reg in uses.uses.iter().chain(uses.defs.iter()) {
          if let Some(preg) = reg.as_phys_reg() {
            regs.push(preg);
          }
        }
      }
      regs
    };
    let already = mentioned(&before);
    let (after, _, _) = test_utils::check_with(
      name,
      4,
      &test_utils::opts(RegAllocAlgorithm::Full),
    );
    for preg in mentioned(&after) {
      assert!(
        already.contains(&preg) || universe.is_allocatable(preg),
        "{}: reserved register {} assigned",
        name,
        preg
      );
    }
  }
}

#[test]
fn allocated_code_reparses() {
  for name in test_cases::func_names() {
    let (func, _, _) = test_utils::check_with(
      name,
      4,
      &test_utils::opts(RegAllocAlgorithm::Full),
    );
    let text = format!("{}", func);
    let reparsed = parser::parse_content(name, &text).unwrap();
    assert_eq!(text, format!("{}", reparsed));
  }
}

#[test]
fn generated_funcs_differential() {
  use arbitrary::{Arbitrary, Unstructured};
  use colora::fuzzing::FuzzFunc;

  let _ = pretty_env_logger::try_init();
  let universe = make_universe(8);
  for seed in 0..32u8 {
    let data: Vec<u8> = (0..4096u32)
      .map(|i| (i as u8).wrapping_mul(37).wrapping_add(seed.wrapping_mul(11)))
      .collect();
    let mut u = Unstructured::new(&data);
    let func = match FuzzFunc::arbitrary(&mut u) {
      Ok(FuzzFunc(func)) => func,
      Err(_) => continue,
    };
    let input = RunInput::default();
    let expected =
      run_func(&func, "Before allocation", &input, RunStage::BeforeRegalloc);
    for algorithm in [RegAllocAlgorithm::Full, RegAllocAlgorithm::Naive] {
      let mut func = func.clone();
      allocate_registers(&mut func, &universe, &test_utils::opts(algorithm))
        .unwrap_or_else(|err| panic!("allocation failed: {}", err));
      validator::validate_allocated(&func, &universe).unwrap();
      let observed =
        run_func(&func, "After allocation", &input, RunStage::AfterRegalloc);
      validator::check_results(&expected, &observed);
    }
  }
}
