/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Hand-written test functions, available by name.

use regcolor::Func;

use crate::parser::parse_content;
use crate::test_framework::RunInput;

struct TestCase {
  name: &'static str,
  source: &'static str,
  args: &'static [i32],
  stdin: &'static [i32],
}

const TEST_CASES: &[TestCase] = &[
  TestCase {
    name: "nested_adds",
    source: r#"
block entry:
  li %a, 1
  li %b, 2
  li %c, 3
  addu %d, %b, %c
  addu %e, %a, %d
  move $v0, %e
  jr $ra, $v0
"#,
    args: &[],
    stdin: &[],
  },
  TestCase {
    name: "single_move",
    source: r#"
block entry:
  li %a, 7
  move %b, %a
  addiu %c, %b, 1
  move $v0, %c
  jr $ra, $v0
"#,
    args: &[],
    stdin: &[],
  },
  TestCase {
    name: "precolored",
    source: r#"
block entry:
  li $t0, 5
  li $t1, 6
  addu $t2, $t0, $t1
  move $v0, $t2
  jr $ra, $v0
"#,
    args: &[],
    stdin: &[],
  },
  TestCase {
    name: "sum_loop",
    source: r#"
block entry:
  move %n, $a0
  li %sum, 0
  li %i, 1
block loop:
  slt %done, %n, %i
  bne %done, $zero, exit
block body:
  addu %sum, %sum, %i
  addiu %i, %i, 1
  j loop
block exit:
  move $a0, %sum
  syscall print_int
  move $v0, %sum
  jr $ra, $v0
"#,
    args: &[10],
    stdin: &[],
  },
  TestCase {
    name: "fill_then_sum",
    source: r#"
frame 40
remat %arr stack 0
block entry:
  addiu %arr, $sp, 0
  li %i, 0
  li %p, 0
block fill:
  addu %q, %arr, %p
  sw %i, 0(%q)
  addiu %i, %i, 1
  addiu %p, %p, 4
  slti %t, %i, 10
  bne %t, $zero, fill
block sum_init:
  li %s, 0
  li %j, 0
block sum:
  sll %off, %j, 2
  addu %q2, %arr, %off
  lw %x, 0(%q2)
  mul %x2, %x, %x
  addu %s, %s, %x2
  addiu %j, %j, 1
  slti %t2, %j, 10
  bgtz %t2, sum
block exit:
  move $v0, %s
  jr $ra, $v0
"#,
    args: &[],
    stdin: &[],
  },
  TestCase {
    name: "pressure",
    source: r#"
block entry:
  li %x0, 1
  li %x1, 2
  li %x2, 3
  li %x3, 4
  li %x4, 5
  li %x5, 6
  li %x6, 7
  li %x7, 8
  li %x8, 9
  li %x9, 10
  addu %s, %x0, %x1
  addu %s, %s, %x2
  addu %s, %s, %x3
  addu %s, %s, %x4
  addu %s, %s, %x5
  addu %s, %s, %x6
  addu %s, %s, %x7
  addu %s, %s, %x8
  addu %s, %s, %x9
  move $v0, %s
  jr $ra, $v0
"#,
    args: &[],
    stdin: &[],
  },
  TestCase {
    name: "nested_loops",
    source: r#"
block entry:
  li %total, 0
  li %i, 0
block outer:
  li %j, 0
block inner:
  mul %p, %i, %j
  addu %total, %total, %p
  addiu %j, %j, 1
  slti %c, %j, 4
  bne %c, $zero, inner
block latch:
  addiu %i, %i, 1
  slti %c2, %i, 3
  bne %c2, $zero, outer
block exit:
  move $a0, %total
  syscall print_int
  move $v0, %total
  jr $ra, $v0
"#,
    args: &[],
    stdin: &[],
  },
  TestCase {
    name: "calls",
    source: r#"
block entry:
  li %x, 3
  li %y, 4
  move $a0, %x
  move $a1, %y
  call f, 2
  move %r, $v0
  addu %r, %r, %x
  move $a0, %r
  call g, 1
  addu %z, $v0, %y
  move $v0, %z
  jr $ra, $v0
"#,
    args: &[],
    stdin: &[],
  },
  TestCase {
    name: "globals",
    source: r#"
remat %g global 4096
block entry:
  li %g, 4096
  li %v, 42
  sw %v, 0(%g)
  sw %v, 4(%g)
  lw %w, 4(%g)
  addu %w, %w, %v
  lw %u, 0(%g)
  addu %w, %w, %u
  move $v0, %w
  jr $ra, $v0
"#,
    args: &[],
    stdin: &[],
  },
  TestCase {
    name: "far_frame",
    source: r#"
frame 40000
block entry:
  li %a, 1
  li %b, 2
  li %c, 3
  addu %d, %b, %c
  addu %e, %a, %d
  move $v0, %e
  jr $ra, $v0
"#,
    args: &[],
    stdin: &[],
  },
  TestCase {
    name: "divmod",
    source: r#"
block entry:
  syscall read_int
  move %a, $v0
  syscall read_int
  move %b, $v0
  div %a, %b
  mflo %q
  mfhi %r
  move $a0, %q
  syscall print_int
  li $a0, 32
  syscall print_char
  move $a0, %r
  syscall print_int
  subu %n, $zero, %r
  abs %d, %n
  move $v0, %d
  jr $ra, $v0
"#,
    args: &[],
    stdin: &[17, 5],
  },
  TestCase {
    name: "diamond",
    source: r#"
block entry:
  move %x, $a0
  bgtz %x, pos
block neg:
  subu %y, $zero, %x
  j join
block pos:
  move %y, %x
block join:
  move $v0, %y
  jr $ra, $v0
"#,
    args: &[-5],
    stdin: &[],
  },
];

pub fn func_names() -> Vec<&'static str> {
  TEST_CASES.iter().map(|tc| tc.name).collect()
}

/// The named test function and the input to run it with.  On failure,
/// returns the names that do exist.
pub fn find_func(name: &str) -> Result<(Func, RunInput), Vec<String>> {
  let available = || func_names().iter().map(|s| s.to_string()).collect();
  let tc = match TEST_CASES.iter().find(|tc| tc.name == name) {
    Some(tc) => tc,
    None => return Err(available()),
  };
  match parse_content(tc.name, tc.source) {
    Ok(func) => {
      let input = RunInput { args: tc.args.to_vec(), stdin: tc.stdin.to_vec() };
      Ok((func, input))
    }
    Err(err) => panic!("test case '{}' does not parse: {:?}", name, err),
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::test_framework::{run_func, RunStage};
  use crate::validator::validate;

  #[test]
  fn test_cases_are_well_formed() {
    let expected = [
      ("nested_adds", Some(6)),
      ("single_move", Some(8)),
      ("precolored", Some(11)),
      ("sum_loop", Some(55)),
      ("fill_then_sum", Some(285)),
      ("pressure", Some(55)),
      ("nested_loops", Some(18)),
      ("globals", Some(126)),
      ("far_frame", Some(6)),
      ("divmod", Some(2)),
      ("diamond", Some(5)),
    ];
    for name in func_names() {
      let (func, input) = find_func(name).unwrap();
      if let Err(err) = validate(&func) {
        panic!("test case {} is invalid: {}", name, err);
      }
      let result = run_func(&func, name, &input, RunStage::BeforeRegalloc)
        .unwrap_or_else(|err| panic!("test case {} fails to run: {}", name, err));
      if let Some((_, value)) = expected.iter().find(|(n, _)| *n == name) {
        assert_eq!(result.ret_value, *value, "test case {}", name);
      }
    }
  }
}
