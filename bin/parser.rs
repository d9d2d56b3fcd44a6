/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Reads functions in the textual form `Func` prints:
//!
//!   func NAME
//!   frame N
//!   remat %x global|stack N
//!   saves $t0 $s1 ...
//!   block NAME [depth N]:
//!     addiu %x, $zero, 1
//!     ...
//!
//! `#` starts a comment.  `$name` is a physical register and `%name` a
//! virtual one, created on first mention.  `li d, imm` is accepted as
//! shorthand for `addiu d, $zero, imm`.  When no block states its depth,
//! loop depths are computed from the control flow.

use std::fs::File;
use std::io;
use std::io::prelude::*;
use std::path::PathBuf;

use rustc_hash::FxHashMap;

use regcolor::mc::*;
use regcolor::{compute_loop_depths, Func, PhysReg, Reg, RematLoc};

#[derive(Debug)]
pub enum ParseError {
  IoError(io::Error),
  Parse(String),
}

impl From<io::Error> for ParseError {
  fn from(err: io::Error) -> ParseError {
    ParseError::IoError(err)
  }
}

pub type ParseResult<T> = Result<T, ParseError>;

pub fn parse_file(path: PathBuf) -> ParseResult<Func> {
  let basename = match path.file_stem().and_then(|s| s.to_str()) {
    Some(name) => name.to_string(),
    None => return Err(ParseError::Parse("bad file name".into())),
  };
  let mut file = File::open(path)?;
  let mut content = String::new();
  file.read_to_string(&mut content)?;
  parse_content(&basename, &content)
}

struct Parser<'f> {
  func: &'f mut Func,
  vars: FxHashMap<String, Reg>,
  line: usize,
  // Instructions of the block being read.
  current: Option<(String, Option<u32>, Vec<Inst>)>,
  saw_depth: bool,
}

impl<'f> Parser<'f> {
  fn new(func: &'f mut Func) -> Self {
    Self {
      func,
      vars: FxHashMap::default(),
      line: 0,
      current: None,
      saw_depth: false,
    }
  }

  fn error<T>(&self, msg: &str) -> ParseResult<T> {
    Err(ParseError::Parse(format!("error at line {}: {}", self.line, msg)))
  }

  // Environment.
  fn reg(&mut self, text: &str) -> ParseResult<Reg> {
    if let Some(name) = text.strip_prefix('$') {
      match PhysReg::from_name(name) {
        Some(preg) => Ok(preg.to_reg()),
        None => self.error(&format!("unknown physical register '{}'", text)),
      }
    } else if let Some(name) = text.strip_prefix('%') {
      if name.is_empty() || !name.chars().all(is_alpha_numeric) {
        return self.error(&format!("bad virtual register name '{}'", text));
      }
      if let Some(reg) = self.vars.get(name) {
        return Ok(*reg);
      }
      let reg = self.func.new_virtual_reg_labeled(name);
      self.vars.insert(name.to_string(), reg);
      Ok(reg)
    } else {
      self.error(&format!("expected a register, got '{}'", text))
    }
  }

  fn imm(&self, text: &str) -> ParseResult<i32> {
    match text.parse::<i32>() {
      Ok(v) => Ok(v),
      Err(_) => self.error(&format!("expected an integer, got '{}'", text)),
    }
  }

  fn label(&self, text: &str) -> ParseResult<String> {
    if !text.is_empty() && text.chars().all(is_alpha_numeric) {
      Ok(text.to_string())
    } else {
      self.error(&format!("bad label '{}'", text))
    }
  }

  // `off(base)`
  fn mem(&mut self, text: &str) -> ParseResult<(i32, Reg)> {
    let open = text.find('(');
    if let (Some(open), true) = (open, text.ends_with(')')) {
      let offset = self.imm(&text[..open])?;
      let base = self.reg(&text[open + 1..text.len() - 1])?;
      Ok((offset, base))
    } else {
      self.error(&format!("expected 'offset(base)', got '{}'", text))
    }
  }

  fn expect_args(&self, args: &[&str], n: usize, what: &str) -> ParseResult<()> {
    if args.len() == n {
      Ok(())
    } else {
      self.error(&format!("'{}' takes {} operand(s), got {}", what, n, args.len()))
    }
  }

  fn flush_block(&mut self) {
    if let Some((name, depth, insts)) = self.current.take() {
      let bix = self.func.block(&name, insts);
      if let Some(depth) = depth {
        self.func.blocks[bix].loop_depth = depth;
      }
    }
  }

  // Lines.
  fn parse_line(&mut self, line: &str) -> ParseResult<()> {
    let line = match line.find('#') {
      Some(pos) => &line[..pos],
      None => line,
    }
    .trim();
    if line.is_empty() {
      return Ok(());
    }

    let (head, rest) = match line.find(char::is_whitespace) {
      Some(pos) => (&line[..pos], line[pos..].trim()),
      None => (line, ""),
    };

    match head {
      "func" => {
        self.func.name = self.label(rest)?;
        Ok(())
      }
      "frame" => {
        self.func.frame_size = self.imm(rest)?;
        Ok(())
      }
      "remat" => self.parse_remat(rest),
      "saves" => self.parse_saves(rest),
      "block" => self.parse_block_header(rest),
      _ => {
        if self.current.is_none() {
          return self.error("instruction outside of a block");
        }
        let inst = self.parse_inst(head, rest)?;
        if let Some((_, _, insts)) = self.current.as_mut() {
          insts.push(inst);
        }
        Ok(())
      }
    }
  }

  fn parse_remat(&mut self, rest: &str) -> ParseResult<()> {
    let words: Vec<&str> = rest.split_whitespace().collect();
    if words.len() != 3 {
      return self.error("expected 'remat %reg global|stack N'");
    }
    let reg = self.reg(words[0])?;
    let vreg = match reg.as_virtual_reg() {
      Some(vreg) => vreg,
      None => return self.error("only virtual registers can be rematerialised"),
    };
    let value = self.imm(words[2])?;
    let loc = match words[1] {
      "global" => RematLoc::GlobalAddr(value),
      "stack" => RematLoc::StackOffset(value),
      other => return self.error(&format!("unknown remat kind '{}'", other)),
    };
    self.func.remat.insert(vreg, loc);
    Ok(())
  }

  fn parse_saves(&mut self, rest: &str) -> ParseResult<()> {
    for word in rest.split_whitespace() {
      let preg = match self.reg(word)?.as_phys_reg() {
        Some(preg) => preg,
        None => return self.error("only physical registers can be saved"),
      };
      if !self.func.callee_saves.contains(&preg) {
        self.func.callee_saves.push(preg);
      }
    }
    Ok(())
  }

  fn parse_block_header(&mut self, rest: &str) -> ParseResult<()> {
    let rest = match rest.strip_suffix(':') {
      Some(r) => r.trim(),
      None => return self.error("block header must end with ':'"),
    };
    let words: Vec<&str> = rest.split_whitespace().collect();
    let (name, depth) = match words.as_slice() {
      [name] => (self.label(name)?, None),
      [name, "depth", d] => {
        let d = self.imm(d)?;
        if d < 0 {
          return self.error("negative loop depth");
        }
        (self.label(name)?, Some(d as u32))
      }
      _ => return self.error("expected 'block NAME [depth N]:'"),
    };
    self.flush_block();
    self.saw_depth |= depth.is_some();
    self.current = Some((name, depth, vec![]));
    Ok(())
  }

  fn parse_inst(&mut self, op: &str, rest: &str) -> ParseResult<Inst> {
    let args: Vec<&str> = if rest.is_empty() {
      vec![]
    } else {
      rest.split(',').map(|s| s.trim()).collect()
    };

    if let Some(aluop) = AluIOp::from_mnemonic(op) {
      self.expect_args(&args, 3, op)?;
      let dst = self.reg(args[0])?;
      let src = self.reg(args[1])?;
      let imm = self.imm(args[2])?;
      return Ok(i_alui(aluop, dst, src, imm));
    }
    if let Some(aluop) = AluROp::from_mnemonic(op) {
      self.expect_args(&args, 3, op)?;
      let dst = self.reg(args[0])?;
      let lhs = self.reg(args[1])?;
      let rhs = self.reg(args[2])?;
      return Ok(i_alur(aluop, dst, lhs, rhs));
    }
    if let Some(mdop) = MulDivOp::from_mnemonic(op) {
      self.expect_args(&args, 2, op)?;
      let lhs = self.reg(args[0])?;
      let rhs = self.reg(args[1])?;
      return Ok(i_muldiv(mdop, lhs, rhs));
    }
    if let Some(mfop) = MfOp::from_mnemonic(op) {
      self.expect_args(&args, 1, op)?;
      let dst = self.reg(args[0])?;
      return Ok(i_mf(mfop, dst));
    }
    if let Some(bop) = BranchEOp::from_mnemonic(op) {
      self.expect_args(&args, 3, op)?;
      let lhs = self.reg(args[0])?;
      let rhs = self.reg(args[1])?;
      let target = self.label(args[2])?;
      return Ok(i_branch_e(bop, lhs, rhs, &target));
    }
    if let Some(bop) = BranchZOp::from_mnemonic(op) {
      self.expect_args(&args, 2, op)?;
      let src = self.reg(args[0])?;
      let target = self.label(args[1])?;
      return Ok(i_branch_z(bop, src, &target));
    }

    match op {
      "li" => {
        self.expect_args(&args, 2, op)?;
        let dst = self.reg(args[0])?;
        let imm = self.imm(args[1])?;
        Ok(i_li(dst, imm))
      }
      "lui" => {
        self.expect_args(&args, 2, op)?;
        let dst = self.reg(args[0])?;
        let imm = self.imm(args[1])?;
        Ok(i_lui(dst, imm))
      }
      "move" | "abs" => {
        self.expect_args(&args, 2, op)?;
        let dst = self.reg(args[0])?;
        let src = self.reg(args[1])?;
        Ok(if op == "move" { i_move(dst, src) } else { i_abs(dst, src) })
      }
      "lw" | "sw" => {
        self.expect_args(&args, 2, op)?;
        let reg = self.reg(args[0])?;
        let (offset, base) = self.mem(args[1])?;
        Ok(if op == "lw" {
          i_lw(reg, base, offset)
        } else {
          i_sw(reg, base, offset)
        })
      }
      "j" => {
        self.expect_args(&args, 1, op)?;
        let target = self.label(args[0])?;
        Ok(i_j(&target))
      }
      "jr" => {
        if args.len() == 2 && args[1] == "$v0" {
          let target = self.reg(args[0])?;
          Ok(i_jr(target, true))
        } else {
          self.expect_args(&args, 1, op)?;
          let target = self.reg(args[0])?;
          Ok(i_jr(target, false))
        }
      }
      "call" => {
        self.expect_args(&args, 2, op)?;
        let callee = self.label(args[0])?;
        let n = self.imm(args[1])?;
        if n < 0 || n > 4 {
          return self.error("calls take between 0 and 4 arguments");
        }
        Ok(i_call(&callee, n as u32))
      }
      "syscall" => {
        self.expect_args(&args, 1, op)?;
        match SyscallKind::from_mnemonic(args[0]) {
          Some(kind) => Ok(i_syscall(kind)),
          None => self.error(&format!("unknown syscall '{}'", args[0])),
        }
      }
      _ => self.error(&format!("unknown instruction '{}'", op)),
    }
  }
}

fn is_alpha_numeric(c: char) -> bool {
  c.is_ascii_alphanumeric() || c == '_'
}

pub fn parse_content(func_name: &str, content: &str) -> ParseResult<Func> {
  let mut func = Func::new(func_name);
  let saw_depth = {
    let mut parser = Parser::new(&mut func);
    for line in content.lines() {
      parser.line += 1;
      parser.parse_line(line)?;
    }
    parser.flush_block();
    parser.saw_depth
  };

  if func.blocks.is_empty() {
    return Err(ParseError::Parse("function has no blocks".into()));
  }
  func.finish().map_err(ParseError::Parse)?;
  if !saw_depth {
    compute_loop_depths(&mut func);
  }
  Ok(func)
}

#[cfg(test)]
mod test {
  use super::*;

  const SOURCE: &str = r#"
func demo
frame 8
remat %buf stack 0
block entry:
  li %n, 10          # counter
  addiu %buf, $sp, 0
  li %sum, 0
block loop:
  lw %x, 0(%buf)
  addu %sum, %sum, %x
  addiu %n, %n, -1
  bgtz %n, loop
block exit:
  move $v0, %sum
  jr $ra, $v0
"#;

  #[test]
  fn test_parse_and_reprint() {
    let func = parse_content("x", SOURCE).unwrap();
    assert_eq!(func.name, "demo");
    assert_eq!(func.frame_size, 8);
    assert_eq!(func.blocks.len(), 3);
    assert_eq!(func.num_virtual_regs(), 4);
    let depths: Vec<u32> = func.blocks.iter().map(|b| b.loop_depth).collect();
    assert_eq!(depths, vec![0, 1, 0]);

    // What gets printed reads back to the same thing.
    let printed = format!("{}", func);
    let again = parse_content("y", &printed).unwrap();
    assert_eq!(printed, format!("{}", again));
  }

  #[test]
  fn test_saves_survive_reprinting() {
    let text = "saves $t0 $s1\nblock entry:\n  li $t0, 1\n  li $s1, 2\n  jr $ra\n";
    let func = parse_content("s", text).unwrap();
    assert_eq!(func.callee_saves, vec![PhysReg::T0, PhysReg::S1]);
    let printed = format!("{}", func);
    assert!(printed.contains("saves $t0 $s1\n"));
    let again = parse_content("s", &printed).unwrap();
    assert_eq!(printed, format!("{}", again));
  }

  #[test]
  fn test_parse_errors() {
    let bad = [
      "block b:\n  frob %x\n",
      "block b:\n  addu %x, %y\n",
      "block b:\n  lw %x, 4\n",
      "block b:\n  move $q9, %x\n",
      "  li %x, 1\n",
      "block b:\n  j nowhere\n",
      "block b\n",
      "saves %x\nblock b:\n  jr $ra\n",
    ];
    for text in bad.iter() {
      assert!(parse_content("bad", text).is_err(), "accepted {:?}", text);
    }
  }
}
