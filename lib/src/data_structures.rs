/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

#![allow(non_snake_case)]

//! Data structures for the whole crate.

use rustc_hash::FxHashMap;
use rustc_hash::FxHashSet;

use std::fmt;
use std::hash::Hash;
use std::marker::PhantomData;
use std::ops::Index;
use std::ops::IndexMut;
use std::slice::{Iter, IterMut};

#[cfg(feature = "enable-serde")]
use serde::{Deserialize, Serialize};

//=============================================================================
// Maps

pub type Map<K, V> = FxHashMap<K, V>;

//=============================================================================
// Sets of things

#[derive(Clone)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct Set<T: Eq + Hash> {
  set: FxHashSet<T>,
}

impl<T: Eq + Ord + Hash + Copy + fmt::Debug> Set<T> {
  pub fn empty() -> Self {
    Self { set: FxHashSet::<T>::default() }
  }

  pub fn unit(item: T) -> Self {
    let mut s = Self::empty();
    s.insert(item);
    s
  }

  pub fn two(item1: T, item2: T) -> Self {
    let mut s = Self::empty();
    s.insert(item1);
    s.insert(item2);
    s
  }

  pub fn card(&self) -> usize {
    self.set.len()
  }

  pub fn insert(&mut self, item: T) {
    self.set.insert(item);
  }

  pub fn delete(&mut self, item: T) {
    self.set.remove(&item);
  }

  pub fn is_empty(&self) -> bool {
    self.set.is_empty()
  }

  pub fn contains(&self, item: T) -> bool {
    self.set.contains(&item)
  }

  pub fn intersect(&mut self, other: &Self) {
    let mut res = FxHashSet::<T>::default();
    for item in self.set.iter() {
      if other.set.contains(item) {
        res.insert(*item);
      }
    }
    self.set = res;
  }

  pub fn union(&mut self, other: &Self) {
    for item in other.set.iter() {
      self.set.insert(*item);
    }
  }

  pub fn remove(&mut self, other: &Self) {
    for item in other.set.iter() {
      self.set.remove(item);
    }
  }

  pub fn is_subset_of(&self, other: &Self) -> bool {
    self.set.is_subset(&other.set)
  }

  /// Elements in ascending order.  Anything that needs a deterministic
  /// traversal goes through here rather than `iter`.
  pub fn to_vec(&self) -> Vec<T> {
    let mut res = Vec::<T>::new();
    for item in self.set.iter() {
      res.push(*item)
    }
    res.sort_unstable();
    res
  }

  pub fn from_vec(vec: Vec<T>) -> Self {
    let mut res = Set::<T>::empty();
    for x in vec {
      res.insert(x);
    }
    res
  }

  pub fn equals(&self, other: &Self) -> bool {
    self.set == other.set
  }

  pub fn iter(&self) -> std::collections::hash_set::Iter<T> {
    self.set.iter()
  }
}

impl<T: Eq + Ord + Hash + Copy + fmt::Debug> fmt::Debug for Set<T> {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    write!(fmt, "{{")?;
    let mut first = true;
    for item in self.to_vec() {
      if !first {
        write!(fmt, ", ")?;
      }
      first = false;
      write!(fmt, "{:?}", item)?;
    }
    write!(fmt, "}}")
  }
}

//=============================================================================
// Iteration boilerplate for entities.  The only purpose of this is to support
// constructions of the form
//
//   for ent in startEnt .dotdot( endPlus1Ent ) {
//   }

pub trait PlusOne {
  fn plus_one(&self) -> Self;
}

#[derive(Clone, Copy)]
pub struct MyRange<T> {
  first: T,
  lastPlus1: T,
  len: usize,
}

impl<T: Copy + PartialOrd + PlusOne> MyRange<T> {
  pub fn new(from: T, len: usize) -> MyRange<T> {
    let mut lastPlus1 = from;
    for _ in 0..len {
      lastPlus1 = lastPlus1.plus_one();
    }
    MyRange { first: from, lastPlus1, len }
  }

  pub fn len(&self) -> usize {
    self.len
  }

  pub fn first(&self) -> T {
    self.first
  }
}

impl<T: Copy + PartialOrd + PlusOne> IntoIterator for MyRange<T> {
  type Item = T;
  type IntoIter = MyIterator<T>;
  fn into_iter(self) -> Self::IntoIter {
    MyIterator { range: self, next: self.first }
  }
}

pub struct MyIterator<T> {
  range: MyRange<T>,
  next: T,
}
impl<T: Copy + PartialOrd + PlusOne> Iterator for MyIterator<T> {
  type Item = T;
  fn next(&mut self) -> Option<Self::Item> {
    if self.next >= self.range.lastPlus1 {
      None
    } else {
      let res = Some(self.next);
      self.next = self.next.plus_one();
      res
    }
  }
}

//=============================================================================
// Vectors where both the index and element types can be specified (and at
// most 2^32-1 elems can be stored.  What if this overflows?)

#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct TypedIxVec<TyIx, Ty> {
  vek: Vec<Ty>,
  ty_ix: PhantomData<TyIx>,
}

impl<TyIx, Ty> TypedIxVec<TyIx, Ty>
where
  Ty: Clone,
  TyIx: Copy + PartialOrd + PlusOne + From<u32>,
{
  pub fn new() -> Self {
    Self { vek: Vec::new(), ty_ix: PhantomData::<TyIx> }
  }
  pub fn from_vec(vek: Vec<Ty>) -> Self {
    Self { vek, ty_ix: PhantomData::<TyIx> }
  }
  pub fn iter(&self) -> Iter<Ty> {
    self.vek.iter()
  }
  pub fn iter_mut(&mut self) -> IterMut<Ty> {
    self.vek.iter_mut()
  }
  pub fn len(&self) -> u32 {
    // FIXME what if this overflows?
    self.vek.len() as u32
  }
  pub fn is_empty(&self) -> bool {
    self.vek.is_empty()
  }
  pub fn push(&mut self, item: Ty) {
    // FIXME what if this overflows?
    self.vek.push(item);
  }
  pub fn resize(&mut self, new_len: u32, value: Ty) {
    self.vek.resize(new_len as usize, value);
  }
  pub fn range(&self) -> MyRange<TyIx> {
    MyRange::new(TyIx::from(0), self.vek.len())
  }
}

impl<TyIx, Ty> Index<TyIx> for TypedIxVec<TyIx, Ty>
where
  TyIx: Into<u32>,
{
  type Output = Ty;
  fn index(&self, ix: TyIx) -> &Ty {
    &self.vek[ix.into() as usize]
  }
}

impl<TyIx, Ty> IndexMut<TyIx> for TypedIxVec<TyIx, Ty>
where
  TyIx: Into<u32>,
{
  fn index_mut(&mut self, ix: TyIx) -> &mut Ty {
    &mut self.vek[ix.into() as usize]
  }
}

impl<TyIx, Ty> Clone for TypedIxVec<TyIx, Ty>
where
  Ty: Clone,
{
  fn clone(&self) -> Self {
    Self { vek: self.vek.clone(), ty_ix: PhantomData::<TyIx> }
  }
}

impl<TyIx, Ty: fmt::Debug> fmt::Debug for TypedIxVec<TyIx, Ty> {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    write!(fmt, "{:?}", self.vek)
  }
}

//=============================================================================

macro_rules! generate_boilerplate {
  ($TypeIx:ident, $PrintingPrefix:expr) => {
    #[derive(Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
    #[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
    pub struct $TypeIx(u32);

    impl $TypeIx {
      #[inline(always)]
      pub fn new(n: u32) -> Self {
        Self(n)
      }
      #[inline(always)]
      pub fn get(self) -> u32 {
        self.0
      }
      #[inline(always)]
      pub fn plus(self, delta: u32) -> $TypeIx {
        $TypeIx(self.0 + delta)
      }
      #[inline(always)]
      pub fn minus(self, delta: u32) -> $TypeIx {
        $TypeIx(self.0 - delta)
      }
      pub fn dotdot(&self, lastPlus1: $TypeIx) -> MyRange<$TypeIx> {
        let len = (lastPlus1.0 - self.0) as usize;
        MyRange::new(*self, len)
      }
    }
    impl fmt::Debug for $TypeIx {
      fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{}{}", $PrintingPrefix, &self.0)
      }
    }
    impl PlusOne for $TypeIx {
      #[inline(always)]
      fn plus_one(&self) -> Self {
        self.plus(1)
      }
    }
    impl Into<u32> for $TypeIx {
      #[inline(always)]
      fn into(self) -> u32 {
        self.get()
      }
    }
    impl From<u32> for $TypeIx {
      #[inline(always)]
      fn from(n: u32) -> Self {
        Self(n)
      }
    }
  };
}

generate_boilerplate!(InstIx, "i");

generate_boilerplate!(BlockIx, "b");

//=============================================================================
// Physical registers.  The enumeration order is the hardware encoding.

#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub enum PhysReg {
  Zero,
  At,
  V0,
  V1,
  A0,
  A1,
  A2,
  A3,
  T0,
  T1,
  T2,
  T3,
  T4,
  T5,
  T6,
  T7,
  S0,
  S1,
  S2,
  S3,
  S4,
  S5,
  S6,
  S7,
  T8,
  T9,
  K0,
  K1,
  Gp,
  Sp,
  Fp,
  Ra,
}

pub const NUM_PHYS_REGS: usize = 32;

pub const ALL_PHYS_REGS: [PhysReg; NUM_PHYS_REGS] = [
  PhysReg::Zero,
  PhysReg::At,
  PhysReg::V0,
  PhysReg::V1,
  PhysReg::A0,
  PhysReg::A1,
  PhysReg::A2,
  PhysReg::A3,
  PhysReg::T0,
  PhysReg::T1,
  PhysReg::T2,
  PhysReg::T3,
  PhysReg::T4,
  PhysReg::T5,
  PhysReg::T6,
  PhysReg::T7,
  PhysReg::S0,
  PhysReg::S1,
  PhysReg::S2,
  PhysReg::S3,
  PhysReg::S4,
  PhysReg::S5,
  PhysReg::S6,
  PhysReg::S7,
  PhysReg::T8,
  PhysReg::T9,
  PhysReg::K0,
  PhysReg::K1,
  PhysReg::Gp,
  PhysReg::Sp,
  PhysReg::Fp,
  PhysReg::Ra,
];

const PHYS_REG_NAMES: [&str; NUM_PHYS_REGS] = [
  "zero", "at", "v0", "v1", "a0", "a1", "a2", "a3", "t0", "t1", "t2", "t3",
  "t4", "t5", "t6", "t7", "s0", "s1", "s2", "s3", "s4", "s5", "s6", "s7", "t8",
  "t9", "k0", "k1", "gp", "sp", "fp", "ra",
];

/// The two disjoint groups of registers the allocator may hand out.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RegGroup {
  /// t0 .. t7
  Temporary,
  /// s0 .. s7 and fp
  Saved,
}

impl PhysReg {
  pub fn get_index(self) -> usize {
    self as usize
  }

  pub fn from_index(ix: usize) -> Option<PhysReg> {
    ALL_PHYS_REGS.get(ix).cloned()
  }

  pub fn name(self) -> &'static str {
    PHYS_REG_NAMES[self.get_index()]
  }

  pub fn from_name(name: &str) -> Option<PhysReg> {
    PHYS_REG_NAMES.iter().position(|n| *n == name).map(|ix| ALL_PHYS_REGS[ix])
  }

  /// Which allocatable group this register belongs to, if any.  Everything
  /// outside both groups is reserved.
  pub fn group(self) -> Option<RegGroup> {
    match self {
      PhysReg::T0
      | PhysReg::T1
      | PhysReg::T2
      | PhysReg::T3
      | PhysReg::T4
      | PhysReg::T5
      | PhysReg::T6
      | PhysReg::T7 => Some(RegGroup::Temporary),
      PhysReg::S0
      | PhysReg::S1
      | PhysReg::S2
      | PhysReg::S3
      | PhysReg::S4
      | PhysReg::S5
      | PhysReg::S6
      | PhysReg::S7
      | PhysReg::Fp => Some(RegGroup::Saved),
      _ => None,
    }
  }

  pub fn to_reg(self) -> Reg {
    Reg::new_phys(self)
  }
}

impl fmt::Display for PhysReg {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    write!(fmt, "${}", self.name())
  }
}

//=============================================================================
// Registers, both physical and virtual.
//
// A Reg is a 32-bit value.  The top bit says whether it is virtual.  For a
// physical register the remaining bits hold its hardware encoding; for a
// virtual register they hold the index it was created with.  Equality is
// therefore identity for physical registers and index equality for virtual
// ones.

const VIRTUAL_BIT: u32 = 0x8000_0000;

#[derive(Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct Reg {
  bits: u32,
}

impl Reg {
  pub fn new_phys(reg: PhysReg) -> Reg {
    Reg { bits: reg.get_index() as u32 }
  }
  pub fn new_virtual(index: u32) -> Reg {
    // Stay sane ..
    assert!(index < VIRTUAL_BIT);
    Reg { bits: VIRTUAL_BIT | index }
  }
  pub fn is_virtual(self) -> bool {
    (self.bits & VIRTUAL_BIT) != 0
  }
  pub fn is_phys(self) -> bool {
    !self.is_virtual()
  }
  pub fn get_index(self) -> usize {
    (self.bits & !VIRTUAL_BIT) as usize
  }
  pub fn as_phys_reg(self) -> Option<PhysReg> {
    if self.is_virtual() {
      None
    } else {
      PhysReg::from_index(self.get_index())
    }
  }
  pub fn as_virtual_reg(self) -> Option<VirtualReg> {
    if self.is_virtual() {
      Some(VirtualReg { index: self.get_index() as u32 })
    } else {
      None
    }
  }
  pub fn to_phys_reg(self) -> PhysReg {
    match self.as_phys_reg() {
      Some(preg) => preg,
      None => panic!("Reg::to_phys_reg: this is a virtual register"),
    }
  }
  pub fn to_virtual_reg(self) -> VirtualReg {
    match self.as_virtual_reg() {
      Some(vreg) => vreg,
      None => panic!("Reg::to_virtual_reg: this is a physical register"),
    }
  }
  pub fn is_zero(self) -> bool {
    self == Reg::new_phys(PhysReg::Zero)
  }
}

impl From<PhysReg> for Reg {
  fn from(preg: PhysReg) -> Reg {
    Reg::new_phys(preg)
  }
}

impl From<VirtualReg> for Reg {
  fn from(vreg: VirtualReg) -> Reg {
    vreg.to_reg()
  }
}

impl fmt::Debug for Reg {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    match self.as_phys_reg() {
      Some(preg) => write!(fmt, "{}", preg),
      None => write!(fmt, "%v{}", self.get_index()),
    }
  }
}

impl fmt::Display for Reg {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    write!(fmt, "{:?}", self)
  }
}

#[derive(Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct VirtualReg {
  index: u32,
}

impl VirtualReg {
  pub fn new(index: u32) -> VirtualReg {
    VirtualReg { index }
  }
  pub fn get_index(self) -> usize {
    self.index as usize
  }
  pub fn to_reg(self) -> Reg {
    Reg::new_virtual(self.index)
  }
}

impl fmt::Debug for VirtualReg {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    write!(fmt, "%v{}", self.index)
  }
}

impl fmt::Display for VirtualReg {
  fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
    write!(fmt, "{:?}", self)
  }
}

//=============================================================================
// The register universe: the physical registers the allocator may assign,
// in the order it tries them.

#[derive(Clone, Debug)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct RealRegUniverse {
  /// Allocatable registers, in preference order.  Every register here
  /// belongs to one of the two groups; nothing reserved may appear.
  pub allocable: Vec<PhysReg>,
}

impl RealRegUniverse {
  /// The full default set: temporaries first, then the saved registers.
  pub fn mips() -> RealRegUniverse {
    let allocable = ALL_PHYS_REGS
      .iter()
      .filter(|r| r.group() == Some(RegGroup::Temporary))
      .chain(
        ALL_PHYS_REGS.iter().filter(|r| r.group() == Some(RegGroup::Saved)),
      )
      .cloned()
      .collect();
    RealRegUniverse { allocable }
  }

  /// The first `n` registers of the default set.
  pub fn restricted(n: usize) -> RealRegUniverse {
    let mut universe = Self::mips();
    universe.allocable.truncate(n);
    universe
  }

  /// An explicit list of registers, kept in the given order.  Registers
  /// outside both allocatable groups are rejected.
  pub fn from_regs(regs: &[PhysReg]) -> Result<RealRegUniverse, String> {
    let mut allocable = Vec::<PhysReg>::new();
    for reg in regs {
      if reg.group().is_none() {
        return Err(format!("register {} is reserved", reg));
      }
      if !allocable.contains(reg) {
        allocable.push(*reg);
      }
    }
    Ok(RealRegUniverse { allocable })
  }

  /// Number of available colors, usually called K.
  pub fn num_colors(&self) -> u32 {
    self.allocable.len() as u32
  }

  pub fn is_allocatable(&self, reg: PhysReg) -> bool {
    self.allocable.contains(&reg)
  }

  pub fn is_reserved(&self, reg: PhysReg) -> bool {
    !self.is_allocatable(reg)
  }

  pub fn show(&self) -> Vec<String> {
    self.allocable.iter().map(|r| r.to_string()).collect()
  }
}

#[test]
fn test_reg_packing() {
  let t3 = Reg::new_phys(PhysReg::T3);
  assert!(t3.is_phys());
  assert_eq!(t3.to_phys_reg(), PhysReg::T3);
  assert_eq!(t3.get_index(), 11);

  let v = Reg::new_virtual(11);
  assert!(v.is_virtual());
  assert!(v != t3);
  assert_eq!(v.to_virtual_reg(), VirtualReg::new(11));
  assert_eq!(format!("{:?} {:?}", t3, v), "$t3 %v11");

  // Physical registers order before virtual ones.
  assert!(Reg::new_phys(PhysReg::Ra) < Reg::new_virtual(0));
}

#[test]
fn test_universe() {
  let full = RealRegUniverse::mips();
  assert_eq!(full.num_colors(), 17);
  assert_eq!(full.allocable[0], PhysReg::T0);
  assert_eq!(full.allocable[8], PhysReg::S0);
  assert_eq!(full.allocable[16], PhysReg::Fp);
  for reg in [PhysReg::Zero, PhysReg::Sp, PhysReg::Ra, PhysReg::V0].iter() {
    assert!(full.is_reserved(*reg));
  }

  let two = RealRegUniverse::restricted(2);
  assert_eq!(two.allocable, vec![PhysReg::T0, PhysReg::T1]);
  assert!(two.is_reserved(PhysReg::S0));

  assert!(RealRegUniverse::from_regs(&[PhysReg::S1, PhysReg::Sp]).is_err());
  assert_eq!(PhysReg::from_name("fp"), Some(PhysReg::Fp));
  assert_eq!(PhysReg::from_name("bogus"), None);
}
