/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Union-find over densely numbered items, used by the coalescer to track
//! which node each coalesced register has been merged into.

use std::marker::PhantomData;

use crate::data_structures::{PhysReg, Reg, NUM_PHYS_REGS};

//=============================================================================
// A trait for things that can be densely numbered, so they can key plain
// vectors rather than hash maps.

pub trait ToFromU32<T: Sized = Self> {
  fn to_u32(x: Self) -> u32;
  fn from_u32(x: u32) -> Self;
}

impl ToFromU32 for u32 {
  fn to_u32(x: u32) -> u32 {
    x
  }
  fn from_u32(x: u32) -> u32 {
    x
  }
}

// Physical registers take the first NUM_PHYS_REGS slots, virtual registers
// follow in index order.
impl ToFromU32 for Reg {
  fn to_u32(x: Reg) -> u32 {
    if x.is_virtual() {
      NUM_PHYS_REGS as u32 + x.get_index() as u32
    } else {
      x.get_index() as u32
    }
  }
  fn from_u32(x: u32) -> Reg {
    if (x as usize) < NUM_PHYS_REGS {
      match PhysReg::from_index(x as usize) {
        Some(preg) => Reg::new_phys(preg),
        None => unreachable!(),
      }
    } else {
      Reg::new_virtual(x - NUM_PHYS_REGS as u32)
    }
  }
}

//=============================================================================
// UnionFind

/// Every item starts out as its own singleton class.  `union_into` merges
/// the class of one item into the class of another, keeping the latter's
/// representative.  `find` compresses paths as it goes.
pub struct UnionFind<T: ToFromU32> {
  parent: Vec<u32>,
  anchor: PhantomData<T>,
}

impl<T: ToFromU32 + Copy> UnionFind<T> {
  pub fn new() -> Self {
    Self { parent: Vec::new(), anchor: PhantomData }
  }

  fn grow_to(&mut self, ix: u32) {
    let mut n = self.parent.len() as u32;
    while n <= ix {
      self.parent.push(n);
      n += 1;
    }
  }

  pub fn find(&mut self, item: T) -> T {
    let ix = ToFromU32::to_u32(item);
    if ix as usize >= self.parent.len() {
      return item;
    }
    let mut root = ix;
    while self.parent[root as usize] != root {
      root = self.parent[root as usize];
    }
    // Path compression.
    let mut curr = ix;
    while self.parent[curr as usize] != root {
      let next = self.parent[curr as usize];
      self.parent[curr as usize] = root;
      curr = next;
    }
    ToFromU32::from_u32(root)
  }

  /// Merge `child`'s class into `parent`'s.  Afterwards `find(child)` returns
  /// whatever `find(parent)` returned before.
  pub fn union_into(&mut self, child: T, parent: T) {
    let child_root = ToFromU32::to_u32(self.find(child));
    let parent_root = ToFromU32::to_u32(self.find(parent));
    if child_root == parent_root {
      return;
    }
    self.grow_to(child_root.max(parent_root));
    self.parent[child_root as usize] = parent_root;
  }

  pub fn is_root(&mut self, item: T) -> bool {
    ToFromU32::to_u32(self.find(item)) == ToFromU32::to_u32(item)
  }
}

#[test]
fn test_union_find_basic() {
  let mut uf = UnionFind::<u32>::new();
  assert_eq!(uf.find(7), 7);
  uf.union_into(1, 2);
  uf.union_into(2, 3);
  assert_eq!(uf.find(1), 3);
  assert_eq!(uf.find(2), 3);
  assert!(uf.is_root(3));
  assert!(!uf.is_root(1));
  // Merging an already-merged pair changes nothing.
  uf.union_into(1, 3);
  assert_eq!(uf.find(3), 3);
  uf.union_into(3, 9);
  assert_eq!(uf.find(1), 9);
}

#[test]
fn test_union_find_regs() {
  let mut uf = UnionFind::<Reg>::new();
  let v0 = Reg::new_virtual(0);
  let v5 = Reg::new_virtual(5);
  let t2 = Reg::new_phys(PhysReg::T2);
  uf.union_into(v5, v0);
  uf.union_into(v0, t2);
  assert_eq!(uf.find(v5), t2);
  assert_eq!(uf.find(v0), t2);
  assert_eq!(uf.find(Reg::new_virtual(1)), Reg::new_virtual(1));
  assert_eq!(
    <Reg as ToFromU32>::from_u32(<Reg as ToFromU32>::to_u32(v5)),
    v5
  );
}
