/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! Main file / top-level module for the regcolor library.

// Make the analysis and checker modules public for fuzzing.
#[cfg(feature = "fuzzing")]
pub mod analysis;
#[cfg(not(feature = "fuzzing"))]
mod analysis;

#[cfg(feature = "fuzzing")]
pub mod checker;
#[cfg(not(feature = "fuzzing"))]
mod checker;

pub mod data_structures;
pub mod func;
mod interface;
mod interference;
mod irc;
pub mod mc;
mod naive;
mod rewrite;
mod spill;
mod trees_maps_sets;

pub use crate::analysis::compute_loop_depths;
pub use crate::checker::{CheckerError, CheckerErrors};
pub use crate::data_structures::{PhysReg, RealRegUniverse, Reg, VirtualReg};
pub use crate::func::{Func, RematLoc};
pub use crate::interface::*;
