/* -*- Mode: Rust; tab-width: 8; indent-tabs-mode: nil; rust-indent-offset: 2 -*-
 * vim: set ts=8 sts=2 et sw=2 tw=80:
*/

//! The pieces of the colora harness, shared with the fuzz targets.

pub mod fuzzing;
pub mod parser;
pub mod test_cases;
pub mod test_framework;
pub mod validator;
