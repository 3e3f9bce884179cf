// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Bit-packed delta-compressed storage: the substrate shared by the volume
//! index (§4.7) and every chapter index (§4.3).

pub mod index;
pub mod memory;

pub use index::{Cursor, DeltaIndex};
pub use memory::{DeltaList, DeltaZone};
