// SPDX-License-Identifier: MIT OR Apache-2.0

//! Shared utilities: vector algebra, probability statistics, attention masks.

pub mod masks;
pub mod stats;
pub mod vector;
