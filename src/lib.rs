// SPDX-License-Identifier: MIT

pub mod core;
pub mod storm;
