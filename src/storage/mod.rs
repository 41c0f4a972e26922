// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Synchronous drivers: the contract, a volatile memory driver, and the
//! split router that composes several drivers by data kind.

pub mod traits;
pub mod memory;
pub mod split;
