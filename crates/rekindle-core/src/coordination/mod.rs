// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cross-instance coordination built on [`UnderlyingRegister`](crate::store::UnderlyingRegister).
//!
//! - [`Monitor`] serializes work on a named resource across instances and replicas.
//! - [`Arbitrator`] records a single decision that every later proposer observes.
//!
//! Both give single-key compare-and-swap semantics only.

mod arbitrator;
mod monitor;

pub use arbitrator::Arbitrator;
pub use monitor::{Monitor, MonitorLock};
