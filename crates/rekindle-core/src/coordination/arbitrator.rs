// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Single-decision consensus.

use std::sync::Arc;

use tracing::debug;

use crate::error::Result;
use crate::store::{RegisterKind, UnderlyingRegister};

/// Records the first proposed value for a key; every later proposal is
/// compared against it.
#[derive(Clone)]
pub struct Arbitrator {
    register: Arc<dyn UnderlyingRegister>,
}

impl std::fmt::Debug for Arbitrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arbitrator").finish_non_exhaustive()
    }
}

fn key(instance: Option<&str>) -> &str {
    instance.unwrap_or("")
}

impl Arbitrator {
    /// Create an arbitrator over `register`.
    pub fn new(register: Arc<dyn UnderlyingRegister>) -> Self {
        Self { register }
    }

    /// Propose `value`. The first proposal wins and is persisted; later
    /// proposals return true only when they equal the decided value.
    pub async fn propose(&self, group: &str, instance: Option<&str>, value: &str) -> Result<bool> {
        let name = key(instance);
        if self
            .register
            .set_if_empty(RegisterKind::Arbitrator, group, name, value)
            .await?
        {
            debug!(group, instance = name, value, "Arbitrator decision recorded");
            return Ok(true);
        }

        let decided = self
            .register
            .get(RegisterKind::Arbitrator, group, name)
            .await?;
        Ok(decided.as_deref() == Some(value))
    }

    /// The decided value, if any.
    pub async fn decision(&self, group: &str, instance: Option<&str>) -> Result<Option<String>> {
        self.register
            .get(RegisterKind::Arbitrator, group, key(instance))
            .await
    }

    /// Forget the decision so a new one can be made.
    pub async fn revoke(&self, group: &str, instance: Option<&str>) -> Result<()> {
        self.register
            .delete(RegisterKind::Arbitrator, group, key(instance), None)
            .await?;
        Ok(())
    }
}
