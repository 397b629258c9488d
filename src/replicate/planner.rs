//! Derives what each side sends and expects from the two handshakes.
//!
//! A blob moves from A to B iff A pushes and B pulls. Both sides evaluate the
//! same rule over the same two inventories and flag sets, so their plans
//! mirror each other without any further negotiation.

use crate::replicate::inventory::{Capability, Inventory};
use crate::replicate::protocol::CapabilityFlags;
use std::collections::BTreeSet;

/// Keys one side sends (`outbox`) and expects to receive (`inbox`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferSet {
    pub outbox: BTreeSet<String>,
    pub inbox: BTreeSet<String>,
}

impl TransferSet {
    pub fn plan(
        local: &Inventory,
        local_caps: &Capability,
        peer: &Inventory,
        peer_flags: CapabilityFlags,
    ) -> Self {
        let outbox = if local_caps.push && peer_flags.pull() {
            local.difference(peer).cloned().collect()
        } else {
            BTreeSet::new()
        };

        let inbox = if local_caps.pull && peer_flags.push() {
            peer.difference(local).cloned().collect()
        } else {
            BTreeSet::new()
        };

        Self { outbox, inbox }
    }

    /// Number of blob transfers this side will take part in.
    pub fn total(&self) -> u64 {
        (self.outbox.len() + self.inbox.len()) as u64
    }

    pub fn is_empty(&self) -> bool {
        self.outbox.is_empty() && self.inbox.is_empty()
    }
}
