use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::address::Address;

/// A frozen committee-eligible miner roster. Once created a group never
/// changes; rotation always creates a new group with the next id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub group_id: u64,
    pub miners: BTreeMap<Address, u64>,
    pub created_at: u64,
}

impl Group {
    pub fn genesis() -> Self {
        Group {
            group_id: 1,
            miners: BTreeMap::new(),
            created_at: 0,
        }
    }
}
