//! Quota accumulator (§4.14): per-owner (user/group/project) observed
//! block and inode usage, built incrementally as phase 3/4 process
//! each inode's counter-reconciliation step, consumed by phase 7.

use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QuotaKind {
    User,
    Group,
    Project,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct QuotaUsage {
    pub bcount: u64,
    pub icount: u64,
    pub rtbcount: u64,
}

pub struct QuotaAccumulator {
    totals: Mutex<HashMap<(QuotaKind, u32), QuotaUsage>>,
}

impl QuotaAccumulator {
    pub fn new() -> Self {
        QuotaAccumulator { totals: Mutex::new(HashMap::new()) }
    }

    pub fn add(&self, kind: QuotaKind, id: u32, nblocks: u64, is_realtime: bool) {
        let mut guard = self.totals.lock().unwrap();
        let entry = guard.entry((kind, id)).or_default();
        if is_realtime {
            entry.rtbcount += nblocks;
        } else {
            entry.bcount += nblocks;
        }
        entry.icount += 1;
    }

    pub fn snapshot(&self, kind: QuotaKind) -> Vec<(u32, QuotaUsage)> {
        let guard = self.totals.lock().unwrap();
        guard.iter().filter(|((k, _), _)| *k == kind).map(|((_, id), u)| (*id, *u)).collect()
    }
}

impl Default for QuotaAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulates_per_owner_usage() {
        let acc = QuotaAccumulator::new();
        acc.add(QuotaKind::User, 100, 8, false);
        acc.add(QuotaKind::User, 100, 4, false);
        acc.add(QuotaKind::User, 200, 2, true);
        let snap = acc.snapshot(QuotaKind::User);
        let owner100 = snap.iter().find(|(id, _)| *id == 100).unwrap();
        assert_eq!(owner100.1.bcount, 12);
        assert_eq!(owner100.1.icount, 2);
        let owner200 = snap.iter().find(|(id, _)| *id == 200).unwrap();
        assert_eq!(owner200.1.rtbcount, 2);
    }
}
