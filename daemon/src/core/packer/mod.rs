// Bundle Packer (C4): decides which set of pending items goes into which
// bundle plan. Pure function, no I/O — the algorithm of spec §4.4, kept
// deterministic and independently testable from the workers that call it.

use chrono::{DateTime, Utc};

/// The subset of `DataItem` the packer needs. Decoupled from
/// `bundler_common::data_item::DataItem` so the packer has no storage or
/// serde dependency of its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackerItem {
    pub id: String,
    pub byte_count: u64,
    pub uploaded_date: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundlePlanDraft {
    pub item_ids: Vec<String>,
    pub total_bytes: u64,
    pub item_sizes: Vec<u64>,
    pub contains_overdue: bool,
}

impl BundlePlanDraft {
    fn empty() -> Self {
        Self {
            item_ids: Vec::new(),
            total_bytes: 0,
            item_sizes: Vec::new(),
            contains_overdue: false,
        }
    }

    /// Strict inequalities, per spec §4.4: a plan has capacity for one more
    /// item iff it is still strictly under both limits before adding it.
    fn has_capacity(
        &self,
        byte_count: u64,
        max_total_bytes: u64,
        max_items_per_bundle: usize,
    ) -> bool {
        self.item_ids.len() < max_items_per_bundle
            && self.total_bytes + byte_count <= max_total_bytes
    }

    fn push(&mut self, id: String, byte_count: u64) {
        self.item_ids.push(id);
        self.item_sizes.push(byte_count);
        self.total_bytes += byte_count;
    }
}

pub struct PackerConfig {
    pub max_total_bytes: u64,
    pub max_single_item_bytes: u64,
    pub max_items_per_bundle: usize,
    pub overdue_threshold: DateTime<Utc>,
}

/// Run the packing algorithm over `items`, returning one plan draft per
/// bundle that should be built. Items whose `byte_count` exceeds
/// `max_single_item_bytes` are dropped (logged by the caller) and never
/// appear in any returned plan.
///
/// Deterministic: for a fixed input multiset, the output plans (and their
/// item order) are always the same, because ties in `byte_count` are broken
/// by original insertion order (a stable sort).
pub fn pack(items: Vec<PackerItem>, config: &PackerConfig) -> Vec<BundlePlanDraft> {
    let mut indexed: Vec<(usize, PackerItem)> = items
        .into_iter()
        .enumerate()
        .filter(|(_, item)| {
            let fits = item.byte_count <= config.max_single_item_bytes;
            if !fits {
                warn!(
                    "dropping oversize item {} ({} bytes > max_single_item_bytes {})",
                    item.id, item.byte_count, config.max_single_item_bytes
                );
            }
            fits
        })
        .collect();

    // Stable sort ascending by byte_count; original insertion index is the
    // tiebreak because the sort is stable and we carried the index through.
    indexed.sort_by(|(_, a), (_, b)| a.byte_count.cmp(&b.byte_count));

    let mut plans: Vec<BundlePlanDraft> = Vec::new();
    for (_, item) in indexed {
        let slot = plans.iter_mut().find(|plan| {
            plan.has_capacity(
                item.byte_count,
                config.max_total_bytes,
                config.max_items_per_bundle,
            )
        });

        let plan = match slot {
            Some(plan) => plan,
            None => {
                plans.push(BundlePlanDraft::empty());
                plans.last_mut().expect("just pushed")
            }
        };

        if item.uploaded_date < config.overdue_threshold {
            plan.contains_overdue = true;
        }
        plan.push(item.id, item.byte_count);
    }

    plans
}
