//! Kanban ordering of deals inside one (pipeline, stage) bucket
//!
//! A deal sorts by its creation time until someone reorders its bucket.
//! Reordering hands every deal in the bucket a fresh synthetic key, so from
//! then on the explicit arrangement is the default order. Keys belong to
//! the (pipeline, deal) pair and survive stage moves; the index never
//! decides which bucket a deal is in.

use chrono::{DateTime, Utc};
use dealflow_model::{Deal, DealId, PipelineId};
use parking_lot::RwLock;
use std::collections::HashMap;

#[derive(Debug, Default)]
struct Keys {
    explicit: HashMap<(PipelineId, DealId), i64>,
    last_issued: i64,
}

impl Keys {
    fn sort_key(&self, pipeline_id: PipelineId, deal: &Deal) -> i64 {
        self.explicit
            .get(&(pipeline_id, deal.id))
            .copied()
            .unwrap_or_else(|| deal.created_at.timestamp_micros())
    }
}

/// Synthetic ordering keys per pipeline membership
#[derive(Debug, Default)]
pub struct DealOrderingIndex {
    keys: RwLock<Keys>,
}

impl DealOrderingIndex {
    /// Empty index
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sort one bucket's deals into display order
    #[must_use]
    pub fn arrange(&self, pipeline_id: PipelineId, mut bucket: Vec<Deal>) -> Vec<Deal> {
        let keys = self.keys.read();
        bucket.sort_by_cached_key(|deal| (keys.sort_key(pipeline_id, deal), deal.created_at, deal.id));
        bucket
    }

    /// Move `deal_id` to `target_index` within `bucket` and rekey the bucket
    ///
    /// `bucket` must hold every deal currently in the (pipeline, stage)
    /// bucket. The index is clamped to `0..=len` of the bucket without the
    /// moved deal. Returns the new order.
    pub fn reposition(
        &self,
        pipeline_id: PipelineId,
        bucket: Vec<Deal>,
        deal_id: DealId,
        target_index: usize,
        now: DateTime<Utc>,
    ) -> Vec<DealId> {
        let mut order: Vec<DealId> = self
            .arrange(pipeline_id, bucket)
            .into_iter()
            .map(|d| d.id)
            .filter(|id| *id != deal_id)
            .collect();
        let index = target_index.min(order.len());
        order.insert(index, deal_id);

        let mut keys = self.keys.write();
        let mut key = now.timestamp_micros().max(keys.last_issued + 1);
        for id in &order {
            keys.explicit.insert((pipeline_id, *id), key);
            keys.last_issued = key;
            key += 1;
        }
        drop(keys);

        tracing::debug!(pipeline = %pipeline_id, deal = %deal_id, index, size = order.len(), "Bucket reordered");
        order
    }

    /// Forget a deal's key in one pipeline
    pub fn forget(&self, pipeline_id: PipelineId, deal_id: DealId) {
        self.keys.write().explicit.remove(&(pipeline_id, deal_id));
    }
}
