//! In-process backend with the same semantics as the Postgres store.

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use cbp_core::{
    repair_id, BatchTask, FinalRow, IdColumn, MissingMetaPolicy, PurchaseKey, SourceOrderLine,
    StagingRow, SyncState,
};
use tokio::sync::Mutex;

use crate::{
    PurchaseFilter, PurchaseStore, QueuedTask, StateStore, StorageError, StorageResult, TaskQueue,
};

/// A `shop_order` row together with the order-level metadata the sync reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryOrder {
    pub status: String,
    pub customer_id: Option<String>,
    pub billing_email: Option<String>,
}

impl MemoryOrder {
    pub fn new(status: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            customer_id: None,
            billing_email: None,
        }
    }

    pub fn customer(mut self, customer_id: impl Into<String>) -> Self {
        self.customer_id = Some(customer_id.into());
        self
    }

    pub fn billing_email(mut self, email: impl Into<String>) -> Self {
        self.billing_email = Some(email.into());
        self
    }
}

/// An order item together with its product metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryLineItem {
    pub order_id: i64,
    pub item_type: String,
    pub product_id: Option<String>,
    pub variation_id: Option<String>,
}

impl MemoryLineItem {
    pub fn new(order_id: i64) -> Self {
        Self {
            order_id,
            item_type: "line_item".to_string(),
            product_id: None,
            variation_id: None,
        }
    }

    pub fn product(mut self, product_id: impl Into<String>) -> Self {
        self.product_id = Some(product_id.into());
        self
    }

    pub fn variation(mut self, variation_id: impl Into<String>) -> Self {
        self.variation_id = Some(variation_id.into());
        self
    }

    pub fn item_type(mut self, item_type: impl Into<String>) -> Self {
        self.item_type = item_type.into();
        self
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    schema_ready: bool,
    orders: BTreeMap<i64, MemoryOrder>,
    line_items: BTreeMap<i64, MemoryLineItem>,
    users: HashMap<i64, String>,
    staging: Vec<StagingRow>,
    purchases: BTreeMap<i64, FinalRow>,
    purchase_keys: HashSet<PurchaseKey>,
    next_purchase_id: i64,
    sync_state: SyncState,
    queue: BTreeMap<i64, BatchTask>,
    next_queue_id: i64,
    worker_locked: bool,
}

impl MemoryState {
    fn ready(&self, relation: &str) -> StorageResult<()> {
        if self.schema_ready {
            Ok(())
        } else {
            Err(StorageError::SchemaMissing(relation.to_string()))
        }
    }

    /// Source lines in line-item-id order, mirroring the Postgres extraction join.
    fn source_lines(&self) -> impl Iterator<Item = SourceOrderLine> + '_ {
        self.line_items
            .values()
            .filter(|item| item.item_type == "line_item")
            .filter_map(|item| {
                let order = self.orders.get(&item.order_id)?;
                Some(SourceOrderLine {
                    product_id: item.product_id.clone(),
                    variation_id: item.variation_id.clone(),
                    order_id: item.order_id,
                    order_status: order.status.clone(),
                    customer_id: order.customer_id.clone(),
                    customer_email: order.billing_email.clone(),
                })
            })
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_order(&self, order_id: i64, order: MemoryOrder) {
        self.state.lock().await.orders.insert(order_id, order);
    }

    /// Delete an order and its line items from the source tables only.
    pub async fn delete_order(&self, order_id: i64) {
        let mut state = self.state.lock().await;
        state.orders.remove(&order_id);
        state.line_items.retain(|_, item| item.order_id != order_id);
    }

    pub async fn set_order_status(&self, order_id: i64, status: impl Into<String>) {
        if let Some(order) = self.state.lock().await.orders.get_mut(&order_id) {
            order.status = status.into();
        }
    }

    pub async fn insert_line_item(&self, order_item_id: i64, item: MemoryLineItem) {
        self.state.lock().await.line_items.insert(order_item_id, item);
    }

    pub async fn insert_user(&self, user_id: i64, email: impl Into<String>) {
        self.state.lock().await.users.insert(user_id, email.into());
    }

    /// Append rows to staging directly, bypassing extraction.
    pub async fn stage_rows(&self, rows: Vec<StagingRow>) {
        self.state.lock().await.staging.extend(rows);
    }

    pub async fn staging_rows(&self) -> Vec<StagingRow> {
        self.state.lock().await.staging.clone()
    }

    /// Final relation contents ordered by id.
    pub async fn purchases(&self) -> Vec<FinalRow> {
        self.state.lock().await.purchases.values().cloned().collect()
    }
}

#[async_trait]
impl PurchaseStore for MemoryStore {
    async fn ensure_schema(&self) -> StorageResult<()> {
        self.state.lock().await.schema_ready = true;
        Ok(())
    }

    async fn truncate_staging(&self) -> StorageResult<()> {
        let mut state = self.state.lock().await;
        state.ready("staging")?;
        state.staging.clear();
        Ok(())
    }

    async fn stage_source_lines(
        &self,
        offset: u64,
        limit: u64,
        policy: MissingMetaPolicy,
    ) -> StorageResult<u64> {
        let mut state = self.state.lock().await;
        state.ready("staging")?;
        let offset = usize::try_from(offset).unwrap_or(usize::MAX);
        let limit = usize::try_from(limit).unwrap_or(usize::MAX);
        let page = state
            .source_lines()
            .filter(|line| policy == MissingMetaPolicy::Lenient || line.has_required_meta())
            .skip(offset)
            .take(limit)
            .map(|line| StagingRow::from(&line))
            .collect::<Vec<_>>();
        let staged = page.len() as u64;
        state.staging.extend(page);
        Ok(staged)
    }

    async fn repair_staging_ids(&self, column: IdColumn) -> StorageResult<u64> {
        let mut state = self.state.lock().await;
        state.ready("staging")?;
        let mut repaired = 0u64;
        for row in state.staging.iter_mut() {
            if repair_id(row.column_mut(column)) {
                repaired += 1;
            }
        }
        Ok(repaired)
    }

    async fn merge_staging(&self) -> StorageResult<u64> {
        let mut state = self.state.lock().await;
        state.ready("purchases")?;
        let keys = state
            .staging
            .iter()
            .map(StagingRow::purchase_key)
            .collect::<Vec<_>>();
        let mut merged = 0u64;
        for key in keys {
            if !state.purchase_keys.insert(key.clone()) {
                continue;
            }
            state.next_purchase_id += 1;
            let id = state.next_purchase_id;
            state.purchases.insert(id, FinalRow::from_key(id, key));
            merged += 1;
        }
        Ok(merged)
    }

    async fn account_email(&self, user_id: i64) -> StorageResult<Option<String>> {
        let state = self.state.lock().await;
        Ok(state
            .users
            .get(&user_id)
            .filter(|email| !email.trim().is_empty())
            .cloned())
    }

    async fn find_purchase(&self, filter: PurchaseFilter<'_>) -> StorageResult<bool> {
        let state = self.state.lock().await;
        state.ready("purchases")?;
        let found = state.purchases.values().any(|row| {
            row.matches_product(filter.product_id)
                && (filter.emails.contains(&row.customer_email)
                    || (filter.user_id > 0 && row.customer_id == filter.user_id))
                && filter.paid_statuses.map_or(true, |statuses| {
                    state
                        .orders
                        .get(&row.order_id)
                        .is_some_and(|order| statuses.contains(&order.status))
                })
        });
        Ok(found)
    }

    async fn remove_entries_for_source_id(&self, source_id: i64) -> StorageResult<u64> {
        let mut state = self.state.lock().await;
        state.ready("purchases")?;
        if source_id <= 0 {
            return Ok(0);
        }
        let doomed = state
            .purchases
            .values()
            .filter(|row| row.references(source_id))
            .map(|row| (row.id, row.key()))
            .collect::<Vec<_>>();
        for (id, key) in &doomed {
            state.purchases.remove(id);
            state.purchase_keys.remove(key);
        }
        Ok(doomed.len() as u64)
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn load_state(&self) -> StorageResult<SyncState> {
        let state = self.state.lock().await;
        state.ready("state")?;
        Ok(state.sync_state.clone())
    }

    async fn save_state(&self, sync_state: &SyncState) -> StorageResult<()> {
        let mut state = self.state.lock().await;
        state.ready("state")?;
        state.sync_state = sync_state.clone();
        Ok(())
    }
}

#[async_trait]
impl TaskQueue for MemoryStore {
    async fn push(&self, task: BatchTask) -> StorageResult<i64> {
        let mut state = self.state.lock().await;
        state.ready("queue")?;
        state.next_queue_id += 1;
        let id = state.next_queue_id;
        state.queue.insert(id, task);
        Ok(id)
    }

    async fn front(&self) -> StorageResult<Option<QueuedTask>> {
        let state = self.state.lock().await;
        state.ready("queue")?;
        Ok(state
            .queue
            .first_key_value()
            .map(|(id, task)| QueuedTask { id: *id, task: *task }))
    }

    async fn replace(&self, id: i64, task: BatchTask) -> StorageResult<()> {
        let mut state = self.state.lock().await;
        state.ready("queue")?;
        if let Some(slot) = state.queue.get_mut(&id) {
            *slot = task;
        }
        Ok(())
    }

    async fn remove(&self, id: i64) -> StorageResult<()> {
        let mut state = self.state.lock().await;
        state.ready("queue")?;
        state.queue.remove(&id);
        Ok(())
    }

    async fn is_empty(&self) -> StorageResult<bool> {
        let state = self.state.lock().await;
        state.ready("queue")?;
        Ok(state.queue.is_empty())
    }

    async fn try_acquire_worker_lock(&self) -> StorageResult<bool> {
        let mut state = self.state.lock().await;
        state.ready("queue")?;
        if state.worker_locked {
            return Ok(false);
        }
        state.worker_locked = true;
        Ok(true)
    }

    async fn release_worker_lock(&self) -> StorageResult<()> {
        self.state.lock().await.worker_locked = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seeded() -> MemoryStore {
        let store = MemoryStore::new();
        store.ensure_schema().await.unwrap();
        store
            .insert_order(100, MemoryOrder::new("wc-completed").customer("3").billing_email("a@x.com"))
            .await;
        store
            .insert_line_item(1, MemoryLineItem::new(100).product("5").variation("0"))
            .await;
        store
            .insert_line_item(2, MemoryLineItem::new(100).product("6").variation("").item_type("shipping"))
            .await;
        store
            .insert_line_item(3, MemoryLineItem::new(100).product("").variation("7"))
            .await;
        store
    }

    fn staging_row(product_id: &str, email: &str) -> StagingRow {
        StagingRow {
            product_id: Some(product_id.to_string()),
            variation_id: Some("0".into()),
            order_id: "100".into(),
            customer_id: Some("3".into()),
            customer_email: Some(email.to_string()),
        }
    }

    #[tokio::test]
    async fn operations_fail_loudly_before_schema_exists() {
        let store = MemoryStore::new();
        let err = store
            .stage_source_lines(0, 10, MissingMetaPolicy::Strict)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::SchemaMissing(_)));
        assert!(store.truncate_staging().await.is_err());
        assert!(store.load_state().await.is_err());
    }

    #[tokio::test]
    async fn extraction_skips_non_line_items_and_pages_by_item_id() {
        let store = seeded().await;

        assert_eq!(store.stage_source_lines(0, 1, MissingMetaPolicy::Strict).await.unwrap(), 1);
        assert_eq!(store.staging_rows().await[0].product_id.as_deref(), Some("5"));

        store.truncate_staging().await.unwrap();
        assert_eq!(store.stage_source_lines(1, 1, MissingMetaPolicy::Strict).await.unwrap(), 1);
        assert_eq!(store.staging_rows().await[0].variation_id.as_deref(), Some("7"));

        store.truncate_staging().await.unwrap();
        assert_eq!(store.stage_source_lines(2, 1, MissingMetaPolicy::Strict).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn strict_policy_drops_lines_missing_metadata() {
        let store = seeded().await;
        store
            .insert_order(200, MemoryOrder::new("wc-completed").billing_email("guest@x.com"))
            .await;
        store
            .insert_line_item(4, MemoryLineItem::new(200).product("9").variation("0"))
            .await;

        assert_eq!(store.stage_source_lines(0, 10, MissingMetaPolicy::Strict).await.unwrap(), 2);
        store.truncate_staging().await.unwrap();
        assert_eq!(store.stage_source_lines(0, 10, MissingMetaPolicy::Lenient).await.unwrap(), 3);
        let rows = store.staging_rows().await;
        assert_eq!(rows[2].customer_id, None);
    }

    #[tokio::test]
    async fn repair_passes_are_scoped_to_their_column() {
        let store = MemoryStore::new();
        store.ensure_schema().await.unwrap();
        let mut broken = staging_row("", "a@x.com");
        broken.customer_id = None;
        store.stage_rows(vec![broken, staging_row("5", "a@x.com")]).await;

        assert_eq!(store.repair_staging_ids(IdColumn::Product).await.unwrap(), 1);
        let rows = store.staging_rows().await;
        assert_eq!(rows[0].product_id.as_deref(), Some("0"));
        assert_eq!(rows[0].customer_id, None);
        assert_eq!(rows[1].product_id.as_deref(), Some("5"));

        assert_eq!(store.repair_staging_ids(IdColumn::Customer).await.unwrap(), 1);
        assert_eq!(store.staging_rows().await[0].customer_id.as_deref(), Some("0"));
    }

    #[tokio::test]
    async fn merge_keeps_one_row_per_purchase_key() {
        let store = MemoryStore::new();
        store.ensure_schema().await.unwrap();
        store
            .stage_rows(vec![staging_row("5", "a@x.com"), staging_row("5", "A@X.com ")])
            .await;

        assert_eq!(store.merge_staging().await.unwrap(), 1);
        assert_eq!(store.merge_staging().await.unwrap(), 0);

        let purchases = store.purchases().await;
        assert_eq!(purchases.len(), 1);
        assert_eq!(purchases[0].customer_email, "a@x.com");
    }

    #[tokio::test]
    async fn removal_frees_the_key_for_a_later_merge() {
        let store = MemoryStore::new();
        store.ensure_schema().await.unwrap();
        store.stage_rows(vec![staging_row("5", "a@x.com")]).await;
        store.merge_staging().await.unwrap();

        assert_eq!(store.remove_entries_for_source_id(100).await.unwrap(), 1);
        assert!(store.purchases().await.is_empty());
        assert_eq!(store.merge_staging().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn removing_unknown_id_keeps_every_row() {
        let store = MemoryStore::new();
        store.ensure_schema().await.unwrap();
        store
            .stage_rows(vec![staging_row("5", "a@x.com"), staging_row("6", "b@x.com")])
            .await;
        store.merge_staging().await.unwrap();

        assert_eq!(store.remove_entries_for_source_id(0).await.unwrap(), 0);
        assert_eq!(store.remove_entries_for_source_id(-3).await.unwrap(), 0);
        assert_eq!(store.purchases().await.len(), 2);
    }

    #[tokio::test]
    async fn worker_lock_has_a_single_holder() {
        let store = MemoryStore::new();
        store.ensure_schema().await.unwrap();

        assert!(store.try_acquire_worker_lock().await.unwrap());
        assert!(!store.try_acquire_worker_lock().await.unwrap());
        store.release_worker_lock().await.unwrap();
        assert!(store.try_acquire_worker_lock().await.unwrap());
    }

    #[tokio::test]
    async fn queue_is_fifo_and_replaceable() {
        let store = MemoryStore::new();
        store.ensure_schema().await.unwrap();
        assert!(store.is_empty().await.unwrap());

        let first = store.push(BatchTask::start()).await.unwrap();
        store.push(BatchTask { offset: 99 }).await.unwrap();
        store.replace(first, BatchTask { offset: 10 }).await.unwrap();

        let front = store.front().await.unwrap().unwrap();
        assert_eq!(front, QueuedTask { id: first, task: BatchTask { offset: 10 } });

        store.remove(first).await.unwrap();
        assert_eq!(store.front().await.unwrap().unwrap().task.offset, 99);
    }

    #[tokio::test]
    async fn state_round_trips() {
        let store = MemoryStore::new();
        store.ensure_schema().await.unwrap();
        assert_eq!(store.load_state().await.unwrap(), SyncState::default());

        let mut state = SyncState::default();
        state.dismiss_notice();
        store.save_state(&state).await.unwrap();
        assert!(store.load_state().await.unwrap().notice_dismissed);
    }
}
