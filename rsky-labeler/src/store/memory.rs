use crate::label::SignedLabel;
use crate::store::{FindOptions, LabelFilter, LabelStore, SortOrder, StoreError, StoredLabel};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::BTreeMap;

#[derive(Debug)]
struct MemoryState {
    connected: bool,
    next_id: i64,
    labels: BTreeMap<i64, SignedLabel>,
}

/// Process-local label store. Identity assignment and insertion happen under
/// a single write lock, so ids are unique, strictly increasing and become
/// visible to readers in order.
#[derive(Debug)]
pub struct MemoryLabelStore {
    state: RwLock<MemoryState>,
}

impl Default for MemoryLabelStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLabelStore {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(MemoryState {
                connected: false,
                next_id: 1,
                labels: BTreeMap::new(),
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.state.read().labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn not_connected() -> StoreError {
    StoreError::InvalidState("store is not connected".to_string())
}

#[async_trait]
impl LabelStore for MemoryLabelStore {
    async fn connect(&self) -> Result<(), StoreError> {
        self.state.write().connected = true;
        Ok(())
    }

    async fn close(&self) -> Result<(), StoreError> {
        let mut state = self.state.write();
        if !state.connected {
            return Err(StoreError::Close("store is not connected".to_string()));
        }
        state.connected = false;
        Ok(())
    }

    async fn insert(&self, label: SignedLabel) -> Result<StoredLabel, StoreError> {
        let mut state = self.state.write();
        if !state.connected {
            return Err(not_connected());
        }
        let id = state.next_id;
        debug_assert!(!state.labels.contains_key(&id));
        state.next_id += 1;
        state.labels.insert(id, label.clone());
        Ok(StoredLabel { id, label })
    }

    async fn find_many(
        &self,
        filter: &LabelFilter,
        options: FindOptions,
    ) -> Result<Vec<StoredLabel>, StoreError> {
        let state = self.state.read();
        if !state.connected {
            return Err(not_connected());
        }
        let now = Utc::now();
        let matching = state
            .labels
            .iter()
            .filter(|(_, label)| filter.matches(label, now))
            .map(|(id, label)| StoredLabel {
                id: *id,
                label: label.clone(),
            });
        let ordered: Box<dyn Iterator<Item = StoredLabel> + '_> = match options.sort {
            SortOrder::Ascending => Box::new(matching),
            SortOrder::Descending => Box::new(matching.rev()),
        };
        let paged = ordered.skip(options.skip);
        Ok(match options.limit {
            Some(limit) => paged.take(limit).collect(),
            None => paged.collect(),
        })
    }

    async fn find_one(&self, id: i64) -> Result<Option<StoredLabel>, StoreError> {
        let state = self.state.read();
        if !state.connected {
            return Err(not_connected());
        }
        Ok(state.labels.get(&id).map(|label| StoredLabel {
            id,
            label: label.clone(),
        }))
    }

    async fn find_after(&self, id: i64, limit: usize) -> Result<Vec<StoredLabel>, StoreError> {
        let state = self.state.read();
        if !state.connected {
            return Err(not_connected());
        }
        Ok(state
            .labels
            .range(id.saturating_add(1)..)
            .take(limit)
            .map(|(id, label)| StoredLabel {
                id: *id,
                label: label.clone(),
            })
            .collect())
    }

    async fn update_by_id(&self, id: i64, label: &SignedLabel) -> Result<bool, StoreError> {
        let mut state = self.state.write();
        if !state.connected {
            return Err(not_connected());
        }
        match state.labels.get_mut(&id) {
            Some(existing) => {
                *existing = label.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn label(uri: &str, val: &str) -> SignedLabel {
        SignedLabel {
            cid: None,
            cts: "2025-01-01T00:00:00.000Z".to_string(),
            exp: None,
            neg: false,
            sig: vec![9; 64],
            src: "did:web:labeler.test".to_string(),
            uri: uri.to_string(),
            val: val.to_string(),
            ver: 1,
        }
    }

    async fn connected() -> MemoryLabelStore {
        let store = MemoryLabelStore::new();
        store.connect().await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_requires_connect() {
        let store = MemoryLabelStore::new();
        let err = store.insert(label("did:plc:a", "spam")).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidState(_)));
        assert!(store.find_one(1).await.is_err());
        assert!(matches!(store.close().await, Err(StoreError::Close(_))));

        store.connect().await.unwrap();
        store.close().await.unwrap();
        assert!(store.find_after(0, 10).await.is_err());
    }

    #[tokio::test]
    async fn test_ids_start_at_one_and_increase() {
        let store = connected().await;
        let first = store.insert(label("did:plc:a", "spam")).await.unwrap();
        let second = store.insert(label("did:plc:b", "spam")).await.unwrap();
        assert_eq!(first.id, 1);
        assert_eq!(second.id, 2);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_inserts_never_share_an_id() {
        let store = Arc::new(connected().await);
        let mut handles = Vec::new();
        for i in 0..64 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .insert(label(&format!("did:plc:user{i}"), "spam"))
                    .await
                    .unwrap()
                    .id
            }));
        }
        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap());
        }
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids, (1..=64).collect::<Vec<i64>>());
    }

    #[tokio::test]
    async fn test_find_after() {
        let store = connected().await;
        for i in 0..5 {
            store.insert(label(&format!("did:plc:u{i}"), "spam")).await.unwrap();
        }
        let page = store.find_after(2, 2).await.unwrap();
        assert_eq!(page.iter().map(|l| l.id).collect::<Vec<_>>(), vec![3, 4]);
        assert!(store.find_after(5, 10).await.unwrap().is_empty());
        assert_eq!(store.find_after(i64::MAX, 10).await.unwrap().len(), 0);
        assert_eq!(store.find_after(-1, 10).await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_find_many_sort_and_page() {
        let store = connected().await;
        for i in 0..5 {
            store.insert(label(&format!("did:plc:u{i}"), "spam")).await.unwrap();
        }
        store.insert(label("did:plc:other", "porn")).await.unwrap();

        let filter = LabelFilter {
            val: Some("spam".to_string()),
            ..Default::default()
        };
        let desc = store
            .find_many(
                &filter,
                FindOptions {
                    sort: SortOrder::Descending,
                    skip: 1,
                    limit: Some(2),
                },
            )
            .await
            .unwrap();
        assert_eq!(desc.iter().map(|l| l.id).collect::<Vec<_>>(), vec![4, 3]);

        let all = store
            .find_many(&LabelFilter::default(), FindOptions::default())
            .await
            .unwrap();
        assert_eq!(all.len(), 6);
        assert!(all.windows(2).all(|w| w[0].id < w[1].id));
    }

    #[tokio::test]
    async fn test_update_by_id() {
        let store = connected().await;
        let stored = store.insert(label("did:plc:a", "spam")).await.unwrap();
        let flipped = SignedLabel {
            neg: true,
            ..stored.label.clone()
        };
        assert!(store.update_by_id(stored.id, &flipped).await.unwrap());
        assert!(!store.update_by_id(99, &flipped).await.unwrap());
        assert!(store.find_one(stored.id).await.unwrap().unwrap().label.neg);
        assert_eq!(store.len(), 1);
    }
}
