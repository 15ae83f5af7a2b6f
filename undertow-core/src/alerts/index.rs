//! Subscriber lookup by (kind, handle).
//!
//! Both halves of the key have a wildcard (`None`) entry. An alert is looked
//! up under the cross product of {its kind, any kind} x {its handle, any
//! handle}, so routing cost depends on the number of matching subscribers
//! rather than the number of live ones.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use crate::engine::{Alert, AlertKind, TorrentHandle};

/// Identifies one live subscription within a driver.
pub type SubscriberId = u64;

/// What a subscription wants to see.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AlertFilter {
    /// Empty means every kind.
    pub kinds: Vec<AlertKind>,
    /// `None` means every handle, including alerts without one.
    pub handle: Option<TorrentHandle>,
}

impl AlertFilter {
    pub fn new(kinds: impl IntoIterator<Item = AlertKind>, handle: Option<TorrentHandle>) -> Self {
        let mut kinds: Vec<_> = kinds.into_iter().collect();
        kinds.sort();
        kinds.dedup();
        Self { kinds, handle }
    }

    pub fn matches(&self, alert: &Alert) -> bool {
        let kind_ok = self.kinds.is_empty() || self.kinds.contains(&alert.kind());
        let handle_ok = match self.handle {
            None => true,
            Some(handle) => alert.handle() == Some(handle),
        };
        kind_ok && handle_ok
    }

    fn kind_keys(&self) -> Vec<Option<AlertKind>> {
        if self.kinds.is_empty() {
            vec![None]
        } else {
            self.kinds.iter().copied().map(Some).collect()
        }
    }
}

type HandleMap = HashMap<Option<TorrentHandle>, BTreeSet<SubscriberId>>;

/// Two-level index of live subscriptions.
#[derive(Debug, Default)]
pub struct SubscriberIndex {
    by_kind: HashMap<Option<AlertKind>, HandleMap>,
}

impl SubscriberIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: SubscriberId, filter: &AlertFilter) {
        for kind in filter.kind_keys() {
            self.by_kind
                .entry(kind)
                .or_default()
                .entry(filter.handle)
                .or_default()
                .insert(id);
        }
    }

    /// Removes `id`, pruning empty buckets so the index does not grow with
    /// churn.
    pub fn remove(&mut self, id: SubscriberId, filter: &AlertFilter) {
        for kind in filter.kind_keys() {
            let Some(handles) = self.by_kind.get_mut(&kind) else {
                continue;
            };
            if let Some(ids) = handles.get_mut(&filter.handle) {
                ids.remove(&id);
                if ids.is_empty() {
                    handles.remove(&filter.handle);
                }
            }
            if handles.is_empty() {
                self.by_kind.remove(&kind);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.by_kind.is_empty()
    }

    /// Subscribers whose filter matches `alert`.
    pub fn lookup(&self, alert: &Alert) -> BTreeSet<SubscriberId> {
        let kinds = [Some(alert.kind()), None];
        let handles: &[Option<TorrentHandle>] = match alert.handle() {
            Some(handle) => &[Some(handle), None],
            None => &[None],
        };

        let mut matched = BTreeSet::new();
        for kind in kinds {
            let Some(by_handle) = self.by_kind.get(&kind) else {
                continue;
            };
            for handle in handles {
                if let Some(ids) = by_handle.get(handle) {
                    matched.extend(ids.iter().copied());
                }
            }
        }
        matched
    }

    /// Splits a batch into per-subscriber slices, keeping batch order within
    /// each slice. Subscribers with no match are absent from the result.
    pub fn route(&self, alerts: &[Arc<Alert>]) -> BTreeMap<SubscriberId, Vec<Arc<Alert>>> {
        let mut slices: BTreeMap<SubscriberId, Vec<Arc<Alert>>> = BTreeMap::new();
        for alert in alerts {
            for id in self.lookup(alert) {
                slices.entry(id).or_default().push(Arc::clone(alert));
            }
        }
        slices
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::engine::PieceIndex;

    fn handle(slot: u32) -> TorrentHandle {
        TorrentHandle::new(slot, 1)
    }

    fn make_alert(kind: u8, slot: Option<u32>) -> Alert {
        match (kind % 3, slot) {
            (0, Some(slot)) => Alert::PieceFinished {
                handle: handle(slot),
                name: format!("t{slot}"),
                piece: PieceIndex(0),
            },
            (1, Some(slot)) => Alert::TorrentRemoved {
                handle: handle(slot),
                name: format!("t{slot}"),
            },
            (2, Some(slot)) => Alert::TorrentChecked {
                handle: handle(slot),
                name: format!("t{slot}"),
            },
            _ => Alert::Log {
                message: "log".to_string(),
            },
        }
    }

    #[test]
    fn test_lookup_uses_wildcards() {
        let mut index = SubscriberIndex::new();
        index.insert(1, &AlertFilter::default());
        index.insert(2, &AlertFilter::new([AlertKind::TorrentRemoved], None));
        index.insert(3, &AlertFilter::new(Vec::new(), Some(handle(7))));
        index.insert(
            4,
            &AlertFilter::new([AlertKind::TorrentRemoved], Some(handle(8))),
        );

        let removed_7 = make_alert(1, Some(7));
        assert_eq!(
            index.lookup(&removed_7).into_iter().collect::<Vec<_>>(),
            vec![1, 2, 3]
        );

        let log = make_alert(0, None);
        assert_eq!(index.lookup(&log).into_iter().collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn test_remove_prunes_buckets() {
        let mut index = SubscriberIndex::new();
        let filter = AlertFilter::new([AlertKind::ReadPiece, AlertKind::TorrentRemoved], Some(handle(1)));
        index.insert(9, &filter);
        assert!(!index.is_empty());
        index.remove(9, &filter);
        assert!(index.is_empty());
    }

    #[test]
    fn test_duplicate_kinds_are_collapsed() {
        let filter = AlertFilter::new(
            [AlertKind::ReadPiece, AlertKind::ReadPiece, AlertKind::Log],
            None,
        );
        assert_eq!(filter.kinds, vec![AlertKind::ReadPiece, AlertKind::Log]);
    }

    fn filter_strategy() -> impl Strategy<Value = AlertFilter> {
        let kinds = prop::collection::vec(
            prop::sample::select(vec![
                AlertKind::PieceFinished,
                AlertKind::TorrentRemoved,
                AlertKind::TorrentChecked,
                AlertKind::Log,
            ]),
            0..3,
        );
        let handle = prop::option::of(0u32..3).prop_map(|slot| slot.map(handle));
        (kinds, handle).prop_map(|(kinds, handle)| AlertFilter::new(kinds, handle))
    }

    proptest! {
        #[test]
        fn prop_route_matches_filters_in_order(
            filters in prop::collection::vec(filter_strategy(), 0..8),
            raw_alerts in prop::collection::vec((any::<u8>(), prop::option::of(0u32..3)), 0..32),
        ) {
            let mut index = SubscriberIndex::new();
            for (id, filter) in filters.iter().enumerate() {
                index.insert(id as SubscriberId, filter);
            }
            let alerts: Vec<Arc<Alert>> = raw_alerts
                .iter()
                .map(|(kind, slot)| Arc::new(make_alert(*kind, *slot)))
                .collect();

            let routed = index.route(&alerts);

            for (id, filter) in filters.iter().enumerate() {
                let expected: Vec<*const Alert> = alerts
                    .iter()
                    .filter(|alert| filter.matches(alert))
                    .map(Arc::as_ptr)
                    .collect();
                let got: Vec<*const Alert> = routed
                    .get(&(id as SubscriberId))
                    .map(|slice| slice.iter().map(Arc::as_ptr).collect())
                    .unwrap_or_default();
                prop_assert_eq!(got, expected);
            }
        }

        #[test]
        fn prop_insert_then_remove_leaves_index_empty(
            filters in prop::collection::vec(filter_strategy(), 0..8),
        ) {
            let mut index = SubscriberIndex::new();
            for (id, filter) in filters.iter().enumerate() {
                index.insert(id as SubscriberId, filter);
            }
            for (id, filter) in filters.iter().enumerate().rev() {
                index.remove(id as SubscriberId, filter);
            }
            prop_assert!(index.is_empty());
        }
    }
}
