//! Local copies of remote collections, kept in sync by change events.
//!
//! Every merge rule here is idempotent, so a change feed that delivers an
//! event twice (or delivers the echo of a row the initial load already
//! returned) cannot corrupt the list.

use crate::model::Id;
use derive_where::derive_where;
use time::OffsetDateTime;

/// A row that can live in a [`RecordList`].
pub trait Record {
    type Marker;

    fn id(&self) -> Id<Self::Marker>;

    fn created_at(&self) -> OffsetDateTime;
}

/// A row-level change observed on the backend.
#[derive_where(Clone; T: Clone)]
#[derive_where(Eq; T: Eq)]
#[derive_where(PartialEq; T: PartialEq)]
#[derive_where(Debug; T: std::fmt::Debug)]
pub enum Change<T: Record> {
    Insert(T),
    Delete(Id<T::Marker>),
}

/// What a change subscription hands to its consumer.
#[derive_where(Clone; T: Clone)]
#[derive_where(Eq; T: Eq)]
#[derive_where(PartialEq; T: PartialEq)]
#[derive_where(Debug; T: std::fmt::Debug)]
pub enum FeedEvent<T: Record> {
    Change(Change<T>),
    /// Events may have been lost; the consumer has to reload the scope.
    Lagged,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash)]
pub enum SortOrder {
    NewestFirst,
    OldestFirst,
}

#[derive_where(Clone; T: Clone)]
#[derive_where(Eq; T: Eq)]
#[derive_where(PartialEq; T: PartialEq)]
#[derive_where(Debug; T: std::fmt::Debug)]
pub struct RecordList<T> {
    order: SortOrder,
    records: Vec<T>,
}

impl<T: Record> RecordList<T> {
    #[must_use]
    pub fn new(order: SortOrder) -> Self {
        Self {
            order,
            records: Vec::new(),
        }
    }

    #[must_use]
    pub fn order(&self) -> SortOrder {
        self.order
    }

    /// Replaces the whole list with a freshly loaded set.
    ///
    /// The set is re-sorted and duplicate ids are dropped, so the list
    /// invariants hold even if the backend ignored the requested ordering.
    pub fn replace(&mut self, records: Vec<T>) {
        self.records.clear();
        for record in records {
            if !self.contains(record.id()) {
                self.records.push(record);
            }
        }

        match self.order {
            SortOrder::NewestFirst => self
                .records
                .sort_by(|a, b| b.created_at().cmp(&a.created_at())),
            SortOrder::OldestFirst => self
                .records
                .sort_by(|a, b| a.created_at().cmp(&b.created_at())),
        }
    }

    /// Applies a change, returning whether the list was modified.
    pub fn apply(&mut self, change: Change<T>) -> bool {
        match change {
            Change::Insert(record) => self.insert(record),
            Change::Delete(id) => self.remove(id).is_some(),
        }
    }

    /// Inserts `record` unless a record with the same id is already present.
    ///
    /// A new record lands in front of older ones when sorted newest first and
    /// behind records of equal age when sorted oldest first, which amounts to
    /// prepending or appending for events that arrive in commit order.
    pub fn insert(&mut self, record: T) -> bool {
        if self.contains(record.id()) {
            return false;
        }

        let created_at = record.created_at();
        let position = match self.order {
            SortOrder::NewestFirst => self
                .records
                .iter()
                .position(|existing| existing.created_at() <= created_at),
            SortOrder::OldestFirst => self
                .records
                .iter()
                .position(|existing| existing.created_at() > created_at),
        }
        .unwrap_or(self.records.len());

        self.records.insert(position, record);
        true
    }

    pub fn remove(&mut self, id: Id<T::Marker>) -> Option<T> {
        let position = self.records.iter().position(|record| record.id() == id)?;
        Some(self.records.remove(position))
    }

    #[must_use]
    pub fn get(&self, id: Id<T::Marker>) -> Option<&T> {
        self.records.iter().find(|record| record.id() == id)
    }

    #[must_use]
    pub fn contains(&self, id: Id<T::Marker>) -> bool {
        self.get(id).is_some()
    }

    #[must_use]
    pub fn as_slice(&self) -> &[T] {
        &self.records
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.records.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl<'a, T> IntoIterator for &'a RecordList<T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

#[derive(Clone, Eq, PartialEq, Debug, Hash)]
pub enum LoadState {
    Loading,
    Loaded,
    Failed(String),
}

/// A [`RecordList`] fed by both a full load and a change subscription.
///
/// The subscription is opened before the load is issued. Changes that arrive
/// while any load is in flight are applied right away and also remembered,
/// then replayed on top of every snapshot that comes back, since a snapshot
/// may predate them. Loads may overlap; the replay log is kept until the last
/// of them has finished.
#[derive_where(Clone; T: Clone)]
#[derive_where(Eq; T: Eq)]
#[derive_where(PartialEq; T: PartialEq)]
#[derive_where(Debug; T: std::fmt::Debug)]
pub struct SyncedList<T: Record> {
    list: RecordList<T>,
    state: LoadState,
    replay: Vec<Change<T>>,
    outstanding: usize,
}

impl<T: Record + Clone> SyncedList<T> {
    /// An empty list whose initial load has already been issued.
    #[must_use]
    pub fn new(order: SortOrder) -> Self {
        Self {
            list: RecordList::new(order),
            state: LoadState::Loading,
            replay: Vec::new(),
            outstanding: 1,
        }
    }

    #[must_use]
    pub fn list(&self) -> &RecordList<T> {
        &self.list
    }

    #[must_use]
    pub fn state(&self) -> &LoadState {
        &self.state
    }

    #[must_use]
    pub fn is_loading(&self) -> bool {
        self.state == LoadState::Loading
    }

    pub fn begin_load(&mut self) {
        if self.outstanding == 0 {
            self.replay.clear();
        }
        self.outstanding += 1;
        self.state = LoadState::Loading;
    }

    pub fn finish_load(&mut self, records: Vec<T>) {
        self.list.replace(records);
        for change in &self.replay {
            self.list.apply(change.clone());
        }
        if self.end_load() {
            self.state = LoadState::Loaded;
        }
    }

    /// Records a failed load. The previous contents stay untouched, and a
    /// later load still in flight decides the final state.
    pub fn fail_load(&mut self, message: String) {
        if self.end_load() {
            self.state = LoadState::Failed(message);
        }
    }

    /// Returns whether no load is in flight anymore.
    fn end_load(&mut self) -> bool {
        self.outstanding = self.outstanding.saturating_sub(1);
        if self.outstanding > 0 {
            return false;
        }

        self.replay.clear();
        true
    }

    pub fn apply(&mut self, change: Change<T>) -> bool {
        if self.outstanding > 0 {
            self.replay.push(change.clone());
        }
        self.list.apply(change)
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        cache::{Change, LoadState, RecordList, SortOrder, SyncedList},
        model::{
            Id,
            comment::Comment,
            post::{Post, PostId},
        },
    };
    use time::{Duration, OffsetDateTime, macros::datetime};
    use uuid::Uuid;

    const BASE: OffsetDateTime = datetime!(2025-06-01 12:00 UTC);

    fn post(title: &str, minutes: i64) -> Post {
        Post {
            id: Id::new(Uuid::new_v4()),
            user_id: Id::new(Uuid::new_v4()),
            title: title.to_owned(),
            content: format!("{title} body"),
            created_at: BASE + Duration::minutes(minutes),
        }
    }

    fn comment(post_id: PostId, minutes: i64) -> Comment {
        Comment {
            id: Id::new(Uuid::new_v4()),
            post_id,
            user_id: Id::new(Uuid::new_v4()),
            content: format!("comment at {minutes}"),
            created_at: BASE + Duration::minutes(minutes),
        }
    }

    fn titles(list: &RecordList<Post>) -> Vec<&str> {
        list.iter().map(|post| post.title.as_str()).collect()
    }

    #[test]
    fn loaded_posts_are_newest_first() {
        let mut list = RecordList::new(SortOrder::NewestFirst);
        list.replace(vec![post("b", 2), post("a", 1), post("c", 3), post("d", 0)]);

        assert_eq!(titles(&list), ["c", "b", "a", "d"]);
        for pair in list.as_slice().windows(2) {
            assert!(pair[0].created_at >= pair[1].created_at);
        }
    }

    #[test]
    fn replace_drops_duplicate_ids() {
        let first = post("a", 1);
        let mut list = RecordList::new(SortOrder::NewestFirst);
        list.replace(vec![first.clone(), first.clone(), post("b", 2)]);

        assert_eq!(list.len(), 2);
    }

    #[test]
    fn insert_is_idempotent() {
        let mut list = RecordList::new(SortOrder::NewestFirst);
        list.replace(vec![post("old", 0)]);
        let new = post("new", 5);

        assert!(list.apply(Change::Insert(new.clone())));
        let once = list.clone();
        assert!(!list.apply(Change::Insert(new)));

        assert_eq!(list, once);
        assert_eq!(titles(&list), ["new", "old"]);
    }

    #[test]
    fn delete_of_unknown_id_is_a_no_op() {
        let mut list = RecordList::new(SortOrder::NewestFirst);
        list.replace(vec![post("a", 0), post("b", 1)]);
        let before = list.clone();

        assert!(!list.apply(Change::Delete(Id::new(Uuid::new_v4()))));
        assert_eq!(list, before);
    }

    #[test]
    fn delete_removes_matching_record() {
        let target = post("target", 1);
        let mut list = RecordList::new(SortOrder::NewestFirst);
        list.replace(vec![post("a", 0), target.clone()]);

        assert!(list.apply(Change::Delete(target.id)));
        assert!(!list.contains(target.id));
        assert!(!list.apply(Change::Delete(target.id)));
        assert_eq!(titles(&list), ["a"]);
    }

    #[test]
    fn newest_first_insert_goes_to_head() {
        let mut list = RecordList::new(SortOrder::NewestFirst);
        list.replace(vec![post("a", 0), post("b", 1)]);

        list.insert(post("same-age", 1));
        list.insert(post("late-arrival", -1));

        assert_eq!(titles(&list), ["same-age", "b", "a", "late-arrival"]);
    }

    #[test]
    fn events_during_load_survive_an_older_snapshot() {
        let existing = post("existing", 0);
        let gone = post("gone", 1);
        let fresh = post("fresh", 2);

        let mut synced = SyncedList::new(SortOrder::NewestFirst);
        assert!(synced.is_loading());

        synced.apply(Change::Insert(fresh.clone()));
        synced.apply(Change::Delete(gone.id));
        synced.finish_load(vec![existing.clone(), gone.clone()]);

        assert_eq!(synced.state(), &LoadState::Loaded);
        assert_eq!(titles(synced.list()), ["fresh", "existing"]);

        synced.apply(Change::Insert(fresh));
        assert_eq!(synced.list().len(), 2);
    }

    #[test]
    fn failed_reload_keeps_previous_contents() {
        let mut synced = SyncedList::new(SortOrder::NewestFirst);
        synced.finish_load(vec![post("kept", 0)]);

        synced.begin_load();
        synced.fail_load("boom".to_owned());

        assert_eq!(synced.state(), &LoadState::Failed("boom".to_owned()));
        assert_eq!(titles(synced.list()), ["kept"]);
    }

    #[test]
    fn overlapping_loads_keep_replaying_until_the_last_one() {
        let old = post("old", 0);
        let late = post("late", 5);

        let mut synced = SyncedList::new(SortOrder::NewestFirst);
        synced.finish_load(vec![old.clone()]);

        synced.begin_load();
        synced.begin_load();
        synced.finish_load(vec![old.clone()]);
        assert!(synced.is_loading());

        synced.apply(Change::Insert(late));
        synced.finish_load(vec![old.clone()]);

        assert_eq!(synced.state(), &LoadState::Loaded);
        assert_eq!(titles(synced.list()), ["late", "old"]);
    }

    #[test]
    fn failure_of_an_overlapped_load_waits_for_the_other() {
        let mut synced = SyncedList::new(SortOrder::NewestFirst);
        synced.begin_load();

        synced.fail_load("boom".to_owned());
        assert!(synced.is_loading());

        synced.finish_load(vec![post("a", 0)]);
        assert_eq!(synced.state(), &LoadState::Loaded);
    }

    #[test]
    fn oldest_first_insert_goes_to_tail() {
        let post_id = Id::new(Uuid::new_v4());
        let first = comment(post_id, 0);
        let second = comment(post_id, 1);
        let third = comment(post_id, 1);

        let mut list = RecordList::new(SortOrder::OldestFirst);
        list.replace(vec![second.clone(), first.clone()]);
        list.insert(third.clone());

        let ids: Vec<_> = list.iter().map(|comment| comment.id).collect();
        assert_eq!(ids, [first.id, second.id, third.id]);
    }
}
