//! Pure reconciliation state for one room's media list.
//!
//! The list is kept newest first with no duplicate ids. Local optimistic
//! mutations leave a [`PendingOp`] behind until the server confirms them,
//! either through a change-feed event or through a reload that already
//! reflects them.

use std::collections::{BTreeSet, HashMap, HashSet};

use snapshare_model::{MediaId, MediaItem, RoomId, RoomMediaEvent};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FeedPhase {
    /// No authoritative list yet. `last_error` is set when the last load
    /// failed; a manual refresh is the way out.
    Loading { last_error: Option<String> },
    Ready,
}

impl FeedPhase {
    pub fn is_ready(&self) -> bool {
        matches!(self, FeedPhase::Ready)
    }
}

/// A local mutation that has not been confirmed by the server yet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PendingOp {
    Insertion(MediaItem),
    Removal,
}

/// What applying a remote event did to the list.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RemoteChange {
    Inserted,
    /// The item was present and has been removed.
    Removed(MediaItem),
    /// Duplicate, stale, suppressed or foreign event.
    Unchanged,
}

/// Position of a listing request in the feed's mutation order, taken with
/// [`RoomFeedState::begin_load`] before the request goes out.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct LoadTicket(u64);

#[derive(Clone, Debug)]
struct Marker {
    op: PendingOp,
    seq: u64,
}

/// Remote change applied while a listing was in flight.
#[derive(Clone, Debug)]
enum LateChange {
    Inserted(MediaItem),
    Deleted,
}

#[derive(Clone, Debug)]
pub struct RoomFeedState {
    room_id: RoomId,
    items: Vec<MediaItem>,
    ids: HashSet<MediaId>,
    pending: HashMap<MediaId, Marker>,
    /// Latest remote change per id, kept only while some listing that
    /// predates it may still land.
    late: HashMap<MediaId, (u64, LateChange)>,
    loads_in_flight: BTreeSet<u64>,
    last_applied: u64,
    seq: u64,
    phase: FeedPhase,
}

impl RoomFeedState {
    pub fn new(room_id: RoomId) -> Self {
        Self {
            room_id,
            items: Vec::new(),
            ids: HashSet::new(),
            pending: HashMap::new(),
            late: HashMap::new(),
            loads_in_flight: BTreeSet::new(),
            last_applied: 0,
            seq: 0,
            phase: FeedPhase::Loading { last_error: None },
        }
    }

    pub fn room_id(&self) -> RoomId {
        self.room_id
    }

    pub fn items(&self) -> &[MediaItem] {
        &self.items
    }

    pub fn phase(&self) -> &FeedPhase {
        &self.phase
    }

    pub fn contains(&self, id: MediaId) -> bool {
        self.ids.contains(&id)
    }

    pub fn get(&self, id: MediaId) -> Option<&MediaItem> {
        if !self.contains(id) {
            return None;
        }
        self.items.iter().find(|item| item.id == id)
    }

    pub fn pending(&self, id: MediaId) -> Option<&PendingOp> {
        self.pending.get(&id).map(|marker| &marker.op)
    }

    pub fn is_pending_removal(&self, id: MediaId) -> bool {
        matches!(self.pending(id), Some(PendingOp::Removal))
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Register a listing request about to be sent.
    pub fn begin_load(&mut self) -> LoadTicket {
        let seq = self.next_seq();
        self.loads_in_flight.insert(seq);
        LoadTicket(seq)
    }

    /// Forget a listing request that will never complete.
    pub fn abandon_load(&mut self, ticket: LoadTicket) {
        self.finish_load(ticket);
    }

    /// Replace the list with the server listing requested at `ticket`.
    ///
    /// Remote changes applied after the request went out are laid over the
    /// listing, then local operations the server cannot have seen yet are
    /// replayed. An insertion persisted before the request is confirmed by
    /// it: if the listing lacks the item, it was deleted on the server.
    ///
    /// Returns `false` and changes nothing when a newer listing has already
    /// been applied or the state was cleared after the request.
    pub fn replace_with_server(&mut self, listing: Vec<MediaItem>, ticket: LoadTicket) -> bool {
        if ticket.0 <= self.last_applied {
            self.finish_load(ticket);
            return false;
        }

        let mut ids = HashSet::with_capacity(listing.len());
        let mut items: Vec<MediaItem> = Vec::with_capacity(listing.len());
        for item in listing {
            if item.room_id == self.room_id && ids.insert(item.id) {
                items.push(item);
            }
        }

        let mut dropped = HashSet::new();
        for (id, (seq, change)) in &self.late {
            if *seq <= ticket.0 {
                continue;
            }
            match change {
                LateChange::Inserted(item) => {
                    if ids.insert(*id) {
                        items.push(item.clone());
                    }
                }
                LateChange::Deleted => {
                    if ids.remove(id) {
                        dropped.insert(*id);
                    }
                }
            }
        }

        self.pending.retain(|id, marker| {
            let on_server = ids.contains(id);
            match marker.op {
                PendingOp::Insertion(_) => !on_server && marker.seq > ticket.0,
                PendingOp::Removal => on_server,
            }
        });

        for (id, marker) in &self.pending {
            match &marker.op {
                PendingOp::Insertion(item) => {
                    if ids.insert(*id) {
                        items.push(item.clone());
                    }
                }
                PendingOp::Removal => {
                    if ids.remove(id) {
                        dropped.insert(*id);
                    }
                }
            }
        }
        if !dropped.is_empty() {
            items.retain(|item| !dropped.contains(&item.id));
        }

        items.sort_by(MediaItem::feed_order);
        self.items = items;
        self.ids = ids;
        self.last_applied = ticket.0;
        self.phase = FeedPhase::Ready;
        self.finish_load(ticket);
        true
    }

    /// Record a failed listing request. A failure older than the listing on
    /// display leaves the phase alone.
    pub fn mark_load_failed(&mut self, ticket: LoadTicket, error: impl Into<String>) {
        self.finish_load(ticket);
        if ticket.0 <= self.last_applied {
            return;
        }
        self.phase = FeedPhase::Loading {
            last_error: Some(error.into()),
        };
    }

    /// Optimistically insert a just-persisted item. Returns `false` when the
    /// id is already listed or awaiting removal.
    pub fn apply_local_insert(&mut self, item: MediaItem) -> bool {
        if item.room_id != self.room_id
            || self.contains(item.id)
            || self.is_pending_removal(item.id)
        {
            return false;
        }
        let seq = self.next_seq();
        self.pending.insert(
            item.id,
            Marker {
                op: PendingOp::Insertion(item.clone()),
                seq,
            },
        );
        self.insert_sorted(item);
        true
    }

    /// Optimistically remove `ids`, returning the items that were listed.
    /// Each id stays suppressed until a confirmed delete arrives.
    pub fn apply_local_remove(&mut self, ids: &[MediaId]) -> Vec<MediaItem> {
        let mut removed = Vec::new();
        for id in ids {
            let seq = self.next_seq();
            self.pending.insert(
                *id,
                Marker {
                    op: PendingOp::Removal,
                    seq,
                },
            );
            if let Some(item) = self.remove_listed(*id) {
                removed.push(item);
            }
        }
        removed
    }

    /// Drop removal markers for a delete the server rejected. The items come
    /// back with the next reload.
    pub fn cancel_removals(&mut self, ids: &[MediaId]) {
        for id in ids {
            if self.is_pending_removal(*id) {
                self.pending.remove(id);
            }
        }
    }

    /// Apply one change-feed event, in delivery order.
    pub fn apply_remote(&mut self, event: &RoomMediaEvent) -> RemoteChange {
        if event.room_id() != self.room_id {
            return RemoteChange::Unchanged;
        }
        match event {
            RoomMediaEvent::Inserted { item } => {
                if matches!(self.pending(item.id), Some(PendingOp::Insertion(_))) {
                    self.pending.remove(&item.id);
                }
                if self.is_pending_removal(item.id) {
                    return RemoteChange::Unchanged;
                }
                self.note_late(item.id, LateChange::Inserted(item.clone()));
                if self.contains(item.id) {
                    return RemoteChange::Unchanged;
                }
                self.insert_sorted(item.clone());
                RemoteChange::Inserted
            }
            RoomMediaEvent::Deleted { id, .. } => {
                self.pending.remove(id);
                self.note_late(*id, LateChange::Deleted);
                match self.remove_listed(*id) {
                    Some(item) => RemoteChange::Removed(item),
                    None => RemoteChange::Unchanged,
                }
            }
        }
    }

    /// Forget everything, e.g. when the room is exited.
    pub fn clear(&mut self) {
        self.items.clear();
        self.ids.clear();
        self.pending.clear();
        self.late.clear();
        self.loads_in_flight.clear();
        // Listings requested before this point are stale.
        self.last_applied = self.seq;
        self.phase = FeedPhase::Loading { last_error: None };
    }

    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn finish_load(&mut self, ticket: LoadTicket) {
        self.loads_in_flight.remove(&ticket.0);
        match self.loads_in_flight.first().copied() {
            Some(oldest) => self.late.retain(|_, (seq, _)| *seq > oldest),
            None => self.late.clear(),
        }
    }

    fn note_late(&mut self, id: MediaId, change: LateChange) {
        if self.loads_in_flight.is_empty() {
            return;
        }
        let seq = self.next_seq();
        self.late.insert(id, (seq, change));
    }

    fn remove_listed(&mut self, id: MediaId) -> Option<MediaItem> {
        if !self.ids.remove(&id) {
            return None;
        }
        let pos = self.items.iter().position(|item| item.id == id)?;
        Some(self.items.remove(pos))
    }

    fn insert_sorted(&mut self, item: MediaItem) {
        let pos = self
            .items
            .partition_point(|existing| existing.feed_order(&item).is_lt());
        self.ids.insert(item.id);
        self.items.insert(pos, item);
    }
}
