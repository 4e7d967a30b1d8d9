//! Room and session registries backing broadcast fan-out.
//!
//! The room registry is two mirrored maps kept under one lock so the sides
//! can never disagree: `room → members` and `channel → rooms`. Empty
//! buckets are pruned on the way out. The session registry maps sid to the
//! live channel.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;

use crate::channel::Channel;

#[derive(Default)]
pub struct RoomRegistry {
    inner: RwLock<RoomsInner>,
}

#[derive(Default)]
struct RoomsInner {
    /// room → sid → channel
    rooms: HashMap<String, HashMap<String, Arc<Channel>>>,
    /// sid → rooms joined
    memberships: HashMap<String, HashSet<String>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `channel` to `room`, creating the room on first join.
    pub fn join(&self, channel: &Arc<Channel>, room: &str) {
        let mut inner = self.inner.write();
        inner
            .rooms
            .entry(room.to_string())
            .or_default()
            .insert(channel.id().to_string(), channel.clone());
        inner
            .memberships
            .entry(channel.id().to_string())
            .or_default()
            .insert(room.to_string());
    }

    /// Remove `sid` from `room`, pruning the room bucket and the membership
    /// set if either becomes empty.
    pub fn leave(&self, sid: &str, room: &str) {
        let mut inner = self.inner.write();
        if let Some(bucket) = inner.rooms.get_mut(room) {
            bucket.remove(sid);
            if bucket.is_empty() {
                inner.rooms.remove(room);
            }
        }
        if let Some(set) = inner.memberships.get_mut(sid) {
            set.remove(room);
            if set.is_empty() {
                inner.memberships.remove(sid);
            }
        }
    }

    /// Snapshot of the room's members, taken under the read lock. Callers
    /// dispatch to the snapshot after the lock is released.
    pub fn members(&self, room: &str) -> Vec<Arc<Channel>> {
        let inner = self.inner.read();
        inner
            .rooms
            .get(room)
            .map(|bucket| bucket.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn rooms_of(&self, sid: &str) -> Vec<String> {
        let inner = self.inner.read();
        inner
            .memberships
            .get(sid)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn count(&self, room: &str) -> usize {
        let inner = self.inner.read();
        inner.rooms.get(room).map(|b| b.len()).unwrap_or(0)
    }

    pub fn count_rooms(&self) -> usize {
        self.inner.read().rooms.len()
    }

    /// Drop every membership of `sid` in one pass; used on disconnect.
    pub fn remove_channel(&self, sid: &str) {
        let mut inner = self.inner.write();
        let Some(rooms) = inner.memberships.remove(sid) else {
            return;
        };
        for room in rooms {
            if let Some(bucket) = inner.rooms.get_mut(&room) {
                bucket.remove(sid);
                if bucket.is_empty() {
                    inner.rooms.remove(&room);
                }
            }
        }
    }

    #[cfg(test)]
    fn is_consistent(&self) -> bool {
        let inner = self.inner.read();
        let forward = inner.rooms.iter().all(|(room, bucket)| {
            bucket.keys().all(|sid| {
                inner
                    .memberships
                    .get(sid)
                    .map(|set| set.contains(room))
                    .unwrap_or(false)
            })
        });
        let backward = inner.memberships.iter().all(|(sid, set)| {
            set.iter().all(|room| {
                inner
                    .rooms
                    .get(room)
                    .map(|bucket| bucket.contains_key(sid))
                    .unwrap_or(false)
            })
        });
        forward && backward
    }
}

/// sid → channel, one entry per alive channel.
#[derive(Default)]
pub struct SessionRegistry {
    inner: DashMap<String, Arc<Channel>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, channel: Arc<Channel>) {
        self.inner.insert(channel.id().to_string(), channel);
    }

    pub fn get(&self, sid: &str) -> Option<Arc<Channel>> {
        self.inner.get(sid).map(|entry| entry.value().clone())
    }

    pub fn remove(&self, sid: &str) {
        self.inner.remove(sid);
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Snapshot of every live channel, for whole-server broadcast.
    pub fn snapshot(&self) -> Vec<Arc<Channel>> {
        self.inner.iter().map(|entry| entry.value().clone()).collect()
    }
}
