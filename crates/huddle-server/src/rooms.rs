//! Room registry: the catalog of rooms and their membership rules.
//!
//! Every room sits behind its own async mutex. Callers take a [`RoomGuard`]
//! via [`RoomRegistry::lock`] and keep it for the whole operation, including
//! any channel work that follows, so membership changes and room appends are
//! linearized per room.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use huddle_shared::constants::{KDF_CONTEXT_ROOM_PASSWORD, MAX_ROOM_NAME_LEN};
use huddle_shared::{ChannelId, ChatError, ChatResult, IdentityId, RoomSummary};
use huddle_store::RoomRecord;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::info;

use crate::identity::{hash_off_thread, verify_off_thread};
use crate::persist::{self, SharedStore};

pub struct RoomState {
    record: RoomRecord,
    /// Set once the room is gone; late lockers treat it as missing.
    deleted: bool,
}

impl RoomState {
    fn new(record: RoomRecord) -> Self {
        Self {
            record,
            deleted: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.record.name
    }

    pub fn channel(&self) -> ChannelId {
        ChannelId::room(self.record.name.clone())
    }

    pub fn is_member(&self, identity: &IdentityId) -> bool {
        self.record.members.contains(identity)
    }

    pub fn is_admin(&self, identity: &IdentityId) -> bool {
        self.record.admins.contains(identity)
    }

    pub fn is_invited(&self, identity: &IdentityId) -> bool {
        self.record.invited.contains(identity)
    }

    pub fn members(&self) -> impl Iterator<Item = &IdentityId> {
        self.record.members.iter()
    }

    pub fn summary(&self) -> RoomSummary {
        RoomSummary {
            name: self.record.name.clone(),
            is_private: self.record.is_private,
            creator: self.record.creator.clone(),
            admins: self.record.admins.iter().cloned().collect(),
            members: self.record.members.iter().cloned().collect(),
            created_at: self.record.created_at,
        }
    }

    /// Membership reads require membership.
    pub fn require_member(&self, identity: &IdentityId) -> ChatResult<()> {
        if self.is_member(identity) {
            Ok(())
        } else {
            Err(ChatError::NotAMember)
        }
    }

    #[cfg(test)]
    pub fn assert_invariants(&self) {
        let r = &self.record;
        assert!(r.admins.contains(&r.creator), "creator must be an admin");
        assert!(r.members.contains(&r.creator), "creator must be a member");
        assert!(r.admins.is_subset(&r.members), "admins must be members");
        if r.is_private {
            assert!(r.password_hash.is_some(), "private room without password");
        }
    }
}

pub type RoomGuard = OwnedMutexGuard<RoomState>;

pub struct RoomRegistry {
    rooms: DashMap<String, Arc<Mutex<RoomState>>>,
    store: SharedStore,
}

impl RoomRegistry {
    pub fn new(store: SharedStore, existing: Vec<RoomRecord>) -> Self {
        let rooms = existing
            .into_iter()
            .map(|record| (record.name.clone(), Arc::new(Mutex::new(RoomState::new(record)))))
            .collect();
        Self { rooms, store }
    }

    /// Lock a room for the duration of an operation.
    pub async fn lock(&self, name: &str) -> ChatResult<RoomGuard> {
        let room = self
            .rooms
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(ChatError::RoomNotFound)?;

        let guard = room.lock_owned().await;
        if guard.deleted {
            return Err(ChatError::RoomNotFound);
        }
        Ok(guard)
    }

    pub async fn create(
        &self,
        name: &str,
        is_private: bool,
        password: Option<&str>,
        creator: &IdentityId,
    ) -> ChatResult<RoomSummary> {
        validate_room_name(name)?;
        let password = password.filter(|p| !p.is_empty());
        if is_private && password.is_none() {
            return Err(ChatError::PasswordRequired);
        }

        let password_hash = match password.filter(|_| is_private) {
            Some(p) => Some(hash_off_thread(KDF_CONTEXT_ROOM_PASSWORD, p).await?),
            None => None,
        };

        let record = RoomRecord {
            name: name.to_string(),
            is_private,
            password_hash,
            creator: creator.clone(),
            admins: BTreeSet::from([creator.clone()]),
            members: BTreeSet::from([creator.clone()]),
            invited: BTreeSet::new(),
            created_at: Utc::now(),
        };

        // Reserve the name with the room already locked, so nobody can see
        // it until it is persisted.
        let room = Arc::new(Mutex::new(RoomState::new(record.clone())));
        let mut guard = Arc::clone(&room).lock_owned().await;
        match self.rooms.entry(name.to_string()) {
            Entry::Occupied(_) => return Err(ChatError::RoomNameTaken),
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&room));
            }
        }

        if let Err(e) = persist::write(&self.store, "insert_room", move |s| s.insert_room(&record)).await
        {
            guard.deleted = true;
            self.rooms.remove_if(name, |_, existing| Arc::ptr_eq(existing, &room));
            return Err(e);
        }

        info!(room = %name, creator = %creator, is_private, "Room created");
        Ok(guard.summary())
    }

    /// Returns `true` if `identity` was not a member before.
    pub async fn join(
        &self,
        room: &mut RoomGuard,
        identity: &IdentityId,
        password: Option<&str>,
    ) -> ChatResult<bool> {
        if room.is_member(identity) {
            return Ok(false);
        }

        if room.record.is_private && !room.is_invited(identity) {
            let ok = match (password, room.record.password_hash.as_deref()) {
                (Some(given), Some(hash)) => {
                    verify_off_thread(KDF_CONTEXT_ROOM_PASSWORD, given, hash).await
                }
                _ => false,
            };
            if !ok {
                return Err(ChatError::WrongPassword);
            }
        }

        let name = room.record.name.clone();
        let who = identity.clone();
        persist::write(&self.store, "admit_member", move |s| s.admit_member(&name, &who)).await?;

        room.record.invited.remove(identity);
        room.record.members.insert(identity.clone());
        info!(room = %room.name(), identity = %identity, "Member joined");
        Ok(true)
    }

    pub async fn kick(
        &self,
        room: &mut RoomGuard,
        requester: &IdentityId,
        target: &IdentityId,
    ) -> ChatResult<()> {
        if !room.is_admin(requester) {
            return Err(ChatError::NotAuthorized);
        }
        if room.is_admin(target) {
            return Err(ChatError::CannotKickAdmin);
        }
        if !room.is_member(target) {
            return Err(ChatError::NotAMember);
        }

        let name = room.record.name.clone();
        let who = target.clone();
        persist::write(&self.store, "remove_member", move |s| s.remove_member(&name, &who)).await?;

        room.record.members.remove(target);
        info!(room = %room.name(), requester = %requester, target = %target, "Member kicked");
        Ok(())
    }

    /// Returns `true` if a new invite was recorded.
    pub async fn invite(
        &self,
        room: &mut RoomGuard,
        inviter: &IdentityId,
        target: &IdentityId,
    ) -> ChatResult<bool> {
        room.require_member(inviter)?;
        if room.is_member(target) || room.is_invited(target) {
            return Ok(false);
        }

        let name = room.record.name.clone();
        let who = target.clone();
        persist::write(&self.store, "add_invite", move |s| s.add_invite(&name, &who)).await?;

        room.record.invited.insert(target.clone());
        info!(room = %room.name(), inviter = %inviter, target = %target, "Invite recorded");
        Ok(true)
    }

    /// Only the creator may delete. The room stays registered (and its name
    /// taken) until [`RoomRegistry::unlist`], so the caller can clear the
    /// room's channel state first.
    pub async fn delete(&self, room: &mut RoomGuard, requester: &IdentityId) -> ChatResult<()> {
        if &room.record.creator != requester {
            return Err(ChatError::NotAuthorized);
        }

        let name = room.record.name.clone();
        persist::write(&self.store, "delete_room", move |s| s.delete_room(&name)).await?;

        room.deleted = true;
        info!(room = %room.name(), "Room deleted");
        Ok(())
    }

    /// Release a deleted room's name.
    pub fn unlist(&self, room: &RoomGuard) {
        if !room.deleted {
            return;
        }
        let slot = OwnedMutexGuard::mutex(room);
        self.rooms
            .remove_if(room.name(), |_, existing| Arc::ptr_eq(existing, slot));
    }

    /// Every room, ordered by name.
    pub async fn list(&self) -> Vec<RoomSummary> {
        let rooms: Vec<Arc<Mutex<RoomState>>> =
            self.rooms.iter().map(|e| Arc::clone(e.value())).collect();

        let mut summaries = Vec::with_capacity(rooms.len());
        for room in rooms {
            let state = room.lock().await;
            if !state.deleted {
                summaries.push(state.summary());
            }
        }
        summaries.sort_by(|a, b| a.name.cmp(&b.name));
        summaries
    }
}

fn validate_room_name(name: &str) -> ChatResult<()> {
    let len = name.chars().count();
    if name.trim().is_empty() || len > MAX_ROOM_NAME_LEN {
        return Err(ChatError::InvalidRequest(format!(
            "room name must be 1-{MAX_ROOM_NAME_LEN} characters"
        )));
    }
    if name.chars().any(char::is_control) {
        return Err(ChatError::InvalidRequest(
            "room name must not contain control characters".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use huddle_store::EphemeralStore;

    use crate::persist::testing::FlakyStore;

    fn registry() -> RoomRegistry {
        RoomRegistry::new(Arc::new(EphemeralStore), Vec::new())
    }

    fn id(name: &str) -> IdentityId {
        name.into()
    }

    #[tokio::test]
    async fn create_sets_creator_as_admin_and_member() {
        let rooms = registry();
        let summary = rooms.create("general", false, None, &id("alice")).await.unwrap();
        assert_eq!(summary.admins, vec![id("alice")]);
        assert_eq!(summary.members, vec![id("alice")]);
        rooms.lock("general").await.unwrap().assert_invariants();
    }

    #[tokio::test]
    async fn names_are_unique_and_case_sensitive() {
        let rooms = registry();
        rooms.create("general", false, None, &id("alice")).await.unwrap();
        assert_eq!(
            rooms.create("general", false, None, &id("bob")).await,
            Err(ChatError::RoomNameTaken)
        );
        rooms.create("General", false, None, &id("bob")).await.unwrap();
        assert_eq!(rooms.list().await.len(), 2);
    }

    #[tokio::test]
    async fn private_room_needs_password() {
        let rooms = registry();
        assert_eq!(
            rooms.create("vip", true, None, &id("alice")).await,
            Err(ChatError::PasswordRequired)
        );
        assert_eq!(
            rooms.create("vip", true, Some(""), &id("alice")).await,
            Err(ChatError::PasswordRequired)
        );
        assert!(rooms.lock("vip").await.is_err());
    }

    #[tokio::test]
    async fn wrong_password_never_adds_member() {
        let rooms = registry();
        rooms.create("vip", true, Some("s3cret"), &id("alice")).await.unwrap();

        let mut room = rooms.lock("vip").await.unwrap();
        assert_eq!(
            rooms.join(&mut room, &id("bob"), Some("guess")).await,
            Err(ChatError::WrongPassword)
        );
        assert_eq!(
            rooms.join(&mut room, &id("bob"), None).await,
            Err(ChatError::WrongPassword)
        );
        assert!(!room.is_member(&id("bob")));

        assert_eq!(rooms.join(&mut room, &id("bob"), Some("s3cret")).await, Ok(true));
        assert_eq!(rooms.join(&mut room, &id("bob"), None).await, Ok(false));
        room.assert_invariants();
    }

    #[tokio::test]
    async fn invite_lets_target_in_once() {
        let rooms = registry();
        rooms.create("vip", true, Some("pw"), &id("alice")).await.unwrap();
        let mut room = rooms.lock("vip").await.unwrap();

        assert_eq!(
            rooms.invite(&mut room, &id("mallory"), &id("bob")).await,
            Err(ChatError::NotAMember)
        );
        assert_eq!(rooms.invite(&mut room, &id("alice"), &id("bob")).await, Ok(true));
        assert!(!room.is_member(&id("bob")));
        assert_eq!(rooms.join(&mut room, &id("bob"), None).await, Ok(true));
        assert!(!room.is_invited(&id("bob")));
        assert_eq!(rooms.invite(&mut room, &id("alice"), &id("bob")).await, Ok(false));
    }

    #[tokio::test]
    async fn kick_rules() {
        let rooms = registry();
        rooms.create("general", false, None, &id("alice")).await.unwrap();
        let mut room = rooms.lock("general").await.unwrap();
        rooms.join(&mut room, &id("bob"), None).await.unwrap();
        rooms.join(&mut room, &id("carol"), None).await.unwrap();

        assert_eq!(
            rooms.kick(&mut room, &id("bob"), &id("carol")).await,
            Err(ChatError::NotAuthorized)
        );
        assert_eq!(
            rooms.kick(&mut room, &id("alice"), &id("alice")).await,
            Err(ChatError::CannotKickAdmin)
        );
        assert_eq!(
            rooms.kick(&mut room, &id("alice"), &id("dave")).await,
            Err(ChatError::NotAMember)
        );
        rooms.kick(&mut room, &id("alice"), &id("bob")).await.unwrap();
        assert!(!room.is_member(&id("bob")));
        room.assert_invariants();
    }

    #[tokio::test]
    async fn delete_is_creator_only_and_final() {
        let rooms = registry();
        rooms.create("general", false, None, &id("alice")).await.unwrap();
        {
            let mut room = rooms.lock("general").await.unwrap();
            rooms.join(&mut room, &id("bob"), None).await.unwrap();
            assert_eq!(
                rooms.delete(&mut room, &id("bob")).await,
                Err(ChatError::NotAuthorized)
            );
            rooms.delete(&mut room, &id("alice")).await.unwrap();

            // Still registered until unlisted.
            assert_eq!(
                rooms.create("general", false, None, &id("bob")).await,
                Err(ChatError::RoomNameTaken)
            );
            rooms.unlist(&room);
        }
        assert!(matches!(rooms.lock("general").await, Err(ChatError::RoomNotFound)));
        assert!(rooms.list().await.is_empty());

        // The name is free again.
        rooms.create("general", false, None, &id("bob")).await.unwrap();
    }

    #[tokio::test]
    async fn list_is_ordered_by_name() {
        let rooms = registry();
        for name in ["zeta", "alpha", "mid"] {
            rooms.create(name, false, None, &id("alice")).await.unwrap();
        }
        let names: Vec<String> = rooms.list().await.into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["alpha", "mid", "zeta"]);
    }

    #[tokio::test]
    async fn failed_create_releases_name() {
        let store = Arc::new(FlakyStore::default());
        let rooms = RoomRegistry::new(store.clone(), Vec::new());

        store.set_failing(true);
        assert!(matches!(
            rooms.create("general", false, None, &id("alice")).await,
            Err(ChatError::Internal(_))
        ));
        assert!(rooms.list().await.is_empty());

        store.set_failing(false);
        rooms.create("general", false, None, &id("alice")).await.unwrap();
    }

    #[tokio::test]
    async fn failed_join_changes_nothing() {
        let store = Arc::new(FlakyStore::default());
        let rooms = RoomRegistry::new(store.clone(), Vec::new());
        rooms.create("general", false, None, &id("alice")).await.unwrap();

        store.set_failing(true);
        let mut room = rooms.lock("general").await.unwrap();
        assert!(rooms.join(&mut room, &id("bob"), None).await.is_err());
        assert!(!room.is_member(&id("bob")));
    }

    #[test]
    fn room_name_validation() {
        assert!(validate_room_name("general chat").is_ok());
        assert!(validate_room_name("   ").is_err());
        assert!(validate_room_name(&"r".repeat(65)).is_err());
        assert!(validate_room_name("bad\nname").is_err());
    }
}
