//! The coordinator: identity, presence, rooms, history and delivery behind
//! one handle that both the HTTP API and WebSocket sessions drive.
//!
//! Locking: a room operation holds that room's guard for its whole
//! duration; channel work nested inside takes the channel guard second.
//! Private-pair channels only ever take the channel guard.

use std::sync::Arc;

use huddle_shared::protocol::ServerFrame;
use huddle_shared::token::{TokenClaims, TokenIssuer};
use huddle_shared::{
    ChannelId, ChatError, ChatResult, ConnectionId, IdentityId, Message, MessageContent,
    MessageId, MessageStatus, PrivatePair, RoomSummary,
};
use tracing::{debug, info, warn};

use crate::config::{DeliveryConfirmation, ServerConfig};
use crate::identity::IdentityStore;
use crate::message_log::{ChannelGuard, MessageLog};
use crate::persist::{self, SharedStore};
use crate::presence::PresenceTracker;
use crate::rooms::{RoomGuard, RoomRegistry};
use crate::router::{ConnectionSender, DeliveryRouter};

#[derive(Debug, Clone)]
pub struct HubSettings {
    pub confirmation: DeliveryConfirmation,
    pub max_message_len: usize,
    pub history_limit_max: Option<usize>,
    pub registration_open: bool,
}

impl From<&ServerConfig> for HubSettings {
    fn from(config: &ServerConfig) -> Self {
        Self {
            confirmation: config.delivery_confirmation,
            max_message_len: config.max_message_len,
            history_limit_max: config.history_limit_max,
            registration_open: config.registration_open,
        }
    }
}

impl Default for HubSettings {
    fn default() -> Self {
        Self::from(&ServerConfig::default())
    }
}

pub struct Hub {
    identities: IdentityStore,
    presence: PresenceTracker,
    rooms: RoomRegistry,
    log: MessageLog,
    router: Arc<DeliveryRouter>,
    settings: HubSettings,
}

impl Hub {
    /// Rebuild in-memory state from `store`.
    pub async fn open(
        store: SharedStore,
        issuer: TokenIssuer,
        settings: HubSettings,
    ) -> ChatResult<Self> {
        let (identities, rooms, messages) = persist::load(&store, "load_state", |s| {
            Ok((s.load_identities()?, s.load_rooms()?, s.load_messages()?))
        })
        .await?;

        info!(
            identities = identities.len(),
            rooms = rooms.len(),
            messages = messages.len(),
            "State restored"
        );

        let router = Arc::new(DeliveryRouter::new());
        Ok(Self {
            identities: IdentityStore::new(
                issuer,
                Arc::clone(&store),
                settings.registration_open,
                identities,
            ),
            presence: PresenceTracker::new(Arc::clone(&router)),
            rooms: RoomRegistry::new(Arc::clone(&store), rooms),
            log: MessageLog::new(store, messages),
            router,
            settings,
        })
    }

    // ---- Identity ----

    pub async fn register(&self, username: &str, credential: &str) -> ChatResult<IdentityId> {
        self.identities.register(username, credential).await
    }

    pub async fn login(&self, username: &str, credential: &str) -> ChatResult<(String, TokenClaims)> {
        self.identities.login(username, credential).await
    }

    pub async fn verify_token(&self, token: &str) -> ChatResult<IdentityId> {
        self.identities.verify_token(token).await
    }

    // ---- Connections & presence ----

    pub fn connect(&self, identity: &IdentityId, connection: ConnectionId, tx: ConnectionSender) {
        self.router.attach(connection, identity.clone(), tx);
        self.presence.connect(identity, connection);
        debug!(
            identity = %identity,
            connection = %connection,
            devices = self.presence.connection_count(identity),
            "Connection attached"
        );
    }

    /// Release the presence slot and every subscription of `connection`.
    pub fn disconnect(&self, connection: &ConnectionId) {
        if let Some(identity) = self.router.detach(connection) {
            self.presence.disconnect(&identity, connection);
            debug!(identity = %identity, connection = %connection, "Connection detached");
        }
    }

    pub fn list_online(&self) -> Vec<IdentityId> {
        self.presence.list_online()
    }

    pub fn connection_count(&self) -> usize {
        self.router.connection_count()
    }

    // ---- Rooms ----

    pub async fn create_room(
        &self,
        creator: &IdentityId,
        name: &str,
        is_private: bool,
        password: Option<&str>,
    ) -> ChatResult<RoomSummary> {
        self.rooms.create(name, is_private, password, creator).await
    }

    pub async fn join_room(
        &self,
        identity: &IdentityId,
        name: &str,
        password: Option<&str>,
    ) -> ChatResult<RoomSummary> {
        let mut room = self.rooms.lock(name).await?;
        if self.rooms.join(&mut room, identity, password).await? {
            self.router.send_to_channel(
                &room.channel(),
                &ServerFrame::MemberJoined {
                    room: name.to_string(),
                    identity: identity.clone(),
                },
            );
        }
        Ok(room.summary())
    }

    pub async fn invite_to_room(
        &self,
        inviter: &IdentityId,
        name: &str,
        target: &IdentityId,
    ) -> ChatResult<()> {
        if !self.identities.exists(target) {
            return Err(ChatError::InvalidRequest(format!("unknown user {target}")));
        }
        let mut room = self.rooms.lock(name).await?;
        if self.rooms.invite(&mut room, inviter, target).await? {
            self.router.send_to_identity(
                target,
                &ServerFrame::Invited {
                    room: name.to_string(),
                    inviter: inviter.clone(),
                },
            );
        }
        Ok(())
    }

    pub async fn kick_member(
        &self,
        requester: &IdentityId,
        name: &str,
        target: &IdentityId,
    ) -> ChatResult<()> {
        let mut room = self.rooms.lock(name).await?;
        self.rooms.kick(&mut room, requester, target).await?;

        let channel = room.channel();
        self.router.force_unsubscribe(target, &channel, "kicked");

        let frame = ServerFrame::MemberKicked {
            room: name.to_string(),
            identity: target.clone(),
        };
        self.router.send_to_channel(&channel, &frame);
        self.router.send_to_identity(target, &frame);
        Ok(())
    }

    pub async fn delete_room(&self, requester: &IdentityId, name: &str) -> ChatResult<()> {
        let mut room = self.rooms.lock(name).await?;
        self.rooms.delete(&mut room, requester).await?;

        let channel = room.channel();
        self.log.drop_partition(&channel).await;
        self.router.close_channel(&channel);
        self.rooms.unlist(&room);

        let frame = ServerFrame::RoomDeleted {
            room: name.to_string(),
        };
        for member in room.members() {
            self.router.send_to_identity(member, &frame);
        }
        Ok(())
    }

    pub async fn list_rooms(&self) -> Vec<RoomSummary> {
        self.rooms.list().await
    }

    // ---- Channels ----

    pub async fn subscribe(&self, connection: &ConnectionId, channel: &ChannelId) -> ChatResult<()> {
        let identity = self.identity_of(connection)?;
        let _access = self.access(&identity, channel).await?;
        if !self.router.subscribe(connection, channel) {
            return Err(ChatError::InvalidToken);
        }
        debug!(identity = %identity, channel = %channel, "Subscribed");
        Ok(())
    }

    pub fn unsubscribe(&self, connection: &ConnectionId, channel: &ChannelId) -> ChatResult<()> {
        self.identity_of(connection)?;
        self.router.unsubscribe(connection, channel);
        Ok(())
    }

    /// Append and fan out. The returned message carries its final status.
    pub async fn send_message(
        &self,
        sender: &IdentityId,
        channel: &ChannelId,
        content: MessageContent,
    ) -> ChatResult<Message> {
        let content = content.normalized();
        if content.is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        if let Some(text) = &content.text {
            if text.chars().count() > self.settings.max_message_len {
                return Err(ChatError::InvalidRequest(format!(
                    "message longer than {} characters",
                    self.settings.max_message_len
                )));
            }
        }

        let _access = self.access(sender, channel).await?;
        let mut log = self.log.lock(channel).await;
        let mut message = log.append(sender, content).await?;

        self.router.publish(&message);

        if self.settings.confirmation == DeliveryConfirmation::FanOut
            && self.confirm(&mut log, message.id).await
        {
            message.status = MessageStatus::Delivered;
        }
        Ok(message)
    }

    pub async fn history(
        &self,
        identity: &IdentityId,
        channel: &ChannelId,
        before: Option<MessageId>,
        limit: Option<usize>,
    ) -> ChatResult<Vec<Message>> {
        let _access = self.access(identity, channel).await?;
        let limit = match (limit, self.settings.history_limit_max) {
            (Some(limit), Some(max)) => Some(limit.min(max)),
            (limit, max) => limit.or(max),
        };
        Ok(self.log.history(channel, before, limit).await)
    }

    /// Receipt from a recipient. Only meaningful in ack mode, and only from
    /// someone other than the sender.
    pub async fn ack(
        &self,
        identity: &IdentityId,
        channel: &ChannelId,
        message_id: MessageId,
    ) -> ChatResult<()> {
        let _access = self.access(identity, channel).await?;
        if self.settings.confirmation != DeliveryConfirmation::Ack {
            return Ok(());
        }

        let mut log = self.log.lock(channel).await;
        match log.get(message_id) {
            None => {
                return Err(ChatError::InvalidRequest(format!(
                    "unknown message id {message_id}"
                )))
            }
            Some(message) if &message.sender == identity => return Ok(()),
            Some(_) => {}
        }
        self.confirm(&mut log, message_id).await;
        Ok(())
    }

    // ---- internals ----

    /// Mark delivered and tell the channel. A failure here leaves the
    /// message pending; it has already been appended and published.
    async fn confirm(&self, log: &mut ChannelGuard, message_id: MessageId) -> bool {
        match log.mark_delivered(message_id).await {
            Ok(true) => {
                self.router.send_to_channel(
                    log.channel(),
                    &ServerFrame::MessageDelivered {
                        channel: log.channel().clone(),
                        message_id,
                    },
                );
                true
            }
            Ok(false) => true,
            Err(e) => {
                warn!(channel = %log.channel(), id = message_id, error = %e, "Delivery confirmation failed");
                false
            }
        }
    }

    /// Room channels need membership; private pairs need to be a party.
    /// For rooms the guard comes back so the caller can keep membership
    /// fixed for the rest of the operation.
    async fn access(
        &self,
        identity: &IdentityId,
        channel: &ChannelId,
    ) -> ChatResult<Option<RoomGuard>> {
        match channel {
            ChannelId::Room(name) => {
                let room = self.rooms.lock(name).await?;
                room.require_member(identity)?;
                Ok(Some(room))
            }
            ChannelId::PrivatePair(pair) => {
                self.check_pair(identity, pair).await?;
                Ok(None)
            }
        }
    }

    async fn check_pair(&self, identity: &IdentityId, pair: &PrivatePair) -> ChatResult<()> {
        let Some(other) = pair.other(identity) else {
            return Err(ChatError::NotAMember);
        };
        if other == identity {
            return Err(ChatError::InvalidRequest("cannot open a private channel with yourself".into()));
        }
        if !self.identities.exists(other) {
            return Err(ChatError::InvalidRequest(format!("unknown user {other}")));
        }
        Ok(())
    }

    fn identity_of(&self, connection: &ConnectionId) -> ChatResult<IdentityId> {
        self.router
            .identity_of(connection)
            .ok_or(ChatError::InvalidToken)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use huddle_store::{EphemeralStore, SqliteStore};
    use tokio::sync::mpsc;

    pub(crate) async fn hub_with(settings: HubSettings) -> Arc<Hub> {
        let hub = Hub::open(
            Arc::new(EphemeralStore),
            TokenIssuer::generate(chrono::Duration::hours(1)),
            settings,
        )
        .await
        .unwrap();
        Arc::new(hub)
    }

    pub(crate) async fn hub() -> Arc<Hub> {
        hub_with(HubSettings::default()).await
    }

    pub(crate) async fn users(hub: &Hub, names: &[&str]) -> Vec<IdentityId> {
        let mut ids = Vec::new();
        for name in names {
            ids.push(hub.register(name, "pw").await.unwrap());
        }
        ids
    }

    fn plug(hub: &Hub, who: &IdentityId) -> (ConnectionId, mpsc::UnboundedReceiver<ServerFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = ConnectionId::new();
        hub.connect(who, conn, tx);
        (conn, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ServerFrame>) -> Vec<ServerFrame> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    #[tokio::test]
    async fn scenario_general() {
        let hub = hub().await;
        let [a, b] = <[IdentityId; 2]>::try_from(users(&hub, &["alice", "bob"]).await).unwrap();
        let general = ChannelId::room("general");

        hub.create_room(&a, "general", false, None).await.unwrap();
        hub.send_message(&a, &general, MessageContent::text("earlier")).await.unwrap();
        hub.join_room(&b, "general", None).await.unwrap();
        let sent = hub.send_message(&a, &general, MessageContent::text("hi")).await.unwrap();

        let history = hub.history(&b, &general, None, None).await.unwrap();
        assert_eq!(history.len(), 2);
        let last = history.last().unwrap();
        assert_eq!(last.id, sent.id);
        assert_eq!(last.sender, a);
        assert_eq!(last.content.text.as_deref(), Some("hi"));
        assert!(history[0].id < last.id);
    }

    #[tokio::test]
    async fn scenario_vip() {
        let hub = hub().await;
        let [a, b] = <[IdentityId; 2]>::try_from(users(&hub, &["alice", "bob"]).await).unwrap();

        hub.create_room(&a, "vip", true, Some("secret")).await.unwrap();
        assert_eq!(
            hub.join_room(&b, "vip", Some("wrong")).await,
            Err(ChatError::WrongPassword)
        );
        let rooms = hub.list_rooms().await;
        assert!(!rooms[0].members.contains(&b));

        let summary = hub.join_room(&b, "vip", Some("secret")).await.unwrap();
        assert!(summary.members.contains(&b));
        assert!(summary.is_private);
    }

    #[tokio::test]
    async fn private_pair_rejects_non_party() {
        let hub = hub().await;
        let [a, b, c] =
            <[IdentityId; 3]>::try_from(users(&hub, &["alice", "bob", "carol"]).await).unwrap();
        let dm = ChannelId::private_pair(b.clone(), a.clone());

        hub.send_message(&a, &dm, MessageContent::text("psst")).await.unwrap();
        hub.send_message(&b, &dm, MessageContent::text("yes?")).await.unwrap();

        assert_eq!(hub.history(&c, &dm, None, None).await, Err(ChatError::NotAMember));
        assert_eq!(
            hub.send_message(&c, &dm, MessageContent::text("hi")).await,
            Err(ChatError::NotAMember)
        );

        let (conn, _rx) = plug(&hub, &c);
        assert_eq!(hub.subscribe(&conn, &dm).await, Err(ChatError::NotAMember));

        let seen: Vec<_> = hub
            .history(&a, &ChannelId::private_pair(a.clone(), b.clone()), None, None)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.sender)
            .collect();
        assert_eq!(seen, vec![a, b]);
    }

    #[tokio::test]
    async fn private_pair_needs_a_real_peer() {
        let hub = hub().await;
        let [a] = <[IdentityId; 1]>::try_from(users(&hub, &["alice"]).await).unwrap();
        assert!(matches!(
            hub.send_message(&a, &ChannelId::private_pair(a.clone(), "ghost".into()), MessageContent::text("boo")).await,
            Err(ChatError::InvalidRequest(_))
        ));
        assert!(matches!(
            hub.send_message(&a, &ChannelId::private_pair(a.clone(), a.clone()), MessageContent::text("me")).await,
            Err(ChatError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn subscribers_receive_appends_in_order() {
        let hub = hub().await;
        let [a, b] = <[IdentityId; 2]>::try_from(users(&hub, &["alice", "bob"]).await).unwrap();
        let general = ChannelId::room("general");
        hub.create_room(&a, "general", false, None).await.unwrap();
        hub.join_room(&b, "general", None).await.unwrap();

        let (conn, mut rx) = plug(&hub, &b);
        hub.subscribe(&conn, &general).await.unwrap();
        drain(&mut rx);

        for i in 0..5 {
            hub.send_message(&a, &general, MessageContent::text(format!("m{i}"))).await.unwrap();
        }

        let ids: Vec<MessageId> = drain(&mut rx)
            .into_iter()
            .filter_map(|f| match f {
                ServerFrame::MessageAppended { message } => Some(message.id),
                _ => None,
            })
            .collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn non_member_cannot_subscribe_or_read_room() {
        let hub = hub().await;
        let [a, b] = <[IdentityId; 2]>::try_from(users(&hub, &["alice", "bob"]).await).unwrap();
        let general = ChannelId::room("general");
        hub.create_room(&a, "general", false, None).await.unwrap();

        let (conn, _rx) = plug(&hub, &b);
        assert_eq!(hub.subscribe(&conn, &general).await, Err(ChatError::NotAMember));
        assert_eq!(hub.history(&b, &general, None, None).await, Err(ChatError::NotAMember));
        assert_eq!(
            hub.send_message(&b, &general, MessageContent::text("let me in")).await,
            Err(ChatError::NotAMember)
        );
    }

    #[tokio::test]
    async fn kicked_member_loses_access() {
        let hub = hub().await;
        let [a, b] = <[IdentityId; 2]>::try_from(users(&hub, &["alice", "bob"]).await).unwrap();
        let general = ChannelId::room("general");
        hub.create_room(&a, "general", false, None).await.unwrap();
        hub.join_room(&b, "general", None).await.unwrap();

        let (conn, mut rx) = plug(&hub, &b);
        hub.subscribe(&conn, &general).await.unwrap();
        drain(&mut rx);

        assert_eq!(
            hub.kick_member(&a, "general", &a).await,
            Err(ChatError::CannotKickAdmin)
        );
        hub.kick_member(&a, "general", &b).await.unwrap();

        let frames = drain(&mut rx);
        assert!(frames
            .iter()
            .any(|f| matches!(f, ServerFrame::ForceUnsubscribed { channel, .. } if channel == &general)));
        assert!(frames
            .iter()
            .any(|f| matches!(f, ServerFrame::MemberKicked { identity, .. } if identity == &b)));

        assert_eq!(hub.subscribe(&conn, &general).await, Err(ChatError::NotAMember));
        assert_eq!(hub.history(&b, &general, None, None).await, Err(ChatError::NotAMember));

        hub.send_message(&a, &general, MessageContent::text("after")).await.unwrap();
        assert!(!drain(&mut rx)
            .iter()
            .any(|f| matches!(f, ServerFrame::MessageAppended { .. })));
    }

    #[tokio::test]
    async fn deleted_room_is_gone_everywhere() {
        let hub = hub().await;
        let [a, b] = <[IdentityId; 2]>::try_from(users(&hub, &["alice", "bob"]).await).unwrap();
        let general = ChannelId::room("general");
        hub.create_room(&a, "general", false, None).await.unwrap();
        hub.join_room(&b, "general", None).await.unwrap();
        hub.send_message(&a, &general, MessageContent::text("bye")).await.unwrap();

        let (conn, mut rx) = plug(&hub, &b);
        hub.subscribe(&conn, &general).await.unwrap();
        drain(&mut rx);

        assert_eq!(hub.delete_room(&b, "general").await, Err(ChatError::NotAuthorized));
        hub.delete_room(&a, "general").await.unwrap();

        assert!(drain(&mut rx)
            .iter()
            .any(|f| matches!(f, ServerFrame::RoomDeleted { room } if room == "general")));
        assert!(hub.list_rooms().await.is_empty());
        assert_eq!(hub.join_room(&b, "general", None).await, Err(ChatError::RoomNotFound));
        assert_eq!(hub.history(&a, &general, None, None).await, Err(ChatError::RoomNotFound));
        assert_eq!(hub.delete_room(&a, "general").await, Err(ChatError::RoomNotFound));

        // Recreating the name starts a fresh history.
        hub.create_room(&a, "general", false, None).await.unwrap();
        assert!(hub.history(&a, &general, None, None).await.unwrap().is_empty());
        let fresh = hub
            .send_message(&a, &general, MessageContent::text("hello again"))
            .await
            .unwrap();
        assert_eq!(fresh.id, 1);
        let history = hub.history(&a, &general, None, None).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].id, 1);
    }

    #[tokio::test]
    async fn invite_is_delivered_and_consumed() {
        let hub = hub().await;
        let [a, b] = <[IdentityId; 2]>::try_from(users(&hub, &["alice", "bob"]).await).unwrap();
        hub.create_room(&a, "vip", true, Some("secret")).await.unwrap();
        let (_conn, mut rx) = plug(&hub, &b);
        drain(&mut rx);

        assert!(matches!(
            hub.invite_to_room(&a, "vip", &"nobody".into()).await,
            Err(ChatError::InvalidRequest(_))
        ));
        hub.invite_to_room(&a, "vip", &b).await.unwrap();
        assert!(drain(&mut rx)
            .iter()
            .any(|f| matches!(f, ServerFrame::Invited { room, inviter } if room == "vip" && inviter == &a)));

        assert!(!hub.list_rooms().await[0].members.contains(&b));
        hub.join_room(&b, "vip", None).await.unwrap();
        assert!(hub.list_rooms().await[0].members.contains(&b));
    }

    #[tokio::test]
    async fn presence_counts_devices() {
        let hub = hub().await;
        let [a, b] = <[IdentityId; 2]>::try_from(users(&hub, &["alice", "bob"]).await).unwrap();
        let (_watch, mut rx) = plug(&hub, &b);
        drain(&mut rx);

        let (phone, _p) = plug(&hub, &a);
        let (laptop, _l) = plug(&hub, &a);
        assert_eq!(hub.list_online(), vec![a.clone(), b.clone()]);

        hub.disconnect(&phone);
        assert!(hub.list_online().contains(&a));
        hub.disconnect(&laptop);
        assert_eq!(hub.list_online(), vec![b.clone()]);
        hub.disconnect(&laptop);

        let transitions: Vec<bool> = drain(&mut rx)
            .into_iter()
            .filter_map(|f| match f {
                ServerFrame::PresenceChanged { identity, online } if identity == a => Some(online),
                _ => None,
            })
            .collect();
        assert_eq!(transitions, vec![true, false]);
    }

    #[tokio::test]
    async fn fanout_confirmation_marks_delivered() {
        let hub = hub().await;
        let [a, b] = <[IdentityId; 2]>::try_from(users(&hub, &["alice", "bob"]).await).unwrap();
        let dm = ChannelId::private_pair(a.clone(), b.clone());
        let (conn, mut rx) = plug(&hub, &b);
        hub.subscribe(&conn, &dm).await.unwrap();
        drain(&mut rx);

        let msg = hub.send_message(&a, &dm, MessageContent::text("hi")).await.unwrap();
        assert_eq!(msg.status, MessageStatus::Delivered);

        let frames = drain(&mut rx);
        assert!(matches!(
            &frames[0],
            ServerFrame::MessageAppended { message } if message.status == MessageStatus::Pending
        ));
        assert!(matches!(
            &frames[1],
            ServerFrame::MessageDelivered { message_id, .. } if *message_id == msg.id
        ));
    }

    #[tokio::test]
    async fn ack_confirmation_waits_for_recipient() {
        let hub = hub_with(HubSettings {
            confirmation: DeliveryConfirmation::Ack,
            ..HubSettings::default()
        })
        .await;
        let [a, b] = <[IdentityId; 2]>::try_from(users(&hub, &["alice", "bob"]).await).unwrap();
        let dm = ChannelId::private_pair(a.clone(), b.clone());

        let msg = hub.send_message(&a, &dm, MessageContent::text("hi")).await.unwrap();
        assert_eq!(msg.status, MessageStatus::Pending);

        // The sender's own ack does not count.
        hub.ack(&a, &dm, msg.id).await.unwrap();
        let status = |h: Vec<Message>| h[0].status;
        assert_eq!(status(hub.history(&a, &dm, None, None).await.unwrap()), MessageStatus::Pending);

        hub.ack(&b, &dm, msg.id).await.unwrap();
        assert_eq!(status(hub.history(&a, &dm, None, None).await.unwrap()), MessageStatus::Delivered);
        assert!(hub.ack(&b, &dm, 42).await.is_err());
    }

    #[tokio::test]
    async fn history_limit_is_capped() {
        let hub = hub_with(HubSettings {
            history_limit_max: Some(2),
            ..HubSettings::default()
        })
        .await;
        let [a] = <[IdentityId; 1]>::try_from(users(&hub, &["alice"]).await).unwrap();
        let general = ChannelId::room("general");
        hub.create_room(&a, "general", false, None).await.unwrap();
        for i in 0..4 {
            hub.send_message(&a, &general, MessageContent::text(format!("m{i}"))).await.unwrap();
        }
        let ids: Vec<_> = hub
            .history(&a, &general, None, Some(10))
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(ids, vec![3, 4]);
        assert_eq!(hub.history(&a, &general, None, None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn message_content_rules() {
        let hub = hub_with(HubSettings {
            max_message_len: 5,
            ..HubSettings::default()
        })
        .await;
        let [a] = <[IdentityId; 1]>::try_from(users(&hub, &["alice"]).await).unwrap();
        let general = ChannelId::room("general");
        hub.create_room(&a, "general", false, None).await.unwrap();

        assert_eq!(
            hub.send_message(&a, &general, MessageContent::default()).await,
            Err(ChatError::EmptyMessage)
        );
        assert!(matches!(
            hub.send_message(&a, &general, MessageContent::text("too long")).await,
            Err(ChatError::InvalidRequest(_))
        ));
        let media = hub.send_message(&a, &general, MessageContent::media("blob-1")).await.unwrap();
        assert_eq!(media.content.media.as_deref(), Some("blob-1"));
    }

    #[tokio::test]
    async fn concurrent_appends_keep_ids_unique() {
        let hub = hub().await;
        let names: Vec<String> = (0..8).map(|i| format!("user{i}")).collect();
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let ids = users(&hub, &refs).await;
        let general = ChannelId::room("general");
        hub.create_room(&ids[0], "general", false, None).await.unwrap();
        for id in &ids[1..] {
            hub.join_room(id, "general", None).await.unwrap();
        }

        let mut tasks = Vec::new();
        for id in ids.clone() {
            let hub = Arc::clone(&hub);
            let general = general.clone();
            tasks.push(tokio::spawn(async move {
                for i in 0..10 {
                    hub.send_message(&id, &general, MessageContent::text(format!("{i}")))
                        .await
                        .unwrap();
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let history = hub.history(&ids[0], &general, None, Some(1000)).await.unwrap();
        assert_eq!(history.len(), 80);
        assert!(history.windows(2).all(|w| w[0].id < w[1].id));
    }

    #[tokio::test]
    async fn concurrent_join_and_kick_keep_invariants() {
        let hub = hub().await;
        let [a, b] = <[IdentityId; 2]>::try_from(users(&hub, &["alice", "bob"]).await).unwrap();
        hub.create_room(&a, "general", false, None).await.unwrap();

        let mut tasks = Vec::new();
        for _ in 0..20 {
            let (hub_j, b_j) = (Arc::clone(&hub), b.clone());
            tasks.push(tokio::spawn(async move {
                let _ = hub_j.join_room(&b_j, "general", None).await;
            }));
            let (hub_k, a_k, b_k) = (Arc::clone(&hub), a.clone(), b.clone());
            tasks.push(tokio::spawn(async move {
                let _ = hub_k.kick_member(&a_k, "general", &b_k).await;
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let room = hub.rooms.lock("general").await.unwrap();
        room.assert_invariants();
    }

    #[tokio::test]
    async fn room_access_holds_the_room() {
        let hub = hub().await;
        let [a, b] = <[IdentityId; 2]>::try_from(users(&hub, &["alice", "bob"]).await).unwrap();
        hub.create_room(&a, "general", false, None).await.unwrap();
        assert!(hub.access(&a, &ChannelId::room("general")).await.unwrap().is_some());
        assert!(hub
            .access(&a, &ChannelId::private_pair(a.clone(), b.clone()))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn state_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("huddle.db");
        let issuer_key = [7u8; 32];
        let open = |path: std::path::PathBuf| async move {
            let store: SharedStore = Arc::new(SqliteStore::open(&path).unwrap());
            Hub::open(
                store,
                TokenIssuer::from_secret_bytes(&issuer_key, chrono::Duration::hours(1)),
                HubSettings::default(),
            )
            .await
            .unwrap()
        };

        {
            let hub = open(path.clone()).await;
            let a = hub.register("alice", "pw").await.unwrap();
            let b = hub.register("bob", "pw").await.unwrap();
            hub.create_room(&a, "vip", true, Some("secret")).await.unwrap();
            hub.join_room(&b, "vip", Some("secret")).await.unwrap();
            hub.send_message(&a, &ChannelId::room("vip"), MessageContent::text("one")).await.unwrap();
            hub.send_message(&b, &ChannelId::room("vip"), MessageContent::text("two")).await.unwrap();
        }

        let hub = open(path).await;
        let b: IdentityId = "bob".into();
        assert!(hub.login("bob", "pw").await.is_ok());
        let rooms = hub.list_rooms().await;
        assert!(rooms[0].members.contains(&b));

        let vip = ChannelId::room("vip");
        let next = hub.send_message(&b, &vip, MessageContent::text("three")).await.unwrap();
        assert_eq!(next.id, 3);
        let history = hub.history(&b, &vip, None, None).await.unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].status, MessageStatus::Delivered);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn slow_registration_does_not_stall_other_identities() {
        use std::time::{Duration, Instant};

        use crate::persist::testing::FlakyStore;

        let store = Arc::new(FlakyStore::default());
        let hub = Arc::new(
            Hub::open(
                store.clone(),
                TokenIssuer::generate(chrono::Duration::hours(1)),
                HubSettings::default(),
            )
            .await
            .unwrap(),
        );
        let [a, b] = <[IdentityId; 2]>::try_from(users(&hub, &["alice", "bob"]).await).unwrap();
        let (token, _) = hub.login("alice", "pw").await.unwrap();
        let dm = ChannelId::private_pair(a.clone(), b.clone());

        store.set_identity_delay(Duration::from_millis(500));
        let pending = tokio::spawn({
            let hub = Arc::clone(&hub);
            async move { hub.register("carol", "pw").await }
        });
        // Let carol's write reach the store.
        tokio::time::sleep(Duration::from_millis(150)).await;

        let started = Instant::now();
        hub.send_message(&a, &dm, MessageContent::text("hi")).await.unwrap();
        hub.history(&b, &dm, None, None).await.unwrap();
        assert_eq!(hub.verify_token(&token).await.unwrap(), a);
        let waited = started.elapsed();
        assert!(waited < Duration::from_millis(250), "waited {waited:?}");

        // The name is claimed but not usable until the write lands.
        assert_eq!(hub.register("carol", "pw").await, Err(ChatError::UsernameTaken));
        assert_eq!(
            hub.login("carol", "pw").await.map(|_| ()),
            Err(ChatError::InvalidCredential)
        );

        pending.await.unwrap().unwrap();
        assert!(hub.login("carol", "pw").await.is_ok());
    }
}
