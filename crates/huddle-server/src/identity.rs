//! Identity & session store: accounts, credentials and session tokens.
//!
//! Live connections per identity are counted by [`crate::presence`]; this
//! module only answers "who is this" questions.

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use huddle_shared::constants::{KDF_CONTEXT_CREDENTIAL, MAX_USERNAME_LEN};
use huddle_shared::credential::{hash_secret, verify_secret};
use huddle_shared::token::{TokenClaims, TokenIssuer};
use huddle_shared::{ChatError, ChatResult, IdentityId};
use huddle_store::IdentityRecord;
use tracing::{info, warn};

use crate::persist::{self, SharedStore};

enum Account {
    /// Name claimed by a registration whose write has not landed yet.
    Reserved,
    /// Salted credential hash.
    Active(String),
}

pub struct IdentityStore {
    accounts: DashMap<IdentityId, Account>,
    issuer: TokenIssuer,
    store: SharedStore,
    registration_open: bool,
}

impl IdentityStore {
    pub fn new(
        issuer: TokenIssuer,
        store: SharedStore,
        registration_open: bool,
        existing: Vec<IdentityRecord>,
    ) -> Self {
        let accounts = existing
            .into_iter()
            .map(|record| (record.username, Account::Active(record.credential_hash)))
            .collect();
        Self {
            accounts,
            issuer,
            store,
            registration_open,
        }
    }

    /// The name is reserved before the write and released if it fails, so
    /// no lock is held across persistence.
    pub async fn register(&self, username: &str, credential: &str) -> ChatResult<IdentityId> {
        if !self.registration_open {
            return Err(ChatError::NotAuthorized);
        }
        let identity = validate_username(username)?;
        if credential.is_empty() {
            return Err(ChatError::InvalidRequest("credential must not be empty".into()));
        }
        if self.accounts.contains_key(&identity) {
            return Err(ChatError::UsernameTaken);
        }

        let hash = hash_off_thread(KDF_CONTEXT_CREDENTIAL, credential).await?;

        match self.accounts.entry(identity.clone()) {
            Entry::Occupied(_) => return Err(ChatError::UsernameTaken),
            Entry::Vacant(slot) => {
                slot.insert(Account::Reserved);
            }
        }

        let record = IdentityRecord {
            username: identity.clone(),
            credential_hash: hash.clone(),
            created_at: Utc::now(),
        };
        if let Err(e) =
            persist::write(&self.store, "insert_identity", move |s| s.insert_identity(&record)).await
        {
            self.accounts
                .remove_if(&identity, |_, account| matches!(account, Account::Reserved));
            return Err(e);
        }
        self.accounts.insert(identity.clone(), Account::Active(hash));

        info!(identity = %identity, "Identity registered");
        Ok(identity)
    }

    pub async fn authenticate(&self, username: &str, credential: &str) -> ChatResult<IdentityId> {
        let identity = IdentityId::new(username);
        let hash = self
            .accounts
            .get(&identity)
            .and_then(|account| match account.value() {
                Account::Active(hash) => Some(hash.clone()),
                Account::Reserved => None,
            })
            .ok_or(ChatError::InvalidCredential)?;

        if verify_off_thread(KDF_CONTEXT_CREDENTIAL, credential, &hash).await {
            Ok(identity)
        } else {
            Err(ChatError::InvalidCredential)
        }
    }

    /// Authenticate and mint a session token.
    pub async fn login(
        &self,
        username: &str,
        credential: &str,
    ) -> ChatResult<(String, TokenClaims)> {
        let identity = self.authenticate(username, credential).await?;
        let issued = self.issuer.issue(&identity)?;
        info!(identity = %identity, "Session token issued");
        Ok(issued)
    }

    /// A token is only good while its identity exists.
    pub async fn verify_token(&self, token: &str) -> ChatResult<IdentityId> {
        let claims = self.issuer.verify(token)?;
        if self.exists(&claims.identity) {
            Ok(claims.identity)
        } else {
            Err(ChatError::InvalidToken)
        }
    }

    pub fn exists(&self, identity: &IdentityId) -> bool {
        matches!(
            self.accounts.get(identity).as_deref(),
            Some(Account::Active(_))
        )
    }
}

/// Hash a secret on the blocking pool.
pub(crate) async fn hash_off_thread(context: &'static str, secret: &str) -> ChatResult<String> {
    let secret = secret.to_owned();
    tokio::task::spawn_blocking(move || hash_secret(context, &secret))
        .await
        .map_err(|e| ChatError::Internal(format!("hashing task failed: {e}")))?
}

/// Verify a secret on the blocking pool. A failed task never verifies.
pub(crate) async fn verify_off_thread(context: &'static str, secret: &str, encoded: &str) -> bool {
    let (secret, encoded) = (secret.to_owned(), encoded.to_owned());
    match tokio::task::spawn_blocking(move || verify_secret(context, &secret, &encoded)).await {
        Ok(ok) => ok,
        Err(e) => {
            warn!(error = %e, "Verification task failed");
            false
        }
    }
}

/// 1 to 32 characters, no whitespace or control characters.
pub fn validate_username(username: &str) -> ChatResult<IdentityId> {
    let len = username.chars().count();
    if len == 0 || len > MAX_USERNAME_LEN {
        return Err(ChatError::InvalidRequest(format!(
            "username must be 1-{MAX_USERNAME_LEN} characters"
        )));
    }
    if username.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(ChatError::InvalidRequest(
            "username must not contain whitespace".into(),
        ));
    }
    Ok(IdentityId::new(username))
}
