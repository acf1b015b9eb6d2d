//! Pickup links
//!
//! Minting issues a fresh random secret, stores only its hash on the
//! allocation and returns a signed URL that carries the allocation id and the
//! plaintext secret:
//!
//! ```text
//! <base_url>/<allocation_id>/<secret>?sig=<HS256 token {aid, iat, exp}>
//! ```
//!
//! The signature has its own lifetime, independent of the allocation's pickup
//! deadline. Authorization failures collapse into three classes
//! ([`LinkError`]) and never reveal which check tripped.

use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore;
use rusqlite::{Connection, TransactionBehavior};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use url::Url;

use crate::db::{allocations, receipts};
use crate::db::{AccessorInfo, Allocation, AllocationStatus, AllocatorDb, PickupReceipt};
use crate::error::{AllocatorError, LinkError};

use super::events::{AllocatorEvent, EventBus};

/// Bytes of entropy in a pickup secret
const SECRET_BYTES: usize = 32;

/// Minimum length for the signing secret
const MIN_SIGNING_SECRET_LEN: usize = 32;

/// Publicly known secret used with `--dev`. Never use in production.
const DEV_SIGNING_SECRET: &str = "dev-mode-secret-not-for-production-use-123456";

/// Claims carried in the `sig` query parameter
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LinkClaims {
    aid: i64,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub signing_secret: String,
    pub base_url: String,
    /// Lifetime of the signed URL itself
    pub link_ttl: Duration,
}

/// Result of a mint
#[derive(Debug, Clone)]
pub struct MintedLink {
    pub allocation: Allocation,
    pub url: String,
    /// Plaintext secret; only ever returned here, never stored
    pub secret: String,
    pub link_expires_at: DateTime<Utc>,
}

/// Result of a pickup
#[derive(Debug, Clone)]
pub struct PickupOutcome {
    pub allocation: Allocation,
    pub receipt: PickupReceipt,
    /// False when the allocation had already been picked up
    pub first_pickup: bool,
}

/// A pickup URL split into its parts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PickupLink {
    pub allocation_id: i64,
    pub secret: String,
    pub signature: String,
}

impl PickupLink {
    pub fn parse(raw: &str) -> Result<Self, LinkError> {
        let url = Url::parse(raw).map_err(|_| LinkError::Forbidden)?;
        let segments: Vec<&str> = url
            .path_segments()
            .ok_or(LinkError::Forbidden)?
            .collect();

        let [.., allocation_id, secret] = segments.as_slice() else {
            return Err(LinkError::Forbidden);
        };
        let allocation_id = allocation_id.parse().map_err(|_| LinkError::Forbidden)?;
        if secret.is_empty() {
            return Err(LinkError::Forbidden);
        }

        let signature = url
            .query_pairs()
            .find(|(key, _)| key == "sig")
            .map(|(_, value)| value.into_owned())
            .ok_or(LinkError::Forbidden)?;

        Ok(Self {
            allocation_id,
            secret: secret.to_string(),
            signature,
        })
    }
}

/// Fresh high-entropy secret, base64url without padding
pub fn generate_secret() -> String {
    let mut bytes = [0u8; SECRET_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// One-way hash stored in `download_token`
pub fn hash_secret(secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    format!("sha256-{}", hex::encode(hasher.finalize()))
}

/// Constant-time string comparison to prevent timing attacks
fn constant_time_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        result |= x ^ y;
    }
    result == 0
}

/// Link/token service
pub struct LinkService {
    db: Arc<AllocatorDb>,
    events: Arc<EventBus>,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    base_url: Url,
    link_ttl: Duration,
}

impl LinkService {
    /// Returns an error if the secret is too short or the base URL is unusable
    pub fn new(db: Arc<AllocatorDb>, events: Arc<EventBus>, config: LinkConfig) -> Result<Self, AllocatorError> {
        if config.signing_secret.len() < MIN_SIGNING_SECRET_LEN {
            return Err(AllocatorError::Config(format!(
                "link signing secret must be at least {} characters",
                MIN_SIGNING_SECRET_LEN
            )));
        }
        if config.link_ttl <= Duration::zero() {
            return Err(AllocatorError::Config("link ttl must be positive".into()));
        }

        let mut base = config.base_url.clone();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url = Url::parse(&base)
            .map_err(|e| AllocatorError::Config(format!("Invalid link base URL {:?}: {}", config.base_url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(AllocatorError::Config(format!("Link base URL {:?} cannot carry a path", base)));
        }

        Ok(Self {
            db,
            events,
            encoding_key: EncodingKey::from_secret(config.signing_secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(config.signing_secret.as_bytes()),
            base_url,
            link_ttl: config.link_ttl,
        })
    }

    /// Service with a fixed, publicly known secret (dev mode only)
    pub fn new_dev(
        db: Arc<AllocatorDb>,
        events: Arc<EventBus>,
        base_url: &str,
        link_ttl: Duration,
    ) -> Result<Self, AllocatorError> {
        warn!("Link signing uses the dev secret; minted links are forgeable");
        Self::new(db, events, LinkConfig {
            signing_secret: DEV_SIGNING_SECRET.into(),
            base_url: base_url.to_string(),
            link_ttl,
        })
    }

    // =========================================================================
    // Mint
    // =========================================================================

    pub fn mint(&self, allocation_id: i64, ttl: Duration) -> Result<MintedLink, AllocatorError> {
        self.mint_at(allocation_id, ttl, Utc::now())
    }

    /// Issue a new secret and link. The pickup deadline becomes
    /// `min(existing deadline, now + ttl)`; it is never pushed back.
    pub fn mint_at(&self, allocation_id: i64, ttl: Duration, now: DateTime<Utc>) -> Result<MintedLink, AllocatorError> {
        if ttl <= Duration::zero() {
            return Err(AllocatorError::InvalidInput("mint ttl must be positive".into()));
        }

        let secret = generate_secret();
        let token_hash = hash_secret(&secret);

        let (previous, allocation) = self.db.with_conn_mut(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let result = record_mint_in(&tx, allocation_id, &token_hash, ttl, now)?;
            tx.commit()?;
            Ok(result)
        })?;

        let link_expires_at = now + self.link_ttl;
        let url = self.build_url(allocation_id, &secret, now, link_expires_at)?;

        debug!(allocation_id, attempts = allocation.attempts, "Minted pickup link");
        if previous == AllocationStatus::Queued {
            self.events.emit(AllocatorEvent::AllocationNotified {
                allocation_id,
                recipient_id: allocation.recipient_id,
            });
        }

        Ok(MintedLink {
            allocation,
            url,
            secret,
            link_expires_at,
        })
    }

    fn build_url(
        &self,
        allocation_id: i64,
        secret: &str,
        now: DateTime<Utc>,
        link_expires_at: DateTime<Utc>,
    ) -> Result<String, AllocatorError> {
        let claims = LinkClaims {
            aid: allocation_id,
            iat: now.timestamp(),
            exp: link_expires_at.timestamp(),
        };
        let signature = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| AllocatorError::Internal(format!("Failed to sign link: {}", e)))?;

        let mut url = self
            .base_url
            .join(&format!("{}/{}", allocation_id, secret))
            .map_err(|e| AllocatorError::Internal(format!("Failed to build link: {}", e)))?;
        url.query_pairs_mut().append_pair("sig", &signature);

        Ok(url.to_string())
    }

    // =========================================================================
    // Authorize / consume
    // =========================================================================

    pub fn authorize(&self, url: &str) -> Result<Allocation, AllocatorError> {
        self.authorize_at(url, Utc::now())
    }

    /// Check a presented link without changing anything
    pub fn authorize_at(&self, url: &str, now: DateTime<Utc>) -> Result<Allocation, AllocatorError> {
        let link = PickupLink::parse(url)?;
        let result = self.db.with_conn(|conn| self.authorize_in(conn, &link, now));
        log_rejection(&result, link.allocation_id);
        result
    }

    /// Mark an allocation picked up and record who fetched it.
    ///
    /// Repeating the call on a picked-up allocation succeeds and adds
    /// another receipt.
    pub fn on_consumed(&self, allocation_id: i64, accessor: &AccessorInfo) -> Result<PickupOutcome, AllocatorError> {
        self.on_consumed_at(allocation_id, accessor, Utc::now())
    }

    pub fn on_consumed_at(
        &self,
        allocation_id: i64,
        accessor: &AccessorInfo,
        now: DateTime<Utc>,
    ) -> Result<PickupOutcome, AllocatorError> {
        let outcome = self.db.with_conn_mut(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let outcome = consume_in(&tx, allocation_id, accessor, now)?;
            tx.commit()?;
            Ok(outcome)
        })?;

        self.emit_pickup(&outcome);
        Ok(outcome)
    }

    pub fn consume(&self, url: &str, accessor: &AccessorInfo) -> Result<PickupOutcome, AllocatorError> {
        self.consume_at(url, accessor, Utc::now())
    }

    /// Authorize and mark picked up in one transaction, so two concurrent
    /// fetches of the same link cannot both win the transition
    pub fn consume_at(
        &self,
        url: &str,
        accessor: &AccessorInfo,
        now: DateTime<Utc>,
    ) -> Result<PickupOutcome, AllocatorError> {
        let link = PickupLink::parse(url)?;

        let result = self.db.with_conn_mut(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let allocation = self.authorize_in(&tx, &link, now)?;
            let outcome = consume_in(&tx, allocation.id, accessor, now)?;
            tx.commit()?;
            Ok(outcome)
        });
        log_rejection(&result, link.allocation_id);

        let outcome = result?;
        self.emit_pickup(&outcome);
        Ok(outcome)
    }

    fn authorize_in(&self, conn: &Connection, link: &PickupLink, now: DateTime<Utc>) -> Result<Allocation, AllocatorError> {
        let claims = self.verify_signature(link)?;

        // Allocation state before link lifetime
        let allocation = allocations::get_allocation(conn, link.allocation_id)?.ok_or(LinkError::Gone)?;
        if allocation.status.is_terminal() {
            return Err(LinkError::Gone.into());
        }
        if allocation.status == AllocationStatus::Queued {
            return Err(LinkError::Forbidden.into());
        }
        if allocation.is_past_deadline(now) {
            return Err(LinkError::Gone.into());
        }

        if now.timestamp() >= claims.exp {
            return Err(LinkError::Expired.into());
        }

        let presented = hash_secret(&link.secret);
        match allocation.download_token.as_deref() {
            Some(stored) if constant_time_compare(&presented, stored) => Ok(allocation),
            _ => Err(LinkError::Forbidden.into()),
        }
    }

    /// Signature and path/claim agreement only; lifetime is checked by the caller
    fn verify_signature(&self, link: &PickupLink) -> Result<LinkClaims, LinkError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;

        let data = decode::<LinkClaims>(&link.signature, &self.decoding_key, &validation)
            .map_err(|_| LinkError::Forbidden)?;

        if data.claims.aid != link.allocation_id {
            return Err(LinkError::Forbidden);
        }
        Ok(data.claims)
    }

    fn emit_pickup(&self, outcome: &PickupOutcome) {
        if outcome.first_pickup {
            info!(allocation_id = outcome.allocation.id, "Allocation picked up");
            self.events.emit(AllocatorEvent::AllocationPickedUp {
                allocation_id: outcome.allocation.id,
                recipient_id: outcome.allocation.recipient_id,
            });
        }
    }
}

fn record_mint_in(
    conn: &Connection,
    allocation_id: i64,
    token_hash: &str,
    ttl: Duration,
    now: DateTime<Utc>,
) -> Result<(AllocationStatus, Allocation), AllocatorError> {
    let current = allocations::get_allocation(conn, allocation_id)?
        .ok_or_else(|| AllocatorError::NotFound(format!("allocation {}", allocation_id)))?;

    if !matches!(current.status, AllocationStatus::Queued | AllocationStatus::Notified) {
        return Err(AllocatorError::InvalidTransition {
            id: allocation_id,
            from: current.status.to_string(),
            to: AllocationStatus::Notified.to_string(),
        });
    }

    // A lapsed deadline is never reopened; the expiry sweep reclaims the row
    if current.status == AllocationStatus::Notified && current.is_past_deadline(now) {
        return Err(LinkError::Gone.into());
    }

    let requested = now + ttl;
    let expires_at = current
        .expires_at
        .map_or(requested, |existing| existing.min(requested));

    if !allocations::record_mint(conn, allocation_id, current.status, token_hash, expires_at, now)? {
        return Err(AllocatorError::Busy(format!(
            "allocation {} changed while minting",
            allocation_id
        )));
    }

    let updated = allocations::get_allocation(conn, allocation_id)?
        .ok_or_else(|| AllocatorError::Internal("Allocation vanished after mint".to_string()))?;
    Ok((current.status, updated))
}

fn consume_in(
    conn: &Connection,
    allocation_id: i64,
    accessor: &AccessorInfo,
    now: DateTime<Utc>,
) -> Result<PickupOutcome, AllocatorError> {
    let current = allocations::get_allocation(conn, allocation_id)?.ok_or(LinkError::Gone)?;

    let first_pickup = match current.status {
        AllocationStatus::Notified => {
            if !allocations::transition(conn, allocation_id, AllocationStatus::Notified, AllocationStatus::PickedUp, now)? {
                return Err(LinkError::Gone.into());
            }
            true
        }
        AllocationStatus::PickedUp => false,
        _ => return Err(LinkError::Gone.into()),
    };

    let receipt = receipts::insert_receipt(conn, allocation_id, accessor, now)?;
    let allocation = allocations::get_allocation(conn, allocation_id)?
        .ok_or_else(|| AllocatorError::Internal("Allocation vanished after pickup".to_string()))?;

    Ok(PickupOutcome {
        allocation,
        receipt,
        first_pickup,
    })
}

/// Log rejections by class only
fn log_rejection<T>(result: &Result<T, AllocatorError>, allocation_id: i64) {
    if let Err(AllocatorError::Link(class)) = result {
        debug!(allocation_id, class = class.as_str(), "Pickup link rejected");
    }
}
