//! Tag index
//!
//! Many-to-many association between tags and keys, held authoritatively in the
//! shared tier as one member set per tag. Memberships may outlive their keys;
//! invalidation deletes whatever the set lists and removing a missing member is
//! a no-op.

use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::entry::validate_tag;
use crate::error::CacheError;
use crate::shared_tier::SharedTier;
use crate::traits::TierResult;

pub struct TagIndex {
    shared: Arc<SharedTier>,
}

impl TagIndex {
    pub fn new(shared: Arc<SharedTier>) -> Self {
        Self { shared }
    }

    /// Validate every tag in a list
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::InvalidArgument`] for the first malformed tag.
    pub fn validate(tags: &[String]) -> Result<(), CacheError> {
        tags.iter().try_for_each(|t| validate_tag(t))
    }

    /// Record `key` as a member of each tag
    ///
    /// Stops at the first unavailable call; the entry itself is already
    /// written, so a partial index only weakens later tag invalidation.
    pub async fn add(&self, key: &str, tags: &[String], ttl: Duration) -> TierResult<()> {
        for tag in tags {
            if !self.shared.tag_add(tag, key, ttl).await.is_available() {
                return TierResult::Unavailable;
            }
        }
        if !tags.is_empty() {
            debug!(key = %key, tags = ?tags, "Indexed key under tags");
        }
        TierResult::Available(())
    }

    pub async fn members(&self, tag: &str) -> TierResult<Vec<String>> {
        self.shared.tag_members(tag).await
    }

    /// Drop `key` from each tag's member set
    pub async fn remove_key(&self, key: &str, tags: &[String]) -> TierResult<()> {
        for tag in tags {
            if !self.shared.tag_remove_member(tag, key).await.is_available() {
                return TierResult::Unavailable;
            }
        }
        TierResult::Available(())
    }

    pub async fn drop_tag(&self, tag: &str) -> TierResult<()> {
        self.shared.tag_drop(tag).await
    }

    pub async fn drop_all(&self) -> TierResult<usize> {
        self.shared.tag_drop_all().await
    }
}
