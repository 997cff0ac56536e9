//! Metadata cache.
//!
//! Attachment and fragment records are cached by their public
//! identifiers. Reads go through the cache and fall back to the
//! database. Every write refreshes or invalidates the entry after the
//! database commit.

use std::time::Duration;

use moka::future::Cache;

use crate::database::entity::attachment::AttachmentModel;
use crate::database::entity::fragment::FragmentModel;

/// A bounded, TTL-based cache of attachment and fragment records.
pub struct MetadataCache {
    attachments: Cache<String, AttachmentModel>,
    fragments: Cache<String, FragmentModel>,
}

impl MetadataCache {
    pub fn new(max_capacity: u64, ttl: Duration) -> Self {
        Self {
            attachments: Cache::builder()
                .max_capacity(max_capacity)
                .time_to_live(ttl)
                .build(),
            fragments: Cache::builder()
                .max_capacity(max_capacity)
                .time_to_live(ttl)
                .build(),
        }
    }

    pub async fn get_attachment(&self, rid: &str) -> Option<AttachmentModel> {
        self.attachments.get(rid).await
    }

    pub async fn put_attachment(&self, attachment: &AttachmentModel) {
        self.attachments
            .insert(attachment.rid.clone(), attachment.clone())
            .await;
    }

    pub async fn invalidate_attachment(&self, rid: &str) {
        self.attachments.invalidate(rid).await;
    }

    pub async fn get_fragment(&self, rid: &str) -> Option<FragmentModel> {
        self.fragments.get(rid).await
    }

    pub async fn put_fragment(&self, fragment: &FragmentModel) {
        self.fragments
            .insert(fragment.rid.clone(), fragment.clone())
            .await;
    }

    pub async fn invalidate_fragment(&self, rid: &str) {
        self.fragments.invalidate(rid).await;
    }
}

impl std::fmt::Debug for MetadataCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataCache")
            .field("attachments", &self.attachments.entry_count())
            .field("fragments", &self.fragments.entry_count())
            .finish()
    }
}
