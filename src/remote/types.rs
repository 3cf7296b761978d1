use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

// ============================================================================
// Identifiers
// ============================================================================

/// Opaque document identifier assigned by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(String);

impl DocumentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DocumentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for DocumentId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// ============================================================================
// Data Structures
// ============================================================================

/// Document category as stored in the `category` column.
///
/// Unknown values coming from the backend deserialize to `Other` so a new
/// category added server-side never breaks a whole listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentCategory {
    Vaccination,
    Medical,
    Insurance,
    Registration,
    Invoice,
    Photo,
    #[serde(other)]
    Other,
}

impl fmt::Display for DocumentCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Vaccination => "vaccination",
            Self::Medical => "medical",
            Self::Insurance => "insurance",
            Self::Registration => "registration",
            Self::Invoice => "invoice",
            Self::Photo => "photo",
            Self::Other => "other",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Unknown document category '{0}'")]
pub struct UnknownCategory(pub String);

impl FromStr for DocumentCategory {
    type Err = UnknownCategory;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "vaccination" => Ok(Self::Vaccination),
            "medical" => Ok(Self::Medical),
            "insurance" => Ok(Self::Insurance),
            "registration" => Ok(Self::Registration),
            "invoice" => Ok(Self::Invoice),
            "photo" => Ok(Self::Photo),
            "other" => Ok(Self::Other),
            other => Err(UnknownCategory(other.to_string())),
        }
    }
}

/// A time-limited public link to a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareLink {
    pub url: String,
    pub expires_at: DateTime<Utc>,
}

impl ShareLink {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Document metadata as seen by the client.
///
/// The client cache is a read-through projection of the backend: records are
/// only ever mutated locally as part of an optimistic patch that a forced
/// refresh later overwrites.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentRecord {
    pub id: DocumentId,
    pub name: String,
    pub category: DocumentCategory,
    pub file_type: String,
    /// Weak reference to the owning pet (lookup only).
    pub pet_id: Option<String>,
    pub is_favorite: bool,
    pub is_archived: bool,
    pub share: Option<ShareLink>,
    pub created_at: DateTime<Utc>,
}

/// Partial update sent to the backend. Absent fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DocumentPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<DocumentCategory>,
    /// `Some(None)` detaches the document from its pet.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pet_id: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_favorite: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_archived: Option<bool>,
}

impl DocumentPatch {
    pub fn bookmark(value: bool) -> Self {
        Self {
            is_favorite: Some(value),
            ..Self::default()
        }
    }

    pub fn archived(value: bool) -> Self {
        Self {
            is_archived: Some(value),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.category.is_none()
            && self.pet_id.is_none()
            && self.is_favorite.is_none()
            && self.is_archived.is_none()
    }

    /// Apply this patch to a local copy of a record.
    pub fn apply_to(&self, record: &mut DocumentRecord) {
        if let Some(name) = &self.name {
            record.name = name.clone();
        }
        if let Some(category) = self.category {
            record.category = category;
        }
        if let Some(pet_id) = &self.pet_id {
            record.pet_id = pet_id.clone();
        }
        if let Some(favorite) = self.is_favorite {
            record.is_favorite = favorite;
        }
        if let Some(archived) = self.is_archived {
            record.is_archived = archived;
        }
    }
}

/// Query parameters for `DocumentStore::list_documents`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct DocumentFilter {
    pub archived: bool,
    pub favorites_only: bool,
    pub pet_id: Option<String>,
}

impl DocumentFilter {
    pub fn matches(&self, record: &DocumentRecord) -> bool {
        if record.is_archived != self.archived {
            return false;
        }
        if self.favorites_only && !record.is_favorite {
            return false;
        }
        match &self.pet_id {
            Some(pet) => record.pet_id.as_deref() == Some(pet.as_str()),
            None => true,
        }
    }
}

// ============================================================================
// Wire Types
// ============================================================================

/// Row shape returned by the REST gateway for the `documents` table.
///
/// Converts to [`DocumentRecord`] via `into_record()`, folding the flat
/// `share_url` / `share_expires_at` columns into an optional [`ShareLink`].
#[derive(Debug, Deserialize)]
pub(crate) struct DocumentRow {
    pub id: String,
    pub name: String,
    pub category: DocumentCategory,
    pub file_type: String,
    #[serde(default)]
    pub pet_id: Option<String>,
    #[serde(default)]
    pub is_favorite: bool,
    #[serde(default)]
    pub is_archived: bool,
    #[serde(default)]
    pub share_url: Option<String>,
    #[serde(default)]
    pub share_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl DocumentRow {
    pub(crate) fn into_record(self) -> DocumentRecord {
        // A half-populated share pair is treated as no share at all
        let share = match (self.share_url, self.share_expires_at) {
            (Some(url), Some(expires_at)) if !url.is_empty() => Some(ShareLink { url, expires_at }),
            _ => None,
        };
        DocumentRecord {
            id: DocumentId(self.id),
            name: self.name,
            category: self.category,
            file_type: self.file_type,
            pet_id: self.pet_id,
            is_favorite: self.is_favorite,
            is_archived: self.is_archived,
            share,
            created_at: self.created_at,
        }
    }
}
