use crate::remote::{DocumentFilter, DocumentRecord};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A named logical document collection, cached and refreshed independently.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Scope {
    /// Every document that is not archived.
    Active,
    /// Bookmarked (favorite) documents that are not archived.
    Bookmarked,
    /// Archived documents.
    Archived,
    /// Non-archived documents belonging to one pet.
    Pet(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScopeParseError {
    #[error("Unknown scope '{0}' (expected active, bookmarked, archived or pet:<id>)")]
    Unknown(String),
    #[error("Pet scope requires an id (pet:<id>)")]
    MissingPetId,
}

impl Scope {
    /// The three list views shown on the documents page.
    pub const LISTS: [Scope; 3] = [Scope::Active, Scope::Bookmarked, Scope::Archived];

    /// Remote query for this scope. `Archived` is served by
    /// `list_archived_documents` and reports `archived = true` here.
    pub fn filter(&self) -> DocumentFilter {
        match self {
            Scope::Active => DocumentFilter::default(),
            Scope::Bookmarked => DocumentFilter {
                favorites_only: true,
                ..DocumentFilter::default()
            },
            Scope::Archived => DocumentFilter {
                archived: true,
                ..DocumentFilter::default()
            },
            Scope::Pet(pet_id) => DocumentFilter {
                pet_id: Some(pet_id.clone()),
                ..DocumentFilter::default()
            },
        }
    }

    /// Scope family name used for per-kind settings (`pet` for every pet scope).
    pub fn kind(&self) -> &'static str {
        match self {
            Scope::Active => "active",
            Scope::Bookmarked => "bookmarked",
            Scope::Archived => "archived",
            Scope::Pet(_) => "pet",
        }
    }

    /// Whether `record` belongs in this scope's collection.
    pub fn admits(&self, record: &DocumentRecord) -> bool {
        self.filter().matches(record)
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Active => f.write_str("active"),
            Scope::Bookmarked => f.write_str("bookmarked"),
            Scope::Archived => f.write_str("archived"),
            Scope::Pet(id) => write!(f, "pet:{}", id),
        }
    }
}

impl FromStr for Scope {
    type Err = ScopeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "active" => Ok(Scope::Active),
            "bookmarked" => Ok(Scope::Bookmarked),
            "archived" => Ok(Scope::Archived),
            other => match other.strip_prefix("pet:") {
                Some("") => Err(ScopeParseError::MissingPetId),
                Some(id) => Ok(Scope::Pet(id.to_string())),
                None => Err(ScopeParseError::Unknown(other.to_string())),
            },
        }
    }
}
