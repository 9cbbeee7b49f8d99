use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

/// Workflow state a submission occupies.
///
/// `Other` carries the slug of a status string no synonym matched, so legacy
/// values survive normalization instead of being coerced into a wrong state.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CanonicalStatus {
    New,
    Ordered,
    Delivered,
    Completed,
    AwaitingResponse,
    Cancelled,
    Other(String),
}

impl CanonicalStatus {
    #[must_use]
    pub fn display_name(&self) -> &str {
        match self {
            Self::New => "New",
            Self::Ordered => "Ordered",
            Self::Delivered => "Delivered",
            Self::Completed => "Completed",
            Self::AwaitingResponse => "Awaiting Response",
            Self::Cancelled => "Cancelled",
            Self::Other(slug) => slug,
        }
    }
}

impl Display for CanonicalStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.display_name())
    }
}

/// Map a free-form or legacy status string onto a [`CanonicalStatus`].
///
/// Matching ignores case, surrounding whitespace and punctuation. Absent or
/// blank input is `New`; unmatched input becomes `Other(slug)`.
#[must_use]
pub fn normalize_status(raw: Option<&str>) -> CanonicalStatus {
    let Some(raw) = raw else {
        return CanonicalStatus::New;
    };
    let slug = slugify(raw);
    if slug.is_empty() {
        return CanonicalStatus::New;
    }
    synonym(&slug.replace('-', " ")).unwrap_or(CanonicalStatus::Other(slug))
}

/// Inverse of [`normalize_status`], used when a status is persisted.
#[must_use]
pub fn to_display_string(status: &CanonicalStatus) -> String {
    status.display_name().to_string()
}

fn synonym(key: &str) -> Option<CanonicalStatus> {
    let status = match key {
        "new" | "pending" | "submitted" | "open" | "not started" | "received request" => {
            CanonicalStatus::New
        }
        "ordered" | "processing" | "in progress" | "placed" | "order placed" => {
            CanonicalStatus::Ordered
        }
        "delivered" | "received" | "shipped" | "arrived" => CanonicalStatus::Delivered,
        "completed" | "complete" | "done" | "closed" | "fulfilled" | "resolved" => {
            CanonicalStatus::Completed
        }
        "awaiting response" | "awaiting reply" | "waiting" | "on hold" | "needs info" => {
            CanonicalStatus::AwaitingResponse
        }
        "cancelled" | "canceled" | "rejected" | "void" | "withdrawn" => CanonicalStatus::Cancelled,
        _ => return None,
    };
    Some(status)
}

fn slugify(raw: &str) -> String {
    let mut slug = String::with_capacity(raw.len());
    let mut pending_separator = false;
    for ch in raw.chars().flat_map(char::to_lowercase) {
        if ch.is_alphanumeric() {
            if pending_separator && !slug.is_empty() {
                slug.push('-');
            }
            pending_separator = false;
            slug.push(ch);
        } else {
            pending_separator = true;
        }
    }
    slug
}
