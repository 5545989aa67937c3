//! Curriculum records as the backend returns them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::keys::{EntityKey, OwnerKey};

/// The `{id, title, updatedAt}` triple that decides whether two
/// versions of a record are semantically the same.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordIdentity<'a> {
    pub id: &'a str,
    pub title: &'a str,
    pub updated_at: DateTime<Utc>,
}

/// Anything the entity cache can hold.
pub trait CacheRecord: Clone + Send + Sync + 'static {
    fn identity(&self) -> RecordIdentity<'_>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Book,
    Paper,
    Video,
    Article,
}

impl ResourceKind {
    pub fn label(&self) -> &'static str {
        match self {
            ResourceKind::Book => "Book",
            ResourceKind::Paper => "Paper",
            ResourceKind::Video => "Video",
            ResourceKind::Article => "Article",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub title: String,
    pub kind: ResourceKind,
    #[serde(default)]
    pub completed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Curriculum {
    pub id: EntityKey,
    pub owner_id: OwnerKey,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub resources: Vec<Resource>,
    pub updated_at: DateTime<Utc>,
}

impl Curriculum {
    pub fn completed_count(&self) -> usize {
        self.resources.iter().filter(|r| r.completed).count()
    }

    /// Progress as a whole percentage; an empty reading list counts as 0%.
    pub fn progress_percent(&self) -> u8 {
        if self.resources.is_empty() {
            return 0;
        }
        ((self.completed_count() * 100) / self.resources.len()) as u8
    }
}

impl CacheRecord for Curriculum {
    fn identity(&self) -> RecordIdentity<'_> {
        RecordIdentity {
            id: self.id.as_str(),
            title: &self.title,
            updated_at: self.updated_at,
        }
    }
}

/// Partial update sent to the backend. Absent fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurriculumPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<Vec<Resource>>,
}

impl CurriculumPatch {
    pub fn title(title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            ..Self::default()
        }
    }

    /// Apply to a local copy, the same way the backend would.
    pub fn apply_to(&self, curriculum: &mut Curriculum, at: DateTime<Utc>) {
        if let Some(ref title) = self.title {
            curriculum.title = title.clone();
        }
        if let Some(ref description) = self.description {
            curriculum.description = Some(description.clone());
        }
        if let Some(ref resources) = self.resources {
            curriculum.resources = resources.clone();
        }
        curriculum.updated_at = at;
    }
}

/// Summary numbers for the dashboard header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardAggregate {
    pub owner_id: OwnerKey,
    pub curriculum_count: usize,
    pub resource_count: usize,
    pub completed_count: usize,
    #[serde(default)]
    pub recently_updated: Vec<EntityKey>,
}

impl DashboardAggregate {
    /// Summarise a set of curricula, most recently updated first.
    pub fn from_curricula(owner_id: OwnerKey, curricula: &[Curriculum]) -> Self {
        let mut recent: Vec<&Curriculum> = curricula.iter().collect();
        recent.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Self {
            owner_id,
            curriculum_count: curricula.len(),
            resource_count: curricula.iter().map(|c| c.resources.len()).sum(),
            completed_count: curricula.iter().map(|c| c.completed_count()).sum(),
            recently_updated: recent.into_iter().take(5).map(|c| c.id.clone()).collect(),
        }
    }

    pub fn completion_ratio(&self) -> f64 {
        if self.resource_count == 0 {
            0.0
        } else {
            self.completed_count as f64 / self.resource_count as f64
        }
    }
}
