use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Project {
    pub id: i64,
    pub git_hash: Option<String>,
    pub url: Option<String>,
    pub name: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    /// Large object holding the project files, if uploaded.
    pub large_data_id: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NewProject {
    pub name: String,
    pub url: Option<String>,
    pub git_hash: Option<String>,
    pub description: Option<String>,
    pub large_data_id: Option<i64>,
}

impl NewProject {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

/// Partial update. `None` leaves a field untouched; `Some(None)` clears a
/// nullable field.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProjectPatch {
    pub name: Option<String>,
    pub url: Option<Option<String>>,
    pub git_hash: Option<Option<String>>,
    pub description: Option<Option<String>>,
}

/// Owning project of a child row. Child rows may exist on their own.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProjectRef {
    #[default]
    Absent,
    Present(i64),
}

impl ProjectRef {
    pub fn id(self) -> Option<i64> {
        match self {
            ProjectRef::Absent => None,
            ProjectRef::Present(id) => Some(id),
        }
    }
}

impl From<Option<i64>> for ProjectRef {
    fn from(id: Option<i64>) -> Self {
        id.map_or(ProjectRef::Absent, ProjectRef::Present)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ChildKind {
    Inventory,
    ExtraVar,
    Playbook,
}

impl ChildKind {
    pub const ALL: [ChildKind; 3] = [
        ChildKind::Inventory,
        ChildKind::ExtraVar,
        ChildKind::Playbook,
    ];

    pub fn table(self) -> &'static str {
        match self {
            ChildKind::Inventory => "inventory",
            ChildKind::ExtraVar => "extra_var",
            ChildKind::Playbook => "playbook",
        }
    }

    /// Each child table keeps its payload in a column named after the table.
    pub fn body_column(self) -> &'static str {
        self.table()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChildRecord {
    pub kind: ChildKind,
    pub id: i64,
    pub name: Option<String>,
    pub body: Option<String>,
    pub project: ProjectRef,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewChild {
    pub kind: ChildKind,
    pub project: ProjectRef,
    pub name: Option<String>,
    pub body: Option<String>,
}

impl NewChild {
    pub fn new(kind: ChildKind, project: ProjectRef) -> Self {
        Self {
            kind,
            project,
            name: None,
            body: None,
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }
}
