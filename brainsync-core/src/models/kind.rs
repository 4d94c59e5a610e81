use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Area,
    Project,
    Task,
}

const AREA_STATUSES: &[&str] = &["active", "archived"];
const PROJECT_STATUSES: &[&str] = &["active", "on_hold", "completed", "archived"];
const TASK_STATUSES: &[&str] = &["todo", "in_progress", "waiting", "done", "cancelled"];

impl EntityKind {
    pub const ALL: [EntityKind; 3] = [EntityKind::Area, EntityKind::Project, EntityKind::Task];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Area => "area",
            EntityKind::Project => "project",
            EntityKind::Task => "task",
        }
    }

    /// Directory under the vault root that holds files of this kind.
    pub fn dir_name(&self) -> &'static str {
        match self {
            EntityKind::Area => "areas",
            EntityKind::Project => "projects",
            EntityKind::Task => "tasks",
        }
    }

    /// Resolves a kind from its directory name (`tasks` -> `Task`).
    pub fn from_dir_name(dir: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.dir_name() == dir)
    }

    pub fn statuses(&self) -> &'static [&'static str] {
        match self {
            EntityKind::Area => AREA_STATUSES,
            EntityKind::Project => PROJECT_STATUSES,
            EntityKind::Task => TASK_STATUSES,
        }
    }

    /// Status a new entity of this kind starts with.
    pub fn default_status(&self) -> &'static str {
        self.statuses()[0]
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "area" => Ok(EntityKind::Area),
            "project" => Ok(EntityKind::Project),
            "task" => Ok(EntityKind::Task),
            _ => Err(format!(
                "Invalid entity kind '{}'. Valid options: area, project, task",
                s
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_display() {
        assert_eq!(format!("{}", EntityKind::Area), "area");
        assert_eq!(format!("{}", EntityKind::Project), "project");
        assert_eq!(format!("{}", EntityKind::Task), "task");
    }

    #[test]
    fn test_kind_from_str() {
        assert_eq!(EntityKind::from_str("task").unwrap(), EntityKind::Task);
        assert_eq!(EntityKind::from_str("PROJECT").unwrap(), EntityKind::Project);
        assert_eq!(EntityKind::from_str(" Area ").unwrap(), EntityKind::Area);
        assert!(EntityKind::from_str("goal").is_err());
        assert!(EntityKind::from_str("").is_err());
    }

    #[test]
    fn test_dir_name_roundtrip() {
        for kind in EntityKind::ALL {
            assert_eq!(EntityKind::from_dir_name(kind.dir_name()), Some(kind));
        }
        assert_eq!(EntityKind::from_dir_name("inbox"), None);
    }

    #[test]
    fn test_default_status_is_allowed() {
        assert_eq!(EntityKind::Task.default_status(), "todo");
        assert_eq!(EntityKind::Project.default_status(), "active");
        for kind in EntityKind::ALL {
            assert!(kind.statuses().contains(&kind.default_status()));
        }
    }
}
