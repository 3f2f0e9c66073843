use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Task-affinity domain an agent belongs to. Assigned at registration and
/// never changed afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Department {
    /// Acquisition, marketing and retention work.
    Growth,
    /// User-facing application work.
    Frontend,
    /// Services, storage and infrastructure work.
    Backend,
    /// Research and exploratory work.
    #[serde(rename = "rnd")]
    RnD,
}

impl Department {
    /// Every department, in a fixed order used for round-robin interleaving.
    pub const ALL: [Department; 4] = [
        Department::Growth,
        Department::Frontend,
        Department::Backend,
        Department::RnD,
    ];

    /// Stable lowercase name, also used in state-store keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            Department::Growth => "growth",
            Department::Frontend => "frontend",
            Department::Backend => "backend",
            Department::RnD => "rnd",
        }
    }
}

impl std::fmt::Display for Department {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Department {
    type Err = crate::CohortError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "growth" => Ok(Department::Growth),
            "frontend" => Ok(Department::Frontend),
            "backend" => Ok(Department::Backend),
            "rnd" | "r&d" | "research" => Ok(Department::RnD),
            other => Err(crate::CohortError::Config(format!(
                "unknown department '{other}'"
            ))),
        }
    }
}
