use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::catalog::StepDefinition;
use crate::error::{codes, FlowError};

/// Decides which of the candidate steps `actor` may take.
pub trait AuthorizationPolicy {
    /// Returns the permitted subset of `steps`, preserving order.
    ///
    /// # Errors
    /// Implementations fail when the authorization backend is unavailable.
    fn authorize(
        &self,
        steps: &[StepDefinition],
        actor: &str,
    ) -> Result<Vec<StepDefinition>, FlowError>;
}

impl<F> AuthorizationPolicy for F
where
    F: Fn(&[StepDefinition], &str) -> Result<Vec<StepDefinition>, FlowError>,
{
    fn authorize(
        &self,
        steps: &[StepDefinition],
        actor: &str,
    ) -> Result<Vec<StepDefinition>, FlowError> {
        self(steps, actor)
    }
}

/// Actor to role assignments.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct RoleDirectory {
    #[serde(default)]
    pub users: BTreeMap<String, BTreeSet<String>>,
}

impl RoleDirectory {
    #[must_use]
    pub fn roles_of(&self, actor: &str) -> Option<&BTreeSet<String>> {
        self.users.get(actor)
    }

    pub fn assign(&mut self, actor: impl Into<String>, role: impl Into<String>) {
        self.users
            .entry(actor.into())
            .or_default()
            .insert(role.into());
    }
}

/// # Errors
/// Returns [`FlowError::Configuration`] when the file is unreadable or not
/// valid YAML.
pub fn load_role_directory_from_path(path: &Path) -> Result<RoleDirectory, FlowError> {
    let raw = std::fs::read_to_string(path).map_err(|err| {
        FlowError::configuration(
            codes::CATALOG_INVALID,
            format!("failed to read role directory {}: {err}", path.display()),
        )
    })?;
    serde_yaml::from_str(&raw).map_err(|err| {
        FlowError::configuration(
            codes::CATALOG_INVALID,
            format!("invalid role directory {}: {err}", path.display()),
        )
    })
}

/// Authorizes a step when the actor holds any of its `allowed_roles`.
#[derive(Debug, Clone, Default)]
pub struct RoleMembershipPolicy {
    directory: RoleDirectory,
}

impl RoleMembershipPolicy {
    #[must_use]
    pub fn new(directory: RoleDirectory) -> Self {
        Self { directory }
    }

    #[must_use]
    pub fn directory(&self) -> &RoleDirectory {
        &self.directory
    }
}

impl AuthorizationPolicy for RoleMembershipPolicy {
    fn authorize(
        &self,
        steps: &[StepDefinition],
        actor: &str,
    ) -> Result<Vec<StepDefinition>, FlowError> {
        let Some(roles) = self.directory.roles_of(actor) else {
            return Ok(Vec::new());
        };
        Ok(steps
            .iter()
            .filter(|step| step.allowed_roles.iter().any(|role| roles.contains(role)))
            .cloned()
            .collect())
    }
}
