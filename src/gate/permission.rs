//! Who may settle or cancel a gate
//!
//! Identity resolution belongs to the host; this module only consumes it
//! through [`AccessControl`]. [`StaticAccessControl`] is a config-driven
//! implementation used by the sandbox server and tests.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Name used by the system principal
pub const SYSTEM_NAME: &str = "SYSTEM";

/// How names are compared. User ids and group ids may use different strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdStrategy {
    #[default]
    CaseInsensitive,
    CaseSensitive,
}

impl IdStrategy {
    pub fn equals(&self, a: &str, b: &str) -> bool {
        match self {
            IdStrategy::CaseInsensitive => a.to_lowercase() == b.to_lowercase(),
            IdStrategy::CaseSensitive => a == b,
        }
    }
}

/// An authenticated caller: a user name plus the groups it belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    name: String,
    authorities: Vec<String>,
    system: bool,
}

impl Principal {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            authorities: Vec::new(),
            system: false,
        }
    }

    /// The engine's own identity. Passes every permission check.
    pub fn system() -> Self {
        Self {
            name: SYSTEM_NAME.to_string(),
            authorities: Vec::new(),
            system: true,
        }
    }

    pub fn with_authorities<I, S>(mut self, authorities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.authorities = authorities.into_iter().map(Into::into).collect();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn authorities(&self) -> &[String] {
        &self.authorities
    }

    pub fn is_system(&self) -> bool {
        self.system
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Permission {
    /// Installation-wide administration
    Administer,
    /// Build permission on a job
    Build,
    /// Cancel permission on a job
    Cancel,
    /// Reporting the result of a release, as the deployment system
    Deploy,
}

/// The identity system, as seen by a gate
pub trait AccessControl: Send + Sync {
    /// False when the installation runs without security
    fn is_use_security(&self) -> bool;

    /// Whether `principal` holds `permission` on `job` (job full name).
    /// `Administer` is checked with the job ignored.
    fn has_permission(&self, principal: &Principal, permission: Permission, job: &str) -> bool;

    fn user_id_strategy(&self) -> IdStrategy {
        IdStrategy::CaseInsensitive
    }

    fn group_id_strategy(&self) -> IdStrategy {
        IdStrategy::CaseInsensitive
    }
}

/// Build/cancel grants for one job. Entries are user or group names.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobGrants {
    #[serde(default)]
    pub build: Vec<String>,
    #[serde(default)]
    pub cancel: Vec<String>,
}

/// Access table loaded from configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticAccessControl {
    #[serde(default = "default_use_security")]
    pub use_security: bool,

    /// Users or groups holding the administer permission
    #[serde(default)]
    pub admins: Vec<String>,

    #[serde(default)]
    pub user_id_strategy: IdStrategy,

    #[serde(default)]
    pub group_id_strategy: IdStrategy,

    /// Users or groups the deployment system reports results as
    #[serde(default)]
    pub deployers: Vec<String>,

    /// Grants per job full name; the key `*` applies to every job
    #[serde(default)]
    pub jobs: HashMap<String, JobGrants>,
}

fn default_use_security() -> bool {
    true
}

impl Default for StaticAccessControl {
    fn default() -> Self {
        Self {
            use_security: default_use_security(),
            admins: Vec::new(),
            user_id_strategy: IdStrategy::default(),
            group_id_strategy: IdStrategy::default(),
            deployers: Vec::new(),
            jobs: HashMap::new(),
        }
    }
}

impl StaticAccessControl {
    /// Security disabled: everyone may do everything
    pub fn unsecured() -> Self {
        Self {
            use_security: false,
            ..Default::default()
        }
    }

    pub fn with_admin(mut self, name: impl Into<String>) -> Self {
        self.admins.push(name.into());
        self
    }

    pub fn with_deployer(mut self, name: impl Into<String>) -> Self {
        self.deployers.push(name.into());
        self
    }

    pub fn grant_build(mut self, job: impl Into<String>, name: impl Into<String>) -> Self {
        self.jobs.entry(job.into()).or_default().build.push(name.into());
        self
    }

    pub fn grant_cancel(mut self, job: impl Into<String>, name: impl Into<String>) -> Self {
        self.jobs.entry(job.into()).or_default().cancel.push(name.into());
        self
    }

    fn matches(&self, principal: &Principal, entries: &[String]) -> bool {
        entries.iter().any(|entry| {
            self.user_id_strategy.equals(principal.name(), entry)
                || principal
                    .authorities()
                    .iter()
                    .any(|group| self.group_id_strategy.equals(group, entry))
        })
    }

    fn granted(&self, principal: &Principal, job: &str, pick: fn(&JobGrants) -> &[String]) -> bool {
        [job, "*"]
            .iter()
            .filter_map(|key| self.jobs.get(*key))
            .any(|grants| self.matches(principal, pick(grants)))
    }
}

impl AccessControl for StaticAccessControl {
    fn is_use_security(&self) -> bool {
        self.use_security
    }

    fn has_permission(&self, principal: &Principal, permission: Permission, job: &str) -> bool {
        if principal.is_system() || !self.use_security {
            return true;
        }
        if self.matches(principal, &self.admins) {
            return true;
        }
        match permission {
            Permission::Administer => false,
            Permission::Build => self.granted(principal, job, |g| g.build.as_slice()),
            Permission::Cancel => self.granted(principal, job, |g| g.cancel.as_slice()),
            Permission::Deploy => self.matches(principal, &self.deployers),
        }
    }

    fn user_id_strategy(&self) -> IdStrategy {
        self.user_id_strategy
    }

    fn group_id_strategy(&self) -> IdStrategy {
        self.group_id_strategy
    }
}

/// Decides settle/cancel rights for one gate's submitter spec
#[derive(Clone)]
pub struct PermissionEvaluator {
    access: Arc<dyn AccessControl>,
}

impl PermissionEvaluator {
    pub fn new(access: Arc<dyn AccessControl>) -> Self {
        Self { access }
    }

    fn overrides(&self, principal: &Principal, job: &str) -> bool {
        principal.is_system()
            || !self.access.is_use_security()
            || self
                .access
                .has_permission(principal, Permission::Administer, job)
    }

    /// Whether `principal` may settle a gate whose submitter spec is `submitter`.
    ///
    /// An empty spec falls back to build permission on the job. Otherwise the
    /// principal's name is compared with the user id strategy and each of its
    /// groups with the group id strategy.
    pub fn can_settle(&self, principal: &Principal, submitter: Option<&str>, job: &str) -> bool {
        if self.overrides(principal, job) {
            return true;
        }
        let spec = match submitter.map(str::trim).filter(|s| !s.is_empty()) {
            Some(spec) => spec,
            None => return self.access.has_permission(principal, Permission::Build, job),
        };

        let submitters: Vec<&str> = spec
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();

        let users = self.access.user_id_strategy();
        if submitters.iter().any(|s| users.equals(principal.name(), s)) {
            return true;
        }

        let groups = self.access.group_id_strategy();
        principal
            .authorities()
            .iter()
            .any(|group| submitters.iter().any(|s| groups.equals(group, s)))
    }

    pub fn can_cancel(&self, principal: &Principal, job: &str) -> bool {
        principal.is_system()
            || !self.access.is_use_security()
            || self.access.has_permission(principal, Permission::Cancel, job)
    }

    pub fn can_abort(&self, principal: &Principal, submitter: Option<&str>, job: &str) -> bool {
        self.can_cancel(principal, job) || self.can_settle(principal, submitter, job)
    }

    /// Whether `principal` may report a release failed, even while the
    /// release is in flight
    pub fn can_report(&self, principal: &Principal, job: &str) -> bool {
        self.overrides(principal, job)
            || self.access.has_permission(principal, Permission::Deploy, job)
    }

    pub fn submit_denied(submitter: Option<&str>) -> String {
        match submitter {
            Some(s) => format!("You need to be {} to submit this.", s),
            None => "You need to have Job/Build permissions to submit this.".to_string(),
        }
    }

    pub fn report_denied() -> String {
        "Only the deployment system may report the result of this release.".to_string()
    }

    pub fn cancel_denied(submitter: Option<&str>) -> String {
        match submitter {
            Some(s) => format!(
                "You need to be '{}' (or have Job/Cancel permissions) to cancel this.",
                s
            ),
            None => "You need to have Job/Cancel permissions to cancel this.".to_string(),
        }
    }
}
