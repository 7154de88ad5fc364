//! Role → visibility scope lookup
//!
//! REST callers only see nodes and deployments inside their scope. The
//! widest role a caller holds wins.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::auth::CallerIdentity;

/// Tenancy of a node or deployment
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ownership {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub org_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

impl Ownership {
    /// Ownership stamped on records a caller creates
    pub fn of(caller: &CallerIdentity) -> Self {
        Self {
            org_id: caller.org_id.clone(),
            group_id: caller.group_id.clone(),
            user_id: caller.user_id.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RoleLevel {
    Member,
    Group,
    Organization,
    Universe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoleAccess {
    Owner,
    Editor,
    Viewer,
}

/// A `{level}.{access}` role such as `organization.viewer`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Role {
    pub level: RoleLevel,
    pub access: RoleAccess,
}

impl Role {
    pub fn can_write(&self) -> bool {
        self.access != RoleAccess::Viewer
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (level, access) = s
            .split_once('.')
            .ok_or_else(|| format!("invalid role '{}'", s))?;

        let level = match level {
            "universe" => RoleLevel::Universe,
            "organization" => RoleLevel::Organization,
            "group" => RoleLevel::Group,
            "member" => RoleLevel::Member,
            _ => return Err(format!("invalid role '{}'", s)),
        };
        let access = match access {
            "owner" => RoleAccess::Owner,
            "editor" => RoleAccess::Editor,
            "viewer" => RoleAccess::Viewer,
            _ => return Err(format!("invalid role '{}'", s)),
        };

        // universe only has an owner role
        if level == RoleLevel::Universe && access != RoleAccess::Owner {
            return Err(format!("invalid role '{}'", s));
        }
        Ok(Role { level, access })
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self.level {
            RoleLevel::Universe => "universe",
            RoleLevel::Organization => "organization",
            RoleLevel::Group => "group",
            RoleLevel::Member => "member",
        };
        let access = match self.access {
            RoleAccess::Owner => "owner",
            RoleAccess::Editor => "editor",
            RoleAccess::Viewer => "viewer",
        };
        write!(f, "{}.{}", level, access)
    }
}

/// Which records a caller may observe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    Universe,
    Organization { org_id: String },
    Group { org_id: String, group_id: String },
    Member { user_id: Option<String> },
}

impl Scope {
    pub fn for_identity(caller: &CallerIdentity) -> Self {
        let widest = caller
            .roles
            .iter()
            .filter_map(|r| r.parse::<Role>().ok())
            .map(|r| r.level)
            .max();

        let member = || Scope::Member {
            user_id: caller.user_id.clone(),
        };

        match widest {
            Some(RoleLevel::Universe) => Scope::Universe,
            Some(RoleLevel::Organization) => match &caller.org_id {
                Some(org_id) => Scope::Organization {
                    org_id: org_id.clone(),
                },
                None => member(),
            },
            Some(RoleLevel::Group) => match (&caller.org_id, &caller.group_id) {
                (Some(org_id), Some(group_id)) => Scope::Group {
                    org_id: org_id.clone(),
                    group_id: group_id.clone(),
                },
                _ => member(),
            },
            Some(RoleLevel::Member) | None => member(),
        }
    }

    pub fn permits(&self, owner: &Ownership) -> bool {
        match self {
            Scope::Universe => true,
            Scope::Organization { org_id } => owner.org_id.as_ref() == Some(org_id),
            Scope::Group { org_id, group_id } => {
                owner.org_id.as_ref() == Some(org_id) && owner.group_id.as_ref() == Some(group_id)
            }
            Scope::Member { user_id: Some(user_id) } => owner.user_id.as_ref() == Some(user_id),
            Scope::Member { user_id: None } => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caller(roles: &[&str]) -> CallerIdentity {
        CallerIdentity {
            org_id: Some("org-1".to_string()),
            group_id: Some("grp-1".to_string()),
            user_id: Some("user-1".to_string()),
            agent_id: None,
            roles: roles.iter().map(|r| r.to_string()).collect(),
        }
    }

    fn owned(org: &str, group: &str, user: &str) -> Ownership {
        Ownership {
            org_id: Some(org.to_string()),
            group_id: Some(group.to_string()),
            user_id: Some(user.to_string()),
        }
    }

    #[test]
    fn test_parse_roles() {
        let role: Role = "organization.viewer".parse().unwrap();
        assert_eq!(role.level, RoleLevel::Organization);
        assert!(!role.can_write());
        assert_eq!(role.to_string(), "organization.viewer");

        assert!("universe.viewer".parse::<Role>().is_err());
        assert!("admin".parse::<Role>().is_err());
        assert!("team.owner".parse::<Role>().is_err());
    }

    #[test]
    fn test_widest_role_wins() {
        let scope = Scope::for_identity(&caller(&["member.owner", "organization.viewer"]));
        assert_eq!(
            scope,
            Scope::Organization {
                org_id: "org-1".to_string()
            }
        );
    }

    #[test]
    fn test_scope_filtering() {
        let mine = owned("org-1", "grp-1", "user-1");
        let same_group = owned("org-1", "grp-1", "user-2");
        let same_org = owned("org-1", "grp-2", "user-3");
        let foreign = owned("org-2", "grp-9", "user-9");

        let universe = Scope::for_identity(&caller(&["universe.owner"]));
        assert!(universe.permits(&foreign));

        let org = Scope::for_identity(&caller(&["organization.editor"]));
        assert!(org.permits(&same_org));
        assert!(!org.permits(&foreign));

        let group = Scope::for_identity(&caller(&["group.viewer"]));
        assert!(group.permits(&same_group));
        assert!(!group.permits(&same_org));

        let member = Scope::for_identity(&caller(&["member.viewer"]));
        assert!(member.permits(&mine));
        assert!(!member.permits(&same_group));
    }

    #[test]
    fn test_no_roles_sees_own_records() {
        let scope = Scope::for_identity(&caller(&[]));
        assert!(scope.permits(&owned("org-1", "grp-1", "user-1")));
        assert!(!scope.permits(&Ownership::default()));
    }

    #[test]
    fn test_anonymous_member_sees_nothing() {
        let scope = Scope::Member { user_id: None };
        assert!(!scope.permits(&Ownership::default()));
    }
}
