use nix::unistd::{Group, User};

use crate::core::domain::RunIdentity;
use crate::core::results::ResultPriorities;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("run user `{0}` does not exist")]
    UnknownUser(String),
    #[error("run group `{0}` does not exist")]
    UnknownGroup(String),
    #[error("a run group was given without a run user")]
    GroupWithoutUser,
    #[error("looking up `{name}` failed: {msg}")]
    Lookup { name: String, msg: String },
}

/// Daemon wide settings. Built once at start-up and never changed afterwards.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct JudgeConfig {
    pub run_identity: Option<RunIdentity>,
    pub lazy_eval: bool,
    pub priorities: ResultPriorities,
}

impl JudgeConfig {
    pub fn new(run_identity: Option<RunIdentity>, lazy_eval: bool) -> Self {
        JudgeConfig {
            run_identity,
            lazy_eval,
            priorities: ResultPriorities::default(),
        }
    }

    /// Resolves `runuser`/`rungroup` names against the system databases.
    ///
    /// Without a group the user's primary group is used.
    pub fn resolve(
        runuser: Option<&str>,
        rungroup: Option<&str>,
        lazy_eval: bool,
    ) -> Result<Self, ConfigError> {
        let run_identity = match (runuser, rungroup) {
            (None, None) => None,
            (None, Some(_)) => return Err(ConfigError::GroupWithoutUser),
            (Some(user), group) => Some(resolve_identity(user, group)?),
        };
        Ok(JudgeConfig::new(run_identity, lazy_eval))
    }
}

fn resolve_identity(user_name: &str, group_name: Option<&str>) -> Result<RunIdentity, ConfigError> {
    let user = User::from_name(user_name)
        .map_err(|e| ConfigError::Lookup {
            name: user_name.to_string(),
            msg: e.to_string(),
        })?
        .ok_or_else(|| ConfigError::UnknownUser(user_name.to_string()))?;

    let group = match group_name {
        Some(name) => Group::from_name(name)
            .map_err(|e| ConfigError::Lookup {
                name: name.to_string(),
                msg: e.to_string(),
            })?
            .ok_or_else(|| ConfigError::UnknownGroup(name.to_string()))?,
        None => Group::from_gid(user.gid)
            .map_err(|e| ConfigError::Lookup {
                name: user_name.to_string(),
                msg: e.to_string(),
            })?
            .ok_or_else(|| ConfigError::UnknownGroup(user.gid.to_string()))?,
    };

    Ok(RunIdentity {
        user: user.name,
        group: group.name,
        uid: user.uid.as_raw(),
        gid: group.gid.as_raw(),
    })
}
