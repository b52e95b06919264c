//! System configuration parsing.
//!
//! ```kdl
//! root "/var/lib/buildit"
//! listen "0.0.0.0:8080"
//! tick-interval 60
//! left-items 64
//! executor "linux-1" {
//!     labels "linux" "x64"
//! }
//! ```
//!
//! `executors 4` declares anonymous executors without labels. Every field
//! has a default.
//!
//! Permissions are granted per user, globally or on an item and everything
//! below it. `anonymous` names requests without a user. Without an
//! `authorization` block nobody may do anything; `allow-all #true` lifts
//! every check.
//!
//! ```kdl
//! authorization {
//!     grant "admin" "read" "build" "configure" "delete" "wipeout"
//!     grant "anonymous" "read"
//!     grant "dev" "build" "wipeout" item="team"
//! }
//! ```

use crate::nodes::{
    get_all_string_args, get_first_bool_arg, get_first_integer_arg, get_first_string_arg,
    get_string_prop,
};
use crate::{ConfigError, ConfigResult};
use buildit_core::FullName;
use buildit_core::security::{AllowAll, Authorizer, MatrixAuthorizer, Permission};
use kdl::{KdlDocument, KdlNode};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

/// System-wide configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemConfig {
    /// Storage root for items, builds and workspaces.
    pub root: PathBuf,
    /// HTTP listen address.
    pub listen: String,
    /// Seconds between trigger evaluations.
    pub tick_interval_secs: u64,
    /// Finished queue items kept for lookup.
    pub left_items: usize,
    pub executors: Vec<ExecutorConfig>,
    pub authorization: AuthorizationConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorConfig {
    pub name: String,
    pub labels: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationConfig {
    /// Skip permission checks entirely.
    pub allow_all: bool,
    pub grants: Vec<GrantConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantConfig {
    pub user: String,
    pub permissions: Vec<Permission>,
    /// Limit the grant to this item and its descendants.
    pub item: Option<FullName>,
}

impl AuthorizationConfig {
    pub fn authorizer(&self) -> Arc<dyn Authorizer> {
        if self.allow_all {
            return Arc::new(AllowAll);
        }
        let matrix = self
            .grants
            .iter()
            .fold(MatrixAuthorizer::new(), |matrix, grant| match &grant.item {
                Some(item) => matrix.grant_on(&grant.user, item.clone(), &grant.permissions),
                None => matrix.grant(&grant.user, &grant.permissions),
            });
        Arc::new(matrix)
    }
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("buildit-home"),
            listen: "127.0.0.1:8080".to_string(),
            tick_interval_secs: 60,
            left_items: 64,
            executors: anonymous_executors(2),
            authorization: AuthorizationConfig::default(),
        }
    }
}

fn anonymous_executors(count: usize) -> Vec<ExecutorConfig> {
    (1..=count)
        .map(|i| ExecutorConfig {
            name: format!("executor-{i}"),
            labels: Vec::new(),
        })
        .collect()
}

/// Parse system configuration from KDL text.
pub fn parse_system_config(kdl: &str) -> ConfigResult<SystemConfig> {
    let doc: KdlDocument = kdl.parse()?;

    let mut config = SystemConfig::default();
    let mut executors = Vec::new();
    let mut executor_count = None;

    for node in doc.nodes() {
        match node.name().value() {
            "root" => {
                config.root = get_first_string_arg(node)
                    .ok_or_else(|| ConfigError::MissingField("root path".to_string()))?
                    .into();
            }
            "listen" => {
                config.listen = get_first_string_arg(node)
                    .ok_or_else(|| ConfigError::MissingField("listen address".to_string()))?;
            }
            "tick-interval" => {
                config.tick_interval_secs = positive(node, "tick-interval")? as u64;
            }
            "left-items" => {
                config.left_items = positive(node, "left-items")? as usize;
            }
            "executors" => {
                let count = get_first_integer_arg(node)
                    .filter(|n| (0..=1024).contains(n))
                    .ok_or_else(|| ConfigError::invalid("executors", "expected a count"))?;
                executor_count = Some(count as usize);
            }
            "executor" => executors.push(parse_executor(node)?),
            "authorization" => config.authorization = parse_authorization(node)?,
            other => warn!(node = other, "Ignoring unknown system setting"),
        }
    }

    let mut seen = HashSet::new();
    for executor in &executors {
        if !seen.insert(executor.name.as_str()) {
            return Err(ConfigError::Duplicate(format!("executor '{}'", executor.name)));
        }
    }

    config.executors = match (executors.is_empty(), executor_count) {
        (false, _) => executors,
        (true, Some(count)) => anonymous_executors(count),
        (true, None) => config.executors,
    };
    Ok(config)
}

/// Load the system configuration from a file, or the defaults without one.
pub fn load_system_config(path: Option<&Path>) -> ConfigResult<SystemConfig> {
    match path {
        Some(path) => parse_system_config(&std::fs::read_to_string(path)?),
        None => Ok(SystemConfig::default()),
    }
}

fn parse_executor(node: &KdlNode) -> ConfigResult<ExecutorConfig> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("executor name".to_string()))?;
    let mut labels = Vec::new();
    if let Some(children) = node.children() {
        for child in children.nodes() {
            if child.name().value() == "labels" {
                labels.extend(get_all_string_args(child));
            }
        }
    }
    Ok(ExecutorConfig { name, labels })
}

fn parse_authorization(node: &KdlNode) -> ConfigResult<AuthorizationConfig> {
    let mut authorization = AuthorizationConfig::default();
    let Some(children) = node.children() else {
        return Ok(authorization);
    };
    for child in children.nodes() {
        match child.name().value() {
            "allow-all" => {
                authorization.allow_all = get_first_bool_arg(child)
                    .ok_or_else(|| ConfigError::invalid("allow-all", "expected #true or #false"))?;
            }
            "grant" => authorization.grants.push(parse_grant(child)?),
            other => warn!(node = other, "Ignoring unknown authorization setting"),
        }
    }
    Ok(authorization)
}

fn parse_grant(node: &KdlNode) -> ConfigResult<GrantConfig> {
    let mut args = get_all_string_args(node).into_iter();
    let user = args
        .next()
        .ok_or_else(|| ConfigError::MissingField("grant user".to_string()))?;
    let permissions = args
        .map(|p| p.parse::<Permission>().map_err(|e| ConfigError::invalid("grant", e)))
        .collect::<ConfigResult<Vec<_>>>()?;
    if permissions.is_empty() {
        return Err(ConfigError::MissingField(format!("permissions for '{user}'")));
    }
    let item = get_string_prop(node, "item")
        .map(|item| FullName::parse(&item).map_err(|e| ConfigError::invalid("grant item", e)))
        .transpose()?;
    Ok(GrantConfig {
        user,
        permissions,
        item,
    })
}

fn positive(node: &KdlNode, field: &str) -> ConfigResult<i128> {
    get_first_integer_arg(node)
        .filter(|n| *n > 0 && *n <= i128::from(u32::MAX))
        .ok_or_else(|| ConfigError::invalid(field, "expected a positive integer"))
}
