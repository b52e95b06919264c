//! Project and folder definitions.
//!
//! ```kdl
//! project "app" {
//!     label "linux && x64"
//!     triggers {
//!         scm "*/10 * * * *"
//!         upstream "lib" threshold="unstable"
//!     }
//!     step "make"
//!     archive "out/*.tar.gz"
//! }
//! ```

use crate::nodes::{
    get_all_string_args, get_bool_prop, get_first_bool_arg, get_first_string_arg,
    get_string_prop,
};
use crate::{ConfigError, ConfigResult};
use buildit_core::scm::ScmConfig;
use buildit_core::{
    BuildResult, ItemKind, LabelExpr, ProjectConfig, PublisherConfig, Step, Trigger, TriggerSet,
};
use kdl::{KdlDocument, KdlNode};
use tracing::warn;

/// A parsed item definition.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemDefinition {
    pub name: String,
    pub body: ItemBody,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ItemBody {
    Project(Box<ProjectConfig>),
    Folder { description: Option<String> },
}

impl ItemDefinition {
    pub fn kind(&self) -> ItemKind {
        match self.body {
            ItemBody::Project(_) => ItemKind::Project,
            ItemBody::Folder { .. } => ItemKind::Folder,
        }
    }

    /// The project configuration, or an error naming both kinds.
    pub fn into_project(self) -> ConfigResult<ProjectConfig> {
        match self.body {
            ItemBody::Project(config) => Ok(*config),
            ItemBody::Folder { .. } => Err(ConfigError::invalid(
                "item kind",
                format!("expected a project definition but '{}' is a folder", self.name),
            )),
        }
    }
}

/// Parse a single item definition from KDL text.
pub fn parse_item(kdl: &str) -> ConfigResult<ItemDefinition> {
    let mut items = parse_items(kdl)?;
    match items.len() {
        0 => Err(ConfigError::MissingField("project or folder".to_string())),
        1 => Ok(items.remove(0)),
        _ => Err(ConfigError::Duplicate(
            "more than one item in a single definition".to_string(),
        )),
    }
}

/// Parse every item definition in a KDL document.
pub fn parse_items(kdl: &str) -> ConfigResult<Vec<ItemDefinition>> {
    let doc: KdlDocument = kdl.parse()?;

    let mut items = Vec::new();
    for node in doc.nodes() {
        match node.name().value() {
            "project" => items.push(parse_project(node)?),
            "folder" => {
                let name = get_first_string_arg(node)
                    .ok_or_else(|| ConfigError::MissingField("folder name".to_string()))?;
                let description = node
                    .children()
                    .and_then(|c| c.nodes().iter().find(|n| n.name().value() == "description"))
                    .and_then(get_first_string_arg);
                items.push(ItemDefinition {
                    name,
                    body: ItemBody::Folder { description },
                });
            }
            other => warn!(node = other, "Ignoring unknown top-level node"),
        }
    }
    Ok(items)
}

fn parse_project(node: &KdlNode) -> ConfigResult<ItemDefinition> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("project name".to_string()))?;

    let mut config = ProjectConfig::default();
    let mut triggers = Vec::new();

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "description" => config.description = get_first_string_arg(child),
                "disabled" => config.disabled = flag(child, "disabled")?,
                "concurrent" | "concurrent-build" => {
                    config.concurrent_build = flag(child, "concurrent")?
                }
                "block-when-upstream-building" => {
                    config.block_when_upstream_building =
                        flag(child, "block-when-upstream-building")?
                }
                "label" => {
                    let expr = get_first_string_arg(child)
                        .ok_or_else(|| ConfigError::MissingField("label expression".to_string()))?;
                    config.assigned_label =
                        Some(LabelExpr::parse(&expr).map_err(|e| ConfigError::invalid("label", e))?);
                }
                "scm" => config.scm = parse_scm(child)?,
                "triggers" => {
                    if let Some(grandchildren) = child.children() {
                        for trigger_node in grandchildren.nodes() {
                            match parse_trigger(trigger_node) {
                                Ok(Some(trigger)) => triggers.push(trigger),
                                Ok(None) => warn!(
                                    project = %name,
                                    trigger = trigger_node.name().value(),
                                    "Skipping unknown trigger"
                                ),
                                Err(e) => return Err(e),
                            }
                        }
                    }
                }
                "step" => {
                    let command = get_first_string_arg(child)
                        .ok_or_else(|| ConfigError::MissingField("step command".to_string()))?;
                    config.steps.push(Step::Shell { command });
                }
                "archive" => {
                    let pattern = get_first_string_arg(child)
                        .ok_or_else(|| ConfigError::MissingField("archive pattern".to_string()))?;
                    config.publishers.push(PublisherConfig::ArchiveArtifacts {
                        pattern,
                        allow_empty: get_bool_prop(child, "allow-empty").unwrap_or(false),
                        only_if_successful: get_bool_prop(child, "only-if-successful")
                            .unwrap_or(false),
                    });
                }
                other => warn!(project = %name, node = other, "Ignoring unknown project setting"),
            }
        }
    }

    // Repeated kinds collapse to the last one.
    config.triggers = TriggerSet::from_triggers(triggers);

    Ok(ItemDefinition {
        name,
        body: ItemBody::Project(Box::new(config)),
    })
}

fn parse_trigger(node: &KdlNode) -> ConfigResult<Option<Trigger>> {
    let trigger = match node.name().value() {
        "timer" => Trigger::timer(
            get_first_string_arg(node)
                .ok_or_else(|| ConfigError::MissingField("timer schedule".to_string()))?,
        ),
        "scm" => Trigger::scm(
            get_first_string_arg(node)
                .ok_or_else(|| ConfigError::MissingField("scm schedule".to_string()))?,
        ),
        "upstream" => {
            let projects = get_all_string_args(node);
            if projects.is_empty() {
                return Err(ConfigError::MissingField("upstream projects".to_string()));
            }
            let threshold = match get_string_prop(node, "threshold") {
                Some(value) => value
                    .parse::<BuildResult>()
                    .map_err(|e| ConfigError::invalid("threshold", e))?,
                None => BuildResult::Success,
            };
            Trigger::upstream(projects, threshold)
        }
        _ => return Ok(None),
    };
    Ok(Some(trigger))
}

fn parse_scm(node: &KdlNode) -> ConfigResult<ScmConfig> {
    let kind = get_first_string_arg(node).unwrap_or_default();
    match kind.as_str() {
        "none" | "" => Ok(ScmConfig::None),
        "directory" => {
            let path = get_string_prop(node, "path")
                .ok_or_else(|| ConfigError::MissingField("scm path".to_string()))?;
            Ok(ScmConfig::Directory { path: path.into() })
        }
        other => Err(ConfigError::invalid("scm", format!("unknown scm type: {other}"))),
    }
}

/// A bare node (`disabled`) means true.
fn flag(node: &KdlNode, field: &str) -> ConfigResult<bool> {
    if node.entries().is_empty() {
        return Ok(true);
    }
    get_first_bool_arg(node)
        .ok_or_else(|| ConfigError::invalid(field, "expected #true or #false"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use buildit_core::TriggerKind;

    #[test]
    fn test_parse_full_project() {
        let kdl = r#"
            project "app" {
                description "The app"
                concurrent #true
                label "linux && x64"
                block-when-upstream-building
                scm "directory" path="/src/app"
                triggers {
                    scm "*/10 * * * *"
                    timer "H 2 * * *"
                    upstream "lib" "d/core" threshold="unstable"
                }
                step "echo \"Build #$BUILD_NUMBER\""
                archive "*.foo" allow-empty=#true
            }
        "#;

        let item = parse_item(kdl).unwrap();
        assert_eq!(item.name, "app");
        assert_eq!(item.kind(), ItemKind::Project);

        let config = item.into_project().unwrap();
        assert!(config.concurrent_build);
        assert!(!config.disabled);
        assert!(config.block_when_upstream_building);
        assert_eq!(config.assigned_label.as_ref().unwrap().to_string(), "linux && x64");
        assert_eq!(config.triggers.len(), 3);
        assert_eq!(config.upstream_names(), vec!["lib", "d/core"]);
        assert_eq!(
            config.steps,
            vec![Step::Shell {
                command: "echo \"Build #$BUILD_NUMBER\"".to_string()
            }]
        );
        assert_eq!(
            config.publishers,
            vec![PublisherConfig::ArchiveArtifacts {
                pattern: "*.foo".to_string(),
                allow_empty: true,
                only_if_successful: false,
            }]
        );
        assert_eq!(
            config.scm,
            ScmConfig::Directory {
                path: "/src/app".into()
            }
        );
    }

    #[test]
    fn test_repeated_trigger_kinds_last_wins() {
        let kdl = r#"
            project "p" {
                triggers {
                    scm "*/10 * * * *"
                    scm "*/15 * * * *"
                    sonar "nope"
                }
            }
        "#;

        let config = parse_item(kdl).unwrap().into_project().unwrap();
        assert_eq!(config.triggers.len(), 1);
        assert_eq!(
            config.triggers.get(TriggerKind::Scm).unwrap().spec(),
            Some("*/15 * * * *")
        );
    }

    #[test]
    fn test_empty_project_uses_defaults() {
        let config = parse_item(r#"project "p""#).unwrap().into_project().unwrap();
        assert_eq!(config, ProjectConfig::default());
    }

    #[test]
    fn test_folder_is_not_a_project() {
        let item = parse_item(r#"folder "d""#).unwrap();
        assert_eq!(item.kind(), ItemKind::Folder);
        let err = item.into_project().unwrap_err();
        assert!(err.to_string().contains("project"));
        assert!(err.to_string().contains("folder"));
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(parse_item(r#"project "p" { label "a &" }"#).is_err());
        assert!(parse_item(r#"project "p" { disabled "yes" }"#).is_err());
        assert!(parse_item(r#"project "p" { triggers { upstream } }"#).is_err());
        assert!(parse_item("").is_err());
        assert!(parse_item(r#"project "a"
project "b""#)
        .is_err());
    }
}
