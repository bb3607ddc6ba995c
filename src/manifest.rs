//! The `.triggr.toml` task manifest
//!
//! A repository opts into builds by carrying a manifest at its root:
//!
//! ```toml
//! image = "golang:1.22"
//!
//! [[task]]
//! name = "unit"
//! command = ["make", "test"]
//!
//! [[task]]
//! name = "image"
//! image = "docker:dind"
//! command = ["make", "image"]
//! map-docker-sock = true
//! ```
//!
//! The manifest is read at the build revision, so a PR changing the manifest
//! builds with its own version.

use serde::Deserialize;

use crate::{Error, Result};

/// The decoded task manifest
#[derive(Clone, Debug, Default, Deserialize)]
pub struct Manifest {
    /// Default container image for tasks without an override
    #[serde(default)]
    pub image: Option<String>,
    /// Declared tasks, in execution order
    #[serde(default, rename = "task")]
    pub tasks: Vec<TaskConfig>,
}

/// One task declaration
#[derive(Clone, Debug, Deserialize)]
pub struct TaskConfig {
    /// Task name; becomes part of the pod name and the status context
    pub name: String,
    /// Per-task image override
    #[serde(default)]
    pub image: Option<String>,
    /// Argument vector passed to the container
    #[serde(default)]
    pub command: Vec<String>,
    /// Mount the host container-runtime socket into the task. Danger,
    /// Will Robinson.
    #[serde(default, rename = "map-docker-sock")]
    pub map_docker_sock: bool,
}

impl Manifest {
    /// Decode a manifest from raw file bytes
    pub fn parse(raw: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(raw)
            .map_err(|e| Error::manifest(format!("cannot parse .triggr.toml: {e}")))?;
        toml::from_str(text).map_err(|e| Error::manifest(format!("cannot parse .triggr.toml: {e}")))
    }

    /// Image a task runs with: the task override, else the manifest default
    pub fn resolve_image<'a>(&'a self, task: &'a TaskConfig) -> Result<&'a str> {
        task.image
            .as_deref()
            .or(self.image.as_deref())
            .ok_or_else(|| {
                Error::manifest(format!("task {:?} has no image and no default is set", task.name))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_manifest_with_tasks() {
        let manifest = Manifest::parse(
            br#"
image = "golang:1.22"

[[task]]
name = "unit"
command = ["make", "test"]

[[task]]
name = "image"
image = "docker:dind"
command = ["make", "image"]
map-docker-sock = true
"#,
        )
        .unwrap();

        assert_eq!(manifest.image.as_deref(), Some("golang:1.22"));
        assert_eq!(manifest.tasks.len(), 2);
        assert_eq!(manifest.tasks[0].name, "unit");
        assert_eq!(manifest.tasks[0].command, vec!["make", "test"]);
        assert!(!manifest.tasks[0].map_docker_sock);
        assert!(manifest.tasks[1].map_docker_sock);
    }

    #[test]
    fn task_order_is_preserved() {
        let manifest = Manifest::parse(
            br#"
image = "alpine"
[[task]]
name = "c"
[[task]]
name = "a"
[[task]]
name = "b"
"#,
        )
        .unwrap();
        let names: Vec<_> = manifest.tasks.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["c", "a", "b"]);
    }

    #[test]
    fn image_override_beats_default() {
        let manifest = Manifest::parse(
            br#"
image = "default:latest"
[[task]]
name = "unit"
[[task]]
name = "special"
image = "override:1"
"#,
        )
        .unwrap();
        assert_eq!(manifest.resolve_image(&manifest.tasks[0]).unwrap(), "default:latest");
        assert_eq!(manifest.resolve_image(&manifest.tasks[1]).unwrap(), "override:1");
    }

    #[test]
    fn missing_image_everywhere_is_an_error() {
        let manifest = Manifest::parse(b"[[task]]\nname = \"unit\"\n").unwrap();
        let err = manifest.resolve_image(&manifest.tasks[0]).unwrap_err();
        assert!(err.to_string().contains("no image"));
    }

    #[test]
    fn garbage_is_a_manifest_error() {
        let err = Manifest::parse(b"image = [not toml").unwrap_err();
        assert!(matches!(err, Error::Manifest(_)));
    }
}
