//! Per-repository index configuration and the default job used when a
//! repository has none.

use serde::{Deserialize, Serialize};

use crate::models::{DockerStep, NewWorkItem};

/// Explicit configuration document stored for a repository.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IndexConfiguration {
    /// Steps run before every job.
    #[serde(default)]
    pub shared_steps: Vec<DockerStep>,
    #[serde(default)]
    pub index_jobs: Vec<IndexJob>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IndexJob {
    #[serde(default)]
    pub steps: Vec<DockerStep>,
    #[serde(default)]
    pub local_steps: Vec<String>,
    #[serde(default)]
    pub root: String,
    pub indexer: String,
    #[serde(default)]
    pub indexer_args: Vec<String>,
    #[serde(default)]
    pub outfile: String,
}

impl IndexConfiguration {
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// One descriptor per job. Shared steps run first.
    pub fn descriptors(&self, repository_id: i64, commit: &str) -> Vec<NewWorkItem> {
        self.index_jobs
            .iter()
            .map(|job| NewWorkItem {
                repository_id,
                commit: commit.to_string(),
                root: job.root.clone(),
                indexer: job.indexer.clone(),
                indexer_args: job.indexer_args.clone(),
                outfile: job.outfile.clone(),
                docker_steps: self
                    .shared_steps
                    .iter()
                    .chain(job.steps.iter())
                    .cloned()
                    .collect(),
                local_steps: job.local_steps.clone(),
            })
            .collect()
    }
}

/// The job inferred for repositories without explicit configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexJobDefaults {
    pub indexer: String,
    pub indexer_args: Vec<String>,
    pub root: String,
    pub outfile: String,
}

impl Default for IndexJobDefaults {
    fn default() -> Self {
        Self {
            indexer: "sourcegraph/lsif-go:latest".to_string(),
            indexer_args: vec!["lsif-go".to_string(), "--no-animation".to_string()],
            root: String::new(),
            outfile: String::new(),
        }
    }
}

impl IndexJobDefaults {
    pub fn descriptor(&self, repository_id: i64, commit: &str) -> NewWorkItem {
        NewWorkItem {
            repository_id,
            commit: commit.to_string(),
            root: self.root.clone(),
            indexer: self.indexer.clone(),
            indexer_args: self.indexer_args.clone(),
            outfile: self.outfile.clone(),
            docker_steps: Vec::new(),
            local_steps: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"{
        "shared_steps": [
            {"root": "/", "image": "node:12", "commands": ["yarn install --frozen-lockfile"]}
        ],
        "index_jobs": [
            {
                "steps": [{"image": "node:12", "commands": ["yarn run build"]}],
                "root": "web",
                "indexer": "sourcegraph/lsif-tsc",
                "indexer_args": ["lsif-tsc", "-p", "."],
                "outfile": "dump.lsif"
            },
            {
                "root": "server",
                "indexer": "sourcegraph/lsif-go",
                "local_steps": ["go mod vendor"]
            }
        ]
    }"#;

    #[test]
    fn test_jobs_merge_shared_steps() {
        let config = IndexConfiguration::parse(CONFIG).unwrap();
        let descriptors = config.descriptors(42, "deadbeef");
        assert_eq!(descriptors.len(), 2);

        let web = &descriptors[0];
        assert_eq!(web.repository_id, 42);
        assert_eq!(web.commit, "deadbeef");
        assert_eq!(web.root, "web");
        assert_eq!(web.docker_steps.len(), 2);
        assert_eq!(web.docker_steps[0].commands, vec!["yarn install --frozen-lockfile"]);
        assert_eq!(web.docker_steps[1].commands, vec!["yarn run build"]);
        assert_eq!(web.outfile, "dump.lsif");

        let server = &descriptors[1];
        assert_eq!(server.docker_steps.len(), 1);
        assert_eq!(server.local_steps, vec!["go mod vendor"]);
        assert!(server.indexer_args.is_empty());
    }

    #[test]
    fn test_invalid_configuration_is_rejected() {
        assert!(IndexConfiguration::parse("{\"index_jobs\": [{}]}").is_err());
        assert!(IndexConfiguration::parse("not json").is_err());
    }

    #[test]
    fn test_default_descriptor() {
        let defaults = IndexJobDefaults {
            indexer: "sourcegraph/scip-go".to_string(),
            ..Default::default()
        };
        let descriptor = defaults.descriptor(7, "cafebabe");
        assert_eq!(descriptor.indexer, "sourcegraph/scip-go");
        assert_eq!(descriptor.commit, "cafebabe");
        assert!(descriptor.docker_steps.is_empty());
    }
}
