use crate::assignment::AssignmentTable;
use cumulus_core::config::Config;
use cumulus_core::errors::{ConfigError, SchedulingError};
use cumulus_core::graph::StepGraph;
use cumulus_core::model::{AuthKind, ClusterConfig, StorageConfig};
use cumulus_storage::StorageScope;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};

/// What `cumulus clusters` shows. Credentials never leave the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClusterInfo {
    pub index: usize,
    pub name: String,
    pub endpoint: String,
    pub auth: AuthKind,
    pub verify_tls: bool,
    pub dedicated: bool,
    pub steps: Vec<String>,
}

/// Where one step would run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedStep {
    pub step: String,
    pub cluster: String,
    pub explicit: bool,
}

/// The validated, immutable set of clusters for one job.
#[derive(Debug, Clone)]
pub struct ClusterRegistry {
    clusters: Vec<ClusterConfig>,
    shared_storage: Option<StorageConfig>,
    bindings: BTreeMap<String, usize>,
}

impl ClusterRegistry {
    pub fn new(
        clusters: Vec<ClusterConfig>,
        shared_storage: Option<StorageConfig>,
        placement: &BTreeMap<String, String>,
    ) -> Result<Self, ConfigError> {
        if clusters.is_empty() {
            return Err(ConfigError::NoClusters);
        }

        let mut names = HashSet::new();
        for cluster in &clusters {
            if cluster.endpoint.trim().is_empty() {
                return Err(ConfigError::EmptyEndpoint(cluster.name.clone()));
            }
            if !names.insert(cluster.name.as_str()) {
                return Err(ConfigError::DuplicateClusterName(cluster.name.clone()));
            }
        }

        if clusters.len() > 1 && shared_storage.is_none() {
            return Err(ConfigError::SharedStorageRequired {
                count: clusters.len(),
            });
        }

        let mut bindings: BTreeMap<String, usize> = BTreeMap::new();
        let mut bind = |step: &str, index: usize| -> Result<(), ConfigError> {
            match bindings.get(step) {
                Some(&existing) if existing != index => Err(ConfigError::ConflictingBinding {
                    step: step.to_string(),
                    first: clusters[existing].name.clone(),
                    second: clusters[index].name.clone(),
                }),
                Some(_) => Ok(()),
                None => {
                    bindings.insert(step.to_string(), index);
                    Ok(())
                }
            }
        };

        for (index, cluster) in clusters.iter().enumerate() {
            for step in &cluster.steps {
                bind(step, index)?;
            }
        }
        for (step, cluster_name) in placement {
            let index = clusters
                .iter()
                .position(|c| &c.name == cluster_name)
                .ok_or_else(|| ConfigError::UnknownClusterBinding {
                    step: step.clone(),
                    cluster: cluster_name.clone(),
                })?;
            bind(step, index)?;
        }

        Ok(Self {
            clusters,
            shared_storage,
            bindings,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        Self::new(
            config.clusters.clone(),
            config.shared_storage.clone(),
            &config.placement,
        )
    }

    pub fn len(&self) -> usize {
        self.clusters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }

    pub fn clusters(&self) -> &[ClusterConfig] {
        &self.clusters
    }

    pub fn get(&self, index: usize) -> Option<&ClusterConfig> {
        self.clusters.get(index)
    }

    pub fn by_name(&self, name: &str) -> Option<(usize, &ClusterConfig)> {
        self.clusters.iter().enumerate().find(|(_, c)| c.name == name)
    }

    /// Explicit step bindings, step name to cluster index.
    pub fn bindings(&self) -> &BTreeMap<String, usize> {
        &self.bindings
    }

    /// Every binding must name a step of the workflow.
    pub fn validate_for(&self, graph: &StepGraph) -> Result<(), ConfigError> {
        for (step, &index) in &self.bindings {
            if graph.step(step).is_none() {
                return Err(ConfigError::BindingToUnknownStep {
                    step: step.clone(),
                    cluster: self.clusters[index].name.clone(),
                });
            }
        }
        Ok(())
    }

    /// Non-dedicated clusters take part in round-robin. If every cluster is
    /// dedicated, all of them do.
    pub fn assignment_table(&self) -> AssignmentTable {
        let mut pool: Vec<usize> = self
            .clusters
            .iter()
            .enumerate()
            .filter(|(_, c)| !c.dedicated)
            .map(|(i, _)| i)
            .collect();
        if pool.is_empty() {
            pool = (0..self.clusters.len()).collect();
        }
        AssignmentTable::new(self.bindings.clone(), pool)
    }

    /// The assignment a job over `graph` would make, in topological order.
    pub fn plan(&self, graph: &StepGraph) -> Result<Vec<PlannedStep>, SchedulingError> {
        let mut table = self.assignment_table();
        let plan = graph
            .topological_order()?
            .into_iter()
            .map(|i| {
                let step = graph.steps[i].name.clone();
                let index = table.assign(&step);
                PlannedStep {
                    explicit: self.bindings.contains_key(&step),
                    cluster: self.clusters[index].name.clone(),
                    step,
                }
            })
            .collect();
        Ok(plan)
    }

    /// The store every cluster of this job reads and writes.
    pub fn storage(&self) -> Result<(StorageConfig, StorageScope), ConfigError> {
        let (config, scope) = match (&self.shared_storage, self.clusters.as_slice()) {
            (Some(shared), _) => (shared.clone(), StorageScope::Shared),
            (None, [only]) => {
                let storage = only
                    .storage
                    .clone()
                    .ok_or_else(|| ConfigError::StorageNotConfigured(only.name.clone()))?;
                (
                    storage,
                    StorageScope::ClusterLocal {
                        cluster: only.name.clone(),
                    },
                )
            }
            (None, many) => {
                return Err(ConfigError::SharedStorageRequired { count: many.len() });
            }
        };
        self.check_scope(&scope)?;
        Ok((config, scope))
    }

    pub fn check_scope(&self, scope: &StorageScope) -> Result<(), ConfigError> {
        match scope {
            StorageScope::ClusterLocal { .. } if self.clusters.len() > 1 => {
                Err(ConfigError::ClusterLocalScope {
                    count: self.clusters.len(),
                })
            }
            _ => Ok(()),
        }
    }

    pub fn describe(&self) -> Vec<ClusterInfo> {
        self.clusters
            .iter()
            .enumerate()
            .map(|(index, c)| ClusterInfo {
                index,
                name: c.name.clone(),
                endpoint: c.endpoint.clone(),
                auth: c.credentials.kind(),
                verify_tls: c.verify_tls,
                dedicated: c.dedicated,
                steps: self
                    .bindings
                    .iter()
                    .filter(|(_, i)| **i == index)
                    .map(|(s, _)| s.clone())
                    .collect(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cumulus_core::model::Credentials;

    fn cluster(name: &str) -> ClusterConfig {
        ClusterConfig::new(
            Some(name.into()),
            format!("https://{}.example.org", name),
            Credentials::Token("t".into()),
        )
        .unwrap()
    }

    fn shared() -> Option<StorageConfig> {
        Some(StorageConfig::new("memory://registry"))
    }

    #[test]
    fn test_empty_registry_is_rejected() {
        let err = ClusterRegistry::new(vec![], None, &BTreeMap::new()).unwrap_err();
        assert!(matches!(err, ConfigError::NoClusters));
    }

    #[test]
    fn test_duplicate_names_are_rejected() {
        let err = ClusterRegistry::new(vec![cluster("a"), cluster("a")], shared(), &BTreeMap::new())
            .unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateClusterName(n) if n == "a"));
    }

    #[test]
    fn test_multi_cluster_requires_shared_storage() {
        let err =
            ClusterRegistry::new(vec![cluster("a"), cluster("b")], None, &BTreeMap::new())
                .unwrap_err();
        assert!(matches!(err, ConfigError::SharedStorageRequired { count: 2 }));
    }

    #[test]
    fn test_placement_to_unknown_cluster() {
        let placement = BTreeMap::from([("x".to_string(), "nope".to_string())]);
        let err = ClusterRegistry::new(vec![cluster("a")], None, &placement).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownClusterBinding { .. }));
    }

    #[test]
    fn test_conflicting_bindings() {
        let placement = BTreeMap::from([("x".to_string(), "b".to_string())]);
        let err = ClusterRegistry::new(
            vec![cluster("a").with_steps(["x"]), cluster("b")],
            shared(),
            &placement,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::ConflictingBinding { step, first, second }
                if step == "x" && first == "a" && second == "b"
        ));
    }

    #[test]
    fn test_repeated_binding_to_same_cluster_is_fine() {
        let placement = BTreeMap::from([("x".to_string(), "a".to_string())]);
        let registry =
            ClusterRegistry::new(vec![cluster("a").with_steps(["x"])], None, &placement).unwrap();
        assert_eq!(registry.bindings().get("x"), Some(&0));
    }

    #[test]
    fn test_dedicated_clusters_leave_the_pool() {
        let registry = ClusterRegistry::new(
            vec![cluster("a"), cluster("gpu").with_steps(["train"]).dedicated(true)],
            shared(),
            &BTreeMap::new(),
        )
        .unwrap();
        let mut table = registry.assignment_table();
        assert_eq!(table.assign("train"), 1);
        assert_eq!(table.assign("prep"), 0);
        assert_eq!(table.assign("eval"), 0);
    }

    #[test]
    fn test_plan_follows_topological_order() {
        let graph: StepGraph = serde_json::from_value(serde_json::json!({
            "steps": [
                {"name": "b", "command": "true", "depends_on": ["a"]},
                {"name": "a", "command": "true"},
                {"name": "c", "command": "true", "depends_on": ["b"]}
            ]
        }))
        .unwrap();
        let registry = ClusterRegistry::new(
            vec![cluster("x"), cluster("y").with_steps(["c"])],
            shared(),
            &BTreeMap::new(),
        )
        .unwrap();

        let plan = registry.plan(&graph).unwrap();

        let rows: Vec<_> = plan
            .iter()
            .map(|p| (p.step.as_str(), p.cluster.as_str(), p.explicit))
            .collect();
        assert_eq!(
            rows,
            vec![("a", "x", false), ("b", "y", false), ("c", "y", true)]
        );
    }

    #[test]
    fn test_storage_scope_selection() {
        let registry = ClusterRegistry::new(
            vec![cluster("a").with_storage(StorageConfig::new("memory://local-a"))],
            None,
            &BTreeMap::new(),
        )
        .unwrap();
        let (storage, scope) = registry.storage().unwrap();
        assert_eq!(storage.endpoint, "memory://local-a");
        assert_eq!(
            scope,
            StorageScope::ClusterLocal {
                cluster: "a".into()
            }
        );

        let registry =
            ClusterRegistry::new(vec![cluster("a"), cluster("b")], shared(), &BTreeMap::new())
                .unwrap();
        assert_eq!(registry.storage().unwrap().1, StorageScope::Shared);
        assert!(matches!(
            registry.check_scope(&StorageScope::ClusterLocal {
                cluster: "a".into()
            }),
            Err(ConfigError::ClusterLocalScope { count: 2 })
        ));
    }

    #[test]
    fn test_single_cluster_without_storage() {
        let registry = ClusterRegistry::new(vec![cluster("a")], None, &BTreeMap::new()).unwrap();
        assert!(matches!(
            registry.storage(),
            Err(ConfigError::StorageNotConfigured(n)) if n == "a"
        ));
    }

    #[test]
    fn test_describe_hides_credentials() {
        let registry = ClusterRegistry::new(
            vec![cluster("a").with_steps(["x", "y"])],
            None,
            &BTreeMap::new(),
        )
        .unwrap();
        let info = registry.describe();
        assert_eq!(info[0].steps, vec!["x".to_string(), "y".to_string()]);
        assert_eq!(info[0].auth, AuthKind::Token);
        let json = serde_json::to_string(&info).unwrap();
        assert!(!json.contains("\"t\""));
    }
}
