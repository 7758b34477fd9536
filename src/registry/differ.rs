use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use super::Registry;
use crate::container::{ContainerDetail, ContainerID};
use crate::filter::ContainerFilter;

/// Changes of a match list since the previous call to [`Registry::snapshot_matching_delta`].
#[derive(Debug, Default)]
pub struct MatchDelta {
    pub added: Vec<Arc<ContainerDetail>>,
    pub deleted: Vec<ContainerID>,
}

impl MatchDelta {
    pub fn new_count(&self) -> usize {
        self.added.len()
    }

    pub fn deleted_count(&self) -> usize {
        self.deleted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.deleted.is_empty()
    }
}

impl Registry {
    /// Brings `full_list` and `match_list` up to date with the inventory.
    ///
    /// `full_list` holds every id seen by the caller, matching or not, so each record is
    /// evaluated against `filter` only once. Ids that left the inventory are dropped from both
    /// lists.
    pub fn snapshot_matching_delta(
        &self,
        full_list: &mut HashSet<ContainerID>,
        match_list: &mut HashMap<ContainerID, Arc<ContainerDetail>>,
        filter: &ContainerFilter,
    ) -> MatchDelta {
        let containers = self.read();
        let mut delta = MatchDelta::default();

        full_list.retain(|id| {
            if containers.contains_key(id) {
                return true;
            }
            if match_list.remove(id).is_some() {
                delta.deleted.push(id.clone());
            }
            false
        });

        for (id, detail) in containers.iter() {
            if !full_list.insert(id.clone()) {
                continue;
            }
            if filter.matches(detail) {
                match_list.insert(id.clone(), Arc::clone(detail));
                delta.added.push(Arc::clone(detail));
            }
        }
        delta
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use super::*;
    use crate::config::StdoutConfig;
    use crate::container::{ContainerSpec, DetailOptions};
    use crate::registry::RegistryTimeouts;

    fn registry() -> Registry {
        Registry::new(RegistryTimeouts {
            container_info_max: Duration::ZERO,
            container_info_deleted: Duration::ZERO,
            fetch_all_success: Duration::ZERO,
        })
    }

    fn detail(id: &str, app: &str) -> ContainerDetail {
        ContainerDetail::from_spec(
            ContainerSpec {
                id: id.to_owned(),
                name: format!("/{id}"),
                labels: HashMap::from([("app".to_owned(), app.to_owned())]),
                ..Default::default()
            },
            &DetailOptions::default(),
            0,
        )
        .unwrap()
    }

    #[test]
    fn test_delta_tracks_additions_and_removals() {
        let registry = registry();
        let mut config = StdoutConfig::default();
        config.include_container_label = HashMap::from([("app".to_owned(), "web".to_owned())]);
        let filter = ContainerFilter::from_config(&config).unwrap();
        let mut full = HashSet::new();
        let mut matched = HashMap::new();

        registry.upsert(detail("a", "web"));
        registry.upsert(detail("b", "db"));
        let delta = registry.snapshot_matching_delta(&mut full, &mut matched, &filter);
        assert_eq!(delta.new_count(), 1);
        assert_eq!(delta.deleted_count(), 0);
        assert_eq!(delta.added[0].id.as_ref(), "a");
        assert_eq!(full.len(), 2);
        assert_eq!(matched.len(), 1);

        let delta = registry.snapshot_matching_delta(&mut full, &mut matched, &filter);
        assert!(delta.is_empty());

        // Removing both records only reports the one that matched.
        registry.replace_all(vec![detail("c", "web")]);
        let delta = registry.snapshot_matching_delta(&mut full, &mut matched, &filter);
        assert_eq!(delta.deleted.len(), 1);
        assert_eq!(delta.deleted[0].as_ref(), "a");
        assert_eq!(delta.new_count(), 1);
        assert_eq!(full.len(), 1);
        assert!(matched.contains_key("c"));
    }
}
