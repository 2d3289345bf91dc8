use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use crate::{model::Project, ConfigError};

impl Project {
    /// Order `services` and everything they depend on so that every
    /// dependency comes before its dependents. An empty selection means all
    /// services. Ties are broken by name, so the result is deterministic.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown service names and dependency cycles.
    pub fn startup_order(&self, services: &[String]) -> Result<Vec<String>, ConfigError> {
        let mut to_process: VecDeque<String> = if services.is_empty() {
            self.services.keys().cloned().collect()
        } else {
            services.iter().cloned().collect()
        };

        let mut processed = HashSet::with_capacity(self.services.len());
        let mut dependents: HashMap<String, Vec<String>> =
            HashMap::with_capacity(self.services.len());
        let mut deps_count: HashMap<String, usize> = HashMap::with_capacity(self.services.len());

        while let Some(service_name) = to_process.pop_front() {
            if !processed.insert(service_name.clone()) {
                continue;
            }
            let Some(service) = self.services.get(&service_name) else {
                return Err(ConfigError::UnknownService(service_name));
            };

            dependents.entry(service_name.clone()).or_default();
            let count = deps_count.entry(service_name.clone()).or_default();

            for dependency in &service.deps {
                if !self.services.contains_key(dependency) {
                    return Err(ConfigError::UnknownService(dependency.clone()));
                }
                dependents
                    .entry(dependency.clone())
                    .or_default()
                    .push(service_name.clone());
                *count += 1;
                to_process.push_back(dependency.clone());
            }
        }

        let mut ready: BTreeSet<String> = deps_count
            .iter()
            .filter_map(|(s, &c)| (c == 0).then(|| s.clone()))
            .collect();

        let mut result = Vec::with_capacity(deps_count.len());
        while let Some(service) = ready.pop_first() {
            if let Some(waiting) = dependents.get(&service) {
                for dependent in waiting {
                    if let Some(c) = deps_count.get_mut(dependent) {
                        *c -= 1;
                        if *c == 0 {
                            ready.insert(dependent.clone());
                        }
                    }
                }
            }
            result.push(service);
        }

        if result.len() != processed.len() {
            let mut cycle: Vec<String> = deps_count
                .into_iter()
                .filter_map(|(s, c)| (c > 0).then_some(s))
                .collect();
            cycle.sort();
            return Err(ConfigError::CircularDependency(cycle));
        }

        Ok(result)
    }
}
