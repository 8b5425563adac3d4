use crate::config::ProcessConfig;
use std::collections::{HashMap, HashSet, VecDeque};

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum DepsError {
    #[error("circular dependency detected: {}", cycle.join(" -> "))]
    Circular { cycle: Vec<String> },
    #[error("process '{from}' depends on unknown process '{to}'")]
    Missing { from: String, to: String },
}

fn deps_of<'a>(config: &'a ProcessConfig) -> &'a [String] {
    config.depends_on.as_deref().unwrap_or(&[])
}

/// Check that every name in `depends_on` actually exists as a process key.
pub fn validate(configs: &HashMap<String, ProcessConfig>) -> Result<(), DepsError> {
    for (name, config) in configs {
        for dep in deps_of(config) {
            if !configs.contains_key(dep) {
                return Err(DepsError::Missing {
                    from: name.clone(),
                    to: dep.clone(),
                });
            }
        }
    }
    Ok(())
}

/// Group processes into start levels: level 0 has no dependencies, level 1
/// depends only on level 0, and so on. Errors on a dependency cycle.
pub fn start_levels(configs: &HashMap<String, ProcessConfig>) -> Result<Vec<Vec<String>>, DepsError> {
    let mut in_degree: HashMap<&str, usize> = HashMap::new();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

    for (name, config) in configs {
        in_degree.insert(name.as_str(), deps_of(config).len());
        dependents.entry(name.as_str()).or_default();
    }
    for (name, config) in configs {
        for dep in deps_of(config) {
            dependents.entry(dep.as_str()).or_default().push(name.as_str());
        }
    }

    let mut queue: VecDeque<&str> = in_degree
        .iter()
        .filter(|&(_, &deg)| deg == 0)
        .map(|(&name, _)| name)
        .collect();

    let mut levels: Vec<Vec<String>> = Vec::new();
    let mut processed = 0usize;

    while !queue.is_empty() {
        let mut level: Vec<String> = Vec::with_capacity(queue.len());
        for _ in 0..queue.len() {
            let node = queue.pop_front().unwrap();
            level.push(node.to_string());
            processed += 1;
            for &dependent in &dependents[node] {
                let deg = in_degree.get_mut(dependent).unwrap();
                *deg -= 1;
                if *deg == 0 {
                    queue.push_back(dependent);
                }
            }
        }
        level.sort(); // deterministic ordering within a level
        levels.push(level);
    }

    if processed != configs.len() {
        return Err(DepsError::Circular {
            cycle: find_cycle(configs),
        });
    }

    Ok(levels)
}

/// Flat reverse of the start levels: dependents stop before what they
/// depend on, so nothing loses a dependency while still running.
pub fn stop_order(configs: &HashMap<String, ProcessConfig>) -> Result<Vec<String>, DepsError> {
    let mut order: Vec<String> = start_levels(configs)?.into_iter().flatten().collect();
    order.reverse();
    Ok(order)
}

/// DFS cycle reconstruction, used only for the Circular error message.
fn find_cycle(configs: &HashMap<String, ProcessConfig>) -> Vec<String> {
    fn visit<'a>(
        node: &'a str,
        configs: &'a HashMap<String, ProcessConfig>,
        path: &mut Vec<&'a str>,
        done: &mut HashSet<&'a str>,
    ) -> Option<Vec<String>> {
        if let Some(pos) = path.iter().position(|&n| n == node) {
            let mut cycle: Vec<String> = path[pos..].iter().map(|s| s.to_string()).collect();
            cycle.push(node.to_string());
            return Some(cycle);
        }
        if done.contains(node) {
            return None;
        }
        path.push(node);
        if let Some(config) = configs.get(node) {
            for dep in deps_of(config) {
                if let Some(cycle) = visit(dep, configs, path, done) {
                    return Some(cycle);
                }
            }
        }
        path.pop();
        done.insert(node);
        None
    }

    let mut names: Vec<&str> = configs.keys().map(|s| s.as_str()).collect();
    names.sort(); // deterministic start order

    let mut done = HashSet::new();
    for start in names {
        let mut path = Vec::new();
        if let Some(cycle) = visit(start, configs, &mut path, &mut done) {
            return cycle;
        }
    }
    vec!["unknown cycle".to_string()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProcessConfig;

    fn cfg(deps: Option<Vec<&str>>) -> ProcessConfig {
        let mut config = ProcessConfig::new("echo hi");
        config.depends_on = deps.map(|v| v.into_iter().map(|s| s.to_string()).collect());
        config
    }

    #[test]
    fn test_validate_missing_dep() {
        let mut configs = HashMap::new();
        configs.insert("bot".to_string(), cfg(Some(vec!["mcp"])));
        let err = validate(&configs).unwrap_err();
        assert_eq!(
            err,
            DepsError::Missing {
                from: "bot".to_string(),
                to: "mcp".to_string(),
            }
        );
    }

    #[test]
    fn test_validate_all_present() {
        let mut configs = HashMap::new();
        configs.insert("mcp".to_string(), cfg(None));
        configs.insert("bot".to_string(), cfg(Some(vec!["mcp"])));
        assert!(validate(&configs).is_ok());
    }

    #[test]
    fn test_levels_no_deps() {
        let mut configs = HashMap::new();
        configs.insert("a".to_string(), cfg(None));
        configs.insert("b".to_string(), cfg(None));
        let levels = start_levels(&configs).unwrap();
        assert_eq!(levels, vec![vec!["a", "b"]]);
    }

    #[test]
    fn test_levels_linear_chain() {
        let mut configs = HashMap::new();
        configs.insert("a".to_string(), cfg(None));
        configs.insert("b".to_string(), cfg(Some(vec!["a"])));
        configs.insert("c".to_string(), cfg(Some(vec!["b"])));
        let levels = start_levels(&configs).unwrap();
        assert_eq!(levels, vec![vec!["a"], vec!["b"], vec!["c"]]);
    }

    #[test]
    fn test_levels_diamond() {
        let mut configs = HashMap::new();
        configs.insert("a".to_string(), cfg(None));
        configs.insert("b".to_string(), cfg(Some(vec!["a"])));
        configs.insert("c".to_string(), cfg(Some(vec!["a"])));
        configs.insert("d".to_string(), cfg(Some(vec!["b", "c"])));
        let levels = start_levels(&configs).unwrap();
        assert_eq!(levels[0], vec!["a"]);
        assert_eq!(levels[1], vec!["b", "c"]);
        assert_eq!(levels[2], vec!["d"]);
    }

    #[test]
    fn test_circular_two_nodes() {
        let mut configs = HashMap::new();
        configs.insert("a".to_string(), cfg(Some(vec!["b"])));
        configs.insert("b".to_string(), cfg(Some(vec!["a"])));
        let err = start_levels(&configs).unwrap_err();
        assert!(matches!(err, DepsError::Circular { .. }));
    }

    #[test]
    fn test_circular_self_dependency() {
        let mut configs = HashMap::new();
        configs.insert("a".to_string(), cfg(Some(vec!["a"])));
        let err = start_levels(&configs).unwrap_err();
        assert!(matches!(err, DepsError::Circular { .. }));
    }

    #[test]
    fn test_stop_order_reverses() {
        let mut configs = HashMap::new();
        configs.insert("mcp".to_string(), cfg(None));
        configs.insert("bot".to_string(), cfg(Some(vec!["mcp"])));
        let order = stop_order(&configs).unwrap();
        assert_eq!(order, vec!["bot", "mcp"]);
    }
}
