//! Stage dependency graph.
//!
//! Tables are nodes; an edge runs from each upstream table to the table
//! that reads it. The graph is leveled so every stage in a level depends
//! only on stages in earlier levels.

use std::collections::{BTreeSet, HashMap};

/// Structural problem in the table dependency graph.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DagError {
    #[error("table '{table}' depends on unknown table '{dependency}'")]
    UnknownDependency { table: String, dependency: String },
    #[error("table '{0}' depends on itself")]
    SelfDependency(String),
    #[error("dependency cycle among tables: {}", .0.join(", "))]
    Cycle(Vec<String>),
}

/// Leveled stage DAG.
#[derive(Debug, Clone, Default)]
pub struct Dag {
    /// Declaration order.
    nodes: Vec<String>,
    upstream: HashMap<String, Vec<String>>,
    levels: Vec<Vec<String>>,
}

impl Dag {
    /// Build from `(table, dependencies)` pairs in declaration order.
    ///
    /// Stages within a level keep declaration order.
    ///
    /// # Errors
    ///
    /// Returns every [`DagError`] found: unknown or self dependencies are
    /// reported per edge, a cycle once with all tables left unleveled.
    pub fn build<'a, I, D>(tables: I) -> Result<Self, Vec<DagError>>
    where
        I: IntoIterator<Item = (&'a str, D)>,
        D: IntoIterator<Item = &'a str>,
    {
        let mut nodes = Vec::new();
        let mut upstream: HashMap<String, Vec<String>> = HashMap::new();
        for (name, deps) in tables {
            nodes.push(name.to_string());
            upstream.insert(
                name.to_string(),
                deps.into_iter().map(str::to_string).collect(),
            );
        }

        let mut errors = Vec::new();
        for name in &nodes {
            for dep in &upstream[name] {
                if dep == name {
                    errors.push(DagError::SelfDependency(name.clone()));
                } else if !upstream.contains_key(dep) {
                    errors.push(DagError::UnknownDependency {
                        table: name.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }
        if !errors.is_empty() {
            return Err(errors);
        }

        let mut placed: BTreeSet<&str> = BTreeSet::new();
        let mut levels = Vec::new();
        while placed.len() < nodes.len() {
            let level: Vec<String> = nodes
                .iter()
                .filter(|n| !placed.contains(n.as_str()))
                .filter(|n| upstream[*n].iter().all(|d| placed.contains(d.as_str())))
                .cloned()
                .collect();
            if level.is_empty() {
                let stuck = nodes
                    .iter()
                    .filter(|n| !placed.contains(n.as_str()))
                    .cloned()
                    .collect();
                return Err(vec![DagError::Cycle(stuck)]);
            }
            for n in &level {
                if let Some(node) = nodes.iter().find(|x| *x == n) {
                    placed.insert(node.as_str());
                }
            }
            levels.push(level);
        }

        Ok(Self {
            nodes,
            upstream,
            levels,
        })
    }

    #[must_use]
    pub fn levels(&self) -> &[Vec<String>] {
        &self.levels
    }

    /// Direct upstream tables of `table`.
    #[must_use]
    pub fn upstream(&self, table: &str) -> &[String] {
        self.upstream.get(table).map_or(&[], Vec::as_slice)
    }

    /// Every table that transitively reads `table`, in declaration order.
    #[must_use]
    pub fn descendants(&self, table: &str) -> Vec<String> {
        let mut found: BTreeSet<&str> = BTreeSet::new();
        let mut frontier = vec![table];
        while let Some(current) = frontier.pop() {
            for node in &self.nodes {
                if self.upstream[node].iter().any(|d| d == current) && found.insert(node) {
                    frontier.push(node);
                }
            }
        }
        self.nodes
            .iter()
            .filter(|n| found.contains(n.as_str()))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn medallion() -> Vec<(&'static str, Vec<&'static str>)> {
        vec![
            ("premiums_by_town", vec!["premiums_location"]),
            (
                "premiums_location",
                vec!["cgr_premiums", "territory_definitions"],
            ),
            ("cgr_premiums", vec![]),
            ("territory_definitions", vec![]),
            ("cgr_definitions", vec![]),
        ]
    }

    #[test]
    fn levels_follow_dependencies_and_declaration_order() {
        let dag = Dag::build(medallion()).unwrap();
        assert_eq!(
            dag.levels(),
            &[
                vec![
                    "cgr_premiums".to_string(),
                    "territory_definitions".to_string(),
                    "cgr_definitions".to_string()
                ],
                vec!["premiums_location".to_string()],
                vec!["premiums_by_town".to_string()],
            ]
        );
        assert_eq!(dag.upstream("premiums_by_town"), ["premiums_location"]);
    }

    #[test]
    fn descendants_are_transitive() {
        let dag = Dag::build(medallion()).unwrap();
        assert_eq!(
            dag.descendants("territory_definitions"),
            vec!["premiums_by_town", "premiums_location"]
        );
        assert!(dag.descendants("cgr_definitions").is_empty());
    }

    #[test]
    fn unknown_and_self_dependencies_are_all_reported() {
        let errors = Dag::build(vec![("a", vec!["a"]), ("b", vec!["missing"])]).unwrap_err();
        assert_eq!(errors.len(), 2);
        assert!(errors.contains(&DagError::SelfDependency("a".into())));
    }

    #[test]
    fn cycle_is_detected() {
        let errors = Dag::build(vec![("a", vec!["b"]), ("b", vec!["a"]), ("c", vec![])])
            .unwrap_err();
        assert_eq!(
            errors,
            vec![DagError::Cycle(vec!["a".to_string(), "b".to_string()])]
        );
    }
}
