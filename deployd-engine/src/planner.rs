//! Dependency ordering for infrastructure items and service groups.

use std::collections::{BTreeMap, HashMap, HashSet};

use anyhow::{anyhow, Result};

use crate::stack::{InfrastructureItem, Service};

/// Parses a `when` expression. Empty means enabled.
pub fn evaluate_when(value: &str) -> Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "" | "1" | "t" | "true" => Ok(true),
        "0" | "f" | "false" => Ok(false),
        other => Err(anyhow!("invalid boolean {other:?}")),
    }
}

/// Orders the enabled infrastructure items so that every item comes after
/// the enabled items it depends on. Roots are visited by name.
pub fn topo_sort_infrastructure(items: &BTreeMap<String, InfrastructureItem>) -> Result<Vec<String>> {
    #[derive(Clone, Copy, PartialEq, Eq)]
    enum Mark {
        Visiting,
        Done,
    }

    fn visit(
        name: &str,
        items: &BTreeMap<String, InfrastructureItem>,
        marks: &mut HashMap<String, Mark>,
        out: &mut Vec<String>,
    ) -> Result<()> {
        match marks.get(name) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::Visiting) => {
                return Err(anyhow!(
                    "infrastructure dependency cycle detected at {name:?}"
                ))
            }
            None => {}
        }
        marks.insert(name.to_string(), Mark::Visiting);
        if let Some(item) = items.get(name) {
            for dependency in &item.depends_on {
                let dependency = dependency.trim();
                if dependency.is_empty() {
                    continue;
                }
                if !items.contains_key(dependency) {
                    tracing::warn!(
                        item = name,
                        dependency,
                        "infrastructure dependency is not enabled, ignoring edge"
                    );
                    continue;
                }
                visit(dependency, items, marks, out)?;
            }
        }
        marks.insert(name.to_string(), Mark::Done);
        out.push(name.to_string());
        Ok(())
    }

    let mut marks = HashMap::with_capacity(items.len());
    let mut out = Vec::with_capacity(items.len());
    for name in items.keys() {
        visit(name, items, &mut marks, &mut out)?;
    }
    Ok(out)
}

/// Groups from `deploy_order` that have services, then the rest by name.
pub fn build_service_group_order(
    deploy_order: &[String],
    group_to_names: &BTreeMap<String, Vec<String>>,
) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(group_to_names.len());
    for group in deploy_order {
        let group = group.trim();
        if group_to_names.contains_key(group) && seen.insert(group.to_string()) {
            out.push(group.to_string());
        }
    }
    for group in group_to_names.keys() {
        if seen.insert(group.clone()) {
            out.push(group.clone());
        }
    }
    out
}

/// A dependency is satisfied once applied, or when it is not an enabled service.
pub fn dependencies_satisfied(
    depends_on: &[String],
    applied: &HashSet<String>,
    enabled: &BTreeMap<String, Service>,
) -> bool {
    depends_on.iter().all(|dependency| {
        let dependency = dependency.trim();
        dependency.is_empty() || applied.contains(dependency) || !enabled.contains_key(dependency)
    })
}

/// Apply order of the services of one group.
///
/// Repeatedly takes the first (by name) service whose dependencies are
/// satisfied, and marks it applied. `applied` carries the units applied
/// before this group.
pub fn order_group(
    group: &str,
    names: &[String],
    enabled: &BTreeMap<String, Service>,
    applied: &HashSet<String>,
) -> Result<Vec<String>> {
    let mut remaining = names.to_vec();
    remaining.sort();
    let mut applied = applied.clone();
    let mut out = Vec::with_capacity(remaining.len());
    while !remaining.is_empty() {
        let next = remaining.iter().position(|name| {
            enabled
                .get(name)
                .map(|service| dependencies_satisfied(&service.depends_on, &applied, enabled))
                .unwrap_or(true)
        });
        let Some(idx) = next else {
            return Err(anyhow!(
                "service dependency deadlock in group {group:?}: unresolved {}",
                remaining.join(", ")
            ));
        };
        let name = remaining.remove(idx);
        applied.insert(name.clone());
        out.push(name);
    }
    Ok(out)
}
