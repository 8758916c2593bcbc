//! Pipeline definition validation.
//!
//! Definitions are checked once, at publish time — a definition that
//! passes here can be instantiated without further structural checks.
//! Cyclic graphs are rejected outright: a cycle would deadlock the
//! dependency barrier forever, so failing fast at publish is the safe
//! default.

use std::collections::{HashMap, HashSet, VecDeque};

use arbiter_contracts::{
    error::{ArbiterError, ArbiterResult},
    pipeline::{InputMapping, PipelineDefinition},
};

/// Validate `definition` for publication.
///
/// Checks, in order:
/// 1. At least one stage.
/// 2. Stage names are unique.
/// 3. Every `depends_on` edge names a declared stage.
/// 4. `Output`/`Pointer` mappings reference declared dependencies — a
///    stage may only read outputs it has a barrier on.
/// 5. `Merge` mappings have at least one dependency to merge.
/// 6. The dependency graph is acyclic (Kahn's algorithm).
pub fn validate_definition(definition: &PipelineDefinition) -> ArbiterResult<()> {
    if definition.stages.is_empty() {
        return Err(ArbiterError::ConfigError {
            reason: format!("pipeline '{}' declares no stages", definition.name),
        });
    }

    let mut names: HashSet<&str> = HashSet::new();
    for stage in &definition.stages {
        if !names.insert(stage.name.as_str()) {
            return Err(ArbiterError::ConfigError {
                reason: format!(
                    "pipeline '{}' declares stage '{}' more than once",
                    definition.name, stage.name
                ),
            });
        }
    }

    for stage in &definition.stages {
        for dep in &stage.depends_on {
            if !names.contains(dep.as_str()) {
                return Err(ArbiterError::ConfigError {
                    reason: format!(
                        "stage '{}' depends on unknown stage '{}'",
                        stage.name, dep
                    ),
                });
            }
        }

        match &stage.mapping {
            InputMapping::Output { stage: upstream }
            | InputMapping::Pointer { stage: upstream, .. } => {
                if !stage.depends_on.contains(upstream) {
                    return Err(ArbiterError::ConfigError {
                        reason: format!(
                            "stage '{}' maps from '{}' without depending on it",
                            stage.name, upstream
                        ),
                    });
                }
            }
            InputMapping::Merge => {
                if stage.depends_on.is_empty() {
                    return Err(ArbiterError::ConfigError {
                        reason: format!(
                            "stage '{}' uses a merge mapping but declares no dependencies",
                            stage.name
                        ),
                    });
                }
            }
            InputMapping::Request => {}
        }
    }

    // Kahn's algorithm: if a topological order cannot consume every stage,
    // the graph has a cycle.
    let mut in_degree: HashMap<&str, usize> = definition
        .stages
        .iter()
        .map(|s| (s.name.as_str(), s.depends_on.len()))
        .collect();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for stage in &definition.stages {
        for dep in &stage.depends_on {
            dependents
                .entry(dep.as_str())
                .or_default()
                .push(stage.name.as_str());
        }
    }

    let mut queue: VecDeque<&str> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(name, _)| *name)
        .collect();
    let mut processed = 0usize;

    while let Some(name) = queue.pop_front() {
        processed += 1;
        for dependent in dependents.get(name).into_iter().flatten() {
            let degree = in_degree
                .get_mut(dependent)
                .ok_or_else(|| ArbiterError::ConfigError {
                    reason: format!("stage '{}' missing from dependency index", dependent),
                })?;
            *degree -= 1;
            if *degree == 0 {
                queue.push_back(dependent);
            }
        }
    }

    if processed != definition.stages.len() {
        return Err(ArbiterError::ConfigError {
            reason: format!(
                "pipeline '{}' contains a dependency cycle",
                definition.name
            ),
        });
    }

    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use arbiter_contracts::{
        capability::Capability,
        error::ArbiterError,
        pipeline::{InputMapping, PipelineDefinition, StageSpec},
    };

    use super::validate_definition;

    fn stage(name: &str, depends_on: &[&str], mapping: InputMapping) -> StageSpec {
        StageSpec {
            name: name.to_string(),
            capability: Capability::new("enrich-entity"),
            depends_on: depends_on.iter().map(|s| s.to_string()).collect(),
            mapping,
            optional: false,
            output_contract: None,
        }
    }

    fn definition(stages: Vec<StageSpec>) -> PipelineDefinition {
        PipelineDefinition {
            name: "test".to_string(),
            version: 1,
            stages,
        }
    }

    #[test]
    fn test_valid_linear_chain() {
        let def = definition(vec![
            stage("scout", &[], InputMapping::Request),
            stage("research", &["scout"], InputMapping::Output { stage: "scout".to_string() }),
            stage("synthesize", &["research"], InputMapping::Merge),
        ]);
        assert!(validate_definition(&def).is_ok());
    }

    #[test]
    fn test_valid_fan_out_fan_in() {
        let def = definition(vec![
            stage("scout", &[], InputMapping::Request),
            stage("research-a", &["scout"], InputMapping::Pointer {
                stage: "scout".to_string(),
                pointer: "/competitors/0".to_string(),
            }),
            stage("research-b", &["scout"], InputMapping::Pointer {
                stage: "scout".to_string(),
                pointer: "/competitors/1".to_string(),
            }),
            stage("synthesize", &["research-a", "research-b"], InputMapping::Merge),
        ]);
        assert!(validate_definition(&def).is_ok());
    }

    #[test]
    fn test_empty_definition_rejected() {
        assert!(matches!(
            validate_definition(&definition(vec![])),
            Err(ArbiterError::ConfigError { .. })
        ));
    }

    #[test]
    fn test_duplicate_stage_names_rejected() {
        let def = definition(vec![
            stage("scout", &[], InputMapping::Request),
            stage("scout", &[], InputMapping::Request),
        ]);
        assert!(matches!(
            validate_definition(&def),
            Err(ArbiterError::ConfigError { .. })
        ));
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let def = definition(vec![stage(
            "research",
            &["ghost"],
            InputMapping::Request,
        )]);
        match validate_definition(&def) {
            Err(ArbiterError::ConfigError { reason }) => {
                assert!(reason.contains("unknown stage 'ghost'"));
            }
            other => panic!("expected ConfigError, got {:?}", other),
        }
    }

    #[test]
    fn test_mapping_must_reference_dependency() {
        let def = definition(vec![
            stage("scout", &[], InputMapping::Request),
            // Maps from scout but declares no barrier on it.
            stage("research", &[], InputMapping::Output { stage: "scout".to_string() }),
        ]);
        match validate_definition(&def) {
            Err(ArbiterError::ConfigError { reason }) => {
                assert!(reason.contains("without depending on it"));
            }
            other => panic!("expected ConfigError, got {:?}", other),
        }
    }

    #[test]
    fn test_cycle_rejected() {
        let def = definition(vec![
            stage("a", &["b"], InputMapping::Output { stage: "b".to_string() }),
            stage("b", &["a"], InputMapping::Output { stage: "a".to_string() }),
        ]);
        match validate_definition(&def) {
            Err(ArbiterError::ConfigError { reason }) => {
                assert!(reason.contains("cycle"));
            }
            other => panic!("expected ConfigError, got {:?}", other),
        }
    }

    #[test]
    fn test_self_cycle_rejected() {
        let def = definition(vec![stage(
            "a",
            &["a"],
            InputMapping::Output { stage: "a".to_string() },
        )]);
        assert!(matches!(
            validate_definition(&def),
            Err(ArbiterError::ConfigError { .. })
        ));
    }
}
