//! Option propagation resolver.
//!
//! A topological pre-pass that applies every `[[propagate]]` declaration in
//! the graph before any lifecycle stage starts. Nodes are processed
//! dependents-first so a forwarded option (`from = "shared"`) reflects the
//! dependent's own already-forced value, making propagation transitive.
//!
//! Two dependents forcing different values onto the same dependency option
//! is an irreconcilable [`Error::OptionConflict`] naming both dependents;
//! there is no priority order to paper over the disagreement.

use std::collections::BTreeMap;

use tracing::debug;

use crate::error::{Error, Result};
use crate::graph::DependencyGraph;
use crate::recipe::Recipe;

/// Fully resolved option values for every node in a graph.
#[derive(Debug, Clone)]
pub struct ResolvedOptions {
    per_node: BTreeMap<String, BTreeMap<String, String>>,
}

impl ResolvedOptions {
    /// Resolved values for one node.
    pub fn node(&self, name: &str) -> &BTreeMap<String, String> {
        &self.per_node[name]
    }
}

fn check_value(recipe: &Recipe, option: &str, value: &str) -> Result<()> {
    let decl = recipe
        .options
        .get(option)
        .ok_or_else(|| Error::UnknownOption {
            recipe: recipe.package.name.clone(),
            option: option.to_string(),
        })?;
    if !decl.allows(value) {
        return Err(Error::InvalidOptionValue {
            recipe: recipe.package.name.clone(),
            option: option.to_string(),
            value: value.to_string(),
            allowed: decl.allowed(),
        });
    }
    Ok(())
}

/// Resolve option values for the whole graph.
///
/// `root_overrides` are user-requested values applied to the root recipe
/// before propagation runs. Must fully complete (as a barrier) before any
/// node's lifecycle begins.
pub fn resolve_options(
    graph: &DependencyGraph,
    root_overrides: &BTreeMap<String, String>,
) -> Result<ResolvedOptions> {
    let mut per_node: BTreeMap<String, BTreeMap<String, String>> = graph
        .node_names()
        .map(|name| (name.to_string(), graph.recipe(name).default_options()))
        .collect();

    let root = graph.root().to_string();
    for (option, value) in root_overrides {
        check_value(graph.recipe(&root), option, value)?;
        per_node
            .get_mut(&root)
            .unwrap()
            .insert(option.clone(), value.clone());
    }

    // (dependency, option) -> (value, dependent that forced it)
    let mut forced: BTreeMap<(String, String), (String, String)> = BTreeMap::new();

    let mut order = graph.build_order()?;
    order.reverse();
    for name in order {
        let own = per_node[&name].clone();
        for decl in &graph.recipe(&name).propagate {
            let value = match (&decl.value, &decl.from) {
                (Some(value), None) => value.clone(),
                // `from` is validated against the recipe's own options at
                // load time, and defaults guarantee a resolved value.
                (None, Some(from)) => own[from].clone(),
                _ => unreachable!("validated at recipe load"),
            };

            check_value(graph.recipe(&decl.dependency), &decl.option, &value)?;

            let key = (decl.dependency.clone(), decl.option.clone());
            if let Some((existing_value, existing_from)) = forced.get(&key) {
                if *existing_value != value {
                    return Err(Error::OptionConflict {
                        dependency: decl.dependency.clone(),
                        option: decl.option.clone(),
                        first_dependent: existing_from.clone(),
                        first_value: existing_value.clone(),
                        second_dependent: name.clone(),
                        second_value: value,
                    });
                }
                continue;
            }
            forced.insert(key, (value.clone(), name.clone()));

            debug!(
                dependency = %decl.dependency,
                option = %decl.option,
                value = %value,
                forced_by = %name,
                "propagated option"
            );
            per_node
                .get_mut(&decl.dependency)
                .unwrap()
                .insert(decl.option.clone(), value);
        }
    }

    Ok(ResolvedOptions { per_node })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::RecipeLoader;
    use std::fs;
    use tempfile::TempDir;

    fn write(dir: &std::path::Path, name: &str, body: &str) {
        fs::write(dir.join(format!("{name}.toml")), body).unwrap();
    }

    fn shared_option() -> &'static str {
        "[options.shared]\nvalues = [\"true\", \"false\"]\ndefault = \"false\"\n"
    }

    fn leaf(name: &str) -> String {
        format!(
            "[package]\nname = \"{name}\"\nversion = \"1.0.0\"\n\n{}\n\
             [source]\nurl = \"file:///dev/null\"\n\
             sha256 = \"0000000000000000000000000000000000000000000000000000000000000000\"\n",
            shared_option()
        )
    }

    fn propagator(name: &str, dep: &str, value: Option<&str>, from: Option<&str>) -> String {
        let assignment = match (value, from) {
            (Some(v), None) => format!("value = \"{v}\""),
            (None, Some(f)) => format!("from = \"{f}\""),
            _ => unreachable!(),
        };
        format!(
            "[package]\nname = \"{name}\"\nversion = \"1.0.0\"\n\
             requires = [\"{dep}/1.0.0\"]\n\n{}\n\
             [[propagate]]\ndependency = \"{dep}\"\noption = \"shared\"\n{assignment}\n\n\
             [source]\nurl = \"file:///dev/null\"\n\
             sha256 = \"0000000000000000000000000000000000000000000000000000000000000000\"\n",
            shared_option()
        )
    }

    fn resolve(
        dir: &TempDir,
        root: &str,
        overrides: &BTreeMap<String, String>,
    ) -> Result<(DependencyGraph, ResolvedOptions)> {
        let loader = RecipeLoader::new(vec![dir.path().to_path_buf()]);
        let recipe = crate::recipe::Recipe::load(&dir.path().join(format!("{root}.toml")))?;
        let graph = DependencyGraph::resolve(recipe, &loader)?;
        let options = resolve_options(&graph, overrides)?;
        Ok((graph, options))
    }

    #[test]
    fn defaults_apply_without_propagation() {
        let temp = TempDir::new().unwrap();
        write(temp.path(), "zlib", &leaf("zlib"));

        let (_, options) = resolve(&temp, "zlib", &BTreeMap::new()).unwrap();
        assert_eq!(options.node("zlib")["shared"], "false");
    }

    #[test]
    fn forwarded_option_follows_root_override_transitively() {
        let temp = TempDir::new().unwrap();
        write(temp.path(), "zlib", &leaf("zlib"));
        write(
            temp.path(),
            "protobuf",
            &propagator("protobuf", "zlib", None, Some("shared")),
        );
        write(
            temp.path(),
            "app",
            &propagator("app", "protobuf", None, Some("shared")),
        );

        let overrides = BTreeMap::from([("shared".to_string(), "true".to_string())]);
        let (_, options) = resolve(&temp, "app", &overrides).unwrap();

        // app.shared=true flows through protobuf down to zlib.
        assert_eq!(options.node("app")["shared"], "true");
        assert_eq!(options.node("protobuf")["shared"], "true");
        assert_eq!(options.node("zlib")["shared"], "true");
    }

    #[test]
    fn conflicting_dependents_are_named_in_the_error() {
        let temp = TempDir::new().unwrap();
        write(temp.path(), "libd", &leaf("libd"));
        write(
            temp.path(),
            "liba",
            &propagator("liba", "libd", Some("true"), None),
        );
        write(
            temp.path(),
            "libb",
            &propagator("libb", "libd", Some("false"), None),
        );
        write(
            temp.path(),
            "app",
            "[package]\nname = \"app\"\nversion = \"1.0.0\"\n\
             requires = [\"liba/1.0.0\", \"libb/1.0.0\"]\n\n\
             [source]\nurl = \"file:///dev/null\"\n\
             sha256 = \"0000000000000000000000000000000000000000000000000000000000000000\"\n",
        );

        let err = resolve(&temp, "app", &BTreeMap::new()).unwrap_err();
        match err {
            Error::OptionConflict {
                dependency,
                option,
                first_dependent,
                second_dependent,
                ..
            } => {
                assert_eq!(dependency, "libd");
                assert_eq!(option, "shared");
                let mut dependents = [first_dependent, second_dependent];
                dependents.sort();
                assert_eq!(dependents, ["liba".to_string(), "libb".to_string()]);
            }
            other => panic!("expected OptionConflict, got {other}"),
        }
    }

    #[test]
    fn agreeing_dependents_do_not_conflict() {
        let temp = TempDir::new().unwrap();
        write(temp.path(), "libd", &leaf("libd"));
        write(
            temp.path(),
            "liba",
            &propagator("liba", "libd", Some("true"), None),
        );
        write(
            temp.path(),
            "libb",
            &propagator("libb", "libd", Some("true"), None),
        );
        write(
            temp.path(),
            "app",
            "[package]\nname = \"app\"\nversion = \"1.0.0\"\n\
             requires = [\"liba/1.0.0\", \"libb/1.0.0\"]\n\n\
             [source]\nurl = \"file:///dev/null\"\n\
             sha256 = \"0000000000000000000000000000000000000000000000000000000000000000\"\n",
        );

        let (_, options) = resolve(&temp, "app", &BTreeMap::new()).unwrap();
        assert_eq!(options.node("libd")["shared"], "true");
    }

    #[test]
    fn propagated_value_outside_domain_is_rejected() {
        let temp = TempDir::new().unwrap();
        write(temp.path(), "libd", &leaf("libd"));
        write(
            temp.path(),
            "liba",
            &propagator("liba", "libd", Some("sideways"), None),
        );

        let err = resolve(&temp, "liba", &BTreeMap::new()).unwrap_err();
        assert!(matches!(err, Error::InvalidOptionValue { .. }));
    }

    #[test]
    fn root_override_outside_domain_is_rejected() {
        let temp = TempDir::new().unwrap();
        write(temp.path(), "zlib", &leaf("zlib"));

        let overrides = BTreeMap::from([("shared".to_string(), "sideways".to_string())]);
        let err = resolve(&temp, "zlib", &overrides).unwrap_err();
        assert!(matches!(err, Error::InvalidOptionValue { .. }));

        let overrides = BTreeMap::from([("ghost".to_string(), "true".to_string())]);
        let err = resolve(&temp, "zlib", &overrides).unwrap_err();
        assert!(matches!(err, Error::UnknownOption { .. }));
    }
}
