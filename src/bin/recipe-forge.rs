use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use recipe_forge::lifecycle::default_download_cache;
use recipe_forge::preflight::check_graph_tools;
use recipe_forge::{
    package_identity, resolve_options, ChecksumPolicy, DependencyGraph, GraphRunner, NodeOutcome,
    Recipe, RecipeLoader, RunnerConfig, SettingsProfile,
};

const DEFAULT_WORK_ROOT: &str = ".forge";

fn usage() -> &'static str {
    "Usage:\n  \
     recipe-forge build <recipe.toml> [options]\n  \
     recipe-forge graph <recipe.toml> [options]\n  \
     recipe-forge check <recipe.toml> [options]\n  \
     recipe-forge clean [--work-root <dir>]\n\n\
     Options:\n  \
     --profile <file>            settings profile TOML (default: host profile)\n  \
     --recipes-path <dir>        recipe search directory (repeatable)\n  \
     --work-root <dir>           work/store root (default: .forge)\n  \
     --jobs <n>                  worker pool size and %(jobs)s hint\n  \
     --keep-going                continue independent subtrees past a failure\n  \
     --rebuild                   ignore the package store\n  \
     --checksum-policy <p>       require (default) or warn\n  \
     -o <name>=<value>           root recipe option override (repeatable)"
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = env::args().skip(1).collect();
    match args.split_first() {
        Some((cmd, rest)) if cmd == "build" => cmd_build(rest),
        Some((cmd, rest)) if cmd == "graph" => cmd_graph(rest),
        Some((cmd, rest)) if cmd == "check" => cmd_check(rest),
        Some((cmd, rest)) if cmd == "clean" => cmd_clean(rest),
        _ => bail!(usage()),
    }
}

#[derive(Debug)]
struct CommonArgs {
    recipe: Option<PathBuf>,
    profile: Option<PathBuf>,
    recipes_path: Vec<PathBuf>,
    work_root: PathBuf,
    options: BTreeMap<String, String>,
    jobs: Option<usize>,
    keep_going: bool,
    rebuild: bool,
    checksum_policy: ChecksumPolicy,
}

fn next_value<'a>(iter: &mut std::slice::Iter<'a, String>, flag: &str) -> Result<&'a str> {
    iter.next()
        .map(|s| s.as_str())
        .with_context(|| format!("{} requires a value\n\n{}", flag, usage()))
}

fn parse_common(args: &[String]) -> Result<CommonArgs> {
    let mut parsed = CommonArgs {
        recipe: None,
        profile: None,
        recipes_path: Vec::new(),
        work_root: PathBuf::from(DEFAULT_WORK_ROOT),
        options: BTreeMap::new(),
        jobs: None,
        keep_going: false,
        rebuild: false,
        checksum_policy: ChecksumPolicy::Require,
    };

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--profile" => {
                parsed.profile = Some(PathBuf::from(next_value(&mut iter, "--profile")?))
            }
            "--recipes-path" => parsed
                .recipes_path
                .push(PathBuf::from(next_value(&mut iter, "--recipes-path")?)),
            "--work-root" => {
                parsed.work_root = PathBuf::from(next_value(&mut iter, "--work-root")?)
            }
            "--jobs" => {
                let raw = next_value(&mut iter, "--jobs")?;
                let jobs: usize = raw
                    .parse()
                    .with_context(|| format!("invalid --jobs value '{}'", raw))?;
                if jobs == 0 {
                    bail!("--jobs must be at least 1");
                }
                parsed.jobs = Some(jobs);
            }
            "--keep-going" => parsed.keep_going = true,
            "--rebuild" => parsed.rebuild = true,
            "--checksum-policy" => {
                parsed.checksum_policy = match next_value(&mut iter, "--checksum-policy")? {
                    "require" => ChecksumPolicy::Require,
                    "warn" => ChecksumPolicy::Warn,
                    other => bail!("unknown checksum policy '{}'; expected require|warn", other),
                }
            }
            "-o" | "--option" => {
                let raw = next_value(&mut iter, "-o")?;
                let (name, value) = raw.split_once('=').with_context(|| {
                    format!("invalid option override '{}'; expected name=value", raw)
                })?;
                parsed.options.insert(name.to_string(), value.to_string());
            }
            other if other.starts_with('-') => {
                bail!("unknown flag '{}'\n\n{}", other, usage())
            }
            positional => {
                if parsed.recipe.is_some() {
                    bail!("unexpected argument '{}'\n\n{}", positional, usage());
                }
                parsed.recipe = Some(PathBuf::from(positional));
            }
        }
    }

    Ok(parsed)
}

fn load_graph(common: &CommonArgs) -> Result<(DependencyGraph, SettingsProfile)> {
    let recipe_path = common
        .recipe
        .as_ref()
        .with_context(|| format!("missing recipe file argument\n\n{}", usage()))?;

    let recipe = Recipe::load(recipe_path)
        .with_context(|| format!("loading recipe '{}'", recipe_path.display()))?;

    // The recipe's own directory is always on the search path.
    let mut search = common.recipes_path.clone();
    if let Some(parent) = recipe_path.parent() {
        let parent = if parent.as_os_str().is_empty() {
            PathBuf::from(".")
        } else {
            parent.to_path_buf()
        };
        if !search.contains(&parent) {
            search.push(parent);
        }
    }

    let loader = RecipeLoader::new(search);
    let graph = DependencyGraph::resolve(recipe, &loader)
        .with_context(|| format!("resolving dependency graph for '{}'", recipe_path.display()))?;

    let profile = match &common.profile {
        Some(path) => SettingsProfile::load(path)
            .with_context(|| format!("loading settings profile '{}'", path.display()))?,
        None => SettingsProfile::host_default(),
    };

    Ok((graph, profile))
}

fn cmd_build(args: &[String]) -> Result<()> {
    let common = parse_common(args)?;
    let (graph, profile) = load_graph(&common)?;

    let options = resolve_options(&graph, &common.options)?;
    check_graph_tools(&graph, &profile, &options).context("preflight failed")?;

    let mut config = RunnerConfig::new(&common.work_root, profile);
    config.root_options = common.options.clone();
    config.keep_going = common.keep_going;
    config.rebuild = common.rebuild;
    config.lifecycle.checksum_policy = common.checksum_policy;
    if let Some(jobs) = common.jobs {
        config.workers = jobs;
        config.lifecycle.jobs = jobs as u32;
    }

    println!(
        "[forge] building {} node(s) into {}",
        graph.len(),
        common.work_root.display()
    );

    let runner = GraphRunner::new(config)?;
    let report = runner.run(&graph)?;

    for (name, outcome) in &report.outcomes {
        match outcome {
            NodeOutcome::Built => println!("[forge] {} built", name),
            NodeOutcome::Restored => println!("[forge] {} restored from store", name),
            NodeOutcome::Failed(err) => println!("[forge] {} FAILED: {}", name, err),
            NodeOutcome::Skipped {
                unavailable_dependency,
            } => println!(
                "[forge] {} skipped (dependency '{}' unavailable)",
                name, unavailable_dependency
            ),
        }
    }

    if !report.succeeded() {
        bail!("{} node(s) did not build", report.failures().len());
    }
    Ok(())
}

fn cmd_graph(args: &[String]) -> Result<()> {
    let common = parse_common(args)?;
    let (graph, profile) = load_graph(&common)?;
    let options = resolve_options(&graph, &common.options)?;

    for name in graph.build_order()? {
        let recipe = graph.recipe(&name);
        let node_options = options.node(&name);
        let identity = package_identity(recipe, &profile, node_options);
        let rendered: Vec<String> = node_options
            .iter()
            .map(|(option, value)| format!("{}={}", option, value))
            .collect();
        println!(
            "{}/{} [{}] {}",
            recipe.package.name,
            recipe.package.version,
            &identity[..12],
            rendered.join(" ")
        );
    }
    Ok(())
}

fn cmd_check(args: &[String]) -> Result<()> {
    let common = parse_common(args)?;
    let (graph, profile) = load_graph(&common)?;
    let options = resolve_options(&graph, &common.options)?;

    check_graph_tools(&graph, &profile, &options)?;
    println!("[forge] all required build tools present");
    Ok(())
}

fn cmd_clean(args: &[String]) -> Result<()> {
    let common = parse_common(args)?;
    if common.recipe.is_some() {
        bail!("clean takes no recipe argument\n\n{}", usage());
    }

    if common.work_root.exists() {
        fs::remove_dir_all(&common.work_root)
            .with_context(|| format!("removing work root '{}'", common.work_root.display()))?;
        println!("[forge] removed {}", common.work_root.display());
    }

    let cache = default_download_cache();
    if cache.exists() {
        fs::remove_dir_all(&cache)
            .with_context(|| format!("removing download cache '{}'", cache.display()))?;
        fs::create_dir_all(&cache)?;
        println!("[forge] cleared {}", cache.display());
    }

    Ok(())
}
