//! The `source` stage: fetch, verify, unpack, patch.

use std::fs;

use tracing::debug;

use crate::error::{Error, Result};
use crate::fetch::{self, Fetcher};
use crate::lifecycle::NodePaths;
use crate::patch::apply_patches;
use crate::recipe::Recipe;

/// Fetch and unpack the upstream artifact, then apply declared patches.
///
/// An already-unpacked source tree is reused rather than re-extracted, so
/// re-running this stage on an unreset tree re-applies the patches against
/// already-patched files and fails with `PatchTargetNotFound` instead of
/// silently clobbering local state.
pub(crate) fn run(recipe: &Recipe, fetcher: &Fetcher, paths: &NodePaths) -> Result<()> {
    fs::create_dir_all(&paths.source).map_err(|e| Error::path_io(&paths.source, e))?;

    let marker = match &recipe.source.root {
        Some(root) => paths.source.join(root),
        None => paths.source.join(recipe.archive_filename()),
    };

    if marker.exists() {
        debug!(
            marker = %marker.display(),
            "source tree already present, skipping fetch and unpack"
        );
    } else {
        let archive = fetcher.fetch(recipe)?;
        fetch::unpack(&archive, &paths.source, recipe.source.root.as_deref())?;
    }

    apply_patches(&paths.source, &recipe.source.patches)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::ChecksumPolicy;
    use crate::fsutil::sha256_file;
    use crate::recipe::Recipe;
    use std::path::Path;
    use tempfile::TempDir;

    fn patched_recipe(url: &str, sha256: &str) -> Recipe {
        let text = format!(
            r#"
            [package]
            name = "demo"
            version = "1.0.0"

            [source]
            url = "{url}"
            sha256 = "{sha256}"

            [[source.patch]]
            file = "demo.c"
            find = "UPSTREAM"
            replace = "PATCHED"
            "#
        );
        Recipe::from_toml_str(&text, "demo").unwrap()
    }

    fn setup(temp: &TempDir) -> (Recipe, Fetcher, NodePaths) {
        let upstream = temp.path().join("demo.c");
        fs::write(&upstream, "int UPSTREAM = 1;").unwrap();
        let (digest, _) = sha256_file(&upstream).unwrap();
        let url = url::Url::from_file_path(&upstream).unwrap();

        let recipe = patched_recipe(url.as_str(), &digest);
        let fetcher = Fetcher::new(temp.path().join("cache"), ChecksumPolicy::Require);
        let paths = NodePaths::new(&temp.path().join("work"), "demo-1.0.0-abc");
        (recipe, fetcher, paths)
    }

    #[test]
    fn source_fetches_and_patches() {
        let temp = TempDir::new().unwrap();
        let (recipe, fetcher, paths) = setup(&temp);

        run(&recipe, &fetcher, &paths).unwrap();
        assert_eq!(
            fs::read_to_string(paths.source.join("demo.c")).unwrap(),
            "int PATCHED = 1;"
        );
    }

    #[test]
    fn rerun_without_reset_raises_patch_target_not_found() {
        let temp = TempDir::new().unwrap();
        let (recipe, fetcher, paths) = setup(&temp);

        run(&recipe, &fetcher, &paths).unwrap();
        let err = run(&recipe, &fetcher, &paths).unwrap_err();
        assert!(matches!(err, Error::PatchTargetNotFound { .. }));
    }

    #[test]
    fn rerun_after_reset_succeeds() {
        let temp = TempDir::new().unwrap();
        let (recipe, fetcher, paths) = setup(&temp);

        run(&recipe, &fetcher, &paths).unwrap();
        fs::remove_dir_all(&paths.source).unwrap();
        run(&recipe, &fetcher, &paths).unwrap();
        assert_eq!(
            fs::read_to_string(paths.source.join("demo.c")).unwrap(),
            "int PATCHED = 1;"
        );
    }

    #[test]
    fn missing_patch_file_reports_path() {
        let temp = TempDir::new().unwrap();
        let upstream = temp.path().join("other.c");
        fs::write(&upstream, "int x;").unwrap();
        let (digest, _) = sha256_file(&upstream).unwrap();
        let url = url::Url::from_file_path(&upstream).unwrap();

        // Patch targets demo.c, which the source does not contain.
        let recipe = patched_recipe(url.as_str(), &digest);
        let fetcher = Fetcher::new(temp.path().join("cache"), ChecksumPolicy::Require);
        let paths = NodePaths::new(&temp.path().join("work"), "demo-1.0.0-abc");

        let err = run(&recipe, &fetcher, &paths).unwrap_err();
        match err {
            Error::PathIo { path, .. } => {
                assert!(path.ends_with(Path::new("demo.c")), "{}", path.display())
            }
            other => panic!("expected PathIo, got {other}"),
        }
    }
}
