//! The `build` stage: translate settings and options into external-tool
//! invocations.
//!
//! Each declared build step resolves its tool on PATH, renders its argument
//! templates, and runs with captured stdout/stderr. Nonzero exit surfaces
//! [`Error::BuildToolInvocation`] carrying the exit code and the captured
//! output; there are no retries over a non-idempotent external tool.

use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info};
use wait_timeout::ChildExt;

use crate::error::{Error, Result};
use crate::lifecycle::{CancelToken, NodePaths};
use crate::profile::SettingsProfile;
use crate::recipe::{substitute, BuildStep, Recipe};

const WAIT_POLL: Duration = Duration::from_millis(200);

pub(crate) fn run(
    recipe: &Recipe,
    profile: &SettingsProfile,
    options: &BTreeMap<String, String>,
    vars: &BTreeMap<String, String>,
    paths: &NodePaths,
    timeout: Duration,
    cancel: &CancelToken,
) -> Result<()> {
    fs::create_dir_all(&paths.build).map_err(|e| Error::path_io(&paths.build, e))?;

    for step in &recipe.build.steps {
        if let Some(when) = &step.when {
            if !when.matches(profile, options) {
                debug!(tool = %step.tool, "skipping build step, predicate not met");
                continue;
            }
        }
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        invoke_step(step, profile, options, vars, paths, timeout, cancel)?;
    }

    Ok(())
}

fn invoke_step(
    step: &BuildStep,
    profile: &SettingsProfile,
    options: &BTreeMap<String, String>,
    vars: &BTreeMap<String, String>,
    paths: &NodePaths,
    timeout: Duration,
    cancel: &CancelToken,
) -> Result<()> {
    let tool_path = which::which(&step.tool).map_err(|_| Error::BuildToolMissing {
        tool: step.tool.clone(),
    })?;

    let mut args: Vec<String> = step.args.iter().map(|a| substitute(a, vars)).collect();
    for conditional in &step.conditional_args {
        if conditional.when.matches(profile, options) {
            args.push(substitute(&conditional.value, vars));
        }
    }

    let cwd = match &step.cwd {
        Some(sub) => paths.build.join(substitute(sub, vars)),
        None => paths.build.clone(),
    };
    fs::create_dir_all(&cwd).map_err(|e| Error::path_io(&cwd, e))?;

    info!(tool = %step.tool, args = ?args, cwd = %cwd.display(), "running build step");
    let output = invoke(&step.tool, &tool_path, &args, &cwd, timeout, cancel)?;
    debug!(tool = %step.tool, output = %output, "build step finished");
    Ok(())
}

/// Run one external tool to completion, polling for cancellation and
/// enforcing the wall-clock timeout. Returns the captured output.
fn invoke(
    tool: &str,
    tool_path: &Path,
    args: &[String],
    cwd: &Path,
    timeout: Duration,
    cancel: &CancelToken,
) -> Result<String> {
    let mut child = Command::new(tool_path)
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| Error::path_io(tool_path, e))?;

    // Drain both pipes off-thread so a chatty tool cannot deadlock against
    // a full pipe buffer while we wait on it.
    let stdout_reader = child.stdout.take().map(spawn_reader);
    let stderr_reader = child.stderr.take().map(spawn_reader);

    let started = Instant::now();
    let status = loop {
        if cancel.is_cancelled() {
            let _ = child.kill();
            let _ = child.wait();
            return Err(Error::Cancelled);
        }
        match child.wait_timeout(WAIT_POLL)? {
            Some(status) => break status,
            None if started.elapsed() >= timeout => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(Error::BuildTimeout {
                    tool: tool.to_string(),
                    seconds: timeout.as_secs(),
                });
            }
            None => {}
        }
    };

    let mut output = String::new();
    for reader in [stdout_reader, stderr_reader].into_iter().flatten() {
        output.push_str(&reader.join().unwrap_or_default());
    }

    if !status.success() {
        return Err(Error::BuildToolInvocation {
            tool: tool.to_string(),
            code: status.code().unwrap_or(-1),
            output,
        });
    }

    Ok(output)
}

fn spawn_reader<R: Read + Send + 'static>(mut source: R) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = String::new();
        let _ = source.read_to_string(&mut buf);
        buf
    })
}
