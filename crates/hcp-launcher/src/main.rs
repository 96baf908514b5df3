// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
//! The supervisor binary: runs setup steps, starts services, waits on
//! readiness touchfiles, reaps, and tears down in order.

use anyhow::{Context, Result, bail};
use hcp_common::Config;
use hcp_launcher::{LauncherConfig, Service, Target, parse_targets};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use std::collections::{BTreeMap, HashSet};
use std::os::unix::process::CommandExt;
use std::process::{Child, Command};
use std::time::Duration;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Poll cadence while waiting on readiness touchfiles.
const START_POLL: Duration = Duration::from_millis(500);

/// Poll cadence while reaping supervised children.
const REAP_POLL: Duration = Duration::from_secs(2);

struct Started {
    name: String,
    child: Child,
    nowait: bool,
}

struct Supervisor {
    config: LauncherConfig,
    base_env: BTreeMap<String, String>,
    service_args: Option<Vec<String>>,
    started: Vec<Started>,
    launched: HashSet<String>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("hcp=info")),
        )
        .init();

    // Behave the same regardless of where the caller stood, and never
    // leave identity-switched children in a directory they can't re-enter.
    std::env::set_current_dir("/").context("chdir to /")?;

    let cfg = Config::from_env().context("load supervisor config")?;
    let config = LauncherConfig::from_config(&cfg)?;

    let argv: Vec<String> = std::env::args().skip(1).collect();
    let tokens = if argv.is_empty() {
        match std::env::var("HCP_LAUNCHER_TGTS") {
            Ok(s) if !s.is_empty() => s.split_whitespace().map(str::to_string).collect(),
            _ => config.default_targets.clone(),
        }
    } else {
        argv
    };
    debug!(target: "hcp.launcher", ?tokens, "processing options");
    let parsed = parse_targets(&tokens, &config)?;

    let mut base_env: BTreeMap<String, String> = std::env::vars().collect();
    base_env.insert("HCP_LAUNCHER_TGTS".to_string(), tokens.join(" "));
    if let Some(transform) = &config.env {
        base_env = transform.apply(&base_env);
    }

    let mut sup = Supervisor {
        config,
        base_env,
        service_args: parsed.service_args,
        started: Vec::new(),
        launched: HashSet::new(),
    };

    let mut failure = None;
    for target in &parsed.targets {
        let outcome = match target {
            Target::Setup(tag) => sup.run_setup(tag.as_deref()),
            Target::Start(tag) => sup.run_start(tag.as_deref()),
            Target::Exec(name) => sup.run_exec(name),
            Target::Custom(argv) => run_custom(argv),
        };
        if let Err(e) = outcome {
            failure = Some(e);
            break;
        }
    }

    let mut last_exit = None;
    if failure.is_none() {
        match sup.supervise() {
            Ok(code) => last_exit = code,
            Err(e) => failure = Some(e),
        }
    }

    // Whatever happened, encourage anything still running to exit; the
    // supervisor cleans up after itself rather than leaving processes
    // dangling in contexts that outlive it.
    sup.terminate_all();

    if let Some(e) = failure {
        return Err(e);
    }
    if let Some(code) = last_exit {
        if code != 0 {
            bail!("child failed: {code}");
        }
    }
    info!(target: "hcp.launcher", "done");

    if let Some(lights_out) = &sup.config.lights_out {
        let err = Command::new(&lights_out[0]).args(&lights_out[1..]).exec();
        bail!("lights_out exec failed: {err}");
    }
    Ok(())
}

/// Run an arbitrary command to completion and exit with its code.
fn run_custom(argv: &[String]) -> Result<()> {
    let Some(program) = argv.first() else {
        bail!("custom: empty command");
    };
    debug!(target: "hcp.launcher", ?argv, "running custom command");
    let status = Command::new(program)
        .args(&argv[1..])
        .status()
        .with_context(|| format!("run {program}"))?;
    std::process::exit(status.code().unwrap_or(1));
}

impl Supervisor {
    fn service_env(&self, service: &Service) -> BTreeMap<String, String> {
        match &service.env {
            Some(transform) => transform.apply(&self.base_env),
            None => self.base_env.clone(),
        }
    }

    fn run_setup(&mut self, tag: Option<&str>) -> Result<()> {
        for service in &self.config.services {
            for step in &service.setup {
                if tag.is_some() && tag != step.tag.as_deref() {
                    continue;
                }
                if let Some(touch) = &step.touch {
                    if touch.exists() {
                        debug!(
                            target: "hcp.launcher",
                            service = %service.name,
                            touch = %touch.path().display(),
                            "already set up"
                        );
                        continue;
                    }
                }
                let Some(exec) = &step.exec else {
                    bail!("'{}': setup has no exec and its touch target is absent", service.name);
                };
                debug!(target: "hcp.launcher", service = %service.name, ?exec, "running setup");
                let status = Command::new(&exec[0])
                    .args(&exec[1..])
                    .env_clear()
                    .envs(self.service_env(service))
                    .status()
                    .with_context(|| format!("'{}': spawn setup", service.name))?;
                if !status.success() {
                    bail!(
                        "'{}': setup failed, code: {:?}",
                        service.name,
                        status.code()
                    );
                }
                if let Some(touch) = &step.touch {
                    if !touch.exists() {
                        bail!(
                            "'{}': setup didn't create '{}'",
                            service.name,
                            touch.path().display()
                        );
                    }
                }
            }
        }
        Ok(())
    }

    fn run_start(&mut self, tag: Option<&str>) -> Result<()> {
        let mut awaiting: Vec<(String, Child, std::path::PathBuf)> = Vec::new();

        for service in &self.config.services {
            let Some(exec) = &service.exec else { continue };
            if self.launched.contains(&service.name) {
                continue;
            }
            if tag.is_some() && tag != service.tag.as_deref() {
                continue;
            }
            // Sanity-check the setup guards before launching.
            for step in &service.setup {
                if let Some(touch) = &step.touch {
                    if !touch.exists() {
                        bail!(
                            "'{}': '{}' not set up",
                            service.name,
                            touch.path().display()
                        );
                    }
                }
            }

            let args = match (&self.service_args, &self.config.args_for) {
                (Some(user_args), Some(args_for)) if *args_for == service.name => user_args,
                _ => &service.args,
            };
            let mut cmdline = exec.clone();
            cmdline.extend(args.iter().cloned());
            info!(target: "hcp.launcher", service = %service.name, ?cmdline, "starting");

            let child = Command::new(&cmdline[0])
                .args(&cmdline[1..])
                .env_clear()
                .envs(self.service_env(service))
                .spawn()
                .with_context(|| format!("'{}': spawn", service.name))?;
            self.launched.insert(service.name.clone());

            match &service.until {
                Some(touchfile) => {
                    awaiting.push((service.name.clone(), child, touchfile.clone()))
                }
                None => self.started.push(Started {
                    name: service.name.clone(),
                    child,
                    nowait: service.nowait,
                }),
            }
        }

        // Wait for readiness touchfiles, failing fast on services that
        // die before producing theirs.
        while !awaiting.is_empty() {
            let mut still_waiting = Vec::new();
            for (name, mut child, touchfile) in awaiting {
                let exited = child.try_wait().with_context(|| format!("'{name}': wait"))?;
                if let Some(status) = exited {
                    if !status.success() {
                        bail!("'{name}' failed before becoming ready");
                    }
                    if !touchfile.is_file() {
                        bail!("'{name}' didn't produce '{}'", touchfile.display());
                    }
                    // Exited cleanly with its touchfile in place; done.
                    continue;
                }
                if touchfile.is_file() {
                    debug!(target: "hcp.launcher", service = %name, touch = %touchfile.display(), "ready");
                    let nowait = self
                        .config
                        .service(&name)
                        .map(|s| s.nowait)
                        .unwrap_or(false);
                    self.started.push(Started {
                        name,
                        child,
                        nowait,
                    });
                    continue;
                }
                still_waiting.push((name, child, touchfile));
            }
            awaiting = still_waiting;
            if !awaiting.is_empty() {
                std::thread::sleep(START_POLL);
            }
        }
        Ok(())
    }

    fn run_exec(&mut self, name: &str) -> Result<()> {
        let Some(service) = self.config.service(name) else {
            bail!("'{name}' wasn't found");
        };
        let Some(exec) = &service.exec else {
            bail!("'{name}' has no exec");
        };
        let mut cmdline = exec.clone();
        cmdline.extend(service.args.iter().cloned());
        info!(target: "hcp.launcher", service = %name, ?cmdline, "replacing supervisor");
        let env = self.service_env(service);
        let err = Command::new(&cmdline[0])
            .args(&cmdline[1..])
            .env_clear()
            .envs(env)
            .exec();
        bail!("'{name}' exec failed: {err}");
    }

    /// Reap supervised children until no waitable ones remain, returning
    /// the exit code of the last child seen exiting.
    fn supervise(&mut self) -> Result<Option<i32>> {
        let mut last_exit = None;
        loop {
            let mut alive = Vec::new();
            let mut num_waiting = 0;
            for mut entry in self.started.drain(..) {
                match entry.child.try_wait() {
                    Ok(Some(status)) => {
                        info!(
                            target: "hcp.launcher",
                            service = %entry.name,
                            code = ?status.code(),
                            "child exited"
                        );
                        last_exit = Some(status.code().unwrap_or(1));
                    }
                    Ok(None) => {
                        if !entry.nowait {
                            num_waiting += 1;
                        }
                        alive.push(entry);
                    }
                    Err(e) => {
                        warn!(target: "hcp.launcher", service = %entry.name, error = %e, "wait failed");
                        alive.push(entry);
                    }
                }
            }
            self.started = alive;
            if num_waiting == 0 {
                return Ok(last_exit);
            }
            std::thread::sleep(REAP_POLL);
        }
    }

    /// Send SIGTERM to everything still supervised.
    fn terminate_all(&mut self) {
        for entry in self.started.drain(..) {
            debug!(target: "hcp.launcher", service = %entry.name, "terminating");
            let _ = kill(Pid::from_raw(entry.child.id() as i32), Signal::SIGTERM);
        }
    }
}
