//! Configuration resolution (C11).
//!
//! Three layers, highest priority first: the DAP `launch`/`attach` request
//! body, the launcher CLI flags, then environment variables, with compiled-in
//! defaults filling whatever remains unset. The layering mechanics mirror
//! `DaemonConfig::load()`: later layers only override fields the caller
//! actually set, logging a warning instead of panicking on a bad value.

use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;

pub const ENV_SELFTEST: &str = "DEBUG_SELFTEST_MODE";
pub const ENV_LOG_DIR: &str = "DAPPER_LOG_DIR";
pub const ENV_LOG_LEVEL: &str = "DAPPER_LOG_LEVEL";

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_CORRELATION_GRACE: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TransportKind {
    Unix,
    Pipe,
    Tcp,
}

#[derive(Debug, Parser)]
#[command(name = "dapper", about = "Core coordination layer for a DAP server")]
pub struct Cli {
    #[arg(long, value_enum, default_value_t = TransportKind::Unix)]
    pub transport: TransportKind,

    #[arg(long)]
    pub endpoint: Option<String>,

    #[arg(long)]
    pub program: Option<PathBuf>,

    #[arg(long)]
    pub module: Option<String>,

    #[arg(long)]
    pub stop_on_entry: bool,

    #[arg(long)]
    pub just_my_code: bool,

    #[arg(long)]
    pub subprocess_auto_attach: bool,

    #[arg(long)]
    pub strict_expression_watch_policy: bool,

    #[arg(long)]
    pub session_id: Option<String>,

    /// Path to an external debuggee-launcher executable. When set, `launch`
    /// spawns it and drives it over the C1/C2 engine IPC instead of an
    /// in-process engine (SPEC_FULL.md §4.9).
    #[arg(long)]
    pub debuggee_launcher: Option<PathBuf>,
}

/// Fully resolved, immutable-after-launch session configuration.
#[derive(Debug, Clone)]
pub struct Configuration {
    pub transport: TransportKind,
    pub endpoint: Option<String>,
    pub program: Option<PathBuf>,
    pub module: Option<String>,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub stop_on_entry: bool,
    pub just_my_code: bool,
    pub subprocess_auto_attach: bool,
    pub strict_expression_watch_policy: bool,
    pub session_id: Option<String>,
    pub connect_timeout: Duration,
    pub correlation_grace: Duration,
    /// Qualified-name prefixes treated as event-loop/scheduler internals and
    /// transparently skipped by the step coordinator's async-aware filter.
    pub async_internal_frame_prefixes: Vec<String>,
    /// Source-path prefixes considered library/dependency install roots; a
    /// frame whose source does not start with any of these is "user code"
    /// for the `userUnhandled` exception filter's predicate.
    pub library_install_roots: Vec<String>,
    /// When set, `launch` spawns this executable as an external debuggee and
    /// talks to it over the C1/C2 engine IPC; when unset, the session drives
    /// an in-process engine directly (SPEC_FULL.md §4.9).
    pub debuggee_launcher: Option<PathBuf>,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            transport: TransportKind::Unix,
            endpoint: None,
            program: None,
            module: None,
            args: Vec::new(),
            cwd: None,
            stop_on_entry: false,
            just_my_code: true,
            subprocess_auto_attach: false,
            strict_expression_watch_policy: false,
            session_id: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            correlation_grace: DEFAULT_CORRELATION_GRACE,
            async_internal_frame_prefixes: vec![
                "asyncio.base_events".into(),
                "asyncio.tasks".into(),
                "asyncio.events".into(),
            ],
            library_install_roots: Vec::new(),
            debuggee_launcher: None,
        }
    }
}

impl Configuration {
    /// Layer 1: seed from launcher CLI flags.
    pub fn from_cli(cli: &Cli) -> Self {
        let mut cfg = Configuration {
            transport: cli.transport,
            endpoint: cli.endpoint.clone(),
            program: cli.program.clone(),
            module: cli.module.clone(),
            stop_on_entry: cli.stop_on_entry,
            just_my_code: cli.just_my_code,
            subprocess_auto_attach: cli.subprocess_auto_attach,
            strict_expression_watch_policy: cli.strict_expression_watch_policy,
            session_id: cli.session_id.clone(),
            debuggee_launcher: cli.debuggee_launcher.clone(),
            ..Configuration::default()
        };
        cfg.apply_env();
        cfg
    }

    /// Layer 2: environment variables override whatever the CLI left default.
    fn apply_env(&mut self) {
        if std::env::var(ENV_SELFTEST).is_ok() {
            self.transport = TransportKind::Tcp;
            self.endpoint = Some("127.0.0.1:0".into());
        }
    }

    /// Layer 3 (highest priority): apply fields present in a DAP
    /// `launch`/`attach` request. Only fields the client actually supplied
    /// are overridden; everything else is left as resolved by the lower
    /// layers.
    pub fn apply_launch_args(&mut self, args: &crate::dap_types::LaunchRequestArguments) {
        if let Some(p) = &args.program {
            self.program = Some(PathBuf::from(p));
        }
        if let Some(m) = &args.module {
            self.module = Some(m.clone());
        }
        if let Some(a) = &args.args {
            self.args = a.clone();
        }
        if let Some(c) = &args.cwd {
            self.cwd = Some(PathBuf::from(c));
        }
        if let Some(v) = args.stop_on_entry {
            self.stop_on_entry = v;
        }
        if let Some(v) = args.just_my_code {
            self.just_my_code = v;
        }
        if let Some(v) = args.subprocess_auto_attach {
            self.subprocess_auto_attach = v;
        }
        if let Some(v) = args.strict_expression_watch_policy {
            self.strict_expression_watch_policy = v;
        }
        if let Some(s) = &args.session_id {
            self.session_id = Some(s.clone());
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.program.is_none() && self.module.is_none() {
            return Err("either 'program' or 'module' must be set".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dap_types::LaunchRequestArguments;

    #[test]
    fn defaults_are_sane() {
        let cfg = Configuration::default();
        assert!(cfg.just_my_code);
        assert!(!cfg.stop_on_entry);
        assert_eq!(cfg.connect_timeout, DEFAULT_CONNECT_TIMEOUT);
        assert!(cfg.debuggee_launcher.is_none());
    }

    #[test]
    fn cli_debuggee_launcher_flows_into_configuration() {
        let cli = Cli {
            transport: TransportKind::Unix,
            endpoint: None,
            program: None,
            module: None,
            stop_on_entry: false,
            just_my_code: true,
            subprocess_auto_attach: false,
            strict_expression_watch_policy: false,
            session_id: None,
            debuggee_launcher: Some(PathBuf::from("/usr/local/bin/pydbg-engine")),
        };
        let cfg = Configuration::from_cli(&cli);
        assert_eq!(cfg.debuggee_launcher, Some(PathBuf::from("/usr/local/bin/pydbg-engine")));
    }

    #[test]
    fn launch_args_override_cli_layer() {
        let mut cfg = Configuration::default();
        cfg.program = Some(PathBuf::from("/tmp/cli-chosen.py"));
        let args = LaunchRequestArguments {
            program: Some("/tmp/launch-chosen.py".into()),
            stop_on_entry: Some(true),
            ..Default::default()
        };
        cfg.apply_launch_args(&args);
        assert_eq!(cfg.program, Some(PathBuf::from("/tmp/launch-chosen.py")));
        assert!(cfg.stop_on_entry);
    }

    #[test]
    fn validate_requires_program_or_module() {
        let cfg = Configuration::default();
        assert!(cfg.validate().is_err());
        let mut cfg2 = cfg.clone();
        cfg2.module = Some("mypkg.mymod".into());
        assert!(cfg2.validate().is_ok());
    }

    #[test]
    fn launch_args_set_strict_expression_watch_policy() {
        let mut cfg = Configuration::default();
        assert!(!cfg.strict_expression_watch_policy);
        let args = LaunchRequestArguments {
            strict_expression_watch_policy: Some(true),
            ..Default::default()
        };
        cfg.apply_launch_args(&args);
        assert!(cfg.strict_expression_watch_policy);
    }

    #[test]
    fn unset_launch_fields_leave_lower_layers_untouched() {
        let mut cfg = Configuration::default();
        cfg.cwd = Some(PathBuf::from("/work"));
        cfg.apply_launch_args(&LaunchRequestArguments::default());
        assert_eq!(cfg.cwd, Some(PathBuf::from("/work")));
    }
}
