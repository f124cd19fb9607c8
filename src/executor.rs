//! Component executors and the registry that maps component types to them.
//!
//! An executor bootstraps one kind of component, usually by driving an
//! external toolchain (`go mod init`, `create-next-app`, `flutter create`).
//! The coordinator only talks to the [`ComponentExecutor`] trait, so new
//! component types are added by registering another executor at startup.

use crate::errors::GenerationError;
use crate::model::{ComponentConfig, ComponentResult};
use crate::process::{ProcessError, ProcessRunner, RunOptions, combined_output};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Where and how a component is being generated.
#[derive(Debug, Clone)]
pub struct BootstrapContext {
    pub project_name: String,
    /// Project root; components live in direct subdirectories.
    pub output_dir: PathBuf,
    /// `output_dir/<component name>`.
    pub target_dir: PathBuf,
    pub timeout: Duration,
    pub cancel: CancellationToken,
    pub stream_output: bool,
}

/// Strategy that bootstraps one or more component types.
#[async_trait]
pub trait ComponentExecutor: Send + Sync {
    /// Creates the component in `ctx.target_dir`.
    async fn bootstrap(
        &self,
        component: &ComponentConfig,
        ctx: &BootstrapContext,
    ) -> Result<ComponentResult, GenerationError>;

    fn supports_component(&self, component_type: &str) -> bool;

    fn default_flags(&self, component_type: &str) -> Vec<String>;
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("no executor registered for component type '{0}'")]
    NotRegistered(String),
}

/// Thread-safe map from component type to executor.
#[derive(Default)]
pub struct ExecutorRegistry {
    executors: RwLock<HashMap<String, Arc<dyn ComponentExecutor>>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `executor` for `component_type`, replacing any previous one.
    pub fn register(&self, component_type: &str, executor: Arc<dyn ComponentExecutor>) {
        debug!("Registered executor for '{}'", component_type);
        self.executors
            .write()
            .insert(component_type.to_string(), executor);
    }

    pub fn get(&self, component_type: &str) -> Result<Arc<dyn ComponentExecutor>, RegistryError> {
        self.executors
            .read()
            .get(component_type)
            .cloned()
            .ok_or_else(|| RegistryError::NotRegistered(component_type.to_string()))
    }

    pub fn has(&self, component_type: &str) -> bool {
        self.executors.read().contains_key(component_type)
    }

    /// Empty for unknown types.
    pub fn default_flags(&self, component_type: &str) -> Vec<String> {
        self.executors
            .read()
            .get(component_type)
            .map(|executor| executor.default_flags(component_type))
            .unwrap_or_default()
    }

    /// Sorted.
    pub fn supported_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.executors.read().keys().cloned().collect();
        types.sort();
        types
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkDir {
    /// Run in the project root; the tool creates the component directory.
    Parent,
    /// Create the component directory first and run inside it.
    Target,
}

/// Command-line template for one component type.
///
/// Arguments may contain `{name}`, `{snake_name}`, `{project}` and
/// `{module}` placeholders. An argument that is exactly `{flags}` expands to
/// the default flags followed by the component's `flags` setting; without
/// it the flags are appended.
#[derive(Debug, Clone)]
pub struct ToolchainCommand {
    pub component_type: String,
    pub program: String,
    pub args: Vec<String>,
    pub default_flags: Vec<String>,
    pub work_dir: WorkDir,
}

impl ToolchainCommand {
    pub fn new(component_type: &str, program: &str, args: &[&str], work_dir: WorkDir) -> Self {
        Self {
            component_type: component_type.to_string(),
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            default_flags: Vec::new(),
            work_dir,
        }
    }

    pub fn flags(mut self, flags: &[&str]) -> Self {
        self.default_flags = flags.iter().map(|f| f.to_string()).collect();
        self
    }

    fn render_args(&self, component: &ComponentConfig, ctx: &BootstrapContext) -> Vec<String> {
        let mut flags = self.default_flags.clone();
        flags.extend(component.setting_list("flags"));

        let module = component
            .setting_str("module")
            .unwrap_or(&component.name)
            .to_string();
        let snake_name = snake_case(&component.name);
        let substitute = |arg: &str| {
            arg.replace("{name}", &component.name)
                .replace("{snake_name}", &snake_name)
                .replace("{project}", &ctx.project_name)
                .replace("{module}", &module)
        };

        let mut rendered = Vec::with_capacity(self.args.len() + flags.len());
        let mut placed_flags = false;
        for arg in &self.args {
            if arg == "{flags}" {
                rendered.extend(flags.iter().cloned());
                placed_flags = true;
            } else {
                rendered.push(substitute(arg));
            }
        }
        if !placed_flags {
            rendered.extend(flags);
        }
        rendered
    }
}

/// Commands for the component types stratum supports out of the box.
pub fn builtin_commands() -> Vec<ToolchainCommand> {
    vec![
        ToolchainCommand::new("go-backend", "go", &["mod", "init", "{module}"], WorkDir::Target),
        ToolchainCommand::new(
            "nextjs",
            "npx",
            &["--yes", "create-next-app@latest", "{name}", "{flags}"],
            WorkDir::Parent,
        )
        .flags(&["--typescript", "--eslint", "--app", "--use-npm"]),
        ToolchainCommand::new(
            "react",
            "npm",
            &["create", "vite@latest", "{name}", "--", "--template", "react-ts"],
            WorkDir::Parent,
        ),
        ToolchainCommand::new(
            "flutter",
            "flutter",
            &["create", "{flags}", "--project-name", "{snake_name}", "{name}"],
            WorkDir::Parent,
        )
        .flags(&["--org", "com.example"]),
        ToolchainCommand::new(
            "android",
            "gradle",
            &["init", "--type", "kotlin-application", "--dsl", "kotlin", "--project-name", "{name}"],
            WorkDir::Target,
        )
        .flags(&["--use-defaults"]),
    ]
}

/// Executor that runs a templated toolchain command per component type.
pub struct ToolchainExecutor {
    commands: HashMap<String, ToolchainCommand>,
    runner: Arc<dyn ProcessRunner>,
}

impl ToolchainExecutor {
    pub fn new(commands: Vec<ToolchainCommand>, runner: Arc<dyn ProcessRunner>) -> Self {
        Self {
            commands: commands
                .into_iter()
                .map(|c| (c.component_type.clone(), c))
                .collect(),
            runner,
        }
    }

    pub fn builtin(runner: Arc<dyn ProcessRunner>) -> Self {
        Self::new(builtin_commands(), runner)
    }

    pub fn component_types(&self) -> Vec<String> {
        self.commands.keys().cloned().collect()
    }

    fn classify(&self, program: &str, err: anyhow::Error) -> GenerationError {
        match err.downcast_ref::<ProcessError>() {
            Some(ProcessError::Spawn { source, .. })
                if source.kind() == std::io::ErrorKind::NotFound =>
            {
                return GenerationError::tool_not_found(program, None);
            }
            Some(ProcessError::TimedOut { after, .. }) => {
                return GenerationError::timeout(&format!("'{program}'"), Some(*after));
            }
            Some(ProcessError::Cancelled { .. }) => {
                return GenerationError::timeout(&format!("'{program}'"), None);
            }
            _ => {}
        }
        GenerationError::tool_execution(program, format!("failed to run '{program}'")).with_cause(err)
    }
}

#[async_trait]
impl ComponentExecutor for ToolchainExecutor {
    async fn bootstrap(
        &self,
        component: &ComponentConfig,
        ctx: &BootstrapContext,
    ) -> Result<ComponentResult, GenerationError> {
        let command = self.commands.get(&component.component_type).ok_or_else(|| {
            GenerationError::invalid_config(format!(
                "no toolchain command for component type '{}'",
                component.component_type
            ))
            .with_component(&component.name)
        })?;

        let cwd = match command.work_dir {
            WorkDir::Parent => ctx.output_dir.clone(),
            WorkDir::Target => ctx.target_dir.clone(),
        };
        tokio::fs::create_dir_all(&cwd).await.map_err(|e| {
            GenerationError::file_system(format!("cannot create {}", cwd.display()), e)
                .with_component(&component.name)
        })?;

        let args = command.render_args(component, ctx);
        info!("Bootstrapping {} '{}' with {} {:?}", component.component_type, component.name, command.program, args);

        let options = RunOptions::default()
            .in_dir(&cwd)
            .with_timeout(ctx.timeout)
            .with_cancel(ctx.cancel.clone())
            .streaming(ctx.stream_output);
        let output = self
            .runner
            .run(&command.program, &args, &options)
            .await
            .map_err(|e| self.classify(&command.program, e).with_component(&component.name))?;

        if !output.status.success() {
            return Err(GenerationError::tool_execution(
                &command.program,
                format!("'{}' exited with {}", command.program, output.status),
            )
            .with_cause(tail(&combined_output(&output), 20))
            .with_component(&component.name));
        }

        if !ctx.target_dir.is_dir() {
            return Err(GenerationError::tool_execution(
                &command.program,
                format!(
                    "'{}' finished but {} was not created",
                    command.program,
                    ctx.target_dir.display()
                ),
            )
            .with_component(&component.name));
        }

        Ok(ComponentResult::succeeded(component, ctx.target_dir.clone(), false))
    }

    fn supports_component(&self, component_type: &str) -> bool {
        self.commands.contains_key(component_type)
    }

    fn default_flags(&self, component_type: &str) -> Vec<String> {
        self.commands
            .get(component_type)
            .map(|c| c.default_flags.clone())
            .unwrap_or_default()
    }
}

/// Registry with [`ToolchainExecutor`] registered for every built-in type.
pub fn builtin_registry(runner: Arc<dyn ProcessRunner>) -> ExecutorRegistry {
    let registry = ExecutorRegistry::new();
    let executor = Arc::new(ToolchainExecutor::builtin(runner));
    for component_type in executor.component_types() {
        registry.register(&component_type, executor.clone());
    }
    registry
}

pub fn snake_case(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect()
}

fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}
