//! The generation pipeline.
//!
//! A run moves through the phases of [`PipelinePhase`]: validate the
//! request, snapshot the output directory, check toolchains, generate every
//! enabled component (concurrently unless disabled), integrate, check the
//! resulting tree, then commit. Any failure after validation rolls the
//! filesystem back before the error is returned.

use crate::discovery::{OutdatedTool, Strategy, ToolDiscovery};
use crate::errors::{
    ErrorContext, GenerationError, aggregate_errors, should_fallback, should_retry,
};
use crate::executor::{BootstrapContext, ComponentExecutor, ExecutorRegistry};
use crate::fallback::{FallbackGenerator, SkeletonGenerator};
use crate::integration::{Integrator, ManifestIntegrator};
use crate::model::{ComponentConfig, ComponentResult, IntegrationConfig};
use crate::rollback::RollbackManager;
use crate::tool_cache::ToolCache;
use serde::Serialize;
use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use crate::model::PipelinePhase;

/// Toggles for a single run.
#[derive(Debug, Clone)]
pub struct GenerationOptions {
    pub force_offline: bool,
    pub disable_parallel: bool,
    /// Replace existing component directories (after backing them up).
    pub force_overwrite: bool,
    /// Snapshot an existing output directory before generating.
    pub create_backup: bool,
    pub dry_run: bool,
    pub stream_output: bool,
    /// Upper bound for one executor invocation.
    pub bootstrap_timeout: Duration,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            force_offline: false,
            disable_parallel: false,
            force_overwrite: false,
            create_backup: true,
            dry_run: false,
            stream_output: false,
            bootstrap_timeout: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub project_name: String,
    pub output_dir: PathBuf,
    pub components: Vec<ComponentConfig>,
    /// Passed through to the integrator.
    pub integration_settings: serde_json::Map<String, serde_json::Value>,
    pub options: GenerationOptions,
}

impl GenerationRequest {
    pub fn new(project_name: &str, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            project_name: project_name.to_string(),
            output_dir: output_dir.into(),
            components: Vec::new(),
            integration_settings: serde_json::Map::new(),
            options: GenerationOptions::default(),
        }
    }

    pub fn component(mut self, component: ComponentConfig) -> Self {
        self.components.push(component);
        self
    }

    pub fn options(mut self, options: GenerationOptions) -> Self {
        self.options = options;
        self
    }
}

/// What a dry run would do for one component.
#[derive(Debug, Clone, Serialize)]
pub struct PlannedComponent {
    #[serde(rename = "type")]
    pub component_type: String,
    pub name: String,
    pub path: PathBuf,
    /// `executor`, `fallback (<reason>)` or `error: <message>`.
    pub strategy: String,
    pub flags: Vec<String>,
    /// The target directory exists and is not empty.
    pub conflict: bool,
}

#[derive(Debug, Clone)]
pub struct GenerationReport {
    pub project_name: String,
    pub output_dir: PathBuf,
    /// One per enabled component, in request order. Empty for a dry run.
    pub components: Vec<ComponentResult>,
    /// Filled only for a dry run.
    pub planned: Vec<PlannedComponent>,
    pub dry_run: bool,
    pub offline: bool,
    pub missing_tools: Vec<String>,
    pub outdated_tools: Vec<OutdatedTool>,
    pub elapsed: Duration,
}

struct Shared {
    discovery: Arc<ToolDiscovery>,
    executors: Arc<ExecutorRegistry>,
    fallback: Arc<dyn FallbackGenerator>,
    integrator: Arc<dyn Integrator>,
    rollback: Arc<RollbackManager>,
    refresh_on_reconnect: bool,
    keep_backups: usize,
}

pub struct Coordinator {
    shared: Arc<Shared>,
}

pub struct CoordinatorBuilder {
    discovery: Arc<ToolDiscovery>,
    rollback: Arc<RollbackManager>,
    executors: Option<Arc<ExecutorRegistry>>,
    fallback: Option<Arc<dyn FallbackGenerator>>,
    integrator: Option<Arc<dyn Integrator>>,
    refresh_on_reconnect: bool,
    keep_backups: usize,
}

impl CoordinatorBuilder {
    pub fn executors(mut self, executors: Arc<ExecutorRegistry>) -> Self {
        self.executors = Some(executors);
        self
    }

    pub fn fallback(mut self, fallback: Arc<dyn FallbackGenerator>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn integrator(mut self, integrator: Arc<dyn Integrator>) -> Self {
        self.integrator = Some(integrator);
        self
    }

    /// Leave cache offline mode and drop stale entries once the network is
    /// back.
    pub fn refresh_on_reconnect(mut self, refresh: bool) -> Self {
        self.refresh_on_reconnect = refresh;
        self
    }

    /// Backup copies left on disk after a successful run.
    pub fn keep_backups(mut self, keep: usize) -> Self {
        self.keep_backups = keep;
        self
    }

    pub fn build(self) -> Coordinator {
        Coordinator {
            shared: Arc::new(Shared {
                discovery: self.discovery,
                executors: self
                    .executors
                    .unwrap_or_else(|| Arc::new(ExecutorRegistry::new())),
                fallback: self
                    .fallback
                    .unwrap_or_else(|| Arc::new(SkeletonGenerator::new())),
                integrator: self.integrator.unwrap_or_else(|| Arc::new(ManifestIntegrator)),
                rollback: self.rollback,
                refresh_on_reconnect: self.refresh_on_reconnect,
                keep_backups: self.keep_backups,
            }),
        }
    }
}

impl Coordinator {
    pub fn new(
        discovery: Arc<ToolDiscovery>,
        executors: Arc<ExecutorRegistry>,
        fallback: Arc<dyn FallbackGenerator>,
        integrator: Arc<dyn Integrator>,
        rollback: Arc<RollbackManager>,
    ) -> Self {
        Self::builder(discovery, rollback)
            .executors(executors)
            .fallback(fallback)
            .integrator(integrator)
            .build()
    }

    /// Defaults: no executors, skeleton fallback, manifest integration,
    /// refresh on reconnect, five backups kept.
    pub fn builder(discovery: Arc<ToolDiscovery>, rollback: Arc<RollbackManager>) -> CoordinatorBuilder {
        CoordinatorBuilder {
            discovery,
            rollback,
            executors: None,
            fallback: None,
            integrator: None,
            refresh_on_reconnect: true,
            keep_backups: 5,
        }
    }

    pub fn discovery(&self) -> &Arc<ToolDiscovery> {
        &self.shared.discovery
    }

    pub fn rollback_manager(&self) -> &Arc<RollbackManager> {
        &self.shared.rollback
    }

    /// Runs the whole pipeline.
    pub async fn generate(
        &self,
        request: GenerationRequest,
        cancel: CancellationToken,
    ) -> Result<GenerationReport, GenerationError> {
        let started = Instant::now();
        let shared = &self.shared;

        enter(PipelinePhase::Validating);
        let components = self.validate(&request)?;
        if cancel.is_cancelled() {
            return Err(GenerationError::timeout("generation", None));
        }

        let _forced_offline = request
            .options
            .force_offline
            .then(|| ForcedOffline::engage(shared.discovery.cache()));
        let offline = shared.sync_offline_state(request.options.force_offline).await;
        let mut report = GenerationReport {
            project_name: request.project_name.clone(),
            output_dir: request.output_dir.clone(),
            components: Vec::with_capacity(components.len()),
            planned: Vec::new(),
            dry_run: request.options.dry_run,
            offline,
            missing_tools: Vec::new(),
            outdated_tools: Vec::new(),
            elapsed: Duration::ZERO,
        };

        if request.options.dry_run {
            report.planned = shared.plan(&request.output_dir, &components).await;
            report.elapsed = started.elapsed();
            return Ok(report);
        }

        enter(PipelinePhase::BackingUp);
        if let Err(err) = shared.prepare_output_dir(&request).await {
            return Err(shared.abort(err));
        }

        enter(PipelinePhase::CheckingTools);
        let tools: BTreeSet<String> = components
            .iter()
            .flat_map(|c| shared.discovery.get_tools_for_component(&c.component_type))
            .map(|t| t.name.clone())
            .collect();
        let tools: Vec<&str> = tools.iter().map(String::as_str).collect();
        let requirements = shared.discovery.check_requirements(&tools).await;
        if !requirements.all_available {
            info!("Missing tools: {}", requirements.missing.join(", "));
        }
        report.missing_tools = requirements.missing;
        report.outdated_tools = requirements.outdated;

        enter(PipelinePhase::Generating);
        let (results, errors) = if request.options.disable_parallel {
            self.generate_sequential(&request, &components, &cancel).await
        } else {
            self.generate_parallel(&request, &components, &cancel).await
        };
        if let Some(err) = aggregate_errors(errors) {
            return Err(shared.abort(err));
        }
        report.components = results;

        if cancel.is_cancelled() {
            return Err(shared.abort(GenerationError::timeout("generation", None)));
        }

        enter(PipelinePhase::Integrating);
        let integration = IntegrationConfig {
            project_name: request.project_name.clone(),
            output_dir: request.output_dir.clone(),
            settings: request.integration_settings.clone(),
        };
        if let Err(e) = shared
            .integrator
            .integrate(&report.components, &integration)
            .await
        {
            let err = GenerationError::integration(format!("integration failed: {e}")).with_cause(e);
            return Err(shared.abort(err));
        }

        enter(PipelinePhase::ValidatingStructure);
        if let Err(err) = validate_structure(&report.components) {
            return Err(shared.abort(err));
        }

        enter(PipelinePhase::Committed);
        shared.rollback.clear();
        if let Err(e) = shared.rollback.prune_backups(shared.keep_backups) {
            warn!("Failed to prune old backups: {}", e.message());
        }
        if let Err(e) = shared.discovery.cache().save() {
            warn!("Failed to save tool cache: {}", e);
        }
        report.elapsed = started.elapsed();
        info!(
            "Generated {} component(s) for '{}' in {:.1}s",
            report.components.len(),
            report.project_name,
            report.elapsed.as_secs_f64()
        );
        Ok(report)
    }

    /// Checks the request and returns the enabled components.
    pub fn validate(&self, request: &GenerationRequest) -> Result<Vec<ComponentConfig>, GenerationError> {
        let project = request.project_name.trim();
        if project.is_empty() {
            return Err(GenerationError::invalid_config("project name must not be empty"));
        }
        if !is_plain_name(project) {
            return Err(GenerationError::invalid_config(format!(
                "project name '{project}' must not contain path separators or '..'"
            )));
        }

        let enabled: Vec<ComponentConfig> = request
            .components
            .iter()
            .filter(|c| c.enabled)
            .cloned()
            .collect();
        if enabled.is_empty() {
            return Err(GenerationError::invalid_config("no enabled components to generate")
                .with_suggestion("Add at least one component, e.g. --component go-backend:api"));
        }

        let mut names = HashSet::new();
        for component in &enabled {
            if component.component_type.trim().is_empty() {
                return Err(GenerationError::invalid_config("component type must not be empty")
                    .with_component(&component.name));
            }
            if component.name.trim().is_empty() {
                return Err(GenerationError::invalid_config(format!(
                    "{} component has no name",
                    component.component_type
                )));
            }
            if !is_plain_name(&component.name) {
                return Err(GenerationError::invalid_config(
                    "component name must not contain path separators or '..'",
                )
                .with_component(&component.name));
            }
            if !names.insert(component.name.clone()) {
                return Err(GenerationError::invalid_config("duplicate component name")
                    .with_component(&component.name));
            }
            if !self.shared.supports(&component.component_type) {
                return Err(GenerationError::invalid_config(format!(
                    "unsupported component type '{}'",
                    component.component_type
                ))
                .with_component(&component.name)
                .with_suggestion(format!(
                    "Supported types: {}",
                    self.shared.supported_types().join(", ")
                )));
            }
        }

        debug!("Request for '{}' is valid ({} components)", project, enabled.len());
        Ok(enabled)
    }

    async fn generate_parallel(
        &self,
        request: &GenerationRequest,
        components: &[ComponentConfig],
        cancel: &CancellationToken,
    ) -> (Vec<ComponentResult>, Vec<GenerationError>) {
        let handles: Vec<_> = components
            .iter()
            .map(|component| {
                let shared = self.shared.clone();
                let component = component.clone();
                let ctx = context_for(request, &component, cancel);
                let force = request.options.force_overwrite;
                tokio::spawn(async move { shared.generate_component(&component, &ctx, force).await })
            })
            .collect();

        let mut results = Vec::with_capacity(components.len());
        let mut errors = Vec::new();
        // Awaited in input order, so results line up with components.
        for (component, handle) in components.iter().zip(handles) {
            let outcome = handle.await.unwrap_or_else(|e| {
                Err(GenerationError::unknown(format!("component task failed: {e}"))
                    .with_component(&component.name))
            });
            collect(request, component, outcome, &mut results, &mut errors);
        }
        (results, errors)
    }

    async fn generate_sequential(
        &self,
        request: &GenerationRequest,
        components: &[ComponentConfig],
        cancel: &CancellationToken,
    ) -> (Vec<ComponentResult>, Vec<GenerationError>) {
        let mut results = Vec::with_capacity(components.len());
        let mut errors = Vec::new();
        for component in components {
            let ctx = context_for(request, component, cancel);
            let outcome = self
                .shared
                .generate_component(component, &ctx, request.options.force_overwrite)
                .await;
            collect(request, component, outcome, &mut results, &mut errors);
            if !errors.is_empty() {
                break;
            }
        }
        (results, errors)
    }
}

impl Shared {
    fn supports(&self, component_type: &str) -> bool {
        self.executors.has(component_type) || self.fallback.supports_component(component_type)
    }

    fn supported_types(&self) -> Vec<String> {
        let mut types: BTreeSet<String> = self.executors.supported_types().into_iter().collect();
        types.extend(
            crate::fallback::SKELETON_TYPES
                .iter()
                .filter(|t| self.fallback.supports_component(t))
                .map(|t| t.to_string()),
        );
        types.into_iter().collect()
    }

    /// Brings cache offline mode in line with the request and the network.
    async fn sync_offline_state(&self, force_offline: bool) -> bool {
        if force_offline {
            return true;
        }
        let cache = self.discovery.cache();

        let Some(detector) = self.discovery.offline_detector() else {
            return cache.is_offline_mode();
        };
        if detector.is_offline().await {
            cache.set_offline_mode(true);
            return true;
        }
        if cache.is_offline_mode() && self.refresh_on_reconnect {
            cache.set_offline_mode(false);
            let removed = cache.clear_expired();
            info!("Back online, dropped {} stale tool cache entries", removed);
        }
        cache.is_offline_mode()
    }

    async fn plan(&self, output_dir: &Path, components: &[ComponentConfig]) -> Vec<PlannedComponent> {
        let mut planned = Vec::with_capacity(components.len());
        for component in components {
            let path = output_dir.join(&component.name);
            let strategy = match self.discovery.select_strategy(&component.component_type).await {
                Ok(Strategy::Executor) if self.executors.has(&component.component_type) => {
                    "executor".to_string()
                }
                Ok(Strategy::Executor) => "fallback (no executor registered)".to_string(),
                Ok(Strategy::Fallback(reason)) => format!("fallback ({reason})"),
                Err(e) => format!("error: {}", e.message()),
            };
            let flags = if strategy == "executor" {
                self.executors.default_flags(&component.component_type)
            } else {
                self.fallback.default_flags(&component.component_type)
            };
            planned.push(PlannedComponent {
                component_type: component.component_type.clone(),
                name: component.name.clone(),
                conflict: !is_empty_or_missing(&path),
                path,
                strategy,
                flags,
            });
        }
        planned
    }

    async fn prepare_output_dir(&self, request: &GenerationRequest) -> Result<(), GenerationError> {
        let output = &request.output_dir;
        if !output.exists() {
            tokio::fs::create_dir_all(output).await.map_err(|e| {
                GenerationError::file_system(format!("cannot create {}", output.display()), e)
            })?;
            self.rollback.register_temp_dir(output);
            debug!("Created output directory {}", output.display());
            return Ok(());
        }
        if request.options.create_backup {
            self.rollback.create_automatic_backup(output)?;
        }
        Ok(())
    }

    /// Produces one component, retrying and falling back as policy allows.
    async fn generate_component(
        &self,
        component: &ComponentConfig,
        ctx: &BootstrapContext,
        force_overwrite: bool,
    ) -> Result<ComponentResult, GenerationError> {
        let name = component.name.as_str();
        let component_type = component.component_type.as_str();
        if ctx.cancel.is_cancelled() {
            return Err(GenerationError::timeout("generation", None).with_component(name));
        }

        self.claim_target(component, &ctx.target_dir, force_overwrite).await?;

        let strategy = self
            .discovery
            .select_strategy(component_type)
            .await
            .map_err(|e| e.with_component(name))?;
        let executor: Option<Arc<dyn ComponentExecutor>> = match strategy {
            Strategy::Executor => self
                .executors
                .get(component_type)
                .ok()
                .filter(|e| e.supports_component(component_type)),
            Strategy::Fallback(ref reason) => {
                info!("Using fallback for '{}': {}", name, reason);
                None
            }
        };
        let can_fallback = self.fallback.supports_component(component_type)
            && (self.discovery.get_tools_for_component(component_type).is_empty()
                || self.discovery.has_fallback(component_type));

        let mut use_fallback = executor.is_none();
        let mut attempt = 1;
        loop {
            let outcome = match (&executor, use_fallback) {
                (Some(executor), false) => executor.bootstrap(component, ctx).await,
                _ => self.fallback.generate(component, ctx).await,
            };
            let err = match outcome {
                Ok(result) => {
                    debug!("Component '{}' done (fallback: {})", name, result.used_fallback);
                    return Ok(result);
                }
                Err(err) if err.component().is_none() => err.with_component(name),
                Err(err) => err,
            };
            if ctx.cancel.is_cancelled() {
                return Err(err);
            }

            let operation = if use_fallback { "fallback generation" } else { "bootstrap" };
            let error_ctx = ErrorContext::new(operation, name, PipelinePhase::Generating)
                .attempt(attempt)
                .fallback(!use_fallback && can_fallback);
            if should_retry(&err, &error_ctx) {
                warn!("{} of '{}' failed (attempt {}), retrying: {}", operation, name, attempt, err.message());
                attempt += 1;
            } else if should_fallback(&err, &error_ctx) {
                warn!("{} of '{}' failed, switching to fallback: {}", operation, name, err.message());
                use_fallback = true;
                attempt = 1;
            } else {
                return Err(err);
            }
            reset_target(&ctx.target_dir).await.map_err(|e| e.with_component(name))?;
        }
    }

    /// Makes sure the component directory is ours to write.
    async fn claim_target(
        &self,
        component: &ComponentConfig,
        target: &Path,
        force_overwrite: bool,
    ) -> Result<(), GenerationError> {
        if !target.exists() {
            self.rollback.register_temp_dir(target);
            return Ok(());
        }
        let empty = is_empty_or_missing(target);
        if !empty && !force_overwrite {
            return Err(GenerationError::validation(format!(
                "{} already exists and is not empty",
                target.display()
            ))
            .with_component(&component.name)
            .with_suggestion("Re-run with --force to replace it (a backup is kept)"));
        }

        // Even an empty directory is backed up so rollback puts it back.
        self.rollback
            .create_backup(target)
            .map_err(|e| e.with_component(&component.name))?;
        reset_target(target)
            .await
            .map_err(|e| e.with_component(&component.name))?;
        if !empty {
            info!("Replacing existing {}", target.display());
        }
        Ok(())
    }

    /// Rolls back and returns the error to surface.
    fn abort(&self, err: GenerationError) -> GenerationError {
        error!("Generation failed: {}", err.message());
        match self.rollback.rollback(&CancellationToken::new()) {
            Ok(()) => {
                enter(PipelinePhase::RolledBack);
                err
            }
            Err(rollback_err) => {
                error!("Rollback incomplete: {}", rollback_err.message());
                let manual: Vec<String> = rollback_err
                    .suggestions()
                    .iter()
                    .filter(|s| s.starts_with("rm -rf ") || s.starts_with("mv "))
                    .cloned()
                    .collect();
                err.with_suggestion(format!(
                    "Automatic rollback was incomplete ({}); finish it by hand:",
                    rollback_err.message()
                ))
                .with_suggestions(manual)
            }
        }
    }
}

fn enter(phase: PipelinePhase) {
    info!("Phase: {}", phase);
}

fn context_for(
    request: &GenerationRequest,
    component: &ComponentConfig,
    cancel: &CancellationToken,
) -> BootstrapContext {
    BootstrapContext {
        project_name: request.project_name.clone(),
        output_dir: request.output_dir.clone(),
        target_dir: request.output_dir.join(&component.name),
        timeout: request.options.bootstrap_timeout,
        cancel: cancel.clone(),
        stream_output: request.options.stream_output,
    }
}

fn collect(
    request: &GenerationRequest,
    component: &ComponentConfig,
    outcome: Result<ComponentResult, GenerationError>,
    results: &mut Vec<ComponentResult>,
    errors: &mut Vec<GenerationError>,
) {
    match outcome {
        Ok(result) => results.push(result),
        Err(err) => {
            let path = request.output_dir.join(&component.name);
            results.push(ComponentResult::failed(component, path, err.to_string()));
            errors.push(err);
        }
    }
}

fn validate_structure(components: &[ComponentResult]) -> Result<(), GenerationError> {
    for result in components.iter().filter(|c| c.success) {
        if !result.path.is_dir() {
            return Err(GenerationError::validation(format!(
                "expected directory {} is missing after generation",
                result.path.display()
            ))
            .with_component(&result.name));
        }
    }
    Ok(())
}

/// Holds the tool cache in offline mode for one run and restores the
/// previous mode when dropped.
struct ForcedOffline {
    cache: Arc<ToolCache>,
    previous: bool,
}

impl ForcedOffline {
    fn engage(cache: &Arc<ToolCache>) -> Self {
        let previous = cache.is_offline_mode();
        cache.set_offline_mode(true);
        Self {
            cache: cache.clone(),
            previous,
        }
    }
}

impl Drop for ForcedOffline {
    fn drop(&mut self) {
        self.cache.set_offline_mode(self.previous);
    }
}

fn is_plain_name(name: &str) -> bool {
    !name.contains('/') && !name.contains('\\') && !name.contains("..")
}

fn is_empty_or_missing(path: &Path) -> bool {
    match std::fs::read_dir(path) {
        Ok(mut entries) => entries.next().is_none(),
        Err(_) => !path.exists(),
    }
}

async fn reset_target(target: &Path) -> Result<(), GenerationError> {
    match tokio::fs::remove_dir_all(target).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(GenerationError::file_system(
            format!("cannot clear {}", target.display()),
            e,
        )),
    }
}
