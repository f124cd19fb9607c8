use anyhow::{Result, anyhow};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::{ExitStatus, Output};
use std::sync::Arc;
use std::time::Duration;
use stratum::coordinator::{Coordinator, GenerationRequest};
use stratum::discovery::ToolDiscovery;
use stratum::errors::{ErrorCategory, GenerationError};
use stratum::executor::{BootstrapContext, ComponentExecutor, ExecutorRegistry};
use stratum::integration::MANIFEST_FILE;
use stratum::model::{ComponentConfig, ComponentResult};
use stratum::process::{ProcessRunner, RunOptions};
use stratum::rollback::RollbackManager;
use stratum::tool_cache::{ToolCache, ToolCacheConfig};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// Every toolchain is installed and reports a recent version.
struct InstalledTools;

#[async_trait]
impl ProcessRunner for InstalledTools {
    async fn run(&self, program: &str, _args: &[String], _options: &RunOptions) -> Result<Output> {
        let version = match program {
            "go" => "go version go1.22.1 linux/amd64",
            "gradle" => "Gradle 8.5",
            _ => "20.11.0",
        };
        Ok(Output {
            status: ExitStatus::from_raw(0),
            stdout: version.as_bytes().to_vec(),
            stderr: Vec::new(),
        })
    }

    fn program_exists(&self, _program: &str) -> bool {
        true
    }
}

/// Nothing is installed.
struct NoTools;

#[async_trait]
impl ProcessRunner for NoTools {
    async fn run(&self, program: &str, _args: &[String], _options: &RunOptions) -> Result<Output> {
        Err(anyhow!("{program} is not installed"))
    }

    fn program_exists(&self, _program: &str) -> bool {
        false
    }
}

/// Writes a marker file after a delay, optionally failing instead.
struct DelayedExecutor {
    delay: Duration,
    failure: Option<ErrorCategory>,
    finished: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl ComponentExecutor for DelayedExecutor {
    async fn bootstrap(
        &self,
        component: &ComponentConfig,
        ctx: &BootstrapContext,
    ) -> Result<ComponentResult, GenerationError> {
        tokio::time::sleep(self.delay).await;
        self.finished.lock().push(component.component_type.clone());
        if let Some(category) = self.failure {
            return Err(GenerationError::new(category, "scripted failure"));
        }
        std::fs::create_dir_all(&ctx.target_dir).unwrap();
        std::fs::write(ctx.target_dir.join("generated.txt"), &component.name).unwrap();
        Ok(ComponentResult::succeeded(component, ctx.target_dir.clone(), false))
    }

    fn supports_component(&self, component_type: &str) -> bool {
        component_type == "go-backend" || component_type == "android"
    }

    fn default_flags(&self, _component_type: &str) -> Vec<String> {
        Vec::new()
    }
}

struct Setup {
    dir: TempDir,
    finished: Arc<Mutex<Vec<String>>>,
    coordinator: Coordinator,
}

fn setup(runner: Arc<dyn ProcessRunner>, go: (u64, Option<ErrorCategory>), android: (u64, Option<ErrorCategory>)) -> Setup {
    let dir = TempDir::new().unwrap();
    let finished = Arc::new(Mutex::new(Vec::new()));
    let executors = ExecutorRegistry::new();
    for (component_type, (delay_ms, failure)) in [("go-backend", go), ("android", android)] {
        executors.register(
            component_type,
            Arc::new(DelayedExecutor {
                delay: Duration::from_millis(delay_ms),
                failure,
                finished: finished.clone(),
            }),
        );
    }

    let cache = Arc::new(ToolCache::new(ToolCacheConfig::default()));
    let discovery = ToolDiscovery::new(cache, runner).with_default_tools();
    let coordinator = Coordinator::builder(
        Arc::new(discovery),
        Arc::new(RollbackManager::new(dir.path().join("backups"))),
    )
    .executors(Arc::new(executors))
    .build();

    Setup {
        dir,
        finished,
        coordinator,
    }
}

fn project_request(output: &Path, disable_parallel: bool) -> GenerationRequest {
    let mut request = GenerationRequest::new("demo", output)
        .component(ComponentConfig::new("go-backend", "backend"))
        .component(ComponentConfig::new("android", "mobile"));
    request.options.disable_parallel = disable_parallel;
    request
}

#[tokio::test]
async fn test_invalid_component_preserves_existing_files() {
    let s = setup(Arc::new(InstalledTools), (0, None), (0, None));
    let project = s.dir.path().join("project");
    std::fs::create_dir_all(&project).unwrap();
    std::fs::write(project.join("existing.txt"), "hello").unwrap();

    let request = GenerationRequest::new("demo", &project)
        .component(ComponentConfig::new("go-backend", "backend"))
        .component(ComponentConfig::new("android", ""));
    let err = s
        .coordinator
        .generate(request, CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(err.category(), ErrorCategory::InvalidConfig);
    assert_eq!(std::fs::read_to_string(project.join("existing.txt")).unwrap(), "hello");
    assert!(!project.join("backend").exists());
}

#[tokio::test]
async fn test_parallel_results_follow_request_order() {
    // go-backend finishes last.
    let s = setup(Arc::new(InstalledTools), (150, None), (10, None));
    let output = s.dir.path().join("demo");

    let report = s
        .coordinator
        .generate(project_request(&output, false), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(*s.finished.lock(), vec!["android", "go-backend"]);
    assert_eq!(report.components.len(), 2);
    assert_eq!(report.components[0].component_type, "go-backend");
    assert_eq!(report.components[1].component_type, "android");
    assert!(report.components.iter().all(|c| c.success && !c.used_fallback));
    assert!(output.join("backend/generated.txt").exists());
    assert!(output.join(MANIFEST_FILE).exists());
}

#[tokio::test]
async fn test_sequential_generation_runs_in_order() {
    let s = setup(Arc::new(InstalledTools), (50, None), (0, None));
    let output = s.dir.path().join("demo");

    let report = s
        .coordinator
        .generate(project_request(&output, true), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(*s.finished.lock(), vec!["go-backend", "android"]);
    assert_eq!(report.components[0].name, "backend");
    assert_eq!(report.components[1].name, "mobile");
}

#[tokio::test]
async fn test_missing_toolchains_fall_back_to_skeletons() {
    let s = setup(Arc::new(NoTools), (0, None), (0, None));
    let output = s.dir.path().join("demo");

    let report = s
        .coordinator
        .generate(project_request(&output, false), CancellationToken::new())
        .await
        .unwrap();

    assert!(s.finished.lock().is_empty());
    assert!(report.components.iter().all(|c| c.used_fallback));
    assert!(output.join("backend/go.mod").exists());
    assert!(output.join("mobile/settings.gradle.kts").exists());
    assert!(report.missing_tools.contains(&"go".to_string()));
}

#[tokio::test]
async fn test_failure_after_generation_started_restores_output() {
    let s = setup(Arc::new(InstalledTools), (0, None), (30, Some(ErrorCategory::Security)));
    let output = s.dir.path().join("demo");
    std::fs::create_dir_all(&output).unwrap();
    std::fs::write(output.join("existing.txt"), "keep").unwrap();

    let err = s
        .coordinator
        .generate(project_request(&output, false), CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(err.category(), ErrorCategory::Security);
    assert_eq!(err.component(), Some("mobile"));
    assert_eq!(std::fs::read_to_string(output.join("existing.txt")).unwrap(), "keep");
    assert!(!output.join("backend").exists());
    assert!(!output.join("mobile").exists());
    assert!(!s.coordinator.rollback_manager().has_backups());
}

#[tokio::test]
async fn test_independent_failures_are_aggregated() {
    let s = setup(
        Arc::new(InstalledTools),
        (0, Some(ErrorCategory::Security)),
        (0, Some(ErrorCategory::Unknown)),
    );
    let output = s.dir.path().join("fresh");

    let err = s
        .coordinator
        .generate(project_request(&output, false), CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(err.category(), ErrorCategory::Unknown);
    assert!(err.message().contains("multiple errors occurred (2)"));
    assert!(err.message().contains("backend"));
    assert!(err.message().contains("mobile"));
    assert!(!output.exists());
}

#[tokio::test]
async fn test_sequential_mode_stops_at_first_failure() {
    let s = setup(Arc::new(InstalledTools), (0, Some(ErrorCategory::Security)), (0, None));
    let output = s.dir.path().join("demo");

    let err = s
        .coordinator
        .generate(project_request(&output, true), CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(err.component(), Some("backend"));
    assert_eq!(*s.finished.lock(), vec!["go-backend"]);
}
