//! Tool discovery: which external toolchains are installed, at what
//! version, and whether a component type has to fall back to the built-in
//! skeleton generator.
//!
//! Answers come from the [`ToolCache`] when possible. A cache miss costs a
//! PATH lookup (availability) or one `--version` invocation (version); both
//! results are written back to the cache.

use crate::errors::GenerationError;
use crate::offline::OfflineDetector;
use crate::process::{ProcessError, ProcessRunner, RunOptions, combined_output};
use crate::tool_cache::ToolCache;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Static description of an external tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolMetadata {
    pub name: String,
    pub command: String,
    pub version_flag: String,
    #[serde(default)]
    pub min_version: Option<String>,
    pub fallback_available: bool,
    pub component_types: Vec<String>,
    /// OS name (as in `std::env::consts::OS`, or `default`) to docs URL.
    #[serde(default)]
    pub install_docs: HashMap<String, String>,
}

impl ToolMetadata {
    pub fn new(name: &str, command: &str, version_flag: &str) -> Self {
        Self {
            name: name.to_string(),
            command: command.to_string(),
            version_flag: version_flag.to_string(),
            min_version: None,
            fallback_available: false,
            component_types: Vec::new(),
            install_docs: HashMap::new(),
        }
    }

    pub fn min_version(mut self, version: &str) -> Self {
        self.min_version = Some(version.to_string());
        self
    }

    pub fn with_fallback(mut self) -> Self {
        self.fallback_available = true;
        self
    }

    pub fn for_components(mut self, types: &[&str]) -> Self {
        self.component_types = types.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn install_doc(mut self, os: &str, url: &str) -> Self {
        self.install_docs.insert(os.to_string(), url.to_string());
        self
    }

    fn needed_by(&self, component_type: &str) -> bool {
        self.component_types.iter().any(|t| t == component_type)
    }
}

/// The toolchains stratum knows how to drive out of the box.
pub fn default_tools() -> Vec<ToolMetadata> {
    vec![
        ToolMetadata::new("go", "go", "version")
            .min_version("1.21")
            .with_fallback()
            .for_components(&["go-backend"])
            .install_doc("default", "https://go.dev/doc/install")
            .install_doc("macos", "https://go.dev/dl/"),
        ToolMetadata::new("node", "node", "--version")
            .min_version("18.0.0")
            .with_fallback()
            .for_components(&["nextjs", "react"])
            .install_doc("default", "https://nodejs.org/en/download"),
        ToolMetadata::new("npx", "npx", "--version")
            .with_fallback()
            .for_components(&["nextjs"])
            .install_doc("default", "https://docs.npmjs.com/downloading-and-installing-node-js-and-npm"),
        ToolMetadata::new("npm", "npm", "--version")
            .with_fallback()
            .for_components(&["react"])
            .install_doc("default", "https://docs.npmjs.com/downloading-and-installing-node-js-and-npm"),
        ToolMetadata::new("flutter", "flutter", "--version")
            .min_version("3.0.0")
            .with_fallback()
            .for_components(&["flutter"])
            .install_doc("default", "https://docs.flutter.dev/get-started/install"),
        ToolMetadata::new("gradle", "gradle", "--version")
            .min_version("8.0")
            .with_fallback()
            .for_components(&["android"])
            .install_doc("default", "https://gradle.org/install/")
            .install_doc("macos", "https://gradle.org/install/#with-homebrew"),
    ]
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FallbackReason {
    Offline,
    NoToolsRegistered,
    ToolUnavailable(String),
}

impl fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Offline => f.write_str("offline"),
            Self::NoToolsRegistered => f.write_str("no external toolchain for this component type"),
            Self::ToolUnavailable(tool) => write!(f, "'{tool}' is not installed"),
        }
    }
}

/// How a component will be produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Strategy {
    Executor,
    Fallback(FallbackReason),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutdatedTool {
    pub name: String,
    pub found: String,
    pub required: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RequirementsReport {
    pub all_available: bool,
    pub available: Vec<String>,
    /// Unregistered or not installed.
    pub missing: Vec<String>,
    /// Installed but older than `min_version`. Informational only.
    pub outdated: Vec<OutdatedTool>,
}

pub struct ToolDiscovery {
    tools: BTreeMap<String, ToolMetadata>,
    cache: Arc<ToolCache>,
    offline: Option<Arc<OfflineDetector>>,
    runner: Arc<dyn ProcessRunner>,
    version_timeout: Duration,
}

impl ToolDiscovery {
    pub fn new(cache: Arc<ToolCache>, runner: Arc<dyn ProcessRunner>) -> Self {
        Self {
            tools: BTreeMap::new(),
            cache,
            offline: None,
            runner,
            version_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_offline_detector(mut self, detector: Arc<OfflineDetector>) -> Self {
        self.offline = Some(detector);
        self
    }

    pub fn with_version_timeout(mut self, timeout: Duration) -> Self {
        self.version_timeout = timeout;
        self
    }

    pub fn with_default_tools(mut self) -> Self {
        for tool in default_tools() {
            self.register(tool);
        }
        self
    }

    pub fn register(&mut self, tool: ToolMetadata) {
        debug!("Registered tool '{}' for {:?}", tool.name, tool.component_types);
        self.tools.insert(tool.name.clone(), tool);
    }

    pub fn metadata(&self, tool: &str) -> Option<&ToolMetadata> {
        self.tools.get(tool)
    }

    pub fn tools(&self) -> impl Iterator<Item = &ToolMetadata> {
        self.tools.values()
    }

    pub fn cache(&self) -> &Arc<ToolCache> {
        &self.cache
    }

    pub fn offline_detector(&self) -> Option<&Arc<OfflineDetector>> {
        self.offline.as_ref()
    }

    /// Offline if the cache was put in offline mode or the detector says so.
    pub async fn is_offline(&self) -> bool {
        if self.cache.is_offline_mode() {
            return true;
        }
        match &self.offline {
            Some(detector) => detector.is_offline().await,
            None => false,
        }
    }

    /// Whether `tool` is on PATH. Not finding it is a normal, cached answer.
    pub async fn is_available(&self, tool: &str) -> bool {
        if let Some(entry) = self.cache.get_with_offline_support(tool) {
            return entry.available;
        }
        if self.cache.is_offline_mode() {
            debug!("'{}' not cached and offline, treating as unavailable", tool);
            return false;
        }

        let command = self
            .tools
            .get(tool)
            .map(|t| t.command.clone())
            .unwrap_or_else(|| tool.to_string());
        let runner = self.runner.clone();
        let lookup = command.clone();
        let available = match tokio::task::spawn_blocking(move || runner.program_exists(&lookup)).await {
            Ok(found) => found,
            Err(e) => {
                warn!("PATH lookup for '{}' did not complete: {}", command, e);
                false
            }
        };
        debug!("PATH lookup for '{}': {}", command, available);
        self.cache.set(tool, available, "");
        available
    }

    /// The tool's trimmed `--version` output.
    pub async fn get_version(&self, tool: &str) -> Result<String, GenerationError> {
        if let Some(entry) = self.cache.get_with_offline_support(tool) {
            if entry.available && !entry.version.is_empty() {
                return Ok(entry.version);
            }
        }
        if !self.is_available(tool).await {
            return Err(GenerationError::tool_not_found(tool, self.install_hint(tool)));
        }

        let (command, flag) = match self.tools.get(tool) {
            Some(meta) => (meta.command.as_str(), meta.version_flag.as_str()),
            None => (tool, "--version"),
        };
        let options = RunOptions::default().with_timeout(self.version_timeout);
        let output = self
            .runner
            .run(command, &[flag.to_string()], &options)
            .await
            .map_err(|e| {
                if let Some(ProcessError::TimedOut { after, .. }) = e.downcast_ref::<ProcessError>() {
                    return GenerationError::timeout(&format!("'{command} {flag}'"), Some(*after));
                }
                GenerationError::tool_execution(tool, format!("could not run '{command} {flag}'"))
                    .with_cause(e)
            })?;

        if !output.status.success() {
            return Err(GenerationError::tool_execution(
                tool,
                format!("'{command} {flag}' exited with {}", output.status),
            )
            .with_cause(combined_output(&output)));
        }

        let version = combined_output(&output);
        self.cache.set(tool, true, &version);
        Ok(version)
    }

    pub async fn check_requirements(&self, tools: &[&str]) -> RequirementsReport {
        let mut report = RequirementsReport {
            all_available: true,
            ..RequirementsReport::default()
        };

        for &tool in tools {
            let Some(meta) = self.tools.get(tool) else {
                warn!("Requirement '{}' is not a registered tool", tool);
                report.all_available = false;
                report.missing.push(tool.to_string());
                continue;
            };
            if !self.is_available(tool).await {
                report.all_available = false;
                report.missing.push(tool.to_string());
                continue;
            }
            report.available.push(tool.to_string());

            if let Some(required) = &meta.min_version {
                match self.get_version(tool).await {
                    Ok(found) => {
                        if version_at_least(&found, required) == Some(false) {
                            warn!("'{}' is {} but {} or newer is recommended", tool, found, required);
                            report.outdated.push(OutdatedTool {
                                name: tool.to_string(),
                                found,
                                required: required.clone(),
                            });
                        }
                    }
                    Err(e) => debug!("Could not determine version of '{}': {}", tool, e),
                }
            }
        }

        report
    }

    pub fn get_tools_for_component(&self, component_type: &str) -> Vec<&ToolMetadata> {
        self.tools
            .values()
            .filter(|tool| tool.needed_by(component_type))
            .collect()
    }

    /// Whether any tool needed by the component type can be replaced by the
    /// skeleton generator.
    pub fn has_fallback(&self, component_type: &str) -> bool {
        self.get_tools_for_component(component_type)
            .iter()
            .any(|tool| tool.fallback_available)
    }

    /// Decides between the registered executor and fallback generation.
    ///
    /// Tools are checked in name order; the first unavailable one decides.
    /// An unavailable tool without a fallback is an error.
    pub async fn select_strategy(&self, component_type: &str) -> Result<Strategy, GenerationError> {
        if self.is_offline().await {
            return Ok(Strategy::Fallback(FallbackReason::Offline));
        }

        let tools = self.get_tools_for_component(component_type);
        if tools.is_empty() {
            return Ok(Strategy::Fallback(FallbackReason::NoToolsRegistered));
        }

        for tool in tools {
            if self.is_available(&tool.name).await {
                continue;
            }
            if tool.fallback_available {
                info!("'{}' unavailable, {} will use fallback generation", tool.name, component_type);
                return Ok(Strategy::Fallback(FallbackReason::ToolUnavailable(tool.name.clone())));
            }
            return Err(GenerationError::tool_not_found(
                &tool.name,
                self.install_hint(&tool.name),
            ));
        }

        Ok(Strategy::Executor)
    }

    pub async fn should_use_fallback(&self, component_type: &str) -> Result<bool, GenerationError> {
        Ok(matches!(
            self.select_strategy(component_type).await?,
            Strategy::Fallback(_)
        ))
    }

    /// Install docs for the current OS, or the tool's default docs.
    pub fn install_hint(&self, tool: &str) -> Option<&str> {
        let docs = &self.tools.get(tool)?.install_docs;
        docs.get(std::env::consts::OS)
            .or_else(|| docs.get("default"))
            .map(String::as_str)
    }
}

/// Extracts the first dotted numeric run, e.g. `go1.21.0` -> `[1, 21, 0]`.
pub fn parse_version(text: &str) -> Option<Vec<u64>> {
    let start = text.find(|c: char| c.is_ascii_digit())?;
    let run: String = text[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    let parts: Vec<u64> = run
        .split('.')
        .filter(|part| !part.is_empty())
        .map(|part| part.parse().ok())
        .collect::<Option<_>>()?;
    (!parts.is_empty()).then_some(parts)
}

/// `None` when either side has no recognisable version number.
pub fn version_at_least(found: &str, required: &str) -> Option<bool> {
    let mut found = parse_version(found)?;
    let mut required = parse_version(required)?;
    let len = found.len().max(required.len());
    found.resize(len, 0);
    required.resize(len, 0);
    Some(found >= required)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::offline::testing::{offline_detector, online_detector};
    use crate::process::testing::{MockProcessRunner, Step, failure, success};
    use crate::tool_cache::ToolCacheConfig;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn discovery(runner: MockProcessRunner) -> (ToolDiscovery, Arc<ToolCache>, Arc<MockProcessRunner>) {
        let cache = Arc::new(ToolCache::new(ToolCacheConfig::default()));
        let runner = Arc::new(runner);
        let discovery = ToolDiscovery::new(cache.clone(), runner.clone()).with_default_tools();
        (discovery, cache, runner)
    }

    #[test]
    fn test_parse_version_variants() {
        assert_eq!(parse_version("go version go1.21.0 linux/amd64"), Some(vec![1, 21, 0]));
        assert_eq!(parse_version("v20.11.1"), Some(vec![20, 11, 1]));
        assert_eq!(parse_version("\n------\nGradle 8.5\n------"), Some(vec![8, 5]));
        assert_eq!(parse_version("no digits here"), None);
    }

    #[test]
    fn test_version_at_least() {
        assert_eq!(version_at_least("go1.21.0", "1.21"), Some(true));
        assert_eq!(version_at_least("v16.20.2", "18.0.0"), Some(false));
        assert_eq!(version_at_least("Flutter 3.16.0", "3.0.0"), Some(true));
        assert_eq!(version_at_least("unknown", "1.0"), None);
    }

    #[tokio::test]
    async fn test_is_available_caches_path_lookup() {
        let (discovery, cache, _) = discovery(MockProcessRunner::new().installed("go"));

        assert!(discovery.is_available("go").await);
        assert!(!discovery.is_available("flutter").await);

        assert!(cache.get("go").unwrap().available);
        assert!(!cache.get("flutter").unwrap().available);
    }

    /// PATH lookup that blocks its thread for a while.
    struct SlowPathLookup {
        ticked: Arc<AtomicBool>,
        ticked_during_lookup: Arc<AtomicBool>,
    }

    #[async_trait::async_trait]
    impl ProcessRunner for SlowPathLookup {
        async fn run(
            &self,
            _program: &str,
            _args: &[String],
            _options: &RunOptions,
        ) -> anyhow::Result<std::process::Output> {
            Ok(success(""))
        }

        fn program_exists(&self, _program: &str) -> bool {
            std::thread::sleep(Duration::from_millis(200));
            let ticked = self.ticked.load(Ordering::SeqCst);
            self.ticked_during_lookup
                .store(ticked, Ordering::SeqCst);
            true
        }
    }

    #[tokio::test]
    async fn test_path_lookup_does_not_block_the_runtime() {
        let ticked = Arc::new(AtomicBool::new(false));
        let ticked_during_lookup = Arc::new(AtomicBool::new(false));
        let runner = Arc::new(SlowPathLookup {
            ticked: ticked.clone(),
            ticked_during_lookup: ticked_during_lookup.clone(),
        });
        let cache = Arc::new(ToolCache::new(ToolCacheConfig::default()));
        let discovery = ToolDiscovery::new(cache, runner).with_default_tools();

        let ticker = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            ticked.store(true, Ordering::SeqCst);
        };
        let (available, ()) = tokio::join!(discovery.is_available("go"), ticker);

        assert!(available);
        assert!(ticked_during_lookup.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_is_available_offline_cache_miss_is_unavailable() {
        let (discovery, cache, _) = discovery(MockProcessRunner::new().installed("go"));
        cache.set_offline_mode(true);

        assert!(!discovery.is_available("go").await);
        assert!(cache.get("go").is_none());
    }

    #[tokio::test]
    async fn test_get_version_runs_once_then_uses_cache() {
        let (discovery, _, runner) = discovery(
            MockProcessRunner::new()
                .installed("go")
                .then("go", Step::Output(success("go version go1.21.0 linux/amd64\n"))),
        );

        assert_eq!(discovery.get_version("go").await.unwrap(), "go version go1.21.0 linux/amd64");
        assert_eq!(discovery.get_version("go").await.unwrap(), "go version go1.21.0 linux/amd64");
        assert_eq!(runner.invocation_count("go"), 1);
        let (_, args, _) = runner.invocations.lock()[0].clone();
        assert_eq!(args, vec!["version"]);
    }

    #[tokio::test]
    async fn test_get_version_requires_availability() {
        let (discovery, _, _) = discovery(MockProcessRunner::new());
        let err = discovery.get_version("flutter").await.unwrap_err();
        assert_eq!(err.category(), crate::errors::ErrorCategory::ToolNotFound);
        assert!(err.suggestions().iter().any(|s| s.contains("docs.flutter.dev")));
    }

    #[tokio::test]
    async fn test_get_version_failure_and_timeout() {
        let (discovery, _, _) = discovery(
            MockProcessRunner::new()
                .installed("gradle")
                .installed("node")
                .then("gradle", Step::Output(failure("JAVA_HOME is not set")))
                .then("node", Step::TimedOut),
        );

        let err = discovery.get_version("gradle").await.unwrap_err();
        assert_eq!(err.category(), crate::errors::ErrorCategory::ToolExecution);
        assert!(err.to_string().contains("JAVA_HOME is not set"));

        let err = discovery.get_version("node").await.unwrap_err();
        assert_eq!(err.category(), crate::errors::ErrorCategory::Timeout);
    }

    #[tokio::test]
    async fn test_check_requirements_reports_missing_and_outdated() {
        let (discovery, _, _) = discovery(
            MockProcessRunner::new()
                .installed("go")
                .installed("node")
                .then("go", Step::Output(success("go version go1.22.1 darwin/arm64")))
                .then("node", Step::Output(success("v16.20.2"))),
        );

        let report = discovery
            .check_requirements(&["go", "node", "flutter", "cobol"])
            .await;

        assert!(!report.all_available);
        assert_eq!(report.available, vec!["go", "node"]);
        assert_eq!(report.missing, vec!["flutter", "cobol"]);
        assert_eq!(report.outdated.len(), 1);
        assert_eq!(report.outdated[0].name, "node");
    }

    #[tokio::test]
    async fn test_check_requirements_all_available() {
        let (discovery, _, _) = discovery(MockProcessRunner::new().installed("npx"));
        let report = discovery.check_requirements(&["npx"]).await;
        assert!(report.all_available);
        assert!(report.missing.is_empty());
    }

    #[test]
    fn test_component_lookups() {
        let (discovery, _, _) = discovery(MockProcessRunner::new());

        let names: Vec<&str> = discovery
            .get_tools_for_component("nextjs")
            .iter()
            .map(|t| t.name.as_str())
            .collect();
        assert_eq!(names, vec!["node", "npx"]);
        assert!(discovery.has_fallback("go-backend"));
        assert!(!discovery.has_fallback("ios"));
        assert!(discovery.get_tools_for_component("ios").is_empty());
    }

    #[tokio::test]
    async fn test_select_strategy_all_available_uses_executor() {
        let (discovery, _, _) = discovery(MockProcessRunner::new().installed("go"));
        assert_eq!(discovery.select_strategy("go-backend").await.unwrap(), Strategy::Executor);
        assert!(!discovery.should_use_fallback("go-backend").await.unwrap());
    }

    #[tokio::test]
    async fn test_select_strategy_missing_tool_with_fallback() {
        let (discovery, _, _) = discovery(MockProcessRunner::new().installed("node"));
        assert_eq!(
            discovery.select_strategy("nextjs").await.unwrap(),
            Strategy::Fallback(FallbackReason::ToolUnavailable("npx".to_string()))
        );
    }

    #[tokio::test]
    async fn test_select_strategy_missing_tool_without_fallback_fails() {
        let (mut discovery, _, _) = discovery(MockProcessRunner::new());
        discovery.register(ToolMetadata::new("xcodegen", "xcodegen", "--version").for_components(&["ios"]));

        let err = discovery.select_strategy("ios").await.unwrap_err();
        assert_eq!(err.category(), crate::errors::ErrorCategory::ToolNotFound);
    }

    #[tokio::test]
    async fn test_select_strategy_no_tools_registered() {
        let (discovery, _, _) = discovery(MockProcessRunner::new());
        assert_eq!(
            discovery.select_strategy("ios").await.unwrap(),
            Strategy::Fallback(FallbackReason::NoToolsRegistered)
        );
    }

    #[tokio::test]
    async fn test_select_strategy_offline_detector() {
        let cache = Arc::new(ToolCache::new(ToolCacheConfig::default()));
        let runner = Arc::new(MockProcessRunner::new().installed("go"));

        let offline = ToolDiscovery::new(cache.clone(), runner.clone())
            .with_default_tools()
            .with_offline_detector(Arc::new(offline_detector()));
        assert_eq!(
            offline.select_strategy("go-backend").await.unwrap(),
            Strategy::Fallback(FallbackReason::Offline)
        );

        let online = ToolDiscovery::new(cache, runner)
            .with_default_tools()
            .with_offline_detector(Arc::new(online_detector()));
        assert_eq!(online.select_strategy("go-backend").await.unwrap(), Strategy::Executor);
    }

    #[test]
    fn test_install_hint_falls_back_to_default() {
        let (discovery, _, _) = discovery(MockProcessRunner::new());
        assert!(discovery.install_hint("node").unwrap().contains("nodejs.org"));
        assert!(discovery.install_hint("cobol").is_none());
    }
}
