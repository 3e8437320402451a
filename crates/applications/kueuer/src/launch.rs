//! Stress job launcher
//!
//! Renders a Kubernetes Job manifest per job from a YAML template and submits
//! the cohort to the API server. Each job runs `stress-ng` sized to its
//! resource requests, so a cohort packs the cluster (or a Kueue ClusterQueue)
//! deterministically.
//!
//! Queued cohorts carry the `kueue.x-k8s.io/queue-name` label and are created
//! suspended; Kueue unsuspends them on admission.

use crate::client::KubeClient;
use crate::error::{KueuerError, Result};
use crate::source::{KubeEventSource, collection_path};
use futures::{StreamExt, stream};
use kueuer_core::{EventSource, ResourceKind, Selector, SourceError};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::path::Path;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Built-in Job manifest running `stress-ng`
pub const DEFAULT_JOB_TEMPLATE: &str = include_str!("../templates/job.yaml");

/// Concurrent job submissions
pub const DEFAULT_PARALLELISM: usize = 16;

/// Job name prefix when none is given
pub const DEFAULT_JOB_PREFIX: &str = "kueuer-job";

/// Label selecting the Kueue LocalQueue
pub const QUEUE_NAME_LABEL: &str = "kueue.x-k8s.io/queue-name";
/// Label selecting the WorkloadPriorityClass
pub const PRIORITY_CLASS_LABEL: &str = "kueue.x-k8s.io/priority-class";

const KUEUE_API: &str = "/apis/kueue.x-k8s.io/v1beta1";

/// What to launch and how big each job is
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchSpec {
    /// Namespace to create the jobs in
    pub namespace: String,
    /// Jobs are named `{prefix}-{i}`
    pub prefix: String,
    /// Number of jobs
    pub count: usize,
    /// stress-ng run time per job
    pub duration_secs: u64,
    /// CPU cores per job
    pub cores: u32,
    /// Memory per job in GiB
    pub ram_gb: u32,
    /// Ephemeral storage per job in GiB
    pub storage_gb: u32,
    /// Kueue LocalQueue; jobs bypass Kueue when unset
    pub kueue: Option<String>,
    /// Kueue WorkloadPriorityClass
    pub priority: Option<String>,
    /// Concurrent submissions
    pub parallelism: usize,
}

impl Default for LaunchSpec {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            prefix: DEFAULT_JOB_PREFIX.to_string(),
            count: 1,
            duration_secs: 60,
            cores: 1,
            ram_gb: 1,
            storage_gb: 1,
            kueue: None,
            priority: None,
            parallelism: DEFAULT_PARALLELISM,
        }
    }
}

impl LaunchSpec {
    /// `count` jobs named `{prefix}-{i}` in `namespace`
    pub fn new(namespace: impl Into<String>, prefix: impl Into<String>, count: usize) -> Self {
        Self {
            namespace: namespace.into(),
            prefix: prefix.into(),
            count,
            ..Default::default()
        }
    }

    /// Set the stress-ng run time
    pub fn with_duration(mut self, secs: u64) -> Self {
        self.duration_secs = secs;
        self
    }

    /// Set per-job cores, memory (GiB) and storage (GiB)
    pub fn with_resources(mut self, cores: u32, ram_gb: u32, storage_gb: u32) -> Self {
        self.cores = cores;
        self.ram_gb = ram_gb;
        self.storage_gb = storage_gb;
        self
    }

    /// Route jobs through a Kueue LocalQueue
    pub fn with_kueue(mut self, kueue: Option<String>) -> Self {
        self.kueue = kueue;
        self
    }

    /// Set the WorkloadPriorityClass
    pub fn with_priority(mut self, priority: Option<String>) -> Self {
        self.priority = priority;
        self
    }

    /// Set concurrent submissions, at least one
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    /// Name of the `index`-th job
    pub fn job_name(&self, index: usize) -> String {
        format!("{}-{}", self.prefix, index)
    }

    fn ram_mb(&self) -> u64 {
        u64::from(self.ram_gb) * 1024
    }

    /// `stress-ng` arguments; the VM worker uses 80% of the memory limit
    pub fn stress_args(&self) -> Vec<String> {
        vec![
            "--cpu".to_string(),
            self.cores.to_string(),
            "--cpu-method".to_string(),
            "matrixprod".to_string(),
            "--vm".to_string(),
            "1".to_string(),
            "--vm-bytes".to_string(),
            format!("{}M", self.ram_mb() * 4 / 5),
            "--temp-path".to_string(),
            "/tmp".to_string(),
            "--timeout".to_string(),
            self.duration_secs.to_string(),
            "--metrics-brief".to_string(),
        ]
    }

    fn resources(&self) -> Value {
        let quantities = json!({
            "cpu": self.cores.to_string(),
            "memory": format!("{}Mi", self.ram_mb()),
            "ephemeral-storage": format!("{}Gi", self.storage_gb),
        });
        json!({ "limits": quantities.clone(), "requests": quantities })
    }
}

/// A Job manifest to stamp jobs from
#[derive(Debug, Clone)]
pub struct JobTemplate {
    manifest: Value,
}

impl JobTemplate {
    /// The built-in `stress-ng` template
    pub fn builtin() -> Result<Self> {
        Self::from_yaml(DEFAULT_JOB_TEMPLATE)
    }

    /// Parse a YAML manifest. JSON is valid YAML, so JSON manifests parse too.
    pub fn from_yaml(text: &str) -> Result<Self> {
        Self::from_manifest(serde_yaml::from_str(text)?)
    }

    /// Parse a JSON manifest
    pub fn from_json(text: &str) -> Result<Self> {
        Self::from_manifest(serde_json::from_str(text)?)
    }

    fn from_manifest(manifest: Value) -> Result<Self> {
        let template = Self { manifest };
        if template.containers_len() == 0 {
            return Err(KueuerError::template(
                "manifest has no spec.template.spec.containers",
            ));
        }
        Ok(template)
    }

    /// Load a template from a `.json` file, or a YAML file otherwise
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&text),
            _ => Self::from_yaml(&text),
        }
    }

    fn containers_len(&self) -> usize {
        self.manifest
            .pointer("/spec/template/spec/containers")
            .and_then(Value::as_array)
            .map_or(0, Vec::len)
    }

    /// Manifest with everything but the job name filled in
    pub fn render(&self, spec: &LaunchSpec) -> Result<Value> {
        let mut job = self.manifest.clone();

        let mut labels = serde_json::Map::new();
        if let Some(ref kueue) = spec.kueue {
            labels.insert(QUEUE_NAME_LABEL.to_string(), json!(kueue));
        }
        if let Some(ref priority) = spec.priority {
            labels.insert(PRIORITY_CLASS_LABEL.to_string(), json!(priority));
        }
        job["metadata"] = json!({ "namespace": spec.namespace, "labels": labels });

        if spec.kueue.is_some() {
            let job_spec = job
                .get_mut("spec")
                .and_then(Value::as_object_mut)
                .ok_or_else(|| KueuerError::template("manifest has no spec"))?;
            job_spec.insert("suspend".to_string(), json!(true));
        }

        let args = spec.stress_args();
        let resources = spec.resources();
        for container in containers_mut(&mut job)? {
            container.insert("args".to_string(), json!(args));
            container.insert("resources".to_string(), resources.clone());
        }

        Ok(job)
    }

    /// One manifest per job, named `{prefix}-{i}`
    pub fn render_all(&self, spec: &LaunchSpec) -> Result<Vec<Value>> {
        let base = self.render(spec)?;
        (0..spec.count)
            .map(|i| -> Result<Value> {
                let name = spec.job_name(i);
                let mut job = base.clone();
                job["metadata"]["name"] = json!(name);
                for container in containers_mut(&mut job)? {
                    container.insert("name".to_string(), json!(name));
                }
                Ok(job)
            })
            .collect()
    }
}

fn containers_mut(job: &mut Value) -> Result<Vec<&mut serde_json::Map<String, Value>>> {
    job.pointer_mut("/spec/template/spec/containers")
        .and_then(Value::as_array_mut)
        .ok_or_else(|| KueuerError::template("manifest has no spec.template.spec.containers"))?
        .iter_mut()
        .map(|c| {
            c.as_object_mut()
                .ok_or_else(|| KueuerError::template("container is not an object"))
        })
        .collect()
}

/// Outcome of a cohort submission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchSummary {
    /// Jobs the API server accepted
    pub submitted: usize,
    /// Jobs whose submission failed
    pub failed: usize,
    /// Submission wall time
    pub elapsed_secs: f64,
}

/// Submit every job of `spec` with bounded fan-out.
///
/// Individual submission failures are logged and counted; only rendering
/// errors fail the whole launch.
pub async fn launch_jobs(
    client: &KubeClient,
    template: &JobTemplate,
    spec: &LaunchSpec,
) -> Result<LaunchSummary> {
    let manifests = template.render_all(spec)?;
    let path = collection_path(ResourceKind::Job, &spec.namespace);

    info!(
        namespace = %spec.namespace,
        prefix = %spec.prefix,
        count = spec.count,
        kueue = ?spec.kueue,
        priority = ?spec.priority,
        "Launching jobs"
    );

    let started = Instant::now();
    let results: Vec<bool> = stream::iter(manifests)
        .map(|manifest| {
            let path = path.as_str();
            async move {
                let name = manifest["metadata"]["name"].as_str().unwrap_or_default().to_string();
                match client.post_json(path, &manifest).await {
                    Ok(_) => {
                        debug!(job = %name, "Job created");
                        true
                    }
                    Err(e) => {
                        warn!(job = %name, error = %e, "Job submission failed");
                        false
                    }
                }
            }
        })
        .buffer_unordered(spec.parallelism.max(1))
        .collect()
        .await;

    let submitted = results.iter().filter(|ok| **ok).count();
    let summary = LaunchSummary {
        submitted,
        failed: results.len() - submitted,
        elapsed_secs: started.elapsed().as_secs_f64(),
    };

    if summary.failed > 0 {
        error!(
            submitted = summary.submitted,
            failed = summary.failed,
            "Some jobs could not be submitted"
        );
    }
    info!(
        submitted = summary.submitted,
        elapsed_secs = summary.elapsed_secs,
        "Jobs submitted"
    );

    Ok(summary)
}

/// Delete every job in `namespace` whose name starts with `prefix`.
///
/// Pods are removed with foreground propagation. Returns the number of jobs
/// deleted; jobs that vanish in between are not counted.
pub async fn delete_jobs_with_prefix(
    client: &KubeClient,
    namespace: &str,
    prefix: &str,
) -> Result<usize> {
    info!(namespace, prefix, "Deleting jobs");

    let source = KubeEventSource::new(client.clone());
    let snapshot = source
        .snapshot(&Selector::jobs(namespace).with_prefix(prefix))
        .await?;
    if snapshot.items.is_empty() {
        info!(prefix, "No jobs found with prefix");
        return Ok(0);
    }

    let options = json!({
        "apiVersion": "v1",
        "kind": "DeleteOptions",
        "propagationPolicy": "Foreground",
    });
    let collection = collection_path(ResourceKind::Job, namespace);
    let started = Instant::now();
    let mut deleted = 0;

    for job in &snapshot.items {
        let path = format!("{}/{}", collection, job.name);
        match client.delete(&path, &options).await {
            Ok(()) => deleted += 1,
            Err(KueuerError::Source(SourceError::Api { status: 404, .. })) => {
                debug!(job = %job.name, "Job already gone");
            }
            Err(e) => warn!(job = %job.name, error = %e, "Job deletion failed"),
        }
    }

    info!(
        deleted,
        elapsed_secs = started.elapsed().as_secs_f64(),
        "Jobs deleted"
    );
    Ok(deleted)
}

/// Which Kueue prerequisites exist
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreflightReport {
    /// Namespace exists
    pub namespace: bool,
    /// LocalQueue exists
    pub local_queue: bool,
    /// WorkloadPriorityClass exists
    pub priority_class: bool,
}

impl PreflightReport {
    /// Whether every prerequisite exists
    pub fn passed(&self) -> bool {
        self.namespace && self.local_queue && self.priority_class
    }
}

async fn exists(client: &KubeClient, path: &str) -> Result<bool> {
    match client.get_json::<Value>(path, &[]).await {
        Ok(_) => Ok(true),
        Err(KueuerError::Source(SourceError::Api { status: 404, .. })) => Ok(false),
        Err(e) => Err(e),
    }
}

/// Check that the namespace, LocalQueue and WorkloadPriorityClass exist
pub async fn preflight(
    client: &KubeClient,
    namespace: &str,
    kueue: &str,
    priority: &str,
) -> Result<PreflightReport> {
    let report = PreflightReport {
        namespace: exists(client, &format!("/api/v1/namespaces/{}", namespace)).await?,
        local_queue: exists(
            client,
            &format!("{}/namespaces/{}/localqueues/{}", KUEUE_API, namespace, kueue),
        )
        .await?,
        priority_class: exists(
            client,
            &format!("{}/workloadpriorityclasses/{}", KUEUE_API, priority),
        )
        .await?,
    };

    if !report.namespace {
        error!(namespace, "Namespace not found");
    }
    if !report.local_queue {
        error!(namespace, kueue, "LocalQueue not found");
    }
    if !report.priority_class {
        error!(priority, "WorkloadPriorityClass not found");
    }
    if report.passed() {
        info!(namespace, kueue, priority, "All checks passed");
    }

    Ok(report)
}
