//! Cluster control plane and secret store over `kubectl`.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use tracing::{debug, info};

use provisionflow::core::{ContainerStatus, PodStatus, Resource, ResourceRef, WorkloadStatus};
use provisionflow::errors::CollaboratorError;
use provisionflow::ports::{ClusterClient, CollaboratorResult, DeleteOutcome, Manifest, SecretStore};

use super::{ProcessError, ProcessOutput, ToolRunner};

const SYSTEM: &str = "kubectl";

/// Controller kinds a workload name may refer to, tried in order.
const WORKLOAD_KINDS: &[&str] = &["deployment", "statefulset"];

/// [`ClusterClient`] and [`SecretStore`] backed by the `kubectl` binary.
#[derive(Debug, Clone)]
pub struct KubectlCluster {
    runner: ToolRunner,
}

impl KubectlCluster {
    /// Creates the adapter.
    #[must_use]
    pub fn new(runner: ToolRunner) -> Self {
        Self { runner }
    }

    async fn run(&self, args: Vec<String>) -> Result<ProcessOutput, ProcessError> {
        self.runner.run(&args).await
    }

    /// Fetches one object as JSON, or `None` if it (or its namespace) is missing.
    async fn get_json(
        &self,
        kind: &str,
        namespace: Option<&str>,
        name: &str,
    ) -> CollaboratorResult<Option<Value>> {
        let mut args = vec!["get".to_string(), kind.to_string(), name.to_string()];
        if let Some(namespace) = namespace {
            args.extend(["-n".to_string(), namespace.to_string()]);
        }
        args.extend(["-o".to_string(), "json".to_string()]);
        match self.run(args).await {
            Ok(output) => parse_json(&output.stdout).map(Some),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err.into_collaborator(SYSTEM)),
        }
    }

    /// Runs `build(kind)` against each workload kind until one exists.
    ///
    /// Returns `None` when no controller of that name exists.
    async fn on_workload(
        &self,
        build: impl Fn(&str) -> Vec<String>,
    ) -> CollaboratorResult<Option<ProcessOutput>> {
        for kind in WORKLOAD_KINDS {
            match self.run(build(kind)).await {
                Ok(output) => return Ok(Some(output)),
                Err(err) if err.is_not_found() => continue,
                Err(err) => return Err(err.into_collaborator(SYSTEM)),
            }
        }
        Ok(None)
    }

    async fn get_workload(&self, namespace: &str, name: &str) -> CollaboratorResult<Option<Resource>> {
        for kind in WORKLOAD_KINDS {
            let Some(object) = self.get_json(kind, Some(namespace), name).await? else {
                continue;
            };
            let mut resource = workload_resource(namespace, &object);
            if let (Some(status), Some(selector)) = (resource.workload.as_mut(), label_selector(&object)) {
                status.pods = self.pods(namespace, &selector).await?;
            }
            return Ok(Some(resource));
        }
        Ok(None)
    }

    async fn pods(&self, namespace: &str, selector: &str) -> CollaboratorResult<Vec<PodStatus>> {
        let args = vec![
            "get".to_string(),
            "pods".to_string(),
            "-n".to_string(),
            namespace.to_string(),
            "-l".to_string(),
            selector.to_string(),
            "-o".to_string(),
            "json".to_string(),
        ];
        let output = self.run(args).await.map_err(|e| e.into_collaborator(SYSTEM))?;
        Ok(items(&parse_json(&output.stdout)?).iter().map(pod_status).collect())
    }
}

#[async_trait]
impl ClusterClient for KubectlCluster {
    async fn get(&self, reference: &ResourceRef) -> CollaboratorResult<Option<Resource>> {
        match reference {
            ResourceRef::Namespace { name } => Ok(self
                .get_json("namespace", None, name)
                .await?
                .map(|object| {
                    let resource = Resource::new(reference.clone());
                    match str_at(&object, "/status/phase") {
                        Some(phase) => resource.with_phase(phase),
                        None => resource,
                    }
                })),
            ResourceRef::Workload { namespace, name } => self.get_workload(namespace, name).await,
            ResourceRef::Pod { namespace, name } => Ok(self
                .get_json("pod", Some(namespace), name)
                .await?
                .map(|object| pod_resource(reference.clone(), &object))),
            ResourceRef::ConfigMap { namespace, name } => Ok(self
                .get_json("configmap", Some(namespace), name)
                .await?
                .map(|object| with_string_data(Resource::new(reference.clone()), &object))),
            ResourceRef::Secret { namespace, name } => Ok(self
                .get_json("secret", Some(namespace), name)
                .await?
                .map(|object| with_string_data(Resource::new(reference.clone()), &object))),
            other => Err(CollaboratorError::rejected(
                SYSTEM,
                format!("{other} is not a cluster object"),
            )),
        }
    }

    async fn list_workloads(&self, namespace: &str) -> CollaboratorResult<Vec<Resource>> {
        let args = vec![
            "get".to_string(),
            "deployments,statefulsets".to_string(),
            "-n".to_string(),
            namespace.to_string(),
            "-o".to_string(),
            "json".to_string(),
        ];
        match self.run(args).await {
            Ok(output) => Ok(items(&parse_json(&output.stdout)?)
                .iter()
                .map(|object| workload_resource(namespace, object))
                .collect()),
            Err(err) if err.is_not_found() => Ok(Vec::new()),
            Err(err) => Err(err.into_collaborator(SYSTEM)),
        }
    }

    async fn apply(&self, manifest: &Manifest) -> CollaboratorResult<()> {
        let reference = manifest.reference();
        info!(resource = %reference, keys = ?manifest.keys(), "Applying manifest");
        let body = serde_json::to_vec(&manifest_json(manifest))
            .map_err(|e| CollaboratorError::rejected(SYSTEM, e.to_string()))?;
        let args = ["apply".to_string(), "-f".to_string(), "-".to_string()];
        self.runner
            .run_with(&args, Some(&body), self.runner.timeout())
            .await
            .map_err(|e| e.into_collaborator(SYSTEM))?;
        Ok(())
    }

    async fn delete(&self, reference: &ResourceRef) -> CollaboratorResult<DeleteOutcome> {
        let delete_args = |kind: &str, namespace: Option<&str>, name: &str| {
            let mut args = vec!["delete".to_string(), kind.to_string(), name.to_string()];
            if let Some(namespace) = namespace {
                args.extend(["-n".to_string(), namespace.to_string()]);
            }
            args.extend(["--ignore-not-found".to_string(), "--wait=false".to_string()]);
            args
        };
        let output = match reference {
            ResourceRef::Namespace { name } => Some(
                self.run(delete_args("namespace", None, name))
                    .await
                    .map_err(|e| e.into_collaborator(SYSTEM))?,
            ),
            ResourceRef::Workload { namespace, name } => {
                self.on_workload(|kind| delete_args(kind, Some(namespace), name))
                    .await?
            }
            ResourceRef::Pod { namespace, name }
            | ResourceRef::ConfigMap { namespace, name }
            | ResourceRef::Secret { namespace, name } => {
                let kind = match reference {
                    ResourceRef::Pod { .. } => "pod",
                    ResourceRef::ConfigMap { .. } => "configmap",
                    _ => "secret",
                };
                Some(
                    self.run(delete_args(kind, Some(namespace), name))
                        .await
                        .map_err(|e| e.into_collaborator(SYSTEM))?,
                )
            }
            other => {
                return Err(CollaboratorError::rejected(
                    SYSTEM,
                    format!("{other} is not a cluster object"),
                ))
            }
        };
        let outcome = delete_outcome(reference, output.as_ref().map_or("", |o| o.stdout.as_str()));
        debug!(resource = %reference, outcome = ?outcome, "Delete requested");
        Ok(outcome)
    }

    async fn scale(&self, namespace: &str, workload: &str, replicas: u32) -> CollaboratorResult<()> {
        let scaled = self
            .on_workload(|kind| {
                vec![
                    "scale".to_string(),
                    format!("{kind}/{workload}"),
                    "-n".to_string(),
                    namespace.to_string(),
                    format!("--replicas={replicas}"),
                ]
            })
            .await?;
        if scaled.is_none() {
            debug!(namespace, workload, "Nothing to scale");
        }
        Ok(())
    }

    async fn restart_rollout(
        &self,
        namespace: &str,
        workload: &str,
        annotations: &BTreeMap<String, String>,
    ) -> CollaboratorResult<()> {
        let missing = || CollaboratorError::not_found(SYSTEM, format!("workload {namespace}/{workload}"));
        if !annotations.is_empty() {
            let patch = template_patch(annotations);
            self.on_workload(|kind| {
                vec![
                    "patch".to_string(),
                    format!("{kind}/{workload}"),
                    "-n".to_string(),
                    namespace.to_string(),
                    "--type=merge".to_string(),
                    "-p".to_string(),
                    patch.clone(),
                ]
            })
            .await?
            .ok_or_else(missing)?;
        }
        self.on_workload(|kind| {
            vec![
                "rollout".to_string(),
                "restart".to_string(),
                format!("{kind}/{workload}"),
                "-n".to_string(),
                namespace.to_string(),
            ]
        })
        .await?
        .map(|_| ())
        .ok_or_else(missing)
    }

    async fn logs(&self, namespace: &str, workload: &str, tail: usize) -> CollaboratorResult<Vec<String>> {
        let output = self
            .on_workload(|kind| {
                vec![
                    "logs".to_string(),
                    format!("{kind}/{workload}"),
                    "-n".to_string(),
                    namespace.to_string(),
                    format!("--tail={tail}"),
                    "--all-containers=true".to_string(),
                ]
            })
            .await?;
        Ok(output.map(|o| lines(&o.stdout)).unwrap_or_default())
    }

    async fn events(&self, namespace: &str) -> CollaboratorResult<Vec<String>> {
        let args = vec![
            "get".to_string(),
            "events".to_string(),
            "-n".to_string(),
            namespace.to_string(),
            "--sort-by=.lastTimestamp".to_string(),
            "--no-headers".to_string(),
        ];
        match self.run(args).await {
            Ok(output) => Ok(lines(&output.stdout)),
            Err(err) if err.is_not_found() => Ok(Vec::new()),
            Err(err) => Err(err.into_collaborator(SYSTEM)),
        }
    }
}

#[async_trait]
impl SecretStore for KubectlCluster {
    async fn fetch(
        &self,
        namespace: &str,
        name: &str,
    ) -> CollaboratorResult<Option<BTreeMap<String, String>>> {
        Ok(self
            .get_json("secret", Some(namespace), name)
            .await?
            .map(|object| string_map(&object, "/data")))
    }
}

fn parse_json(text: &str) -> CollaboratorResult<Value> {
    serde_json::from_str(text)
        .map_err(|e| CollaboratorError::transient(SYSTEM, format!("unparseable output: {e}")))
}

fn str_at<'a>(value: &'a Value, pointer: &str) -> Option<&'a str> {
    value.pointer(pointer).and_then(Value::as_str)
}

fn u32_at(value: &Value, pointer: &str) -> Option<u32> {
    value
        .pointer(pointer)
        .and_then(Value::as_u64)
        .map(|n| u32::try_from(n).unwrap_or(u32::MAX))
}

fn items(list: &Value) -> Vec<Value> {
    list.get("items")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

fn lines(text: &str) -> Vec<String> {
    text.lines()
        .filter(|l| !l.trim().is_empty())
        .map(str::to_string)
        .collect()
}

fn string_map(object: &Value, pointer: &str) -> BTreeMap<String, String> {
    object
        .pointer(pointer)
        .and_then(Value::as_object)
        .map(|map| {
            map.iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

fn with_string_data(resource: Resource, object: &Value) -> Resource {
    string_map(object, "/data")
        .into_iter()
        .fold(resource, |resource, (key, value)| resource.with_data(key, value))
}

/// Renders `matchLabels` as a `-l` selector.
fn label_selector(object: &Value) -> Option<String> {
    let labels = string_map(object, "/spec/selector/matchLabels");
    if labels.is_empty() {
        return None;
    }
    Some(
        labels
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(","),
    )
}

/// Builds a workload resource without pods. Labels are exposed as data.
fn workload_resource(namespace: &str, object: &Value) -> Resource {
    let name = str_at(object, "/metadata/name").unwrap_or_default();
    let status = WorkloadStatus {
        desired_replicas: u32_at(object, "/spec/replicas").unwrap_or(1),
        ready_replicas: u32_at(object, "/status/readyReplicas").unwrap_or(0),
        pods: Vec::new(),
    };
    let resource = Resource::new(ResourceRef::workload(namespace, name)).with_workload(status);
    let resource = match str_at(object, "/kind") {
        Some(kind) => resource.with_data("kind", kind),
        None => resource,
    };
    string_map(object, "/metadata/labels")
        .into_iter()
        .chain(string_map(object, "/spec/template/metadata/annotations"))
        .fold(resource, |resource, (key, value)| resource.with_data(key, value))
}

/// Merge patch setting pod-template annotations.
fn template_patch(annotations: &BTreeMap<String, String>) -> String {
    json!({ "spec": { "template": { "metadata": { "annotations": annotations } } } }).to_string()
}

fn container_statuses(object: &Value, pointer: &str) -> Vec<ContainerStatus> {
    object
        .pointer(pointer)
        .and_then(Value::as_array)
        .map(|statuses| {
            statuses
                .iter()
                .map(|c| ContainerStatus {
                    name: str_at(c, "/name").unwrap_or_default().to_string(),
                    ready: c.get("ready").and_then(Value::as_bool).unwrap_or(false),
                    reason: str_at(c, "/state/waiting/reason")
                        .or_else(|| str_at(c, "/state/terminated/reason"))
                        .map(str::to_string),
                    restart_count: u32_at(c, "/restartCount").unwrap_or(0),
                })
                .collect()
        })
        .unwrap_or_default()
}

fn pod_status(object: &Value) -> PodStatus {
    PodStatus {
        name: str_at(object, "/metadata/name").unwrap_or_default().to_string(),
        phase: str_at(object, "/status/phase").unwrap_or("Unknown").to_string(),
        init_containers: container_statuses(object, "/status/initContainerStatuses"),
        containers: container_statuses(object, "/status/containerStatuses"),
    }
}

/// A pod is reported as a one-replica workload so readiness rules can inspect it.
fn pod_resource(reference: ResourceRef, object: &Value) -> Resource {
    let pod = pod_status(object);
    let phase = pod.phase.clone();
    let status = WorkloadStatus {
        desired_replicas: 1,
        ready_replicas: u32::from(pod.is_running()),
        pods: vec![pod],
    };
    Resource::new(reference).with_phase(phase).with_workload(status)
}

/// Renders a manifest as an API object. Secret values are base64-encoded here.
fn manifest_json(manifest: &Manifest) -> Value {
    match manifest {
        Manifest::Namespace { name } => json!({
            "apiVersion": "v1",
            "kind": "Namespace",
            "metadata": { "name": name },
        }),
        Manifest::ConfigMap {
            namespace,
            name,
            data,
        } => json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": { "name": name, "namespace": namespace },
            "data": data,
        }),
        Manifest::Secret {
            namespace,
            name,
            data,
        } => {
            let encoded: Map<String, Value> = data
                .iter()
                .map(|(k, v)| (k.clone(), Value::String(STANDARD.encode(v.expose()))))
                .collect();
            json!({
                "apiVersion": "v1",
                "kind": "Secret",
                "type": "Opaque",
                "metadata": { "name": name, "namespace": namespace },
                "data": encoded,
            })
        }
    }
}

/// Interprets `kubectl delete --ignore-not-found --wait=false` output.
fn delete_outcome(reference: &ResourceRef, stdout: &str) -> DeleteOutcome {
    if stdout.trim().is_empty() {
        DeleteOutcome::AlreadyAbsent
    } else if matches!(reference, ResourceRef::Namespace { .. } | ResourceRef::Pod { .. }) {
        DeleteOutcome::Terminating
    } else {
        DeleteOutcome::Deleted
    }
}
