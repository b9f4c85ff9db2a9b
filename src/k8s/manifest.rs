//! YAML manifest apply/delete
//!
//! Documents are applied with server-side apply, so merge semantics stay
//! with the API server.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use kube::api::{Api, DeleteParams, Patch, PatchParams};
use kube::core::{DynamicObject, GroupVersionKind};
use kube::discovery::Scope;
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::dynamic::DynamicClient;
use crate::error::{Error, Result, TargetError};
use crate::retry::retry_until;

/// Field manager recorded on applied objects
pub const FIELD_MANAGER: &str = "mesh-kube-client";

/// How long `delete_yaml_files` waits for deleted objects to disappear
pub const DEFAULT_DELETION_TIMEOUT: Duration = Duration::from_secs(60);

/// Polling interval of the deletion wait
pub const DELETION_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// One object parsed from a manifest
#[derive(Clone, Debug)]
pub struct Document {
    /// `file#index` (or `inline#index`)
    pub origin: String,
    pub gvk: GroupVersionKind,
    pub object: DynamicObject,
}

impl Document {
    pub fn name(&self) -> &str {
        self.object.metadata.name.as_deref().unwrap_or_default()
    }

    /// `Kind namespace/name (origin)`, used in errors and logs
    pub fn identity(&self) -> String {
        match &self.object.metadata.namespace {
            Some(ns) => format!("{} {}/{} ({})", self.gvk.kind, ns, self.name(), self.origin),
            None => format!("{} {} ({})", self.gvk.kind, self.name(), self.origin),
        }
    }
}

/// Parse a possibly multi-document YAML text. Empty documents are skipped.
pub fn parse_documents(origin: &str, text: &str) -> Result<Vec<Document>> {
    let mut documents = Vec::new();

    for (index, doc) in serde_yaml::Deserializer::from_str(text).enumerate() {
        let doc_origin = format!("{origin}#{index}");
        let value = serde_yaml::Value::deserialize(doc)
            .map_err(|e| Error::manifest(&doc_origin, format!("invalid YAML: {e}")))?;
        if value.is_null() {
            continue;
        }

        let json = serde_json::to_value(&value)
            .map_err(|e| Error::manifest(&doc_origin, format!("not a JSON-compatible object: {e}")))?;
        let object: DynamicObject = serde_json::from_value(json)
            .map_err(|e| Error::manifest(&doc_origin, format!("not a Kubernetes object: {e}")))?;

        let types = object
            .types
            .as_ref()
            .ok_or_else(|| Error::manifest(&doc_origin, "missing apiVersion or kind"))?;
        if object.metadata.name.as_deref().map_or(true, str::is_empty) {
            return Err(Error::manifest(&doc_origin, "missing metadata.name"));
        }

        let (group, version) = match types.api_version.split_once('/') {
            Some((group, version)) => (group.to_string(), version.to_string()),
            None => (String::new(), types.api_version.clone()),
        };
        let gvk = GroupVersionKind {
            group,
            version,
            kind: types.kind.clone(),
        };

        documents.push(Document {
            origin: doc_origin,
            gvk,
            object,
        });
    }

    Ok(documents)
}

/// Files that exist and are not empty, in the given order
pub async fn non_empty_files(files: &[PathBuf]) -> Vec<PathBuf> {
    let mut kept = Vec::with_capacity(files.len());
    for file in files {
        match tokio::fs::metadata(file).await {
            Ok(meta) if meta.len() > 0 => kept.push(file.clone()),
            Ok(_) => debug!(file = %file.display(), "Skipping empty manifest"),
            Err(e) => warn!(file = %file.display(), error = %e, "Skipping unreadable manifest"),
        }
    }
    kept
}

/// Namespace an object of a namespaced kind lands in
pub fn effective_namespace<'a>(
    override_ns: Option<&'a str>,
    document_ns: Option<&'a str>,
    default_ns: &'a str,
) -> &'a str {
    override_ns
        .filter(|ns| !ns.is_empty())
        .or(document_ns.filter(|ns| !ns.is_empty()))
        .unwrap_or(default_ns)
}

/// Poll `exists` until it reports the object gone or `timeout` elapses
pub async fn wait_for_deletion<F, Fut>(
    identity: &str,
    timeout: Duration,
    interval: Duration,
    mut exists: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let operation = format!("deletion of {identity}");
    retry_until(&operation, timeout, interval, || {
        let check = exists();
        async move {
            if check.await? {
                Err(Error::transient("object still present"))
            } else {
                Ok(())
            }
        }
    })
    .await
}

/// A deleted object the caller still waits on
struct PendingDeletion {
    identity: String,
    api: Api<DynamicObject>,
    name: String,
}

/// Applies and deletes manifests through a [`DynamicClient`]
#[derive(Clone)]
pub struct Manifests {
    dynamic: DynamicClient,
    deletion_timeout: Duration,
    deletion_poll: Duration,
}

impl Manifests {
    pub fn new(dynamic: DynamicClient) -> Self {
        Self {
            dynamic,
            deletion_timeout: DEFAULT_DELETION_TIMEOUT,
            deletion_poll: DELETION_POLL_INTERVAL,
        }
    }

    /// Bound the wait for deleted objects to disappear
    pub fn with_deletion_wait(mut self, timeout: Duration, poll: Duration) -> Self {
        self.deletion_timeout = timeout;
        self.deletion_poll = poll;
        self
    }

    pub fn deletion_timeout(&self) -> Duration {
        self.deletion_timeout
    }

    /// Apply every document of every file; stops at the first failure.
    /// Returns the number of applied documents.
    pub async fn apply_yaml_files(
        &self,
        namespace: Option<&str>,
        files: &[PathBuf],
        dry_run: bool,
    ) -> Result<usize> {
        let mut applied = 0;
        for file in non_empty_files(files).await {
            let text = read(&file).await?;
            applied += self
                .apply_documents(namespace, parse_documents(&file.display().to_string(), &text)?, dry_run)
                .await?;
        }
        Ok(applied)
    }

    /// Apply documents held in memory
    pub async fn apply_yaml(&self, namespace: Option<&str>, text: &str, dry_run: bool) -> Result<usize> {
        self.apply_documents(namespace, parse_documents("inline", text)?, dry_run)
            .await
    }

    /// Delete every document of every file, then wait until the deleted
    /// objects are gone (skipped on dry run). Objects already gone are
    /// ignored; other failures are collected and reported together.
    pub async fn delete_yaml_files(
        &self,
        namespace: Option<&str>,
        files: &[PathBuf],
        dry_run: bool,
    ) -> Result<usize> {
        let mut deleted = 0;
        let mut failures = Vec::new();
        let mut pending = Vec::new();

        for file in non_empty_files(files).await {
            let origin = file.display().to_string();
            let documents = match read(&file).await.and_then(|text| parse_documents(&origin, &text)) {
                Ok(documents) => documents,
                Err(e) => {
                    failures.push(TargetError::new(origin, e));
                    continue;
                }
            };

            for document in documents {
                match self.delete_document(namespace, &document, dry_run).await {
                    Ok(waiting) => {
                        deleted += 1;
                        pending.extend(waiting);
                    }
                    Err(e) => failures.push(TargetError::new(document.identity(), e)),
                }
            }
        }

        let deadline = tokio::time::Instant::now() + self.deletion_timeout;
        for deletion in pending {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let waited = wait_for_deletion(&deletion.identity, remaining, self.deletion_poll, || {
                let api = &deletion.api;
                let name = deletion.name.as_str();
                async move { Ok::<_, Error>(api.get_opt(name).await?.is_some()) }
            })
            .await;
            if let Err(e) = waited {
                failures.push(TargetError::new(deletion.identity, e));
            }
        }

        if failures.is_empty() {
            Ok(deleted)
        } else {
            Err(Error::Aggregate(failures))
        }
    }

    async fn apply_documents(
        &self,
        namespace: Option<&str>,
        documents: Vec<Document>,
        dry_run: bool,
    ) -> Result<usize> {
        let count = documents.len();
        for document in documents {
            self.apply_document(namespace, document, dry_run).await?;
        }
        Ok(count)
    }

    async fn apply_document(&self, namespace: Option<&str>, document: Document, dry_run: bool) -> Result<()> {
        let identity = document.identity();
        let (resource, caps) = self
            .dynamic
            .resolve(&document.gvk)
            .await
            .map_err(|e| Error::manifest(&identity, e.to_string()))?;

        let mut object = document.object;
        let api = match caps.scope {
            Scope::Namespaced => {
                let ns = effective_namespace(
                    namespace,
                    object.metadata.namespace.as_deref(),
                    self.dynamic.default_namespace(),
                )
                .to_string();
                object.metadata.namespace = Some(ns.clone());
                self.dynamic.api_for(&resource, Some(&ns))
            }
            Scope::Cluster => {
                object.metadata.namespace = None;
                self.dynamic.api_for(&resource, None)
            }
        };

        let mut params = PatchParams::apply(FIELD_MANAGER).force();
        params.dry_run = dry_run;

        let name = object.metadata.name.clone().unwrap_or_default();
        api.patch(&name, &params, &Patch::Apply(&object))
            .await
            .map_err(|e| Error::manifest(&identity, e.to_string()))?;

        info!(
            kind = %document.gvk.kind,
            name = %name,
            namespace = object.metadata.namespace.as_deref().unwrap_or(""),
            dry_run,
            "Applied manifest"
        );
        Ok(())
    }

    /// Returns the object to wait on, if the delete was issued for real
    async fn delete_document(
        &self,
        namespace: Option<&str>,
        document: &Document,
        dry_run: bool,
    ) -> Result<Option<PendingDeletion>> {
        let (resource, caps) = self.dynamic.resolve(&document.gvk).await?;
        let api = match caps.scope {
            Scope::Namespaced => self.dynamic.api_for(
                &resource,
                Some(effective_namespace(
                    namespace,
                    document.object.metadata.namespace.as_deref(),
                    self.dynamic.default_namespace(),
                )),
            ),
            Scope::Cluster => self.dynamic.api_for(&resource, None),
        };

        let mut params = DeleteParams::background();
        params.dry_run = dry_run;

        match api.delete(document.name(), &params).await {
            Ok(_) => {
                info!(kind = %document.gvk.kind, name = %document.name(), dry_run, "Deleted manifest object");
                Ok((!dry_run).then(|| PendingDeletion {
                    identity: document.identity(),
                    api,
                    name: document.name().to_string(),
                }))
            }
            Err(e) => {
                let e = Error::from(e);
                if e.is_not_found() {
                    debug!(object = %document.identity(), "Already deleted");
                    Ok(None)
                } else {
                    Err(e)
                }
            }
        }
    }
}

async fn read(file: &Path) -> Result<String> {
    tokio::fs::read_to_string(file)
        .await
        .map_err(|e| Error::manifest(file.display().to_string(), format!("failed to read: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio_test::{assert_err, assert_ok};

    const NODE_LOCAL: &str = r#"
apiVersion: v1
kind: Service
metadata:
  name: node-local
  labels:
    nodeLocal: a
spec:
  ports:
  - name: http
    port: 80
---
---
apiVersion: apps/v1
kind: Deployment
metadata:
  name: node-local
  namespace: echo
spec:
  replicas: 4
"#;

    #[test]
    fn test_parse_multi_document_skips_empty() {
        let docs = parse_documents("node-local.yaml", NODE_LOCAL).unwrap();
        assert_eq!(docs.len(), 2);

        assert_eq!(docs[0].gvk.group, "");
        assert_eq!(docs[0].gvk.version, "v1");
        assert_eq!(docs[0].gvk.kind, "Service");
        assert_eq!(docs[0].identity(), "Service node-local (node-local.yaml#0)");

        assert_eq!(docs[1].gvk.group, "apps");
        assert_eq!(docs[1].identity(), "Deployment echo/node-local (node-local.yaml#2)");
        assert_eq!(docs[1].object.data["spec"]["replicas"], 4);
    }

    #[test]
    fn test_missing_kind_names_the_document() {
        let err = parse_documents("bad.yaml", "metadata:\n  name: x\n").unwrap_err();
        match err {
            Error::Manifest { origin, .. } => assert_eq!(origin, "bad.yaml#0"),
            other => panic!("unexpected {other}"),
        }
    }

    #[test]
    fn test_missing_name_is_rejected() {
        let err = parse_documents("a.yaml", "apiVersion: v1\nkind: ConfigMap\n").unwrap_err();
        assert!(err.to_string().contains("metadata.name"));
    }

    #[test]
    fn test_namespace_precedence() {
        assert_eq!(effective_namespace(Some("ovr"), Some("doc"), "def"), "ovr");
        assert_eq!(effective_namespace(None, Some("doc"), "def"), "doc");
        assert_eq!(effective_namespace(None, None, "def"), "def");
        assert_eq!(effective_namespace(Some(""), None, "def"), "def");
    }

    #[tokio::test]
    async fn test_non_empty_files_skips_missing_and_empty() {
        let dir = tempfile::tempdir().unwrap();
        let full = dir.path().join("full.yaml");
        let empty = dir.path().join("empty.yaml");
        let missing = dir.path().join("missing.yaml");
        std::fs::File::create(&full)
            .unwrap()
            .write_all(NODE_LOCAL.as_bytes())
            .unwrap();
        std::fs::File::create(&empty).unwrap();

        let kept = non_empty_files(&[empty, full.clone(), missing]).await;
        assert_eq!(kept, vec![full]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deletion_wait_polls_until_gone() {
        let polls = AtomicU32::new(0);
        let result = wait_for_deletion(
            "Deployment echo/c (a.yaml#1)",
            Duration::from_secs(10),
            Duration::from_millis(500),
            || {
                let seen = polls.fetch_add(1, Ordering::SeqCst);
                async move { Ok::<_, Error>(seen < 3) }
            },
        )
        .await;

        assert_ok!(result);
        assert_eq!(polls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deletion_wait_times_out_with_identity() {
        let result = wait_for_deletion(
            "Namespace node-local-1 (ns.yaml#0)",
            Duration::from_secs(2),
            Duration::from_millis(500),
            || async { Ok::<_, Error>(true) },
        )
        .await;

        let err = assert_err!(result);
        assert!(err.is_transient());
        assert!(err.to_string().contains("Namespace node-local-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deletion_wait_propagates_lookup_errors_at_deadline() {
        let result = wait_for_deletion(
            "ConfigMap a/b (inline#0)",
            Duration::ZERO,
            Duration::from_millis(500),
            || async { Err::<bool, _>(Error::transient("connection refused")) },
        )
        .await;

        assert!(assert_err!(result).to_string().contains("connection refused"));
    }
}
