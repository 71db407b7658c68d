//! Producers turn a release plus input values into a normalized `ResourceSet`.
//! The reconciler only ever sees this trait.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as Json;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use yoke_core::normalize::{decode_stream, normalize};
use yoke_core::{Error, ReleaseRef, ResourceSet, Result, SourceDescriptor};
use yoke_kubehub::Cluster;

use crate::bridge::{Bridge, ExecutionContext, LookupRecord};
use crate::runtime::{FlightRuntime, Invocation};

#[derive(Debug, Clone)]
pub struct Rendered {
    pub resources: ResourceSet,
    pub source: SourceDescriptor,
    /// Capability calls made while rendering, in call order.
    pub lookups: Vec<LookupRecord>,
}

#[async_trait]
pub trait Producer: Send + Sync {
    async fn render(&self, release: &ReleaseRef, values: &Json, cancel: &CancellationToken) -> Result<Rendered>;
}

fn has_values(values: &Json) -> bool {
    match values {
        Json::Null => false,
        Json::Object(m) => !m.is_empty(),
        _ => true,
    }
}

enum Module {
    Path(PathBuf),
    Bytes(Arc<[u8]>),
}

/// Renders by executing a WASM flight.
pub struct FlightProducer {
    reference: String,
    module: Module,
    args: Vec<String>,
    stdin: Option<Vec<u8>>,
    runtime: FlightRuntime,
    cluster: Arc<dyn Cluster>,
}

impl FlightProducer {
    pub fn new(path: impl Into<PathBuf>, runtime: FlightRuntime, cluster: Arc<dyn Cluster>) -> Self {
        let path = path.into();
        Self {
            reference: path.display().to_string(),
            module: Module::Path(path),
            args: Vec::new(),
            stdin: None,
            runtime,
            cluster,
        }
    }

    /// Flight already in memory; `reference` is what gets recorded as its source.
    pub fn from_bytes(reference: impl Into<String>, module: impl Into<Arc<[u8]>>, runtime: FlightRuntime, cluster: Arc<dyn Cluster>) -> Self {
        Self { reference: reference.into(), module: Module::Bytes(module.into()), args: Vec::new(), stdin: None, runtime, cluster }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// Raw bytes for the guest's stdin. Takes precedence over the values document.
    pub fn with_stdin(mut self, stdin: Vec<u8>) -> Self {
        self.stdin = Some(stdin);
        self
    }

    fn load(&self) -> Result<Arc<[u8]>> {
        match &self.module {
            Module::Bytes(b) => Ok(b.clone()),
            Module::Path(p) => {
                let max = self.runtime.limits().max_module_bytes;
                let size = std::fs::metadata(p)?.len();
                if size > max as u64 {
                    return Err(Error::RenderFailure(format!("{}: module is {size} bytes, limit is {max}", p.display())));
                }
                Ok(std::fs::read(p)?.into())
            }
        }
    }
}

#[async_trait]
impl Producer for FlightProducer {
    async fn render(&self, release: &ReleaseRef, values: &Json, cancel: &CancellationToken) -> Result<Rendered> {
        let module = self.load()?;
        let stdin = match &self.stdin {
            Some(s) => Some(s.clone()),
            None if has_values(values) => Some(serde_json::to_vec(values)?),
            None => None,
        };
        let bridge = Bridge::standard(ExecutionContext::new(release.clone()), self.cluster.clone());
        debug!(release = %release, flight = %self.reference, attempt = %bridge.context().attempt, "rendering flight");
        let out = self
            .runtime
            .execute(&module, Invocation { args: self.args.clone(), stdin }, bridge, cancel)
            .await?;
        let docs = decode_stream(&out.stdout)?;
        let resources = normalize(docs, &release.namespace)?;
        let mut source = SourceDescriptor::flight(&self.reference);
        source.args = self.args.clone();
        source.values = values.clone();
        Ok(Rendered { resources, source, lookups: out.lookups })
    }
}

/// Pre-rendered manifests: one file, or every `*.yaml|*.yml|*.json` of a
/// directory in name order.
pub struct ManifestProducer {
    path: PathBuf,
}

impl ManifestProducer {
    pub fn new(path: impl Into<PathBuf>) -> Self { Self { path: path.into() } }

    fn files(&self) -> Result<Vec<PathBuf>> {
        if !self.path.is_dir() {
            return Ok(vec![self.path.clone()]);
        }
        let mut files: Vec<PathBuf> = std::fs::read_dir(&self.path)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && is_manifest(p))
            .collect();
        files.sort();
        Ok(files)
    }
}

fn is_manifest(p: &Path) -> bool {
    matches!(p.extension().and_then(|e| e.to_str()), Some("yaml" | "yml" | "json"))
}

#[async_trait]
impl Producer for ManifestProducer {
    async fn render(&self, release: &ReleaseRef, values: &Json, cancel: &CancellationToken) -> Result<Rendered> {
        let mut docs = Vec::new();
        for file in self.files()? {
            if cancel.is_cancelled() {
                return Err(Error::RenderCancelled);
            }
            let raw = std::fs::read(&file)?;
            let decoded = decode_stream(&raw).map_err(|e| match e {
                Error::DecodeFailure(m) => Error::DecodeFailure(format!("{}: {m}", file.display())),
                other => other,
            })?;
            docs.extend(decoded);
        }
        let resources = normalize(docs, &release.namespace)?;
        let mut source = SourceDescriptor::manifest(self.path.display().to_string());
        source.values = values.clone();
        Ok(Rendered { resources, source, lookups: Vec::new() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scratch(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("yoke-manifests-{tag}-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn manifest_directory_is_read_in_name_order() {
        let dir = scratch("order");
        std::fs::write(dir.join("b.yaml"), "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: second\n").unwrap();
        std::fs::write(dir.join("a.json"), r#"{"apiVersion":"v1","kind":"ConfigMap","metadata":{"name":"first"}}"#).unwrap();
        std::fs::write(dir.join("notes.txt"), "ignored").unwrap();
        std::fs::write(dir.join("c.yml"), "apiVersion: v1\nkind: Namespace\nmetadata:\n  name: ns-a\n").unwrap();

        let release = ReleaseRef::new("r", "ns-a");
        let out = ManifestProducer::new(&dir).render(&release, &Json::Null, &CancellationToken::new()).await.unwrap();
        let names: Vec<_> = out.resources.ids().map(|i| i.name().to_string()).collect();
        // Namespace is hoisted, the rest keep file order.
        assert_eq!(names, vec!["ns-a", "first", "second"]);
        assert!(out.resources.ids().filter(|i| i.kind() == "ConfigMap").all(|i| i.namespace() == "ns-a"));
        assert_eq!(out.source.kind, yoke_core::SourceKind::Manifest);
        std::fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn duplicate_across_files_is_ambiguous() {
        let dir = scratch("dup");
        let doc = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cfg\n";
        std::fs::write(dir.join("a.yaml"), doc).unwrap();
        std::fs::write(dir.join("b.yaml"), doc).unwrap();
        let err = ManifestProducer::new(&dir)
            .render(&ReleaseRef::new("r", "ns"), &json!({}), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AmbiguousResource(_)), "err={err}");
        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn empty_values_are_not_forwarded() {
        assert!(!has_values(&Json::Null));
        assert!(!has_values(&json!({})));
        assert!(has_values(&json!({"replicas": 2})));
    }
}
