use async_trait::async_trait;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use stratus_box::container::backend::{ContainerBackend, ContainerSpec, ImageBuild};
use stratus_box::{
    execute, Instance, InstanceFactory, PersistentWorkerResolver, RunConfig, SecurityPolicy,
};
use stratus_core::logger::stub;
use stratus_core::{HostFacts, Isolation, Result, SharedLogger, TaskInstance};
use tokio_util::sync::CancellationToken;

/// Stands in for whatever a resolver would really build.
struct Sentinel;

#[async_trait]
impl Instance for Sentinel {
    fn kind(&self) -> &'static str {
        "sentinel"
    }

    async fn run(&self, _cancel: &CancellationToken, _config: &RunConfig) -> Result<()> {
        Ok(())
    }

    fn working_directory(&self, _project_dir: &str, _dirty_mode: bool) -> String {
        "/sentinel".to_string()
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
struct FakeResolver {
    calls: AtomicUsize,
    last_isolation: Mutex<Option<Option<Isolation>>>,
}

impl PersistentWorkerResolver for FakeResolver {
    fn resolve(
        &self,
        isolation: Option<&Isolation>,
        _security: &SecurityPolicy,
        _logger: SharedLogger,
    ) -> Result<Box<dyn Instance>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_isolation.lock().unwrap() = Some(isolation.cloned());
        Ok(Box::new(Sentinel))
    }
}

#[derive(Debug, Default)]
struct RecordingBackend {
    builds: Mutex<Vec<String>>,
}

#[async_trait]
impl ContainerBackend for RecordingBackend {
    async fn volume_create(&self, _name: &str) -> Result<()> {
        Ok(())
    }

    async fn volume_delete(&self, _name: &str) -> Result<()> {
        Ok(())
    }

    async fn image_pull(&self, _image: &str) -> Result<()> {
        Ok(())
    }

    async fn image_build(&self, build: &ImageBuild) -> Result<()> {
        self.builds.lock().unwrap().push(build.tag.clone());
        Ok(())
    }

    async fn container_run(&self, _spec: &ContainerSpec, _cancel: &CancellationToken) -> Result<i32> {
        Ok(0)
    }

    async fn container_start(&self, spec: &ContainerSpec) -> Result<String> {
        Ok(spec.name.clone())
    }

    async fn container_delete(&self, _id: &str) -> Result<()> {
        Ok(())
    }
}

fn setup(host_os: &str) -> (Arc<FakeResolver>, InstanceFactory) {
    let resolver = Arc::new(FakeResolver::default());
    let factory = InstanceFactory::new(resolver.clone()).with_host(HostFacts::new(host_os, "amd64"));
    (resolver, factory)
}

fn construct(factory: &InstanceFactory, kind: &str, payload: serde_json::Value) -> Result<Box<dyn Instance>> {
    factory.construct(Some(&TaskInstance::new(kind, payload)), &[], None, stub())
}

#[tokio::test]
async fn test_absent_descriptor_is_unsupported_not_an_error() {
    let (resolver, factory) = setup("linux");

    let instance = factory.construct(None, &[], None, stub()).unwrap();
    assert_eq!(instance.kind(), "unsupported");

    let err = instance
        .run(&CancellationToken::new(), &RunConfig::new(1, "e"))
        .await
        .unwrap_err();
    assert!(err.is_unsupported());
    assert!(err.to_string().contains("nil instance"));
    assert_eq!(resolver.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_unknown_kind_fails_only_when_run() {
    let (_, factory) = setup("linux");

    let instance = construct(&factory, "KubernetesInstance", json!({"namespace": "ci"})).unwrap();
    let err = instance
        .run(&CancellationToken::new(), &RunConfig::new(1, "e"))
        .await
        .unwrap_err();

    assert!(err.is_unsupported());
    assert!(err.to_string().contains("KubernetesInstance"));
}

#[test]
fn test_container_on_foreign_platform_is_rejected() {
    let (_, factory) = setup("linux");

    for platform in ["DARWIN", "FREEBSD"] {
        let err = construct(&factory, "ContainerInstance", json!({"image": "x", "platform": platform}))
            .err()
            .unwrap();
        assert!(err.is_construction_failure(), "{} should be rejected", platform);
        assert!(!err.is_unsupported());
    }
}

#[test]
fn test_docker_builder_cannot_emulate_a_foreign_os() {
    let (resolver, factory) = setup("linux");

    for platform in ["WINDOWS", "DARWIN"] {
        let err = construct(&factory, "DockerBuilder", json!({"platform": platform}))
            .err()
            .unwrap();
        assert!(err.is_construction_failure());
    }
    assert_eq!(resolver.calls.load(Ordering::SeqCst), 0);
}

#[test]
fn test_docker_builder_forces_no_isolation() {
    let (resolver, factory) = setup("darwin");

    let instance = construct(&factory, "DockerBuilder", json!({"platform": "DARWIN"})).unwrap();

    assert_eq!(instance.kind(), "sentinel");
    assert_eq!(resolver.calls.load(Ordering::SeqCst), 1);
    let isolation = resolver.last_isolation.lock().unwrap().clone().unwrap();
    assert!(matches!(isolation, Some(Isolation::None)));
}

#[tokio::test]
async fn test_persistent_worker_delegates_to_resolver() {
    let (resolver, factory) = setup("linux");

    let instance = construct(
        &factory,
        "PersistentWorkerInstance",
        json!({"isolation": {"type": "tart", "image": "ghcr.io/cirruslabs/macos-sonoma-base:latest", "user": "admin", "password": "admin"}}),
    )
    .unwrap();

    assert_ne!(instance.kind(), "unsupported");
    execute(instance.as_ref(), &CancellationToken::new(), &RunConfig::new(1, "e"))
        .await
        .unwrap();
    assert_eq!(resolver.calls.load(Ordering::SeqCst), 1);

    let isolation = resolver.last_isolation.lock().unwrap().clone().unwrap();
    assert!(matches!(isolation, Some(Isolation::Tart { cpu: 0, .. })));
}

#[tokio::test]
async fn test_prebuilt_image_name_is_fully_qualified() {
    let (_, factory) = setup("linux");
    let backend = Arc::new(RecordingBackend::default());

    let instance = construct(
        &factory,
        "PrebuiltImageInstance",
        json!({"repository": "foo/bar", "reference": "v1", "dockerfile": "ci/Dockerfile"}),
    )
    .unwrap();

    let project = tempfile::tempdir().unwrap();
    let mut config = RunConfig::new(1, "e");
    config.project_dir = project.path().to_path_buf();
    config.container_backend = backend.clone();

    instance.run(&CancellationToken::new(), &config).await.unwrap();
    assert_eq!(*backend.builds.lock().unwrap(), vec!["gcr.io/foo/bar:v1".to_string()]);
    assert_eq!(
        instance.working_directory(&project.path().to_string_lossy(), false),
        project.path().to_string_lossy()
    );
}

#[test]
fn test_working_directory_is_stable_across_calls() {
    let (_, factory) = setup("linux");
    let instance = construct(&factory, "ContainerInstance", json!({"image": "debian"})).unwrap();

    let first = instance.working_directory("/src", false);
    assert_eq!(first, instance.working_directory("/src", false));
}
