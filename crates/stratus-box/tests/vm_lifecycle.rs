use async_trait::async_trait;
use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use stratus_box::remoteagent::{AgentHandshake, HandshakeRequest};
use stratus_box::vm::backend::{Vm, VmBackend, VmError, VmResources};
use stratus_box::{Instance, RunConfig, VmIsolation};
use stratus_core::{GuestPlatform, HostFacts, IsolationStage, StratusError};
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct Counters {
    clones: AtomicUsize,
    probes: AtomicUsize,
    closes: AtomicUsize,
    handshakes: AtomicUsize,
}

struct Script {
    fail_clone: bool,
    fail_start: bool,
    probes: Mutex<VecDeque<Result<IpAddr, VmError>>>,
}

struct FakeBackend {
    counters: Arc<Counters>,
    script: Arc<Script>,
}

struct FakeVm {
    counters: Arc<Counters>,
    script: Arc<Script>,
}

#[async_trait]
impl VmBackend for FakeBackend {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn clone_vm(&self, _template: &str, _resources: &VmResources) -> Result<Box<dyn Vm>, VmError> {
        self.counters.clones.fetch_add(1, Ordering::SeqCst);
        if self.script.fail_clone {
            return Err(VmError::Command {
                command: "clone".to_string(),
                stderr: "no such template".to_string(),
            });
        }
        Ok(Box::new(FakeVm {
            counters: self.counters.clone(),
            script: self.script.clone(),
        }))
    }
}

#[async_trait]
impl Vm for FakeVm {
    fn ident(&self) -> &str {
        "fake-vm"
    }

    fn cloned_from_suspended(&self) -> bool {
        false
    }

    async fn start(&self) -> Result<(), VmError> {
        if self.script.fail_start {
            return Err(VmError::Command {
                command: "start".to_string(),
                stderr: "boom".to_string(),
            });
        }
        Ok(())
    }

    async fn retrieve_ip(&self) -> Result<IpAddr, VmError> {
        self.counters.probes.fetch_add(1, Ordering::SeqCst);
        self.script
            .probes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(VmError::DhcpSnoopFailed("no lease yet".to_string())))
    }

    async fn close(&self) -> Result<(), VmError> {
        self.counters.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct FakeHandshake {
    counters: Arc<Counters>,
    fail: bool,
    seen: Mutex<Option<(IpAddr, String, String)>>,
}

/// An agent that never connects, so only cancellation ends the wait.
struct SilentAgent {
    counters: Arc<Counters>,
}

#[async_trait]
impl AgentHandshake for SilentAgent {
    async fn wait_for_agent(
        &self,
        cancel: &CancellationToken,
        _request: HandshakeRequest<'_>,
    ) -> stratus_core::Result<()> {
        self.counters.handshakes.fetch_add(1, Ordering::SeqCst);
        cancel.cancelled().await;
        Err(StratusError::Cancelled)
    }
}

#[async_trait]
impl AgentHandshake for FakeHandshake {
    async fn wait_for_agent(
        &self,
        _cancel: &CancellationToken,
        request: HandshakeRequest<'_>,
    ) -> stratus_core::Result<()> {
        self.counters.handshakes.fetch_add(1, Ordering::SeqCst);
        *self.seen.lock().unwrap() = Some((
            request.address,
            request.os.to_string(),
            request.arch.to_string(),
        ));
        if self.fail {
            Err(StratusError::Agent("agent never connected".to_string()))
        } else {
            Ok(())
        }
    }
}

struct Harness {
    counters: Arc<Counters>,
    handshake: Arc<FakeHandshake>,
    instance: VmIsolation,
}

fn transient() -> Result<IpAddr, VmError> {
    Err(VmError::DhcpSnoopFailed("no lease yet".to_string()))
}

fn address() -> IpAddr {
    "192.168.64.7".parse().unwrap()
}

fn harness(
    fail_clone: bool,
    fail_start: bool,
    probes: Vec<Result<IpAddr, VmError>>,
    fail_handshake: bool,
) -> Harness {
    let counters = Arc::new(Counters::default());
    let script = Arc::new(Script {
        fail_clone,
        fail_start,
        probes: Mutex::new(probes.into()),
    });
    let handshake = Arc::new(FakeHandshake {
        counters: counters.clone(),
        fail: fail_handshake,
        seen: Mutex::new(None),
    });

    let backend = Arc::new(FakeBackend {
        counters: counters.clone(),
        script,
    });
    let instance = VmIsolation::new(backend, "template", "admin", "admin", GuestPlatform::Darwin)
        .with_handshake(handshake.clone())
        .with_poll_interval(Duration::from_secs(1))
        .with_host(HostFacts::new("darwin", "arm64"));

    Harness {
        counters,
        handshake,
        instance,
    }
}

fn config() -> RunConfig {
    RunConfig::new(42, "https://grpc.example.com")
}

#[tokio::test(start_paused = true)]
async fn test_success_after_transient_address_failures() {
    let h = harness(false, false, vec![transient(), transient(), Ok(address())], false);

    h.instance.run(&CancellationToken::new(), &config()).await.unwrap();

    assert_eq!(h.counters.probes.load(Ordering::SeqCst), 3);
    assert_eq!(h.counters.handshakes.load(Ordering::SeqCst), 1);
    assert_eq!(h.counters.closes.load(Ordering::SeqCst), 1);

    let seen = h.handshake.seen.lock().unwrap().clone().unwrap();
    assert_eq!(seen, (address(), "darwin".to_string(), "arm64".to_string()));
}

#[tokio::test]
async fn test_clone_failure_has_nothing_to_release() {
    let h = harness(true, false, vec![], false);

    let err = h.instance.run(&CancellationToken::new(), &config()).await.unwrap_err();

    assert_eq!(err.isolation_stage(), Some(IsolationStage::Clone));
    assert!(err.to_string().contains("template"));
    assert_eq!(h.counters.closes.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_start_failure_releases_once() {
    let h = harness(false, true, vec![], false);

    let err = h.instance.run(&CancellationToken::new(), &config()).await.unwrap_err();

    assert_eq!(err.isolation_stage(), Some(IsolationStage::Start));
    assert_eq!(h.counters.probes.load(Ordering::SeqCst), 0);
    assert_eq!(h.counters.closes.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_permanent_address_failure_is_not_retried() {
    let h = harness(
        false,
        false,
        vec![Err(VmError::NoInterface("fake-vm".to_string())), Ok(address())],
        false,
    );

    let err = h.instance.run(&CancellationToken::new(), &config()).await.unwrap_err();

    assert!(err.is_isolation_failure());
    assert_eq!(err.isolation_stage(), Some(IsolationStage::AddressDiscovery));
    assert_eq!(h.counters.probes.load(Ordering::SeqCst), 1);
    assert_eq!(h.counters.handshakes.load(Ordering::SeqCst), 0);
    assert_eq!(h.counters.closes.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_handshake_failure_releases_once() {
    let h = harness(false, false, vec![Ok(address())], true);

    let err = h.instance.run(&CancellationToken::new(), &config()).await.unwrap_err();

    assert_eq!(err.isolation_stage(), Some(IsolationStage::AgentHandshake));
    assert!(err.to_string().contains("fake-vm"));
    assert_eq!(h.counters.closes.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_stops_address_polling() {
    let h = harness(false, false, vec![], false);
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(3500)).await;
        trigger.cancel();
    });

    let started = tokio::time::Instant::now();
    let err = h.instance.run(&cancel, &config()).await.unwrap_err();

    assert_eq!(err.isolation_stage(), Some(IsolationStage::AddressDiscovery));
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(h.counters.probes.load(Ordering::SeqCst), 4);
    assert_eq!(h.counters.handshakes.load(Ordering::SeqCst), 0);
    assert_eq!(h.counters.closes.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_during_handshake_releases_once() {
    let mut h = harness(false, false, vec![Ok(address())], false);
    h.instance = h.instance.with_handshake(Arc::new(SilentAgent {
        counters: h.counters.clone(),
    }));
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(2)).await;
        trigger.cancel();
    });

    let err = h.instance.run(&cancel, &config()).await.unwrap_err();

    assert_eq!(err.isolation_stage(), Some(IsolationStage::AgentHandshake));
    assert_eq!(h.counters.handshakes.load(Ordering::SeqCst), 1);
    assert_eq!(h.counters.closes.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_each_run_uses_a_fresh_clone() {
    let h = harness(false, false, vec![Ok(address()), Ok(address())], false);

    h.instance.run(&CancellationToken::new(), &config()).await.unwrap();
    h.instance.run(&CancellationToken::new(), &config()).await.unwrap();

    assert_eq!(h.counters.clones.load(Ordering::SeqCst), 2);
    assert_eq!(h.counters.closes.load(Ordering::SeqCst), 2);
}

#[test]
fn test_working_directory_does_not_touch_the_backend() {
    let h = harness(false, false, vec![], false);

    let first = h.instance.working_directory("/src", false);
    let second = h.instance.working_directory("/src", true);

    assert_eq!(first, second);
    assert_eq!(h.counters.clones.load(Ordering::SeqCst), 0);
}
