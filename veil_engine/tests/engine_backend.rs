use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use veil_engine::engine::EngineResult;
use veil_engine::uapi::UapiError;
use veil_engine::{
    BackendConfig, BackendError, EngineBackend, EngineDevice, EngineError, PeerSpec,
    TunnelBackend, TunnelEngine,
};

const SERVER_PRIVATE: &str = "YNqHbfBQKaGvzefSSLXYKoaaI9d6DvrULEgqRaD5mXo=";
const CLIENT_PUBLIC: &str = "HIgo9xNzJMWLKASShiTqIybxZ0U3wGLiUeJ1PKf8ykw=";

#[derive(Clone, Copy, Default, PartialEq)]
enum CloseBehaviour {
    #[default]
    Clean,
    Fail,
    Panic,
}

#[derive(Default)]
struct Journal {
    requests: Vec<String>,
    events: Vec<String>,
}

struct FakeEngine {
    journal: Arc<Mutex<Journal>>,
    close: CloseBehaviour,
    reject_ipc: bool,
    dump: Vec<String>,
}

impl FakeEngine {
    fn new() -> Self {
        FakeEngine {
            journal: Arc::default(),
            close: CloseBehaviour::Clean,
            reject_ipc: false,
            dump: Vec::new(),
        }
    }

    fn requests(&self) -> Vec<String> {
        self.journal.lock().unwrap().requests.clone()
    }

    fn events(&self) -> Vec<String> {
        self.journal.lock().unwrap().events.clone()
    }
}

struct FakeDevice {
    interface: String,
    journal: Arc<Mutex<Journal>>,
    close: CloseBehaviour,
    reject_ipc: bool,
    dump: Vec<String>,
}

#[async_trait]
impl EngineDevice for FakeDevice {
    fn interface(&self) -> &str {
        &self.interface
    }

    async fn ipc_set(&mut self, body: &str) -> EngineResult<()> {
        if self.reject_ipc {
            return Err(UapiError::Errno(-22).into());
        }
        self.journal.lock().unwrap().requests.push(body.to_string());
        Ok(())
    }

    async fn ipc_get(&mut self) -> EngineResult<Vec<String>> {
        Ok(self.dump.clone())
    }

    async fn bring_up(&mut self, address: &str) -> EngineResult<()> {
        self.journal
            .lock()
            .unwrap()
            .events
            .push(format!("up {address}"));
        Ok(())
    }

    async fn close(&mut self) -> EngineResult<()> {
        self.journal.lock().unwrap().events.push("close".into());
        match self.close {
            CloseBehaviour::Clean => Ok(()),
            CloseBehaviour::Fail => Err(EngineError::Startup("device busy".into())),
            CloseBehaviour::Panic => panic!("engine blew up on close"),
        }
    }

    async fn remove_interface(&mut self) -> EngineResult<()> {
        self.journal
            .lock()
            .unwrap()
            .events
            .push(format!("remove {}", self.interface));
        Ok(())
    }
}

#[async_trait]
impl TunnelEngine for FakeEngine {
    fn name(&self) -> &str {
        "fake"
    }

    async fn create_device(&self, interface: &str) -> EngineResult<Box<dyn EngineDevice>> {
        self.journal
            .lock()
            .unwrap()
            .events
            .push(format!("create {interface}"));
        Ok(Box::new(FakeDevice {
            interface: interface.to_string(),
            journal: self.journal.clone(),
            close: self.close,
            reject_ipc: self.reject_ipc,
            dump: self.dump.clone(),
        }))
    }
}

fn server_config() -> BackendConfig {
    BackendConfig {
        interface_name: "wg0".to_string(),
        private_key: SERVER_PRIVATE.to_string(),
        listen_port: 51820,
        server_cidr: "10.0.0.1/24".to_string(),
    }
}

fn hex_of(key: &str) -> String {
    veil_engine::uapi::HexKey::from_base64(key)
        .unwrap()
        .as_str()
        .to_string()
}

#[tokio::test]
async fn start_configures_through_the_device() {
    let engine = Arc::new(FakeEngine::new());
    let backend = EngineBackend::new(engine.clone());

    backend.start(&server_config()).await.unwrap();

    assert!(backend.is_running());
    assert_eq!(
        engine.requests(),
        vec![format!(
            "private_key={}\nlisten_port=51820\n",
            hex_of(SERVER_PRIVATE)
        )]
    );
    assert_eq!(engine.events(), vec!["create wg0", "up 10.0.0.1/24"]);
    assert_eq!(backend.interface_name().await.as_deref(), Some("wg0"));
}

#[tokio::test]
async fn start_twice_is_rejected() {
    let backend = EngineBackend::new(Arc::new(FakeEngine::new()));
    backend.start(&server_config()).await.unwrap();

    assert!(matches!(
        backend.start(&server_config()).await,
        Err(BackendError::AlreadyRunning)
    ));
}

#[tokio::test]
async fn bad_private_key_fails_before_creating_device() {
    let engine = Arc::new(FakeEngine::new());
    let backend = EngineBackend::new(engine.clone());

    let mut config = server_config();
    config.private_key = "c2hvcnQ=".to_string();

    let err = backend.start(&config).await.unwrap_err();
    assert!(matches!(err, BackendError::InvalidKey { .. }));
    assert!(engine.events().is_empty());
    assert!(!backend.is_running());
}

#[tokio::test]
async fn rejected_configuration_tears_the_device_down() {
    let mut engine = FakeEngine::new();
    engine.reject_ipc = true;
    let engine = Arc::new(engine);
    let backend = EngineBackend::new(engine.clone());

    let err = backend.start(&server_config()).await.unwrap_err();
    assert!(matches!(
        err,
        BackendError::Engine(EngineError::Uapi(UapiError::Errno(-22)))
    ));
    assert_eq!(engine.events(), vec!["create wg0", "close", "remove wg0"]);
    assert!(!backend.is_running());
}

#[tokio::test]
async fn add_and_remove_peer_protocol() {
    let engine = Arc::new(FakeEngine::new());
    let backend = EngineBackend::new(engine.clone());
    backend.start(&server_config()).await.unwrap();

    backend
        .add_peer(CLIENT_PUBLIC, &["10.0.0.2/32".to_string()])
        .await
        .unwrap();
    let peers = backend.list_peers().await.unwrap();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].allowed_addresses, vec!["10.0.0.2/32".to_string()]);

    backend.remove_peer(CLIENT_PUBLIC).await.unwrap();
    assert!(backend.list_peers().await.unwrap().is_empty());

    let requests = engine.requests();
    let hex = hex_of(CLIENT_PUBLIC);
    assert_eq!(requests[1], format!("public_key={hex}\nallowed_ip=10.0.0.2/32\n"));
    assert_eq!(requests[2], format!("public_key={hex}\nremove=true\n"));
}

#[tokio::test]
async fn configure_peer_sends_endpoint_and_keepalive() {
    let engine = Arc::new(FakeEngine::new());
    let backend = EngineBackend::new(engine.clone());
    backend.start(&server_config()).await.unwrap();

    let peer = PeerSpec::new(CLIENT_PUBLIC, &["0.0.0.0/0".to_string()])
        .with_endpoint("127.0.0.1:51820".parse().unwrap())
        .with_keepalive(25);
    backend.configure_peer(&peer).await.unwrap();

    assert_eq!(
        engine.requests()[1],
        format!(
            "public_key={}\nendpoint=127.0.0.1:51820\npersistent_keepalive_interval=25\nallowed_ip=0.0.0.0/0\n",
            hex_of(CLIENT_PUBLIC)
        )
    );
}

#[tokio::test]
async fn peer_with_bad_key_is_an_error_not_a_panic() {
    let backend = EngineBackend::new(Arc::new(FakeEngine::new()));
    backend.start(&server_config()).await.unwrap();

    let err = backend
        .add_peer("AAAA", &["10.0.0.2/32".to_string()])
        .await
        .unwrap_err();
    assert!(matches!(err, BackendError::InvalidKey { .. }));
    assert!(backend.list_peers().await.unwrap().is_empty());
}

#[tokio::test]
async fn peer_changes_require_a_running_backend() {
    let backend = EngineBackend::new(Arc::new(FakeEngine::new()));

    assert!(matches!(
        backend.add_peer(CLIENT_PUBLIC, &[]).await,
        Err(BackendError::NotRunning)
    ));
    assert!(matches!(
        backend.remove_peer(CLIENT_PUBLIC).await,
        Err(BackendError::NotRunning)
    ));
    assert!(matches!(
        backend.transfer_stats().await,
        Err(BackendError::NotRunning)
    ));
}

#[tokio::test]
async fn stop_removes_interface_even_when_close_fails() {
    let mut engine = FakeEngine::new();
    engine.close = CloseBehaviour::Fail;
    let engine = Arc::new(engine);
    let backend = EngineBackend::new(engine.clone());
    backend.start(&server_config()).await.unwrap();

    backend.stop().await.unwrap();

    assert!(!backend.is_running());
    assert_eq!(engine.events()[2..], ["close", "remove wg0"]);
}

#[tokio::test]
async fn stop_contains_a_panicking_engine() {
    let mut engine = FakeEngine::new();
    engine.close = CloseBehaviour::Panic;
    let engine = Arc::new(engine);
    let backend = EngineBackend::new(engine.clone());
    backend.start(&server_config()).await.unwrap();
    backend
        .add_peer(CLIENT_PUBLIC, &["10.0.0.2/32".to_string()])
        .await
        .unwrap();

    backend.stop().await.unwrap();

    assert!(!backend.is_running());
    assert!(backend.list_peers().await.unwrap().is_empty());
    assert_eq!(engine.events().last().map(String::as_str), Some("remove wg0"));

    // A stopped backend can be started again
    backend.start(&server_config()).await.unwrap();
    assert!(backend.is_running());
}

#[tokio::test]
async fn stop_when_stopped_is_a_no_op() {
    let engine = Arc::new(FakeEngine::new());
    let backend = EngineBackend::new(engine.clone());

    backend.stop().await.unwrap();
    assert!(engine.events().is_empty());
}

#[tokio::test]
async fn transfer_stats_sum_peers() {
    let mut engine = FakeEngine::new();
    engine.dump = [
        "listen_port=51820",
        "public_key=aa",
        "rx_bytes=100",
        "tx_bytes=40",
        "last_handshake_time_sec=1700000000",
        "public_key=bb",
        "rx_bytes=5",
        "tx_bytes=6",
        "last_handshake_time_sec=0",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    let backend = EngineBackend::new(Arc::new(engine));
    backend.start(&server_config()).await.unwrap();

    let stats = backend.transfer_stats().await.unwrap();
    assert_eq!(stats.rx_bytes, 105);
    assert_eq!(stats.tx_bytes, 46);
    assert_eq!(stats.last_handshake.map(|t| t.timestamp()), Some(1_700_000_000));
}

#[tokio::test]
async fn abort_releases_without_closing() {
    let engine = Arc::new(FakeEngine::new());
    let backend = EngineBackend::new(engine.clone());
    backend.start(&server_config()).await.unwrap();

    backend.abort().await;

    assert!(!backend.is_running());
    assert!(!engine.events().contains(&"close".to_string()));
    backend.start(&server_config()).await.unwrap();
}
