use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use application::{
    ChatEngine, GatewayLimits, InMemoryStore, PersistenceGatewayDependencies, SystemClock,
};
use config::{CallConfig, SessionConfig};
use domain::{User, UserId};
use tokio::{net::TcpListener, sync::oneshot, time::sleep};
use web_api::{router, AppState, JwtConfig, JwtService};

pub struct TestUser {
    pub id: UserId,
    pub token: String,
}

/// 基于内存存储的真实 HTTP/WebSocket 服务，退出作用域时关停。
pub struct TestServer {
    pub addr: SocketAddr,
    pub engine: Arc<ChatEngine>,
    pub alice: TestUser,
    pub bob: TestUser,
    pub carol: TestUser,
    shutdown: Option<oneshot::Sender<()>>,
}

impl TestServer {
    pub async fn start() -> Self {
        let store = InMemoryStore::new();
        let jwt_service = Arc::new(JwtService::new(JwtConfig {
            secret: "test-secret-key-with-enough-length".to_string(),
            expiration_hours: 24,
        }));

        let mut users = Vec::new();
        for name in ["alice", "bob", "carol"] {
            let id = UserId::generate();
            store.insert_user(User::new(id, name)).await;
            let token = jwt_service.generate_token(id).expect("token");
            users.push(TestUser { id, token });
        }
        let carol = users.pop().expect("carol");
        let bob = users.pop().expect("bob");
        let alice = users.pop().expect("alice");

        let engine = ChatEngine::assemble(
            PersistenceGatewayDependencies::from_store(
                store,
                Arc::new(SystemClock),
                GatewayLimits::default(),
            ),
            jwt_service.clone(),
            None,
            &SessionConfig::default(),
            &CallConfig::default(),
        );
        let app = router(AppState::new(engine.clone(), jwt_service));

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            axum::serve(listener, app.into_make_service())
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .ok();
        });

        // allow server to start
        sleep(Duration::from_millis(50)).await;

        Self {
            addr,
            engine,
            alice,
            bob,
            carol,
            shutdown: Some(shutdown_tx),
        }
    }

    pub fn http(&self, path: &str) -> String {
        format!("http://{}/api/v1{}", self.addr, path)
    }

    pub fn ws(&self, path: &str, token: &str) -> String {
        format!("ws://{}/api/v1{}?token={}", self.addr, path, token)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}
