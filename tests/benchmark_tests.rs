//! Performance benchmarks for the hot orchestrator paths

use server::auth::{AuthResponse, AuthenticationHandler, AuthenticationRegistry};
use server::client::{Client, ClientIdGenerator};
use server::client_list::ClientList;
use server::session::SessionPtr;
use server::supervision::check_clients;
use shared::{ClientId, ClientState, ProtocolConfig};
use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

struct IdleClient {
    id: ClientId,
    accept_time: Instant,
    state: ClientState,
}

impl Client for IdleClient {
    fn id(&self) -> ClientId {
        self.id
    }

    fn accept_time(&self) -> Instant {
        self.accept_time
    }

    fn state(&self) -> ClientState {
        self.state
    }

    fn is_secure(&self) -> bool {
        false
    }

    fn run(&self, _skip_name_resolve: bool) {}

    fn on_auth_timeout(&self) {}

    fn on_server_shutdown(&self) {}
}

struct NoopHandler;

impl AuthenticationHandler for NoopHandler {
    fn handle_start(&mut self, _mechanism: &str, _initial_response: &[u8]) -> AuthResponse {
        AuthResponse::Succeeded(Vec::new())
    }

    fn handle_continue(&mut self, _data: &[u8]) -> AuthResponse {
        AuthResponse::Succeeded(Vec::new())
    }
}

fn idle_client(id: u64, state: ClientState) -> Arc<dyn Client> {
    Arc::new(IdleClient {
        id: ClientId(id),
        accept_time: Instant::now(),
        state,
    })
}

/// Benchmarks registry churn from several threads at once
#[test]
fn benchmark_registry_churn() {
    let list = Arc::new(ClientList::new());
    let ids = Arc::new(ClientIdGenerator::default());
    let threads = 4;
    let iterations = 10_000;
    let start = Instant::now();

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let list = Arc::clone(&list);
            let ids = Arc::clone(&ids);
            thread::spawn(move || {
                for _ in 0..iterations {
                    let client = idle_client(ids.next().0, ClientState::Accepted);
                    let id = client.id();
                    list.add(client).unwrap();
                    list.remove(id);
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    let duration = start.elapsed();
    let operations = threads * iterations;
    println!(
        "Registry churn: {} add/remove pairs in {:?} ({:.2} μs/pair)",
        operations,
        duration,
        duration.as_micros() as f64 / operations as f64
    );

    assert!(list.is_empty());
    // Should complete in under 2 seconds
    assert!(duration.as_millis() < 2000);
}

/// Benchmarks a supervision pass over a large registry
#[test]
fn benchmark_supervision_pass() {
    let config = ProtocolConfig::default();
    let clients: Vec<Arc<dyn Client>> = (0..10_000)
        .map(|i| {
            let state = if i % 2 == 0 {
                ClientState::Accepted
            } else {
                ClientState::Running
            };
            idle_client(i, state)
        })
        .collect();

    let mut flagged = HashSet::new();
    let iterations = 20;
    let start = Instant::now();

    for _ in 0..iterations {
        let next = check_clients(&clients, &config, &mut flagged, Instant::now());
        assert!(next.unwrap() <= Duration::from_secs(30));
    }

    let duration = start.elapsed();
    println!(
        "Supervision pass: {} passes over {} clients in {:?} ({:.2} μs/pass)",
        iterations,
        clients.len(),
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    assert!(flagged.is_empty());
    // Should complete in under 2 seconds
    assert!(duration.as_millis() < 2000);
}

/// Benchmarks mechanism listing for insecure and secure clients
#[test]
fn benchmark_mechanism_listing() {
    let registry = AuthenticationRegistry::new();
    for i in 0..32 {
        let factory = |_session: SessionPtr| -> Box<dyn AuthenticationHandler> {
            Box::new(NoopHandler)
        };
        registry.add(&format!("MECH{:02}", i), Arc::new(factory), i % 3 == 0);
    }

    let iterations = 10_000;
    let start = Instant::now();

    for i in 0..iterations {
        let names = registry.names_for(i % 2 == 0);
        assert!(!names.is_empty());
    }

    let duration = start.elapsed();
    println!(
        "Mechanism listing: {} iterations in {:?} ({:.2} μs/iter)",
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    // Should complete in under 1 second
    assert!(duration.as_millis() < 1000);
}
