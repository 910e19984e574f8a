/*!
Relais réseau simulé (API RPC type Shelly) servi par wiremock

Garde l'état de chaque sortie et enregistre chaque appel `Switch.Set`, pour
vérifier la séquence off → on d'un cycle d'alimentation.
*/

use parking_lot::Mutex;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerCall {
    Get(u32),
    Set(u32, bool),
}

#[derive(Debug, Default)]
struct RelayState {
    outputs: BTreeMap<u32, bool>,
    calls: Vec<PowerCall>,
    /// Switch.Set answers 500
    fail_set: bool,
}

type Shared = Arc<Mutex<RelayState>>;

fn query_u32(request: &Request, key: &str) -> Option<u32> {
    request
        .url
        .query_pairs()
        .find(|(k, _)| k == key)
        .and_then(|(_, v)| v.parse().ok())
}

struct GetStatus(Shared);

impl Respond for GetStatus {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let Some(id) = query_u32(request, "id") else {
            return ResponseTemplate::new(400);
        };
        let mut state = self.0.lock();
        state.calls.push(PowerCall::Get(id));
        match state.outputs.get(&id) {
            Some(&output) => ResponseTemplate::new(200).set_body_json(json!({
                "id": id,
                "output": output,
                "name": format!("Relay {id}"),
            })),
            None => ResponseTemplate::new(404),
        }
    }
}

struct SetOutput(Shared);

impl Respond for SetOutput {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let id = query_u32(request, "id");
        let on = request
            .url
            .query_pairs()
            .find(|(k, _)| k == "on")
            .map(|(_, v)| v == "true");
        let (Some(id), Some(on)) = (id, on) else {
            return ResponseTemplate::new(400);
        };

        let mut state = self.0.lock();
        state.calls.push(PowerCall::Set(id, on));
        if state.fail_set {
            return ResponseTemplate::new(500);
        }
        let was_on = state.outputs.insert(id, on).unwrap_or(false);
        ResponseTemplate::new(200).set_body_json(json!({ "was_on": was_on }))
    }
}

struct GetInfo(Shared);

impl Respond for GetInfo {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        let state = self.0.lock();
        let components: Vec<_> = state
            .outputs
            .keys()
            .map(|id| json!({ "key": format!("switch:{id}") }))
            .collect();
        ResponseTemplate::new(200).set_body_json(json!({ "components": components }))
    }
}

/// Simulated network power switch
pub struct PowerSwitchStub {
    server: MockServer,
    state: Shared,
}

impl PowerSwitchStub {
    /// Relay 0, output on
    pub async fn start() -> Self {
        let state: Shared = Arc::new(Mutex::new(RelayState::default()));
        state.lock().outputs.insert(0, true);

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rpc/Switch.GetStatus"))
            .respond_with(GetStatus(state.clone()))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/rpc/Switch.Set"))
            .respond_with(SetOutput(state.clone()))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/rpc/Shelly.GetInfo"))
            .respond_with(GetInfo(state.clone()))
            .mount(&server)
            .await;

        Self { server, state }
    }

    /// Base URL, usable as `[power] address`
    pub fn address(&self) -> String {
        self.server.uri()
    }

    pub fn set_output(&self, id: u32, on: bool) {
        self.state.lock().outputs.insert(id, on);
    }

    pub fn output(&self, id: u32) -> Option<bool> {
        self.state.lock().outputs.get(&id).copied()
    }

    pub fn fail_set(&self, fail: bool) {
        self.state.lock().fail_set = fail;
    }

    pub fn calls(&self) -> Vec<PowerCall> {
        self.state.lock().calls.clone()
    }

    /// Only the `Switch.Set` calls
    pub fn set_calls(&self) -> Vec<(u32, bool)> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|c| match *c {
                PowerCall::Set(id, on) => Some((id, on)),
                PowerCall::Get(_) => None,
            })
            .collect()
    }
}
