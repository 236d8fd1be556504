//! Shared test utilities

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{Map, Value, json};

use scp_hub::registry::{BackendServer, PortRequest, Prober, Registration, ServerKind};
use scp_hub::tools::{Content, ToolClient, ToolDescriptor, Transports, text_content};
use scp_hub::{Error, Hub, Result};

/// Prober reporting every server healthy except those listed
#[derive(Default)]
pub struct StaticProber {
    down: Mutex<HashSet<String>>,
}

impl StaticProber {
    pub fn with_down(servers: &[&str]) -> Self {
        Self {
            down: Mutex::new(servers.iter().map(ToString::to_string).collect()),
        }
    }
}

#[async_trait]
impl Prober for StaticProber {
    async fn probe(&self, server: &BackendServer) -> bool {
        !self.down.lock().unwrap().contains(&server.name)
    }
}

/// Tool client answering from in-memory catalogs
///
/// A call returns one text item `"{server}:{tool}"`.
#[derive(Default)]
pub struct ScriptedClient {
    catalogs: Mutex<HashMap<String, Vec<ToolDescriptor>>>,
    unreachable: Mutex<HashSet<String>>,
    calls: Mutex<Vec<(String, String, Map<String, Value>)>>,
}

impl ScriptedClient {
    pub fn with_tools(self, server: &str, tools: &[&str]) -> Self {
        let catalog = tools
            .iter()
            .map(|name| ToolDescriptor::new(*name, format!("{name} tool"), json!({"type": "object"})))
            .collect();
        self.catalogs.lock().unwrap().insert(server.to_string(), catalog);
        self
    }

    pub fn unreachable(self, server: &str) -> Self {
        self.unreachable.lock().unwrap().insert(server.to_string());
        self
    }

    /// `(server, tool)` pairs in call order
    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(server, tool, _)| (server.clone(), tool.clone()))
            .collect()
    }

    pub fn last_arguments(&self) -> Option<Map<String, Value>> {
        self.calls.lock().unwrap().last().map(|(_, _, args)| args.clone())
    }

    fn check_reachable(&self, server: &BackendServer) -> Result<()> {
        if self.unreachable.lock().unwrap().contains(&server.name) {
            return Err(Error::Transport(format!("{}: connection refused", server.name)));
        }
        Ok(())
    }
}

#[async_trait]
impl ToolClient for ScriptedClient {
    async fn list_tools(&self, server: &BackendServer) -> Result<Vec<ToolDescriptor>> {
        self.check_reachable(server)?;
        Ok(self
            .catalogs
            .lock()
            .unwrap()
            .get(&server.name)
            .cloned()
            .unwrap_or_default())
    }

    async fn call_tool(
        &self,
        server: &BackendServer,
        name: &str,
        arguments: Map<String, Value>,
    ) -> Result<Content> {
        self.check_reachable(server)?;
        self.calls
            .lock()
            .unwrap()
            .push((server.name.clone(), name.to_string(), arguments));
        Ok(vec![text_content(format!("{}:{name}", server.name))])
    }
}

/// Registration on a fixed port
pub fn registration(name: &str, port: u16) -> Registration {
    Registration {
        name: name.to_string(),
        url: "http://127.0.0.1".to_string(),
        description: format!("{name} worker"),
        port: PortRequest::Fixed(port),
        kind: ServerKind::Direct,
    }
}

/// In-memory hub whose backends are answered by `client`
pub fn hub_with(client: Arc<ScriptedClient>, prober: StaticProber) -> Hub {
    Hub::builder()
        .prober(Arc::new(prober))
        .transports(Transports::uniform(client))
        .build()
}

/// Hub with the given servers registered in order
pub async fn hub_with_servers(client: Arc<ScriptedClient>, servers: &[&str]) -> Hub {
    let hub = hub_with(client, StaticProber::default());
    for (offset, name) in (0u16..).zip(servers) {
        hub.register(registration(name, 6100 + offset))
            .await
            .expect("failed to register test server");
    }
    hub
}
