//! Minimal OVSDB JSON-RPC client (spec §4.4): bridge/port/interface CRUD
//! against a local `ovsdb-server` over its management Unix socket.
//!
//! The wire protocol is JSON-RPC 1.0 without length framing, so replies
//! are recovered by feeding bytes into a streaming [`serde_json::Deserializer`]
//! until one complete value is available. `ovsdb-server` is treated as an
//! external, possibly-flaky collaborator: connection loss surfaces as
//! [`CoreError::NotConnected`] rather than a panic.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::Mutex;

use crate::error::{CoreError, Result};

const OVS_DB: &str = "Open_vSwitch";

#[async_trait]
pub trait OvsdbClient: Send + Sync {
    /// Creates `bridge` iff a port with that name does not already exist.
    async fn ensure_bridge(&self, bridge: &str) -> Result<()>;
    /// Adds an `internal`-type port tagged with `vlan_tag`.
    async fn add_internal_port(&self, bridge: &str, port: &str, vlan_tag: u32) -> Result<()>;
    /// Adds a `vxlan`-type port with the given remote peer address.
    async fn add_vxlan_port(&self, bridge: &str, port: &str, peer_ip: &str) -> Result<()>;
    async fn delete_port(&self, port: &str) -> Result<()>;
    /// Removes `bridge` from `Open_vSwitch.bridges` (spec §4.4 `DeleteBridge`).
    async fn delete_bridge(&self, bridge: &str) -> Result<()>;
    /// Sets an `other_config` entry on the Interface row for `port`.
    async fn update_port_context(&self, port: &str, key: &str, value: &str) -> Result<()>;
    /// Last-known row snapshot for `table`, keyed by row uuid.
    async fn get_table_cache(&self, table: &str) -> Result<HashMap<String, Value>>;
}

pub struct UnixSocketOvsdb {
    stream: Mutex<Option<UnixStream>>,
    path: String,
    next_id: AtomicU64,
}

impl UnixSocketOvsdb {
    pub async fn connect(path: &str) -> Result<Self> {
        let stream = UnixStream::connect(path)
            .await
            .map_err(|e| CoreError::OsError(format!("ovsdb connect {path}: {e}")))?;
        Ok(UnixSocketOvsdb {
            stream: Mutex::new(Some(stream)),
            path: path.to_string(),
            next_id: AtomicU64::new(1),
        })
    }

    async fn reconnect(&self) -> Result<()> {
        let stream = UnixStream::connect(&self.path)
            .await
            .map_err(|e| CoreError::OsError(format!("ovsdb reconnect {}: {e}", self.path)))?;
        *self.stream.lock().await = Some(stream);
        Ok(())
    }

    async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = json!({"method": method, "params": params, "id": id});
        let mut bytes = serde_json::to_vec(&request)?;
        bytes.push(b'\n');

        let mut guard = self.stream.lock().await;
        if guard.is_none() {
            drop(guard);
            self.reconnect().await?;
            guard = self.stream.lock().await;
        }
        let stream = guard.as_mut().ok_or(CoreError::NotConnected)?;

        if stream.write_all(&bytes).await.is_err() {
            *guard = None;
            return Err(CoreError::NotConnected);
        }

        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            match serde_json::Deserializer::from_slice(&buf).into_iter::<Value>().next() {
                Some(Ok(value)) => {
                    let error = value.get("error").cloned().unwrap_or(Value::Null);
                    if !error.is_null() {
                        return Err(CoreError::OsError(format!("ovsdb error: {error}")));
                    }
                    return Ok(value.get("result").cloned().unwrap_or(Value::Null));
                }
                Some(Err(e)) if !e.is_eof() => {
                    return Err(CoreError::OsError(format!("ovsdb protocol error: {e}")));
                }
                _ => {}
            }
            let n = match stream.read(&mut chunk).await {
                Ok(0) | Err(_) => {
                    *guard = None;
                    return Err(CoreError::NotConnected);
                }
                Ok(n) => n,
            };
            buf.extend_from_slice(&chunk[..n]);
        }
    }

    async fn transact(&self, ops: Vec<Value>) -> Result<Vec<Value>> {
        let mut params = vec![Value::String(OVS_DB.to_string())];
        params.extend(ops);
        let result = self.call("transact", params).await?;
        result
            .as_array()
            .cloned()
            .ok_or_else(|| CoreError::OsError("malformed transact reply".to_string()))
    }

    async fn find_row_uuid(&self, table: &str, column: &str, value: &str) -> Result<Option<String>> {
        let select = json!({
            "op": "select",
            "table": table,
            "where": [[column, "==", value]],
        });
        let rows = self.transact(vec![select]).await?;
        let Some(rows) = rows.first().and_then(|r| r.get("rows")).and_then(|r| r.as_array()) else {
            return Ok(None);
        };
        Ok(rows
            .first()
            .and_then(|row| row.get("_uuid"))
            .and_then(|u| u.as_array())
            .and_then(|u| u.get(1))
            .and_then(|u| u.as_str())
            .map(|s| s.to_string()))
    }
}

fn add_port_ops(bridge: &str, port_row: Value, iface_row: Value) -> Vec<Value> {
    vec![
        json!({"op": "insert", "table": "Interface", "row": iface_row, "uuid-name": "new_iface"}),
        json!({
            "op": "insert",
            "table": "Port",
            "row": merge(port_row, json!({"interfaces": ["named-uuid", "new_iface"]})),
            "uuid-name": "new_port",
        }),
        json!({
            "op": "mutate",
            "table": "Bridge",
            "where": [["name", "==", bridge]],
            "mutations": [["ports", "insert", ["set", [["named-uuid", "new_port"]]]]],
        }),
    ]
}

fn merge(mut base: Value, extra: Value) -> Value {
    if let (Some(base_obj), Some(extra_obj)) = (base.as_object_mut(), extra.as_object()) {
        for (k, v) in extra_obj {
            base_obj.insert(k.clone(), v.clone());
        }
    }
    base
}

#[async_trait]
impl OvsdbClient for UnixSocketOvsdb {
    async fn ensure_bridge(&self, bridge: &str) -> Result<()> {
        if self.find_row_uuid("Port", "name", bridge).await?.is_some() {
            return Ok(());
        }
        let ops = vec![
            json!({
                "op": "insert",
                "table": "Interface",
                "row": {"name": bridge, "type": "internal"},
                "uuid-name": "new_iface",
            }),
            json!({
                "op": "insert",
                "table": "Port",
                "row": {"name": bridge, "interfaces": ["named-uuid", "new_iface"]},
                "uuid-name": "new_port",
            }),
            json!({
                "op": "insert",
                "table": "Bridge",
                "row": {"name": bridge, "ports": ["named-uuid", "new_port"]},
                "uuid-name": "new_bridge",
            }),
            json!({
                "op": "mutate",
                "table": "Open_vSwitch",
                "where": [],
                "mutations": [["bridges", "insert", ["set", [["named-uuid", "new_bridge"]]]]],
            }),
        ];
        self.transact(ops).await?;
        Ok(())
    }

    async fn add_internal_port(&self, bridge: &str, port: &str, vlan_tag: u32) -> Result<()> {
        let ops = add_port_ops(
            bridge,
            json!({"name": port, "tag": vlan_tag}),
            json!({"name": port, "type": "internal"}),
        );
        self.transact(ops).await?;
        Ok(())
    }

    async fn add_vxlan_port(&self, bridge: &str, port: &str, peer_ip: &str) -> Result<()> {
        let ops = add_port_ops(
            bridge,
            json!({"name": port}),
            json!({
                "name": port,
                "type": "vxlan",
                "options": ["map", [["remote_ip", peer_ip]]],
            }),
        );
        self.transact(ops).await?;
        Ok(())
    }

    async fn delete_port(&self, port: &str) -> Result<()> {
        let Some(port_uuid) = self.find_row_uuid("Port", "name", port).await? else {
            return Ok(());
        };
        let ops = vec![json!({
            "op": "mutate",
            "table": "Bridge",
            "where": [],
            "mutations": [["ports", "delete", ["set", [["uuid", port_uuid]]]]],
        })];
        self.transact(ops).await?;
        Ok(())
    }

    async fn delete_bridge(&self, bridge: &str) -> Result<()> {
        let Some(bridge_uuid) = self.find_row_uuid("Bridge", "name", bridge).await? else {
            return Ok(());
        };
        let ops = vec![json!({
            "op": "mutate",
            "table": "Open_vSwitch",
            "where": [],
            "mutations": [["bridges", "delete", ["set", [["uuid", bridge_uuid]]]]],
        })];
        self.transact(ops).await?;
        Ok(())
    }

    async fn update_port_context(&self, port: &str, key: &str, value: &str) -> Result<()> {
        let ops = vec![json!({
            "op": "mutate",
            "table": "Interface",
            "where": [["name", "==", port]],
            "mutations": [["other_config", "insert", ["map", [[key, value]]]]],
        })];
        self.transact(ops).await?;
        Ok(())
    }

    async fn get_table_cache(&self, table: &str) -> Result<HashMap<String, Value>> {
        let select = json!({"op": "select", "table": table, "where": []});
        let rows = self.transact(vec![select]).await?;
        let mut cache = HashMap::new();
        let Some(rows) = rows.first().and_then(|r| r.get("rows")).and_then(|r| r.as_array()) else {
            return Ok(cache);
        };
        for row in rows {
            if let Some(uuid) = row
                .get("_uuid")
                .and_then(|u| u.as_array())
                .and_then(|u| u.get(1))
                .and_then(|u| u.as_str())
            {
                cache.insert(uuid.to_string(), row.clone());
            }
        }
        Ok(cache)
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;

    #[derive(Default)]
    pub struct FakeOvsdb {
        pub calls: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl OvsdbClient for FakeOvsdb {
        async fn ensure_bridge(&self, bridge: &str) -> Result<()> {
            self.calls.lock().unwrap().push(format!("ensure_bridge {bridge}"));
            Ok(())
        }
        async fn add_internal_port(&self, bridge: &str, port: &str, tag: u32) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("add_internal_port {bridge} {port} {tag}"));
            Ok(())
        }
        async fn add_vxlan_port(&self, bridge: &str, port: &str, peer_ip: &str) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("add_vxlan_port {bridge} {port} {peer_ip}"));
            Ok(())
        }
        async fn delete_port(&self, port: &str) -> Result<()> {
            self.calls.lock().unwrap().push(format!("delete_port {port}"));
            Ok(())
        }
        async fn delete_bridge(&self, bridge: &str) -> Result<()> {
            self.calls.lock().unwrap().push(format!("delete_bridge {bridge}"));
            Ok(())
        }
        async fn update_port_context(&self, port: &str, key: &str, value: &str) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("update_port_context {port} {key} {value}"));
            Ok(())
        }
        async fn get_table_cache(&self, table: &str) -> Result<HashMap<String, Value>> {
            self.calls.lock().unwrap().push(format!("get_table_cache {table}"));
            Ok(HashMap::new())
        }
    }
}
