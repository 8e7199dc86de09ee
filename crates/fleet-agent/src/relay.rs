//! Forwards unit lifecycle signals from the local systemd manager into
//! this agent's own `internal.Agent` signal emissions, filtered against
//! whatever units the controller has actually subscribed to.
//!
//! `UnitStateChanged` is approximated from `JobRemoved`, which fires once
//! per unit job with the final result — coarser than true property
//! watching but enough to drive monitors for state transitions driven by
//! a job. Genuine property changes (ones systemd emits with no job
//! attached, e.g. a unit flipping `ActiveState` on its own) are picked up
//! separately below by sniffing raw `org.freedesktop.DBus.Properties
//! .PropertiesChanged` signals on the subscribed units' own object paths
//! and forwarding them as `UnitPropertiesChanged`.
//!
//! `JobRemoved` is also forwarded verbatim (unfiltered by subscription)
//! so the controller can correlate completion of any sub-job it issued,
//! not just ones for subscribed units.

use crate::interface::AgentInterface;
use crate::local_manager::SystemdManagerProxy;
use futures::StreamExt;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use zbus::object_server::InterfaceRef;
use zbus::zvariant::OwnedValue;

pub async fn run(
    system_bus: zbus::Connection,
    peer_connection: zbus::Connection,
    agent_path: String,
    subscribed_units: Arc<Mutex<HashSet<String>>>,
    unit_paths: Arc<Mutex<HashMap<String, String>>>,
) -> zbus::Result<()> {
    let manager = SystemdManagerProxy::new(&system_bus).await?;
    let mut unit_new = manager.receive_unit_new().await?;
    let mut unit_removed = manager.receive_unit_removed().await?;
    let mut job_removed = manager.receive_job_removed().await?;
    let mut properties_changed = zbus::MessageStream::from(&system_bus);

    loop {
        tokio::select! {
            Some(signal) = unit_new.next() => {
                let args = signal.args()?;
                let name = args.id.clone();
                if is_subscribed(&subscribed_units, &name).await {
                    if let Some(iface) = agent_interface(&peer_connection, &agent_path).await {
                        let emitter = iface.signal_emitter();
                        let _ = AgentInterface::unit_new(&emitter, &name, "loaded").await;
                    }
                }
            }
            Some(signal) = unit_removed.next() => {
                let args = signal.args()?;
                let name = args.id.clone();
                if is_subscribed(&subscribed_units, &name).await {
                    if let Some(iface) = agent_interface(&peer_connection, &agent_path).await {
                        let emitter = iface.signal_emitter();
                        let _ = AgentInterface::unit_removed(&emitter, &name, "removed").await;
                    }
                }
            }
            Some(signal) = job_removed.next() => {
                let args = signal.args()?;
                let name = args.unit.clone();
                if let Some(iface) = agent_interface(&peer_connection, &agent_path).await {
                    let emitter = iface.signal_emitter();
                    let _ = AgentInterface::job_removed(&emitter, &args.job.to_string(), &args.result).await;
                }
                if is_subscribed(&subscribed_units, &name).await {
                    if let Some(iface) = agent_interface(&peer_connection, &agent_path).await {
                        let emitter = iface.signal_emitter();
                        let (active_state, sub_state) = state_for_result(&args.result);
                        let _ = AgentInterface::unit_state_changed(
                            &emitter,
                            &name,
                            active_state,
                            sub_state,
                            &args.result,
                        )
                        .await;
                    }
                }
            }
            Some(msg) = properties_changed.next() => {
                let Ok(msg) = msg else { continue };
                let header = msg.header();
                if header.message_type() != zbus::message::Type::Signal {
                    continue;
                }
                if header.interface().map(|i| i.as_str()) != Some("org.freedesktop.DBus.Properties") {
                    continue;
                }
                if header.member().map(|m| m.as_str()) != Some("PropertiesChanged") {
                    continue;
                }
                let Some(path) = header.path() else { continue };
                let unit = unit_paths.lock().await.get(path.as_str()).cloned();
                let Some(unit) = unit else { continue };
                if !is_subscribed(&subscribed_units, &unit).await {
                    continue;
                }
                let Ok((interface_name, changed, _invalidated)) =
                    msg.body().deserialize::<(String, HashMap<String, OwnedValue>, Vec<String>)>()
                else {
                    continue;
                };
                if let Some(iface) = agent_interface(&peer_connection, &agent_path).await {
                    let emitter = iface.signal_emitter();
                    let _ = AgentInterface::unit_properties_changed(&emitter, &unit, &interface_name, changed).await;
                }
            }
            else => break,
        }
    }

    Ok(())
}

async fn is_subscribed(subscribed: &Arc<Mutex<HashSet<String>>>, unit: &str) -> bool {
    let units = subscribed.lock().await;
    units.contains(unit)
}

async fn agent_interface(connection: &zbus::Connection, path: &str) -> Option<InterfaceRef<AgentInterface>> {
    connection.object_server().interface(path).await.ok()
}

fn state_for_result(result: &str) -> (&'static str, &'static str) {
    match result {
        "done" => ("active", "running"),
        "canceled" => ("inactive", "dead"),
        _ => ("failed", "failed"),
    }
}
