//! Typed proxy for the real, upstream `org.freedesktop.systemd1.Manager`
//! interface running on this host's system bus. Generated with
//! `#[zbus::proxy]`, the same way this codebase generates typed proxies
//! for other well-known public interfaces (`zbus::fdo::DBusProxy`,
//! `zbus::fdo::IntrospectableProxy`) rather than hand-rolling them —
//! unlike the private `internal.Agent`/`internal.Manager` interfaces,
//! which are hand-rolled because the macro's boilerplate buys nothing
//! for an interface only this project's two binaries ever speak.

use zbus::proxy;
use zbus::zvariant::{OwnedObjectPath, OwnedValue};

#[proxy(
    interface = "org.freedesktop.systemd1.Manager",
    default_service = "org.freedesktop.systemd1",
    default_path = "/org/freedesktop/systemd1"
)]
pub trait SystemdManager {
    #[zbus(name = "StartUnit")]
    fn start_unit(&self, name: &str, mode: &str) -> zbus::Result<OwnedObjectPath>;

    #[zbus(name = "StopUnit")]
    fn stop_unit(&self, name: &str, mode: &str) -> zbus::Result<OwnedObjectPath>;

    #[zbus(name = "RestartUnit")]
    fn restart_unit(&self, name: &str, mode: &str) -> zbus::Result<OwnedObjectPath>;

    #[zbus(name = "ReloadUnit")]
    fn reload_unit(&self, name: &str, mode: &str) -> zbus::Result<OwnedObjectPath>;

    #[zbus(name = "EnableUnitFiles")]
    #[allow(clippy::type_complexity)]
    fn enable_unit_files(
        &self,
        files: &[&str],
        runtime: bool,
        force: bool,
    ) -> zbus::Result<(bool, Vec<(String, String, String)>)>;

    #[zbus(name = "DisableUnitFiles")]
    fn disable_unit_files(&self, files: &[&str], runtime: bool) -> zbus::Result<Vec<(String, String, String)>>;

    #[zbus(name = "Reload")]
    fn reload(&self) -> zbus::Result<()>;

    #[zbus(name = "Subscribe")]
    fn subscribe(&self) -> zbus::Result<()>;

    #[zbus(name = "Unsubscribe")]
    fn unsubscribe(&self) -> zbus::Result<()>;

    #[zbus(name = "ListUnits")]
    #[allow(clippy::type_complexity)]
    fn list_units(
        &self,
    ) -> zbus::Result<Vec<(String, String, String, String, String, String, OwnedObjectPath, u32, String, OwnedObjectPath)>>;

    #[zbus(name = "GetUnit")]
    fn get_unit(&self, name: &str) -> zbus::Result<OwnedObjectPath>;

    #[zbus(name = "FreezeUnit")]
    fn freeze_unit(&self, name: &str) -> zbus::Result<()>;

    #[zbus(name = "ThawUnit")]
    fn thaw_unit(&self, name: &str) -> zbus::Result<()>;

    #[zbus(name = "SetUnitProperties")]
    fn set_unit_properties(&self, name: &str, runtime: bool, properties: Vec<(String, OwnedValue)>) -> zbus::Result<()>;

    #[zbus(signal, name = "UnitNew")]
    fn unit_new(&self, id: String, unit: OwnedObjectPath) -> zbus::Result<()>;

    #[zbus(signal, name = "UnitRemoved")]
    fn unit_removed(&self, id: String, unit: OwnedObjectPath) -> zbus::Result<()>;

    #[zbus(signal, name = "JobRemoved")]
    fn job_removed(&self, id: u32, job: OwnedObjectPath, unit: String, result: String) -> zbus::Result<()>;
}
