//! TCP socket tuning applied to every peer-bus connection: `TCP_NODELAY`
//! always, `SO_KEEPALIVE` with a configurable idle/interval/count, and
//! optionally `IP_RECVERR` (Linux-only; quietly skipped elsewhere) so a
//! dead peer is detected by the kernel rather than by our own timers
//! alone.

use fleet_core::Config;
use socket2::SockRef;
use std::time::Duration;
use tokio::net::TcpStream;

pub fn apply(stream: &TcpStream, config: &Config) -> std::io::Result<()> {
    stream.set_nodelay(true)?;

    let sock = SockRef::from(stream);
    let keepalive = socket2::TcpKeepalive::new()
        .with_time(Duration::from_secs(config.tcp_keepalive_time_secs as u64))
        .with_interval(Duration::from_secs(config.tcp_keepalive_interval_secs as u64));
    #[cfg(any(target_os = "linux", target_os = "android"))]
    let keepalive = keepalive.with_retries(config.tcp_keepalive_count);
    sock.set_tcp_keepalive(&keepalive)?;

    if config.ip_receive_errors {
        apply_recverr(&sock);
    }

    Ok(())
}

#[cfg(target_os = "linux")]
fn apply_recverr(sock: &SockRef<'_>) {
    use std::os::fd::AsRawFd;
    let fd = sock.as_raw_fd();
    let enable: libc::c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_IP,
            libc::IP_RECVERR,
            &enable as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        tracing::warn!(
            error = %std::io::Error::last_os_error(),
            "failed to set IP_RECVERR"
        );
    }
}

#[cfg(not(target_os = "linux"))]
fn apply_recverr(_sock: &SockRef<'_>) {
    tracing::debug!("IpReceiveErrors requested but IP_RECVERR is Linux-only; ignoring");
}
