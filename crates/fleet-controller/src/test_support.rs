//! Test-only helpers shared across engine unit tests.

#![cfg(test)]

/// A self-contained peer connection over a Unix socketpair, good enough to
/// exercise engine bookkeeping without a real bus daemon or a real agent
/// on the other end. Both halves of the pair complete the handshake; only
/// the client half is returned, the server half is kept alive for the
/// duration of the test on a background task.
pub async fn dummy_connection() -> zbus::Connection {
    let (a, b) = tokio::net::UnixStream::pair().expect("create socketpair");

    let server = tokio::spawn(async move {
        zbus::connection::Builder::socket(b)
            .server(zbus::Guid::generate())
            .expect("server builder accepts generated guid")
            .p2p()
            .auth_mechanisms(&[zbus::AuthMechanism::Anonymous])
            .build()
            .await
            .expect("build server half of peer connection")
    });

    let client = zbus::connection::Builder::socket(a)
        .p2p()
        .auth_mechanisms(&[zbus::AuthMechanism::Anonymous])
        .build()
        .await
        .expect("build client half of peer connection");

    let server_conn = server.await.expect("server task panicked");
    std::mem::forget(server_conn);

    client
}
