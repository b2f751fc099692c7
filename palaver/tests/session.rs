//! Drives a complete client-to-server session in process: header
//! exchange, SCRAM authentication, stream restart, resource binding,
//! message echo and routed delivery, then an orderly close.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Error;
use futures::future::BoxFuture;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tokio::time::timeout;

use palaver_backend::store::MemoryUserStore;
use palaver_core::xml::Element;
use palaver_core::xml::stream_codec::DEFAULT_MAX_STANZA_SIZE;
use palaver_core::xmpp::part::{ElemHandler, PartContext};
use palaver_core::xmpp::stream::Connection;
use palaver_inbound::bind::BindFeature;
use palaver_inbound::sasl::{self, Mechanism, SaslFeature};
use palaver_inbound::{ServerFeature, ServerPart};
use palaver_outbound::bind::ClientBindFeature;
use palaver_outbound::sasl::{ClientSaslFeature, ToAuth};
use palaver_outbound::{ClientFeature, ClientPart};
use palaver_services::echo::{EchoHandler, MessageRouter};
use palaver_services::router::RouterHandle;

/// Test-side application handler: hands every received message to the
/// test body.
struct CollectMessages {
    tx: mpsc::UnboundedSender<Element>,
}

impl<C: Connection> ElemHandler<C> for CollectMessages {
    fn id(&self) -> &str {
        "collect-messages"
    }

    fn matches(&self, element: &Element) -> bool {
        element.is_named("message")
    }

    fn handle<'a, 'c: 'a>(
        &'a mut self,
        element: &'a Element,
        _ctx: &'a mut PartContext<'c, C>,
    ) -> BoxFuture<'a, Result<(), Error>> {
        let _ = self.tx.send(element.clone());
        Box::pin(async { Ok(()) })
    }
}

fn message(to: Option<&str>, body: &str) -> Element {
    let mut message = Element::new("message", None);
    if let Some(to) = to {
        message.set_attribute("to", None, to);
    }
    message.with_child("body", None, |b| b.add_text(body));
    message
}

#[tokio::test]
async fn scram_bind_echo_and_routing_end_to_end() {
    let (server_io, client_io) = tokio::io::duplex(32 * 1024);

    let store = MemoryUserStore::new();
    store.add_user("test", "123456", 1024);
    let store = Arc::new(store);
    let router = RouterHandle::new();

    let mut server: ServerPart<DuplexStream> =
        ServerPart::new(server_io, "x.im", DEFAULT_MAX_STANZA_SIZE)
            .with_close_grace(Duration::ZERO);
    let mut server_sasl = SaslFeature::new(Arc::new(router.clone()));
    server_sasl.support(sasl::PLAIN, Mechanism::plain(store.clone()));
    server_sasl.support(
        sasl::SCRAM_SHA_256,
        Mechanism::scram_sha256(store.clone(), false),
    );
    server.with_feature(ServerFeature::Sasl(server_sasl));
    server.with_feature(ServerFeature::Bind(BindFeature::new(
        Arc::new(router.clone()),
        false,
    )));
    server.with_elem_handler(Box::new(MessageRouter::new(router.clone())));
    server.with_elem_handler(Box::new(EchoHandler));

    let server_task = tokio::spawn(async move { server.run().await });

    let mut client: ClientPart<DuplexStream> = ClientPart::new(
        client_io,
        "test@x.im".parse().unwrap(),
        DEFAULT_MAX_STANZA_SIZE,
    );
    let mut client_sasl = ClientSaslFeature::new();
    client_sasl.support(
        sasl::SCRAM_SHA_256,
        ToAuth::scram_sha256("test", "123456", false),
    );
    client.with_feature(ClientFeature::Sasl(client_sasl));
    client.with_feature(ClientFeature::Bind(ClientBindFeature::new(Some("laptop"))));

    let (collected_tx, mut collected_rx) = mpsc::unbounded_channel();
    client.with_elem_handler(Box::new(CollectMessages { tx: collected_tx }));

    let session = client.session_handle();
    let stop = client.stop_handle();
    let client_task = tokio::spawn(async move {
        let result = client.run().await;
        result.map(|()| client)
    });

    // An unaddressed message falls through to the echo handler.
    session.send(message(None, "echo me")).await.unwrap();
    let echoed = timeout(Duration::from_secs(5), collected_rx.recv())
        .await
        .expect("timed out waiting for the echo")
        .expect("client stream ended early");
    assert_eq!(echoed.find_child_named("body").unwrap().text(), "echo me");
    assert_eq!(echoed.attribute("to", None), Some("test@x.im/laptop"));
    assert_eq!(echoed.attribute("from", None), Some("x.im"));

    // An addressed message goes through the router to the bound session,
    // which is ourselves.
    session
        .send(message(Some("test@x.im/laptop"), "route me"))
        .await
        .unwrap();
    let routed = timeout(Duration::from_secs(5), collected_rx.recv())
        .await
        .expect("timed out waiting for the routed message")
        .expect("client stream ended early");
    assert_eq!(routed.find_child_named("body").unwrap().text(), "route me");

    stop.stop();
    let client = timeout(Duration::from_secs(5), client_task)
        .await
        .expect("client did not stop")
        .unwrap()
        .expect("client stream failed");
    assert_eq!(
        client.attr().jid.as_ref().unwrap().to_string(),
        "test@x.im/laptop"
    );

    let server_result = timeout(Duration::from_secs(5), server_task)
        .await
        .expect("server did not stop")
        .unwrap();
    server_result.expect("server stream failed");
}

#[tokio::test]
async fn compression_negotiates_and_carries_stanzas() {
    use palaver_core::compress::CompressionMethod;
    use palaver_inbound::compress::CompressFeature;
    use palaver_inbound::connection::TcpConnection;
    use palaver_outbound::compress::ClientCompressFeature;
    use palaver_outbound::connection::ClientConnection;

    let (server_io, client_io) = tokio::io::duplex(32 * 1024);

    let store = MemoryUserStore::new();
    store.add_user("test", "123456", 1024);
    let store = Arc::new(store);
    let router = RouterHandle::new();

    let mut server: ServerPart<TcpConnection<DuplexStream>> = ServerPart::new(
        TcpConnection::new(server_io, None),
        "x.im",
        DEFAULT_MAX_STANZA_SIZE,
    )
    .with_close_grace(Duration::ZERO);
    let mut server_sasl = SaslFeature::new(Arc::new(router.clone()));
    server_sasl.support(sasl::PLAIN, Mechanism::plain(store.clone()));
    server.with_feature(ServerFeature::Sasl(server_sasl));
    let mut server_compress = CompressFeature::new();
    server_compress.support("zlib", CompressionMethod::Zlib);
    server.with_feature(ServerFeature::Compress(server_compress));
    server.with_elem_handler(Box::new(EchoHandler));

    let server_task = tokio::spawn(async move { server.run().await });

    let mut client: ClientPart<ClientConnection<DuplexStream>> = ClientPart::new(
        ClientConnection::new(client_io, None),
        "test@x.im".parse().unwrap(),
        DEFAULT_MAX_STANZA_SIZE,
    );
    let mut client_sasl = ClientSaslFeature::new();
    client_sasl.support(sasl::PLAIN, ToAuth::plain("test", "123456"));
    client.with_feature(ClientFeature::Sasl(client_sasl));
    let mut client_compress = ClientCompressFeature::new();
    client_compress.support("zlib", CompressionMethod::Zlib);
    client.with_feature(ClientFeature::Compress(client_compress));

    let (collected_tx, mut collected_rx) = mpsc::unbounded_channel();
    client.with_elem_handler(Box::new(CollectMessages { tx: collected_tx }));

    let session = client.session_handle();
    let stop = client.stop_handle();
    let client_task = tokio::spawn(async move { client.run().await });

    // By the time this message goes out, the stream has restarted onto the
    // zlib filter; the echo proves stanzas survive the compressed leg in
    // both directions.
    session.send(message(None, "over zlib")).await.unwrap();
    let echoed = timeout(Duration::from_secs(5), collected_rx.recv())
        .await
        .expect("timed out waiting for the compressed echo")
        .expect("client stream ended early");
    assert_eq!(echoed.find_child_named("body").unwrap().text(), "over zlib");

    stop.stop();
    timeout(Duration::from_secs(5), client_task)
        .await
        .expect("client did not stop")
        .unwrap()
        .expect("client stream failed");
    timeout(Duration::from_secs(5), server_task)
        .await
        .expect("server did not stop")
        .unwrap()
        .expect("server stream failed");
}

#[tokio::test]
async fn wrong_password_fails_scram() {
    let (server_io, client_io) = tokio::io::duplex(32 * 1024);

    let store = MemoryUserStore::new();
    store.add_user("test", "123456", 1024);
    let store = Arc::new(store);
    let router = RouterHandle::new();

    let mut server: ServerPart<DuplexStream> =
        ServerPart::new(server_io, "x.im", DEFAULT_MAX_STANZA_SIZE)
            .with_close_grace(Duration::ZERO);
    let mut server_sasl = SaslFeature::new(Arc::new(router.clone()));
    server_sasl.support(
        sasl::SCRAM_SHA_1,
        Mechanism::scram_sha1(store.clone(), false),
    );
    server.with_feature(ServerFeature::Sasl(server_sasl));
    let server_task = tokio::spawn(async move { server.run().await });

    let mut client: ClientPart<DuplexStream> = ClientPart::new(
        client_io,
        "test@x.im".parse().unwrap(),
        DEFAULT_MAX_STANZA_SIZE,
    );
    let mut client_sasl = ClientSaslFeature::new();
    client_sasl.support(
        sasl::SCRAM_SHA_1,
        ToAuth::scram_sha1("test", "654321", false),
    );
    client.with_feature(ClientFeature::Sasl(client_sasl));

    let client_task = tokio::spawn(async move { client.run().await });

    let client_result = timeout(Duration::from_secs(5), client_task)
        .await
        .expect("client did not finish")
        .unwrap();
    assert!(client_result.is_err(), "client accepted a bad password");

    let server_result = timeout(Duration::from_secs(5), server_task)
        .await
        .expect("server did not finish")
        .unwrap();
    assert!(server_result.is_err(), "server accepted a bad password");
}
